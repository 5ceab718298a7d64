//! Core device abstraction trait
//!
//! This trait is the seam between the sync core and the native queue API.
//! Both the Vulkan device and the simulated device implement it.

use crate::backend::types::*;
use ash::prelude::VkResult;
use ash::vk;
use std::os::fd::OwnedFd;

/// Native primitives the sync core is built on.
///
/// Status and wait queries return the raw [`vk::Result`] so callers decide
/// which codes are expected for the primitive they hold. Creation, export and
/// import return [`VkResult`].
pub trait SyncDevice: Send + Sync {
    /// Human readable device name, for logs.
    fn name(&self) -> &str;

    fn create_event(&self) -> VkResult<vk::Event>;
    fn destroy_event(&self, event: vk::Event);
    /// `EVENT_SET`, `EVENT_RESET` or an error code.
    fn event_status(&self, event: vk::Event) -> vk::Result;

    fn create_fence(&self, kind: FenceKind) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// `SUCCESS`, `NOT_READY` or an error code.
    fn fence_status(&self, fence: vk::Fence) -> vk::Result;
    /// `SUCCESS`, `TIMEOUT` or an error code.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> vk::Result;

    /// Exports the fence payload as a new sync file descriptor owned by the caller.
    fn export_fence_fd(&self, fence: vk::Fence) -> VkResult<OwnedFd>;
    /// Temporarily imports a sync file into the fence.
    ///
    /// Ownership of `fd` moves to the implementation whether or not the import
    /// succeeds; on failure the implementation closes it.
    fn import_fence_fd(&self, fence: vk::Fence, fd: OwnedFd) -> VkResult<()>;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Temporarily imports a sync file into the semaphore. Same ownership rules
    /// as [`import_fence_fd`](Self::import_fence_fd).
    fn import_semaphore_fd(&self, semaphore: vk::Semaphore, fd: OwnedFd) -> VkResult<()>;

    /// Submits a batch, signaling `fence` (may be null) when it completes.
    fn queue_submit(
        &self,
        priority: QueuePriority,
        batch: &SubmitBatch,
        fence: vk::Fence,
    ) -> VkResult<()>;

    /// Blocks until all submitted work that can complete has completed.
    fn wait_idle(&self) -> VkResult<()>;
}
