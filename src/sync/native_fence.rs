//! Sync file backed fence sync.
//!
//! Importing a sync file into a fence or semaphore hands the descriptor to the
//! driver, after which it cannot be read back. The object therefore keeps its
//! own duplicate of the descriptor and only ever imports further duplicates of
//! it. The retained duplicate is closed when the object is dropped.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use ash::vk;

use super::SyncHelper;
use crate::backend::{FenceKind, GarbageObject, ResourceUse, SyncDevice};
use crate::context::Context;
use crate::error::{SyncError, SyncResult};
use crate::renderer::Renderer;

/// The descriptor this object keeps for itself.
#[derive(Debug, Default)]
enum RetainedFd {
    #[default]
    Absent,
    Owned(OwnedFd),
}

/// Destroys a freshly created native object unless it is handed off.
struct Scoped<'a, T: Copy> {
    device: &'a dyn SyncDevice,
    handle: Option<T>,
    destroy: fn(&dyn SyncDevice, T),
}

impl<'a, T: Copy> Scoped<'a, T> {
    fn new(device: &'a dyn SyncDevice, handle: T, destroy: fn(&dyn SyncDevice, T)) -> Self {
        Self {
            device,
            handle: Some(handle),
            destroy,
        }
    }

    fn get(&self) -> T {
        self.handle.expect("scoped handle already released")
    }

    fn release(mut self) -> T {
        self.handle.take().expect("scoped handle already released")
    }
}

impl<T: Copy> Drop for Scoped<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            (self.destroy)(self.device, handle);
        }
    }
}

/// Fence sync implemented with an exportable `VkFence` and a sync file.
#[derive(Debug, Default)]
pub struct NativeFenceSync {
    initialized: bool,
    fence: Option<vk::Fence>,
    retained_fd: RetainedFd,
    resource_use: ResourceUse,
}

impl NativeFenceSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Back the object with a sync file.
    ///
    /// With `Some(fd)` the object takes ownership of `fd` and will signal when
    /// it does. With `None` a marker is submitted after all work flushed from
    /// `context` so far and the object signals once the device reaches it.
    pub fn initialize_with_fd(
        &mut self,
        context: &mut Context,
        fd: Option<OwnedFd>,
    ) -> SyncResult<()> {
        assert!(!self.initialized, "sync object initialized twice");
        self.initialized = true;

        let renderer = Arc::clone(context.renderer());
        let device = renderer.device();

        let fence = device
            .create_fence(FenceKind::Exportable)
            .map_err(SyncError::device("vkCreateFence"))?;
        let fence = Scoped::new(device, fence, |device, fence| device.destroy_fence(fence));

        let fd = match fd {
            Some(fd) => fd,
            None => {
                context.flush()?;
                renderer
                    .submission()
                    .submit_marker(context.priority(), fence.get())?;
                // The marker has to be on the queue before the payload can be exported.
                renderer.wait_for_worker_idle()?;
                device
                    .export_fence_fd(fence.get())
                    .map_err(SyncError::device("vkGetFenceFdKHR"))?
            }
        };

        let retained = fd.try_clone()?;
        device
            .import_fence_fd(fence.get(), fd)
            .map_err(SyncError::device("vkImportFenceFdKHR"))?;

        let fence = fence.release();
        self.fence = Some(fence);
        self.retained_fd = RetainedFd::Owned(retained);
        context.retain(&self.resource_use);

        log::debug!("Native fence sync {:?} initialized", fence);
        Ok(())
    }

    fn fence(&self) -> vk::Fence {
        assert!(self.initialized, "sync object used before initialize_with_fd()");
        self.fence.expect("native fence sync has no fence")
    }
}

impl SyncHelper for NativeFenceSync {
    fn client_wait(
        &self,
        renderer: &Renderer,
        context: Option<&mut Context>,
        flush_commands: bool,
        timeout_ns: u64,
    ) -> SyncResult<vk::Result> {
        let fence = self.fence();
        if self.get_status(renderer)? {
            return Ok(vk::Result::SUCCESS);
        }
        if timeout_ns == 0 {
            return Ok(vk::Result::TIMEOUT);
        }

        if flush_commands {
            if let Some(context) = context {
                context.flush()?;
            }
        }
        renderer.wait_for_worker_idle()?;

        match renderer.device().wait_for_fence(fence, timeout_ns) {
            result @ (vk::Result::SUCCESS | vk::Result::TIMEOUT) => Ok(result),
            result => Err(SyncError::Device {
                operation: "vkWaitForFences",
                result,
            }),
        }
    }

    fn server_wait(&self, context: &mut Context) -> SyncResult<()> {
        let fd = match (&self.fence, &self.retained_fd) {
            (Some(_), RetainedFd::Owned(fd)) => fd.try_clone()?,
            _ => return Err(SyncError::NotSupported("server wait without a native fence")),
        };

        let renderer = Arc::clone(context.renderer());
        let device = renderer.device();

        let semaphore = device
            .create_semaphore()
            .map_err(SyncError::device("vkCreateSemaphore"))?;
        let semaphore = Scoped::new(device, semaphore, |device, semaphore| {
            device.destroy_semaphore(semaphore)
        });
        device
            .import_semaphore_fd(semaphore.get(), fd)
            .map_err(SyncError::device("vkImportSemaphoreFdKHR"))?;

        // Work recorded so far must not wait on the semaphore.
        context.flush()?;

        let semaphore = semaphore.release();
        context.add_wait_semaphore(semaphore, vk::PipelineStageFlags::ALL_COMMANDS);
        context.add_garbage(GarbageObject::Semaphore(semaphore));
        Ok(())
    }

    fn get_status(&self, renderer: &Renderer) -> SyncResult<bool> {
        match renderer.device().fence_status(self.fence()) {
            vk::Result::SUCCESS => Ok(true),
            vk::Result::NOT_READY => Ok(false),
            result => Err(SyncError::Device {
                operation: "vkGetFenceStatus",
                result,
            }),
        }
    }

    fn release(&mut self, renderer: &Renderer) {
        if let Some(fence) = self.fence.take() {
            renderer.collect_garbage(&self.resource_use, vec![GarbageObject::Fence(fence)]);
        }
    }

    fn dup_native_fence_fd(&self) -> SyncResult<OwnedFd> {
        match (&self.fence, &self.retained_fd) {
            (Some(_), RetainedFd::Owned(fd)) => Ok(fd.try_clone()?),
            _ => Err(SyncError::NotSupported("sync object has no native fence descriptor")),
        }
    }
}

impl Drop for NativeFenceSync {
    fn drop(&mut self) {
        if let Some(fence) = self.fence {
            log::warn!("Native fence sync {:?} dropped without release(), leaking it", fence);
        }
    }
}
