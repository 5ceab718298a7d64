//! Fence sync objects.
//!
//! Two flavors implement [`SyncHelper`]:
//!
//! - [`EventSync`] sets a `VkEvent` at the end of a context's command stream
//!   and remembers the serial of the submission carrying it.
//! - [`NativeFenceSync`] holds an exportable `VkFence` backed by a sync file
//!   descriptor that can cross API and process boundaries.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──initialize──▶ ready ──release──▶ garbage ──(serial completes)──▶ destroyed
//!                         │
//!                         ├─ client_wait / get_status   (any number of times)
//!                         └─ server_wait / dup fd
//! ```
//!
//! Initializing twice, or waiting before initializing, is a programming error
//! and panics. Operations that need a resource the object never got return
//! [`SyncError::NotSupported`](crate::SyncError::NotSupported).
//!
//! # Wait results
//!
//! `client_wait` returns the raw status of the primitive that satisfied it:
//!
//! | Flavor | Already signaled | Signaled while waiting | Timed out |
//! |--------|------------------|------------------------|-----------|
//! | event  | `EVENT_SET`      | `SUCCESS`              | `TIMEOUT` |
//! | fence  | `SUCCESS`        | `SUCCESS`              | `TIMEOUT` |

mod event;
mod native_fence;

pub use event::EventSync;
pub use native_fence::NativeFenceSync;

use std::os::fd::OwnedFd;

use ash::vk;

use crate::context::Context;
use crate::error::{SyncError, SyncResult};
use crate::renderer::Renderer;

/// Operations shared by both sync flavors.
///
/// Callers must not use one object from several threads at once.
pub trait SyncHelper: Send {
    /// Block until the sync object signals or `timeout_ns` elapses.
    ///
    /// Returns immediately with the "already signaled" status if the object
    /// has signaled, and with `TIMEOUT` if `timeout_ns` is zero. When
    /// `flush_commands` is set and a context is given, its pending commands
    /// are submitted before waiting.
    fn client_wait(
        &self,
        renderer: &Renderer,
        context: Option<&mut Context>,
        flush_commands: bool,
        timeout_ns: u64,
    ) -> SyncResult<vk::Result>;

    /// Make work submitted later on `context` wait for the sync object on the device.
    ///
    /// Never blocks the calling thread.
    fn server_wait(&self, context: &mut Context) -> SyncResult<()>;

    /// Whether the sync object has signaled. Never blocks.
    fn get_status(&self, renderer: &Renderer) -> SyncResult<bool>;

    /// Hand the native objects to deferred destruction.
    fn release(&mut self, renderer: &Renderer);

    /// A new descriptor for the sync file backing this object, owned by the caller.
    fn dup_native_fence_fd(&self) -> SyncResult<OwnedFd> {
        Err(SyncError::NotSupported("sync object has no native fence"))
    }
}
