//! Queue submission.
//!
//! Contexts never talk to the device queue directly. They hand finished
//! batches to a [`SubmissionBackend`], which either submits on the calling
//! thread ([`DirectSubmission`]) or forwards the work to a dedicated worker
//! thread ([`AsyncSubmission`]).
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`CommandQueue`] | Serial reservation, per-submission fences, completion tracking |
//! | [`DirectSubmission`] | Submits synchronously |
//! | [`AsyncSubmission`] | Submits from a worker; `drain` waits for it to catch up |
//!
//! With the async backend a submission call returns before the device has
//! seen the work. Anything that needs a native object to reflect submitted
//! work (a fence to export, a serial to wait on) must drain first.

mod queue;
mod worker;

pub use queue::CommandQueue;
pub use worker::AsyncSubmission;

use std::sync::Arc;

use ash::vk;

use crate::backend::{QueuePriority, Serial, SubmitBatch};
use crate::error::SyncResult;

/// Where finished command batches go.
pub trait SubmissionBackend: Send + Sync {
    /// Whether submissions complete on another thread.
    fn is_async(&self) -> bool;

    /// Submit a batch under a serial reserved from the [`CommandQueue`].
    ///
    /// On failure the serial is abandoned.
    fn submit_commands(
        &self,
        priority: QueuePriority,
        serial: Serial,
        batch: SubmitBatch,
    ) -> SyncResult<()>;

    /// Submit an empty batch that signals `fence` after all earlier work.
    fn submit_marker(&self, priority: QueuePriority, fence: vk::Fence) -> SyncResult<()>;

    /// Block until every submission made so far has reached the device queue.
    ///
    /// Returns the first error the worker hit since the last check.
    fn drain(&self) -> SyncResult<()>;
}

/// Submits on the calling thread.
#[derive(Debug)]
pub struct DirectSubmission {
    queue: Arc<CommandQueue>,
}

impl DirectSubmission {
    pub fn new(queue: Arc<CommandQueue>) -> Self {
        Self { queue }
    }
}

impl SubmissionBackend for DirectSubmission {
    fn is_async(&self) -> bool {
        false
    }

    fn submit_commands(
        &self,
        priority: QueuePriority,
        serial: Serial,
        batch: SubmitBatch,
    ) -> SyncResult<()> {
        self.queue.submit(priority, serial, &batch)
    }

    fn submit_marker(&self, priority: QueuePriority, fence: vk::Fence) -> SyncResult<()> {
        self.queue.submit_marker(priority, fence)
    }

    fn drain(&self) -> SyncResult<()> {
        Ok(())
    }
}
