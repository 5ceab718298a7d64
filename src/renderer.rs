//! Device-wide state shared by every context.

use std::sync::Arc;

use crate::backend::{DeferredDestructor, GarbageObject, ResourceUse, Serial, SyncDevice};
use crate::config::RendererConfig;
use crate::error::{SyncError, SyncResult};
use crate::scheduler::{AsyncSubmission, CommandQueue, DirectSubmission, SubmissionBackend};

/// Owns the device queue, the submission backend and the garbage list.
pub struct Renderer {
    config: RendererConfig,
    device: Arc<dyn SyncDevice>,
    queue: Arc<CommandQueue>,
    submission: Box<dyn SubmissionBackend>,
    garbage: DeferredDestructor,
}

impl Renderer {
    pub fn new(device: Arc<dyn SyncDevice>, config: RendererConfig) -> SyncResult<Self> {
        let queue = Arc::new(CommandQueue::new(Arc::clone(&device)));

        let submission: Box<dyn SubmissionBackend> = if config.async_command_processing {
            Box::new(AsyncSubmission::new(
                Arc::clone(&queue),
                &config.worker_thread_name,
            )?)
        } else {
            Box::new(DirectSubmission::new(Arc::clone(&queue)))
        };

        log::info!(
            "Renderer created on {} ({} submission)",
            device.name(),
            if submission.is_async() { "async" } else { "direct" }
        );

        Ok(Self {
            config,
            device,
            queue,
            submission,
            garbage: DeferredDestructor::new(),
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &dyn SyncDevice {
        self.device.as_ref()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn submission(&self) -> &dyn SubmissionBackend {
        self.submission.as_ref()
    }

    pub fn is_async(&self) -> bool {
        self.submission.is_async()
    }

    /// Block until the submission worker has handed everything to the queue.
    ///
    /// Does nothing with direct submission.
    pub fn wait_for_worker_idle(&self) -> SyncResult<()> {
        if self.is_async() {
            self.submission.drain()?;
        }
        Ok(())
    }

    /// Destroy `objects` once every submission recorded in `resource_use` completes.
    pub fn collect_garbage(&self, resource_use: &ResourceUse, objects: Vec<GarbageObject>) {
        self.collect_garbage_at(resource_use.serial(), objects);
    }

    pub fn collect_garbage_at(&self, serial: Serial, objects: Vec<GarbageObject>) {
        self.garbage.collect(serial, objects);
    }

    /// Retire finished submissions and destroy garbage they no longer use.
    pub fn cleanup_garbage(&self) -> SyncResult<usize> {
        let completed = self.queue.check_completed()?;
        Ok(self.garbage.cleanup(completed, self.device()))
    }

    pub fn pending_garbage(&self) -> usize {
        self.garbage.pending_count()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.submission.drain() {
            log::error!("Submission worker failed before shutdown: {}", e);
        }
        if let Err(e) = self.device.wait_idle() {
            log::error!("{}", SyncError::device("vkDeviceWaitIdle")(e));
        }
        if let Err(e) = self.queue.check_completed() {
            log::error!("Failed to retire submissions at shutdown: {}", e);
        }
        let destroyed = self.garbage.flush_all(self.device());
        log::debug!("Renderer destroyed ({} deferred objects flushed)", destroyed);
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("device", &self.device.name())
            .field("queue", &self.queue)
            .field("async", &self.is_async())
            .field("garbage", &self.garbage)
            .finish()
    }
}
