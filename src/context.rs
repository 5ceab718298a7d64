//! Per-thread recording context.
//!
//! A context records commands into its outside-render-pass command stream and
//! submits them as one batch on [`Context::flush`]. The serial of that batch is
//! reserved the first time something needs to know it, so sync objects created
//! on the context can capture the serial before the batch is submitted.

use std::sync::Arc;

use ash::vk;

use crate::backend::{
    Command, GarbageObject, QueuePriority, ResourceUse, Serial, SubmitBatch, WaitSemaphore,
};
use crate::error::SyncResult;
use crate::renderer::Renderer;

/// Commands recorded outside any render pass.
#[derive(Debug, Default)]
pub struct CommandStream {
    commands: Vec<Command>,
}

impl CommandStream {
    pub fn set_event(&mut self, event: vk::Event, stage: vk::PipelineStageFlags) {
        self.commands.push(Command::SetEvent { event, stage });
    }

    pub fn wait_events(
        &mut self,
        events: &[vk::Event],
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        self.commands.push(Command::WaitEvents {
            events: events.to_vec(),
            src_stage,
            dst_stage,
        });
    }

    pub fn fill_buffer(&mut self, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        self.commands.push(Command::FillBuffer {
            buffer,
            offset,
            size,
            data,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    fn take(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

/// A recording context bound to a [`Renderer`].
pub struct Context {
    renderer: Arc<Renderer>,
    priority: QueuePriority,
    commands: CommandStream,
    wait_semaphores: Vec<WaitSemaphore>,
    garbage: Vec<GarbageObject>,
    next_serial: Option<Serial>,
    sync_pending_flush: bool,
}

impl Context {
    /// Create a context using the renderer's default priority.
    pub fn new(renderer: Arc<Renderer>) -> Self {
        let priority = renderer.config().default_priority;
        Self::with_priority(renderer, priority)
    }

    pub fn with_priority(renderer: Arc<Renderer>, priority: QueuePriority) -> Self {
        Self {
            renderer,
            priority,
            commands: CommandStream::default(),
            wait_semaphores: Vec::new(),
            garbage: Vec::new(),
            next_serial: None,
            sync_pending_flush: false,
        }
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn priority(&self) -> QueuePriority {
        self.priority
    }

    /// Serial the next [`flush`](Self::flush) will submit under.
    pub fn next_submit_serial(&mut self) -> Serial {
        let queue = self.renderer.queue();
        *self.next_serial.get_or_insert_with(|| queue.reserve_serial())
    }

    /// Stream for commands recorded outside any render pass.
    pub fn outside_render_pass_commands(&mut self) -> &mut CommandStream {
        &mut self.commands
    }

    /// Mark an object as used by the next submission of this context.
    pub fn retain(&mut self, resource_use: &ResourceUse) {
        let serial = self.next_submit_serial();
        resource_use.update(serial);
    }

    /// Make the next submission wait on `semaphore` at `stage`.
    pub fn add_wait_semaphore(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push(WaitSemaphore { semaphore, stage });
    }

    /// Destroy `object` once the next submission of this context completes.
    pub fn add_garbage(&mut self, object: GarbageObject) {
        self.garbage.push(object);
    }

    /// Note that a sync object was inserted and needs a flush to reach the queue.
    pub fn on_sync_initialize(&mut self) {
        self.sync_pending_flush = true;
    }

    pub fn has_pending_sync_flush(&self) -> bool {
        self.sync_pending_flush
    }

    fn has_pending_work(&self) -> bool {
        self.next_serial.is_some()
            || !self.commands.is_empty()
            || !self.wait_semaphores.is_empty()
            || !self.garbage.is_empty()
    }

    /// Submit everything recorded so far.
    pub fn flush(&mut self) -> SyncResult<()> {
        if !self.has_pending_work() {
            return Ok(());
        }

        let serial = self.next_submit_serial();
        self.next_serial = None;
        self.sync_pending_flush = false;

        let batch = SubmitBatch {
            commands: self.commands.take(),
            wait_semaphores: std::mem::take(&mut self.wait_semaphores),
        };
        self.renderer
            .collect_garbage_at(serial, std::mem::take(&mut self.garbage));

        log::trace!("Flushing context as {} ({} commands)", serial, batch.commands.len());
        self.renderer
            .submission()
            .submit_commands(self.priority, serial, batch)?;
        self.renderer.cleanup_garbage()?;
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Failed to flush context on destruction: {}", e);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("priority", &self.priority)
            .field("commands", &self.commands.len())
            .field("wait_semaphores", &self.wait_semaphores.len())
            .field("next_serial", &self.next_serial)
            .field("sync_pending_flush", &self.sync_pending_flush)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::SimulatedDevice;
    use crate::config::RendererConfig;
    use ash::vk::Handle;

    fn context() -> (Arc<SimulatedDevice>, Context) {
        let device = Arc::new(SimulatedDevice::new());
        let renderer = Renderer::new(device.clone(), RendererConfig::default()).unwrap();
        (device, Context::new(Arc::new(renderer)))
    }

    #[test]
    fn test_flush_without_work_is_noop() {
        let (device, mut ctx) = context();
        ctx.flush().unwrap();
        assert_eq!(device.submission_count(), 0);
    }

    #[test]
    fn test_flush_submits_under_reserved_serial() {
        let (device, mut ctx) = context();
        let serial = ctx.next_submit_serial();
        ctx.outside_render_pass_commands()
            .fill_buffer(vk::Buffer::from_raw(1), 0, 4, 42);
        ctx.on_sync_initialize();
        assert!(ctx.has_pending_sync_flush());

        ctx.flush().unwrap();
        assert!(!ctx.has_pending_sync_flush());
        assert_eq!(device.writes(), vec![(vk::Buffer::from_raw(1), 42)]);
        assert_eq!(ctx.renderer().queue().last_completed_serial(), serial);
        assert!(ctx.next_submit_serial() > serial);
    }
}
