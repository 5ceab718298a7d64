//! Event-backed fence sync.

use std::sync::Arc;

use ash::vk;

use super::SyncHelper;
use crate::backend::{GarbageObject, ResourceUse, Serial};
use crate::context::Context;
use crate::error::{SyncError, SyncResult};
use crate::renderer::Renderer;

/// Fence sync implemented with a `VkEvent` and the serial of the submission that sets it.
#[derive(Debug, Default)]
pub struct EventSync {
    event: Option<vk::Event>,
    serial: Serial,
    resource_use: ResourceUse,
}

impl EventSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.event.is_some()
    }

    /// Serial of the submission that sets the event.
    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Record the event set at the end of `context`'s command stream.
    ///
    /// The event is set when the context's next submission finishes on the device.
    pub fn initialize(&mut self, context: &mut Context) -> SyncResult<()> {
        assert!(self.event.is_none(), "sync object initialized twice");

        let renderer = Arc::clone(context.renderer());
        // Make sure no earlier submission is still being handed to the queue.
        renderer.wait_for_worker_idle()?;

        let event = renderer
            .device()
            .create_event()
            .map_err(SyncError::device("vkCreateEvent"))?;

        self.serial = context.next_submit_serial();
        context
            .outside_render_pass_commands()
            .set_event(event, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
        context.retain(&self.resource_use);
        context.on_sync_initialize();
        self.event = Some(event);

        log::debug!("Event sync {:?} set by {}", event, self.serial);
        Ok(())
    }

    fn event(&self) -> vk::Event {
        self.event.expect("sync object used before initialize()")
    }
}

impl SyncHelper for EventSync {
    fn client_wait(
        &self,
        renderer: &Renderer,
        context: Option<&mut Context>,
        flush_commands: bool,
        timeout_ns: u64,
    ) -> SyncResult<vk::Result> {
        if self.get_status(renderer)? {
            return Ok(vk::Result::EVENT_SET);
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

        let result = renderer.queue().wait_for_serial(self.serial, timeout_ns)?;
        log::trace!("Event sync wait on {}: {:?}", self.serial, result);
        Ok(result)
    }

    fn server_wait(&self, context: &mut Context) -> SyncResult<()> {
        let event = self.event();
        context.outside_render_pass_commands().wait_events(
            &[event],
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        );
        context.retain(&self.resource_use);
        Ok(())
    }

    fn get_status(&self, renderer: &Renderer) -> SyncResult<bool> {
        match renderer.device().event_status(self.event()) {
            vk::Result::EVENT_SET => Ok(true),
            vk::Result::EVENT_RESET => Ok(false),
            result => Err(SyncError::Device {
                operation: "vkGetEventStatus",
                result,
            }),
        }
    }

    fn release(&mut self, renderer: &Renderer) {
        if let Some(event) = self.event.take() {
            renderer.collect_garbage(&self.resource_use, vec![GarbageObject::Event(event)]);
            // TODO: drop this once the worker can report when a given serial has been submitted.
            if let Err(e) = renderer.wait_for_worker_idle() {
                log::error!("Submission worker failed while releasing event sync: {}", e);
            }
        }
    }
}

impl Drop for EventSync {
    fn drop(&mut self) {
        if let Some(event) = self.event {
            log::warn!("Event sync {:?} dropped without release(), leaking it", event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{SimulatedDevice, SimulatedOp};
    use crate::config::RendererConfig;

    fn setup() -> (Arc<SimulatedDevice>, Context) {
        let device = Arc::new(SimulatedDevice::manual());
        let renderer = Renderer::new(device.clone(), RendererConfig::default()).unwrap();
        (device, Context::new(Arc::new(renderer)))
    }

    #[test]
    fn test_event_set_after_submission_completes() {
        let (device, mut ctx) = setup();
        let renderer = Arc::clone(ctx.renderer());
        let mut sync = EventSync::new();
        sync.initialize(&mut ctx).unwrap();
        assert!(ctx.has_pending_sync_flush());
        assert!(!sync.get_status(&renderer).unwrap());

        ctx.flush().unwrap();
        assert!(!sync.get_status(&renderer).unwrap());
        device.process();
        assert!(sync.get_status(&renderer).unwrap());

        sync.release(&renderer);
    }

    #[test]
    fn test_create_event_failure() {
        let (device, mut ctx) = setup();
        device.inject_failure(SimulatedOp::CreateEvent, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let mut sync = EventSync::new();
        let err = sync.initialize(&mut ctx).unwrap_err();
        assert_eq!(err.device_result(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert!(!sync.is_initialized());
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn test_double_initialize_panics() {
        let (_device, mut ctx) = setup();
        let mut sync = EventSync::new();
        sync.initialize(&mut ctx).unwrap();
        let _ = sync.initialize(&mut ctx);
    }
}
