//! Common utilities for sync integration tests.
//!
//! Every test runs against the simulated device, once per submission model.

use std::sync::Arc;

use ash::vk::{self, Handle};
use vk_fence_sync::backend::dummy::SimulatedDevice;
use vk_fence_sync::{Context, Renderer, RendererConfig};

// ============================================================================
// Submission Models
// ============================================================================

/// Submission models a renderer can run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    /// Submit on the calling thread.
    Direct,
    /// Submit from the worker thread.
    Async,
}

impl SubmissionMode {
    pub fn config(self) -> RendererConfig {
        RendererConfig::default()
            .with_async_command_processing(self == SubmissionMode::Async)
            .with_worker_thread_name("test-submit")
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// A simulated device and a renderer on top of it.
pub struct TestContext {
    #[allow(dead_code)]
    pub mode: SubmissionMode,
    pub device: Arc<SimulatedDevice>,
    pub renderer: Arc<Renderer>,
}

impl TestContext {
    /// Device that executes work as soon as it is submitted.
    pub fn new(mode: SubmissionMode) -> Self {
        Self::with_device(mode, SimulatedDevice::new())
    }

    /// Device that executes work only in [`settle`](Self::settle).
    #[allow(dead_code)]
    pub fn manual(mode: SubmissionMode) -> Self {
        Self::with_device(mode, SimulatedDevice::manual())
    }

    fn with_device(mode: SubmissionMode, device: SimulatedDevice) -> Self {
        init_logging();
        let device = Arc::new(device);
        let renderer = Renderer::new(device.clone(), mode.config())
            .expect("Failed to create renderer");
        Self {
            mode,
            device,
            renderer: Arc::new(renderer),
        }
    }

    pub fn context(&self) -> Context {
        Context::new(Arc::clone(&self.renderer))
    }

    /// Let the worker hand everything to the queue, then run what can run.
    #[allow(dead_code)]
    pub fn settle(&self) {
        self.renderer
            .wait_for_worker_idle()
            .expect("Submission worker failed");
        self.device.process();
    }

    /// Retire finished work and destroy garbage it no longer uses.
    #[allow(dead_code)]
    pub fn cleanup(&self) -> usize {
        self.renderer
            .cleanup_garbage()
            .expect("Failed to clean up garbage")
    }

    /// Values written by fill commands, in device execution order.
    #[allow(dead_code)]
    pub fn written_values(&self) -> Vec<u32> {
        self.device.writes().into_iter().map(|(_, v)| v).collect()
    }
}

/// A buffer handle for fill commands. The simulated device never dereferences it.
#[allow(dead_code)]
pub fn buffer(id: u64) -> vk::Buffer {
    vk::Buffer::from_raw(id)
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One second, in the nanoseconds the wait calls take.
#[allow(dead_code)]
pub const ONE_SECOND_NS: u64 = 1_000_000_000;
