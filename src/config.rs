//! Renderer configuration.

use crate::backend::QueuePriority;

/// Configuration for creating a [`Renderer`](crate::Renderer)
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Submit from a worker thread instead of the calling thread
    pub async_command_processing: bool,
    /// Name of the submission worker thread
    pub worker_thread_name: String,
    /// Priority used by contexts that do not ask for one
    pub default_priority: QueuePriority,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            async_command_processing: false,
            worker_thread_name: "vk-submit".to_string(),
            default_priority: QueuePriority::Medium,
        }
    }
}

impl RendererConfig {
    pub fn with_async_command_processing(mut self, enabled: bool) -> Self {
        self.async_command_processing = enabled;
        self
    }

    pub fn with_worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    pub fn with_default_priority(mut self, priority: QueuePriority) -> Self {
        self.default_priority = priority;
        self
    }
}
