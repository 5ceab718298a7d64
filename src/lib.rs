//! # vk-fence-sync
//!
//! GL and EGL fence sync objects implemented on Vulkan.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`EventSync`] - fence sync backed by a `VkEvent` and a submission serial
//! - [`NativeFenceSync`] - fence sync backed by an exportable `VkFence` and a sync file
//! - [`GlSync`] and [`EglSync`] - GL and EGL front ends over the two flavors
//! - [`Renderer`] and [`Context`] - the queue, submission backend and command
//!   stream the sync objects are recorded into
//! - [`SyncDevice`] - the seam to the native API, implemented by
//!   [`VulkanDevice`](backend::vulkan::VulkanDevice) and by
//!   [`SimulatedDevice`](backend::dummy::SimulatedDevice) for testing
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vk_fence_sync::{Context, EventSync, Renderer, RendererConfig, SyncHelper};
//!
//! let renderer = Arc::new(Renderer::new(device, RendererConfig::default())?);
//! let mut context = Context::new(renderer.clone());
//!
//! let mut sync = EventSync::new();
//! sync.initialize(&mut context)?;
//! let result = sync.client_wait(&renderer, Some(&mut context), true, 1_000_000)?;
//! sync.release(&renderer);
//! ```

#[cfg(not(unix))]
compile_error!("sync file interop requires a unix target");

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod renderer;
pub mod scheduler;
pub mod sync;

pub use backend::{QueuePriority, Serial, SyncDevice};
pub use config::RendererConfig;
pub use context::{CommandStream, Context};
pub use error::{SyncError, SyncResult};
pub use facade::{EglSync, GlSync};
pub use renderer::Renderer;
pub use sync::{EventSync, NativeFenceSync, SyncHelper};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library.
///
/// Only logs the version; every object is created explicitly.
pub fn init() {
    log::info!("vk-fence-sync v{} initialized", VERSION);
}
