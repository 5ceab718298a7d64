//! Device abstraction layer
//!
//! Provides the trait and types that both the Vulkan device and the simulated
//! device implement, plus deferred destruction of the objects they create.

pub mod deferred;
pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "native")]
pub mod vulkan;

pub use deferred::{DeferredDestructor, GarbageObject, ResourceUse};
pub use traits::*;
pub use types::*;
