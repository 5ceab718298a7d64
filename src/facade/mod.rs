//! GL and EGL fence sync front ends.
//!
//! These translate the wait flags, timeouts and status enums of the two APIs
//! onto [`SyncHelper`](crate::sync::SyncHelper) calls and the raw results back.
//! Argument validation is the caller's job; flags a caller should have
//! rejected trip assertions here.

pub mod egl;
pub mod gl;

pub use egl::{AttributeMap, EglError, EglSync};
pub use gl::{GlError, GlSync};
