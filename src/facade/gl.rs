//! GL fence sync (`glFenceSync` and friends).

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::context::Context;
use crate::error::SyncError;
use crate::sync::{EventSync, SyncHelper};

pub type GLenum = u32;
pub type GLbitfield = u32;
pub type GLint = i32;
pub type GLuint64 = u64;

pub const GL_SYNC_GPU_COMMANDS_COMPLETE: GLenum = 0x9117;
pub const GL_SYNC_FLUSH_COMMANDS_BIT: GLbitfield = 0x0000_0001;
pub const GL_UNSIGNALED: GLint = 0x9118;
pub const GL_SIGNALED: GLint = 0x9119;
pub const GL_ALREADY_SIGNALED: GLenum = 0x911A;
pub const GL_TIMEOUT_EXPIRED: GLenum = 0x911B;
pub const GL_CONDITION_SATISFIED: GLenum = 0x911C;
pub const GL_WAIT_FAILED: GLenum = 0x911D;
pub const GL_TIMEOUT_IGNORED: GLuint64 = u64::MAX;

pub const GL_INVALID_OPERATION: GLenum = 0x0502;
pub const GL_OUT_OF_MEMORY: GLenum = 0x0505;
pub const GL_CONTEXT_LOST: GLenum = 0x0507;

/// A GL error to raise on the current context.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("GL error 0x{code:04X}")]
pub struct GlError {
    pub code: GLenum,
}

impl From<SyncError> for GlError {
    fn from(error: SyncError) -> Self {
        log::debug!("GL sync operation failed: {}", error);
        let code = match error {
            SyncError::Device { result, .. } => match result {
                vk::Result::ERROR_DEVICE_LOST => GL_CONTEXT_LOST,
                vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                    GL_OUT_OF_MEMORY
                }
                _ => GL_INVALID_OPERATION,
            },
            SyncError::NotSupported(_) => GL_INVALID_OPERATION,
            SyncError::Descriptor(_) | SyncError::WorkerSpawn(_) => GL_OUT_OF_MEMORY,
            SyncError::WorkerLost => GL_CONTEXT_LOST,
        };
        Self { code }
    }
}

/// A GL sync object. Always backed by an event.
#[derive(Debug, Default)]
pub struct GlSync {
    sync: EventSync,
}

impl GlSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// `glFenceSync`: insert the fence into `context`'s command stream.
    pub fn set(
        &mut self,
        context: &mut Context,
        condition: GLenum,
        flags: GLbitfield,
    ) -> Result<(), GlError> {
        assert_eq!(condition, GL_SYNC_GPU_COMMANDS_COMPLETE);
        assert_eq!(flags, 0);
        self.sync.initialize(context)?;
        Ok(())
    }

    /// `glClientWaitSync`
    pub fn client_wait(
        &self,
        context: &mut Context,
        flags: GLbitfield,
        timeout: GLuint64,
    ) -> Result<GLenum, GlError> {
        assert_eq!(flags & !GL_SYNC_FLUSH_COMMANDS_BIT, 0);
        let flush = flags & GL_SYNC_FLUSH_COMMANDS_BIT != 0;

        let renderer = Arc::clone(context.renderer());
        let result = self
            .sync
            .client_wait(&renderer, Some(context), flush, timeout)?;

        Ok(match result {
            vk::Result::EVENT_SET => GL_ALREADY_SIGNALED,
            vk::Result::SUCCESS => GL_CONDITION_SATISFIED,
            vk::Result::TIMEOUT => GL_TIMEOUT_EXPIRED,
            other => unreachable!("unexpected client wait result {other:?}"),
        })
    }

    /// `glWaitSync`
    pub fn server_wait(
        &self,
        context: &mut Context,
        flags: GLbitfield,
        timeout: GLuint64,
    ) -> Result<(), GlError> {
        assert_eq!(flags, 0);
        assert_eq!(timeout, GL_TIMEOUT_IGNORED);
        self.sync.server_wait(context)?;
        Ok(())
    }

    /// `glGetSynciv(GL_SYNC_STATUS)`
    pub fn get_status(&self, context: &Context) -> Result<GLint, GlError> {
        let signaled = self.sync.get_status(context.renderer())?;
        Ok(if signaled { GL_SIGNALED } else { GL_UNSIGNALED })
    }

    /// `glDeleteSync`
    pub fn on_destroy(&mut self, context: &Context) {
        self.sync.release(context.renderer());
    }
}
