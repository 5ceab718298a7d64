//! EGL sync (`EGL_KHR_fence_sync`, `EGL_ANDROID_native_fence_sync`).

use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use ash::vk;
use thiserror::Error;

use crate::context::Context;
use crate::error::SyncError;
use crate::renderer::Renderer;
use crate::sync::{EventSync, NativeFenceSync, SyncHelper};

pub type EGLenum = u32;
pub type EGLint = i32;
pub type EGLAttrib = isize;
pub type EGLTimeKHR = u64;

pub const EGL_BAD_ALLOC: EGLint = 0x3003;
pub const EGL_BAD_DISPLAY: EGLint = 0x3008;
pub const EGL_BAD_PARAMETER: EGLint = 0x300C;

pub const EGL_SIGNALED_KHR: EGLint = 0x30F2;
pub const EGL_UNSIGNALED_KHR: EGLint = 0x30F3;
pub const EGL_TIMEOUT_EXPIRED_KHR: EGLint = 0x30F5;
pub const EGL_CONDITION_SATISFIED_KHR: EGLint = 0x30F6;
pub const EGL_SYNC_FENCE_KHR: EGLenum = 0x30F9;
pub const EGL_SYNC_FLUSH_COMMANDS_BIT_KHR: EGLint = 0x0001;
pub const EGL_FOREVER_KHR: EGLTimeKHR = u64::MAX;

pub const EGL_SYNC_NATIVE_FENCE_ANDROID: EGLenum = 0x3144;
pub const EGL_SYNC_NATIVE_FENCE_FD_ANDROID: EGLenum = 0x3145;
pub const EGL_NO_NATIVE_FENCE_FD_ANDROID: EGLint = -1;

/// An EGL error to record on the current thread.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("EGL error 0x{code:04X}")]
pub struct EglError {
    pub code: EGLint,
}

impl EglError {
    fn new(code: EGLint) -> Self {
        Self { code }
    }
}

impl From<SyncError> for EglError {
    fn from(error: SyncError) -> Self {
        log::debug!("EGL sync operation failed: {}", error);
        match error {
            SyncError::NotSupported(_) => Self::new(EGL_BAD_PARAMETER),
            _ => Self::new(EGL_BAD_ALLOC),
        }
    }
}

/// Attributes passed to `eglCreateSync`.
#[derive(Debug, Clone, Default)]
pub struct AttributeMap {
    values: HashMap<EGLenum, EGLAttrib>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an `EGL_NONE` terminated style list of pairs.
    pub fn from_pairs(pairs: &[(EGLenum, EGLAttrib)]) -> Self {
        Self {
            values: pairs.iter().copied().collect(),
        }
    }

    pub fn insert(&mut self, key: EGLenum, value: EGLAttrib) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: EGLenum, default: EGLAttrib) -> EGLAttrib {
        self.values.get(&key).copied().unwrap_or(default)
    }

    pub fn get_as_int(&self, key: EGLenum, default: EGLint) -> EGLint {
        self.get(key, default as EGLAttrib) as EGLint
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An EGL sync object.
///
/// `EGL_SYNC_FENCE_KHR` is backed by an event, `EGL_SYNC_NATIVE_FENCE_ANDROID`
/// by a sync file.
pub struct EglSync {
    sync_type: EGLenum,
    attributes: AttributeMap,
    sync: Option<Box<dyn SyncHelper>>,
}

impl EglSync {
    pub fn new(sync_type: EGLenum, attributes: AttributeMap) -> Self {
        Self {
            sync_type,
            attributes,
            sync: None,
        }
    }

    pub fn sync_type(&self) -> EGLenum {
        self.sync_type
    }

    /// `eglCreateSync`: create the backing sync object on `context`.
    ///
    /// # Safety
    ///
    /// If the attributes carry `EGL_SYNC_NATIVE_FENCE_FD_ANDROID` other than
    /// `EGL_NO_NATIVE_FENCE_FD_ANDROID`, it must be an open sync file
    /// descriptor owned by the caller. Ownership passes to this object.
    pub unsafe fn initialize(&mut self, context: &mut Context) -> Result<(), EglError> {
        assert!(self.sync.is_none(), "EGL sync initialized twice");

        match self.sync_type {
            EGL_SYNC_FENCE_KHR => {
                assert!(self.attributes.is_empty());
                let mut sync = EventSync::new();
                let result = sync.initialize(context);
                self.sync = Some(Box::new(sync));
                result.map_err(|_| EglError::new(EGL_BAD_ALLOC))
            }
            EGL_SYNC_NATIVE_FENCE_ANDROID => {
                let raw: RawFd = self.attributes.get_as_int(
                    EGL_SYNC_NATIVE_FENCE_FD_ANDROID,
                    EGL_NO_NATIVE_FENCE_FD_ANDROID,
                );
                if raw < EGL_NO_NATIVE_FENCE_FD_ANDROID {
                    return Err(EglError::new(EGL_BAD_PARAMETER));
                }
                let fd = if raw == EGL_NO_NATIVE_FENCE_FD_ANDROID {
                    None
                } else {
                    // SAFETY: the caller hands us an owned, open descriptor.
                    Some(unsafe { OwnedFd::from_raw_fd(raw) })
                };

                let mut sync = NativeFenceSync::new();
                let result = sync.initialize_with_fd(context, fd);
                self.sync = Some(Box::new(sync));
                result.map_err(|_| EglError::new(EGL_BAD_ALLOC))
            }
            other => unreachable!("unknown EGL sync type 0x{other:X}"),
        }
    }

    fn sync(&self) -> &dyn SyncHelper {
        self.sync
            .as_deref()
            .expect("EGL sync used before initialize()")
    }

    /// `eglClientWaitSync`. Works without a current context.
    pub fn client_wait(
        &self,
        renderer: &Renderer,
        context: Option<&mut Context>,
        flags: EGLint,
        timeout: EGLTimeKHR,
    ) -> Result<EGLint, EglError> {
        assert_eq!(flags & !EGL_SYNC_FLUSH_COMMANDS_BIT_KHR, 0);
        let flush = flags & EGL_SYNC_FLUSH_COMMANDS_BIT_KHR != 0;

        let result = self
            .sync()
            .client_wait(renderer, context, flush, timeout)
            .map_err(|_| EglError::new(EGL_BAD_ALLOC))?;

        Ok(match result {
            vk::Result::EVENT_SET | vk::Result::SUCCESS => EGL_CONDITION_SATISFIED_KHR,
            vk::Result::TIMEOUT => EGL_TIMEOUT_EXPIRED_KHR,
            other => unreachable!("unexpected client wait result {other:?}"),
        })
    }

    /// `eglWaitSync`
    pub fn server_wait(&self, context: &mut Context, flags: EGLint) -> Result<(), EglError> {
        assert_eq!(flags, 0);
        self.sync()
            .server_wait(context)
            .map_err(|_| EglError::new(EGL_BAD_ALLOC))
    }

    /// `eglGetSyncAttrib(EGL_SYNC_STATUS)`
    pub fn get_status(&self, renderer: &Renderer) -> Result<EGLint, EglError> {
        let signaled = self
            .sync()
            .get_status(renderer)
            .map_err(|_| EglError::new(EGL_BAD_ALLOC))?;
        Ok(if signaled {
            EGL_SIGNALED_KHR
        } else {
            EGL_UNSIGNALED_KHR
        })
    }

    /// `eglDupNativeFenceFDANDROID`
    pub fn dup_native_fence_fd(&self) -> Result<OwnedFd, EglError> {
        if self.sync_type != EGL_SYNC_NATIVE_FENCE_ANDROID {
            return Err(EglError::new(EGL_BAD_DISPLAY));
        }
        Ok(self.sync().dup_native_fence_fd()?)
    }

    /// `eglDestroySync`
    pub fn on_destroy(&mut self, renderer: &Renderer) {
        if let Some(sync) = self.sync.as_mut() {
            sync.release(renderer);
        }
    }
}

impl std::fmt::Debug for EglSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EglSync")
            .field("sync_type", &format_args!("0x{:X}", self.sync_type))
            .field("attributes", &self.attributes)
            .field("initialized", &self.sync.is_some())
            .finish()
    }
}
