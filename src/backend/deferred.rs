//! Deferred destruction of sync objects.
//!
//! A sync object can be released while the device still references it: an
//! event that a submitted batch will set, a fence that a marker submission
//! will signal, a semaphore a batch waits on. Releasing therefore hands the
//! handle to the [`DeferredDestructor`] together with the serial of the last
//! submission that uses it, and the handle is destroyed once that serial has
//! completed.
//!
//! ```text
//! release(sync)                          cleanup(last_completed)
//!   │                                       │
//!   ▼                                       ▼
//! ┌──────────────┬──────────────┬──────────────┐
//! │ #3: [event]  │ #5: [fence]  │ #9: [sem]    │  destroy every entry
//! └──────────────┴──────────────┴──────────────┘  with serial <= completed
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::backend::{Serial, SyncDevice};

/// Tracks the last submission that references an object.
///
/// Cloning shares the tracker, so every holder sees updates.
#[derive(Debug, Clone, Default)]
pub struct ResourceUse(Arc<AtomicU64>);

impl ResourceUse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial of the last submission using the object.
    pub fn serial(&self) -> Serial {
        Serial::new(self.0.load(Ordering::Acquire))
    }

    /// Record a use by the submission tagged `serial`. Never moves backwards.
    pub fn update(&self, serial: Serial) {
        self.0.fetch_max(serial.value(), Ordering::AcqRel);
    }

    pub fn is_complete(&self, last_completed: Serial) -> bool {
        self.serial() <= last_completed
    }
}

/// A native object waiting to be destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarbageObject {
    Event(vk::Event),
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
}

impl GarbageObject {
    /// Destroy the object now.
    ///
    /// The device must no longer be using it.
    pub fn destroy(self, device: &dyn SyncDevice) {
        match self {
            GarbageObject::Event(event) => device.destroy_event(event),
            GarbageObject::Fence(fence) => device.destroy_fence(fence),
            GarbageObject::Semaphore(semaphore) => device.destroy_semaphore(semaphore),
        }
    }
}

struct GarbageEntry {
    serial: Serial,
    objects: Vec<GarbageObject>,
}

/// Holds released objects until the submissions using them have completed.
#[derive(Default)]
pub struct DeferredDestructor {
    pending: Mutex<Vec<GarbageEntry>>,
}

impl std::fmt::Debug for DeferredDestructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDestructor")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

impl DeferredDestructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue objects for destruction once `serial` has completed.
    pub fn collect(&self, serial: Serial, objects: Vec<GarbageObject>) {
        if objects.is_empty() {
            return;
        }
        log::trace!("Deferring destruction of {} objects until {}", objects.len(), serial);
        self.pending.lock().push(GarbageEntry { serial, objects });
    }

    /// Destroy every queued object whose serial is at or before `last_completed`.
    ///
    /// Returns the number of objects destroyed.
    pub fn cleanup(&self, last_completed: Serial, device: &dyn SyncDevice) -> usize {
        let ready: Vec<GarbageEntry> = {
            let mut pending = self.pending.lock();
            let (ready, waiting) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|entry| entry.serial <= last_completed);
            *pending = waiting;
            ready
        };

        let mut destroyed = 0;
        for entry in ready {
            destroyed += entry.objects.len();
            for object in entry.objects {
                object.destroy(device);
            }
        }
        if destroyed > 0 {
            log::trace!("Destroyed {} deferred objects (completed {})", destroyed, last_completed);
        }
        destroyed
    }

    /// Destroy everything regardless of serial.
    ///
    /// Only valid once the device is idle.
    pub fn flush_all(&self, device: &dyn SyncDevice) -> usize {
        let entries = std::mem::take(&mut *self.pending.lock());
        let mut destroyed = 0;
        for entry in entries {
            destroyed += entry.objects.len();
            for object in entry.objects {
                object.destroy(device);
            }
        }
        destroyed
    }

    /// Number of objects waiting to be destroyed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().iter().map(|e| e.objects.len()).sum()
    }
}
