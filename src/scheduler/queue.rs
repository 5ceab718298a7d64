//! Serial tracking for queue submissions.
//!
//! Every submission is tagged with a [`Serial`] reserved ahead of time by the
//! context that records it, and tracked with its own fence until it retires.
//! Submissions may retire out of order; `last_completed` only advances past a
//! serial once it and every serial before it are done.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Condvar, Mutex};

use crate::backend::{FenceKind, QueuePriority, Serial, SubmitBatch, SyncDevice};
use crate::error::{SyncError, SyncResult};

/// Fence owned by the queue for one submission.
///
/// Shared so a waiter can keep it alive while the queue retires it.
struct SubmissionFence {
    device: Arc<dyn SyncDevice>,
    fence: vk::Fence,
}

impl Drop for SubmissionFence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

#[derive(Default)]
struct QueueState {
    last_reserved: Serial,
    last_completed: Serial,
    /// Reserved but not yet handed to the device.
    outstanding: BTreeSet<Serial>,
    in_flight: BTreeMap<Serial, Arc<SubmissionFence>>,
    /// Reserved serials whose submission failed. Their work never runs.
    abandoned: BTreeSet<Serial>,
}

impl QueueState {
    fn update_completed(&mut self) {
        let oldest_outstanding = self.outstanding.first().copied();
        let oldest_in_flight = self.in_flight.keys().next().copied();
        let oldest = match (oldest_outstanding, oldest_in_flight) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let completed = match oldest {
            Some(serial) => Serial::new(serial.value() - 1),
            None => self.last_reserved,
        };
        debug_assert!(completed >= self.last_completed);
        self.last_completed = completed;
    }
}

/// The device queue shared by every context.
pub struct CommandQueue {
    device: Arc<dyn SyncDevice>,
    state: Mutex<QueueState>,
    /// Signaled whenever an outstanding serial is submitted or abandoned.
    submitted: Condvar,
}

impl CommandQueue {
    pub fn new(device: Arc<dyn SyncDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(QueueState::default()),
            submitted: Condvar::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn SyncDevice> {
        &self.device
    }

    /// Reserve the serial of a future submission.
    ///
    /// Until it is submitted or abandoned the serial holds back `last_completed`.
    pub fn reserve_serial(&self) -> Serial {
        let mut state = self.state.lock();
        let serial = state.last_reserved.next();
        state.last_reserved = serial;
        state.outstanding.insert(serial);
        serial
    }

    /// Give up a reserved serial whose submission will never happen.
    pub fn abandon(&self, serial: Serial) {
        let mut state = self.state.lock();
        if state.outstanding.remove(&serial) {
            log::warn!("Submission {} abandoned", serial);
            state.abandoned.insert(serial);
            state.update_completed();
            self.submitted.notify_all();
        }
    }

    /// Submit a batch under a previously reserved serial.
    pub fn submit(&self, priority: QueuePriority, serial: Serial, batch: &SubmitBatch) -> SyncResult<()> {
        let fence = match self.device.create_fence(FenceKind::Plain) {
            Ok(fence) => Arc::new(SubmissionFence {
                device: Arc::clone(&self.device),
                fence,
            }),
            Err(e) => {
                self.abandon(serial);
                return Err(SyncError::device("vkCreateFence")(e));
            }
        };

        if let Err(e) = self.device.queue_submit(priority, batch, fence.fence) {
            self.abandon(serial);
            return Err(SyncError::device("vkQueueSubmit")(e));
        }

        let mut state = self.state.lock();
        debug_assert!(state.outstanding.contains(&serial), "serial {serial} was not reserved");
        state.outstanding.remove(&serial);
        state.in_flight.insert(serial, fence);
        state.update_completed();
        self.submitted.notify_all();

        log::trace!(
            "Submitted {} ({} commands, {} waits)",
            serial,
            batch.commands.len(),
            batch.wait_semaphores.len()
        );
        Ok(())
    }

    /// Submit no work, only a signal of `fence` once everything before it completes.
    ///
    /// The fence belongs to the caller, so the submission consumes no serial.
    pub fn submit_marker(&self, priority: QueuePriority, fence: vk::Fence) -> SyncResult<()> {
        self.device
            .queue_submit(priority, &SubmitBatch::default(), fence)
            .map_err(SyncError::device("vkQueueSubmit"))?;
        log::trace!("Submitted marker for {:?}", fence);
        Ok(())
    }

    /// Retire finished submissions and return the last completed serial.
    pub fn check_completed(&self) -> SyncResult<Serial> {
        let mut state = self.state.lock();
        let mut finished = Vec::new();
        for (&serial, fence) in &state.in_flight {
            match self.device.fence_status(fence.fence) {
                vk::Result::SUCCESS => finished.push(serial),
                vk::Result::NOT_READY => {}
                result => {
                    return Err(SyncError::Device {
                        operation: "vkGetFenceStatus",
                        result,
                    })
                }
            }
        }
        for serial in finished {
            state.in_flight.remove(&serial);
        }
        state.update_completed();
        Ok(state.last_completed)
    }

    pub fn last_completed_serial(&self) -> Serial {
        self.state.lock().last_completed
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Block until the submission tagged `serial` completes, up to `timeout_ns`.
    ///
    /// Returns the raw `SUCCESS` or `TIMEOUT` status; anything else is an error.
    /// A serial that is reserved but not yet submitted is waited on until some
    /// thread submits it, and the remaining time then goes to its fence. A
    /// serial whose submission failed reports `ERROR_DEVICE_LOST`.
    pub fn wait_for_serial(&self, serial: Serial, timeout_ns: u64) -> SyncResult<vk::Result> {
        // `None` means the timeout is too large to matter.
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));

        let fence = {
            let mut state = self.state.lock();
            assert!(
                serial <= state.last_reserved,
                "waiting on serial {serial} that was never reserved"
            );
            loop {
                if state.abandoned.contains(&serial) {
                    return Err(SyncError::Device {
                        operation: "vkQueueSubmit",
                        result: vk::Result::ERROR_DEVICE_LOST,
                    });
                }
                if serial <= state.last_completed {
                    return Ok(vk::Result::SUCCESS);
                }
                if let Some(fence) = state.in_flight.get(&serial) {
                    break Arc::clone(fence);
                }
                if !state.outstanding.contains(&serial) {
                    // Retired ahead of an older submission.
                    return Ok(vk::Result::SUCCESS);
                }

                log::trace!("Waiting for {} to be submitted", serial);
                match deadline {
                    None => self.submitted.wait(&mut state),
                    Some(deadline) => {
                        if self.submitted.wait_until(&mut state, deadline).timed_out()
                            && state.outstanding.contains(&serial)
                        {
                            return Ok(vk::Result::TIMEOUT);
                        }
                    }
                }
            }
        };

        let remaining_ns = match deadline {
            None => u64::MAX,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                u64::try_from(remaining.as_nanos()).unwrap_or(u64::MAX)
            }
        };
        let result = self.device.wait_for_fence(fence.fence, remaining_ns);
        match result {
            vk::Result::SUCCESS => {
                drop(fence);
                self.check_completed()?;
                Ok(result)
            }
            vk::Result::TIMEOUT => Ok(result),
            result => Err(SyncError::Device {
                operation: "vkWaitForFences",
                result,
            }),
        }
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommandQueue")
            .field("last_reserved", &state.last_reserved)
            .field("last_completed", &state.last_completed)
            .field("outstanding", &state.outstanding.len())
            .field("in_flight", &state.in_flight.len())
            .field("abandoned", &state.abandoned.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::SimulatedDevice;

    fn manual_queue() -> (Arc<SimulatedDevice>, CommandQueue) {
        let device = Arc::new(SimulatedDevice::manual());
        let queue = CommandQueue::new(device.clone());
        (device, queue)
    }

    #[test]
    fn test_reserved_serial_holds_back_completion() {
        let (device, queue) = manual_queue();
        let first = queue.reserve_serial();
        let second = queue.reserve_serial();

        queue
            .submit(QueuePriority::Medium, second, &SubmitBatch::default())
            .unwrap();
        device.process();
        assert_eq!(queue.check_completed().unwrap(), Serial::ZERO);

        queue
            .submit(QueuePriority::Medium, first, &SubmitBatch::default())
            .unwrap();
        device.process();
        assert_eq!(queue.check_completed().unwrap(), second);
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[test]
    fn test_wait_for_unsubmitted_serial_times_out() {
        let (_device, queue) = manual_queue();
        let serial = queue.reserve_serial();

        let start = Instant::now();
        assert_eq!(
            queue.wait_for_serial(serial, 20_000_000).unwrap(),
            vk::Result::TIMEOUT
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_for_serial_submitted_by_another_thread() {
        let device = Arc::new(SimulatedDevice::new());
        let queue = Arc::new(CommandQueue::new(device));
        let serial = queue.reserve_serial();

        let submitter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue
                    .submit(QueuePriority::Medium, serial, &SubmitBatch::default())
                    .unwrap();
            })
        };

        assert_eq!(
            queue.wait_for_serial(serial, u64::MAX).unwrap(),
            vk::Result::SUCCESS
        );
        submitter.join().unwrap();
        assert_eq!(queue.last_completed_serial(), serial);
    }

    #[test]
    fn test_wait_for_serial() {
        let (device, queue) = manual_queue();
        let serial = queue.reserve_serial();
        queue
            .submit(QueuePriority::Medium, serial, &SubmitBatch::default())
            .unwrap();

        assert_eq!(
            queue.wait_for_serial(serial, 1_000).unwrap(),
            vk::Result::TIMEOUT
        );
        device.process();
        assert_eq!(
            queue.wait_for_serial(serial, 1_000).unwrap(),
            vk::Result::SUCCESS
        );
        assert_eq!(queue.last_completed_serial(), serial);
    }

    #[test]
    fn test_failed_submit_abandons_serial() {
        let (device, queue) = manual_queue();
        device.inject_failure(
            crate::backend::dummy::SimulatedOp::QueueSubmit,
            vk::Result::ERROR_DEVICE_LOST,
        );
        let serial = queue.reserve_serial();
        let err = queue
            .submit(QueuePriority::Medium, serial, &SubmitBatch::default())
            .unwrap_err();
        assert_eq!(err.device_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(queue.last_completed_serial(), serial);
        assert_eq!(device.live_objects(), 0);

        // The work never ran, so waiting on it must not report success.
        device.clear_failures();
        let err = queue.wait_for_serial(serial, 1_000_000).unwrap_err();
        assert_eq!(err.device_result(), Some(vk::Result::ERROR_DEVICE_LOST));
    }

    #[test]
    fn test_abandon_wakes_waiter() {
        let device = Arc::new(SimulatedDevice::manual());
        let queue = Arc::new(CommandQueue::new(device));
        let serial = queue.reserve_serial();

        let abandoner = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.abandon(serial);
            })
        };

        let err = queue.wait_for_serial(serial, u64::MAX).unwrap_err();
        assert_eq!(err.device_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        abandoner.join().unwrap();
    }
}
