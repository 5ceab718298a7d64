//! Asynchronous submission worker.

use std::sync::Arc;
use std::thread::JoinHandle;

use ash::vk;
use parking_lot::{Condvar, Mutex};

use super::{CommandQueue, SubmissionBackend};
use crate::backend::{QueuePriority, Serial, SubmitBatch};
use crate::error::{SyncError, SyncResult};

enum Task {
    Submit {
        priority: QueuePriority,
        serial: Serial,
        batch: SubmitBatch,
    },
    Marker {
        priority: QueuePriority,
        fence: vk::Fence,
    },
}

#[derive(Default)]
struct WorkerShared {
    /// Tasks sent but not yet finished by the worker.
    pending: Mutex<usize>,
    idle: Condvar,
    /// First failure the worker hit, reported by the next submit or drain.
    error: Mutex<Option<SyncError>>,
}

impl WorkerShared {
    fn finish_task(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn take_error(&self) -> SyncResult<()> {
        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Submits from a dedicated worker thread, in the order tasks were sent.
pub struct AsyncSubmission {
    queue: Arc<CommandQueue>,
    sender: Option<flume::Sender<Task>>,
    shared: Arc<WorkerShared>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncSubmission {
    pub fn new(queue: Arc<CommandQueue>, thread_name: &str) -> SyncResult<Self> {
        let (sender, receiver) = flume::unbounded::<Task>();
        let shared = Arc::new(WorkerShared::default());

        let worker = {
            let queue = Arc::clone(&queue);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(thread_name.to_string())
                .spawn(move || {
                    log::debug!("Submission worker started");
                    for task in receiver.iter() {
                        let result = match task {
                            Task::Submit {
                                priority,
                                serial,
                                batch,
                            } => queue.submit(priority, serial, &batch),
                            Task::Marker { priority, fence } => {
                                queue.submit_marker(priority, fence)
                            }
                        };
                        if let Err(e) = result {
                            log::error!("Asynchronous submission failed: {}", e);
                            let mut slot = shared.error.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                        shared.finish_task();
                    }
                    log::debug!("Submission worker stopped");
                })
                .map_err(SyncError::WorkerSpawn)?
        };

        Ok(Self {
            queue,
            sender: Some(sender),
            shared,
            worker: Some(worker),
        })
    }

    /// Number of tasks the worker has not finished yet.
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    fn send(&self, task: Task) -> SyncResult<()> {
        let sender = self.sender.as_ref().ok_or(SyncError::WorkerLost)?;
        *self.shared.pending.lock() += 1;
        match sender.send(task) {
            Ok(()) => Ok(()),
            Err(flume::SendError(task)) => {
                self.shared.finish_task();
                if let Task::Submit { serial, .. } = task {
                    self.queue.abandon(serial);
                }
                Err(SyncError::WorkerLost)
            }
        }
    }
}

impl SubmissionBackend for AsyncSubmission {
    fn is_async(&self) -> bool {
        true
    }

    fn submit_commands(
        &self,
        priority: QueuePriority,
        serial: Serial,
        batch: SubmitBatch,
    ) -> SyncResult<()> {
        if let Err(e) = self.shared.take_error() {
            self.queue.abandon(serial);
            return Err(e);
        }
        self.send(Task::Submit {
            priority,
            serial,
            batch,
        })
    }

    fn submit_marker(&self, priority: QueuePriority, fence: vk::Fence) -> SyncResult<()> {
        self.shared.take_error()?;
        self.send(Task::Marker { priority, fence })
    }

    fn drain(&self) -> SyncResult<()> {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
        drop(pending);
        self.shared.take_error()
    }
}

impl Drop for AsyncSubmission {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Submission worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for AsyncSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSubmission")
            .field("pending", &self.pending())
            .finish()
    }
}
