//! Simulated device for testing without a GPU.
//!
//! Submissions are executed in-process. Each submission runs its commands in
//! order and stalls on `WaitEvents` for an unset event or on a wait semaphore
//! whose payload is unsignaled; stalled submissions do not block later ones.
//! By default work runs as soon as it is submitted. With auto-execute turned
//! off, nothing runs until [`SimulatedDevice::process`] is called, which lets a
//! test observe the state between submission and completion.
//!
//! Sync files are real OS descriptors (one end of a unix socket pair). A
//! descriptor is identified by its inode, so `dup`ed descriptors refer to the
//! same payload exactly as real sync files do. The device holds no descriptor
//! of its own, so a sync file lives exactly as long as its callers' handles;
//! entries for closed sync files are dropped the next time one is created.

use crate::backend::traits::*;
use crate::backend::types::*;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOp {
    CreateEvent,
    EventStatus,
    CreateFence,
    FenceStatus,
    WaitForFence,
    ExportFenceFd,
    ImportFenceFd,
    CreateSemaphore,
    ImportSemaphoreFd,
    QueueSubmit,
}

type PayloadId = usize;

struct SimFence {
    exportable: bool,
    permanent: PayloadId,
    temporary: Option<PayloadId>,
}

impl SimFence {
    fn active(&self) -> PayloadId {
        self.temporary.unwrap_or(self.permanent)
    }
}

#[derive(Default)]
struct SimSemaphore {
    temporary: Option<PayloadId>,
}

struct PendingSubmit {
    waits: Vec<PayloadId>,
    commands: Vec<Command>,
    next_command: usize,
    signal: Option<PayloadId>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    events: HashMap<u64, bool>,
    fences: HashMap<u64, SimFence>,
    semaphores: HashMap<u64, SimSemaphore>,
    payloads: Vec<bool>,
    /// Payload behind each live sync file, by inode.
    sync_files: HashMap<u64, PayloadId>,
    pending: Vec<PendingSubmit>,
    writes: Vec<(vk::Buffer, u32)>,
    failures: HashMap<SimulatedOp, vk::Result>,
    submissions: usize,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn payload(&mut self, signaled: bool) -> PayloadId {
        self.payloads.push(signaled);
        self.payloads.len() - 1
    }

    fn fail(&self, op: SimulatedOp) -> Option<vk::Result> {
        self.failures.get(&op).copied()
    }

    fn sync_file_payload(&self, fd: BorrowedFd<'_>) -> Option<PayloadId> {
        let inode = inode_of(fd).ok()?;
        self.sync_files.get(&inode).copied()
    }

    fn new_sync_file(&mut self, payload: PayloadId) -> io::Result<OwnedFd> {
        self.prune_sync_files();
        let (socket, _peer) = UnixStream::pair()?;
        let fd = OwnedFd::from(socket);
        let inode = inode_of(fd.as_fd())?;
        self.sync_files.insert(inode, payload);
        Ok(fd)
    }

    /// Forget sync files no descriptor in the process refers to anymore.
    fn prune_sync_files(&mut self) {
        match open_inodes() {
            Ok(open) => self.sync_files.retain(|inode, _| open.contains(inode)),
            Err(e) => log::debug!("Keeping sync file table unpruned: {}", e),
        }
    }

    /// Runs pending work until nothing can make progress. Returns the number of
    /// submissions that completed.
    fn run(&mut self) -> usize {
        let mut completed = 0;
        loop {
            let mut progressed = false;
            let mut pending = std::mem::take(&mut self.pending);

            for submit in &mut pending {
                if !submit.waits.iter().all(|&p| self.payloads[p]) {
                    continue;
                }
                while submit.next_command < submit.commands.len() {
                    match &submit.commands[submit.next_command] {
                        Command::SetEvent { event, .. } => {
                            self.events.insert(event.as_raw(), true);
                        }
                        Command::WaitEvents { events, .. } => {
                            let all_set = events
                                .iter()
                                .all(|e| self.events.get(&e.as_raw()).copied().unwrap_or(false));
                            if !all_set {
                                break;
                            }
                        }
                        Command::FillBuffer { buffer, data, .. } => {
                            self.writes.push((*buffer, *data));
                        }
                    }
                    submit.next_command += 1;
                    progressed = true;
                }
            }

            pending.retain(|submit| {
                let done = submit.waits.iter().all(|&p| self.payloads[p])
                    && submit.next_command == submit.commands.len();
                if done {
                    if let Some(payload) = submit.signal {
                        self.payloads[payload] = true;
                    }
                    completed += 1;
                    progressed = true;
                }
                !done
            });
            self.pending = pending;

            if !progressed {
                return completed;
            }
        }
    }
}

fn inode_of(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let file = File::from(fd.try_clone_to_owned()?);
    Ok(file.metadata()?.ino())
}

/// Inodes behind every descriptor the process has open.
fn open_inodes() -> io::Result<HashSet<u64>> {
    let mut inodes = HashSet::new();
    for entry in std::fs::read_dir("/proc/self/fd")? {
        // Descriptors can close while we look; those simply drop out.
        if let Ok(metadata) = std::fs::metadata(entry?.path()) {
            inodes.insert(metadata.ino());
        }
    }
    Ok(inodes)
}

/// In-process stand-in for a GPU and its queue.
pub struct SimulatedDevice {
    state: Mutex<SimState>,
    progress: Condvar,
    auto_execute: AtomicBool,
}

impl SimulatedDevice {
    /// Create a device that executes work as soon as it is submitted.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            progress: Condvar::new(),
            auto_execute: AtomicBool::new(true),
        }
    }

    /// Create a device that only executes work when [`process`](Self::process) is called.
    pub fn manual() -> Self {
        let device = Self::new();
        device.set_auto_execute(false);
        device
    }

    pub fn set_auto_execute(&self, enabled: bool) {
        self.auto_execute.store(enabled, Ordering::Release);
    }

    /// Execute whatever pending work can run. Returns completed submission count.
    pub fn process(&self) -> usize {
        let completed = self.state.lock().run();
        self.progress.notify_all();
        completed
    }

    /// Make every later call of `op` return `result`.
    pub fn inject_failure(&self, op: SimulatedOp, result: vk::Result) {
        self.state.lock().failures.insert(op, result);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Create an unsignaled sync file, as another process would hand us.
    pub fn create_sync_file(&self) -> io::Result<OwnedFd> {
        let mut state = self.state.lock();
        let payload = state.payload(false);
        state.new_sync_file(payload)
    }

    /// Signal the payload behind a sync file from outside the queue.
    pub fn signal_sync_file(&self, fd: BorrowedFd<'_>) -> bool {
        let found = {
            let mut state = self.state.lock();
            match state.sync_file_payload(fd) {
                Some(payload) => {
                    state.payloads[payload] = true;
                    true
                }
                None => false,
            }
        };
        if found && self.auto_execute.load(Ordering::Acquire) {
            self.process();
        } else {
            self.progress.notify_all();
        }
        found
    }

    /// Whether the payload behind a sync file has signaled. `None` for unknown descriptors.
    pub fn is_sync_file_signaled(&self, fd: BorrowedFd<'_>) -> Option<bool> {
        let state = self.state.lock();
        state
            .sync_file_payload(fd)
            .map(|payload| state.payloads[payload])
    }

    /// Sync files still referenced by an open descriptor.
    pub fn sync_file_count(&self) -> usize {
        let mut state = self.state.lock();
        state.prune_sync_files();
        state.sync_files.len()
    }

    /// Values written by `FillBuffer` commands, in execution order.
    pub fn writes(&self) -> Vec<(vk::Buffer, u32)> {
        self.state.lock().writes.clone()
    }

    /// Submissions that have not completed yet.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Total accepted submissions.
    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions
    }

    /// Live events, fences and semaphores.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.events.len() + state.fences.len() + state.semaphores.len()
    }

    pub fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }

    fn after_submit(&self) {
        if self.auto_execute.load(Ordering::Acquire) {
            self.process();
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedDevice")
            .field("events", &state.events.len())
            .field("fences", &state.fences.len())
            .field("semaphores", &state.semaphores.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl SyncDevice for SimulatedDevice {
    fn name(&self) -> &str {
        "Simulated"
    }

    fn create_event(&self) -> VkResult<vk::Event> {
        let mut state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::CreateEvent) {
            return Err(e);
        }
        let handle = state.handle();
        state.events.insert(handle, false);
        Ok(vk::Event::from_raw(handle))
    }

    fn destroy_event(&self, event: vk::Event) {
        self.state.lock().events.remove(&event.as_raw());
    }

    fn event_status(&self, event: vk::Event) -> vk::Result {
        let state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::EventStatus) {
            return e;
        }
        match state.events.get(&event.as_raw()) {
            Some(true) => vk::Result::EVENT_SET,
            Some(false) => vk::Result::EVENT_RESET,
            None => vk::Result::ERROR_DEVICE_LOST,
        }
    }

    fn create_fence(&self, kind: FenceKind) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::CreateFence) {
            return Err(e);
        }
        let handle = state.handle();
        let permanent = state.payload(false);
        state.fences.insert(
            handle,
            SimFence {
                exportable: kind == FenceKind::Exportable,
                permanent,
                temporary: None,
            },
        );
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence.as_raw());
    }

    fn fence_status(&self, fence: vk::Fence) -> vk::Result {
        let state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::FenceStatus) {
            return e;
        }
        match state.fences.get(&fence.as_raw()) {
            Some(f) if state.payloads[f.active()] => vk::Result::SUCCESS,
            Some(_) => vk::Result::NOT_READY,
            None => vk::Result::ERROR_DEVICE_LOST,
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> vk::Result {
        if self.auto_execute.load(Ordering::Acquire) {
            self.process();
        }

        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::WaitForFence) {
            return e;
        }
        loop {
            let payload = match state.fences.get(&fence.as_raw()) {
                Some(f) => f.active(),
                None => return vk::Result::ERROR_DEVICE_LOST,
            };
            if state.payloads[payload] {
                return vk::Result::SUCCESS;
            }
            match deadline {
                None => self.progress.wait(&mut state),
                Some(deadline) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out() {
                        return if state.payloads[payload] {
                            vk::Result::SUCCESS
                        } else {
                            vk::Result::TIMEOUT
                        };
                    }
                }
            }
        }
    }

    fn export_fence_fd(&self, fence: vk::Fence) -> VkResult<OwnedFd> {
        let mut state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::ExportFenceFd) {
            return Err(e);
        }
        let (payload, exportable) = match state.fences.get(&fence.as_raw()) {
            Some(f) => (f.active(), f.exportable),
            None => return Err(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE),
        };
        if !exportable {
            return Err(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE);
        }
        let fd = state
            .new_sync_file(payload)
            .map_err(|_| vk::Result::ERROR_TOO_MANY_OBJECTS)?;

        // Sync file export has reset semantics.
        let fresh = state.payload(false);
        if let Some(f) = state.fences.get_mut(&fence.as_raw()) {
            f.temporary = None;
            f.permanent = fresh;
        }
        Ok(fd)
    }

    fn import_fence_fd(&self, fence: vk::Fence, fd: OwnedFd) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::ImportFenceFd) {
            return Err(e);
        }
        let payload = state
            .sync_file_payload(fd.as_fd())
            .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
        let f = state
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
        f.temporary = Some(payload);
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::CreateSemaphore) {
            return Err(e);
        }
        let handle = state.handle();
        state.semaphores.insert(handle, SimSemaphore::default());
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn import_semaphore_fd(&self, semaphore: vk::Semaphore, fd: OwnedFd) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(e) = state.fail(SimulatedOp::ImportSemaphoreFd) {
            return Err(e);
        }
        let payload = state
            .sync_file_payload(fd.as_fd())
            .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
        let s = state
            .semaphores
            .get_mut(&semaphore.as_raw())
            .ok_or(vk::Result::ERROR_INVALID_EXTERNAL_HANDLE)?;
        s.temporary = Some(payload);
        Ok(())
    }

    fn queue_submit(
        &self,
        priority: QueuePriority,
        batch: &SubmitBatch,
        fence: vk::Fence,
    ) -> VkResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(e) = state.fail(SimulatedOp::QueueSubmit) {
                return Err(e);
            }

            let mut waits = Vec::with_capacity(batch.wait_semaphores.len());
            for wait in &batch.wait_semaphores {
                // A wait consumes the temporary payload. Without one the wait never completes.
                let temporary = state
                    .semaphores
                    .get_mut(&wait.semaphore.as_raw())
                    .ok_or(vk::Result::ERROR_DEVICE_LOST)?
                    .temporary
                    .take();
                let payload = match temporary {
                    Some(payload) => payload,
                    None => state.payload(false),
                };
                waits.push(payload);
            }

            let signal = if fence == vk::Fence::null() {
                None
            } else {
                let f = state
                    .fences
                    .get(&fence.as_raw())
                    .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
                Some(f.active())
            };

            log::trace!(
                "Simulated submit ({:?}): {} commands, {} waits",
                priority,
                batch.commands.len(),
                waits.len()
            );

            state.pending.push(PendingSubmit {
                waits,
                commands: batch.commands.clone(),
                next_command: 0,
                signal,
            });
            state.submissions += 1;
        }
        self.after_submit();
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.process();
        Ok(())
    }
}
