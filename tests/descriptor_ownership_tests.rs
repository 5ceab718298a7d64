//! Descriptor ownership of sync-file-backed syncs, observed in the process fd table.
//!
//! Everything runs in a single test: tests in one binary share the fd table and
//! run in parallel, which would skew the counts.

#![cfg(target_os = "linux")]

mod common;

use std::os::fd::AsFd;

use common::{SubmissionMode, TestContext};
use vk_fence_sync::{NativeFenceSync, SyncHelper};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("Failed to list open descriptors")
        .count()
}

#[test]
fn test_descriptor_lifetimes() {
    let tc = TestContext::new(SubmissionMode::Direct);
    let mut ctx = tc.context();

    // Import path: the imported handle goes to the device, one duplicate stays.
    let file = tc.device.create_sync_file().unwrap();
    let signal_handle = file.try_clone().unwrap();
    let baseline = open_descriptors();

    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, Some(file)).unwrap();
    assert_eq!(open_descriptors(), baseline);

    let dup = sync.dup_native_fence_fd().unwrap();
    assert_eq!(open_descriptors(), baseline + 1);
    drop(dup);
    sync.server_wait(&mut ctx).unwrap();
    ctx.flush().unwrap();
    assert_eq!(open_descriptors(), baseline);

    sync.release(&tc.renderer);
    assert_eq!(open_descriptors(), baseline);
    drop(sync);
    assert_eq!(open_descriptors(), baseline - 1);

    // The caller's own handle is untouched throughout.
    assert_eq!(tc.device.is_sync_file_signaled(signal_handle.as_fd()), Some(false));
    assert!(tc.device.signal_sync_file(signal_handle.as_fd()));
    drop(signal_handle);
    tc.cleanup();

    // Create path: the exported handle goes back into the fence, one duplicate stays.
    let baseline = open_descriptors();
    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, None).unwrap();
    assert_eq!(open_descriptors(), baseline + 1);

    sync.server_wait(&mut ctx).unwrap();
    ctx.flush().unwrap();
    assert_eq!(open_descriptors(), baseline + 1);

    sync.release(&tc.renderer);
    assert_eq!(open_descriptors(), baseline + 1);
    drop(sync);
    assert_eq!(open_descriptors(), baseline);

    tc.cleanup();
    assert_eq!(tc.device.sync_file_count(), 0);
}
