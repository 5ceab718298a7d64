//! Sync file backed fence sync against both submission models.

mod common;

use std::os::fd::AsFd;
use std::thread;
use std::time::Duration;

use ash::vk;
use common::{buffer, SubmissionMode, TestContext, ONE_SECOND_NS};
use rstest::rstest;
use vk_fence_sync::backend::dummy::SimulatedOp;
use vk_fence_sync::{NativeFenceSync, SyncHelper};

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_created_fence_already_signaled(#[case] mode: SubmissionMode) {
    let tc = TestContext::new(mode);
    let mut ctx = tc.context();
    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, None).unwrap();

    assert!(sync.get_status(&tc.renderer).unwrap());
    for timeout in [0, ONE_SECOND_NS] {
        let result = sync.client_wait(&tc.renderer, None, false, timeout).unwrap();
        assert_eq!(result, vk::Result::SUCCESS);
    }

    sync.release(&tc.renderer);
}

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_created_fence_follows_flushed_work(#[case] mode: SubmissionMode) {
    let tc = TestContext::manual(mode);
    let mut ctx = tc.context();
    ctx.outside_render_pass_commands()
        .fill_buffer(buffer(1), 0, 4, 1);

    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, None).unwrap();
    assert!(!sync.get_status(&tc.renderer).unwrap());
    assert_eq!(
        sync.client_wait(&tc.renderer, Some(&mut ctx), true, 0).unwrap(),
        vk::Result::TIMEOUT
    );

    tc.settle();
    assert_eq!(tc.written_values(), vec![1]);
    assert!(sync.get_status(&tc.renderer).unwrap());

    sync.release(&tc.renderer);
}

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_imported_fd_signals_from_outside(#[case] mode: SubmissionMode) {
    let tc = TestContext::new(mode);
    let mut ctx = tc.context();
    let file = tc.device.create_sync_file().unwrap();
    let signal_handle = file.try_clone().unwrap();

    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, Some(file)).unwrap();
    assert!(!sync.get_status(&tc.renderer).unwrap());
    assert_eq!(
        sync.client_wait(&tc.renderer, None, false, 0).unwrap(),
        vk::Result::TIMEOUT
    );
    assert_eq!(
        sync.client_wait(&tc.renderer, None, false, 1_000_000).unwrap(),
        vk::Result::TIMEOUT
    );

    let device = tc.device.clone();
    let signaler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        assert!(device.signal_sync_file(signal_handle.as_fd()));
    });

    let result = sync
        .client_wait(&tc.renderer, None, false, 10 * ONE_SECOND_NS)
        .unwrap();
    assert_eq!(result, vk::Result::SUCCESS);
    signaler.join().unwrap();

    sync.release(&tc.renderer);
}

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_dup_tracks_fence_status(#[case] mode: SubmissionMode) {
    let tc = TestContext::new(mode);
    let mut ctx = tc.context();
    let file = tc.device.create_sync_file().unwrap();
    let signal_handle = file.try_clone().unwrap();

    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, Some(file)).unwrap();

    let dup = sync.dup_native_fence_fd().unwrap();
    assert_eq!(
        tc.device.is_sync_file_signaled(dup.as_fd()),
        Some(sync.get_status(&tc.renderer).unwrap())
    );

    tc.device.signal_sync_file(signal_handle.as_fd());
    assert!(sync.get_status(&tc.renderer).unwrap());
    assert_eq!(tc.device.is_sync_file_signaled(dup.as_fd()), Some(true));

    sync.release(&tc.renderer);
}

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_dups_are_independent(#[case] mode: SubmissionMode) {
    let tc = TestContext::new(mode);
    let mut ctx = tc.context();
    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, None).unwrap();

    let first = sync.dup_native_fence_fd().unwrap();
    let second = sync.dup_native_fence_fd().unwrap();
    drop(first);

    assert_eq!(tc.device.is_sync_file_signaled(second.as_fd()), Some(true));
    let third = sync.dup_native_fence_fd().unwrap();
    assert_eq!(tc.device.is_sync_file_signaled(third.as_fd()), Some(true));

    sync.release(&tc.renderer);
}

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_server_wait_on_external_fd(#[case] mode: SubmissionMode) {
    let tc = TestContext::manual(mode);
    let mut ctx = tc.context();
    let file = tc.device.create_sync_file().unwrap();
    let signal_handle = file.try_clone().unwrap();

    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, Some(file)).unwrap();

    ctx.outside_render_pass_commands()
        .fill_buffer(buffer(1), 0, 4, 1);
    sync.server_wait(&mut ctx).unwrap();
    ctx.outside_render_pass_commands()
        .fill_buffer(buffer(1), 0, 4, 2);
    ctx.flush().unwrap();

    // Work recorded before the wait is not held back.
    tc.settle();
    assert_eq!(tc.written_values(), vec![1]);

    tc.device.signal_sync_file(signal_handle.as_fd());
    tc.settle();
    assert_eq!(tc.written_values(), vec![1, 2]);

    sync.release(&tc.renderer);
}

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_server_wait_across_contexts(#[case] mode: SubmissionMode) {
    let tc = TestContext::manual(mode);
    let mut producer = tc.context();
    let mut consumer = tc.context();

    producer
        .outside_render_pass_commands()
        .fill_buffer(buffer(1), 0, 4, 1);
    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut producer, None).unwrap();

    sync.server_wait(&mut consumer).unwrap();
    consumer
        .outside_render_pass_commands()
        .fill_buffer(buffer(2), 0, 4, 2);
    consumer.flush().unwrap();

    tc.settle();
    assert_eq!(tc.written_values(), vec![1, 2]);

    sync.release(&tc.renderer);
}

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_failed_export_is_not_supported_afterwards(#[case] mode: SubmissionMode) {
    let tc = TestContext::new(mode);
    let mut ctx = tc.context();
    tc.device
        .inject_failure(SimulatedOp::ExportFenceFd, vk::Result::ERROR_OUT_OF_HOST_MEMORY);

    let mut sync = NativeFenceSync::new();
    let err = sync.initialize_with_fd(&mut ctx, None).unwrap_err();
    assert_eq!(err.device_result(), Some(vk::Result::ERROR_OUT_OF_HOST_MEMORY));

    assert!(sync.server_wait(&mut ctx).unwrap_err().is_not_supported());
    assert!(sync.dup_native_fence_fd().unwrap_err().is_not_supported());
    sync.release(&tc.renderer);
}

#[rstest]
#[case::direct(SubmissionMode::Direct)]
#[case::async_worker(SubmissionMode::Async)]
fn test_all_objects_reclaimed(#[case] mode: SubmissionMode) {
    let tc = TestContext::manual(mode);
    let mut producer = tc.context();
    let mut consumer = tc.context();

    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut producer, None).unwrap();
    sync.server_wait(&mut consumer).unwrap();
    consumer.flush().unwrap();
    sync.release(&tc.renderer);
    producer.flush().unwrap();

    tc.settle();
    tc.cleanup();
    assert_eq!(tc.renderer.pending_garbage(), 0);
    assert_eq!(tc.device.live_objects(), 0);
}

#[test]
#[should_panic(expected = "initialized twice")]
fn test_double_initialize_panics() {
    let tc = TestContext::new(SubmissionMode::Direct);
    let mut ctx = tc.context();
    let mut sync = NativeFenceSync::new();
    sync.initialize_with_fd(&mut ctx, None).unwrap();
    let _ = sync.initialize_with_fd(&mut ctx, None);
}
