// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cancellation: exactly one cancel invocation, no further work, aborted status fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_call::{AsyncBlock, Error, Event, Provider, ProviderData, WorkStatus};
use dispatch_queue::{DispatchMode, QueueHandle, SideKind};

/// Counts every lifecycle invocation it receives.
#[derive(Default)]
struct RecordingProvider {
    work_calls: Arc<AtomicUsize>,
    cancel_calls: Arc<AtomicUsize>,
    cleanup_calls: Arc<AtomicUsize>,
}

impl Provider for RecordingProvider {
    fn do_work(&self, _data: &ProviderData) -> WorkStatus {
        self.work_calls.fetch_add(1, Ordering::SeqCst);
        WorkStatus::Pending
    }

    fn cancel(&self, _data: &ProviderData) {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn cleanup(&self, _data: &ProviderData) {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn manual_queue() -> QueueHandle {
    QueueHandle::new(DispatchMode::Manual, DispatchMode::Manual)
}

#[test]
fn cancel_before_a_delayed_fire_reaches_the_provider_once() {
    // Begin plus a one-second delayed schedule, canceled long before the timer fires: the
    // provider sees exactly one cancel and no work, the event signals, and the completion
    // callback observes the aborted status.

    let queue = manual_queue();
    let event = Event::new();
    let observed_status = Arc::new(std::sync::Mutex::new(None));

    let provider = RecordingProvider::default();
    let work_calls = Arc::clone(&provider.work_calls);
    let cancel_calls = Arc::clone(&provider.cancel_calls);
    let cleanup_calls = Arc::clone(&provider.cleanup_calls);

    let block = AsyncBlock::builder()
        .queue(queue.clone())
        .wait_event(event.clone())
        .completion_callback({
            let observed_status = Arc::clone(&observed_status);
            move |block| {
                *observed_status.lock().expect("no panics in callbacks") =
                    Some(block.status(false));
            }
        })
        .build();

    block
        .begin(provider, None, Some("cancel_test"))
        .expect("begin succeeds on an unbound block");
    block
        .schedule(Duration::from_secs(1))
        .expect("delayed schedule succeeds");

    block.cancel();

    assert_eq!(block.status(false), Err(Error::Aborted));
    assert!(event.is_set());
    assert_eq!(cancel_calls.load(Ordering::SeqCst), 1);
    assert_eq!(work_calls.load(Ordering::SeqCst), 0);
    assert_eq!(cleanup_calls.load(Ordering::SeqCst), 1);

    // The completion callback is queued on the completion side; drain it.
    assert!(queue.dispatch_one(SideKind::Completion, Duration::ZERO));
    assert_eq!(
        *observed_status.lock().expect("no panics in callbacks"),
        Some(Err(Error::Aborted))
    );

    // The timer never fires: no late worker shows up on the work side.
    std::thread::sleep(Duration::from_millis(50));
    assert!(queue.is_empty(SideKind::Work));
}

#[test]
fn cancel_withdraws_already_queued_work() {
    // The worker is already sitting in the manual work side when the cancel lands; release
    // removes it, so a later dispatch finds nothing and the provider never runs.

    let queue = manual_queue();

    let provider = RecordingProvider::default();
    let work_calls = Arc::clone(&provider.work_calls);
    let cancel_calls = Arc::clone(&provider.cancel_calls);

    let block = AsyncBlock::builder().queue(queue.clone()).build();
    block
        .begin(provider, None, None)
        .expect("begin succeeds on an unbound block");
    block
        .schedule(Duration::ZERO)
        .expect("schedule succeeds on a manual queue");

    assert!(!queue.is_empty(SideKind::Work));

    block.cancel();

    assert!(queue.is_empty(SideKind::Work));
    assert!(!queue.dispatch_one(SideKind::Work, Duration::ZERO));
    assert_eq!(work_calls.load(Ordering::SeqCst), 0);
    assert_eq!(cancel_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    struct CompletingProvider;

    impl Provider for CompletingProvider {
        fn do_work(&self, data: &ProviderData) -> WorkStatus {
            data.block.complete(Ok(()), 0);
            WorkStatus::Completed
        }
    }

    let queue = manual_queue();
    let block = AsyncBlock::builder().queue(queue.clone()).build();
    block
        .begin(CompletingProvider, None, None)
        .expect("begin succeeds on an unbound block");
    block
        .schedule(Duration::ZERO)
        .expect("schedule succeeds on a manual queue");

    assert!(queue.dispatch_one(SideKind::Work, Duration::ZERO));
    assert_eq!(block.status(false), Ok(()));

    // The completion already won the terminal transition; cancel loses and changes nothing.
    block.cancel();
    assert_eq!(block.status(false), Ok(()));
}

#[test]
fn cancel_of_an_unbound_block_is_harmless() {
    let block = AsyncBlock::new();

    block.cancel();

    // The block was never begun; its status still reads as the fresh terminal default.
    assert_eq!(block.status(false), Ok(()));
}

#[test]
fn completion_after_cancel_loses_the_exchange() {
    // A provider that completes from its own code after the operation was canceled must not
    // overwrite the aborted status.

    let queue = manual_queue();

    let provider = RecordingProvider::default();
    let block = AsyncBlock::builder().queue(queue.clone()).build();
    block
        .begin(provider, None, None)
        .expect("begin succeeds on an unbound block");

    block.cancel();
    assert_eq!(block.status(false), Err(Error::Aborted));

    block.complete(Ok(()), 0);
    assert_eq!(block.status(false), Err(Error::Aborted));
}
