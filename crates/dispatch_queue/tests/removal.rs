// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Targeted removal of pending submissions by tag.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dispatch_queue::{DispatchMode, QueueHandle, SideKind, SubmissionTag};

const GROUP_A: u64 = 0xA;
const GROUP_B: u64 = 0xB;

fn submit_counting(
    queue: &QueueHandle,
    tag: u64,
    counters: &mut Vec<Arc<AtomicUsize>>,
) {
    let counter = Arc::new(AtomicUsize::new(0));
    counters.push(Arc::clone(&counter));

    queue
        .submit_tagged(SideKind::Work, SubmissionTag(tag), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("manual submission cannot fail");
}

#[test]
fn remove_matching_removes_exactly_the_predicated_group() {
    // Five entries from each of two groups are interleaved; removing group B leaves the five
    // group A entries, which then all run.

    let queue = QueueHandle::new(DispatchMode::Manual, DispatchMode::Manual);
    let mut group_a = Vec::new();
    let mut group_b = Vec::new();

    for _ in 0..5 {
        submit_counting(&queue, GROUP_A, &mut group_a);
        submit_counting(&queue, GROUP_B, &mut group_b);
    }

    queue.remove_matching(SideKind::Work, |tag| tag == SubmissionTag(GROUP_B));

    let mut dispatched = 0;
    while queue.dispatch_one(SideKind::Work, Duration::ZERO) {
        dispatched += 1;
    }

    assert_eq!(dispatched, 5);
    assert!(group_a.iter().all(|counter| counter.load(Ordering::SeqCst) == 1));
    assert!(group_b.iter().all(|counter| counter.load(Ordering::SeqCst) == 0));
}

#[test]
fn remove_matching_never_touches_untagged_entries() {
    let queue = QueueHandle::new(DispatchMode::Manual, DispatchMode::Manual);
    let ran = Arc::new(AtomicUsize::new(0));

    queue
        .submit(SideKind::Work, {
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("manual submission cannot fail");

    // A predicate that matches everything still only sees tagged entries.
    queue.remove_matching(SideKind::Work, |_tag| true);

    assert!(queue.dispatch_one(SideKind::Work, Duration::ZERO));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn removal_preserves_order_of_survivors() {
    let queue = QueueHandle::new(DispatchMode::Manual, DispatchMode::Manual);
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for index in 0_u64..6 {
        let order = Arc::clone(&order);
        let tag = if index % 2 == 0 { GROUP_A } else { GROUP_B };
        queue
            .submit_tagged(SideKind::Work, SubmissionTag(tag), move || {
                order.lock().expect("no panics in callbacks").push(index);
            })
            .expect("manual submission cannot fail");
    }

    queue.remove_matching(SideKind::Work, |tag| tag == SubmissionTag(GROUP_A));

    while queue.dispatch_one(SideKind::Work, Duration::ZERO) {}

    assert_eq!(*order.lock().expect("no panics in callbacks"), vec![1, 3, 5]);
}

#[test]
fn removing_everything_leaves_an_empty_side() {
    let queue = QueueHandle::new(DispatchMode::Manual, DispatchMode::Manual);
    let mut counters = Vec::new();

    for _ in 0..3 {
        submit_counting(&queue, GROUP_A, &mut counters);
    }

    queue.remove_matching(SideKind::Work, |_tag| true);

    assert!(queue.is_empty(SideKind::Work));
    assert!(!queue.dispatch_one(SideKind::Work, Duration::ZERO));
    assert!(counters.iter().all(|counter| counter.load(Ordering::SeqCst) == 0));
}

#[test]
fn removal_on_a_pinned_side_flushes_the_stale_drain_post() {
    // Submitting to a pinned side posts a drain task at this thread. Removing the only entry
    // from the pinned thread itself must also flush that stale post, so the side is ready
    // for the next submission cycle.

    let queue = QueueHandle::new(DispatchMode::Pinned, DispatchMode::Manual);
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    queue
        .submit_tagged(SideKind::Work, SubmissionTag(GROUP_A), {
            let first = Arc::clone(&first);
            move || {
                first.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("own thread accepts posts");

    queue.remove_matching(SideKind::Work, |tag| tag == SubmissionTag(GROUP_A));
    assert!(queue.is_empty(SideKind::Work));
    assert_eq!(first.load(Ordering::SeqCst), 0);

    // A fresh submission posts a fresh drain; an alertable sleep runs it.
    queue
        .submit(SideKind::Work, {
            let second = Arc::clone(&second);
            move || {
                second.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("own thread accepts posts");

    assert!(dispatch_queue::alertable_sleep(Duration::ZERO));
    assert_eq!(second.load(Ordering::SeqCst), 1);
}
