// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Share-table identity: equal triples coalesce onto one queue, differing triples do not,
//! and a fully released key is reborn as a fresh queue.
//!
//! The share table is process-wide, so every test here uses its own id range.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dispatch_queue::{DispatchMode, QueueHandle, SideKind, current_thread_share_id};

#[test]
fn equal_triples_return_the_same_queue() {
    let first = QueueHandle::shared(9100, DispatchMode::Manual, DispatchMode::Manual);
    let second = QueueHandle::shared(9100, DispatchMode::Manual, DispatchMode::Manual);

    assert!(first.ptr_eq(&second));
}

#[test]
fn differing_triples_return_distinct_queues() {
    let base = QueueHandle::shared(9200, DispatchMode::Pool, DispatchMode::Manual);
    let other_id = QueueHandle::shared(9201, DispatchMode::Pool, DispatchMode::Manual);
    let other_work = QueueHandle::shared(9200, DispatchMode::Manual, DispatchMode::Manual);
    let other_completion = QueueHandle::shared(9200, DispatchMode::Pool, DispatchMode::Pool);

    assert!(!base.ptr_eq(&other_id));
    assert!(!base.ptr_eq(&other_work));
    assert!(!base.ptr_eq(&other_completion));
    assert!(!other_work.ptr_eq(&other_completion));
}

#[test]
fn shared_queue_survives_while_any_reference_remains() {
    let first = QueueHandle::shared(9300, DispatchMode::Manual, DispatchMode::Manual);
    let second = QueueHandle::shared(9300, DispatchMode::Manual, DispatchMode::Manual);
    let third = first.clone();

    drop(first);
    drop(third);

    // One lookup handle is still alive, so the key still resolves to the same queue.
    let fourth = QueueHandle::shared(9300, DispatchMode::Manual, DispatchMode::Manual);
    assert!(second.ptr_eq(&fourth));
}

#[test]
fn released_key_is_reborn_as_a_fresh_queue() {
    // We mark the first incarnation with an observer. After every handle drops, the next
    // lookup must produce a queue that no longer carries the mark.

    let observed = Arc::new(AtomicUsize::new(0));

    let original = QueueHandle::shared(9400, DispatchMode::Manual, DispatchMode::Manual);
    _ = original.add_submit_observer({
        let observed = Arc::clone(&observed);
        move |_queue, _side| {
            observed.fetch_add(1, Ordering::SeqCst);
        }
    });

    original
        .submit(SideKind::Work, || {})
        .expect("manual submission cannot fail");
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    // Drain before dropping; a pending entry would keep the incarnation alive.
    assert!(original.dispatch_one(SideKind::Work, Duration::ZERO));
    drop(original);

    let reborn = QueueHandle::shared(9400, DispatchMode::Manual, DispatchMode::Manual);
    reborn
        .submit(SideKind::Work, || {})
        .expect("manual submission cannot fail");

    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert!(reborn.dispatch_one(SideKind::Work, Duration::ZERO));
}

#[test]
fn thread_share_id_keys_a_usable_queue() {
    let queue = QueueHandle::shared(
        current_thread_share_id(),
        DispatchMode::Manual,
        DispatchMode::Manual,
    );
    let again = QueueHandle::shared(
        current_thread_share_id(),
        DispatchMode::Manual,
        DispatchMode::Manual,
    );

    assert!(queue.ptr_eq(&again));
}
