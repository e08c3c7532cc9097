// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::queue::QueueShared;
use crate::{DispatchMode, ERR_POISONED_LOCK};

/// The identity of a shared queue: all lookups with the same triple receive the same queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ShareKey {
    pub id: u32,
    pub work_mode: DispatchMode,
    pub completion_mode: DispatchMode,
}

/// The process-wide share table holds weak references so it never keeps a queue alive by
/// itself; a queue's lifetime is governed entirely by handles and pending entries. Dead
/// entries are unlinked by the dropping queue and replaced on the next lookup.
fn table() -> &'static Mutex<HashMap<ShareKey, Weak<QueueShared>>> {
    static TABLE: OnceLock<Mutex<HashMap<ShareKey, Weak<QueueShared>>>> = OnceLock::new();

    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Looks up or creates the queue registered under `key`. The whole operation happens under
/// the table mutex, so a lookup that races a concurrent drop of the last handle observes
/// either the still-live queue or a fresh replacement, never a dangling one.
pub(crate) fn get_or_create(key: ShareKey) -> Arc<QueueShared> {
    let mut table = table().lock().expect(ERR_POISONED_LOCK);

    if let Some(existing) = table.get(&key).and_then(Weak::upgrade) {
        return existing;
    }

    let queue = QueueShared::new_standalone(key.work_mode, key.completion_mode, Some(key));
    table.insert(key, Arc::downgrade(&queue));
    queue
}

/// Unlinks `queue` from the table if it is still the registered entry for `key`. A queue
/// that lost the race against a replacement leaves the replacement in place.
pub(crate) fn unregister(key: ShareKey, queue: *const QueueShared) {
    let mut table = table().lock().expect(ERR_POISONED_LOCK);

    if table
        .get(&key)
        .is_some_and(|registered| ptr::eq(registered.as_ptr(), queue))
    {
        table.remove(&key);
    }
}

/// Returns a stable identifier for the calling thread, suitable as a share-table id.
///
/// Operations that need a default queue key it on this id so work started from the same
/// thread coalesces onto one queue. Ids are small, process-unique and never reused while the
/// process lives; they are unrelated to any OS thread id.
#[must_use]
pub fn current_thread_share_id() -> u32 {
    static NEXT_ID: AtomicU32 = AtomicU32::new(0);

    thread_local! {
        static SHARE_ID: u32 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }

    SHARE_ID.with(|id| *id)
}
