// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::{ERR_POISONED_LOCK, QueueHandle, SideKind};

/// Identifies a registered submission observer so it can later be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u32);

pub(crate) type SubmitObserver = Arc<dyn Fn(&QueueHandle, SideKind) + Send + Sync>;

/// The set of submission observers registered on one queue.
///
/// Reads vastly outnumber writes here (every submission fans out, registrations are rare), so
/// the entry list is kept in an `Arc` that writers replace wholesale under the mutex and
/// readers snapshot without blocking anyone. Observers therefore run against the registration
/// set as it was when the submission happened; a concurrent remove does not stop an in-flight
/// fan-out.
pub(crate) struct ObserverRegistry {
    entries: Mutex<Arc<Vec<(u32, SubmitObserver)>>>,
    next_token: AtomicU32,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Arc::new(Vec::new())),
            next_token: AtomicU32::new(0),
        }
    }

    pub fn add(&self, observer: SubmitObserver) -> ObserverToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.lock().expect(ERR_POISONED_LOCK);
        let mut replacement = (**entries).clone();
        replacement.push((token, observer));
        *entries = Arc::new(replacement);

        ObserverToken(token)
    }

    pub fn remove(&self, token: ObserverToken) {
        let mut entries = self.entries.lock().expect(ERR_POISONED_LOCK);
        let mut replacement = (**entries).clone();
        replacement.retain(|(existing, _)| *existing != token.0);
        *entries = Arc::new(replacement);
    }

    /// Invokes every registered observer, in registration order, on the calling thread.
    pub fn invoke(&self, queue: &QueueHandle, side: SideKind) {
        let snapshot = Arc::clone(&*self.entries.lock().expect(ERR_POISONED_LOCK));

        for (_, observer) in snapshot.iter() {
            observer(queue, side);
        }
    }
}

impl fmt::Debug for ObserverRegistry {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field(
                "entries",
                &self.entries.lock().expect(ERR_POISONED_LOCK).len(),
            )
            .finish()
    }
}
