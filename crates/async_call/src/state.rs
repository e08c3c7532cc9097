// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dispatch_queue::SubmissionTag;

use crate::provider::{Provider, ProviderData};
use crate::timer::DelayTimer;
use crate::{ERR_POISONED_LOCK, Event};

/// The per-operation state bound to an async block between begin and release.
///
/// There is exactly one `AsyncState` per live operation. It is reachable only through the
/// block's state slot; the slot going empty is the release. The state and the block
/// reference each other (`ProviderData` carries the block), which keeps both alive until
/// release breaks the loop by emptying the slot.
pub(crate) struct AsyncState {
    /// Distinguishes this operation's queued work from every other submission, so release
    /// can withdraw work that has not run yet.
    tag: SubmissionTag,

    provider: Arc<dyn Provider>,
    data: ProviderData,

    /// The completion event: the caller's, if one was supplied to the block, else freshly
    /// created. Set exactly when the status word turns terminal.
    event: Event,

    /// The identity the result consumer must present; whatever the initiator passed to
    /// begin.
    token: Option<u64>,

    /// The operation's origin, for diagnostics.
    label: Option<&'static str>,

    /// Guards against double-scheduling: set by schedule, cleared when the worker runs.
    work_scheduled: AtomicBool,

    /// The payload size recorded by complete; meaningful only after terminal success.
    result_size: AtomicUsize,

    /// Created lazily by the first delayed schedule, then reused for the operation's
    /// lifetime.
    timer: Mutex<Option<DelayTimer>>,
}

impl AsyncState {
    pub fn new(
        provider: Arc<dyn Provider>,
        data: ProviderData,
        event: Event,
        token: Option<u64>,
        label: Option<&'static str>,
    ) -> Self {
        Self {
            tag: next_tag(),
            provider,
            data,
            event,
            token,
            label,
            work_scheduled: AtomicBool::new(false),
            result_size: AtomicUsize::new(0),
            timer: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> SubmissionTag {
        self.tag
    }

    pub fn provider(&self) -> &dyn Provider {
        &*self.provider
    }

    pub fn data(&self) -> &ProviderData {
        &self.data
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn token(&self) -> Option<u64> {
        self.token
    }

    pub fn label(&self) -> Option<&'static str> {
        self.label
    }

    /// Attempts the not-scheduled to scheduled transition. Returns whether this caller won.
    pub fn try_mark_work_scheduled(&self) -> bool {
        self.work_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn clear_work_scheduled(&self) {
        self.work_scheduled.store(false, Ordering::SeqCst);
    }

    pub fn record_result_size(&self, size: usize) {
        self.result_size.store(size, Ordering::SeqCst);
    }

    pub fn result_size(&self) -> usize {
        self.result_size.load(Ordering::SeqCst)
    }

    /// Ensures the delay timer exists, creating it with `trampoline` on first use.
    pub fn ensure_timer(&self, trampoline: impl Fn() + Send + Sync + 'static) {
        let mut timer = self.timer.lock().expect(ERR_POISONED_LOCK);

        if timer.is_none() {
            *timer = Some(DelayTimer::new(trampoline));
        }
    }

    /// Arms the delay timer. Fails if the timer slot was already torn down, which means the
    /// operation is being released underneath the caller.
    pub fn arm_timer(&self, delay: std::time::Duration) -> bool {
        let timer = self.timer.lock().expect(ERR_POISONED_LOCK);

        match &*timer {
            Some(timer) => {
                timer.arm(delay);
                true
            }
            None => false,
        }
    }

    /// Takes the timer out and quiesces it: disarmed, and any in-flight fire finished.
    ///
    /// The timer slot is emptied before the wait so the quiescing never holds the slot lock;
    /// a fire that is concurrently releasing the operation takes the slot lock itself and
    /// must not find it held here. Once taken, later delayed schedules fail cleanly.
    pub fn take_and_quiesce_timer(&self) {
        let timer = self.timer.lock().expect(ERR_POISONED_LOCK).take();

        if let Some(timer) = timer {
            timer.disarm_and_wait();
        }
    }
}

fn next_tag() -> SubmissionTag {
    static NEXT: AtomicU64 = AtomicU64::new(1);

    SubmissionTag(NEXT.fetch_add(1, Ordering::Relaxed))
}

impl fmt::Debug for AsyncState {
    #[cfg_attr(test, mutants::skip)] // We have no contract to test here - can return anything.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncState")
            .field("tag", &self.tag)
            .field("label", &self.label)
            .field("work_scheduled", &self.work_scheduled.load(Ordering::Relaxed))
            .field("result_size", &self.result_size.load(Ordering::Relaxed))
            .finish()
    }
}
