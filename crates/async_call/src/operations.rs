// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dispatch_queue::{
    DispatchMode, QueueHandle, SideKind, SubmitError, current_thread_share_id,
};
use tracing::{Level, event};

use crate::provider::{Provider, ProviderData, WorkStatus};
use crate::state::AsyncState;
use crate::{AsyncBlock, ERR_POISONED_LOCK, Error, Event};

impl AsyncBlock {
    /// Binds a provider to this block and marks the operation pending.
    ///
    /// The operation runs on the block's queue if one was supplied, otherwise on the calling
    /// thread's default shared queue (pool work, completions pinned to this thread). After a
    /// successful begin, the provider is driven by [`schedule`][Self::schedule] and the
    /// operation observed through [`status`][Self::status] and the result calls.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the block is already bound to a live operation; that operation is
    /// not disturbed.
    pub fn begin(
        &self,
        provider: impl Provider,
        token: Option<u64>,
        label: Option<&'static str>,
    ) -> Result<(), Error> {
        self.begin_arc(Arc::new(provider), token, label)
    }

    fn begin_arc(
        &self,
        provider: Arc<dyn Provider>,
        token: Option<u64>,
        label: Option<&'static str>,
    ) -> Result<(), Error> {
        let event = self.wait_event().cloned().unwrap_or_else(Event::new);

        // Without an explicit queue, work goes to the pool and completions coalesce on the
        // thread that started the call.
        let queue = match self.queue() {
            Some(queue) => queue.clone(),
            None => QueueHandle::shared(
                current_thread_share_id(),
                DispatchMode::Pool,
                DispatchMode::Pinned,
            ),
        };

        let state = Arc::new(AsyncState::new(
            provider,
            ProviderData {
                block: self.clone(),
                queue,
            },
            event,
            token,
            label,
        ));

        self.bind_state(state)?;
        self.mark_pending();

        event!(Level::DEBUG, label, "began async operation");
        Ok(())
    }

    /// Schedules the provider's next work invocation, optionally after a delay.
    ///
    /// Calling this is how an operation makes progress; a provider that reports
    /// [`WorkStatus::Pending`] and relies on an external completion source needs no further
    /// scheduling. Each call must observe the previous scheduled work as having started.
    ///
    /// # Errors
    ///
    /// `InvalidArg` if the block is not bound to an operation; `InvalidState` if scheduled
    /// work is already outstanding; a submit error if the queue could not accept the work.
    pub fn schedule(&self, delay: Duration) -> Result<(), Error> {
        let Some(state) = self.state() else {
            return Err(Error::InvalidArg);
        };

        if !delay.is_zero() {
            let block = self.clone();
            state.ensure_timer(move || timer_trampoline(&block));
        }

        if !state.try_mark_work_scheduled() {
            return Err(Error::InvalidState);
        }

        if delay.is_zero() {
            submit_worker(&state)?;
            Ok(())
        } else if state.arm_timer(delay) {
            Ok(())
        } else {
            // The timer slot was torn down underneath us: the operation is being released.
            Err(Error::InvalidState)
        }
    }

    /// Finalizes the operation with `result` and the size of its result payload.
    ///
    /// Providers call this when their work is done; a `result` of `Err(Pending)` is illegal
    /// and ignored. Only the first finalization of an operation wins - a complete racing a
    /// cancel simply loses the exchange. If there is no payload (`required_size == 0`), or
    /// the operation had already been canceled, the operation's state is released
    /// immediately; otherwise it is retained for [`result`][Self::result].
    pub fn complete(&self, result: Result<(), Error>, required_size: usize) {
        if result == Err(Error::Pending) {
            debug_assert!(false, "complete may not be called with the pending sentinel");
            return;
        }

        let Some(state) = self.state() else {
            return;
        };

        let prior = self.finalize(result);

        if prior == Err(Error::Pending) {
            state.record_result_size(required_size);
            signal_completion(self, &state);
        }

        if required_size == 0 || prior == Err(Error::Aborted) {
            self.release_state();
        }
    }

    /// Cancels the operation.
    ///
    /// If the cancel wins the terminal transition: an armed delay timer is disarmed and
    /// quiesced, the provider observes exactly one `cancel` invocation and no further
    /// `do_work`, the status reads `Aborted`, the completion event and callback fire, and
    /// the state is released. A cancel that loses against a completion is a no-op.
    pub fn cancel(&self) {
        let prior = self.finalize(Err(Error::Aborted));

        if prior != Err(Error::Pending) {
            return;
        }

        let Some(state) = self.state() else {
            return;
        };

        state.take_and_quiesce_timer();
        state.provider().cancel(state.data());

        event!(Level::DEBUG, label = state.label(), "canceled async operation");

        signal_completion(self, &state);
        self.release_state();
    }

    /// Returns the operation's status; `Err(Pending)` means it is still in flight.
    ///
    /// With `wait` set, a pending status blocks on the completion event first and the
    /// terminal status is returned. Once terminal, the status is stable until the block is
    /// reused for a new operation.
    ///
    /// # Errors
    ///
    /// Besides the operation's own terminal failure: `InvalidArg` if the status is pending
    /// but the block is not bound to an operation.
    pub fn status(&self, wait: bool) -> Result<(), Error> {
        let status = self.load_status();

        if status != Err(Error::Pending) {
            return status;
        }

        let Some(state) = self.state() else {
            return Err(Error::InvalidArg);
        };

        if !wait {
            return status;
        }

        // Wait on a clone: the state (and its event handle) can be released by a completion
        // callback while we sleep, but the cloned event outlives that.
        let event = state.event().clone();
        drop(state);
        event.wait();

        self.load_status()
    }

    /// Returns the size of the operation's result payload.
    ///
    /// # Errors
    ///
    /// The operation's failure if it did not succeed, `Pending` while in flight, or
    /// `Unexpected` if the result was already consumed.
    pub fn result_size(&self) -> Result<usize, Error> {
        self.status(false)?;

        let Some(state) = self.state() else {
            return Err(Error::Unexpected);
        };

        Ok(state.result_size())
    }

    /// Consumes the operation's result by letting the provider fill `buffer`, and returns
    /// the number of bytes written.
    ///
    /// `token` must match the token passed to [`begin`][Self::begin], and `buffer` must be
    /// at least [`result_size`][Self::result_size] bytes. This call is destructive: on any
    /// outcome except `Pending` and `BufferTooSmall` - success, a failed operation, a token
    /// mismatch, a payload-free operation - the state is released and the block detaches
    /// from the operation. Callers that complete with a nonzero payload size must therefore
    /// either call this or accept that the state lives until the block is dropped.
    ///
    /// # Errors
    ///
    /// The operation's failure, `Pending` while in flight, `InvalidArg` on a token mismatch,
    /// `NoPayload` if the operation completed without a payload, `BufferTooSmall` if the
    /// buffer cannot hold the payload (the state is retained so the call can be retried).
    pub fn result(&self, token: Option<u64>, buffer: &mut [u8]) -> Result<usize, Error> {
        let status = self.status(false);
        let state = self.state();

        let outcome = match status {
            Err(Error::Pending) => return Err(Error::Pending),
            Err(error) => Err(error),
            Ok(()) => match &state {
                None => Err(Error::Unexpected),
                Some(state) if token != state.token() => {
                    event!(
                        Level::WARN,
                        label = state.label(),
                        "call/result mismatch: this result belongs to a different initiator"
                    );
                    Err(Error::InvalidArg)
                }
                Some(state) => {
                    let required = state.result_size();

                    if required == 0 {
                        Err(Error::NoPayload)
                    } else if buffer.len() < required {
                        return Err(Error::BufferTooSmall);
                    } else {
                        state.provider().get_result(state.data(), buffer)
                    }
                }
            },
        };

        if outcome == Err(Error::Pending) {
            return Err(Error::Pending);
        }

        if state.is_some() {
            self.release_state();
        }

        outcome
    }

    /// Tears the operation's state down: the provider cleans up, the delay timer quiesces,
    /// queued work that has not run yet is withdrawn, and the block detaches. Idempotent.
    pub(crate) fn release_state(&self) {
        let Some(state) = self.take_state() else {
            return;
        };

        state.provider().cleanup(state.data());
        state.take_and_quiesce_timer();

        // A scheduled worker that never ran must not fire against a released operation.
        let tag = state.tag();
        state
            .data()
            .queue
            .remove_matching(SideKind::Work, move |candidate| candidate == tag);

        event!(Level::DEBUG, label = state.label(), "released async operation");
    }
}

/// Queues the worker trampoline on the operation's work side.
fn submit_worker(state: &Arc<AsyncState>) -> Result<(), SubmitError> {
    let block = state.data().block.clone();

    state
        .data()
        .queue
        .submit_tagged(SideKind::Work, state.tag(), move || {
            worker_trampoline(&block);
        })
}

/// Runs on the work side: drives the provider and finalizes the operation if the provider
/// is done.
fn worker_trampoline(block: &AsyncBlock) {
    let Some(state) = block.state() else {
        return;
    };

    state.clear_work_scheduled();

    let outcome = state.provider().do_work(state.data());

    // Pending means the provider owns continuation: it completes asynchronously or
    // schedules again. Anything else finalizes here - and a provider that reports success
    // without having completed the operation is a bug surfaced as Unexpected.
    let status = match outcome {
        WorkStatus::Pending | WorkStatus::Failed(Error::Pending) => return,
        WorkStatus::Completed => Err(Error::Unexpected),
        WorkStatus::Failed(error) => Err(error),
    };

    if block.finalize(status) == Err(Error::Pending) {
        signal_completion(block, &state);
    }
}

/// Runs when a delayed schedule's timer fires: hands the operation to the work side.
fn timer_trampoline(block: &AsyncBlock) {
    let Some(state) = block.state() else {
        return;
    };

    if let Err(error) = submit_worker(&state) {
        block.complete(Err(error.into()), 0);
    }
}

/// Sets the completion event and fans the completion callback out to the queue's completion
/// side. Called exactly once per operation, by whoever won the terminal transition.
fn signal_completion(block: &AsyncBlock, state: &Arc<AsyncState>) {
    state.event().set();

    if block.has_completion_callback() {
        let callback_block = block.clone();

        // The entry captures its own block handle, so it stays valid even if the state is
        // released before the completion side drains.
        _ = state.data().queue.submit(SideKind::Completion, move || {
            callback_block.invoke_completion_callback();
        });
    }
}

/// Runs `work` asynchronously on the block's queue: a begin with a built-in provider that
/// invokes `work` once and completes with its result and no payload, followed by an
/// immediate schedule.
///
/// # Errors
///
/// Whatever [`begin`][AsyncBlock::begin] or [`schedule`][AsyncBlock::schedule] reports.
pub fn run_async(
    block: &AsyncBlock,
    work: impl FnOnce(&AsyncBlock) -> Result<(), Error> + Send + 'static,
) -> Result<(), Error> {
    struct RunAsyncProvider {
        work: Mutex<Option<Box<dyn FnOnce(&AsyncBlock) -> Result<(), Error> + Send>>>,
    }

    impl Provider for RunAsyncProvider {
        fn do_work(&self, data: &ProviderData) -> WorkStatus {
            let work = self.work.lock().expect(ERR_POISONED_LOCK).take();

            if let Some(work) = work {
                let result = work(&data.block);
                data.block.complete(result, 0);
            }

            WorkStatus::Completed
        }
    }

    block.begin(
        RunAsyncProvider {
            work: Mutex::new(Some(Box::new(work))),
        },
        None,
        Some("run_async"),
    )?;

    block.schedule(Duration::ZERO)
}
