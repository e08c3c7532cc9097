// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use dispatch_queue::QueueHandle;

use crate::{AsyncBlock, Error};

/// What a provider's work invocation reports back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// More work remains. The provider owns continuation: it either completes the operation
    /// asynchronously through [`AsyncBlock::complete`] or schedules itself again.
    Pending,

    /// The provider is done and has already completed the operation.
    Completed,

    /// The work failed; the operation is finalized with this error.
    Failed(Error),
}

/// The context handed to every provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderData {
    /// The block of the operation being driven.
    pub block: AsyncBlock,

    /// The queue the operation runs on. Never absent: operations begun without a queue run
    /// on a per-thread default queue.
    pub queue: QueueHandle,
}

/// The user-supplied state machine behind an asynchronous operation.
///
/// The dispatcher drives a provider through a fixed order: [`do_work`][Self::do_work] zero
/// or more times, at most one [`cancel`][Self::cancel] (after which `do_work` is not invoked
/// again), and exactly one [`cleanup`][Self::cleanup] when the operation's state is
/// released. `cancel` may race a `do_work` already running on another thread; providers must
/// tolerate that, and a `complete` issued by their own late work loses the terminal
/// transition harmlessly.
pub trait Provider: Send + Sync + 'static {
    /// Performs a unit of asynchronous work.
    ///
    /// Implementations either complete the operation (now or later) or report
    /// [`WorkStatus::Pending`] and arrange their own continuation.
    fn do_work(&self, data: &ProviderData) -> WorkStatus;

    /// Copies the operation's result payload into `buffer` and returns the number of bytes
    /// written. Only invoked after terminal success, with a buffer at least as large as the
    /// size reported to [`AsyncBlock::complete`].
    fn get_result(&self, data: &ProviderData, buffer: &mut [u8]) -> Result<usize, Error> {
        _ = data;
        _ = buffer;
        Err(Error::NoPayload)
    }

    /// Called exactly once if the operation is canceled while in flight.
    fn cancel(&self, data: &ProviderData) {
        _ = data;
    }

    /// Called when the operation's state is released; the provider frees whatever it owns.
    fn cleanup(&self, data: &ProviderData) {
        _ = data;
    }
}
