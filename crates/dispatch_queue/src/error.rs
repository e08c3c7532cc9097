// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// An error reported when a submission could not be queued.
///
/// Submission bookkeeping rolls back completely before the error is returned: the entry is
/// unlinked, the queue reference it held is released, and the side looks as if the call never
/// happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SubmitError {
    /// The side dispatches to a pinned thread that has exited, so the cross-thread post can
    /// never be delivered.
    #[error("the pinned dispatch thread has exited and no longer accepts posts")]
    TargetThreadGone,
}

impl SubmitError {
    /// A stable OS-style code for callers that carry errors as raw numeric status words.
    #[must_use]
    pub const fn raw_os_code(self) -> i32 {
        match self {
            // ESRCH - no such process/thread.
            Self::TargetThreadGone => 3,
        }
    }
}
