// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use dispatch_queue::SubmitError;
use thiserror::Error;

/// The status vocabulary of an asynchronous operation.
///
/// An operation's observable status is a `Result<(), Error>`: `Ok(())` is terminal success,
/// [`Error::Pending`] is the in-flight sentinel, and every other variant is a terminal
/// failure. Once a status is terminal it never changes again (until the operation's state is
/// released and the block is reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation has not completed yet. This is a sentinel, not a failure.
    #[error("the operation has not completed yet")]
    Pending,

    /// The operation was canceled.
    #[error("the operation was canceled")]
    Aborted,

    /// An argument was invalid (wrong result token, operation not bound, bad handle).
    #[error("an argument was invalid")]
    InvalidArg,

    /// The call arrived in a state that does not permit it (work already scheduled, block
    /// already bound to a live operation).
    #[error("the operation is not in a valid state for this call")]
    InvalidState,

    /// An allocation failed. Core paths cannot produce this; it exists for transport
    /// providers that carry their own allocators.
    #[error("out of memory")]
    OutOfMemory,

    /// The caller's buffer is smaller than the operation's result payload.
    #[error("the result buffer is too small")]
    BufferTooSmall,

    /// The operation completed without a result payload.
    #[error("the operation has no result payload")]
    NoPayload,

    /// The provider broke its contract, for example by reporting success without completing
    /// the operation.
    #[error("the provider behaved unexpectedly")]
    Unexpected,

    /// A wrapped platform error code.
    #[error("os error {0}")]
    Os(i32),
}

impl From<SubmitError> for Error {
    fn from(error: SubmitError) -> Self {
        Self::Os(error.raw_os_code())
    }
}

/// Bit packing of `Result<(), Error>` into the `u64` status word of an async block.
///
/// The terminal transition of an operation is a single compare-and-swap on this word, so the
/// whole status - including an OS code payload - must fit one atomic cell. The low half
/// holds the discriminant, the high half the OS code.
pub(crate) mod bits {
    use super::Error;

    pub const OK: u64 = 0;
    pub const PENDING: u64 = 1;
    const ABORTED: u64 = 2;
    const INVALID_ARG: u64 = 3;
    const INVALID_STATE: u64 = 4;
    const OUT_OF_MEMORY: u64 = 5;
    const BUFFER_TOO_SMALL: u64 = 6;
    const NO_PAYLOAD: u64 = 7;
    const UNEXPECTED: u64 = 8;
    const OS: u64 = 9;

    pub fn encode(status: Result<(), Error>) -> u64 {
        match status {
            Ok(()) => OK,
            Err(Error::Pending) => PENDING,
            Err(Error::Aborted) => ABORTED,
            Err(Error::InvalidArg) => INVALID_ARG,
            Err(Error::InvalidState) => INVALID_STATE,
            Err(Error::OutOfMemory) => OUT_OF_MEMORY,
            Err(Error::BufferTooSmall) => BUFFER_TOO_SMALL,
            Err(Error::NoPayload) => NO_PAYLOAD,
            Err(Error::Unexpected) => UNEXPECTED,
            Err(Error::Os(code)) => OS | (u64::from(code.cast_unsigned()) << 32),
        }
    }

    pub fn decode(bits: u64) -> Result<(), Error> {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "the high half is the OS code payload by construction"
        )]
        let os_code = ((bits >> 32) as u32).cast_signed();

        match bits & 0xFFFF_FFFF {
            OK => Ok(()),
            PENDING => Err(Error::Pending),
            ABORTED => Err(Error::Aborted),
            INVALID_ARG => Err(Error::InvalidArg),
            INVALID_STATE => Err(Error::InvalidState),
            OUT_OF_MEMORY => Err(Error::OutOfMemory),
            BUFFER_TOO_SMALL => Err(Error::BufferTooSmall),
            NO_PAYLOAD => Err(Error::NoPayload),
            UNEXPECTED => Err(Error::Unexpected),
            OS => Err(Error::Os(os_code)),
            _ => Err(Error::Unexpected),
        }
    }
}
