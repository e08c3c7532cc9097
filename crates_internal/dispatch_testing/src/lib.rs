// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Private test support for the TaskRelay test suites: a shared timeout, a watchdog
//! execution helper and tracing bootstrap. Everything here is unstable and for internal
//! consumption only.

use std::sync::Once;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// If something (whatever) does not happen in a test within this time, the test will fail.
///
/// We are conservative here and allow much time - this is only to break out of infinite
/// loops, not for any situations that are actually expected.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes a thread-safe function on a background thread and abandons it if it does not
/// complete before [`TEST_TIMEOUT`].
///
/// Returns `None` if the function timed out or panicked; the abandoned thread is left to
/// its fate, which is acceptable in a test process.
#[must_use]
pub fn execute_or_abandon<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (sender, receiver) = mpsc::channel();

    // There are multiple ways for the called function to fail:
    // 1. It fails to finish in the allowed time span.
    // 2. It panics, so the result is never sent.
    //
    // In both cases, the channel will get closed and recv_timeout will signal an error
    // saying the channel is broken.
    drop(thread::spawn(move || {
        let result = f();
        _ = sender.send(result);
    }));

    receiver.recv_timeout(TEST_TIMEOUT).ok()
}

/// Spins until `predicate` holds or [`TEST_TIMEOUT`] elapses; returns whether it held.
///
/// For asserting on the side effects of work that lands on pool threads at a time we do not
/// control.
pub fn eventually(mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;

    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }

        thread::sleep(Duration::from_millis(1));
    }

    predicate()
}

/// Installs a process-wide tracing subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call installs anything.
pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
