// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::OnceLock;

use threadpool::ThreadPool;

/// Returns the process-wide worker pool backing [`DispatchMode::Pool`][crate::DispatchMode].
///
/// The pool is created on first use and sized to the machine's available parallelism. Pool
/// sides submit one drain task per queued entry, so a drain that finds the side already
/// emptied by a sibling worker is normal and cheap.
pub(crate) fn global() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();

    POOL.get_or_init(|| {
        threadpool::Builder::new()
            .thread_name("dispatch-pool".to_string())
            .build()
    })
}
