// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Refcounted two-sided callback queues with pluggable dispatch policies.
//!
//! A [`QueueHandle`] names a queue with two independent FIFO sides - [work][SideKind::Work]
//! and [completion][SideKind::Completion] - each governed by its own [`DispatchMode`]:
//! drained explicitly ([`Manual`][DispatchMode::Manual]), delivered to the thread that
//! created the side while it sleeps alertably ([`Pinned`][DispatchMode::Pinned]), or
//! delivered to a shared worker pool ([`Pool`][DispatchMode::Pool]).
//!
//! Queues are refcounted: handles clone freely, pending callbacks keep their queue alive,
//! and the queue is destroyed when the last reference drops. Queues can also be
//! [shared][QueueHandle::shared] process-wide under a stable key, or
//! [nested][QueueHandle::nested] so that a child funnels everything through its parent's
//! work side.

// Public API surface.
mod error;
mod mode;
mod observers;
mod queue;
mod side_queue;

pub use error::*;
pub use mode::*;
pub use observers::ObserverToken;
pub use queue::QueueHandle;
pub use side_queue::SubmissionTag;

// Internal to the crate but re-exported at crate root for reduced hassle.
mod constants;
mod pool;
mod signal;

pub(crate) use constants::ERR_POISONED_LOCK;

// Not re-exported wholesale because the module name is an important identifying factor.
mod pinned;
mod share;

pub use pinned::alertable_sleep;
pub use share::current_thread_share_id;
