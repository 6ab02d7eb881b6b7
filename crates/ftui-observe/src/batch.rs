#![forbid(unsafe_code)]

//! Batched execution of immediately-scheduled reactions.
//!
//! While a [`BatchScope`] is alive on the current thread, writes still
//! update values right away, but reactions that would re-run inline are
//! collected instead. They run once, in first-trigger order, when the
//! outermost scope is dropped.
//!
//! # Invariants
//!
//! 1. Nested scopes flush only when the outermost one closes.
//! 2. A reaction triggered several times inside a batch runs once.
//! 3. Reactions triggered by the flush itself join the same flush.
//! 4. Reactions with a collector or function scheduler are unaffected.
//!
//! # Failure Modes
//!
//! - **Scope dropped during a panic**: queued reactions are discarded rather
//!   than run while unwinding.
//! - **Reaction panics during the flush**: the panic propagates out of the
//!   outermost scope and the rest of the queue is discarded. Discarded
//!   reactions keep their dependencies and run on the next relevant write.

use std::cell::Cell;

use tracing::debug;

use crate::reaction::ReactionRef;
use crate::scheduler::{Collector, ReactionQueue};

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static BATCHED: ReactionQueue = ReactionQueue::new();
}

/// RAII guard deferring immediate reactions until the outermost scope ends.
#[must_use = "the batch ends when the scope is dropped"]
pub struct BatchScope {
    _private: (),
}

impl BatchScope {
    pub fn new() -> Self {
        DEPTH.with(|d| d.set(d.get() + 1));
        Self { _private: () }
    }

    /// Number of batch scopes currently open on this thread.
    #[must_use]
    pub fn depth() -> usize {
        DEPTH.try_with(Cell::get).unwrap_or(0)
    }
}

impl Default for BatchScope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BatchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScope")
            .field("depth", &Self::depth())
            .finish()
    }
}

/// Ends the outermost scope. When unwinding, whatever is still queued is
/// discarded, including entries left behind by a reaction that panicked
/// mid-flush.
struct CloseOnDrop;

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let _ = BATCHED.try_with(ReactionQueue::clear);
        }
        let _ = DEPTH.try_with(|d| d.set(0));
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        let Ok(depth) = DEPTH.try_with(Cell::get) else {
            return;
        };
        if depth > 1 {
            DEPTH.with(|d| d.set(depth - 1));
            return;
        }

        let _close = CloseOnDrop;
        if std::thread::panicking() {
            return;
        }
        // Depth stays at 1 while flushing so re-triggers are collected
        // into the same queue instead of running inline.
        let ran = BATCHED.try_with(ReactionQueue::flush).unwrap_or(0);
        if ran > 0 {
            debug!(reactions = ran, "batch flushed");
        }
    }
}

/// Run `f` inside a [`BatchScope`].
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    let _scope = BatchScope::new();
    f()
}

/// Collect `reaction` if a batch is open. Returns whether it was collected.
pub(crate) fn defer(reaction: &ReactionRef) -> bool {
    if BatchScope::depth() == 0 {
        return false;
    }
    BATCHED
        .try_with(|queue| queue.add(reaction.clone()))
        .is_ok()
}

/// Drop `reaction` from the pending batch.
pub(crate) fn forget(reaction: &ReactionRef) {
    let _ = BATCHED.try_with(|queue| queue.delete(reaction));
}
