#![forbid(unsafe_code)]

//! Scheduling: what happens to a reaction once one of its dependencies
//! changed.
//!
//! A triggered reaction is handed to its *effective* scheduler: the one it
//! was created with, else the thread's global scheduler (see
//! [`configure`]). The default, [`Scheduler::Immediate`], re-runs the
//! reaction inline with the write. The other variants defer:
//!
//! - [`Scheduler::Collector`] adds the reaction to a set-like collector
//!   (for example a [`ReactionQueue`]) that the caller flushes later;
//! - [`Scheduler::Function`] hands the reaction to a callback that decides
//!   when to run it.
//!
//! # Invariants
//!
//! 1. Disposed reactions are never handed to a scheduler.
//! 2. A [`ReactionQueue`] holds each reaction at most once, at the position
//!    of its first trigger.
//! 3. A reaction's own scheduler wins over the global one for its whole
//!    lifetime.
//!
//! # Failure Modes
//!
//! - **Panicking reaction during flush**: the panic propagates out of
//!   [`ReactionQueue::flush`]; reactions not yet run stay queued.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexSet;
use tracing::debug;

use crate::batch;
use crate::operation::Operation;
use crate::reaction::ReactionRef;

/// A set-like sink for deferred reactions.
pub trait Collector {
    /// Queue a triggered reaction. Adding a queued reaction again is a no-op.
    fn add(&self, reaction: ReactionRef);

    /// Remove a reaction, returning whether it was queued.
    fn delete(&self, reaction: &ReactionRef) -> bool;
}

/// Notification strategy for triggered reactions.
#[derive(Clone, Default)]
pub enum Scheduler {
    /// Run inline with the triggering write.
    #[default]
    Immediate,
    Collector(Rc<dyn Collector>),
    Function(Rc<dyn Fn(ReactionRef)>),
}

impl Scheduler {
    /// Scheduler backed by a shared collector.
    pub fn collector<C: Collector + 'static>(collector: &Rc<C>) -> Self {
        Self::Collector(Rc::clone(collector) as Rc<dyn Collector>)
    }

    /// Scheduler that hands every triggered reaction to `f`.
    pub fn function(f: impl Fn(ReactionRef) + 'static) -> Self {
        Self::Function(Rc::new(f))
    }

    #[must_use]
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("Immediate"),
            Self::Collector(_) => f.write_str("Collector(..)"),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// ReactionQueue
// ---------------------------------------------------------------------------

/// Insertion-ordered, deduplicating reaction collector.
#[derive(Default)]
pub struct ReactionQueue {
    pending: RefCell<IndexSet<ReactionRef, RandomState>>,
}

impl ReactionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    #[must_use]
    pub fn contains(&self, reaction: &ReactionRef) -> bool {
        self.pending.borrow().contains(reaction)
    }

    /// Snapshot of the queued reactions, in run order.
    #[must_use]
    pub fn pending(&self) -> Vec<ReactionRef> {
        self.pending.borrow().iter().cloned().collect()
    }

    /// Run queued reactions front to back until the queue is empty.
    ///
    /// Reactions queued while flushing run in the same flush. Entries
    /// disposed since they were queued are dropped without running. Returns
    /// how many reactions were run.
    ///
    /// A panicking reaction unwinds out of `flush`; it is already dequeued,
    /// and the entries behind it stay queued.
    pub fn flush(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.pending.borrow_mut().shift_remove_index(0);
            let Some(reaction) = next else { break };
            if reaction.run_scheduled() {
                ran += 1;
            }
        }
        ran
    }

    /// Drop every queued reaction without running it.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.pending.borrow_mut());
        drop(drained);
    }
}

impl Collector for ReactionQueue {
    fn add(&self, reaction: ReactionRef) {
        self.pending.borrow_mut().insert(reaction);
    }

    fn delete(&self, reaction: &ReactionRef) -> bool {
        let removed = self.pending.borrow_mut().shift_take(reaction);
        removed.is_some()
    }
}

impl fmt::Debug for ReactionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.try_borrow().map(|p| p.len()).ok();
        f.debug_struct("ReactionQueue")
            .field("pending", &pending)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Global configuration
// ---------------------------------------------------------------------------

/// Global engine configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Scheduler for reactions created without one. `None` keeps the
    /// current global scheduler.
    pub scheduler: Option<Scheduler>,
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

thread_local! {
    static GLOBAL_SCHEDULER: RefCell<Scheduler> = RefCell::new(Scheduler::Immediate);
}

/// Apply `config` to the current thread.
pub fn configure(config: Config) {
    if let Some(scheduler) = config.scheduler {
        debug!(scheduler = ?scheduler, "global scheduler configured");
        let previous = GLOBAL_SCHEDULER
            .try_with(|slot| std::mem::replace(&mut *slot.borrow_mut(), scheduler));
        drop(previous);
    }
}

/// Restore the default immediate scheduler.
pub fn reset_global_config() {
    configure(Config::new().scheduler(Scheduler::Immediate));
}

/// The current thread's global scheduler.
#[must_use]
pub fn global_scheduler() -> Scheduler {
    GLOBAL_SCHEDULER
        .try_with(|slot| slot.borrow().clone())
        .unwrap_or_default()
}

pub(crate) fn effective_scheduler(reaction: &ReactionRef) -> Scheduler {
    match reaction.core().scheduler() {
        Some(own) => own.clone(),
        None => global_scheduler(),
    }
}

/// Hand a triggered reaction to its scheduler.
pub(crate) fn queue_reaction(reaction: ReactionRef, operation: &Operation) {
    if reaction.is_disposed() {
        return;
    }
    if let Some(debugger) = reaction.core().debugger() {
        let debugger = Rc::clone(debugger);
        debugger(operation);
    }
    match effective_scheduler(&reaction) {
        Scheduler::Immediate => {
            if !batch::defer(&reaction) {
                reaction.run_scheduled();
            }
        }
        Scheduler::Collector(collector) => collector.add(reaction),
        Scheduler::Function(f) => f(reaction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::observable;
    use crate::reaction::{ObserveOptions, observe, observe_with, unobserve};
    use crate::target::Target;
    use std::cell::Cell;

    struct ResetOnDrop;

    impl Drop for ResetOnDrop {
        fn drop(&mut self) {
            reset_global_config();
        }
    }

    #[test]
    fn default_scheduler_is_immediate() {
        assert!(global_scheduler().is_immediate());
    }

    #[test]
    fn queue_collapses_duplicate_triggers() {
        let _reset = ResetOnDrop;
        let queue = Rc::new(ReactionQueue::new());
        configure(Config::new().scheduler(Scheduler::collector(&queue)));

        let state = observable(&Target::object_from([("a", 1), ("b", 1)]));
        let runs = Rc::new(Cell::new(0));
        let (s, r) = (state.clone(), Rc::clone(&runs));
        let reaction = observe(move || {
            r.set(r.get() + 1);
            let _ = s.get("a");
            let _ = s.get("b");
        });
        assert_eq!(runs.get(), 1);

        state.set("a", 2).unwrap();
        state.set("b", 2).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&reaction.to_ref()));
        assert_eq!(runs.get(), 1);

        assert_eq!(queue.flush(), 1);
        assert_eq!(runs.get(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn own_scheduler_wins_over_global() {
        let _reset = ResetOnDrop;
        let global = Rc::new(ReactionQueue::new());
        configure(Config::new().scheduler(Scheduler::collector(&global)));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let state = observable(&Target::object_from([("a", 1)]));
        let s = state.clone();
        let reaction = observe_with(
            move || s.get("a"),
            ObserveOptions::new().scheduler(Scheduler::function(move |r| sink.borrow_mut().push(r))),
        );

        state.set("a", 2).unwrap();
        assert!(global.is_empty());
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0], reaction.to_ref());
    }

    #[test]
    fn unobserve_removes_from_collector() {
        let _reset = ResetOnDrop;
        let queue = Rc::new(ReactionQueue::new());
        configure(Config::new().scheduler(Scheduler::collector(&queue)));

        let state = observable(&Target::object_from([("a", 1)]));
        let s = state.clone();
        let reaction = observe(move || s.get("a"));
        state.set("a", 2).unwrap();
        assert_eq!(queue.len(), 1);

        unobserve(&reaction);
        assert!(queue.is_empty());
        assert_eq!(queue.flush(), 0);
    }

    #[test]
    fn stale_collector_never_runs_a_disposed_reaction() {
        let _reset = ResetOnDrop;
        let old = Rc::new(ReactionQueue::new());
        configure(Config::new().scheduler(Scheduler::collector(&old)));

        let state = observable(&Target::object_from([("a", 1)]));
        let runs = Rc::new(Cell::new(0));
        let (s, r) = (state.clone(), Rc::clone(&runs));
        let reaction = observe(move || {
            r.set(r.get() + 1);
            s.get("a")
        });
        state.set("a", 2).unwrap();
        assert_eq!(old.len(), 1);

        // The queue that holds the entry is no longer the effective one.
        let fresh = Rc::new(ReactionQueue::new());
        configure(Config::new().scheduler(Scheduler::collector(&fresh)));
        unobserve(&reaction);

        assert_eq!(old.flush(), 0);
        assert!(old.is_empty());
        assert_eq!(runs.get(), 1);
        assert_eq!(reaction.run_count(), 1);
    }

    #[test]
    fn reactions_queued_during_flush_run_in_same_flush() {
        let _reset = ResetOnDrop;
        let queue = Rc::new(ReactionQueue::new());
        configure(Config::new().scheduler(Scheduler::collector(&queue)));

        let state = observable(&Target::object_from([("a", 1), ("b", 1)]));
        let (s1, s2) = (state.clone(), state.clone());
        let b_runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&b_runs);
        let _writer = observe(move || {
            let a = s1.get("a").as_i64().unwrap_or(0);
            s1.set("b", a * 10).unwrap();
        });
        let _reader = observe(move || {
            counter.set(counter.get() + 1);
            s2.get("b")
        });
        assert_eq!(queue.len(), 0);

        state.set("a", 2).unwrap();
        assert_eq!(queue.flush(), 2);
        assert_eq!(b_runs.get(), 2);
        assert_eq!(state.get("b").as_i64(), Some(20));
    }

    #[test]
    fn clear_discards_without_running() {
        let _reset = ResetOnDrop;
        let queue = Rc::new(ReactionQueue::new());
        configure(Config::new().scheduler(Scheduler::collector(&queue)));
        let state = observable(&Target::object_from([("a", 1)]));
        let runs = Rc::new(Cell::new(0));
        let (s, r) = (state.clone(), Rc::clone(&runs));
        let _reaction = observe(move || {
            r.set(r.get() + 1);
            s.get("a")
        });
        state.set("a", 2).unwrap();
        queue.clear();
        assert_eq!(queue.flush(), 0);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn reset_restores_immediate() {
        configure(Config::new().scheduler(Scheduler::function(|_| {})));
        assert!(!global_scheduler().is_immediate());
        reset_global_config();
        assert!(global_scheduler().is_immediate());
    }
}
