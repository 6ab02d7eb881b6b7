#![forbid(unsafe_code)]

//! Reactions: re-runnable tracked computations.
//!
//! [`observe`] wraps a closure in a [`Reaction`]. Running it (at creation,
//! manually, or when a scheduler fires it) follows one protocol:
//!
//! 1. drop every dependency edge recorded by the previous run;
//! 2. push the reaction on the tracking stack;
//! 3. run the body, recording an edge for every observable read;
//! 4. pop the stack, also when the body panics.
//!
//! Conditional reads therefore never leave stale dependencies behind.
//!
//! # Invariants
//!
//! 1. After [`unobserve`], the reaction is in no dependency set and is never
//!    triggered again.
//! 2. A panicking run propagates the panic to the caller of that run and
//!    leaves the reaction usable.
//! 3. A reaction already on the tracking stack is not re-entered: a body
//!    that writes to something it reads does not recurse into itself.
//!
//! # Disposed reactions
//!
//! Calling [`Reaction::run`] on a disposed reaction still executes the body
//! but records nothing for it (an inert replay). Reads made during such a
//! replay are attributed to whatever reaction is on top of the stack.
//!
//! # Ownership
//!
//! The dependency graph holds its own handle to every subscribed reaction,
//! so a reaction keeps reacting after the caller drops its `Reaction`.
//! Whoever creates a reaction owns its disposal: call [`unobserve`], or hold
//! a [`ReactionGuard`] that disposes on drop.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::batch;
use crate::graph::{self, DepKey};
use crate::operation::{Debugger, Operation};
use crate::scheduler::{self, Scheduler};
use crate::target::TargetId;
use crate::tracking::{self, TrackingFrame};

static NEXT_REACTION_ID: AtomicU64 = AtomicU64::new(1);

const TAG_PREFIX: &str = "[reaction ";

/// Unique, never reused identity of a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactionId(u64);

impl ReactionId {
    fn next() -> Self {
        Self(NEXT_REACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Parse the `[reaction N]` tag produced by `Display`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        tag.trim()
            .strip_prefix(TAG_PREFIX)?
            .strip_suffix(']')?
            .parse()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for ReactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TAG_PREFIX}{}]", self.0)
    }
}

/// State shared by every reaction regardless of its result type.
pub(crate) struct ReactionCore {
    id: ReactionId,
    disposed: Cell<bool>,
    scheduler: Option<Scheduler>,
    debugger: Option<Debugger>,
    /// Edges recorded by the latest run.
    pub(crate) edges: RefCell<Vec<(TargetId, DepKey)>>,
    runs: Cell<u64>,
}

impl ReactionCore {
    fn new(scheduler: Option<Scheduler>, debugger: Option<Debugger>) -> Self {
        Self {
            id: ReactionId::next(),
            disposed: Cell::new(false),
            scheduler,
            debugger,
            edges: RefCell::new(Vec::new()),
            runs: Cell::new(0),
        }
    }

    pub(crate) fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    pub(crate) fn debugger(&self) -> Option<&Debugger> {
        self.debugger.as_ref()
    }
}

pub(crate) trait Runnable {
    fn core(&self) -> &ReactionCore;
    fn run_erased(self: Rc<Self>);
}

struct ReactionInner<R> {
    core: ReactionCore,
    body: RefCell<Box<dyn FnMut() -> R>>,
}

impl<R: 'static> Runnable for ReactionInner<R> {
    fn core(&self) -> &ReactionCore {
        &self.core
    }

    fn run_erased(self: Rc<Self>) {
        let _ = execute(&self);
    }
}

fn execute<R: 'static>(inner: &Rc<ReactionInner<R>>) -> Option<R> {
    let core = &inner.core;
    if core.disposed.get() {
        let mut body = inner.body.try_borrow_mut().ok()?;
        return Some((*body)());
    }
    if tracking::is_running(core.id) {
        trace!(reaction = core.id.raw(), "skipping re-entrant run");
        return None;
    }

    let handle = ReactionRef {
        inner: Rc::clone(inner) as Rc<dyn Runnable>,
    };
    graph::release(&handle);
    let _frame = TrackingFrame::push(Some(handle));
    let mut body = inner.body.try_borrow_mut().ok()?;
    core.runs.set(core.runs.get() + 1);
    trace!(reaction = core.id.raw(), run = core.runs.get(), "running reaction");
    Some((*body)())
}

// ---------------------------------------------------------------------------
// Reaction<R>
// ---------------------------------------------------------------------------

/// Typed handle to a reaction whose body returns `R`.
///
/// Cloning creates another handle to the **same** reaction.
pub struct Reaction<R = ()> {
    inner: Rc<ReactionInner<R>>,
}

impl<R> Clone for Reaction<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<R: 'static> Reaction<R> {
    /// Re-run the body under tracking and return its result.
    ///
    /// Returns `None` when the reaction is already running further up the
    /// stack (re-entrant call) and the body was not executed.
    pub fn run(&self) -> Option<R> {
        execute(&self.inner)
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ReactionId {
        self.inner.core.id
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.core.disposed.get()
    }

    /// Number of dependency edges recorded by the latest run.
    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.inner.core.edges.borrow().len()
    }

    /// Number of tracked runs so far (inert replays are not counted).
    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.inner.core.runs.get()
    }

    /// Type-erased handle, as handed to schedulers.
    #[must_use]
    pub fn to_ref(&self) -> ReactionRef {
        ReactionRef {
            inner: Rc::clone(&self.inner) as Rc<dyn Runnable>,
        }
    }

    /// Tie the reaction's lifetime to a guard that disposes it on drop.
    pub fn into_guard(self) -> ReactionGuard {
        ReactionGuard {
            reaction: self.to_ref(),
        }
    }
}

impl<R> fmt::Debug for Reaction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = &self.inner.core;
        f.debug_struct("Reaction")
            .field("id", &core.id)
            .field("disposed", &core.disposed.get())
            .field("runs", &core.runs.get())
            .finish()
    }
}

impl<R> fmt::Display for Reaction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.core.id, f)
    }
}

// ---------------------------------------------------------------------------
// ReactionRef
// ---------------------------------------------------------------------------

/// Type-erased reaction handle used by the graph and by schedulers.
///
/// Equality and hashing are by reaction id.
#[derive(Clone)]
pub struct ReactionRef {
    inner: Rc<dyn Runnable>,
}

impl ReactionRef {
    /// Run the reaction, discarding its result.
    pub fn run(&self) {
        Rc::clone(&self.inner).run_erased();
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> ReactionId {
        self.inner.core().id
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.core().disposed.get()
    }

    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.inner.core().edges.borrow().len()
    }

    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.inner.core().runs.get()
    }

    pub(crate) fn core(&self) -> &ReactionCore {
        self.inner.core()
    }

    /// Run on behalf of a scheduler. Disposed reactions are skipped, so a
    /// stale queue entry can never execute a disposed body. Returns whether
    /// the reaction ran.
    pub(crate) fn run_scheduled(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.run();
        true
    }
}

impl PartialEq for ReactionRef {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ReactionRef {}

impl Hash for ReactionRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for ReactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionRef")
            .field("id", &self.id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl fmt::Display for ReactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id(), f)
    }
}

/// Anything that designates a reaction.
pub trait AsReaction {
    fn reaction_ref(&self) -> ReactionRef;
}

impl<R: 'static> AsReaction for Reaction<R> {
    fn reaction_ref(&self) -> ReactionRef {
        self.to_ref()
    }
}

impl AsReaction for ReactionRef {
    fn reaction_ref(&self) -> ReactionRef {
        self.clone()
    }
}

// ---------------------------------------------------------------------------
// observe / unobserve
// ---------------------------------------------------------------------------

/// Options for [`observe_with`].
#[derive(Clone, Default)]
pub struct ObserveOptions {
    lazy: bool,
    scheduler: Option<Scheduler>,
    debugger: Option<Debugger>,
}

impl ObserveOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Do not run the body at creation; the first [`Reaction::run`] does.
    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Use this scheduler for the reaction's whole lifetime instead of the
    /// global one.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Receive every operation the reaction tracks or is triggered by.
    #[must_use]
    pub fn debugger(mut self, debugger: impl Fn(&Operation) + 'static) -> Self {
        self.debugger = Some(Rc::new(debugger));
        self
    }
}

impl fmt::Debug for ObserveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveOptions")
            .field("lazy", &self.lazy)
            .field("scheduler", &self.scheduler)
            .field("debugger", &self.debugger.is_some())
            .finish()
    }
}

/// Create a reaction and run it once immediately.
pub fn observe<R: 'static>(body: impl FnMut() -> R + 'static) -> Reaction<R> {
    observe_with(body, ObserveOptions::default())
}

/// Create a reaction with explicit options.
pub fn observe_with<R: 'static>(
    body: impl FnMut() -> R + 'static,
    options: ObserveOptions,
) -> Reaction<R> {
    let ObserveOptions {
        lazy,
        scheduler,
        debugger,
    } = options;
    let reaction = Reaction {
        inner: Rc::new(ReactionInner {
            core: ReactionCore::new(scheduler, debugger),
            body: RefCell::new(Box::new(body)),
        }),
    };
    trace!(reaction = reaction.id().raw(), lazy, "reaction created");
    if !lazy {
        let _ = reaction.run();
    }
    reaction
}

/// Create a reaction owned by the returned guard.
pub fn observe_scoped<R: 'static>(body: impl FnMut() -> R + 'static) -> ReactionGuard {
    observe(body).into_guard()
}

/// Dispose a reaction. Idempotent.
///
/// Removes it from every dependency set and from any collector it is
/// queued in, so a reaction disposed mid-batch does not run on flush.
pub fn unobserve(reaction: &impl AsReaction) {
    let reaction = reaction.reaction_ref();
    let core = reaction.core();
    if !core.disposed.replace(true) {
        graph::release(&reaction);
        trace!(reaction = core.id.raw(), "reaction disposed");
    }
    if let Scheduler::Collector(collector) = scheduler::effective_scheduler(&reaction) {
        collector.delete(&reaction);
    }
    batch::forget(&reaction);
}

// ---------------------------------------------------------------------------
// ReactionGuard
// ---------------------------------------------------------------------------

/// Owns a reaction and disposes it when dropped.
#[must_use = "dropping the guard disposes the reaction"]
pub struct ReactionGuard {
    reaction: ReactionRef,
}

impl ReactionGuard {
    #[must_use]
    pub fn reaction(&self) -> &ReactionRef {
        &self.reaction
    }

    pub fn run(&self) {
        self.reaction.run();
    }
}

impl AsReaction for ReactionGuard {
    fn reaction_ref(&self) -> ReactionRef {
        self.reaction.clone()
    }
}

impl Drop for ReactionGuard {
    fn drop(&mut self) {
        unobserve(&self.reaction);
    }
}

impl fmt::Debug for ReactionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionGuard")
            .field("reaction", &self.reaction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::observable;
    use crate::target::Target;
    use crate::value::Value;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let c = Rc::new(Cell::new(0));
        (Rc::clone(&c), c)
    }

    #[test]
    fn eager_reaction_runs_once_at_creation() {
        let (runs, inner) = counter();
        let r = observe(move || inner.set(inner.get() + 1));
        assert_eq!(runs.get(), 1);
        assert_eq!(r.run_count(), 1);
    }

    #[test]
    fn lazy_reaction_waits_for_first_run() {
        let state = observable(&Target::object_from([("a", 1)]));
        let s = state.clone();
        let r = observe_with(move || s.get("a").as_i64(), ObserveOptions::new().lazy(true));
        assert_eq!(r.run_count(), 0);
        assert_eq!(r.dependency_count(), 0);

        // Nothing is tracked yet, so writes do not run it.
        state.set("a", 2).unwrap();
        assert_eq!(r.run_count(), 0);

        assert_eq!(r.run(), Some(Some(2)));
        assert_eq!(r.dependency_count(), 1);
    }

    #[test]
    fn run_returns_body_result() {
        let state = observable(&Target::object_from([("n", 21)]));
        let s = state.clone();
        let double = observe(move || s.get("n").as_i64().unwrap_or(0) * 2);
        assert_eq!(double.run(), Some(42));
    }

    #[test]
    fn conditional_reads_drop_stale_edges() {
        let state = observable(&Target::object_from([
            ("flag", Value::from(true)),
            ("a", Value::from(1)),
            ("b", Value::from(2)),
        ]));
        let (runs, inner) = counter();
        let s = state.clone();
        let _r = observe(move || {
            inner.set(inner.get() + 1);
            if s.get("flag").as_bool() == Some(true) {
                s.get("a")
            } else {
                s.get("b")
            }
        });
        assert_eq!(runs.get(), 1);

        state.set("flag", false).unwrap();
        assert_eq!(runs.get(), 2);

        // `a` was only read by the first run.
        state.set("a", 10).unwrap();
        assert_eq!(runs.get(), 2);

        state.set("b", 20).unwrap();
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn unobserve_is_idempotent_and_final() {
        let state = observable(&Target::object_from([("a", 1)]));
        let (runs, inner) = counter();
        let s = state.clone();
        let r = observe(move || {
            inner.set(inner.get() + 1);
            s.get("a")
        });
        unobserve(&r);
        unobserve(&r);
        assert!(r.is_disposed());
        assert_eq!(r.dependency_count(), 0);

        for n in 2..10 {
            state.set("a", n).unwrap();
        }
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn disposed_reaction_replays_inertly() {
        let state = observable(&Target::object_from([("a", 1)]));
        let (runs, inner) = counter();
        let s = state.clone();
        let r = observe(move || {
            inner.set(inner.get() + 1);
            s.get("a").as_i64()
        });
        unobserve(&r);

        assert_eq!(r.run(), Some(Some(1)));
        assert_eq!(runs.get(), 2);
        assert_eq!(r.dependency_count(), 0);

        state.set("a", 5).unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn self_write_does_not_recurse() {
        let state = observable(&Target::object_from([("n", 0)]));
        let (runs, inner) = counter();
        let s = state.clone();
        let _r = observe(move || {
            inner.set(inner.get() + 1);
            let n = s.get("n").as_i64().unwrap_or(0);
            if n < 3 {
                s.set("n", n + 1).unwrap();
            }
        });
        assert_eq!(runs.get(), 1);
        assert_eq!(state.get("n").as_i64(), Some(1));
    }

    #[test]
    fn panic_propagates_and_reaction_survives() {
        let state = observable(&Target::object_from([("fail", false)]));
        let (runs, inner) = counter();
        let s = state.clone();
        let r = observe(move || {
            inner.set(inner.get() + 1);
            assert!(s.get("fail").as_bool() != Some(true), "boom");
        });

        let result = catch_unwind(AssertUnwindSafe(|| state.set("fail", true).unwrap()));
        assert!(result.is_err());
        assert!(!r.is_disposed());
        assert_eq!(runs.get(), 2);

        // The panicking run still recorded its read before failing.
        state.set("fail", false).unwrap();
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn nested_reactions_track_independently() {
        let state = observable(&Target::object_from([("outer", 1), ("inner", 1)]));
        let (outer_runs, outer_count) = counter();
        let (inner_runs, inner_count) = counter();
        let s = state.clone();
        let _outer = observe(move || {
            outer_count.set(outer_count.get() + 1);
            let _ = s.get("outer");
            let s_inner = s.clone();
            let inner_count = Rc::clone(&inner_count);
            observe(move || {
                inner_count.set(inner_count.get() + 1);
                s_inner.get("inner")
            })
        });
        assert_eq!((outer_runs.get(), inner_runs.get()), (1, 1));

        state.set("inner", 2).unwrap();
        assert_eq!((outer_runs.get(), inner_runs.get()), (1, 2));
    }

    #[test]
    fn display_tag_round_trips() {
        let r = observe(|| ());
        let tag = r.to_string();
        assert!(tag.starts_with("[reaction "));
        assert_eq!(ReactionId::from_tag(&tag), Some(r.id()));
        assert_eq!(ReactionId::from_tag("reaction 3"), None);
    }

    #[test]
    fn guard_disposes_on_drop() {
        let state = observable(&Target::object_from([("a", 1)]));
        let (runs, inner) = counter();
        let s = state.clone();
        let guard = observe_scoped(move || {
            inner.set(inner.get() + 1);
            s.get("a")
        });
        let handle = guard.reaction().clone();

        state.set("a", 2).unwrap();
        assert_eq!(runs.get(), 2);

        drop(guard);
        assert!(handle.is_disposed());
        state.set("a", 3).unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn unobserve_inside_own_body_stops_tracking() {
        let state = observable(&Target::object_from([("a", 1), ("b", 1)]));
        let slot: Rc<RefCell<Option<ReactionRef>>> = Rc::new(RefCell::new(None));
        let (runs, inner) = counter();
        let s = state.clone();
        let body_slot = Rc::clone(&slot);
        let r = observe_with(
            move || {
                inner.set(inner.get() + 1);
                let _ = s.get("a");
                if let Some(me) = body_slot.borrow().as_ref() {
                    unobserve(me);
                }
                let _ = s.get("b");
            },
            ObserveOptions::new().lazy(true),
        );
        *slot.borrow_mut() = Some(r.to_ref());
        let _ = r.run();

        assert!(r.is_disposed());
        assert_eq!(r.dependency_count(), 0);
        state.set("b", 2).unwrap();
        assert_eq!(runs.get(), 1);
    }
}
