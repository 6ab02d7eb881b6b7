#![forbid(unsafe_code)]

//! The tracking context: a stack of currently running reactions.
//!
//! Reads register a dependency only against the reaction on top of the
//! stack. Reactions nest (a body may run another reaction), so this is a
//! stack rather than a single slot.
//!
//! The stack is thread-local: reactions, observables and the dependency
//! graph are all `Rc`-based and never cross threads. Frames are pushed by
//! [`TrackingFrame`], whose `Drop` pops, so a panicking reaction body
//! unwinds without leaving a stale "currently tracking" entry behind.

use std::cell::RefCell;

use crate::reaction::{ReactionId, ReactionRef};

thread_local! {
    static STACK: RefCell<Vec<Option<ReactionRef>>> = const { RefCell::new(Vec::new()) };
}

/// RAII frame on the tracking stack. `None` suspends tracking.
pub(crate) struct TrackingFrame {
    _private: (),
}

impl TrackingFrame {
    pub(crate) fn push(reaction: Option<ReactionRef>) -> Self {
        STACK.with(|stack| stack.borrow_mut().push(reaction));
        Self { _private: () }
    }
}

impl Drop for TrackingFrame {
    fn drop(&mut self) {
        let popped = STACK.try_with(|stack| stack.borrow_mut().pop());
        drop(popped);
    }
}

/// The reaction that reads are currently attributed to, if any.
#[must_use]
pub fn current_reaction() -> Option<ReactionRef> {
    STACK
        .try_with(|stack| stack.borrow().last().cloned().flatten())
        .ok()
        .flatten()
}

/// Whether a read right now would register a dependency.
#[must_use]
pub fn has_running_reaction() -> bool {
    STACK
        .try_with(|stack| matches!(stack.borrow().last(), Some(Some(_))))
        .unwrap_or(false)
}

/// Whether the reaction is anywhere on the stack (running or suspended by a
/// nested reaction).
#[must_use]
pub fn is_running(id: ReactionId) -> bool {
    STACK
        .try_with(|stack| {
            stack
                .borrow()
                .iter()
                .flatten()
                .any(|reaction| reaction.id() == id)
        })
        .unwrap_or(false)
}

/// Current nesting depth of the stack (tracked and untracked frames).
#[must_use]
pub fn depth() -> usize {
    STACK.try_with(|stack| stack.borrow().len()).unwrap_or(0)
}

/// Run `f` without attributing its reads to the running reaction.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _frame = TrackingFrame::push(None);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::observable;
    use crate::reaction::observe;
    use crate::target::Target;
    use std::cell::Cell;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;

    #[test]
    fn reads_outside_reactions_are_noops() {
        let state = observable(&Target::object_from([("a", 1)]));
        assert!(!has_running_reaction());
        assert_eq!(state.get("a").as_i64(), Some(1));
        assert_eq!(depth(), 0);
    }

    #[test]
    fn current_reaction_is_visible_inside_body() {
        let seen = Rc::new(Cell::new(None));
        let seen_in = Rc::clone(&seen);
        let r = observe(move || seen_in.set(current_reaction().map(|r| r.id())));
        assert_eq!(seen.get(), Some(r.id()));
        assert!(current_reaction().is_none());
    }

    #[test]
    fn untracked_reads_register_nothing() {
        let state = observable(&Target::object_from([("a", 1), ("b", 2)]));
        let s = state.clone();
        let r = observe(move || {
            let _ = s.get("a");
            untracked(|| s.get("b"))
        });
        assert_eq!(r.dependency_count(), 1);
        assert!(!is_running(r.id()));
    }

    #[test]
    fn panicking_body_pops_its_frame() {
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _r = observe(|| -> i32 { panic!("render failed") });
        }));
        assert!(result.is_err());
        assert_eq!(depth(), 0);
        assert!(current_reaction().is_none());
    }
}
