#![forbid(unsafe_code)]

//! Scheduler and batching integration tests.
//!
//! Simulates the binding-layer contract: a render reaction whose scheduler
//! marks a version token dirty instead of re-rendering inline, plus
//! collector flush ordering and batch scopes.

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use ftui_observe::{
    BatchScope, Config, ObserveOptions, ReactionQueue, ReactionRef, Scheduler, Target, batch,
    configure, global_scheduler, observable, observe, observe_with, reset_global_config,
};

struct ResetConfig;

impl Drop for ResetConfig {
    fn drop(&mut self) {
        reset_global_config();
    }
}

/// Minimal stand-in for a UI binding: one reaction per rendered unit, a
/// version token bumped by the scheduler, renders driven by the host.
struct BoundView {
    version: Rc<Cell<u64>>,
    rendered: Rc<RefCell<Vec<String>>>,
    reaction: ftui_observe::Reaction<()>,
}

impl BoundView {
    fn mount(state: &ftui_observe::Observable) -> Self {
        let version = Rc::new(Cell::new(0));
        let rendered = Rc::new(RefCell::new(Vec::new()));
        let (s, out, v) = (state.clone(), Rc::clone(&rendered), Rc::clone(&version));
        let reaction = observe_with(
            move || {
                let title = s.get("title");
                out.borrow_mut().push(title.as_str().unwrap_or_default().to_owned());
            },
            ObserveOptions::new()
                .lazy(true)
                .scheduler(Scheduler::function(move |_| v.set(v.get() + 1))),
        );
        reaction.run();
        Self {
            version,
            rendered,
            reaction,
        }
    }

    fn render_if_dirty(&self, seen_version: &mut u64) {
        if self.version.get() != *seen_version {
            *seen_version = self.version.get();
            self.reaction.run();
        }
    }
}

#[test]
fn function_scheduler_defers_to_host_render_cycle() {
    let state = observable(&Target::object_from([("title", "first")]));
    let view = BoundView::mount(&state);
    let mut seen = 0;

    state.set("title", "second").unwrap();
    state.set("title", "third").unwrap();
    assert_eq!(view.version.get(), 2);
    assert_eq!(*view.rendered.borrow(), ["first"]);

    view.render_if_dirty(&mut seen);
    view.render_if_dirty(&mut seen);
    assert_eq!(*view.rendered.borrow(), ["first", "third"]);

    ftui_observe::unobserve(&view.reaction);
    state.set("title", "fourth").unwrap();
    assert_eq!(view.version.get(), 2);
}

#[test]
fn flush_order_is_first_trigger_order() {
    let _reset = ResetConfig;
    let queue = Rc::new(ReactionQueue::new());
    configure(Config::new().scheduler(Scheduler::collector(&queue)));

    let state = observable(&Target::object_from([("a", 0), ("b", 0)]));
    let order = Rc::new(RefCell::new(Vec::new()));
    let mk = |name: &'static str, key: &'static str| {
        let (s, log) = (state.clone(), Rc::clone(&order));
        observe(move || {
            let _ = s.get(key);
            log.borrow_mut().push(name);
        })
    };
    let _on_a = mk("on_a", "a");
    let _on_b = mk("on_b", "b");
    order.borrow_mut().clear();

    state.set("b", 1).unwrap();
    state.set("a", 1).unwrap();
    state.set("b", 2).unwrap();
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.flush(), 2);
    assert_eq!(*order.borrow(), ["on_b", "on_a"]);
}

#[test]
fn global_scheduler_change_applies_to_existing_reactions() {
    let _reset = ResetConfig;
    let state = observable(&Target::object_from([("a", 0)]));
    let (s, runs) = (state.clone(), Rc::new(Cell::new(0)));
    let counter = Rc::clone(&runs);
    let _r = observe(move || {
        counter.set(counter.get() + 1);
        s.get("a")
    });

    let handed: Rc<RefCell<Vec<ReactionRef>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&handed);
    configure(Config::new().scheduler(Scheduler::function(move |r| sink.borrow_mut().push(r))));
    state.set("a", 1).unwrap();
    assert_eq!(runs.get(), 1);
    assert_eq!(handed.borrow().len(), 1);

    reset_global_config();
    assert!(global_scheduler().is_immediate());
    state.set("a", 2).unwrap();
    assert_eq!(runs.get(), 2);

    // The host may still run what it was handed.
    let pending = handed.borrow_mut().pop();
    if let Some(reaction) = pending {
        reaction.run();
    }
    assert_eq!(runs.get(), 3);
}

#[test]
fn empty_config_keeps_current_scheduler() {
    let _reset = ResetConfig;
    configure(Config::new().scheduler(Scheduler::function(|_| {})));
    configure(Config::new());
    assert!(!global_scheduler().is_immediate());
}

#[test]
fn batch_coalesces_many_writes() {
    let state = observable(&Target::array());
    let (s, runs) = (state.clone(), Rc::new(Cell::new(0)));
    let counter = Rc::clone(&runs);
    let _r = observe(move || {
        counter.set(counter.get() + 1);
        s.len()
    });

    batch(|| {
        for n in 0..100 {
            state.push(n).unwrap();
        }
        assert_eq!(BatchScope::depth(), 1);
    });
    assert_eq!(runs.get(), 2);
}

#[test]
fn batch_does_not_hold_back_collector_reactions() {
    let state = observable(&Target::object_from([("a", 0)]));
    let queue = Rc::new(ReactionQueue::new());
    let s = state.clone();
    let r = observe_with(
        move || s.get("a"),
        ObserveOptions::new().scheduler(Scheduler::collector(&queue)),
    );
    {
        let _scope = BatchScope::new();
        state.set("a", 1).unwrap();
        assert!(queue.contains(&r.to_ref()));
    }
    assert_eq!(queue.flush(), 1);
}

#[test]
fn chained_reactions_settle_within_one_batch() {
    let state = observable(&Target::object_from([("input", 1), ("derived", 0)]));
    let (s, log) = (state.clone(), Rc::new(RefCell::new(Vec::new())));
    let _derive = observe(move || {
        let input = s.get("input").as_i64().unwrap_or(0);
        s.set("derived", input * 2).unwrap();
    });
    let (s, out) = (state.clone(), Rc::clone(&log));
    let _print = observe(move || out.borrow_mut().push(s.get("derived").as_i64()));
    log.borrow_mut().clear();

    batch(|| {
        state.set("input", 2).unwrap();
        state.set("input", 3).unwrap();
    });
    assert_eq!(*log.borrow(), [Some(6)]);
}

fn reject_input() {
    panic!("rejected input");
}

#[test]
fn panicking_reaction_escapes_flush_and_stays_usable() {
    let queue = Rc::new(ReactionQueue::new());
    let state = observable(&Target::object_from([("fail", false)]));
    let on_queue = || ObserveOptions::new().scheduler(Scheduler::collector(&queue));

    let (s, failing_runs) = (state.clone(), Rc::new(Cell::new(0)));
    let counter = Rc::clone(&failing_runs);
    let failing = observe_with(
        move || {
            counter.set(counter.get() + 1);
            if s.get("fail").as_bool() == Some(true) {
                reject_input();
            }
        },
        on_queue(),
    );
    let (s, steady_runs) = (state.clone(), Rc::new(Cell::new(0)));
    let counter = Rc::clone(&steady_runs);
    let steady = observe_with(
        move || {
            counter.set(counter.get() + 1);
            s.get("fail")
        },
        on_queue(),
    );

    state.set("fail", true).unwrap();
    assert_eq!(queue.len(), 2);

    let result = catch_unwind(AssertUnwindSafe(|| queue.flush()));
    assert!(result.is_err());
    assert_eq!(queue.len(), 1);
    assert!(queue.contains(&steady.to_ref()));
    assert!(!failing.is_disposed());
    assert_eq!((failing_runs.get(), steady_runs.get()), (2, 1));

    // The read before the panic was tracked, so the next write re-queues it.
    state.set("fail", false).unwrap();
    assert!(queue.contains(&failing.to_ref()));
    assert_eq!(queue.flush(), 2);
    assert_eq!((failing_runs.get(), steady_runs.get()), (3, 2));
}
