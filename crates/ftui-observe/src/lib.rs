#![forbid(unsafe_code)]

//! Fine-grained reactive state for FrankenTUI.
//!
//! Containers (objects, arrays, maps, sets) are wrapped in [`Observable`]
//! handles. A [`Reaction`] created with [`observe`] runs a closure and
//! records every observable entry it reads; when one of those entries
//! changes, exactly the reactions that read it are re-run (or queued, see
//! [`Scheduler`]).
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use ftui_observe::{Target, observable, observe, unobserve};
//!
//! let counter = observable(&Target::object_from([("count", 0)]));
//! let seen = Rc::new(RefCell::new(Vec::new()));
//!
//! let (c, log) = (counter.clone(), Rc::clone(&seen));
//! let reaction = observe(move || log.borrow_mut().push(c.get("count").as_i64()));
//!
//! counter.set("count", 5).unwrap();
//! unobserve(&reaction);
//! counter.set("count", 9).unwrap();
//!
//! assert_eq!(*seen.borrow(), [Some(0), Some(5)]);
//! ```
//!
//! # Architecture
//!
//! Everything is single-threaded and `Rc`-based. The dependency graph, the
//! tracking stack, the proxy registry and the global scheduler are
//! thread-local, so separate threads run fully independent engines.
//!
//! - [`graph`]: `target → key → reactions` bookkeeping.
//! - [`tracking`]: the stack of running reactions.
//! - [`observable`](mod@observable): tracked reads, triggering writes.
//! - [`reaction`]: `observe` / `unobserve` and the re-run protocol.
//! - [`scheduler`] and [`batch`]: what a triggered reaction does.
//! - [`finalization`]: disposal of reactions whose owner vanished.

pub mod batch;
pub mod error;
pub mod finalization;
pub mod graph;
mod json;
pub mod observable;
pub mod operation;
pub mod reaction;
pub mod scheduler;
pub mod target;
pub mod tracking;
pub mod value;

pub use batch::{BatchScope, batch};
pub use error::{ObserveError, Result};
pub use finalization::{
    DEFAULT_CLEANUP_AGE, DEFAULT_POLL_INTERVAL, FinalizationRegistry, FinalizationStrategy,
    FinalizeClock, ManualClock,
};
pub use graph::DepKey;
pub use observable::{
    AsTarget, MAX_ARRAY_LEN, Observable, is_observable, observable, try_observable,
};
pub use operation::{Debugger, Operation, OperationKind};
pub use reaction::{
    AsReaction, ObserveOptions, Reaction, ReactionGuard, ReactionId, ReactionRef, observe,
    observe_scoped, observe_with, unobserve,
};
pub use scheduler::{
    Collector, Config, ReactionQueue, Scheduler, configure, global_scheduler, reset_global_config,
};
pub use target::{Target, TargetId};
pub use tracking::untracked;
pub use value::{Key, Kind, Value};
