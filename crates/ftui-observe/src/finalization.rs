#![forbid(unsafe_code)]

//! Safety net for reactions whose owner went away without disposing them.
//!
//! A consumer that creates a reaction registers it here together with a
//! handle to itself (the *owner*) and a token. Once the consumer has a
//! guaranteed cleanup path (for example after its first successful mount)
//! it unregisters the token. Entries that are never unregistered are
//! finalized by [`FinalizationRegistry::sweep`]:
//!
//! - [`FinalizationStrategy::OwnerDropped`]: the entry is finalized once the
//!   owner `Rc` has no strong references left.
//! - [`FinalizationStrategy::Timer`]: the entry is finalized once it is
//!   `max_age` old, whatever happened to the owner.
//!
//! Sweeping is driven by the caller (an event loop tick or a timer).
//! [`FinalizationRegistry::next_sweep_at`] says when the next sweep is
//! useful and is `None` while the registry is empty, so no idle timer needs
//! to run.
//!
//! # Invariants
//!
//! 1. Each registered value is either returned by `unregister` or passed to
//!    the cleanup callback, exactly once.
//! 2. The cleanup callback runs without the registry borrowed, so it may
//!    register or unregister entries.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use indexmap::IndexMap;
use tracing::debug;
use web_time::{Duration, Instant};

use crate::reaction::{ReactionRef, unobserve};

/// Age after which the timer strategy finalizes an entry.
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(10);

/// Suggested sweep cadence for the owner-dropped strategy.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// When an unregistered entry is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizationStrategy {
    /// Finalize once the owner has been dropped.
    OwnerDropped { poll_interval: Duration },
    /// Finalize once the entry is `max_age` old.
    Timer { max_age: Duration },
}

impl FinalizationStrategy {
    #[must_use]
    pub const fn owner_dropped() -> Self {
        Self::OwnerDropped {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn timer() -> Self {
        Self::Timer {
            max_age: DEFAULT_CLEANUP_AGE,
        }
    }
}

impl Default for FinalizationStrategy {
    fn default() -> Self {
        Self::owner_dropped()
    }
}

/// A manually-advanced clock for deterministic sweeps.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    epoch: Instant,
    offset_us: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let us = delta.as_micros().min(u128::from(u64::MAX)) as u64;
        self.offset_us.fetch_add(us, Ordering::Release);
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.epoch + Duration::from_micros(self.offset_us.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Time source for registration ages.
#[derive(Debug, Clone, Default)]
pub enum FinalizeClock {
    #[default]
    Real,
    Manual(ManualClock),
}

impl FinalizeClock {
    #[must_use]
    pub fn now(&self) -> Instant {
        match self {
            Self::Real => Instant::now(),
            Self::Manual(clock) => clock.now(),
        }
    }
}

struct Entry<T> {
    owner: Weak<dyn Any>,
    value: T,
    registered_at: Instant,
}

/// Registry of values to finalize when their owner is gone.
pub struct FinalizationRegistry<T, K = u64> {
    strategy: FinalizationStrategy,
    clock: FinalizeClock,
    entries: RefCell<IndexMap<K, Entry<T>, RandomState>>,
    cleanup: Box<dyn Fn(T)>,
}

impl<T, K: Eq + Hash> FinalizationRegistry<T, K> {
    pub fn new(strategy: FinalizationStrategy, cleanup: impl Fn(T) + 'static) -> Self {
        Self {
            strategy,
            clock: FinalizeClock::Real,
            entries: RefCell::new(IndexMap::default()),
            cleanup: Box::new(cleanup),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: FinalizeClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn strategy(&self) -> FinalizationStrategy {
        self.strategy
    }

    /// Register `value` on behalf of `owner`.
    ///
    /// Re-registering a token replaces its entry and returns the previous
    /// value without finalizing it.
    pub fn register<O: Any>(&self, owner: &Rc<O>, value: T, token: K) -> Option<T> {
        let owner: Weak<dyn Any> = Rc::downgrade(owner) as Weak<dyn Any>;
        let entry = Entry {
            owner,
            value,
            registered_at: self.clock.now(),
        };
        let previous = self.entries.borrow_mut().shift_remove(&token);
        self.entries.borrow_mut().insert(token, entry);
        previous.map(|entry| entry.value)
    }

    /// Remove an entry without finalizing it.
    pub fn unregister(&self, token: &K) -> Option<T> {
        let removed = self.entries.borrow_mut().shift_remove(token);
        removed.map(|entry| entry.value)
    }

    #[must_use]
    pub fn contains(&self, token: &K) -> bool {
        self.entries.borrow().contains_key(token)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn is_due(&self, entry: &Entry<T>, now: Instant) -> bool {
        match self.strategy {
            FinalizationStrategy::OwnerDropped { .. } => entry.owner.strong_count() == 0,
            FinalizationStrategy::Timer { max_age } => {
                now.saturating_duration_since(entry.registered_at) >= max_age
            }
        }
    }

    /// Finalize every due entry, returning how many were finalized.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<T> = {
            let mut entries = self.entries.borrow_mut();
            let all = std::mem::take(&mut *entries);
            let mut due = Vec::new();
            for (token, entry) in all {
                if self.is_due(&entry, now) {
                    due.push(entry.value);
                } else {
                    entries.insert(token, entry);
                }
            }
            due
        };
        self.finalize(due)
    }

    /// Finalize every entry regardless of age or owner.
    pub fn finalize_all_immediately(&self) -> usize {
        let all = std::mem::take(&mut *self.entries.borrow_mut());
        self.finalize(all.into_values().map(|entry| entry.value).collect())
    }

    fn finalize(&self, due: Vec<T>) -> usize {
        let count = due.len();
        for value in due {
            (self.cleanup)(value);
        }
        if count > 0 {
            debug!(finalized = count, remaining = self.len(), "finalization sweep");
        }
        count
    }

    /// When the next sweep can finalize something; `None` while empty.
    ///
    /// For the timer strategy this is when the oldest entry comes of age.
    /// For the owner-dropped strategy owners can go away at any moment, so
    /// it is one poll interval from now.
    #[must_use]
    pub fn next_sweep_at(&self) -> Option<Instant> {
        let entries = self.entries.borrow();
        match self.strategy {
            FinalizationStrategy::OwnerDropped { poll_interval } => {
                (!entries.is_empty()).then(|| self.clock.now() + poll_interval)
            }
            FinalizationStrategy::Timer { max_age } => entries
                .values()
                .map(|entry| entry.registered_at)
                .min()
                .map(|oldest| oldest + max_age),
        }
    }
}

impl<K: Eq + Hash> FinalizationRegistry<ReactionRef, K> {
    /// Registry that disposes orphaned reactions.
    pub fn for_reactions(strategy: FinalizationStrategy) -> Self {
        Self::new(strategy, |reaction: ReactionRef| unobserve(&reaction))
    }
}

impl<T, K> fmt::Debug for FinalizationRegistry<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.try_borrow().map(|e| e.len()).ok();
        f.debug_struct("FinalizationRegistry")
            .field("strategy", &self.strategy)
            .field("clock", &self.clock)
            .field("len", &len)
            .finish()
    }
}
