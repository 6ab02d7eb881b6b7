#![forbid(unsafe_code)]

//! The dependency graph: `target → key → ordered set of reactions`.
//!
//! Pure bookkeeping. Reads performed by a running reaction add edges with
//! [`track`]; writes look up the reactions to notify with
//! [`reactions_for_span`]; re-runs and disposal remove a reaction's own edges
//! with [`release`].
//!
//! # Invariants
//!
//! 1. A `(target, key)` set never contains the same reaction twice.
//! 2. Sets iterate in insertion order; a reaction that re-subscribes moves
//!    to the back.
//! 3. Empty sets and empty per-target maps are pruned on removal.
//! 4. A reaction is never dropped while the graph is borrowed: removed
//!    handles are parked in a graveyard and released after the borrow ends,
//!    because dropping a reaction can drop observables that re-enter here.
//!
//! # Failure Modes
//!
//! - **Target dropped while subscribed**: its entries are forgotten when the
//!   last raw handle goes away. Reactions keep stale edge records for it;
//!   [`release`] skips them.
//! - **Thread teardown**: accesses after the thread-local is destroyed are
//!   silently ignored.

use std::cell::RefCell;
use std::ops::Range;

use ahash::{AHashMap, RandomState};
use indexmap::IndexSet;

use crate::reaction::ReactionRef;
use crate::target::{Target, TargetId};
use crate::value::Key;

/// Key of a dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DepKey {
    /// A single property, index or map/set key.
    Key(Key),
    /// The key-set of an object, map or set (enumeration, size, `has`).
    Iterate,
    /// The length of an array (its shape token).
    Length,
}

impl From<Key> for DepKey {
    fn from(key: Key) -> Self {
        Self::Key(key)
    }
}

type ReactionSet = IndexSet<ReactionRef, RandomState>;

#[derive(Default)]
struct Graph {
    targets: AHashMap<TargetId, AHashMap<DepKey, ReactionSet>>,
    graveyard: Vec<ReactionRef>,
}

impl Graph {
    fn insert(&mut self, target: TargetId, key: DepKey, reaction: &ReactionRef) -> bool {
        self.targets
            .entry(target)
            .or_default()
            .entry(key)
            .or_default()
            .insert(reaction.clone())
    }

    fn remove(&mut self, target: TargetId, key: &DepKey, reaction: &ReactionRef) {
        let Some(keys) = self.targets.get_mut(&target) else {
            return;
        };
        if let Some(set) = keys.get_mut(key) {
            if let Some(removed) = set.shift_take(reaction) {
                self.graveyard.push(removed);
            }
            if set.is_empty() {
                keys.remove(key);
            }
        }
        if keys.is_empty() {
            self.targets.remove(&target);
        }
    }

    fn forget(&mut self, target: TargetId) {
        if let Some(keys) = self.targets.remove(&target) {
            self.graveyard.extend(keys.into_values().flatten());
        }
    }
}

thread_local! {
    static GRAPH: RefCell<Graph> = RefCell::new(Graph::default());
    static PENDING_FORGET: RefCell<Vec<TargetId>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` against the graph, then drop whatever it removed.
fn with_graph<R>(f: impl FnOnce(&mut Graph) -> R) -> Option<R> {
    let (out, graveyard) = GRAPH
        .try_with(|cell| {
            let mut graph = cell.borrow_mut();
            let pending = PENDING_FORGET
                .try_with(|p| std::mem::take(&mut *p.borrow_mut()))
                .unwrap_or_default();
            for id in pending {
                graph.forget(id);
            }
            let out = f(&mut graph);
            (out, std::mem::take(&mut graph.graveyard))
        })
        .ok()?;
    drop(graveyard);
    Some(out)
}

/// Record that `reaction` read `key` of `target`.
///
/// Disposed reactions never gain edges, even when they are still executing.
pub(crate) fn track(target: TargetId, key: DepKey, reaction: &ReactionRef) {
    if reaction.is_disposed() {
        return;
    }
    let edge = key.clone();
    let inserted = with_graph(|g| g.insert(target, key, reaction)).unwrap_or(false);
    if inserted {
        reaction.core().edges.borrow_mut().push((target, edge));
    }
}

/// Remove every edge `reaction` currently owns.
pub(crate) fn release(reaction: &ReactionRef) {
    let edges = std::mem::take(&mut *reaction.core().edges.borrow_mut());
    if edges.is_empty() {
        return;
    }
    with_graph(|g| {
        for (target, key) in &edges {
            g.remove(*target, key, reaction);
        }
    });
}

#[cfg(test)]
pub(crate) fn reactions_for(target: TargetId, keys: &[DepKey]) -> Vec<ReactionRef> {
    reactions_for_span(target, 0..0, keys)
}

/// Reactions subscribed to any of `keys` on `target`, deduplicated, in key
/// order and then insertion order. Subscribers of array indices in `span`
/// come first, lowest index first.
///
/// Only indices that actually have subscribers are visited, so a resize
/// costs the number of subscribed keys rather than the width of the span.
pub(crate) fn reactions_for_span(
    target: TargetId,
    span: Range<usize>,
    keys: &[DepKey],
) -> Vec<ReactionRef> {
    with_graph(|g| {
        let Some(by_key) = g.targets.get(&target) else {
            return Vec::new();
        };
        let mut out = ReactionSet::default();
        if !span.is_empty() {
            let mut hits: Vec<(usize, &ReactionSet)> = by_key
                .iter()
                .filter_map(|(key, set)| match key {
                    DepKey::Key(Key::Int(i)) => usize::try_from(*i)
                        .ok()
                        .filter(|i| span.contains(i))
                        .map(|i| (i, set)),
                    _ => None,
                })
                .collect();
            hits.sort_unstable_by_key(|&(i, _)| i);
            for (_, set) in hits {
                out.extend(set.iter().cloned());
            }
        }
        for key in keys {
            if let Some(set) = by_key.get(key) {
                out.extend(set.iter().cloned());
            }
        }
        out.into_iter().collect()
    })
    .unwrap_or_default()
}

/// Drop all entries of a target whose last raw handle went away.
pub(crate) fn forget_target(target: TargetId) {
    let graveyard = GRAPH.try_with(|cell| match cell.try_borrow_mut() {
        Ok(mut graph) => {
            graph.forget(target);
            std::mem::take(&mut graph.graveyard)
        }
        Err(_) => {
            let _ = PENDING_FORGET.try_with(|p| p.borrow_mut().push(target));
            Vec::new()
        }
    });
    drop(graveyard);
}

/// Number of reactions subscribed to `key` of `target`.
#[must_use]
pub fn subscriber_count(target: &Target, key: &DepKey) -> usize {
    with_graph(|g| {
        g.targets
            .get(&target.id())
            .and_then(|keys| keys.get(key))
            .map_or(0, IndexSet::len)
    })
    .unwrap_or(0)
}

/// Number of targets that currently have at least one subscriber.
#[must_use]
pub fn tracked_target_count() -> usize {
    with_graph(|g| g.targets.len()).unwrap_or(0)
}
