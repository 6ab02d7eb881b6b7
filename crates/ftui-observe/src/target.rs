#![forbid(unsafe_code)]

//! Raw containers: the un-instrumented objects that observables wrap.
//!
//! A [`Target`] is a cheap-clone handle to one container. Reading through a
//! `Target` never tracks anything; wrap it with
//! [`observable`](crate::observable) to get the instrumented view.
//!
//! # Invariants
//!
//! 1. Every target has a unique [`TargetId`] that is never reused, so the
//!    dependency graph can key on ids without holding the target alive.
//! 2. The container variant ([`Kind`]) is fixed at construction.
//! 3. Dropping the last handle removes the target's dependency-graph entries.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use indexmap::{IndexMap, IndexSet};

use crate::graph;
use crate::value::{ArraySlot, Key, Kind, Value};

pub(crate) type OrderedMap = IndexMap<Key, Value, RandomState>;
pub(crate) type OrderedSet = IndexSet<Key, RandomState>;

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

fn next_target_id() -> TargetId {
    TargetId(NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed))
}

/// Unique identity of a raw container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u64);

impl TargetId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Storage for one container variant.
#[derive(Debug)]
pub(crate) enum Container {
    Object(OrderedMap),
    Array(Vec<Value>),
    Map(OrderedMap),
    Set(OrderedSet),
}

impl Container {
    pub(crate) fn kind(&self) -> Kind {
        match self {
            Self::Object(_) => Kind::Object,
            Self::Array(_) => Kind::Array,
            Self::Map(_) => Kind::Map,
            Self::Set(_) => Kind::Set,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Object(m) | Self::Map(m) => m.len(),
            Self::Array(v) => v.len(),
            Self::Set(s) => s.len(),
        }
    }

    /// Raw lookup. Sets have no values and always read as `Null`.
    pub(crate) fn get(&self, key: &Key) -> Value {
        match self {
            Self::Object(m) => m.get(&key.to_property()).cloned().unwrap_or_default(),
            Self::Map(m) => m.get(key).cloned().unwrap_or_default(),
            Self::Array(v) => match key.array_slot() {
                Some(ArraySlot::Index(i)) => v.get(i).cloned().unwrap_or_default(),
                Some(ArraySlot::Length) => Value::from(v.len()),
                None => Value::Null,
            },
            Self::Set(_) => Value::Null,
        }
    }

    pub(crate) fn contains(&self, key: &Key) -> bool {
        match self {
            Self::Object(m) => m.contains_key(&key.to_property()),
            Self::Map(m) => m.contains_key(key),
            Self::Set(s) => s.contains(key),
            Self::Array(v) => matches!(key.array_slot(), Some(ArraySlot::Index(i)) if i < v.len()),
        }
    }

    pub(crate) fn keys(&self) -> Vec<Key> {
        match self {
            Self::Object(m) | Self::Map(m) => m.keys().cloned().collect(),
            Self::Set(s) => s.iter().cloned().collect(),
            Self::Array(v) => (0..v.len()).map(Key::from).collect(),
        }
    }

    /// Key/value pairs in order. A set entry pairs the key with itself.
    pub(crate) fn entries(&self) -> Vec<(Key, Value)> {
        match self {
            Self::Object(m) | Self::Map(m) => {
                m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            Self::Set(s) => s.iter().map(|k| (k.clone(), Value::from(k.clone()))).collect(),
            Self::Array(v) => v
                .iter()
                .enumerate()
                .map(|(i, v)| (Key::from(i), v.clone()))
                .collect(),
        }
    }
}

struct TargetCell {
    id: TargetId,
    data: RefCell<Container>,
}

impl Drop for TargetCell {
    fn drop(&mut self) {
        graph::forget_target(self.id);
    }
}

/// Handle to a raw (un-instrumented) container.
///
/// Cloning a `Target` creates a new handle to the **same** container.
#[derive(Clone)]
pub struct Target {
    cell: Rc<TargetCell>,
}

impl Target {
    fn with_container(data: Container) -> Self {
        Self {
            cell: Rc::new(TargetCell {
                id: next_target_id(),
                data: RefCell::new(data),
            }),
        }
    }

    /// Create an empty plain object.
    #[must_use]
    pub fn object() -> Self {
        Self::with_container(Container::Object(OrderedMap::default()))
    }

    /// Create an empty array.
    #[must_use]
    pub fn array() -> Self {
        Self::with_container(Container::Array(Vec::new()))
    }

    /// Create an empty map.
    #[must_use]
    pub fn map() -> Self {
        Self::with_container(Container::Map(OrderedMap::default()))
    }

    /// Create an empty set.
    #[must_use]
    pub fn set() -> Self {
        Self::with_container(Container::Set(OrderedSet::default()))
    }

    /// Create a plain object from key/value pairs (keys are normalised to
    /// strings, later duplicates overwrite earlier ones).
    pub fn object_from<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.into().to_property(), v.into()))
            .collect();
        Self::with_container(Container::Object(map))
    }

    /// Create an array from values.
    pub fn array_from<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Self::with_container(Container::Array(
            values.into_iter().map(Into::into).collect(),
        ))
    }

    /// Create a map from key/value pairs.
    pub fn map_from<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::with_container(Container::Map(map))
    }

    /// Create a set from keys.
    pub fn set_from<K: Into<Key>>(keys: impl IntoIterator<Item = K>) -> Self {
        Self::with_container(Container::Set(
            keys.into_iter().map(Into::into).collect(),
        ))
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> TargetId {
        self.cell.id
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.borrow().kind()
    }

    /// Whether both handles point at the same container.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    /// Untracked read of a single entry.
    #[must_use]
    pub fn peek(&self, key: impl Into<Key>) -> Value {
        self.borrow().get(&key.into())
    }

    /// Untracked entry count (object keys, array length, map/set size).
    #[must_use]
    pub fn len(&self) -> usize {
        self.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Untracked key listing, in insertion (or index) order.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.borrow().keys()
    }

    pub(crate) fn borrow(&self) -> Ref<'_, Container> {
        self.cell.data.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, Container> {
        self.cell.data.borrow_mut()
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Target {}

impl std::hash::Hash for Target {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.cell.id.hash(state);
    }
}

// Contents are not printed: targets may be cyclic.
impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, len) = match self.cell.data.try_borrow() {
            Ok(data) => (Some(data.kind()), Some(data.len())),
            Err(_) => (None, None),
        };
        f.debug_struct("Target")
            .field("id", &self.cell.id)
            .field("kind", &kind)
            .field("len", &len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Target::object();
        let b = Target::object();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn object_keys_keep_insertion_order() {
        let t = Target::object_from([("b", 1), ("a", 2), ("c", 3)]);
        let keys: Vec<String> = t.keys().iter().map(ToString::to_string).collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn peek_reads_without_instrumentation() {
        let t = Target::array_from([10, 20]);
        assert_eq!(t.peek(1), Value::from(20));
        assert_eq!(t.peek("length"), Value::from(2));
        assert_eq!(t.peek(7), Value::Null);
        assert_eq!(t.kind(), Kind::Array);
    }

    #[test]
    fn set_entries_read_as_null() {
        let t = Target::set_from(["x"]);
        assert_eq!(t.peek("x"), Value::Null);
        assert!(t.borrow().contains(&Key::from("x")));
    }

    #[test]
    fn numeric_object_keys_alias_strings() {
        let t = Target::object_from([(Key::from(1), Value::from("one"))]);
        assert_eq!(t.peek("1"), Value::from("one"));
    }
}
