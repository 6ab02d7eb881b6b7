#![forbid(unsafe_code)]

//! The instrumented view of a raw container.
//!
//! An [`Observable`] routes every read and write of its [`Target`] through
//! the engine: reads made while a reaction runs record dependency edges,
//! writes that change something look up the subscribed reactions and hand
//! them to their schedulers.
//!
//! | Kind | read registers | write notifies |
//! |---|---|---|
//! | Object | `get(k)`: `k`; `has`/`len`/`keys`: iterate | new key: `k` + iterate; changed: `k`; delete: `k` + iterate |
//! | Array | `get(i)`: `i`; `length`/`has`/`len`/`keys`: length | in bounds: `i`; growth or shrink: each touched index + length |
//! | Map | `get(k)`/`has(k)`: `k`; `len`/`keys`: iterate | as Object |
//! | Set | `has(k)`: `k`; `len`/`keys`: iterate | `add`/`delete`: `k` + iterate |
//!
//! `values()` and `entries()` register the shape token plus every key.
//!
//! # Invariants
//!
//! 1. Wrapping is idempotent: one live `Observable` per target, so
//!    `observable(&observable(&t)) == observable(&t)`.
//! 2. Writing a value that is same-value equal to the current one notifies
//!    nobody.
//! 3. One logical mutation (a `push`, a `splice`, a `clear`) notifies each
//!    subscribed reaction once.
//! 4. No container borrow is held while reactions run or debuggers are
//!    called, so reactions may freely read and write the target that
//!    triggered them.
//!
//! # Failure Modes
//!
//! - **Kind mismatch**: writes that make no sense for the container return
//!   [`ObserveError::Unsupported`]; reads return `Null`/`false` and track
//!   nothing.
//! - **Malformed array key**: [`ObserveError::InvalidIndex`].
//! - **Array growth past [`MAX_ARRAY_LEN`]**: [`ObserveError::InvalidIndex`]
//!   or [`ObserveError::InvalidLength`]; the array is left untouched.

use std::cell::RefCell;
use std::fmt;
use std::ops::Range;
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tracing::trace;

use crate::error::{ObserveError, Result};
use crate::graph::{self, DepKey};
use crate::operation::{Operation, OperationKind};
use crate::scheduler;
use crate::target::{Container, OrderedMap, Target, TargetId};
use crate::tracking;
use crate::value::{ArraySlot, Key, Kind, Value};

/// Largest length an array may grow to; indices stay below it.
///
/// Arrays are dense, so growing one allocates every slot up to the new
/// length. Writes past this bound fail with [`ObserveError::InvalidIndex`]
/// or [`ObserveError::InvalidLength`] instead of attempting the allocation.
pub const MAX_ARRAY_LEN: usize = 1 << 24;

struct ProxyCell {
    target: Target,
}

impl Drop for ProxyCell {
    fn drop(&mut self) {
        let id = self.target.id();
        let _ = PROXIES.try_with(|proxies| {
            if let Ok(mut proxies) = proxies.try_borrow_mut()
                && proxies.get(&id).is_some_and(|weak| weak.strong_count() == 0)
            {
                proxies.remove(&id);
            }
        });
    }
}

thread_local! {
    static PROXIES: RefCell<AHashMap<TargetId, Weak<ProxyCell>>> =
        RefCell::new(AHashMap::default());
}

/// Anything that designates a raw target.
pub trait AsTarget {
    fn as_target(&self) -> &Target;
}

impl AsTarget for Target {
    fn as_target(&self) -> &Target {
        self
    }
}

impl AsTarget for Observable {
    fn as_target(&self) -> &Target {
        &self.proxy.target
    }
}

/// Wrap a target (or return the existing wrapper).
pub fn observable<T: AsTarget + ?Sized>(source: &T) -> Observable {
    let target = source.as_target();
    let id = target.id();
    let existing = PROXIES
        .try_with(|proxies| proxies.borrow().get(&id).and_then(Weak::upgrade))
        .ok()
        .flatten();
    if let Some(proxy) = existing {
        return Observable { proxy };
    }

    let proxy = Rc::new(ProxyCell {
        target: target.clone(),
    });
    let _ = PROXIES.try_with(|proxies| {
        proxies.borrow_mut().insert(id, Rc::downgrade(&proxy));
    });
    trace!(target = id.raw(), kind = %target.kind(), "observable created");
    Observable { proxy }
}

/// Wrap a value, rejecting primitives.
pub fn try_observable(value: &Value) -> Result<Observable> {
    match value {
        Value::Ref(target) => Ok(observable(target)),
        other => Err(ObserveError::NotObservable {
            kind: other.type_name(),
        }),
    }
}

/// Whether `target` currently has a live observable wrapper.
#[must_use]
pub fn is_observable(target: &Target) -> bool {
    PROXIES
        .try_with(|proxies| {
            proxies
                .borrow()
                .get(&target.id())
                .is_some_and(|weak| weak.strong_count() > 0)
        })
        .unwrap_or(false)
}

/// Tracked handle to a container. Cloning yields the same observable.
#[derive(Clone)]
pub struct Observable {
    proxy: Rc<ProxyCell>,
}

impl PartialEq for Observable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.proxy, &other.proxy)
    }
}

impl Eq for Observable {}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Observable").field(&self.proxy.target).finish()
    }
}

/// A write that happened, computed while the container was borrowed and
/// delivered after the borrow ended.
struct Change {
    kind: OperationKind,
    key: Option<DepKey>,
    value: Option<Value>,
    old_value: Option<Value>,
    notify: Vec<DepKey>,
    /// Array indices whose subscribers are notified ahead of `notify`.
    span: Range<usize>,
    /// Values removed by the write. They are dropped only after delivery.
    garbage: Vec<Value>,
}

impl Change {
    fn new(kind: OperationKind, key: Option<DepKey>, notify: Vec<DepKey>) -> Self {
        Self {
            kind,
            key,
            value: None,
            old_value: None,
            notify,
            span: 0..0,
            garbage: Vec::new(),
        }
    }

    /// An array shape change: every index between the two lengths, then the
    /// length token.
    fn resize(kind: OperationKind, key: Option<DepKey>, from: usize, to: usize) -> Self {
        Self {
            span: from.min(to)..from.max(to),
            ..Self::new(kind, key, vec![DepKey::Length])
        }
    }

    fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    fn old_value(mut self, old: Value) -> Self {
        self.old_value = Some(old);
        self
    }

    fn garbage(mut self, garbage: Vec<Value>) -> Self {
        self.garbage = garbage;
        self
    }
}

fn index_key(i: usize) -> DepKey {
    DepKey::Key(Key::from(i))
}

fn keyed_set(map: &mut OrderedMap, key: Key, value: Value) -> Option<Change> {
    match map.get_mut(&key) {
        Some(slot) if slot.same_value(&value) => None,
        Some(slot) => {
            let old = std::mem::replace(slot, value.clone());
            let dep = DepKey::Key(key);
            Some(
                Change::new(OperationKind::Set, Some(dep.clone()), vec![dep])
                    .value(value)
                    .old_value(old),
            )
        }
        None => {
            map.insert(key.clone(), value.clone());
            let dep = DepKey::Key(key);
            Some(
                Change::new(OperationKind::Add, Some(dep.clone()), vec![dep, DepKey::Iterate])
                    .value(value),
            )
        }
    }
}

fn keyed_delete(map: &mut OrderedMap, key: Key) -> Option<Change> {
    let old = map.shift_remove(&key)?;
    let dep = DepKey::Key(key);
    Some(
        Change::new(OperationKind::Delete, Some(dep.clone()), vec![dep, DepKey::Iterate])
            .old_value(old),
    )
}

fn array_set(items: &mut Vec<Value>, index: usize, value: Value) -> Option<Change> {
    if let Some(slot) = items.get_mut(index) {
        if slot.same_value(&value) {
            return None;
        }
        let old = std::mem::replace(slot, value.clone());
        return Some(
            Change::new(OperationKind::Set, Some(index_key(index)), vec![index_key(index)])
                .value(value)
                .old_value(old),
        );
    }
    let old_len = items.len();
    items.resize(index, Value::Null);
    items.push(value.clone());
    Some(
        Change::resize(OperationKind::Add, Some(index_key(index)), old_len, index + 1)
            .value(value),
    )
}

fn array_set_len(items: &mut Vec<Value>, len: usize) -> Option<Change> {
    let old_len = items.len();
    if len == old_len {
        return None;
    }
    let removed = if len < old_len {
        items.split_off(len)
    } else {
        items.resize(len, Value::Null);
        Vec::new()
    };
    Some(
        Change::resize(OperationKind::Set, Some(DepKey::Length), old_len, len)
            .value(Value::from(len))
            .old_value(Value::from(old_len))
            .garbage(removed),
    )
}

fn array_index(key: &Key) -> Result<usize> {
    match key.array_slot() {
        Some(ArraySlot::Index(i)) if i < MAX_ARRAY_LEN => Ok(i),
        _ => Err(ObserveError::InvalidIndex { key: key.clone() }),
    }
}

fn array_len(value: &Value) -> Result<usize> {
    value
        .as_i64()
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n <= MAX_ARRAY_LEN)
        .ok_or_else(|| ObserveError::InvalidLength {
            value: format!("{value:?}"),
        })
}

impl Observable {
    /// The raw target. Reads through it are never tracked.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &Target {
        &self.proxy.target
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> TargetId {
        self.proxy.target.id()
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.proxy.target.kind()
    }

    // -----------------------------------------------------------------------
    // Tracking
    // -----------------------------------------------------------------------

    fn track(&self, kind: OperationKind, key: DepKey) {
        let Some(reaction) = tracking::current_reaction() else {
            return;
        };
        if reaction.is_disposed() {
            return;
        }
        if let Some(debugger) = reaction.core().debugger() {
            let debugger = Rc::clone(debugger);
            debugger(&Operation::read(kind, self.raw().clone(), key.clone()));
        }
        graph::track(self.id(), key, &reaction);
    }

    fn shape_token(kind: Kind) -> DepKey {
        if kind == Kind::Array {
            DepKey::Length
        } else {
            DepKey::Iterate
        }
    }

    fn track_shape(&self, kind: Kind) {
        self.track(OperationKind::Iterate, Self::shape_token(kind));
    }

    fn commit(&self, change: Change) {
        let Change {
            kind,
            key,
            value,
            old_value,
            notify,
            span,
            garbage,
        } = change;
        let reactions = graph::reactions_for_span(self.id(), span, &notify);
        if !reactions.is_empty() {
            let operation = Operation {
                kind,
                target: self.raw().clone(),
                key,
                value,
                old_value,
            };
            for reaction in reactions {
                scheduler::queue_reaction(reaction, &operation);
            }
        }
        drop(garbage);
    }

    fn write(&self, f: impl FnOnce(&mut Container) -> Result<Option<Change>>) -> Result<()> {
        let change = f(&mut self.raw().borrow_mut())?;
        if let Some(change) = change {
            self.commit(change);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Tracked read of one entry. Missing entries read as `Null`.
    ///
    /// On arrays, `"length"` reads the length and registers the length token.
    pub fn get(&self, key: impl Into<Key>) -> Value {
        let key = key.into();
        let kind = self.kind();
        let dep = match kind {
            Kind::Object => DepKey::Key(key.to_property()),
            Kind::Map => DepKey::Key(key),
            Kind::Array => match key.array_slot() {
                Some(ArraySlot::Index(i)) => index_key(i),
                Some(ArraySlot::Length) => DepKey::Length,
                None => return Value::Null,
            },
            Kind::Set => return Value::Null,
        };
        self.track(OperationKind::Get, dep.clone());
        match dep {
            DepKey::Key(key) => self.raw().borrow().get(&key),
            _ => Value::from(self.raw().len()),
        }
    }

    /// Tracked read of a nested container, wrapped in its observable.
    pub fn get_observable(&self, key: impl Into<Key>) -> Option<Observable> {
        self.get(key).observable()
    }

    /// Tracked membership test.
    pub fn has(&self, key: impl Into<Key>) -> bool {
        let key = key.into();
        let kind = self.kind();
        match kind {
            Kind::Object | Kind::Array => {
                self.track(OperationKind::Has, Self::shape_token(kind));
            }
            Kind::Map | Kind::Set => self.track(OperationKind::Has, DepKey::Key(key.clone())),
        }
        self.raw().borrow().contains(&key)
    }

    /// Tracked size: key count, array length, or map/set size.
    pub fn len(&self) -> usize {
        self.track_shape(self.kind());
        self.raw().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked key listing in insertion (or index) order.
    pub fn keys(&self) -> Vec<Key> {
        self.track_shape(self.kind());
        self.raw().keys()
    }

    /// Tracked values. Set values are their keys.
    pub fn values(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    /// Tracked key/value pairs.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        let kind = self.kind();
        self.track_shape(kind);
        let entries = self.raw().borrow().entries();
        if kind != Kind::Set {
            for (key, _) in &entries {
                self.track(OperationKind::Get, DepKey::Key(key.clone()));
            }
        }
        entries
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Assign one entry. On arrays, an out-of-bounds index grows the array
    /// (new slots are `Null`) and `"length"` resizes it.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        self.write(|data| match data {
            Container::Object(map) => Ok(keyed_set(map, key.to_property(), value)),
            Container::Map(map) => Ok(keyed_set(map, key, value)),
            Container::Array(items) => match key.array_slot() {
                Some(ArraySlot::Length) => Ok(array_set_len(items, array_len(&value)?)),
                _ => Ok(array_set(items, array_index(&key)?, value)),
            },
            Container::Set(_) => Err(ObserveError::unsupported("set", Kind::Set)),
        })
    }

    /// Remove one entry, returning whether something was removed.
    ///
    /// Deleting an array element leaves a `Null` hole; the length is kept.
    pub fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        let mut removed = false;
        self.write(|data| {
            let change = match data {
                Container::Object(map) => keyed_delete(map, key.to_property()),
                Container::Map(map) => keyed_delete(map, key),
                Container::Set(set) => set.shift_take(&key).map(|old| {
                    let dep = DepKey::Key(old.clone());
                    Change::new(OperationKind::Delete, Some(dep.clone()), vec![dep, DepKey::Iterate])
                        .old_value(Value::from(old))
                }),
                Container::Array(items) => {
                    if key.array_slot() == Some(ArraySlot::Length) {
                        return Ok(None);
                    }
                    let index = array_index(&key)?;
                    match items.get_mut(index) {
                        Some(slot) if !slot.is_null() => {
                            let old = std::mem::take(slot);
                            Some(
                                Change::new(
                                    OperationKind::Delete,
                                    Some(index_key(index)),
                                    vec![index_key(index)],
                                )
                                .old_value(old),
                            )
                        }
                        _ => None,
                    }
                }
            };
            removed = change.is_some();
            Ok(change)
        })?;
        Ok(removed)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<()> {
        self.write(|data| {
            if data.len() == 0 {
                return Ok(None);
            }
            let (notify, garbage) = match data {
                Container::Object(map) | Container::Map(map) => {
                    let taken = std::mem::take(map);
                    let mut notify: Vec<DepKey> = taken.keys().cloned().map(DepKey::Key).collect();
                    notify.push(DepKey::Iterate);
                    (notify, taken.into_values().collect())
                }
                Container::Set(set) => {
                    let taken = std::mem::take(set);
                    let mut notify: Vec<DepKey> = taken.into_iter().map(DepKey::Key).collect();
                    notify.push(DepKey::Iterate);
                    (notify, Vec::new())
                }
                Container::Array(items) => {
                    let taken = std::mem::take(items);
                    let change = Change::resize(OperationKind::Clear, None, taken.len(), 0);
                    return Ok(Some(change.garbage(taken)));
                }
            };
            Ok(Some(Change::new(OperationKind::Clear, None, notify).garbage(garbage)))
        })
    }

    /// Add a key to a set, returning whether it was new.
    pub fn add(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        let mut added = false;
        self.write(|data| {
            let kind = data.kind();
            let Container::Set(set) = data else {
                return Err(ObserveError::unsupported("add", kind));
            };
            if !set.insert(key.clone()) {
                return Ok(None);
            }
            added = true;
            let dep = DepKey::Key(key.clone());
            Ok(Some(
                Change::new(OperationKind::Add, Some(dep.clone()), vec![dep, DepKey::Iterate])
                    .value(Value::from(key)),
            ))
        })?;
        Ok(added)
    }

    /// Append to an array, returning the new length.
    pub fn push(&self, value: impl Into<Value>) -> Result<usize> {
        let value = value.into();
        let mut len = 0;
        self.write(|data| {
            let kind = data.kind();
            let Container::Array(items) = data else {
                return Err(ObserveError::unsupported("push", kind));
            };
            let index = items.len();
            if index >= MAX_ARRAY_LEN {
                return Err(ObserveError::InvalidIndex {
                    key: Key::from(index),
                });
            }
            items.push(value.clone());
            len = items.len();
            Ok(Some(
                Change::resize(OperationKind::Add, Some(index_key(index)), index, len)
                    .value(value),
            ))
        })?;
        Ok(len)
    }

    /// Remove and return the last element (`Null` when empty).
    pub fn pop(&self) -> Result<Value> {
        let mut popped = Value::Null;
        self.write(|data| {
            let kind = data.kind();
            let Container::Array(items) = data else {
                return Err(ObserveError::unsupported("pop", kind));
            };
            let Some(last) = items.pop() else {
                return Ok(None);
            };
            popped = last.clone();
            let index = items.len();
            Ok(Some(
                Change::resize(OperationKind::Delete, Some(index_key(index)), index + 1, index)
                    .old_value(last),
            ))
        })?;
        Ok(popped)
    }

    /// Remove `delete_count` elements at `start` and insert `items` in
    /// their place, returning the removed elements. Both bounds are clamped
    /// to the array.
    pub fn splice<V: Into<Value>>(
        &self,
        start: usize,
        delete_count: usize,
        items: impl IntoIterator<Item = V>,
    ) -> Result<Vec<Value>> {
        let inserted: Vec<Value> = items.into_iter().map(Into::into).collect();
        let mut removed = Vec::new();
        self.write(|data| {
            let kind = data.kind();
            let Container::Array(values) = data else {
                return Err(ObserveError::unsupported("splice", kind));
            };
            let old_len = values.len();
            let start = start.min(old_len);
            let delete_count = delete_count.min(old_len - start);
            let new_len = old_len - delete_count + inserted.len();
            if new_len > MAX_ARRAY_LEN {
                return Err(ObserveError::InvalidIndex {
                    key: Key::from(new_len),
                });
            }
            if delete_count == 0 && inserted.is_empty() {
                return Ok(None);
            }

            let taken: Vec<Value> = values
                .splice(start..start + delete_count, inserted.iter().cloned())
                .collect();
            let change = if new_len == old_len {
                let notify: Vec<DepKey> = taken
                    .iter()
                    .zip(&inserted)
                    .enumerate()
                    .filter(|(_, (old, new))| !old.same_value(new))
                    .map(|(offset, _)| index_key(start + offset))
                    .collect();
                let first = notify.first().cloned();
                first.map(|first| Change::new(OperationKind::Set, Some(first), notify))
            } else {
                let end = old_len.max(new_len);
                Some(
                    Change::resize(OperationKind::Set, Some(DepKey::Length), start, end)
                        .value(Value::from(new_len))
                        .old_value(Value::from(old_len)),
                )
            };
            removed = taken;
            Ok(change)
        })?;
        Ok(removed)
    }

    /// Insert one element at `index` (clamped to the length).
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.splice(index, 0, [value.into()]).map(drop)
    }

    /// Resize an array, padding with `Null` or truncating.
    pub fn set_len(&self, len: usize) -> Result<()> {
        if len > MAX_ARRAY_LEN {
            return Err(ObserveError::InvalidLength {
                value: len.to_string(),
            });
        }
        self.write(|data| {
            let kind = data.kind();
            let Container::Array(items) = data else {
                return Err(ObserveError::unsupported("set_len", kind));
            };
            Ok(array_set_len(items, len))
        })
    }
}
