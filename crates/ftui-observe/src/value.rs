#![forbid(unsafe_code)]

//! Dynamic values stored inside observable containers.
//!
//! Containers never hold other containers by value: nested objects, arrays,
//! maps and sets are stored as [`Value::Ref`] handles to a raw [`Target`],
//! so two parents can share one child and both see its mutations.
//!
//! # Equality
//!
//! `Value` equality is *same-value* equality, the comparison used to decide
//! whether a write changed anything:
//!
//! - numbers compare with `==`, except that `NaN` equals `NaN` (a write of
//!   `NaN` over `NaN` is not a change) and `+0` equals `-0`;
//! - strings compare by content;
//! - references compare by identity, never structurally.

use std::fmt;
use std::rc::Rc;

use crate::observable::{Observable, observable};
use crate::target::Target;

/// A value held by an observable container.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent or explicitly empty value.
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    /// A nested container, stored by reference.
    Ref(Target),
}

impl Value {
    /// Same-value comparison used for change detection.
    #[must_use]
    pub fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Short type name, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Ref(target) => target.kind().as_str(),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The number as an integer, if it is finite and has no fractional part.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_target(&self) -> Option<&Target> {
        match self {
            Self::Ref(target) => Some(target),
            _ => None,
        }
    }

    /// Wrap a nested container in its (identity-stable) observable.
    ///
    /// Returns `None` for primitives.
    #[must_use]
    pub fn observable(&self) -> Option<Observable> {
        self.as_target().map(observable)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(Rc::from(s))
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Self::String(s)
    }
}

impl From<Target> for Value {
    fn from(target: Target) -> Self {
        Self::Ref(target)
    }
}

impl From<&Target> for Value {
    fn from(target: &Target) -> Self {
        Self::Ref(target.clone())
    }
}

/// Storing an observable stores its raw target: containers never hold proxies.
impl From<Observable> for Value {
    fn from(obs: Observable) -> Self {
        Self::Ref(obs.raw().clone())
    }
}

impl From<&Observable> for Value {
    fn from(obs: &Observable) -> Self {
        Self::Ref(obs.raw().clone())
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Str(s) => Self::String(s),
            Key::Int(n) => Self::Number(n as f64),
            Key::Bool(b) => Self::Bool(b),
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Property key of an object, index of an array, or key of a map/set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Str(Rc<str>),
    Int(i64),
    Bool(bool),
}

/// Where an array key points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArraySlot {
    Index(usize),
    Length,
}

impl Key {
    /// Object keys are strings: `o[0]` and `o["0"]` name the same property.
    #[must_use]
    pub(crate) fn to_property(&self) -> Self {
        match self {
            Self::Str(_) => self.clone(),
            Self::Int(n) => Self::Str(Rc::from(n.to_string())),
            Self::Bool(b) => Self::Str(Rc::from(if *b { "true" } else { "false" })),
        }
    }

    /// Interpret the key against an array: an index or the `length` property.
    pub(crate) fn array_slot(&self) -> Option<ArraySlot> {
        match self {
            Self::Int(n) => usize::try_from(*n).ok().map(ArraySlot::Index),
            Self::Str(s) if &**s == "length" => Some(ArraySlot::Length),
            Self::Str(s) => canonical_index(s).map(ArraySlot::Index),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Plain decimal digits with no sign and no leading zero. `"01"` and `"+1"`
/// are ordinary property names, not indices.
fn canonical_index(s: &str) -> Option<usize> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Str(Rc::from(s))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Str(Rc::from(s))
    }
}

impl From<Rc<str>> for Key {
    fn from(s: Rc<str>) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<usize> for Key {
    fn from(n: usize) -> Self {
        Self::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The container variant of a target, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Object,
    Array,
    Map,
    Set,
}

impl Kind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::Map => "map",
            Self::Set => "set",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
