#![forbid(unsafe_code)]

//! JSON bridge for containers.
//!
//! Objects and maps encode as JSON objects (map keys are stringified), arrays
//! and sets as JSON arrays. Integral numbers encode as integers; `NaN` and
//! infinities encode as `null`.
//!
//! [`Observable::to_json`] is a deep *tracked* read: a reaction that encodes
//! an observable re-runs when anything it encoded changes, nested containers
//! included.
//!
//! # Failure Modes
//!
//! - **Cycles**: a container reachable from itself cannot be encoded and
//!   yields [`ObserveError::Cyclic`].

use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::error::{ObserveError, Result};
use crate::observable::{Observable, observable};
use crate::target::{Target, TargetId};
use crate::value::{Kind, Value};

/// Integers beyond this lose precision as `f64`.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

impl Value {
    /// Build a value from JSON. Objects and arrays become fresh targets.
    #[must_use]
    pub fn from_json(json: Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            Json::String(s) => Self::from(s),
            Json::Array(items) => Self::Ref(Target::array_from(items.into_iter().map(Self::from_json))),
            Json::Object(fields) => Self::Ref(Target::object_from(
                fields.into_iter().map(|(k, v)| (k, Self::from_json(v))),
            )),
        }
    }

    /// Untracked deep encoding.
    pub fn to_json(&self) -> Result<Json> {
        encode_value(self, false, &mut Vec::new())
    }
}

impl Target {
    /// Build a container from a JSON object or array.
    pub fn from_json(json: Json) -> Result<Self> {
        match Value::from_json(json) {
            Value::Ref(target) => Ok(target),
            other => Err(ObserveError::NotObservable {
                kind: other.type_name(),
            }),
        }
    }

    /// Untracked deep encoding.
    pub fn to_json(&self) -> Result<Json> {
        encode(self, false, &mut Vec::new())
    }
}

impl Observable {
    /// Tracked deep encoding.
    pub fn to_json(&self) -> Result<Json> {
        encode(self.raw(), true, &mut Vec::new())
    }
}

fn encode(target: &Target, tracked: bool, path: &mut Vec<TargetId>) -> Result<Json> {
    let id = target.id();
    if path.contains(&id) {
        return Err(ObserveError::Cyclic { id });
    }
    path.push(id);

    let (kind, entries) = if tracked {
        let view = observable(target);
        (view.kind(), view.entries())
    } else {
        (target.kind(), target.borrow().entries())
    };
    let json = match kind {
        Kind::Array | Kind::Set => Json::Array(
            entries
                .iter()
                .map(|(_, value)| encode_value(value, tracked, path))
                .collect::<Result<_>>()?,
        ),
        Kind::Object | Kind::Map => Json::Object(
            entries
                .iter()
                .map(|(key, value)| Ok((key.to_string(), encode_value(value, tracked, path)?)))
                .collect::<Result<JsonMap<_, _>>>()?,
        ),
    };

    path.pop();
    Ok(json)
}

fn encode_value(value: &Value, tracked: bool, path: &mut Vec<TargetId>) -> Result<Json> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => encode_number(*n),
        Value::String(s) => Json::String(s.to_string()),
        Value::Ref(target) => encode(target, tracked, path)?,
    })
}

fn encode_number(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Json::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Json::Null, Json::Number)
    }
}
