#![forbid(unsafe_code)]

//! Error type for observable construction and mutation.

use thiserror::Error;

use crate::target::TargetId;
use crate::value::{Key, Kind};

pub type Result<T> = std::result::Result<T, ObserveError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObserveError {
    /// Only objects, arrays, maps and sets can be wrapped.
    #[error("cannot observe a {kind} value: only objects, arrays, maps and sets are observable")]
    NotObservable { kind: &'static str },

    #[error("`{operation}` is not supported on {kind} targets")]
    Unsupported {
        operation: &'static str,
        kind: Kind,
    },

    #[error("invalid array index: {key}")]
    InvalidIndex { key: Key },

    #[error("invalid array length: {value}")]
    InvalidLength { value: String },

    #[error("cyclic reference through target {id}")]
    Cyclic { id: TargetId },
}

impl ObserveError {
    #[must_use]
    pub(crate) fn unsupported(operation: &'static str, kind: Kind) -> Self {
        Self::Unsupported { operation, kind }
    }
}
