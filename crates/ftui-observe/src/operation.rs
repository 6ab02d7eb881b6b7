#![forbid(unsafe_code)]

//! Operation records delivered to reaction debuggers.

use std::fmt;
use std::rc::Rc;

use crate::graph::DepKey;
use crate::target::Target;
use crate::value::Value;

/// What an intercepted access did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Get,
    Has,
    /// Enumeration or size read.
    Iterate,
    /// A key that did not exist before was written.
    Add,
    Set,
    Delete,
    Clear,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Has => "has",
            Self::Iterate => "iterate",
            Self::Add => "add",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Clear => "clear",
        }
    }

    /// Reads register dependencies; everything else triggers reactions.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Get | Self::Has | Self::Iterate)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked read or triggering write.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    /// The raw target that was accessed.
    pub target: Target,
    /// `None` for whole-container operations such as `clear`.
    pub key: Option<DepKey>,
    pub value: Option<Value>,
    pub old_value: Option<Value>,
}

impl Operation {
    pub(crate) fn read(kind: OperationKind, target: Target, key: DepKey) -> Self {
        Self {
            kind,
            target,
            key: Some(key),
            value: None,
            old_value: None,
        }
    }
}

/// Callback receiving every operation a reaction tracks or is triggered by.
pub type Debugger = Rc<dyn Fn(&Operation)>;
