//! Protocol messages.
//!
//! Logical wire shape: `(sequence_id, kind, handler, args)`. The handler is a
//! closed set of operations; any named-attribute access travels as a string
//! argument of `GetAttr`/`SetAttr`/`DelAttr`/`CallAttr`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::serialization::MultiFormat;
use crate::protocol::object::RemoteError;
use crate::protocol::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Reply,
    Exception,
}

/// Requested operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Handler {
    /// `[version, service_name]`, exchanged once by both sides
    Hello,
    /// `[]`, one-way
    Close,
    /// Echoes its arguments
    Ping,
    /// `[]` → the peer's root service
    GetRoot,
    GetAttr,
    SetAttr,
    DelAttr,
    Call,
    CallAttr,
    Repr,
    Str,
    Compare,
    GetItem,
    SetItem,
    DelItem,
    Len,
    /// Attribute names of the target (the proxy's cached shape)
    Dir,
    /// Obtain the target by value
    Snapshot,
    /// `[target, count]` → up to `count` items of a remote iterator
    BuffIter,
    /// `[object_id, count]`, one-way
    Release,
}

impl Handler {
    /// Handlers that never produce a reply
    pub fn is_one_way(self) -> bool {
        matches!(self, Handler::Close | Handler::Release | Handler::Hello)
    }

    pub fn name(self) -> &'static str {
        match self {
            Handler::Hello => "HELLO",
            Handler::Close => "CLOSE",
            Handler::Ping => "PING",
            Handler::GetRoot => "GETROOT",
            Handler::GetAttr => "GETATTR",
            Handler::SetAttr => "SETATTR",
            Handler::DelAttr => "DELATTR",
            Handler::Call => "CALL",
            Handler::CallAttr => "CALLATTR",
            Handler::Repr => "REPR",
            Handler::Str => "STR",
            Handler::Compare => "COMPARE",
            Handler::GetItem => "GETITEM",
            Handler::SetItem => "SETITEM",
            Handler::DelItem => "DELITEM",
            Handler::Len => "LEN",
            Handler::Dir => "DIR",
            Handler::Snapshot => "SNAPSHOT",
            Handler::BuffIter => "BUFFITER",
            Handler::Release => "RELEASE",
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison operator carried by `Compare`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
        }
    }

    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            _ => None,
        }
    }

    /// Apply the operator to an ordering
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    pub kind: MessageKind,
    pub handler: Handler,
    pub args: Vec<Value>,
}

impl MultiFormat for Message {}

impl Message {
    pub fn request(seq: u64, handler: Handler, args: Vec<Value>) -> Self {
        Self {
            seq,
            kind: MessageKind::Request,
            handler,
            args,
        }
    }

    pub fn reply(seq: u64, handler: Handler, value: Value) -> Self {
        Self {
            seq,
            kind: MessageKind::Reply,
            handler,
            args: vec![value],
        }
    }

    pub fn exception(seq: u64, handler: Handler, exc: &RemoteException) -> Self {
        Self {
            seq,
            kind: MessageKind::Exception,
            handler,
            args: exc.to_values(),
        }
    }
}

/// Whether an EXCEPTION came from the handler or from the exposure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionCategory {
    Operation,
    Denied,
}

/// Structured failure carried by an EXCEPTION message
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteException {
    pub category: ExceptionCategory,
    pub error: RemoteError,
}

impl RemoteException {
    pub fn operation(error: RemoteError) -> Self {
        Self {
            category: ExceptionCategory::Operation,
            error,
        }
    }

    pub fn denied(error: RemoteError) -> Self {
        Self {
            category: ExceptionCategory::Denied,
            error,
        }
    }

    /// `[category, kind, message, traceback | None]`
    pub fn to_values(&self) -> Vec<Value> {
        let category = match self.category {
            ExceptionCategory::Operation => "operation",
            ExceptionCategory::Denied => "denied",
        };
        vec![
            Value::Str(category.to_string()),
            Value::Str(self.error.kind.clone()),
            Value::Str(self.error.message.clone()),
            self.error
                .traceback
                .clone()
                .map(Value::Str)
                .unwrap_or(Value::None),
        ]
    }

    pub fn from_values(args: &[Value]) -> Option<Self> {
        let [category, kind, message, traceback] = args else {
            return None;
        };
        let category = match category.as_str()? {
            "operation" => ExceptionCategory::Operation,
            "denied" => ExceptionCategory::Denied,
            _ => return None,
        };
        let traceback = match traceback {
            Value::None => None,
            Value::Str(tb) => Some(tb.clone()),
            _ => return None,
        };
        Some(Self {
            category,
            error: RemoteError {
                kind: kind.as_str()?.to_string(),
                message: message.as_str()?.to_string(),
                traceback,
            },
        })
    }

    /// Reconstruct the failure on the calling side
    pub fn into_error(self) -> crate::error::ProtocolError {
        match self.category {
            ExceptionCategory::Operation => crate::error::ProtocolError::Remote(self.error),
            ExceptionCategory::Denied => crate::error::ProtocolError::PolicyDenied(self.error),
        }
    }
}
