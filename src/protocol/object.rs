//! Exposable objects and application-level values.
//!
//! Anything a process wants to serve implements [`RemoteObject`]. Each method
//! corresponds to one protocol handler; the defaults raise the same error a
//! dynamic object model would (`AttributeError`, `TypeError`), so an
//! implementation only overrides what it supports.
//!
//! [`Data`] is the value type seen by application code on both sides. Its plain
//! variants travel by value. `Data::Object` is a live local object, boxed into
//! a reference marker when it crosses the wire, and `Data::Proxy` is a handle
//! to an object owned by the peer.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::ProtocolError;
use crate::protocol::connection::Connection;
use crate::protocol::message::{CompareOp, Handler};
use crate::protocol::proxy::Proxy;
use crate::protocol::value::TypeInfo;

/// Shared handle to an exposable object
pub type ObjectRef = Arc<dyn RemoteObject>;

/// Failure raised by an object's handler and reconstructed at the call site.
///
/// `kind` names the failure class (`"KeyError"`, `"ValueError"`, ...), the
/// message is free text and the traceback is optional context added by the
/// owning side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub traceback: Option<String>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn attribute(type_info: &TypeInfo, name: &str) -> Self {
        Self::new(
            "AttributeError",
            format!("'{type_info}' object has no attribute '{name}'"),
        )
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new("KeyError", message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new("IndexError", message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::new("ReferenceError", message)
    }

    /// Raised on the owning side when the exposure policy refuses an operation
    pub fn denied(operation: &str) -> Self {
        Self::new(
            "PermissionDenied",
            format!("operation '{operation}' is not exposed"),
        )
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// A handler that calls into another connection re-raises the nested failure
/// with its original kind; transport problems surface as `ConnectionError`.
impl From<ProtocolError> for RemoteError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Remote(inner) | ProtocolError::PolicyDenied(inner) => inner,
            ProtocolError::Timeout | ProtocolError::Expired => {
                RemoteError::new("TimeoutError", err.to_string())
            }
            other if other.is_connectivity() => {
                RemoteError::new("ConnectionError", other.to_string())
            }
            other => RemoteError::new("ProtocolError", other.to_string()),
        }
    }
}

/// Context handed to every handler invocation
#[derive(Clone)]
pub struct CallContext {
    connection: Connection,
    seq: u64,
    handler: Handler,
}

impl CallContext {
    pub(crate) fn new(connection: Connection, seq: u64, handler: Handler) -> Self {
        Self {
            connection,
            seq,
            handler,
        }
    }

    /// The connection the request arrived on
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn handler(&self) -> Handler {
        self.handler
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// An object that can be served to a peer.
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    /// Type carried in reference markers and used by by-value boxing rules
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new(short_type_name::<Self>())
    }

    /// Attribute and method names this object offers. Serves both the
    /// peer's shape cache (`Dir`) and the restricted-mode allow-list.
    fn attribute_names(&self) -> Vec<String> {
        Vec::new()
    }

    async fn getattr(&self, _ctx: &CallContext, name: &str) -> Result<Data, RemoteError> {
        Err(RemoteError::attribute(&self.type_info(), name))
    }

    async fn setattr(
        &self,
        _ctx: &CallContext,
        name: &str,
        _value: Data,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::attribute(&self.type_info(), name))
    }

    async fn delattr(&self, _ctx: &CallContext, name: &str) -> Result<(), RemoteError> {
        Err(RemoteError::attribute(&self.type_info(), name))
    }

    async fn call(
        &self,
        _ctx: &CallContext,
        _args: Vec<Data>,
        _kwargs: Vec<(String, Data)>,
    ) -> Result<Data, RemoteError> {
        Err(RemoteError::type_error(format!(
            "'{}' object is not callable",
            self.type_info()
        )))
    }

    /// Look up `name` and call the result. Objects with native methods
    /// override this to skip materialising a bound method.
    async fn call_method(
        &self,
        ctx: &CallContext,
        name: &str,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
    ) -> Result<Data, RemoteError> {
        match self.getattr(ctx, name).await? {
            Data::Object(method) => method.call(ctx, args, kwargs).await,
            Data::Proxy(method) => Ok(method.call(args, kwargs).await?),
            other => Err(RemoteError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    async fn getitem(&self, _ctx: &CallContext, _key: Data) -> Result<Data, RemoteError> {
        Err(RemoteError::type_error(format!(
            "'{}' object is not subscriptable",
            self.type_info()
        )))
    }

    async fn setitem(
        &self,
        _ctx: &CallContext,
        _key: Data,
        _value: Data,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::type_error(format!(
            "'{}' object does not support item assignment",
            self.type_info()
        )))
    }

    async fn delitem(&self, _ctx: &CallContext, _key: Data) -> Result<(), RemoteError> {
        Err(RemoteError::type_error(format!(
            "'{}' object does not support item deletion",
            self.type_info()
        )))
    }

    async fn len(&self, _ctx: &CallContext) -> Result<usize, RemoteError> {
        Err(RemoteError::type_error(format!(
            "object of type '{}' has no len()",
            self.type_info()
        )))
    }

    /// Next `count` items of an iterator; an empty vector means exhausted
    async fn next_chunk(&self, _ctx: &CallContext, _count: usize) -> Result<Vec<Data>, RemoteError> {
        Err(RemoteError::type_error(format!(
            "'{}' object is not an iterator",
            self.type_info()
        )))
    }

    fn repr(&self) -> String {
        format!("<{} object>", self.type_info())
    }

    fn display(&self) -> String {
        self.repr()
    }

    /// Default comparison is identity: equal only to the same object
    fn compare(&self, op: CompareOp, other: &Data) -> Result<bool, RemoteError> {
        let me = self as *const Self as *const ();
        let same = match other {
            Data::Object(obj) => Arc::as_ptr(obj) as *const () == me,
            _ => false,
        };
        match op {
            CompareOp::Eq => Ok(same),
            CompareOp::Ne => Ok(!same),
            _ => Err(RemoteError::type_error(format!(
                "'{}' not supported for '{}' objects",
                op.as_str(),
                self.type_info()
            ))),
        }
    }

    /// By-value representation (`Snapshot` handler and by-value boxing rules)
    fn snapshot(&self) -> Result<Data, RemoteError> {
        Err(RemoteError::type_error(format!(
            "'{}' object cannot be sent by value",
            self.type_info()
        )))
    }

    /// Release hook: runs once the peer dropped its last reference
    fn on_release(&self) {}
}

/// Application-level value
#[derive(Clone, Default)]
pub enum Data {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Data>),
    Tuple(Vec<Data>),
    Map(Vec<(Data, Data)>),
    /// Live local object; crosses the wire by reference
    Object(ObjectRef),
    /// Object owned by the peer
    Proxy(Proxy),
}

impl Data {
    /// Wrap a local object
    pub fn object<T: RemoteObject>(obj: T) -> Self {
        Data::Object(Arc::new(obj))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Data::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Data::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Data::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Data::Float(f) => Some(*f),
            Data::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Data::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Data]> {
        match self {
            Data::List(items) | Data::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Data::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Data::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    pub fn into_proxy(self) -> Option<Proxy> {
        match self {
            Data::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// Short type name used in error messages
    pub fn type_name(&self) -> String {
        match self {
            Data::None => "None".into(),
            Data::Bool(_) => "bool".into(),
            Data::Int(_) => "int".into(),
            Data::Float(_) => "float".into(),
            Data::Str(_) => "str".into(),
            Data::Bytes(_) => "bytes".into(),
            Data::List(_) => "list".into(),
            Data::Tuple(_) => "tuple".into(),
            Data::Map(_) => "map".into(),
            Data::Object(obj) => obj.type_info().name,
            Data::Proxy(proxy) => proxy.type_info().name.clone(),
        }
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::None => f.write_str("None"),
            Data::Bool(b) => write!(f, "Bool({b})"),
            Data::Int(i) => write!(f, "Int({i})"),
            Data::Float(x) => write!(f, "Float({x})"),
            Data::Str(s) => write!(f, "Str({s:?})"),
            Data::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Data::List(items) => f.debug_tuple("List").field(items).finish(),
            Data::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Data::Map(pairs) => f.debug_tuple("Map").field(pairs).finish(),
            Data::Object(obj) => write!(f, "Object({})", obj.repr()),
            Data::Proxy(proxy) => write!(f, "{proxy:?}"),
        }
    }
}

/// Structural equality for plain values, identity for objects and proxies
impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Data::None, Data::None) => true,
            (Data::Bool(a), Data::Bool(b)) => a == b,
            (Data::Int(a), Data::Int(b)) => a == b,
            (Data::Float(a), Data::Float(b)) => a == b,
            (Data::Str(a), Data::Str(b)) => a == b,
            (Data::Bytes(a), Data::Bytes(b)) => a == b,
            (Data::List(a), Data::List(b)) | (Data::Tuple(a), Data::Tuple(b)) => a == b,
            (Data::Map(a), Data::Map(b)) => a == b,
            (Data::Object(a), Data::Object(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (Data::Proxy(a), Data::Proxy(b)) => a.same_object(b),
            _ => false,
        }
    }
}

impl From<()> for Data {
    fn from(_: ()) -> Self {
        Data::None
    }
}

impl From<bool> for Data {
    fn from(b: bool) -> Self {
        Data::Bool(b)
    }
}

impl From<i64> for Data {
    fn from(i: i64) -> Self {
        Data::Int(i)
    }
}

impl From<i32> for Data {
    fn from(i: i32) -> Self {
        Data::Int(i64::from(i))
    }
}

impl From<usize> for Data {
    fn from(i: usize) -> Self {
        Data::Int(i as i64)
    }
}

impl From<f64> for Data {
    fn from(x: f64) -> Self {
        Data::Float(x)
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Str(s.to_string())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Str(s)
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Data::Bytes(b)
    }
}

impl From<Vec<Data>> for Data {
    fn from(items: Vec<Data>) -> Self {
        Data::List(items)
    }
}

impl From<ObjectRef> for Data {
    fn from(obj: ObjectRef) -> Self {
        Data::Object(obj)
    }
}

impl From<Proxy> for Data {
    fn from(proxy: Proxy) -> Self {
        Data::Proxy(proxy)
    }
}
