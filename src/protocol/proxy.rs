//! # Proxy
//!
//! Local stand-in for an object owned by the peer. Every operation is
//! exactly one request carrying the proxy's object id as target; the result
//! is a plain value or another proxy, so chained access composes:
//!
//! ```ignore
//! let db = root.getattr("db").await?.into_proxy().ok_or(...)?;
//! let rows = db.call_method("query", vec!["users".into()], vec![]).await?;
//! ```
//!
//! All clones of a proxy (and every later reference to the same object)
//! share one inner handle. The attribute names are cached after the first
//! [`Proxy::dir`]; values never are. When the last clone drops, a `Release`
//! returns every reference the handle absorbed. Once the connection is
//! closed every operation fails with [`ProtocolError::ConnectionClosed`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::error::{ProtocolError, Result};
use crate::protocol::async_result::AsyncResult;
use crate::protocol::connection::Connection;
use crate::protocol::message::{CompareOp, Handler};
use crate::protocol::object::Data;
use crate::protocol::value::{ObjectId, TypeInfo};

pub(crate) struct ProxyInner {
    conn: Connection,
    id: ObjectId,
    type_info: TypeInfo,
    /// Reference markers absorbed by this handle
    refs: AtomicU64,
    shape: OnceCell<Vec<String>>,
}

impl ProxyInner {
    pub(crate) fn new(conn: Connection, id: ObjectId, type_info: TypeInfo) -> Self {
        Self {
            conn,
            id,
            type_info,
            refs: AtomicU64::new(1),
            shape: OnceCell::new(),
        }
    }

    pub(crate) fn absorb(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let refs = *self.refs.get_mut();
        self.conn.forget_proxy(self.id, self);
        self.conn.send_release(self.id, refs);
    }
}

/// Handle to a remote object
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    /// Object id on the owning side
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.inner.type_info
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn belongs_to(&self, conn: &Connection) -> bool {
        self.inner.conn.same_connection(conn)
    }

    /// True when both proxies stand for the same remote object
    pub fn same_object(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.id() == other.id() && self.inner.conn.same_connection(&other.inner.conn))
    }

    fn with_target(&self, mut args: Vec<Data>) -> Vec<Data> {
        args.insert(0, Data::Proxy(self.clone()));
        args
    }

    async fn request(&self, handler: Handler, args: Vec<Data>) -> Result<Data> {
        self.inner
            .conn
            .issue_request(handler, self.with_target(args))
            .await
    }

    fn request_async(&self, handler: Handler, args: Vec<Data>) -> AsyncResult {
        self.inner.conn.issue_async(handler, self.with_target(args))
    }

    pub async fn getattr(&self, name: &str) -> Result<Data> {
        self.request(Handler::GetAttr, vec![name.into()]).await
    }

    pub async fn setattr(&self, name: &str, value: impl Into<Data>) -> Result<()> {
        self.request(Handler::SetAttr, vec![name.into(), value.into()])
            .await
            .map(drop)
    }

    pub async fn delattr(&self, name: &str) -> Result<()> {
        self.request(Handler::DelAttr, vec![name.into()])
            .await
            .map(drop)
    }

    /// Call the remote object itself
    pub async fn call(&self, args: Vec<Data>, kwargs: Vec<(String, Data)>) -> Result<Data> {
        self.request(Handler::Call, call_args(args, kwargs)).await
    }

    /// Call method `name` in one round trip
    pub async fn call_method(
        &self,
        name: &str,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
    ) -> Result<Data> {
        let mut payload = vec![Data::from(name)];
        payload.extend(call_args(args, kwargs));
        self.request(Handler::CallAttr, payload).await
    }

    pub fn call_async(&self, args: Vec<Data>, kwargs: Vec<(String, Data)>) -> AsyncResult {
        self.request_async(Handler::Call, call_args(args, kwargs))
    }

    pub fn call_method_async(
        &self,
        name: &str,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
    ) -> AsyncResult {
        let mut payload = vec![Data::from(name)];
        payload.extend(call_args(args, kwargs));
        self.request_async(Handler::CallAttr, payload)
    }

    pub fn getattr_async(&self, name: &str) -> AsyncResult {
        self.request_async(Handler::GetAttr, vec![name.into()])
    }

    pub async fn getitem(&self, key: impl Into<Data>) -> Result<Data> {
        self.request(Handler::GetItem, vec![key.into()]).await
    }

    pub async fn setitem(&self, key: impl Into<Data>, value: impl Into<Data>) -> Result<()> {
        self.request(Handler::SetItem, vec![key.into(), value.into()])
            .await
            .map(drop)
    }

    pub async fn delitem(&self, key: impl Into<Data>) -> Result<()> {
        self.request(Handler::DelItem, vec![key.into()])
            .await
            .map(drop)
    }

    pub async fn len(&self) -> Result<usize> {
        match self.request(Handler::Len, Vec::new()).await? {
            Data::Int(n) if n >= 0 => Ok(n as usize),
            other => Err(unexpected(Handler::Len, &other)),
        }
    }

    /// Remote `repr` of the object
    pub async fn repr(&self) -> Result<String> {
        match self.request(Handler::Repr, Vec::new()).await? {
            Data::Str(s) => Ok(s),
            other => Err(unexpected(Handler::Repr, &other)),
        }
    }

    /// Remote display string of the object
    pub async fn display(&self) -> Result<String> {
        match self.request(Handler::Str, Vec::new()).await? {
            Data::Str(s) => Ok(s),
            other => Err(unexpected(Handler::Str, &other)),
        }
    }

    pub async fn compare(&self, op: CompareOp, other: impl Into<Data>) -> Result<bool> {
        match self
            .request(Handler::Compare, vec![op.as_str().into(), other.into()])
            .await?
        {
            Data::Bool(b) => Ok(b),
            other => Err(unexpected(Handler::Compare, &other)),
        }
    }

    pub async fn eq(&self, other: impl Into<Data>) -> Result<bool> {
        self.compare(CompareOp::Eq, other).await
    }

    pub async fn lt(&self, other: impl Into<Data>) -> Result<bool> {
        self.compare(CompareOp::Lt, other).await
    }

    /// Attribute names the peer lets us see. Fetched once per remote object.
    pub async fn dir(&self) -> Result<Vec<String>> {
        if !self.inner.conn.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let shape = self
            .inner
            .shape
            .get_or_try_init(|| async {
                match self.request(Handler::Dir, Vec::new()).await? {
                    Data::List(items) => items
                        .into_iter()
                        .map(|item| match item {
                            Data::Str(name) => Ok(name),
                            other => Err(unexpected(Handler::Dir, &other)),
                        })
                        .collect(),
                    other => Err(unexpected(Handler::Dir, &other)),
                }
            })
            .await?;
        Ok(shape.clone())
    }

    /// Capability probe served from the shape cache
    pub async fn has_attr(&self, name: &str) -> Result<bool> {
        Ok(self.dir().await?.iter().any(|n| n == name))
    }

    /// Fetch the object by value
    pub async fn snapshot(&self) -> Result<Data> {
        self.request(Handler::Snapshot, Vec::new()).await
    }

    /// Next `count` items of a remote iterator; empty once exhausted
    pub async fn next_chunk(&self, count: usize) -> Result<Vec<Data>> {
        match self
            .request(Handler::BuffIter, vec![Data::from(count)])
            .await?
        {
            Data::List(items) => Ok(items),
            other => Err(unexpected(Handler::BuffIter, &other)),
        }
    }
}

fn call_args(args: Vec<Data>, kwargs: Vec<(String, Data)>) -> Vec<Data> {
    vec![
        Data::Tuple(args),
        Data::Map(kwargs.into_iter().map(|(k, v)| (Data::Str(k), v)).collect()),
    ]
}

fn unexpected(handler: Handler, value: &Data) -> ProtocolError {
    ProtocolError::ProtocolViolation(format!(
        "{handler} reply carried {}",
        value.type_name()
    ))
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Proxy {} #{} on connection {}>",
            self.inner.type_info,
            self.inner.id,
            self.inner.conn.id()
        )
    }
}
