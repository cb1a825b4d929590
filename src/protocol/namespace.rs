//! Ready-made exposable objects.
//!
//! - [`Namespace`]: named attributes plus sync or async methods; the usual
//!   shape of a root service
//! - [`Function`]: a callable, typically passed to the peer as a callback
//! - [`RemoteIter`]: an iterator served in chunks through `BuffIter`

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::protocol::object::{CallContext, Data, RemoteError, RemoteObject};
use crate::protocol::value::TypeInfo;

type MethodFn = dyn Fn(CallContext, Vec<Data>, Vec<(String, Data)>) -> BoxFuture<'static, Result<Data, RemoteError>>
    + Send
    + Sync
    + 'static;

fn sync_method<F>(f: F) -> Arc<MethodFn>
where
    F: Fn(Vec<Data>) -> Result<Data, RemoteError> + Send + Sync + 'static,
{
    Arc::new(move |_ctx: CallContext, args: Vec<Data>, _kwargs: Vec<(String, Data)>| {
        futures::future::ready(f(args)).boxed()
    })
}

fn async_method<F, Fut>(f: F) -> Arc<MethodFn>
where
    F: Fn(CallContext, Vec<Data>, Vec<(String, Data)>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Data, RemoteError>> + Send + 'static,
{
    Arc::new(
        move |ctx: CallContext, args: Vec<Data>, kwargs: Vec<(String, Data)>| {
            f(ctx, args, kwargs).boxed()
        },
    )
}

/// Object made of named values and methods.
///
/// ```ignore
/// let service = Namespace::new("Calculator")
///     .with_attr("version", 3)
///     .with_method("add", |args| {
///         let a = args.first().and_then(Data::as_int).unwrap_or(0);
///         let b = args.get(1).and_then(Data::as_int).unwrap_or(0);
///         Ok(Data::Int(a + b))
///     });
/// ```
pub struct Namespace {
    type_name: String,
    attrs: RwLock<BTreeMap<String, Data>>,
    methods: BTreeMap<String, Arc<MethodFn>>,
    writable: bool,
}

impl Namespace {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attrs: RwLock::new(BTreeMap::new()),
            methods: BTreeMap::new(),
            writable: false,
        }
    }

    pub fn with_attr(self, name: impl Into<String>, value: impl Into<Data>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Data>) -> Result<Data, RemoteError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), sync_method(f));
        self
    }

    /// Method with access to the call context and keyword arguments
    pub fn with_async_method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Data>, Vec<(String, Data)>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Data, RemoteError>> + Send + 'static,
    {
        self.methods.insert(name.into(), async_method(f));
        self
    }

    /// Let peers assign and delete attributes (the exposure policy still applies)
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Local read of an attribute
    pub fn get(&self, name: &str) -> Option<Data> {
        self.attrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Local write of an attribute
    pub fn set(&self, name: impl Into<String>, value: impl Into<Data>) {
        let previous = self
            .attrs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
        drop(previous);
    }

    fn read_only(&self, name: &str) -> RemoteError {
        RemoteError::new(
            "AttributeError",
            format!("'{}' object attribute '{name}' is read-only", self.type_name),
        )
    }
}

#[async_trait]
impl RemoteObject for Namespace {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new(self.type_name.clone())
    }

    fn attribute_names(&self) -> Vec<String> {
        let attrs = self.attrs.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = attrs.keys().chain(self.methods.keys()).cloned().collect();
        names.sort();
        names.dedup();
        names
    }

    async fn getattr(&self, _ctx: &CallContext, name: &str) -> Result<Data, RemoteError> {
        if let Some(value) = self.get(name) {
            return Ok(value);
        }
        match self.methods.get(name) {
            Some(method) => Ok(Data::object(Function {
                name: format!("{}.{name}", self.type_name),
                f: method.clone(),
            })),
            None => Err(RemoteError::attribute(&self.type_info(), name)),
        }
    }

    async fn setattr(&self, _ctx: &CallContext, name: &str, value: Data) -> Result<(), RemoteError> {
        if !self.writable || self.methods.contains_key(name) {
            return Err(self.read_only(name));
        }
        self.set(name, value);
        Ok(())
    }

    async fn delattr(&self, _ctx: &CallContext, name: &str) -> Result<(), RemoteError> {
        if !self.writable {
            return Err(self.read_only(name));
        }
        let removed = self
            .attrs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match removed {
            Some(_) => Ok(()),
            None => Err(RemoteError::attribute(&self.type_info(), name)),
        }
    }

    async fn call_method(
        &self,
        ctx: &CallContext,
        name: &str,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
    ) -> Result<Data, RemoteError> {
        if let Some(method) = self.methods.get(name) {
            return method(ctx.clone(), args, kwargs).await;
        }
        match self.get(name) {
            Some(Data::Object(callable)) => callable.call(ctx, args, kwargs).await,
            Some(Data::Proxy(callable)) => Ok(callable.call(args, kwargs).await?),
            Some(other) => Err(RemoteError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
            None => Err(RemoteError::attribute(&self.type_info(), name)),
        }
    }

    async fn getitem(&self, _ctx: &CallContext, key: Data) -> Result<Data, RemoteError> {
        let Data::Str(name) = key else {
            return Err(RemoteError::type_error("namespace keys are strings"));
        };
        self.get(&name)
            .ok_or_else(|| RemoteError::key_error(format!("'{name}'")))
    }

    async fn len(&self, _ctx: &CallContext) -> Result<usize, RemoteError> {
        Ok(self.attrs.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn repr(&self) -> String {
        format!("<{} namespace>", self.type_name)
    }

    /// Plain attributes only; live objects and proxies are left out
    fn snapshot(&self) -> Result<Data, RemoteError> {
        let attrs = self.attrs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(Data::Map(
            attrs
                .iter()
                .filter(|(_, v)| !matches!(v, Data::Object(_) | Data::Proxy(_)))
                .map(|(k, v)| (Data::Str(k.clone()), v.clone()))
                .collect(),
        ))
    }
}

/// Callable object
pub struct Function {
    name: String,
    f: Arc<MethodFn>,
}

impl Function {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Data>) -> Result<Data, RemoteError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: sync_method(f),
        }
    }

    pub fn new_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, Vec<Data>, Vec<(String, Data)>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Data, RemoteError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: async_method(f),
        }
    }
}

#[async_trait]
impl RemoteObject for Function {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("function")
    }

    async fn call(
        &self,
        ctx: &CallContext,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
    ) -> Result<Data, RemoteError> {
        (self.f)(ctx.clone(), args, kwargs).await
    }

    fn repr(&self) -> String {
        format!("<function {}>", self.name)
    }
}

type BoxedIter = Box<dyn Iterator<Item = Data> + Send>;

/// Iterator served to the peer in chunks
pub struct RemoteIter {
    items: Mutex<BoxedIter>,
}

impl RemoteIter {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Data>,
        I::IntoIter: Send + 'static,
    {
        Self {
            items: Mutex::new(Box::new(items.into_iter())),
        }
    }

    /// Iterator over an already materialised sequence
    pub fn from_vec(items: Vec<Data>) -> Self {
        Self::new(VecDeque::from(items))
    }
}

#[async_trait]
impl RemoteObject for RemoteIter {
    fn type_info(&self) -> TypeInfo {
        TypeInfo::new("iterator")
    }

    async fn next_chunk(&self, _ctx: &CallContext, count: usize) -> Result<Vec<Data>, RemoteError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.by_ref().take(count).collect())
    }
}
