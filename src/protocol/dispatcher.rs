//! Request dispatcher.
//!
//! Maps each [`Handler`] to an async function that applies an incoming
//! request to local objects. Arguments arrive already unboxed: the target is
//! `args[0]` as [`Data::Object`]. Every handler runs the exposure policy
//! against its target before touching it; a refusal becomes a denial
//! exception, any other failure an operation exception.
//!
//! One-way handlers (`Hello`, `Close`, `Release`) are consumed by the
//! connection itself and never reach the dispatcher.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::error::constants::{
    ERR_CONNECTION_CLOSED, ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK, ERR_MALFORMED_ARGS,
    ERR_NOT_AN_OBJECT,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{CompareOp, Handler, RemoteException};
use crate::protocol::object::{CallContext, Data, ObjectRef, RemoteError};
use crate::protocol::policy::{ExposurePolicy, Operation};
use crate::utils::metrics::global_metrics;

pub type HandlerResult = std::result::Result<Data, RemoteException>;

type HandlerFn = dyn Fn(CallContext, Arc<dyn ExposurePolicy>, Vec<Data>) -> BoxFuture<'static, HandlerResult>
    + Send
    + Sync
    + 'static;

/// Handler registry shared by every connection built from one builder
pub struct Dispatcher {
    handlers: RwLock<HashMap<Handler, Arc<HandlerFn>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

impl Dispatcher {
    /// Empty dispatcher; every request fails until handlers are registered
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Dispatcher serving the full request surface
    pub fn with_default_handlers() -> Self {
        let dispatcher = Self::new();
        let mut handlers = HashMap::new();
        install_defaults(&mut handlers);
        if let Ok(mut table) = dispatcher.handlers.write() {
            *table = handlers;
        }
        dispatcher
    }

    /// Register (or replace) the function serving `handler`
    pub fn register<F, Fut>(&self, handler: Handler, f: F) -> Result<()>
    where
        F: Fn(CallContext, Arc<dyn ExposurePolicy>, Vec<Data>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(handler, boxed_handler(f));
        Ok(())
    }

    pub fn handles(&self, handler: Handler) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(&handler))
            .unwrap_or(false)
    }

    /// Run the function registered for the request's handler. The registry
    /// lock is released before the handler runs.
    pub fn dispatch(
        &self,
        ctx: CallContext,
        policy: Arc<dyn ExposurePolicy>,
        args: Vec<Data>,
    ) -> BoxFuture<'static, HandlerResult> {
        let handler = ctx.handler();
        let found = match self.handlers.read() {
            Ok(handlers) => handlers.get(&handler).cloned(),
            Err(_) => {
                let err = RemoteError::new("ProtocolError", ERR_DISPATCHER_READ_LOCK);
                return futures::future::ready(Err(RemoteException::operation(err))).boxed();
            }
        };

        match found {
            Some(f) => f(ctx, policy, args),
            None => {
                let err = RemoteError::new(
                    "NotImplementedError",
                    format!("handler {handler} is not served"),
                );
                futures::future::ready(Err(RemoteException::operation(err))).boxed()
            }
        }
    }
}

/// Positional reader over a request's arguments
struct Args {
    handler: Handler,
    items: std::vec::IntoIter<Data>,
}

impl Args {
    fn new(handler: Handler, args: Vec<Data>) -> Self {
        Self {
            handler,
            items: args.into_iter(),
        }
    }

    fn malformed(&self, what: &str) -> RemoteException {
        RemoteException::operation(RemoteError::type_error(format!(
            "{ERR_MALFORMED_ARGS} for {}: expected {what}",
            self.handler
        )))
    }

    fn target(&mut self) -> std::result::Result<ObjectRef, RemoteException> {
        match self.items.next() {
            Some(Data::Object(obj)) => Ok(obj),
            _ => Err(RemoteException::operation(RemoteError::reference_error(
                ERR_NOT_AN_OBJECT,
            ))),
        }
    }

    fn value(&mut self) -> std::result::Result<Data, RemoteException> {
        self.items.next().ok_or_else(|| self.malformed("a value"))
    }

    fn name(&mut self) -> std::result::Result<String, RemoteException> {
        match self.items.next() {
            Some(Data::Str(name)) => Ok(name),
            _ => Err(self.malformed("an attribute name")),
        }
    }

    fn count(&mut self) -> std::result::Result<usize, RemoteException> {
        match self.items.next() {
            Some(Data::Int(n)) if n >= 0 => Ok(n as usize),
            _ => Err(self.malformed("a non-negative count")),
        }
    }

    fn positional(&mut self) -> std::result::Result<Vec<Data>, RemoteException> {
        match self.items.next() {
            Some(Data::Tuple(items)) | Some(Data::List(items)) => Ok(items),
            None => Ok(Vec::new()),
            _ => Err(self.malformed("a tuple of arguments")),
        }
    }

    fn keywords(&mut self) -> std::result::Result<Vec<(String, Data)>, RemoteException> {
        let pairs = match self.items.next() {
            Some(Data::Map(pairs)) => pairs,
            None => return Ok(Vec::new()),
            _ => return Err(self.malformed("a map of keyword arguments")),
        };
        let mut kwargs = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match key {
                Data::Str(key) => kwargs.push((key, value)),
                _ => return Err(self.malformed("string keyword names")),
            }
        }
        Ok(kwargs)
    }
}

fn boxed_handler<F, Fut>(f: F) -> Arc<HandlerFn>
where
    F: Fn(CallContext, Arc<dyn ExposurePolicy>, Vec<Data>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(
        move |ctx: CallContext, policy: Arc<dyn ExposurePolicy>, args: Vec<Data>| {
            f(ctx, policy, args).boxed()
        },
    )
}

fn check(
    policy: &dyn ExposurePolicy,
    object: &ObjectRef,
    operation: Operation<'_>,
) -> std::result::Result<(), RemoteException> {
    if policy.is_allowed(object.as_ref(), &operation) {
        return Ok(());
    }
    global_metrics().policy_denied();
    Err(RemoteException::denied(RemoteError::denied(operation.name())))
}

fn failed(err: RemoteError) -> RemoteException {
    RemoteException::operation(err)
}

fn install_defaults(handlers: &mut HashMap<Handler, Arc<HandlerFn>>) {
    fn add<F, Fut>(handlers: &mut HashMap<Handler, Arc<HandlerFn>>, handler: Handler, f: F)
    where
        F: Fn(CallContext, Arc<dyn ExposurePolicy>, Vec<Data>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        handlers.insert(handler, boxed_handler(f));
    }

    add(handlers, Handler::Ping, |_ctx, _policy, args| async move {
        Ok(Data::Tuple(args))
    });

    add(handlers, Handler::GetRoot, |ctx, _policy, _args| async move {
        ctx.connection()
            .local_root()
            .map(Data::Object)
            .ok_or_else(|| failed(RemoteError::reference_error(ERR_CONNECTION_CLOSED)))
    });

    add(handlers, Handler::GetAttr, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let name = args.name()?;
        check(policy.as_ref(), &target, Operation::GetAttr(&name))?;
        target.getattr(&ctx, &name).await.map_err(failed)
    });

    add(handlers, Handler::SetAttr, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let name = args.name()?;
        let value = args.value()?;
        check(policy.as_ref(), &target, Operation::SetAttr(&name))?;
        target.setattr(&ctx, &name, value).await.map_err(failed)?;
        Ok(Data::None)
    });

    add(handlers, Handler::DelAttr, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let name = args.name()?;
        check(policy.as_ref(), &target, Operation::DelAttr(&name))?;
        target.delattr(&ctx, &name).await.map_err(failed)?;
        Ok(Data::None)
    });

    add(handlers, Handler::Call, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let positional = args.positional()?;
        let kwargs = args.keywords()?;
        check(policy.as_ref(), &target, Operation::Call)?;
        target.call(&ctx, positional, kwargs).await.map_err(failed)
    });

    add(handlers, Handler::CallAttr, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let name = args.name()?;
        let positional = args.positional()?;
        let kwargs = args.keywords()?;
        check(policy.as_ref(), &target, Operation::CallAttr(&name))?;
        target
            .call_method(&ctx, &name, positional, kwargs)
            .await
            .map_err(failed)
    });

    add(handlers, Handler::Repr, |ctx, policy, args| async move {
        let target = Args::new(ctx.handler(), args).target()?;
        check(policy.as_ref(), &target, Operation::Repr)?;
        Ok(Data::Str(target.repr()))
    });

    add(handlers, Handler::Str, |ctx, policy, args| async move {
        let target = Args::new(ctx.handler(), args).target()?;
        check(policy.as_ref(), &target, Operation::Str)?;
        Ok(Data::Str(target.display()))
    });

    add(handlers, Handler::Compare, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let op = args.name()?;
        let other = args.value()?;
        let op = CompareOp::parse(&op)
            .ok_or_else(|| failed(RemoteError::value_error(format!("unknown comparison '{op}'"))))?;
        check(policy.as_ref(), &target, Operation::Compare)?;
        target.compare(op, &other).map(Data::Bool).map_err(failed)
    });

    add(handlers, Handler::GetItem, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let key = args.value()?;
        check(policy.as_ref(), &target, Operation::GetItem)?;
        target.getitem(&ctx, key).await.map_err(failed)
    });

    add(handlers, Handler::SetItem, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let key = args.value()?;
        let value = args.value()?;
        check(policy.as_ref(), &target, Operation::SetItem)?;
        target.setitem(&ctx, key, value).await.map_err(failed)?;
        Ok(Data::None)
    });

    add(handlers, Handler::DelItem, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let key = args.value()?;
        check(policy.as_ref(), &target, Operation::DelItem)?;
        target.delitem(&ctx, key).await.map_err(failed)?;
        Ok(Data::None)
    });

    add(handlers, Handler::Len, |ctx, policy, args| async move {
        let target = Args::new(ctx.handler(), args).target()?;
        check(policy.as_ref(), &target, Operation::Len)?;
        target.len(&ctx).await.map(Data::from).map_err(failed)
    });

    // Shape query: only names the caller could actually read
    add(handlers, Handler::Dir, |ctx, policy, args| async move {
        let target = Args::new(ctx.handler(), args).target()?;
        check(policy.as_ref(), &target, Operation::Dir)?;
        let names = target
            .attribute_names()
            .into_iter()
            .filter(|name| policy.is_allowed(target.as_ref(), &Operation::GetAttr(name)))
            .map(Data::Str)
            .collect();
        Ok(Data::List(names))
    });

    add(handlers, Handler::Snapshot, |ctx, policy, args| async move {
        let target = Args::new(ctx.handler(), args).target()?;
        check(policy.as_ref(), &target, Operation::Snapshot)?;
        target.snapshot().map_err(failed)
    });

    add(handlers, Handler::BuffIter, |ctx, policy, args| async move {
        let mut args = Args::new(ctx.handler(), args);
        let target = args.target()?;
        let count = args.count()?;
        check(policy.as_ref(), &target, Operation::Iterate)?;
        if count == 0 {
            return Ok(Data::List(Vec::new()));
        }
        target
            .next_chunk(&ctx, count)
            .await
            .map(Data::List)
            .map_err(failed)
    });
}
