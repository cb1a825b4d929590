//! # Connection Engine
//!
//! One [`Connection`] multiplexes every remote-object interaction between two
//! peers over a single framed byte stream.
//!
//! ## Tasks
//! - **Writer**: owns the sink half of the stream. Every outgoing frame goes
//!   through its queue, so frames never interleave and the frames of one
//!   task leave in the order that task produced them.
//! - **Dispatch loop**: owns the stream half. Replies resolve pending
//!   requests; requests run inline (one at a time, arrival order) or in
//!   their own tasks depending on [`RequestHandling`].
//! - **Keepalive** (optional): periodic pings; a failed ping closes.
//!
//! ## Lifecycle
//! `Open → Closing → Closed`. The connection is `Open` once both HELLO
//! messages were exchanged. [`Connection::close`] is synchronous and
//! idempotent: it fails every pending request with
//! [`ProtocolError::ConnectionClosed`], releases the object table and stops
//! the tasks. Transport EOF, a CLOSE from the peer and any undecodable frame
//! close the connection the same way.
//!
//! ## Reference counting
//! Each reference marker emitted adds one reference to the object's table
//! entry. The receiving side folds every marker for one id into a single
//! [`Proxy`] and sends `Release [id, count]` when the last clone drops.

use futures::future::{BoxFuture, FutureExt, OptionFuture};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConnectionConfig, RequestHandling, PROTOCOL_VERSION};
use crate::core::codec::PacketCodec;
use crate::core::packet::{Packet, HEADER_SIZE};
use crate::core::serialization::MultiFormat;
use crate::error::constants::{ERR_FOREIGN_PROXY, ERR_HANDSHAKE_FAILED, ERR_WRITER_GONE};
use crate::error::{ProtocolError, Result};
use crate::protocol::async_result::AsyncResult;
use crate::protocol::boxing::{BoxingPolicy, ReferenceAll, ValueTypes};
use crate::protocol::dispatcher::{Dispatcher, HandlerResult};
use crate::protocol::message::{Handler, Message, MessageKind, RemoteException};
use crate::protocol::namespace::Namespace;
use crate::protocol::object::{CallContext, Data, ObjectRef, RemoteError, RemoteObject};
use crate::protocol::object_table::ObjectTable;
use crate::protocol::policy::{DefaultPolicy, ExposurePolicy};
use crate::protocol::proxy::{Proxy, ProxyInner};
use crate::protocol::value::{ObjectId, RefMarker, Value};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{with_timeout, with_timeout_error};

/// Bound on flushing the final frames once the connection is closing
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Sequence id used by HELLO; requests start at 1
const HELLO_SEQ: u64 = 0;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

enum Outbound {
    Packet(Packet),
    Shutdown,
}

struct PendingTable {
    closed: bool,
    waiters: HashMap<u64, AsyncResult>,
}

pub(crate) struct ConnectionInner {
    id: u64,
    config: ConnectionConfig,
    peer_service: String,
    objects: ObjectTable,
    root: Mutex<Option<ObjectRef>>,
    remote_root: Mutex<Option<Proxy>>,
    policy: Arc<dyn ExposurePolicy>,
    boxing: Arc<dyn BoxingPolicy>,
    dispatcher: Arc<Dispatcher>,
    next_seq: AtomicU64,
    pending: Mutex<PendingTable>,
    proxies: Mutex<HashMap<ObjectId, Weak<ProxyInner>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

/// Handle to one protocol connection. Cheap to clone; all clones drive the
/// same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Configures and establishes connections
#[derive(Clone)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    root: Option<ObjectRef>,
    policy: Option<Arc<dyn ExposurePolicy>>,
    boxing: Option<Arc<dyn BoxingPolicy>>,
    dispatcher: Arc<Dispatcher>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl ConnectionBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            root: None,
            policy: None,
            boxing: None,
            dispatcher: Arc::new(Dispatcher::with_default_handlers()),
        }
    }

    /// Root object the peer obtains with `GetRoot`
    pub fn service<T: RemoteObject>(self, root: T) -> Self {
        self.service_ref(Arc::new(root))
    }

    pub fn service_ref(mut self, root: ObjectRef) -> Self {
        self.root = Some(root);
        self
    }

    /// Replace the policy derived from [`ConnectionConfig::access`]
    pub fn policy<P: ExposurePolicy>(mut self, policy: P) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Replace the boxing rule derived from [`ConnectionConfig::by_value_types`]
    pub fn boxing<B: BoxingPolicy>(mut self, boxing: B) -> Self {
        self.boxing = Some(Arc::new(boxing));
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConnectionConfig {
        &mut self.config
    }

    /// Run the HELLO exchange over `io` and start the connection's tasks
    #[instrument(skip(self, io), fields(service = %self.config.service_name))]
    pub async fn establish<T>(self, io: T) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(io, PacketCodec::new(self.config.max_payload_size));

        let peer_service = match with_timeout_error(
            handshake(&mut framed, &self.config),
            self.config.handshake_timeout,
        )
        .await
        {
            Ok(peer) => peer,
            Err(e) => {
                global_metrics().handshake_failed();
                warn!(error = %e, "Handshake failed");
                return Err(e);
            }
        };

        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(DefaultPolicy::from_config(&self.config.access)));
        let boxing: Arc<dyn BoxingPolicy> = match self.boxing {
            Some(boxing) => boxing,
            None if self.config.by_value_types.is_empty() => Arc::new(ReferenceAll),
            None => Arc::new(ValueTypes::new(self.config.by_value_types.iter().cloned())),
        };
        let root = self
            .root
            .unwrap_or_else(|| Arc::new(Namespace::new(self.config.service_name.clone())));

        let (sink, stream) = framed.split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Open);
        let keepalive = self.config.keepalive_interval;

        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                config: self.config,
                peer_service,
                objects: ObjectTable::new(),
                root: Mutex::new(Some(root)),
                remote_root: Mutex::new(None),
                policy,
                boxing,
                dispatcher: self.dispatcher,
                next_seq: AtomicU64::new(HELLO_SEQ + 1),
                pending: Mutex::new(PendingTable {
                    closed: false,
                    waiters: HashMap::new(),
                }),
                proxies: Mutex::new(HashMap::new()),
                outbound,
                state,
                shutdown: CancellationToken::new(),
            }),
        };

        global_metrics().connection_established();
        info!(
            conn_id = conn.id(),
            peer_service = %conn.peer_service(),
            "Connection established"
        );

        tokio::spawn(write_loop(conn.clone(), sink, rx));
        tokio::spawn(dispatch_loop(conn.clone(), stream));
        if let Some(interval) = keepalive {
            tokio::spawn(keepalive_loop(conn.clone(), interval));
        }

        Ok(conn)
    }
}

/// Both sides send HELLO, then read the peer's. HELLO is the only message
/// carrying a format byte, so a format mismatch fails here instead of as
/// undecodable traffic. Returns the peer's service name.
async fn handshake<T>(framed: &mut Framed<T, PacketCodec>, config: &ConnectionConfig) -> Result<String>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Message::request(
        HELLO_SEQ,
        Handler::Hello,
        vec![
            Value::Int(i64::from(PROTOCOL_VERSION)),
            Value::Str(config.service_name.clone()),
        ],
    );
    framed
        .send(Packet::new(hello.serialize_with_header(config.format)?))
        .await?;

    let packet = framed
        .next()
        .await
        .ok_or(ProtocolError::ConnectionClosed)??;
    let (reply, peer_format) = Message::deserialize_with_header(&packet.payload)?;
    if peer_format != config.format {
        return Err(ProtocolError::HandshakeError(format!(
            "{ERR_HANDSHAKE_FAILED}: peer encodes with {}, expected {}",
            peer_format.name(),
            config.format.name()
        )));
    }

    if reply.kind != MessageKind::Request || reply.handler != Handler::Hello {
        return Err(ProtocolError::UnexpectedMessage);
    }

    match reply.args.as_slice() {
        [Value::Int(version), Value::Str(service)] => {
            if *version != i64::from(PROTOCOL_VERSION) {
                return Err(ProtocolError::UnsupportedVersion(
                    u8::try_from(*version).unwrap_or(u8::MAX),
                ));
            }
            debug!(peer_service = %service, "Handshake complete");
            Ok(service.clone())
        }
        _ => Err(ProtocolError::HandshakeError(format!(
            "{ERR_HANDSHAKE_FAILED}: malformed HELLO"
        ))),
    }
}

impl Connection {
    /// Process-unique connection id (log correlation)
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Service name the peer announced in HELLO
    pub fn peer_service(&self) -> &str {
        &self.inner.peer_service
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Number of local objects the peer currently references
    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    /// References the peer holds on local object `id`
    pub fn ref_count(&self, id: ObjectId) -> Option<u64> {
        self.inner.objects.ref_count(id)
    }

    /// Number of distinct remote objects with a live local proxy
    pub fn proxy_count(&self) -> usize {
        self.lock_proxies()
            .values()
            .filter(|proxy| proxy.strong_count() > 0)
            .count()
    }

    /// Requests issued on this connection still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.lock_pending().waiters.len()
    }

    pub fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait until the connection reached `Closed`
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Send a request and wait for its reply, bounded by
    /// `sync_request_timeout`. The remote call may still complete after a
    /// timeout; its reply is then discarded.
    pub async fn issue_request(&self, handler: Handler, args: Vec<Data>) -> Result<Data> {
        let result = self.issue_async(handler, args);
        match result.wait(Some(self.inner.config.sync_request_timeout)).await {
            Err(ProtocolError::Expired) => {
                // Nobody waits on it any more; a late reply is an orphan
                self.lock_pending().waiters.remove(&result.seq());
                debug!(conn_id = self.id(), seq = result.seq(), %handler, "Request timed out");
                Err(ProtocolError::Timeout)
            }
            other => other,
        }
    }

    /// Send a request and return immediately. Failures to send settle the
    /// returned result with the error.
    pub fn issue_async(&self, handler: Handler, args: Vec<Data>) -> AsyncResult {
        let seq = self.next_seq();
        match self.send_request(seq, handler, &args) {
            Ok(result) => result,
            Err(e) => AsyncResult::failed(seq, handler, e),
        }
    }

    /// The peer's root service. Fetched once, then served from a cache.
    pub async fn root(&self) -> Result<Proxy> {
        if let Some(root) = lock(&self.inner.remote_root).clone() {
            return Ok(root);
        }

        let root = match self.issue_request(Handler::GetRoot, Vec::new()).await? {
            Data::Proxy(proxy) => proxy,
            other => {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "root service arrived as {}",
                    other.type_name()
                )))
            }
        };

        if !self.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        *lock(&self.inner.remote_root) = Some(root.clone());
        Ok(root)
    }

    /// Round trip a ping; returns the measured latency
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let token = Data::Int(self.next_seq() as i64);
        let echo = self
            .issue_request(Handler::Ping, vec![token.clone()])
            .await?;
        if echo != Data::Tuple(vec![token]) {
            return Err(ProtocolError::ProtocolViolation(
                "ping echo does not match".into(),
            ));
        }
        Ok(started.elapsed())
    }

    /// Close the connection. Idempotent and safe from any task, including a
    /// handler running on this connection.
    pub fn close(&self) {
        let waiters = {
            let mut pending = self.lock_pending();
            if pending.closed {
                return;
            }
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };

        self.inner.state.send_replace(ConnectionState::Closing);
        info!(conn_id = self.id(), pending = waiters.len(), "Closing connection");

        let notice = Message::request(self.next_seq(), Handler::Close, Vec::new());
        if let Ok(packet) = self.encode(&notice) {
            let _ = self.inner.outbound.send(Outbound::Packet(packet));
        }
        let _ = self.inner.outbound.send(Outbound::Shutdown);
        self.inner.shutdown.cancel();

        for (_, result) in waiters {
            result.resolve(Err(ProtocolError::ConnectionClosed));
        }

        let released = self.inner.objects.drain();
        let root = lock(&self.inner.root).take();
        let remote_root = lock(&self.inner.remote_root).take();
        self.lock_proxies().clear();
        drop((released, root, remote_root));

        global_metrics().connection_closed();
        self.inner.state.send_replace(ConnectionState::Closed);
        debug!(conn_id = self.id(), "Connection closed");
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingTable> {
        lock(&self.inner.pending)
    }

    fn lock_proxies(&self) -> MutexGuard<'_, HashMap<ObjectId, Weak<ProxyInner>>> {
        lock(&self.inner.proxies)
    }

    pub(crate) fn local_root(&self) -> Option<ObjectRef> {
        lock(&self.inner.root).clone()
    }

    fn encode(&self, message: &Message) -> Result<Packet> {
        let payload = message.serialize_format(self.inner.config.format)?;
        if payload.len() > self.inner.config.max_payload_size {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }
        Ok(Packet::new(payload))
    }

    fn push(&self, packet: Packet) -> Result<()> {
        self.inner
            .outbound
            .send(Outbound::Packet(packet))
            .map_err(|_| ProtocolError::TransportError(ERR_WRITER_GONE.to_string()))
    }

    fn send_request(&self, seq: u64, handler: Handler, args: &[Data]) -> Result<AsyncResult> {
        if !self.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut emitted = Vec::new();
        let packet = match self
            .box_all(args, &mut emitted)
            .and_then(|values| self.encode(&Message::request(seq, handler, values)))
        {
            Ok(packet) => packet,
            Err(e) => {
                self.rollback(&emitted);
                return Err(e);
            }
        };

        let result = AsyncResult::new(seq, handler);
        {
            let mut pending = self.lock_pending();
            if pending.closed {
                drop(pending);
                self.rollback(&emitted);
                return Err(ProtocolError::ConnectionClosed);
            }
            pending.waiters.insert(seq, result.clone());
        }

        if let Err(e) = self.push(packet) {
            let stale = self.lock_pending().waiters.remove(&seq);
            drop(stale);
            self.rollback(&emitted);
            return Err(e);
        }

        global_metrics().request_sent();
        debug!(conn_id = self.id(), seq, %handler, "Request sent");
        Ok(result)
    }

    /// Send a one-way `Release`. No-op once the connection left `Open`.
    pub(crate) fn send_release(&self, id: ObjectId, count: u64) {
        if !self.is_open() || count == 0 {
            return;
        }
        let message = Message::request(
            self.next_seq(),
            Handler::Release,
            vec![Value::Int(id as i64), Value::Int(count as i64)],
        );
        match self.encode(&message).and_then(|packet| self.push(packet)) {
            Ok(()) => debug!(conn_id = self.id(), object_id = id, count, "Release sent"),
            Err(e) => debug!(conn_id = self.id(), object_id = id, error = %e, "Release not sent"),
        }
    }

    /// Remove the cache slot of a dying proxy unless a newer proxy took it
    pub(crate) fn forget_proxy(&self, id: ObjectId, dying: &ProxyInner) {
        let mut proxies = self.lock_proxies();
        if proxies
            .get(&id)
            .is_some_and(|slot| std::ptr::eq(slot.as_ptr(), dying))
        {
            proxies.remove(&id);
        }
    }

    fn rollback(&self, emitted: &[ObjectId]) {
        for id in emitted {
            let _ = self.inner.objects.decref(*id);
        }
    }

    fn box_all(&self, items: &[Data], emitted: &mut Vec<ObjectId>) -> Result<Vec<Value>> {
        items
            .iter()
            .map(|item| self.box_value(item, emitted))
            .collect()
    }

    /// Convert application data into a wire value. Every marker emitted is
    /// counted in the object table and recorded in `emitted`.
    fn box_value(&self, data: &Data, emitted: &mut Vec<ObjectId>) -> Result<Value> {
        Ok(match data {
            Data::None => Value::None,
            Data::Bool(b) => Value::Bool(*b),
            Data::Int(i) => Value::Int(*i),
            Data::Float(x) => Value::Float(*x),
            Data::Str(s) => Value::Str(s.clone()),
            Data::Bytes(b) => Value::Bytes(b.clone()),
            Data::List(items) => Value::List(self.box_all(items, emitted)?),
            Data::Tuple(items) => Value::Tuple(self.box_all(items, emitted)?),
            Data::Map(pairs) => Value::Map(
                pairs
                    .iter()
                    .map(|(k, v)| Ok((self.box_value(k, emitted)?, self.box_value(v, emitted)?)))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Data::Object(object) => {
                if self.inner.boxing.by_value(object.as_ref()) {
                    match object.snapshot() {
                        Ok(Data::Object(_)) | Ok(Data::Proxy(_)) => {}
                        Ok(snapshot) => return self.box_value(&snapshot, emitted),
                        Err(e) => {
                            debug!(error = %e, "Snapshot failed, sending by reference")
                        }
                    }
                }
                let object_id = self.inner.objects.expose_and_incref(object);
                emitted.push(object_id);
                Value::Ref(RefMarker {
                    object_id,
                    type_info: object.type_info(),
                })
            }
            Data::Proxy(proxy) => {
                if !proxy.belongs_to(self) {
                    warn!(conn_id = self.id(), object_id = proxy.id(), "{ERR_FOREIGN_PROXY}");
                    return Err(ProtocolError::ForeignProxy);
                }
                Value::LocalRef(proxy.id())
            }
        })
    }

    /// Convert wire values into application data. Every marker is absorbed
    /// even when another value fails, so no reference is leaked.
    fn unbox_all(&self, values: Vec<Value>) -> Result<Vec<Data>> {
        let mut failure = None;
        let items = values
            .into_iter()
            .map(|value| self.unbox(value, &mut failure))
            .collect();
        match failure {
            Some(e) => Err(e),
            None => Ok(items),
        }
    }

    fn unbox(&self, value: Value, failure: &mut Option<ProtocolError>) -> Data {
        match value {
            Value::None => Data::None,
            Value::Bool(b) => Data::Bool(b),
            Value::Int(i) => Data::Int(i),
            Value::Float(x) => Data::Float(x),
            Value::Str(s) => Data::Str(s),
            Value::Bytes(b) => Data::Bytes(b),
            Value::List(items) => {
                Data::List(items.into_iter().map(|v| self.unbox(v, failure)).collect())
            }
            Value::Tuple(items) => {
                Data::Tuple(items.into_iter().map(|v| self.unbox(v, failure)).collect())
            }
            Value::Map(pairs) => Data::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| (self.unbox(k, failure), self.unbox(v, failure)))
                    .collect(),
            ),
            Value::Ref(marker) => Data::Proxy(self.proxy_for(marker)),
            Value::LocalRef(id) => match self.inner.objects.resolve(id) {
                Ok(object) => Data::Object(object),
                Err(e) => {
                    failure.get_or_insert(e);
                    Data::None
                }
            },
        }
    }

    /// Shared proxy for `marker`, absorbing the marker's reference
    fn proxy_for(&self, marker: RefMarker) -> Proxy {
        let mut proxies = self.lock_proxies();
        if let Some(existing) = proxies.get(&marker.object_id).and_then(Weak::upgrade) {
            existing.absorb();
            drop(proxies);
            return Proxy::from_inner(existing);
        }

        let inner = Arc::new(ProxyInner::new(self.clone(), marker.object_id, marker.type_info));
        proxies.insert(marker.object_id, Arc::downgrade(&inner));
        drop(proxies);
        Proxy::from_inner(inner)
    }

    fn release_local(&self, id: ObjectId, count: u64) {
        match self.inner.objects.decref_by(id, count) {
            Ok(Some(object)) => {
                global_metrics().object_released();
                debug!(conn_id = self.id(), object_id = id, "Peer released object");
                object.on_release();
            }
            Ok(None) => {}
            Err(e) => warn!(conn_id = self.id(), object_id = id, error = %e, "Release for unknown object"),
        }
    }

    fn complete(&self, message: Message) {
        let seq = message.seq;
        let outcome = match message.kind {
            MessageKind::Exception => Err(RemoteException::from_values(&message.args)
                .map(RemoteException::into_error)
                .unwrap_or_else(|| {
                    ProtocolError::ProtocolViolation("malformed exception payload".into())
                })),
            _ => {
                let value = message.args.into_iter().next().unwrap_or(Value::None);
                self.unbox_all(vec![value])
                    .map(|mut items| items.pop().unwrap_or_default())
            }
        };

        let waiter = self.lock_pending().waiters.remove(&seq);
        match waiter {
            Some(result) => {
                global_metrics().reply_received();
                result.resolve(outcome);
            }
            None => {
                global_metrics().orphan_reply();
                warn!(conn_id = self.id(), seq, "Reply for unknown sequence id dropped");
                drop(outcome);
            }
        }
    }

    /// Resolve a request's arguments in arrival order. Referenced local
    /// objects are held from here on, so a RELEASE read after this request
    /// cannot drop them before it runs.
    fn accept(&self, message: Message) -> Incoming {
        Incoming {
            seq: message.seq,
            handler: message.handler,
            args: self.unbox_all(message.args),
        }
    }

    /// Execute one incoming request and send its reply
    async fn serve(self, request: Incoming) {
        let Incoming { seq, handler, args } = request;

        let outcome = match args {
            Ok(args) => {
                let ctx = CallContext::new(self.clone(), seq, handler);
                let run = self
                    .inner
                    .dispatcher
                    .dispatch(ctx, self.inner.policy.clone(), args);
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(conn_id = self.id(), seq, %handler, "Handler panicked");
                        Err(RemoteException::operation(RemoteError::new(
                            "RuntimeError",
                            format!("handler {handler} panicked"),
                        )))
                    }
                }
            }
            Err(ProtocolError::UnknownObject(id)) => Err(RemoteException::operation(
                RemoteError::reference_error(format!("unknown object id {id}")),
            )),
            Err(e) => Err(RemoteException::operation(RemoteError::from(e))),
        };

        global_metrics().request_handled();
        self.send_reply(seq, handler, outcome);
    }

    fn send_reply(&self, seq: u64, handler: Handler, outcome: HandlerResult) {
        let exception = match outcome {
            Ok(data) => {
                let mut emitted = Vec::new();
                let encoded = self
                    .box_value(&data, &mut emitted)
                    .and_then(|value| self.encode(&Message::reply(seq, handler, value)));
                match encoded {
                    Ok(packet) => {
                        if let Err(e) = self.push(packet) {
                            self.rollback(&emitted);
                            debug!(conn_id = self.id(), seq, error = %e, "Reply not sent");
                        }
                        return;
                    }
                    Err(e) => {
                        self.rollback(&emitted);
                        warn!(conn_id = self.id(), seq, %handler, error = %e, "Reply not encodable");
                        RemoteException::operation(RemoteError::new(
                            "SerializationError",
                            format!("reply could not be encoded: {e}"),
                        ))
                    }
                }
            }
            Err(exception) => exception,
        };

        self.send_exception(seq, handler, exception);
    }

    fn send_exception(&self, seq: u64, handler: Handler, mut exception: RemoteException) {
        if self.inner.config.include_local_traceback && exception.error.traceback.is_none() {
            exception.error.traceback = Some(format!(
                "in {handler} (seq {seq}) served by '{}' on connection {}",
                self.inner.config.service_name,
                self.id()
            ));
        }

        global_metrics().exception_sent();
        debug!(
            conn_id = self.id(),
            seq,
            %handler,
            kind = %exception.error.kind,
            "Sending exception"
        );

        match self
            .encode(&Message::exception(seq, handler, &exception))
            .and_then(|packet| self.push(packet))
        {
            Ok(()) => {}
            Err(e) => debug!(conn_id = self.id(), seq, error = %e, "Exception not sent"),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("peer_service", &self.peer_service())
            .finish()
    }
}

/// Request read off the stream, arguments already unboxed
struct Incoming {
    seq: u64,
    handler: Handler,
    args: Result<Vec<Data>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn write_loop<T>(
    conn: Connection,
    mut sink: SplitSink<Framed<T, PacketCodec>, Packet>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let shutdown = conn.inner.shutdown.clone();

    while let Some(item) = rx.recv().await {
        let packet = match item {
            Outbound::Packet(packet) => packet,
            Outbound::Shutdown => break,
        };
        let size = (HEADER_SIZE + packet.payload.len()) as u64;

        // Once closing, remaining frames get a short grace period
        let sent = if shutdown.is_cancelled() {
            with_timeout_error(sink.send(packet), CLOSE_GRACE).await
        } else {
            tokio::select! {
                sent = sink.send(packet) => sent,
                _ = shutdown.cancelled() => Err(ProtocolError::ConnectionClosed),
            }
        };

        match sent {
            Ok(()) => global_metrics().message_sent(size),
            Err(e) => {
                if !shutdown.is_cancelled() {
                    error!(conn_id = conn.id(), error = %e, "Write failed");
                    conn.close();
                }
                break;
            }
        }
    }

    let _ = with_timeout(sink.close(), CLOSE_GRACE).await;
    debug!(conn_id = conn.id(), "Writer stopped");
}

async fn dispatch_loop<T>(conn: Connection, mut stream: SplitStream<Framed<T, PacketCodec>>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let shutdown = conn.inner.shutdown.clone();
    let handling = conn.inner.config.request_handling;
    let limiter = Arc::new(Semaphore::new(conn.inner.config.max_concurrent_requests));

    // Inline mode: the running request and the ones queued behind it
    let mut current: Option<BoxFuture<'static, ()>> = None;
    let mut queued: VecDeque<Incoming> = VecDeque::new();

    loop {
        if current.is_none() {
            if let Some(request) = queued.pop_front() {
                current = Some(conn.clone().serve(request).boxed());
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(()) = OptionFuture::from(current.as_mut()), if current.is_some() => {
                current = None;
            }

            frame = stream.next() => {
                let packet = match frame {
                    Some(Ok(packet)) => packet,
                    Some(Err(e)) => {
                        global_metrics().protocol_error();
                        error!(conn_id = conn.id(), error = %e, "Undecodable frame");
                        break;
                    }
                    None => {
                        debug!(conn_id = conn.id(), "Peer closed the stream");
                        break;
                    }
                };
                global_metrics().message_received((HEADER_SIZE + packet.payload.len()) as u64);

                let message = match Message::deserialize_format(&packet.payload, conn.inner.config.format) {
                    Ok(message) => message,
                    Err(e) => {
                        global_metrics().protocol_error();
                        error!(conn_id = conn.id(), error = %e, "Undecodable message");
                        break;
                    }
                };

                if message.kind != MessageKind::Request {
                    conn.complete(message);
                    continue;
                }

                match message.handler {
                    Handler::Close => {
                        debug!(conn_id = conn.id(), "Peer sent CLOSE");
                        break;
                    }
                    Handler::Release => match message.args.as_slice() {
                        [Value::Int(id), Value::Int(count)] if *id >= 0 && *count >= 0 => {
                            conn.release_local(*id as ObjectId, *count as u64);
                        }
                        _ => {
                            global_metrics().protocol_error();
                            error!(conn_id = conn.id(), "Malformed RELEASE");
                            break;
                        }
                    },
                    Handler::Hello => {
                        global_metrics().protocol_error();
                        error!(conn_id = conn.id(), "HELLO after handshake");
                        break;
                    }
                    _ => {
                        let request = conn.accept(message);
                        match handling {
                            RequestHandling::Inline => queued.push_back(request),
                            RequestHandling::Concurrent => {
                                let conn = conn.clone();
                                let limiter = limiter.clone();
                                tokio::spawn(async move {
                                    let Ok(_permit) = limiter.acquire_owned().await else {
                                        return;
                                    };
                                    conn.serve(request).await;
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    drop(current);
    drop(queued);
    conn.close();
}

async fn keepalive_loop(conn: Connection, interval: Duration) {
    let shutdown = conn.inner.shutdown.clone();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = conn.ping().await {
                    if !conn.is_open() {
                        break;
                    }
                    warn!(conn_id = conn.id(), error = %e, "Keepalive failed");
                    conn.close();
                    break;
                }
            }
        }
    }
}
