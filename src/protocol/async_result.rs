//! # Async Results
//!
//! Handle for a request whose completion is observed later rather than
//! awaited immediately.
//!
//! ## States
//! `Pending → Ready | Error | Expired`. Every transition out of `Pending` is
//! terminal. `Expired` is local only: the peer still runs the request and its
//! reply, when it arrives, is discarded.
//!
//! Callbacks run exactly once, at resolution, on the task that resolves the
//! result (the connection's dispatch task for replies, the caller for
//! expiry). A callback registered after resolution runs immediately.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::protocol::message::Handler;
use crate::protocol::object::Data;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    Pending,
    Ready,
    Error,
    Expired,
}

type Callback = Box<dyn FnOnce(Result<Data>) + Send + 'static>;

struct SlotState {
    outcome: Option<Result<Data>>,
    expired: bool,
    callbacks: Vec<Callback>,
}

impl SlotState {
    fn is_settled(&self) -> bool {
        self.expired || self.outcome.is_some()
    }
}

struct Slot {
    state: Mutex<SlotState>,
    settled: watch::Sender<bool>,
}

/// Future-like handle to the eventual reply of one request
#[derive(Clone)]
pub struct AsyncResult {
    seq: u64,
    handler: Handler,
    slot: Arc<Slot>,
}

impl AsyncResult {
    pub(crate) fn new(seq: u64, handler: Handler) -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            seq,
            handler,
            slot: Arc::new(Slot {
                state: Mutex::new(SlotState {
                    outcome: None,
                    expired: false,
                    callbacks: Vec::new(),
                }),
                settled,
            }),
        }
    }

    /// Already-failed result, used when a request could not be sent
    pub(crate) fn failed(seq: u64, handler: Handler, err: ProtocolError) -> Self {
        let result = Self::new(seq, handler);
        result.resolve(Err(err));
        result
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.slot
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sequence id of the request this result belongs to
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn handler(&self) -> Handler {
        self.handler
    }

    pub fn state(&self) -> ResultState {
        let state = self.lock();
        if state.expired {
            return ResultState::Expired;
        }
        match &state.outcome {
            None => ResultState::Pending,
            Some(Ok(_)) => ResultState::Ready,
            Some(Err(_)) => ResultState::Error,
        }
    }

    /// True once the result left `Pending`
    pub fn is_ready(&self) -> bool {
        self.lock().is_settled()
    }

    pub fn is_expired(&self) -> bool {
        self.lock().expired
    }

    /// Settle with a reply. Returns `false` (and drops `outcome`) when the
    /// result was already settled.
    pub(crate) fn resolve(&self, outcome: Result<Data>) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.is_settled() {
                drop(state);
                debug!(seq = self.seq, handler = %self.handler, "Discarding reply for settled result");
                drop(outcome);
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };

        self.slot.settled.send_replace(true);
        for callback in callbacks {
            callback(outcome.clone());
        }
        true
    }

    /// Stop waiting locally. The peer still completes the request; its reply
    /// is discarded. No effect on a settled result.
    pub fn expire(&self) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.is_settled() {
                return false;
            }
            state.expired = true;
            std::mem::take(&mut state.callbacks)
        };

        debug!(seq = self.seq, handler = %self.handler, "Async result expired");
        self.slot.settled.send_replace(true);
        for callback in callbacks {
            callback(Err(ProtocolError::Expired));
        }
        true
    }

    /// Expire the result after `ttl` unless it settles first
    pub fn set_expiry(&self, ttl: Duration) {
        let result = self.clone();
        let mut settled = self.slot.settled.subscribe();
        tokio::spawn(async move {
            let waited = tokio::time::timeout(ttl, settled.wait_for(|done| *done)).await;
            if waited.is_err() {
                result.expire();
            }
        });
    }

    /// Register `callback`; it runs exactly once with the value or failure
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<Data>) + Send + 'static,
    {
        let settled = {
            let mut state = self.lock();
            if !state.is_settled() {
                state.callbacks.push(Box::new(callback));
                return;
            }
            Self::read_outcome(&state)
        };
        callback(settled);
    }

    fn read_outcome(state: &SlotState) -> Result<Data> {
        if state.expired {
            return Err(ProtocolError::Expired);
        }
        match &state.outcome {
            Some(outcome) => outcome.clone(),
            None => Err(ProtocolError::Custom("result still pending".into())),
        }
    }

    /// Wait for the reply. `None` waits until the result settles (a closing
    /// connection always settles it). When `timeout` elapses first the
    /// result expires and `ProtocolError::Expired` is returned.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Data> {
        let mut settled = self.slot.settled.subscribe();
        let wait = async {
            let _ = settled.wait_for(|done| *done).await;
        };

        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, wait).await.is_err() {
                    self.expire();
                }
            }
            None => wait.await,
        }

        self.value()
    }

    /// Value of a settled result. An `Error` result returns the carried
    /// failure; a pending one returns an error without blocking.
    pub fn value(&self) -> Result<Data> {
        Self::read_outcome(&self.lock())
    }

    /// Value if settled, `None` while pending
    pub fn try_value(&self) -> Option<Result<Data>> {
        let state = self.lock();
        state.is_settled().then(|| Self::read_outcome(&state))
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("seq", &self.seq)
            .field("handler", &self.handler)
            .field("state", &self.state())
            .finish()
    }
}
