//! Convenience wrappers over [`Proxy`].
//!
//! - [`async_`] turns a callable proxy into one whose calls return an
//!   [`AsyncResult`] instead of waiting
//! - [`timed`] does the same and expires every result after a fixed time
//! - [`buffiter`] reads a remote iterator as a [`Stream`], fetching items
//!   in chunks that grow by `factor` up to `max_chunk`

use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::protocol::async_result::AsyncResult;
use crate::protocol::object::Data;
use crate::protocol::proxy::Proxy;

/// Callable proxy whose calls do not wait for the reply
#[derive(Clone, Debug)]
pub struct AsyncProxy {
    proxy: Proxy,
}

pub fn async_(proxy: Proxy) -> AsyncProxy {
    AsyncProxy { proxy }
}

impl AsyncProxy {
    pub fn call(&self, args: Vec<Data>, kwargs: Vec<(String, Data)>) -> AsyncResult {
        self.proxy.call_async(args, kwargs)
    }

    pub fn call_method(
        &self,
        name: &str,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
    ) -> AsyncResult {
        self.proxy.call_method_async(name, args, kwargs)
    }

    /// The wrapped proxy
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}

/// Like [`AsyncProxy`], with every result expiring after `ttl`
#[derive(Clone, Debug)]
pub struct TimedProxy {
    inner: AsyncProxy,
    ttl: Duration,
}

pub fn timed(proxy: Proxy, ttl: Duration) -> TimedProxy {
    TimedProxy {
        inner: async_(proxy),
        ttl,
    }
}

impl TimedProxy {
    pub fn call(&self, args: Vec<Data>, kwargs: Vec<(String, Data)>) -> AsyncResult {
        let result = self.inner.call(args, kwargs);
        result.set_expiry(self.ttl);
        result
    }

    pub fn call_method(
        &self,
        name: &str,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
    ) -> AsyncResult {
        let result = self.inner.call_method(name, args, kwargs);
        result.set_expiry(self.ttl);
        result
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn proxy(&self) -> &Proxy {
        self.inner.proxy()
    }
}

struct BuffIter {
    proxy: Proxy,
    chunk: usize,
    max_chunk: usize,
    factor: f64,
    buffer: VecDeque<Data>,
    done: bool,
}

impl BuffIter {
    fn grow(&mut self) {
        let next = (self.chunk as f64 * self.factor) as usize;
        self.chunk = next.clamp(self.chunk, self.max_chunk);
    }
}

/// Stream over a remote iterator.
///
/// The first request asks for `chunk` items; each later one asks for
/// `factor` times more, never more than `max_chunk`. The stream ends on the
/// first empty chunk. A failed fetch is yielded once and ends the stream.
pub fn buffiter(
    proxy: Proxy,
    chunk: usize,
    max_chunk: usize,
    factor: f64,
) -> Result<impl Stream<Item = Result<Data>>> {
    if factor.is_nan() || factor < 1.0 {
        return Err(ProtocolError::ConfigError(format!(
            "buffiter factor must be >= 1, got {factor}"
        )));
    }
    if chunk == 0 || max_chunk < chunk {
        return Err(ProtocolError::ConfigError(format!(
            "buffiter needs 0 < chunk <= max_chunk, got {chunk} and {max_chunk}"
        )));
    }

    let state = BuffIter {
        proxy,
        chunk,
        max_chunk,
        factor,
        buffer: VecDeque::new(),
        done: false,
    };

    Ok(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.buffer.pop_front() {
                return Some((Ok(item), state));
            }
            if state.done {
                return None;
            }
            match state.proxy.next_chunk(state.chunk).await {
                Ok(items) if items.is_empty() => return None,
                Ok(items) => {
                    state.buffer.extend(items);
                    state.grow();
                }
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
            }
        }
    }))
}
