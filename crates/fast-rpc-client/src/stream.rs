//! Result streams: the caller-visible side of one RPC.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::{FusedStream, Stream, StreamExt as _};
use serde_json::Value as JsonValue;

use crate::err::RpcError;

/// Options governing a single [`rpc`](crate::FastClient::rpc) call.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct RpcOptions {
    /// Fail the request with [`RpcError::Timeout`] if no terminator
    /// has arrived within this interval of submission.
    pub timeout: Option<Duration>,
    /// Silently drop `null` items from DATA batches.
    ///
    /// Only items inside a DATA message's array are affected; an END
    /// carrying nulls still delivers them.
    pub ignore_null_values: bool,
}

impl RpcOptions {
    /// Return the default options: no timeout, nulls delivered.
    pub fn new() -> Self {
        RpcOptions::default()
    }

    /// Return these options with the timeout set to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Return these options with null-dropping set to `ignore`.
    pub fn with_ignore_null_values(mut self, ignore: bool) -> Self {
        self.ignore_null_values = ignore;
        self
    }
}

/// An event delivered from the reactor to one request's stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// One data item.
    Item(JsonValue),
    /// Successful terminator; no more events follow.
    End,
    /// Failure terminator; no more events follow.
    Failed(RpcError),
}

/// The response to one RPC: a lazy, finite sequence of data items.
///
/// Yields `Ok(item)` for every data item the server streams back, in
/// order.  The stream then finishes in exactly one of two ways: it
/// ends (the server sent END), or it yields a single `Err(_)` and then
/// ends.  Dropping the stream early abandons the request: its id stays
/// claimed until the server's terminator arrives, but nothing more is
/// delivered.
#[derive(Debug)]
pub struct ResultStream {
    /// Events routed to us by the reactor.
    rx: mpsc::Receiver<StreamEvent>,
    /// True once a terminator has been yielded.
    done: bool,
}

impl ResultStream {
    /// Make a new `ResultStream` reading events from `rx`.
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        ResultStream { rx, done: false }
    }

    /// Collect every data item, then return them all on success.
    ///
    /// A convenience for callers that do not need to consume items
    /// incrementally.
    pub async fn collect_items(mut self) -> Result<Vec<JsonValue>, RpcError> {
        let mut items = Vec::new();
        while let Some(next) = self.next().await {
            items.push(next?);
        }
        Ok(items)
    }
}

impl Stream for ResultStream {
    type Item = Result<JsonValue, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(StreamEvent::Item(v))) => Poll::Ready(Some(Ok(v))),
            Poll::Ready(Some(StreamEvent::End)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Failed(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            // The reactor went away without sending a terminator: it
            // was dropped wholesale.  Report that like a local close.
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(RpcError::ConnectionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl FusedStream for ResultStream {
    fn is_terminated(&self) -> bool {
        self.done
    }
}
