//! RPC connection support: the per-connection mainloop.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use futures::channel::{mpsc, oneshot};
use futures::future::{self, BoxFuture, FutureExt as _};
use futures::io::{AsyncRead, AsyncWrite};
use futures::sink::SinkExt as _;
use futures::stream::{FuturesUnordered, StreamExt as _};
use tracing::{debug, warn};

use fast_proto::{
    CodecError, ErrorBody, FastCodec, FrameReader, FrameWriter, Message, MsgBody, MsgId, MsgMeta,
};

use crate::context::RequestContext;
use crate::dispatch::DispatchTable;
use crate::err::ConnectionError;
use crate::mgr::ServerState;

/// How many response messages can be queued, per connection, before
/// handlers start to block?
const RESPONSE_CHAN_SIZE: usize = 128;

/// One accepted connection from an RPC client.
///
/// Created by [`RpcServer::new_connection`](crate::RpcServer::new_connection);
/// nothing happens until [`run`](Connection::run) is awaited.  The
/// connection counts as live (for the server's shutdown accounting)
/// from creation until it is dropped.
pub struct Connection {
    /// Lookup table for method handlers, shared with the server.
    dispatch: Arc<RwLock<DispatchTable>>,
    /// Server lifecycle state, shared with the server.
    shared: Arc<ServerState>,
    /// Fires when the server begins shutting down.
    close_rx: oneshot::Receiver<()>,
    /// True once this connection has begun shutting down.
    closing: bool,
}

/// One unit of connection work, selected from the four input sources.
enum Event {
    /// The server has begun shutting down.
    Closing,
    /// Some handler's future resolved.
    HandlerDone,
    /// A handler produced a response message.
    Response(Message),
    /// An inbound frame (or io/decode failure, or EOF).
    Frame(Option<Result<Message, CodecError>>),
}

impl Connection {
    /// Make a new connection attached to a server's state.
    pub(crate) fn new(dispatch: Arc<RwLock<DispatchTable>>, shared: Arc<ServerState>) -> Self {
        let (tx, close_rx) = oneshot::channel();
        let closing = {
            let mut inner = shared.inner.lock().expect("poisoned lock");
            inner.n_conns += 1;
            if !inner.closing {
                inner.close_signals.push(tx);
            }
            inner.closing
        };
        Connection {
            dispatch,
            shared,
            close_rx,
            closing,
        }
    }

    /// Run in a loop, decoding requests from `input`, dispatching them
    /// to handlers, and writing responses onto `output`.
    ///
    /// Resolves with `Ok(())` when the client shuts the connection
    /// down, or when the server is closing and the last in-flight
    /// request has drained.  A protocol violation or transport failure
    /// resolves with the error; in-flight handlers are dropped with
    /// the connection either way.
    pub async fn run<IN, OUT>(mut self, input: IN, output: OUT) -> Result<(), ConnectionError>
    where
        IN: AsyncRead + Send + Unpin,
        OUT: AsyncWrite + Send + Unpin,
    {
        let mut frames_in = FrameReader::new(input, FastCodec::new()).fuse();
        let mut frames_out = FrameWriter::new(output, FastCodec::new());
        let (tx_response, mut rx_response) = mpsc::channel::<Message>(RESPONSE_CHAN_SIZE);
        let mut running: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        // The sentinel keeps the select loop from ever seeing this
        // collection terminate.
        running.push(future::pending().boxed());
        let mut inflight: HashSet<MsgId> = HashSet::new();
        debug!("server connection started");

        loop {
            if self.closing && inflight.is_empty() {
                // Shutdown has drained; take the connection down.
                let _ = frames_out.close().await;
                return Ok(());
            }
            let event = futures::select! {
                _ = &mut self.close_rx => Event::Closing,
                done = running.next() => {
                    let () = done.expect("Somehow, future::pending() terminated.");
                    Event::HandlerDone
                }
                resp = rx_response.next() => {
                    // We hold a sender ourselves, so the channel cannot
                    // have closed.
                    Event::Response(resp.expect("Somehow, the response channel closed."))
                }
                req = frames_in.next() => Event::Frame(req),
            };
            match event {
                Event::Closing => self.closing = true,
                Event::HandlerDone => {}
                Event::Response(msg) => {
                    let id = msg.id;
                    let is_final = msg.is_final();
                    // Awaiting here is deliberate: when the client
                    // stops reading its responses, the whole
                    // connection stops.
                    frames_out.send(msg).await?;
                    if is_final {
                        inflight.remove(&id);
                    }
                }
                Event::Frame(None) => {
                    // The client went away.  In-flight handlers are
                    // dropped with us; their replies have nowhere to
                    // go.
                    debug!("client closed the connection");
                    return Ok(());
                }
                Event::Frame(Some(Err(e))) => return Err(e.into()),
                Event::Frame(Some(Ok(msg))) => {
                    self.handle_request(
                        msg,
                        &mut inflight,
                        &mut running,
                        &tx_response,
                        &mut frames_out,
                    )
                    .await?;
                }
            }
        }
    }

    /// Route one inbound message: launch a handler for a fresh
    /// request, or refuse it with an immediate ERROR reply.
    async fn handle_request<OUT>(
        &self,
        msg: Message,
        inflight: &mut HashSet<MsgId>,
        running: &mut FuturesUnordered<BoxFuture<'static, ()>>,
        tx_response: &mpsc::Sender<Message>,
        frames_out: &mut FrameWriter<OUT>,
    ) -> Result<(), ConnectionError>
    where
        OUT: AsyncWrite + Send + Unpin,
    {
        let id = msg.id;
        let msg_type = msg.msg_type();
        let args = match msg.body {
            MsgBody::Data(args) => args,
            MsgBody::End(_) | MsgBody::Error(_) => {
                warn!("client sent reply-only message {} for id {}", msg_type, id);
                return Err(ConnectionError::ClientSentReply { msg_type });
            }
        };
        if inflight.contains(&id) {
            warn!("client reused id {} while its request was live", id);
            return Err(ConnectionError::DuplicateId { id });
        }
        let method = msg.meta.name;
        if self.closing {
            debug!("refusing request {} ({:?}): server closing", id, method);
            let error = ErrorBody::new("ServerClosingError", "server is shutting down");
            frames_out
                .send(Message::error(id, MsgMeta::now(method.as_str()), error))
                .await?;
            return Ok(());
        }
        let handler = self.dispatch.read().expect("poisoned lock").lookup(&method);
        let Some(handler) = handler else {
            warn!("request {} names unknown method {:?}", id, method);
            let error = ErrorBody::new(
                "MethodNotFoundError",
                format!("unsupported RPC method: {:?}", method),
            );
            frames_out
                .send(Message::error(id, MsgMeta::now(method.as_str()), error))
                .await?;
            return Ok(());
        };
        debug!("request {} invokes {:?}", id, method);
        inflight.insert(id);
        let ctx = RequestContext::new(id, method, args, tx_response.clone());
        let watchdog = ctx.clone();
        let fut = handler.invoke(ctx);
        running.push(
            async move {
                fut.await;
                if !watchdog.is_completed() {
                    // Make the exactly-one-terminator rule hold on the
                    // wire even for a buggy handler.
                    warn!(
                        "handler for {:?} returned without a terminator; failing its request",
                        watchdog.method()
                    );
                    let _ = watchdog
                        .fail(ErrorBody::new(
                            "HandlerAbandonedError",
                            "handler finished without a response",
                        ))
                        .await;
                }
            }
            .boxed(),
        );
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().expect("poisoned lock");
        inner.n_conns = inner.n_conns.saturating_sub(1);
        if inner.closing && inner.n_conns == 0 {
            for waiter in inner.drained_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}
