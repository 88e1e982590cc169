//! Client connection support: the request handle, the connection
//! reactor, and inbound message routing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::channel::mpsc;
use futures::future::{self, BoxFuture, FutureExt as _};
use futures::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadHalf, WriteHalf};
use futures::sink::SinkExt as _;
use futures::stream::{Fuse, FuturesUnordered, StreamExt as _};
use futures_timer::Delay;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use fast_proto::{
    CodecError, FastCodec, FrameReader, FrameWriter, Message, MsgBody, MsgId, MsgMeta,
};

use crate::alloc::IdAllocator;
use crate::err::{FatalError, RpcError};
use crate::stream::{ResultStream, RpcOptions, StreamEvent};

/// How many data items can queue toward one result stream before the
/// connection reader pauses?
const REQUEST_CHAN_SIZE: usize = 128;

/// Default capacity of the recently-completed-requests ring.
const DEFAULT_N_RECENT: usize = 30;

/// Current wall-clock time in microseconds since the Unix epoch.
fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Configuration for a [`FastClient`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ClientOptions {
    /// How many recently completed requests to remember for
    /// [`FastClient::recent_requests`].
    pub n_recent_requests: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            n_recent_requests: DEFAULT_N_RECENT,
        }
    }
}

/// How a completed request ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Disposition {
    /// The server sent END.
    Ok,
    /// The server sent ERROR.
    Error,
    /// The local timeout fired before any terminator arrived.
    Timeout,
    /// The request was abandoned locally (stream dropped, detach,
    /// close, or connection failure).
    Aborted,
}

/// Introspection record of one recently completed request.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RecentRpc {
    /// The method that was called.
    pub method: String,
    /// The message id the request used.
    pub id: MsgId,
    /// Submission time, in microseconds since the Unix epoch.
    pub issued_uts: u64,
    /// Completion time, in microseconds since the Unix epoch.
    pub finished_uts: u64,
    /// How the request ended.
    pub disposition: Disposition,
}

/// Introspection state shared between the handle and the reactor.
struct ClientStats {
    /// Number of requests submitted and not yet terminated.
    n_live: usize,
    /// The fatal error that ended this connection, if one has.
    fatal: Option<FatalError>,
    /// Ring of recently completed requests, oldest first.
    recent: VecDeque<RecentRpc>,
    /// Capacity of `recent`.
    n_recent_max: usize,
}

impl ClientStats {
    /// Append `rec` to the recent ring, evicting the oldest entry if
    /// the ring is full.
    fn record(&mut self, rec: RecentRpc) {
        if self.n_recent_max == 0 {
            return;
        }
        if self.recent.len() >= self.n_recent_max {
            self.recent.pop_front();
        }
        self.recent.push_back(rec);
    }
}

/// A message from a [`FastClient`] handle to its [`Reactor`].
enum CtrlMsg {
    /// Submit a new request.
    Rpc {
        /// Method to invoke.
        method: String,
        /// Positional arguments.
        args: Vec<JsonValue>,
        /// Per-call options.
        opts: RpcOptions,
        /// Sink of events toward the caller's [`ResultStream`].
        tx: mpsc::Sender<StreamEvent>,
    },
    /// Stop delivering responses without closing the transport.
    Detach,
    /// Close the transport.
    Close,
}

/// A handle for submitting RPCs over one Fast connection.
///
/// Construct with [`FastClient::new`]; the returned [`Reactor`] must
/// be awaited (typically on a spawned task) for the connection to make
/// progress.  The handle is cheap to clone and all clones share the
/// same connection.
#[derive(Clone)]
pub struct FastClient {
    /// Control channel to the reactor.
    control: mpsc::UnboundedSender<CtrlMsg>,
    /// Shared introspection state.
    stats: Arc<Mutex<ClientStats>>,
}

impl FastClient {
    /// Wrap `transport` in a new Fast client with default options.
    pub fn new<T>(transport: T) -> (FastClient, Reactor<T>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin,
    {
        FastClient::with_options(transport, ClientOptions::default())
    }

    /// Wrap `transport` in a new Fast client.
    pub fn with_options<T>(transport: T, options: ClientOptions) -> (FastClient, Reactor<T>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (control, ctrl_rx) = mpsc::unbounded();
        let stats = Arc::new(Mutex::new(ClientStats {
            n_live: 0,
            fatal: None,
            recent: VecDeque::new(),
            n_recent_max: options.n_recent_requests,
        }));
        let (r, w) = transport.split();
        let timeouts = FuturesUnordered::new();
        // The sentinel keeps the select loop from ever seeing this
        // collection terminate.
        timeouts.push(future::pending().boxed());
        let reactor = Reactor {
            frames_in: FrameReader::new(r, FastCodec::new()).fuse(),
            frames_out: FrameWriter::new(w, FastCodec::new()),
            control: ctrl_rx.fuse(),
            control_closed: false,
            pending: HashMap::new(),
            ids: IdAllocator::new(),
            next_gen: 0,
            timeouts,
            stats: Arc::clone(&stats),
        };
        (FastClient { control, stats }, reactor)
    }

    /// Submit an RPC, returning the stream of its response.
    ///
    /// The stream yields zero or more data items and then terminates
    /// with success or with exactly one error.  Any number of RPCs may
    /// be in flight at once; their responses may interleave, and they
    /// complete in whatever order the server finishes them.
    pub fn rpc<S: Into<String>>(
        &self,
        method: S,
        args: Vec<JsonValue>,
        opts: RpcOptions,
    ) -> ResultStream {
        let (mut tx, rx) = mpsc::channel(REQUEST_CHAN_SIZE);
        let refusal = {
            let stats = self.stats.lock().expect("poisoned lock");
            stats.fatal.clone().map(RpcError::Connection)
        };
        let refusal = refusal.or_else(|| {
            let msg = CtrlMsg::Rpc {
                method: method.into(),
                args,
                opts,
                tx: tx.clone(),
            };
            self.control
                .unbounded_send(msg)
                .err()
                .map(|_| RpcError::ConnectionClosed)
        });
        if let Some(e) = refusal {
            let _ = tx.try_send(StreamEvent::Failed(e));
        }
        ResultStream::new(rx)
    }

    /// Stop response delivery without closing the transport.
    ///
    /// Every live request fails with [`RpcError::Detached`], and the
    /// reactor finishes.
    pub fn detach(&self) {
        let _ = self.control.unbounded_send(CtrlMsg::Detach);
    }

    /// Close the transport.
    ///
    /// Every live request fails with [`RpcError::ConnectionClosed`],
    /// and the reactor finishes.
    pub fn close(&self) {
        let _ = self.control.unbounded_send(CtrlMsg::Close);
    }

    /// Return the number of requests currently in flight.
    pub fn n_live_requests(&self) -> usize {
        self.stats.lock().expect("poisoned lock").n_live
    }

    /// Return records of recently completed requests, oldest first.
    pub fn recent_requests(&self) -> Vec<RecentRpc> {
        self.stats
            .lock()
            .expect("poisoned lock")
            .recent
            .iter()
            .cloned()
            .collect()
    }

    /// Return the fatal error that ended this connection, if one has.
    ///
    /// Once this is `Some`, the client is unusable: every subsequent
    /// [`rpc`](FastClient::rpc) fails immediately with that error.
    pub fn fatal_error(&self) -> Option<FatalError> {
        self.stats.lock().expect("poisoned lock").fatal.clone()
    }
}

/// A request whose caller is still listening.
struct OpenEnt {
    /// Method name, kept for introspection records.
    method: String,
    /// Submission timestamp.
    issued_uts: u64,
    /// Sink of events toward the caller's [`ResultStream`].
    tx: mpsc::Sender<StreamEvent>,
    /// Drop null items inside DATA batches.
    ignore_null_values: bool,
}

/// State of one slot in the pending-request table.
enum PendingState {
    /// The caller is waiting on the result stream.
    Open(OpenEnt),
    /// The request is locally dead (timed out or abandoned), but its
    /// id stays claimed until the real terminator arrives, so that a
    /// late reply cannot be mis-routed to a successor request.
    Zombie,
}

/// One slot in the pending-request table.
struct PendingEnt {
    /// Distinguishes this claim on the id from any earlier one, so a
    /// stale timer cannot affect a successor request.
    generation: u64,
    /// Live or zombie state.
    state: PendingState,
}

/// Why the run loop stopped, when it stopped without a fatal error.
enum StopReason {
    /// [`FastClient::detach`] was called.
    Detached,
    /// [`FastClient::close`] was called, or every handle was dropped
    /// with nothing outstanding.
    Closed,
    /// The peer shut the connection down with nothing outstanding.
    CleanEof,
}

/// One unit of reactor work, selected from the three input sources.
enum Event {
    /// A control message (or the end of the control channel).
    Ctrl(Option<CtrlMsg>),
    /// A request timeout fired.
    TimedOut(MsgId, u64),
    /// An inbound frame (or io/decode failure, or EOF).
    Frame(Option<Result<Message, CodecError>>),
}

/// Object that runs a Fast client connection.
///
/// A connection progresses only while its reactor future is being
/// polled, so this must be awaited, typically via `spawn`.  The future
/// resolves when the connection is finished: `Ok(())` after a local
/// detach/close or a clean remote shutdown, and the fatal error
/// otherwise.
#[must_use = "If you don't await the reactor, the connection never makes progress."]
pub struct Reactor<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Inbound frames from the peer.
    frames_in: Fuse<FrameReader<ReadHalf<T>>>,
    /// Outbound frames to the peer.
    frames_out: FrameWriter<WriteHalf<T>>,
    /// Control messages from the handles.
    control: Fuse<mpsc::UnboundedReceiver<CtrlMsg>>,
    /// True once every handle has been dropped.
    control_closed: bool,
    /// Outstanding requests (and zombie id claims), by id.
    pending: HashMap<MsgId, PendingEnt>,
    /// Request id allocator.  Its live set is exactly the key set of
    /// `pending`.
    ids: IdAllocator,
    /// Generation counter for pending slots.
    next_gen: u64,
    /// Pending request timeouts, plus one sentinel future that never
    /// completes.
    timeouts: FuturesUnordered<BoxFuture<'static, (MsgId, u64)>>,
    /// Shared introspection state.
    stats: Arc<Mutex<ClientStats>>,
}

impl<T> Reactor<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Run the connection to completion.
    pub async fn run(mut self) -> Result<(), FatalError> {
        debug!("client connection reactor started");
        match self.run_loop().await {
            Ok(StopReason::Detached) => {
                self.fail_all(|| RpcError::Detached);
                Ok(())
            }
            Ok(StopReason::Closed) => {
                // Dropping the writer would abandon the transport
                // without a proper shutdown; close it instead.
                let _ = self.frames_out.close().await;
                self.fail_all(|| RpcError::ConnectionClosed);
                Ok(())
            }
            Ok(StopReason::CleanEof) => Ok(()),
            Err(fatal) => {
                {
                    let mut stats = self.stats.lock().expect("poisoned lock");
                    if stats.fatal.is_none() {
                        stats.fatal = Some(fatal.clone());
                    }
                }
                self.fail_all(|| RpcError::Connection(fatal.clone()));
                Err(fatal)
            }
        }
    }

    /// The reactor's main loop: multiplex control messages, timeouts,
    /// and inbound frames until the connection is over.
    async fn run_loop(&mut self) -> Result<StopReason, FatalError> {
        loop {
            if self.control_closed && self.pending.is_empty() {
                // Every handle is gone and nothing is outstanding.
                return Ok(StopReason::Closed);
            }
            let event = futures::select! {
                ctrl = self.control.next() => Event::Ctrl(ctrl),
                fired = self.timeouts.next() => {
                    let (id, generation) = fired.expect("Somehow, future::pending() terminated.");
                    Event::TimedOut(id, generation)
                }
                frame = self.frames_in.next() => Event::Frame(frame),
            };
            match event {
                Event::Ctrl(None) => self.control_closed = true,
                Event::Ctrl(Some(CtrlMsg::Detach)) => return Ok(StopReason::Detached),
                Event::Ctrl(Some(CtrlMsg::Close)) => return Ok(StopReason::Closed),
                Event::Ctrl(Some(CtrlMsg::Rpc {
                    method,
                    args,
                    opts,
                    tx,
                })) => self.start_request(method, args, opts, tx).await?,
                Event::TimedOut(id, generation) => self.handle_timeout(id, generation),
                Event::Frame(None) => {
                    let any_open = self
                        .pending
                        .values()
                        .any(|ent| matches!(ent.state, PendingState::Open(_)));
                    return if any_open {
                        Err(FatalError::UnexpectedEof)
                    } else {
                        Ok(StopReason::CleanEof)
                    };
                }
                Event::Frame(Some(Err(e))) => return Err(e.into()),
                Event::Frame(Some(Ok(msg))) => self.handle_message(msg).await?,
            }
        }
    }

    /// Allocate an id for a new request and send its DATA message.
    ///
    /// A transport write failure is fatal to the whole connection: the
    /// framed writer may have flushed part of a frame already.
    async fn start_request(
        &mut self,
        method: String,
        args: Vec<JsonValue>,
        opts: RpcOptions,
        mut tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), FatalError> {
        let Some(id) = self.ids.alloc() else {
            let _ = tx.try_send(StreamEvent::Failed(RpcError::IdsExhausted));
            return Ok(());
        };
        debug!("submitting rpc {:?} with id {}", method, id);
        let meta = MsgMeta::now(method.as_str());
        let issued_uts = meta.uts;
        let generation = self.next_gen;
        self.next_gen += 1;
        if let Some(timeout) = opts.timeout {
            self.timeouts
                .push(Delay::new(timeout).map(move |_| (id, generation)).boxed());
        }
        self.pending.insert(
            id,
            PendingEnt {
                generation,
                state: PendingState::Open(OpenEnt {
                    method,
                    issued_uts,
                    tx,
                    ignore_null_values: opts.ignore_null_values,
                }),
            },
        );
        self.stats.lock().expect("poisoned lock").n_live += 1;
        self.frames_out
            .send(Message::data(id, meta, args))
            .await
            .map_err(FatalError::from)
    }

    /// A request's timeout fired.  If the request is still open under
    /// the same generation, fail it locally; its id stays claimed
    /// until the server's terminator finally arrives.
    fn handle_timeout(&mut self, id: MsgId, generation: u64) {
        let Some(ent) = self.pending.get_mut(&id) else {
            return;
        };
        if ent.generation != generation {
            // A stale timer from an earlier claim on this id.
            return;
        }
        if let PendingState::Open(open) = &mut ent.state {
            debug!("rpc {:?} (id {}) timed out", open.method, id);
            let _ = open.tx.try_send(StreamEvent::Failed(RpcError::Timeout));
            let rec = RecentRpc {
                method: std::mem::take(&mut open.method),
                id,
                issued_uts: open.issued_uts,
                finished_uts: now_micros(),
                disposition: Disposition::Timeout,
            };
            ent.state = PendingState::Zombie;
            let mut stats = self.stats.lock().expect("poisoned lock");
            stats.n_live = stats.n_live.saturating_sub(1);
            stats.record(rec);
        }
    }

    /// Route one inbound message to the request bearing its id.
    async fn handle_message(&mut self, msg: Message) -> Result<(), FatalError> {
        let id = msg.id;
        let Some(ent) = self.pending.remove(&id) else {
            warn!("peer sent {} for unknown request id {}", msg.msg_type(), id);
            return Err(FatalError::UnsolicitedId { id });
        };
        let PendingEnt { generation, state } = ent;
        let mut open = match state {
            PendingState::Zombie => {
                // Discard quietly; a terminator finally frees the id.
                if msg.is_final() {
                    self.ids.release(id);
                } else {
                    self.pending.insert(
                        id,
                        PendingEnt {
                            generation,
                            state: PendingState::Zombie,
                        },
                    );
                }
                return Ok(());
            }
            PendingState::Open(open) => open,
        };
        match msg.body {
            MsgBody::Data(items) => {
                let mut delivered = true;
                for item in items {
                    if open.ignore_null_values && item.is_null() {
                        continue;
                    }
                    // Awaiting here is deliberate: when the caller
                    // stops draining its stream, we stop reading the
                    // connection.
                    if open.tx.send(StreamEvent::Item(item)).await.is_err() {
                        delivered = false;
                        break;
                    }
                }
                let state = if delivered {
                    PendingState::Open(open)
                } else {
                    // The caller dropped its stream.  Keep the id
                    // claimed until the terminator arrives.
                    self.record_finished(open.method, id, open.issued_uts, Disposition::Aborted);
                    PendingState::Zombie
                };
                self.pending.insert(id, PendingEnt { generation, state });
            }
            MsgBody::End(items) => {
                // Release the id before the caller can observe
                // completion.
                self.ids.release(id);
                for item in items {
                    if open.tx.send(StreamEvent::Item(item)).await.is_err() {
                        break;
                    }
                }
                let _ = open.tx.send(StreamEvent::End).await;
                self.record_finished(open.method, id, open.issued_uts, Disposition::Ok);
            }
            MsgBody::Error(body) => {
                self.ids.release(id);
                let _ = open.tx.send(StreamEvent::Failed(RpcError::Peer(body))).await;
                self.record_finished(open.method, id, open.issued_uts, Disposition::Error);
            }
        }
        Ok(())
    }

    /// Note a request as finished in the shared stats.
    fn record_finished(&self, method: String, id: MsgId, issued_uts: u64, disposition: Disposition) {
        let mut stats = self.stats.lock().expect("poisoned lock");
        stats.n_live = stats.n_live.saturating_sub(1);
        stats.record(RecentRpc {
            method,
            id,
            issued_uts,
            finished_uts: now_micros(),
            disposition,
        });
    }

    /// Terminate every open request with an error from `mk_err`.
    fn fail_all<F: Fn() -> RpcError>(&mut self, mk_err: F) {
        let mut stats = self.stats.lock().expect("poisoned lock");
        for (id, ent) in self.pending.drain() {
            if let PendingState::Open(mut open) = ent.state {
                let _ = open.tx.try_send(StreamEvent::Failed(mk_err()));
                stats.n_live = stats.n_live.saturating_sub(1);
                stats.record(RecentRpc {
                    method: open.method,
                    id,
                    issued_uts: open.issued_uts,
                    finished_uts: now_micros(),
                    disposition: Disposition::Aborted,
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use fast_proto::ErrorBody;
    use fast_proto::testing::{LocalStream, duplex};
    use futures::executor::block_on;
    use futures::io::AsyncWriteExt as _;
    use futures::join;
    use serde_json::json;
    use std::time::Duration;

    /// Frame endpoints for the fake server side of a test connection.
    fn peer(
        stream: LocalStream,
    ) -> (
        FrameReader<ReadHalf<LocalStream>>,
        FrameWriter<WriteHalf<LocalStream>>,
    ) {
        let (r, w) = stream.split();
        (
            FrameReader::new(r, FastCodec::new()),
            FrameWriter::new(w, FastCodec::new()),
        )
    }

    /// The args carried by a request message.
    fn argv(msg: &Message) -> Vec<JsonValue> {
        match &msg.body {
            MsgBody::Data(items) => items.clone(),
            other => panic!("request was not DATA: {:?}", other),
        }
    }

    #[test]
    fn streams_data_then_end() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                let req = prx.next().await.unwrap().unwrap();
                assert_eq!(req.meta.name, "echo");
                assert_eq!(argv(&req), vec![json!("a"), json!("b")]);
                ptx.send(Message::data(
                    req.id,
                    MsgMeta::new("echo", 1),
                    vec![json!("a")],
                ))
                .await
                .unwrap();
                ptx.send(Message::data(
                    req.id,
                    MsgMeta::new("echo", 2),
                    vec![json!("b")],
                ))
                .await
                .unwrap();
                ptx.send(Message::end(req.id, MsgMeta::new("echo", 3), vec![]))
                    .await
                    .unwrap();
                (prx, ptx)
            };

            let call = async {
                let stream = client.rpc("echo", vec![json!("a"), json!("b")], RpcOptions::new());
                let items = stream.collect_items().await.unwrap();
                assert_eq!(items, vec![json!("a"), json!("b")]);
                assert_eq!(client.n_live_requests(), 0);
                let recent = client.recent_requests();
                assert_eq!(recent.len(), 1);
                assert_eq!(recent[0].method, "echo");
                assert_eq!(recent[0].disposition, Disposition::Ok);
                client.close();
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }

    #[test]
    fn end_may_carry_final_items() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                let req = prx.next().await.unwrap().unwrap();
                ptx.send(Message::end(
                    req.id,
                    MsgMeta::new("date", 1),
                    vec![json!({"iso8601": "2020-01-01T00:00:00Z"})],
                ))
                .await
                .unwrap();
                (prx, ptx)
            };

            let call = async {
                let items = client
                    .rpc("date", vec![], RpcOptions::new())
                    .collect_items()
                    .await
                    .unwrap();
                assert_eq!(items.len(), 1);
                client.close();
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }

    #[test]
    fn responses_interleave_across_requests() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                let slow = prx.next().await.unwrap().unwrap();
                let quick = prx.next().await.unwrap().unwrap();
                assert_ne!(slow.id, quick.id);
                // Finish the second request first.
                ptx.send(Message::end(
                    quick.id,
                    MsgMeta::new("echo", 1),
                    vec![json!("fast")],
                ))
                .await
                .unwrap();
                ptx.send(Message::end(slow.id, MsgMeta::new("sleep", 2), vec![]))
                    .await
                    .unwrap();
                (prx, ptx)
            };

            let call = async {
                let s_slow = client.rpc("sleep", vec![json!({"ms": 50})], RpcOptions::new());
                let s_quick = client.rpc("echo", vec![json!("fast")], RpcOptions::new());
                // The echo completes while the sleep is still live.
                let quick = s_quick.collect_items().await.unwrap();
                assert_eq!(quick, vec![json!("fast")]);
                assert_eq!(client.n_live_requests(), 1);
                let slow = s_slow.collect_items().await.unwrap();
                assert!(slow.is_empty());
                client.close();
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }

    #[test]
    fn error_terminator_preserves_body() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                let req = prx.next().await.unwrap().unwrap();
                let body = ErrorBody::new("VError", "count must be an integer in range [1, 10240]")
                    .with_info(json!({"foundValue": 0, "minValue": 1, "maxValue": 10240}));
                ptx.send(Message::error(req.id, MsgMeta::new("yes", 1), body))
                    .await
                    .unwrap();
                (prx, ptx)
            };

            let call = async {
                let err = client
                    .rpc("yes", vec![json!({"count": 0})], RpcOptions::new())
                    .collect_items()
                    .await
                    .unwrap_err();
                let body = err.peer_error().expect("not a peer error");
                assert_eq!(body.name, "VError");
                assert_eq!(body.info.as_ref().unwrap()["foundValue"], json!(0));
                assert_eq!(
                    client.recent_requests()[0].disposition,
                    Disposition::Error
                );
                client.close();
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }

    #[test]
    fn null_items_dropped_on_request() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                let req = prx.next().await.unwrap().unwrap();
                ptx.send(Message::data(
                    req.id,
                    MsgMeta::new("words", 1),
                    vec![json!(1), json!(null), json!(2)],
                ))
                .await
                .unwrap();
                // Nulls in the END batch are *not* filtered.
                ptx.send(Message::end(
                    req.id,
                    MsgMeta::new("words", 2),
                    vec![json!(null)],
                ))
                .await
                .unwrap();
                (prx, ptx)
            };

            let call = async {
                let opts = RpcOptions::new().with_ignore_null_values(true);
                let items = client
                    .rpc("words", vec![], opts)
                    .collect_items()
                    .await
                    .unwrap();
                assert_eq!(items, vec![json!(1), json!(2), json!(null)]);
                client.close();
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }

    #[test]
    fn unsolicited_id_is_fatal() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                let req = prx.next().await.unwrap().unwrap();
                let wrong = MsgId::new(u32::from(req.id) + 40).unwrap();
                ptx.send(Message::end(wrong, MsgMeta::new("echo", 1), vec![]))
                    .await
                    .unwrap();
                (prx, ptx)
            };

            let call = async {
                let err = client
                    .rpc("echo", vec![], RpcOptions::new())
                    .collect_items()
                    .await
                    .unwrap_err();
                assert!(matches!(
                    err,
                    RpcError::Connection(FatalError::UnsolicitedId { .. })
                ));
                assert!(client.fatal_error().is_some());
                // The client is unusable from here on.
                let err = client
                    .rpc("echo", vec![], RpcOptions::new())
                    .collect_items()
                    .await
                    .unwrap_err();
                assert!(matches!(err, RpcError::Connection(_)));
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            assert!(matches!(run, Err(FatalError::UnsolicitedId { .. })));
        });
    }

    #[test]
    fn garbage_bytes_are_fatal() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, ptx) = peer(far);

            let server = async move {
                // Wait for the request, then reply with a frame
                // bearing a bad version byte.
                let _req = prx.next().await.unwrap().unwrap();
                let mut raw = ptx.into_inner();
                raw.write_all(&[0x02_u8; 32]).await.unwrap();
                (prx, raw)
            };

            let call = async {
                let err = client
                    .rpc("echo", vec![], RpcOptions::new())
                    .collect_items()
                    .await
                    .unwrap_err();
                assert!(matches!(
                    err,
                    RpcError::Connection(FatalError::Proto(
                        fast_proto::Error::VersionMismatch { .. }
                    ))
                ));
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            assert!(matches!(run, Err(FatalError::Proto(_))));
        });
    }

    #[test]
    fn timeout_then_late_terminator() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                let req = prx.next().await.unwrap().unwrap();
                // Let the client's timeout fire, then answer anyway.
                Delay::new(Duration::from_millis(80)).await;
                ptx.send(Message::end(
                    req.id,
                    MsgMeta::new("slow", 1),
                    vec![json!("late")],
                ))
                .await
                .unwrap();
                // A later request is served normally.
                let req2 = prx.next().await.unwrap().unwrap();
                ptx.send(Message::end(req2.id, MsgMeta::new("quick", 2), vec![]))
                    .await
                    .unwrap();
                (prx, ptx)
            };

            let call = async {
                let opts = RpcOptions::new().with_timeout(Duration::from_millis(5));
                let err = client
                    .rpc("slow", vec![], opts)
                    .collect_items()
                    .await
                    .unwrap_err();
                assert!(matches!(err, RpcError::Timeout));
                assert_eq!(client.n_live_requests(), 0);
                assert_eq!(
                    client.recent_requests()[0].disposition,
                    Disposition::Timeout
                );

                // The late END is discarded silently, and the
                // connection remains usable afterwards.
                let items = client
                    .rpc("quick", vec![], RpcOptions::new())
                    .collect_items()
                    .await
                    .unwrap();
                assert!(items.is_empty());
                client.close();
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }

    #[test]
    fn detach_fails_live_requests() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, ptx) = peer(far);

            let server = async move {
                let _req = prx.next().await.unwrap().unwrap();
                (prx, ptx)
            };

            let call = async {
                let stream = client.rpc("hang", vec![], RpcOptions::new());
                client.detach();
                let err = stream.collect_items().await.unwrap_err();
                assert!(matches!(err, RpcError::Detached));
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }

    #[test]
    fn close_fails_live_requests() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, ptx) = peer(far);

            let server = async move {
                let _req = prx.next().await.unwrap().unwrap();
                (prx, ptx)
            };

            let call = async {
                let stream = client.rpc("hang", vec![], RpcOptions::new());
                client.close();
                let err = stream.collect_items().await.unwrap_err();
                assert!(matches!(err, RpcError::ConnectionClosed));
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }

    #[test]
    fn eof_with_live_requests_is_fatal() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::new(near);
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                let _req = prx.next().await.unwrap().unwrap();
                // Close our write side: the client sees EOF with a
                // request still outstanding.
                ptx.close().await.unwrap();
                prx
            };

            let call = async {
                let err = client
                    .rpc("hang", vec![], RpcOptions::new())
                    .collect_items()
                    .await
                    .unwrap_err();
                assert!(matches!(
                    err,
                    RpcError::Connection(FatalError::UnexpectedEof)
                ));
            };

            let (run, _prx, ()) = join!(reactor.run(), server, call);
            assert!(matches!(run, Err(FatalError::UnexpectedEof)));
        });
    }

    #[test]
    fn recent_ring_is_bounded() {
        block_on(async {
            let (near, far) = duplex();
            let (client, reactor) = FastClient::with_options(
                near,
                ClientOptions {
                    n_recent_requests: 2,
                },
            );
            let (mut prx, mut ptx) = peer(far);

            let server = async move {
                for _ in 0..4 {
                    let req = prx.next().await.unwrap().unwrap();
                    ptx.send(Message::end(req.id, MsgMeta::new("echo", 1), vec![]))
                        .await
                        .unwrap();
                }
                (prx, ptx)
            };

            let call = async {
                for i in 0..4 {
                    client
                        .rpc(format!("m{}", i), vec![], RpcOptions::new())
                        .collect_items()
                        .await
                        .unwrap();
                }
                let recent = client.recent_requests();
                assert_eq!(recent.len(), 2);
                assert_eq!(recent[0].method, "m2");
                assert_eq!(recent[1].method, "m3");
                client.close();
            };

            let (run, _peer_io, ()) = join!(reactor.run(), server, call);
            run.unwrap();
        });
    }
}
