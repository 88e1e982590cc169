//! Top-level `RpcServer`: the method registry and shutdown
//! coordinator shared by every connection.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use futures::channel::oneshot;
use futures::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::connection::Connection;
use crate::dispatch::{DispatchTable, RpcHandler};
use crate::err::{ConnectionError, RegisterError};

/// Shared state, configuration, and data for all RPC connections.
///
/// An `RpcServer` holds the registered method handlers and knows how
/// to attach itself to accepted connections.  Listening for
/// connections is the caller's business; hand each accepted
/// connection's byte streams to [`serve`](RpcServer::serve).
///
/// Graceful shutdown: call [`close`](RpcServer::close), await
/// [`conns_destroyed`](RpcServer::conns_destroyed).
pub struct RpcServer {
    /// Registered methods, shared read-only with every connection.
    dispatch: Arc<RwLock<DispatchTable>>,
    /// Lifecycle state shared with every connection.
    shared: Arc<ServerState>,
}

/// Lifecycle state shared between the server handle and its
/// connections.
pub(crate) struct ServerState {
    /// The lock-protected parts.
    pub(crate) inner: Mutex<StateInner>,
}

/// The lock-protected lifecycle state.
pub(crate) struct StateInner {
    /// True once [`RpcServer::close`] has been called.
    pub(crate) closing: bool,
    /// Number of connections created and not yet destroyed.
    pub(crate) n_conns: usize,
    /// Waiters for the last connection to drain after close.
    pub(crate) drained_waiters: Vec<oneshot::Sender<()>>,
    /// Wakeups delivered to running connections when closing starts.
    pub(crate) close_signals: Vec<oneshot::Sender<()>>,
}

impl Default for RpcServer {
    fn default() -> Self {
        RpcServer::new()
    }
}

impl RpcServer {
    /// Create a new server with no methods registered.
    pub fn new() -> Self {
        RpcServer {
            dispatch: Arc::new(RwLock::new(DispatchTable::new())),
            shared: Arc::new(ServerState {
                inner: Mutex::new(StateInner {
                    closing: false,
                    n_conns: 0,
                    drained_waiters: Vec::new(),
                    close_signals: Vec::new(),
                }),
            }),
        }
    }

    /// Associate `name` with `handler` for every connection.
    ///
    /// Registering the same name twice is an error.  Registration is
    /// intended to happen before connections are served; methods
    /// registered later are visible to new requests, but relying on
    /// that is poor form.
    pub fn register_rpc_method<S, H>(&self, name: S, handler: H) -> Result<(), RegisterError>
    where
        S: Into<String>,
        H: RpcHandler,
    {
        self.dispatch
            .write()
            .expect("poisoned lock")
            .register(name, handler)
    }

    /// Make a [`Connection`] attached to this server.
    ///
    /// The connection counts toward shutdown accounting from this
    /// moment, so run it.
    pub fn new_connection(&self) -> Connection {
        Connection::new(Arc::clone(&self.dispatch), Arc::clone(&self.shared))
    }

    /// Serve one accepted connection to completion.
    ///
    /// Equivalent to `self.new_connection().run(input, output)`.
    pub async fn serve<IN, OUT>(&self, input: IN, output: OUT) -> Result<(), ConnectionError>
    where
        IN: AsyncRead + Send + Unpin,
        OUT: AsyncWrite + Send + Unpin,
    {
        self.new_connection().run(input, output).await
    }

    /// Begin a graceful shutdown.
    ///
    /// Fresh requests on every connection are refused from here on,
    /// in-flight requests run to completion, and each connection shuts
    /// down once it has drained.  Idempotent.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock().expect("poisoned lock");
        if inner.closing {
            return;
        }
        inner.closing = true;
        debug!("server closing; {} connection(s) still live", inner.n_conns);
        for signal in inner.close_signals.drain(..) {
            let _ = signal.send(());
        }
        if inner.n_conns == 0 {
            for waiter in inner.drained_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Return a future that resolves once [`close`](RpcServer::close)
    /// has been called and the last connection has been destroyed.
    ///
    /// Resolves immediately if that has already happened.
    pub fn conns_destroyed(&self) -> impl Future<Output = ()> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock().expect("poisoned lock");
            if inner.closing && inner.n_conns == 0 {
                let _ = tx.send(());
            } else {
                inner.drained_waiters.push(tx);
            }
        }
        async move {
            // An error here means the server was dropped wholesale;
            // its connections are certainly gone then.
            let _ = rx.await;
        }
    }

    /// Return the number of live connections.
    pub fn n_connections(&self) -> usize {
        self.shared.inner.lock().expect("poisoned lock").n_conns
    }
}
