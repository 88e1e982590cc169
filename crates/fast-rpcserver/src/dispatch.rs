//! Lookup table to find the handler for each registered RPC method.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;

use crate::context::RequestContext;
use crate::err::RegisterError;

/// A handler for one RPC method.
///
/// The handler receives a [`RequestContext`] and drives the request to
/// completion: any number of [`write`](RequestContext::write)s, then
/// exactly one [`end`](RequestContext::end) or
/// [`fail`](RequestContext::fail).  The dispatcher imposes no timeout;
/// a handler may run as long as it likes.
///
/// Any `Fn(RequestContext) -> impl Future<Output = ()>` closure is a
/// handler.
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one request.
    ///
    /// The returned future resolves when the handler is finished with
    /// the request.
    fn invoke(&self, req: RequestContext) -> BoxFuture<'static, ()>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn invoke(&self, req: RequestContext) -> BoxFuture<'static, ()> {
        (self)(req).boxed()
    }
}

/// Lookup table mapping method names to their handlers.
///
/// Read-only once the server starts accepting connections; every
/// connection shares one table.
#[derive(Default)]
pub struct DispatchTable {
    /// The registered handlers, by method name.
    methods: HashMap<String, Arc<dyn RpcHandler>>,
}

impl DispatchTable {
    /// Make a new, empty table.
    pub fn new() -> Self {
        DispatchTable::default()
    }

    /// Associate `name` with `handler`.
    ///
    /// Registering a name twice is an error: silently replacing a
    /// handler is never what the operator meant.
    pub fn register<S, H>(&mut self, name: S, handler: H) -> Result<(), RegisterError>
    where
        S: Into<String>,
        H: RpcHandler,
    {
        match self.methods.entry(name.into()) {
            Entry::Occupied(o) => Err(RegisterError::AlreadyRegistered(o.key().clone())),
            Entry::Vacant(v) => {
                v.insert(Arc::new(handler));
                Ok(())
            }
        }
    }

    /// Return the handler registered for `name`, if any.
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<dyn RpcHandler>> {
        self.methods.get(name).map(Arc::clone)
    }
}
