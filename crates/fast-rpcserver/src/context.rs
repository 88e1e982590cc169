//! Request contexts: the object a handler uses to reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::SinkExt as _;
use futures::channel::mpsc;
use serde_json::Value as JsonValue;
use tracing::warn;

use fast_proto::{ErrorBody, Message, MsgId, MsgMeta};

use crate::err::HandlerError;

/// A handler's view of one in-flight request.
///
/// Cheap to clone; all clones refer to the same request.  The response
/// protocol is: any number of [`write`](RequestContext::write)s, then
/// exactly one [`end`](RequestContext::end) or
/// [`fail`](RequestContext::fail).  Calls after the terminator return
/// [`HandlerError::RequestCompleted`] and have no effect on the wire.
#[derive(Clone)]
pub struct RequestContext {
    /// State shared among the clones of this context.
    inner: Arc<CtxInner>,
}

/// Shared state of one request context.
struct CtxInner {
    /// Id of the request, echoed on every reply.
    id: MsgId,
    /// Name of the invoked method, echoed on every reply.
    method: String,
    /// The argument list the client sent.
    argv: Vec<JsonValue>,
    /// True once `end` or `fail` has been called.
    completed: AtomicBool,
    /// The connection's shared outbound message queue.
    tx: mpsc::Sender<Message>,
}

impl RequestContext {
    /// Make a new context for request `id` of method `method`.
    pub(crate) fn new(
        id: MsgId,
        method: String,
        argv: Vec<JsonValue>,
        tx: mpsc::Sender<Message>,
    ) -> Self {
        RequestContext {
            inner: Arc::new(CtxInner {
                id,
                method,
                argv,
                completed: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Return the name of the method that was invoked.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Return the request's argument list.  Always present, possibly
    /// empty.
    pub fn argv(&self) -> &[JsonValue] {
        &self.inner.argv
    }

    /// Enqueue one data item on the response stream.
    ///
    /// Completion of the returned future is the back-pressure signal:
    /// it resolves once the connection has accepted the item, and a
    /// streaming handler that awaits each `write` will pace itself to
    /// the client automatically.
    pub async fn write(&self, item: JsonValue) -> Result<(), HandlerError> {
        if self.inner.completed.load(Ordering::SeqCst) {
            warn!(
                "write on completed request {} ({:?}); ignoring",
                self.inner.id, self.inner.method
            );
            return Err(HandlerError::RequestCompleted);
        }
        self.send(Message::data(
            self.inner.id,
            MsgMeta::now(self.inner.method.as_str()),
            vec![item],
        ))
        .await
    }

    /// Terminate the request successfully, optionally delivering one
    /// final item.
    pub async fn end(&self, item: Option<JsonValue>) -> Result<(), HandlerError> {
        self.complete("end")?;
        self.send(Message::end(
            self.inner.id,
            MsgMeta::now(self.inner.method.as_str()),
            item.into_iter().collect(),
        ))
        .await
    }

    /// Terminate the request with an error.
    ///
    /// The error body crosses the wire unmodified, so whatever `name`,
    /// `message`, and `info` the handler supplies is what the caller
    /// observes.
    pub async fn fail(&self, error: ErrorBody) -> Result<(), HandlerError> {
        self.complete("fail")?;
        self.send(Message::error(
            self.inner.id,
            MsgMeta::now(self.inner.method.as_str()),
            error,
        ))
        .await
    }

    /// Return true once a terminator has been issued.
    pub(crate) fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Mark the request completed, or complain if it already was.
    fn complete(&self, what: &str) -> Result<(), HandlerError> {
        if self.inner.completed.swap(true, Ordering::SeqCst) {
            warn!(
                "{} on completed request {} ({:?}); ignoring",
                what, self.inner.id, self.inner.method
            );
            return Err(HandlerError::RequestCompleted);
        }
        Ok(())
    }

    /// Enqueue `msg` on the connection's outbound queue.
    async fn send(&self, msg: Message) -> Result<(), HandlerError> {
        // Each send clones the sender so that this method can take
        // `&self`; a clone of an mpsc sender shares the same queue.
        let mut tx = self.inner.tx.clone();
        tx.send(msg).await.map_err(|_| HandlerError::ConnectionGone)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use fast_proto::MsgBody;
    use futures::stream::StreamExt as _;
    use futures_await_test::async_test;
    use serde_json::json;

    fn ctx(buffer: usize) -> (RequestContext, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        let ctx = RequestContext::new(
            MsgId::new(7).unwrap(),
            "echo".into(),
            vec![json!("a")],
            tx,
        );
        (ctx, rx)
    }

    #[async_test]
    async fn write_then_end() {
        let (ctx, mut rx) = ctx(8);
        assert_eq!(ctx.argv(), &[json!("a")]);
        ctx.write(json!({"value": "a"})).await.unwrap();
        ctx.end(None).await.unwrap();

        let data = rx.next().await.unwrap();
        assert_eq!(data.meta.name, "echo");
        assert_eq!(data.body, MsgBody::Data(vec![json!({"value": "a"})]));
        let end = rx.next().await.unwrap();
        assert_eq!(end.body, MsgBody::End(vec![]));
    }

    #[async_test]
    async fn end_with_final_item() {
        let (ctx, mut rx) = ctx(8);
        ctx.end(Some(json!(42))).await.unwrap();
        let end = rx.next().await.unwrap();
        assert_eq!(end.body, MsgBody::End(vec![json!(42)]));
    }

    #[async_test]
    async fn calls_after_terminator_are_refused() {
        let (ctx, mut rx) = ctx(8);
        ctx.fail(ErrorBody::new("E", "nope")).await.unwrap();

        assert!(matches!(
            ctx.write(json!(1)).await,
            Err(HandlerError::RequestCompleted)
        ));
        assert!(matches!(
            ctx.end(None).await,
            Err(HandlerError::RequestCompleted)
        ));
        assert!(matches!(
            ctx.fail(ErrorBody::new("E", "again")).await,
            Err(HandlerError::RequestCompleted)
        ));

        // Exactly one message crossed the channel.
        let first = rx.next().await.unwrap();
        assert!(matches!(first.body, MsgBody::Error(_)));
        drop(ctx);
        assert!(rx.next().await.is_none());
    }

    #[async_test]
    async fn send_after_connection_gone() {
        let (ctx, rx) = ctx(8);
        drop(rx);
        assert!(matches!(
            ctx.write(json!(1)).await,
            Err(HandlerError::ConnectionGone)
        ));
    }
}
