//! Error types used by `fast-rpcserver`.

use std::io::Error as IoError;
use std::sync::Arc;

use fast_proto::{CodecError, MsgId, MsgType};

/// An error from registering an RPC method.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegisterError {
    /// The method name already has a handler.
    #[error("Rpc method {0:?} is already registered")]
    AlreadyRegistered(String),
}

/// A failure that closes one server-side [`Connection`].
///
/// Requests in flight on the connection when one of these occurs are
/// dropped; their replies can no longer be delivered anywhere.
///
/// [`Connection`]: crate::Connection
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The transport failed while reading or writing.
    #[error("Io error on connection")]
    Io(#[source] Arc<IoError>),
    /// The client violated the framing or payload rules.
    #[error("Protocol violation on connection")]
    Proto(#[source] fast_proto::Error),
    /// The client reused an id while its earlier request was live.
    #[error("Client reused id {id} while its request was live")]
    DuplicateId {
        /// The id that was reused.
        id: MsgId,
    },
    /// The client sent a message type that only servers send.
    #[error("Client sent a reply-only message type ({msg_type})")]
    ClientSentReply {
        /// The offending message type.
        msg_type: MsgType,
    },
}

impl From<CodecError> for ConnectionError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => ConnectionError::Io(Arc::new(io)),
            CodecError::Dec(p) | CodecError::Enc(p) => ConnectionError::Proto(p),
            // CodecError is non_exhaustive upstream; treat anything new
            // as an io-level failure of the whole connection.
            other => ConnectionError::Io(Arc::new(IoError::other(other.to_string()))),
        }
    }
}

/// An error returned to a handler that misuses its request context.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// `write`, `end`, or `fail` was called after a terminator.
    #[error("Request was already completed")]
    RequestCompleted,
    /// The connection went away, so the response cannot be delivered.
    #[error("Connection closed before the response was delivered")]
    ConnectionGone,
}
