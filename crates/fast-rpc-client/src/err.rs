//! Error types for the Fast client.

use std::io::Error as IoError;
use std::sync::Arc;

use thiserror::Error;

use fast_proto::{CodecError, ErrorBody, MsgId};

/// An error that has made a client connection unusable.
///
/// Once any of these occurs, every request outstanding on the
/// connection fails with [`RpcError::Connection`], and later
/// submissions are rejected immediately.  (This type is `Clone` so
/// that one failure can be reported to every outstanding request.)
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum FatalError {
    /// The peer violated the framing or payload rules.
    #[error("Protocol violation on connection")]
    Proto(#[source] fast_proto::Error),
    /// The transport failed while reading or writing.
    #[error("Io error on connection")]
    Io(#[source] Arc<IoError>),
    /// The peer sent a message whose id matches no request of ours.
    #[error("Peer sent a message for unknown request id {id}")]
    UnsolicitedId {
        /// The id the peer used.
        id: MsgId,
    },
    /// The peer closed the connection while requests were outstanding.
    #[error("Connection closed by peer with requests outstanding")]
    UnexpectedEof,
}

impl From<CodecError> for FatalError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => FatalError::Io(Arc::new(io)),
            CodecError::Dec(p) | CodecError::Enc(p) => FatalError::Proto(p),
            // CodecError is non_exhaustive upstream; treat anything new
            // as a protocol-level failure of the whole connection.
            other => FatalError::Io(Arc::new(IoError::other(other.to_string()))),
        }
    }
}

/// The failure terminating one RPC.
///
/// Exactly one of these is surfaced on a [`ResultStream`] that does
/// not complete successfully.
///
/// [`ResultStream`]: crate::ResultStream
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// The server reported a failure for this request.
    #[error("Rpc failed on server: {0}")]
    Peer(ErrorBody),
    /// The connection suffered a fatal error with this request
    /// outstanding.
    #[error("Connection failed")]
    Connection(#[source] FatalError),
    /// The connection was closed locally with this request
    /// outstanding.
    #[error("Connection was closed locally")]
    ConnectionClosed,
    /// The client was detached from the connection with this request
    /// outstanding.
    #[error("Client was detached from its connection")]
    Detached,
    /// The request did not complete within its configured timeout.
    #[error("Rpc did not complete within its timeout")]
    Timeout,
    /// Every one of the 2^31 - 1 request ids was already in use.
    #[error("All request ids on this connection are in use")]
    IdsExhausted,
}

impl RpcError {
    /// Return the peer-reported error body, if that is what this is.
    pub fn peer_error(&self) -> Option<&ErrorBody> {
        match self {
            RpcError::Peer(body) => Some(body),
            _ => None,
        }
    }
}
