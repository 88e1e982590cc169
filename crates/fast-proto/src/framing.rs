//! Wrap [`MessageCodec`](crate::codec::MessageCodec) for use with the
//! `asynchronous_codec` crate.
//!
//! This type lets us wrap a byte-stream connection (any AsyncRead +
//! AsyncWrite type) as a Sink and a Stream of [`Message`], so the
//! layers above can forget about byte-oriented communication.  Reading
//! stops (and so exerts back-pressure on the peer) whenever the
//! consumer stops pulling from the Stream; writes exert back-pressure
//! through the Sink's readiness.

use std::io::Error as IoError;

use asynchronous_codec as futures_codec;
use bytes::BytesMut;

use crate::codec::MessageCodec;
use crate::msg::Message;

/// An error from a [`FastCodec`].
///
/// This is a separate type from [`crate::Error`] so that io errors on
/// the underlying stream are distinguishable from protocol errors in
/// the bytes themselves.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    /// An error from the underlying IO stream underneath a codec.
    #[error("Io error reading or writing a frame")]
    Io(#[from] IoError),
    /// An error from the frame decoding logic.
    #[error("Error decoding an incoming message")]
    Dec(#[source] crate::Error),
    /// An error from the frame encoding logic.
    #[error("Error encoding an outgoing message")]
    Enc(#[source] crate::Error),
}

impl CodecError {
    /// Return the protocol-level cause of this error, if there is one.
    pub fn protocol_cause(&self) -> Option<&crate::Error> {
        match self {
            CodecError::Io(_) => None,
            CodecError::Dec(e) | CodecError::Enc(e) => Some(e),
        }
    }
}

/// Codec adapter for Fast protocol frames.
#[derive(Clone, Debug, Default)]
pub struct FastCodec(MessageCodec);

impl FastCodec {
    /// Create a new FastCodec.
    pub fn new() -> Self {
        FastCodec(MessageCodec::new())
    }
}

impl futures_codec::Encoder for FastCodec {
    type Item<'a> = Message;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.0.write_message(&item, dst).map_err(CodecError::Enc)
    }
}

impl futures_codec::Decoder for FastCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.0.decode_message(src).map_err(CodecError::Dec)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            // Leftover bytes at end-of-stream cannot ever become a
            // whole frame.
            None => Err(CodecError::Dec(crate::Error::TruncatedFrame)),
        }
    }
}

/// A stream of [`Message`] decoded from an `AsyncRead`.
pub type FrameReader<T> = futures_codec::FramedRead<T, FastCodec>;

/// A sink of [`Message`] framed onto an `AsyncWrite`.
pub type FrameWriter<T> = futures_codec::FramedWrite<T, FastCodec>;
