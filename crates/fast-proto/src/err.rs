//! Define an error type for the fast-proto crate.
use std::sync::Arc;

use thiserror::Error;

/// An error produced while encoding or decoding Fast protocol frames.
///
/// Every variant here is fatal to the connection the offending bytes
/// arrived on: the framing can no longer be trusted once any of these
/// has occurred.  (This type is `Clone` so that one decode failure can
/// be reported to every request outstanding on the connection.)
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The frame header declared a protocol version we do not speak.
    #[error("Unsupported protocol version {found}")]
    VersionMismatch {
        /// The version byte found in the header.
        found: u8,
    },
    /// The frame header carried a type byte with no assigned meaning.
    #[error("Unrecognized message type {found}")]
    BadMsgType {
        /// The type byte found in the header.
        found: u8,
    },
    /// The status byte did not agree with the type byte.
    #[error("Message status {status} does not match type {msg_type}")]
    StatusMismatch {
        /// The type byte found in the header.
        msg_type: u8,
        /// The status byte found in the header.
        status: u8,
    },
    /// The frame header carried a message id of zero.
    #[error("Message id was zero")]
    ZeroMsgId,
    /// The payload was (or would be) too large to frame.
    #[error("Frame payload of {len} bytes exceeds the 16 MiB frame limit")]
    Oversized {
        /// The declared (inbound) or actual (outbound) payload length.
        len: u64,
    },
    /// The payload did not checksum to the value in the frame header.
    #[error("Payload checksum mismatch (header {declared:#010x}, computed {computed:#06x})")]
    CrcMismatch {
        /// The 32-bit checksum field from the header.
        declared: u32,
        /// The CRC-16/XMODEM we computed over the payload octets.
        computed: u16,
    },
    /// The payload was not well-formed JSON.
    #[error("Payload was not well-formed json")]
    JsonParse(#[source] Arc<serde_json::Error>),
    /// The payload was JSON, but its structure did not match the
    /// message type.
    #[error("Payload structure invalid for message type: {0}")]
    BadPayload(&'static str),
    /// A message we were asked to encode could not be serialized.
    #[error("Unable to serialize outgoing payload")]
    JsonEncode(#[source] Arc<serde_json::Error>),
    /// The byte stream ended partway through a frame.
    #[error("Byte stream ended in the middle of a frame")]
    TruncatedFrame,
}
