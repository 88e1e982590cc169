//! Implementation for encoding and decoding of Fast protocol frames.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use crc::{CRC_16_XMODEM, Crc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::msg::{ErrorBody, Message, MsgBody, MsgId, MsgMeta, MsgType};
use crate::{Error, Result};

/// Number of bytes in a frame header.
pub const HEADER_LEN: usize = 15;

/// Largest number of bytes in one frame, header included.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest payload a frame may carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// The protocol version we speak.
pub const PROTO_VERSION: u8 = 1;

/// Checksum function applied to the payload octets of every frame.
///
/// This is CRC-16/XMODEM: polynomial 0x1021, initial value 0, no
/// reflection, no final XOR.  The similar-looking CCITT-FALSE variant
/// (initial value 0xFFFF) is *not* wire-compatible.
const PAYLOAD_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// This object can be used to encode and decode Fast protocol frames.
///
/// The implemented format is:
/// ```ignore
///     u8  version;   // = 1
///     u8  type;      // 1 = DATA, 2 = END, 3 = ERROR
///     u8  status;    // must equal type
///     u32 msgid;     // nonzero
///     u32 crc;       // CRC-16/XMODEM of data, upper 16 bits zero
///     u32 len;
///     u8  data[len]; // UTF-8 JSON: {"m":{"name":...,"uts":...},"d":...}
/// ```
#[derive(Clone, Debug, Default)]
pub struct MessageCodec {}

impl MessageCodec {
    /// Create a new MessageCodec.
    pub fn new() -> Self {
        MessageCodec {}
    }

    /// Write the given message into the provided BytesMut object.
    pub fn write_message(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        let payload = encode_payload(item)?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Oversized {
                len: payload.len() as u64,
            });
        }
        let crc = PAYLOAD_CRC.checksum(&payload);
        dst.reserve(HEADER_LEN + payload.len());
        let tag: u8 = item.msg_type().into();
        dst.put_u8(PROTO_VERSION);
        dst.put_u8(tag);
        dst.put_u8(tag);
        dst.put_u32(item.id.into());
        dst.put_u32(u32::from(crc));
        dst.put_u32(u32::try_from(payload.len()).expect("length already bounds-checked"));
        dst.put_slice(&payload);
        Ok(())
    }

    /// Try to decode a message from the provided BytesMut object.
    ///
    /// On a definite protocol error, return Err(_).  On a frame that
    /// might just be incomplete, return Ok(None) and leave `src`
    /// untouched.
    ///
    /// The header is validated as soon as it has arrived, before the
    /// payload is waited for; in particular an oversized declared
    /// length is rejected without buffering any payload bytes.
    pub fn decode_message(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let version = src[0];
        if version != PROTO_VERSION {
            return Err(Error::VersionMismatch { found: version });
        }
        let tag = src[1];
        let msg_type: MsgType = tag.into();
        if ![MsgType::DATA, MsgType::END, MsgType::ERROR].contains(&msg_type) {
            return Err(Error::BadMsgType { found: tag });
        }
        let status = src[2];
        if status != tag {
            return Err(Error::StatusMismatch {
                msg_type: tag,
                status,
            });
        }
        let id = u32::from_be_bytes(
            src[3..7]
                .try_into()
                .expect("four-byte slice was not four bytes!?"),
        );
        let id = MsgId::new(id).ok_or(Error::ZeroMsgId)?;
        let crc_field = u32::from_be_bytes(
            src[7..11]
                .try_into()
                .expect("four-byte slice was not four bytes!?"),
        );
        let declared_len = u32::from_be_bytes(
            src[11..15]
                .try_into()
                .expect("four-byte slice was not four bytes!?"),
        ) as usize;
        if declared_len > MAX_PAYLOAD_LEN {
            return Err(Error::Oversized {
                len: declared_len as u64,
            });
        }
        if src.len() < HEADER_LEN + declared_len {
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(declared_len);
        let computed = PAYLOAD_CRC.checksum(&payload);
        if crc_field != u32::from(computed) {
            return Err(Error::CrcMismatch {
                declared: crc_field,
                computed,
            });
        }
        parse_payload(msg_type, id, &payload).map(Some)
    }
}

/// Payload shape serialized as the JSON text of an outgoing frame.
#[derive(Serialize)]
struct PayloadRef<'a, D: Serialize> {
    /// Envelope metadata.
    m: &'a MsgMeta,
    /// Data items or error body.
    d: &'a D,
}

/// Serialize the payload of `msg` to JSON octets.
fn encode_payload(msg: &Message) -> Result<Vec<u8>> {
    let encoded = match &msg.body {
        MsgBody::Data(items) | MsgBody::End(items) => serde_json::to_vec(&PayloadRef {
            m: &msg.meta,
            d: items,
        }),
        MsgBody::Error(error) => serde_json::to_vec(&PayloadRef {
            m: &msg.meta,
            d: error,
        }),
    };
    encoded.map_err(|e| Error::JsonEncode(Arc::new(e)))
}

/// Parse and validate the JSON payload of an inbound frame.
fn parse_payload(msg_type: MsgType, id: MsgId, payload: &[u8]) -> Result<Message> {
    let top: JsonValue =
        serde_json::from_slice(payload).map_err(|e| Error::JsonParse(Arc::new(e)))?;
    let JsonValue::Object(mut obj) = top else {
        return Err(Error::BadPayload("payload is not an object"));
    };
    let meta = obj.remove("m").ok_or(Error::BadPayload("missing `m` member"))?;
    let meta: MsgMeta =
        serde_json::from_value(meta).map_err(|_| Error::BadPayload("malformed `m` member"))?;
    let d = obj.remove("d").ok_or(Error::BadPayload("missing `d` member"))?;
    let body = if msg_type == MsgType::ERROR {
        if !d.is_object() {
            return Err(Error::BadPayload("`d` is not an object"));
        }
        let error: ErrorBody =
            serde_json::from_value(d).map_err(|_| Error::BadPayload("malformed error body"))?;
        MsgBody::Error(error)
    } else {
        let JsonValue::Array(items) = d else {
            return Err(Error::BadPayload("`d` is not an array"));
        };
        if msg_type == MsgType::DATA {
            MsgBody::Data(items)
        } else {
            MsgBody::End(items)
        }
    };
    Ok(Message { id, meta, body })
}
