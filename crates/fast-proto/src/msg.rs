//! Messages sent over Fast protocol connections.
//!
//! A connection carries a sequence of framed [`Message`]s in each
//! direction.  A request is a single DATA message from the client; the
//! response is zero or more DATA messages followed by exactly one
//! terminator (END or ERROR), all bearing the request's [`MsgId`].

use std::num::NonZeroU32;
use std::time::{SystemTime, UNIX_EPOCH};

use caret::caret_int;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The largest message id a connection endpoint may allocate.
///
/// Ids are 31 bits; the high bit of the 32-bit wire field is never set
/// by a conforming allocator.
pub const MSG_ID_MAX: u32 = (1 << 31) - 1;

/// Identifier correlating a request with every message of its response.
///
/// Unique among the outstanding requests on one connection; the
/// responder echoes the requester's id on every reply.  Cannot be zero.
/// For an "optional" id, use `Option<MsgId>`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct MsgId(NonZeroU32);

impl From<NonZeroU32> for MsgId {
    fn from(item: NonZeroU32) -> Self {
        Self(item)
    }
}
impl From<MsgId> for u32 {
    fn from(id: MsgId) -> u32 {
        id.0.get()
    }
}
impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}
impl MsgId {
    /// Creates a `MsgId` for non-zero `val`.
    ///
    /// Returns `None` when `val` is zero, which is reserved on the wire
    /// for "no id".
    pub fn new(val: u32) -> Option<Self> {
        NonZeroU32::new(val).map(Self)
    }
}

caret_int! {
    /// Type tag of a wire message, stating its role in a response
    /// stream.
    ///
    /// The same value is carried twice in every frame header, once as
    /// the "type" and once as the "status"; the two must agree.
    pub struct MsgType(u8) {
        /// Carries a batch of data items (or, client to server, the
        /// argument list of a new request).
        DATA = 1,
        /// Successful terminator of a response stream.
        END = 2,
        /// Failure terminator of a response stream.
        ERROR = 3,
    }
}

/// Envelope metadata carried in the `m` member of every payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct MsgMeta {
    /// Name of the RPC method this message belongs to.
    ///
    /// Set by the requester; echoed by the responder on every reply.
    pub name: String,
    /// Sender's wall-clock time in microseconds since the Unix epoch.
    pub uts: u64,
}

impl MsgMeta {
    /// Construct a `MsgMeta` with an explicit timestamp.
    pub fn new<S: Into<String>>(name: S, uts: u64) -> Self {
        MsgMeta {
            name: name.into(),
            uts,
        }
    }

    /// Construct a `MsgMeta` for `name`, stamped with the current time.
    pub fn now<S: Into<String>>(name: S) -> Self {
        let uts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        MsgMeta::new(name, uts)
    }
}

/// Error information carried in the `d` member of an ERROR message.
///
/// `name`, `message`, and `info` are always preserved across the wire;
/// the remaining members are carried when present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ErrorBody {
    /// Programmatic name of the error.
    pub name: String,
    /// Human-readable description of the error.
    pub message: String,
    /// Structured data associated with the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<JsonValue>,
    /// Extra context supplied by the reporting peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<JsonValue>,
    /// Name of an underlying error, if this one wraps another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    /// Stack trace from the reporting peer, if it recorded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorBody {
    /// Construct an `ErrorBody` with just a name and a message.
    pub fn new<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        ErrorBody {
            name: name.into(),
            message: message.into(),
            info: None,
            context: None,
            ename: None,
            stack: None,
        }
    }

    /// Return this error with its `info` member set to `info`.
    pub fn with_info(mut self, info: JsonValue) -> Self {
        self.info = Some(info);
        self
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// The typed `d` member of a message payload.
//
// (This enum is exhaustive on purpose: the set of message types is
// fixed by protocol version 1, and a new type would be a new protocol
// version.)
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum MsgBody {
    /// A batch of data items, delivered in order.  May be empty.
    Data(Vec<JsonValue>),
    /// Successful terminator, possibly delivering final data items.
    End(Vec<JsonValue>),
    /// Failure terminator.
    Error(ErrorBody),
}

/// One decoded wire message.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct Message {
    /// Id of the request this message belongs to.
    pub id: MsgId,
    /// Envelope metadata (`m`).
    pub meta: MsgMeta,
    /// Typed payload body (`d`).
    pub body: MsgBody,
}

impl Message {
    /// Construct a DATA message.
    pub fn data(id: MsgId, meta: MsgMeta, items: Vec<JsonValue>) -> Self {
        Message {
            id,
            meta,
            body: MsgBody::Data(items),
        }
    }

    /// Construct an END message, delivering `items` as final data.
    pub fn end(id: MsgId, meta: MsgMeta, items: Vec<JsonValue>) -> Self {
        Message {
            id,
            meta,
            body: MsgBody::End(items),
        }
    }

    /// Construct an ERROR message.
    pub fn error(id: MsgId, meta: MsgMeta, error: ErrorBody) -> Self {
        Message {
            id,
            meta,
            body: MsgBody::Error(error),
        }
    }

    /// Return the wire type tag for this message.
    pub fn msg_type(&self) -> MsgType {
        match &self.body {
            MsgBody::Data(_) => MsgType::DATA,
            MsgBody::End(_) => MsgType::END,
            MsgBody::Error(_) => MsgType::ERROR,
        }
    }

    /// Return true if no further messages may follow this one for its
    /// request.
    pub fn is_final(&self) -> bool {
        !matches!(self.body, MsgBody::Data(_))
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn msg_id_bounds() {
        assert!(MsgId::new(0).is_none());
        assert_eq!(u32::from(MsgId::new(1).unwrap()), 1);
        assert_eq!(u32::from(MsgId::new(MSG_ID_MAX).unwrap()), MSG_ID_MAX);
    }

    #[test]
    fn type_tags() {
        assert_eq!(u8::from(MsgType::DATA), 1);
        assert_eq!(u8::from(MsgType::END), 2);
        assert_eq!(u8::from(MsgType::ERROR), 3);

        let id = MsgId::new(7).unwrap();
        let meta = MsgMeta::now("frobnicate");
        assert_eq!(
            Message::data(id, meta.clone(), vec![]).msg_type(),
            MsgType::DATA
        );
        assert_eq!(
            Message::end(id, meta.clone(), vec![]).msg_type(),
            MsgType::END
        );
        assert_eq!(
            Message::error(id, meta, ErrorBody::new("E", "broken")).msg_type(),
            MsgType::ERROR
        );
    }

    #[test]
    fn finality() {
        let id = MsgId::new(3).unwrap();
        let meta = MsgMeta::now("x");
        assert!(!Message::data(id, meta.clone(), vec![]).is_final());
        assert!(Message::end(id, meta.clone(), vec![]).is_final());
        assert!(Message::error(id, meta, ErrorBody::new("E", "nope")).is_final());
    }

    #[test]
    fn error_body_serde() {
        let e = ErrorBody::new("VError", "count out of range")
            .with_info(serde_json::json!({"foundValue": 0}));
        let j = serde_json::to_string(&e).unwrap();
        // Optional members that are unset must not appear on the wire.
        assert!(!j.contains("context"));
        assert!(!j.contains("stack"));
        let back: ErrorBody = serde_json::from_str(&j).unwrap();
        assert_eq!(back, e);
    }
}
