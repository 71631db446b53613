//! Codecs turn RPC messages (calls, replies and error replies) into bytes for a transport and
//!  back. A codec is a pure function of its input: it does no I/O and keeps no state between
//!  calls, so a stream's partial frames are returned to the caller as leftover.

pub mod terse;

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::codec::terse::TerseCodec;

/// A parameter or result value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Dict(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A method call. `id` 0 means that no reply is expected, any other value is echoed in the
    ///  reply.
    Call {
        method: String,
        params: BTreeMap<String, Value>,
        id: u64,
    },
    Reply {
        id: u64,
        result: Value,
    },
    ErrorReply {
        id: u64,
        message: String,
        details: String,
    },
}

impl Message {
    pub fn call<K: Into<String>>(method: &str, params: impl IntoIterator<Item = (K, Value)>, id: u64) -> Message {
        Message::Call {
            method: method.to_string(),
            params: params.into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
            id,
        }
    }

    pub fn reply(id: u64, result: impl Into<Value>) -> Message {
        Message::Reply {
            id,
            result: result.into(),
        }
    }

    pub fn error_reply(id: u64, message: &str, details: &str) -> Message {
        Message::ErrorReply {
            id,
            message: message.to_string(),
            details: details.to_string(),
        }
    }
}

/// Result of decoding a chunk of received bytes: the complete messages, and the undecodable
///  tail to prepend to the next chunk from the same sender
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Decoded {
    pub messages: Vec<Message>,
    pub leftover: Vec<u8>,
}

/// Parameters for signing / verifying messages. No codec in this crate supports them; passing
///  them is rejected rather than silently ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityParams {
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("codec '{0}' does not support security parameters")]
    SecurityUnsupported(&'static str),

    #[error("cannot encode message: {0}")]
    Encode(String),

    #[error("unknown codec '{0}'")]
    UnknownCodec(String),
}

pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn encode(&self, message: &Message, security: Option<&SecurityParams>) -> Result<Vec<u8>, CodecError>;

    /// Decodes all complete frames in `data`. Malformed frames are skipped, so the only errors
    ///  are those concerning the call as a whole.
    fn decode(&self, data: &[u8], security: Option<&SecurityParams>) -> Result<Decoded, CodecError>;
}

pub fn codec_from_name(name: &str) -> Result<Box<dyn Codec>, CodecError> {
    match name {
        terse::NAME => Ok(Box::new(TerseCodec)),
        _ => Err(CodecError::UnknownCodec(name.to_string())),
    }
}
