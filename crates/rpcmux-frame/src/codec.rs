use std::io::{Cursor, ErrorKind as IoErrorKind};

use bytes::{Buf, BufMut, BytesMut};
use rmpv::Value;

use crate::error::{FrameError, Result};
use crate::kind::{expected_len, MAX_METHOD_NAME_LEN, NOTIFICATION, NO_RESPONSE, REQUEST, RESPONSE};

/// Default nesting limit for decoded values.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Default limit for bytes buffered while waiting for a message to complete: 64 MiB.
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024 * 1024;

/// One complete msgpack-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `[0, id, method, params]`
    Request {
        id: u32,
        method: String,
        params: Vec<Value>,
    },
    /// `[1, id, error, result]`
    Response { id: u32, error: Value, result: Value },
    /// `[2, method, params]`
    Notification { method: String, params: Vec<Value> },
}

impl Message {
    /// Build a request.
    pub fn request(id: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a response carrying either a result or an error.
    pub fn response(id: u32, outcome: std::result::Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(result) => Self::Response {
                id,
                error: Value::Nil,
                result,
            },
            Err(err) => Self::Response {
                id,
                error: err.to_value(),
                result: Value::Nil,
            },
        }
    }

    /// Wire type tag of this message.
    pub fn kind(&self) -> u64 {
        match self {
            Self::Request { .. } => REQUEST,
            Self::Response { .. } => RESPONSE,
            Self::Notification { .. } => NOTIFICATION,
        }
    }

    /// Request or response id; notifications have none.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Notification { .. } => None,
        }
    }

    /// Method name of a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    /// Convert to the msgpack array sent on the wire.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, method, params } => Value::Array(vec![
                Value::from(REQUEST),
                Value::from(*id),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
            Self::Response { id, error, result } => Value::Array(vec![
                Value::from(RESPONSE),
                Value::from(*id),
                error.clone(),
                result.clone(),
            ]),
            Self::Notification { method, params } => Value::Array(vec![
                Value::from(NOTIFICATION),
                Value::from(method.as_str()),
                Value::Array(params.clone()),
            ]),
        }
    }

    /// Validate a decoded msgpack value as an RPC message.
    pub fn from_value(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            _ => return Err(FrameError::invalid("message is not an array")),
        };
        if items.len() != 3 && items.len() != 4 {
            return Err(FrameError::invalid("invalid message length"));
        }

        let kind = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| FrameError::invalid("invalid message type"))?;
        match expected_len(kind) {
            None => return Err(FrameError::invalid("invalid message type")),
            Some(len) if len != items.len() => {
                return Err(FrameError::invalid(
                    "message type does not match array length",
                ))
            }
            Some(_) => {}
        }

        let mut fields = items.into_iter().skip(1);
        match kind {
            REQUEST => {
                let id = decode_id(fields.next())?;
                let method = decode_method(fields.next(), Some(id))?;
                let params = decode_params(fields.next(), Some(id))?;
                Ok(Self::Request { id, method, params })
            }
            RESPONSE => {
                let id = decode_id(fields.next())?;
                let error = fields.next().unwrap_or(Value::Nil);
                let result = fields.next().unwrap_or(Value::Nil);
                Ok(Self::Response { id, error, result })
            }
            _ => {
                let method = decode_method(fields.next(), None)?;
                let params = decode_params(fields.next(), None)?;
                Ok(Self::Notification { method, params })
            }
        }
    }
}

fn decode_id(value: Option<Value>) -> Result<u32> {
    value
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| FrameError::invalid("invalid request id"))
}

fn decode_method(value: Option<Value>, request_id: Option<u32>) -> Result<String> {
    let bytes = match value {
        Some(Value::String(name)) => name.into_bytes(),
        Some(Value::Binary(name)) => name,
        _ => {
            return Err(FrameError::InvalidMessage {
                reason: "method name must be a string or binary".to_string(),
                request_id,
            })
        }
    };
    if bytes.len() > MAX_METHOD_NAME_LEN {
        return Err(FrameError::InvalidMessage {
            reason: format!(
                "method name too long ({} bytes, max {MAX_METHOD_NAME_LEN})",
                bytes.len()
            ),
            request_id,
        });
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_params(value: Option<Value>, request_id: Option<u32>) -> Result<Vec<Value>> {
    match value {
        Some(Value::Array(params)) => Ok(params),
        _ => Err(FrameError::InvalidMessage {
            reason: "msgpack-rpc request args has to be an array".to_string(),
            request_id,
        }),
    }
}

/// Category of an RPC error, sent as the first element of `[kind, message]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic failure inside a handler.
    Exception,
    /// The request itself was invalid (bad method, bad arguments).
    Validation,
}

impl ErrorKind {
    /// Wire code for this kind.
    pub fn code(self) -> u64 {
        match self {
            Self::Exception => 0,
            Self::Validation => 1,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Exception),
            1 => Some(Self::Validation),
            _ => None,
        }
    }
}

/// Structured error carried in a response or returned from a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    /// Generic handler failure.
    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Exception,
            message: message.into(),
        }
    }

    /// Invalid request.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }

    /// Wire form: `[kind, message]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.kind.code()),
            Value::from(self.message.as_str()),
        ])
    }

    /// Interpret the error slot of a response.
    ///
    /// A bare string is an exception; `[kind, message]` keeps its kind; any
    /// other shape becomes an exception with the text "unknown error".
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => {
                Self::exception(String::from_utf8_lossy(message.as_bytes()).into_owned())
            }
            Value::Array(items) if items.len() == 2 => {
                let kind = items[0].as_u64().and_then(ErrorKind::from_code);
                match (kind, items[1].as_str()) {
                    (Some(kind), Some(message)) => Self {
                        kind,
                        message: message.to_string(),
                    },
                    _ => Self::exception("unknown error"),
                }
            }
            _ => Self::exception("unknown error"),
        }
    }
}

/// Encode a message onto the end of `dst`.
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<()> {
    write_value(&message.to_value(), dst)
}

/// Encode a request. An id of [`NO_RESPONSE`] encodes a notification instead.
pub fn encode_request(id: u32, method: &str, params: Vec<Value>, dst: &mut BytesMut) -> Result<()> {
    let value = if id == NO_RESPONSE {
        Value::Array(vec![
            Value::from(NOTIFICATION),
            Value::from(method),
            Value::Array(params),
        ])
    } else {
        Value::Array(vec![
            Value::from(REQUEST),
            Value::from(id),
            Value::from(method),
            Value::Array(params),
        ])
    };
    write_value(&value, dst)
}

/// Encode a notification.
pub fn encode_notification(method: &str, params: Vec<Value>, dst: &mut BytesMut) -> Result<()> {
    encode_request(NO_RESPONSE, method, params, dst)
}

/// Encode a response to request `id`.
pub fn encode_response(
    id: u32,
    outcome: std::result::Result<Value, RpcError>,
    dst: &mut BytesMut,
) -> Result<()> {
    encode_message(&Message::response(id, outcome), dst)
}

fn write_value(value: &Value, dst: &mut BytesMut) -> Result<()> {
    let mut writer = (&mut *dst).writer();
    rmpv::encode::write_value(&mut writer, value).map_err(|err| FrameError::Encode(err.to_string()))
}

/// Decode one message from the front of `src`.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete message yet.
/// On success, consumes the message bytes from the buffer.
pub fn decode_message(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Message>> {
    if src.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&src[..]);
    let value = match rmpv::decode::read_value_with_max_depth(&mut cursor, config.max_depth) {
        Ok(value) => value,
        Err(rmpv::decode::Error::InvalidMarkerRead(err))
        | Err(rmpv::decode::Error::InvalidDataRead(err))
            if err.kind() == IoErrorKind::UnexpectedEof =>
        {
            if src.len() > config.max_buffer {
                return Err(FrameError::BufferOverflow {
                    size: src.len(),
                    max: config.max_buffer,
                });
            }
            return Ok(None); // Need more data
        }
        Err(rmpv::decode::Error::DepthLimitExceeded) => return Err(FrameError::TooDeep),
        Err(other) => return Err(FrameError::Malformed(other.to_string())),
    };

    let consumed = cursor.position() as usize;
    src.advance(consumed);
    Message::from_value(value).map(Some)
}

/// Configuration for message decoding.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum nesting depth of a decoded value. Default: 128.
    pub max_depth: usize,
    /// Maximum bytes buffered for one incomplete message. Default: 64 MiB.
    pub max_buffer: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_buffer: DEFAULT_MAX_BUFFER,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(message: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_message(message, &mut buf).unwrap();
        buf
    }

    fn raw(value: Value) -> BytesMut {
        let mut buf = BytesMut::new();
        write_value(&value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_request_roundtrip() {
        let message = Message::request(7, "add", vec![Value::from(1), Value::from(2)]);
        let mut buf = encoded(&message);

        let decoded = decode_message(&mut buf, &FrameConfig::default())
            .unwrap()
            .unwrap();

        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_response_with_error_roundtrip() {
        let message = Message::response(3, Err(RpcError::validation("bad args")));
        let mut buf = encoded(&message);

        let decoded = decode_message(&mut buf, &FrameConfig::default())
            .unwrap()
            .unwrap();

        match decoded {
            Message::Response { id, error, result } => {
                assert_eq!(id, 3);
                assert!(result.is_nil());
                assert_eq!(RpcError::from_value(&error), RpcError::validation("bad args"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_no_response_id_encodes_notification() {
        let mut buf = BytesMut::new();
        encode_request(NO_RESPONSE, "redraw", vec![Value::from("x")], &mut buf).unwrap();

        let decoded = decode_message(&mut buf, &FrameConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(decoded, Message::notification("redraw", vec![Value::from("x")]));
    }

    #[test]
    fn test_decode_incomplete_message() {
        let message = Message::request(1, "method", vec![Value::from("payload")]);
        let full = encoded(&message);
        let mut buf = BytesMut::from(&full[..full.len() - 1]);

        let result = decode_message(&mut buf, &FrameConfig::default()).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), full.len() - 1, "partial input must stay buffered");
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut buf = BytesMut::new();
        assert!(decode_message(&mut buf, &FrameConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_multiple_messages() {
        let mut buf = encoded(&Message::notification("first", vec![]));
        buf.extend_from_slice(&encoded(&Message::notification("second", vec![])));

        let config = FrameConfig::default();
        let m1 = decode_message(&mut buf, &config).unwrap().unwrap();
        let m2 = decode_message(&mut buf, &config).unwrap().unwrap();

        assert_eq!(m1.method(), Some("first"));
        assert_eq!(m2.method(), Some("second"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_binary_method_name_accepted() {
        let mut buf = raw(Value::Array(vec![
            Value::from(NOTIFICATION),
            Value::Binary(b"bin_method".to_vec()),
            Value::Array(vec![]),
        ]));
        let decoded = decode_message(&mut buf, &FrameConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(decoded.method(), Some("bin_method"));
    }

    #[test]
    fn test_reject_non_array() {
        let mut buf = raw(Value::from(5));
        let result = decode_message(&mut buf, &FrameConfig::default());
        assert!(matches!(result, Err(FrameError::InvalidMessage { .. })));
    }

    #[test]
    fn test_reject_bad_length() {
        let mut buf = raw(Value::Array(vec![Value::from(REQUEST), Value::from(1)]));
        let err = decode_message(&mut buf, &FrameConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "invalid message length");
    }

    #[test]
    fn test_reject_type_length_mismatch() {
        let mut buf = raw(Value::Array(vec![
            Value::from(NOTIFICATION),
            Value::from(1),
            Value::from("m"),
            Value::Array(vec![]),
        ]));
        let err = decode_message(&mut buf, &FrameConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "message type does not match array length");
    }

    #[test]
    fn test_reject_unknown_type() {
        let mut buf = raw(Value::Array(vec![
            Value::from(9),
            Value::from("m"),
            Value::Array(vec![]),
        ]));
        let err = decode_message(&mut buf, &FrameConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "invalid message type");
    }

    #[test]
    fn test_non_array_params_keeps_request_id() {
        let mut buf = raw(Value::Array(vec![
            Value::from(REQUEST),
            Value::from(42),
            Value::from("m"),
            Value::from("not-an-array"),
        ]));
        let err = decode_message(&mut buf, &FrameConfig::default()).unwrap_err();
        assert_eq!(err.request_id(), Some(42));
        assert_eq!(
            err.to_string(),
            "msgpack-rpc request args has to be an array"
        );
    }

    #[test]
    fn test_reject_long_method_name() {
        let name = "m".repeat(MAX_METHOD_NAME_LEN + 1);
        let mut buf = raw(Value::Array(vec![
            Value::from(NOTIFICATION),
            Value::from(name.as_str()),
            Value::Array(vec![]),
        ]));
        let result = decode_message(&mut buf, &FrameConfig::default());
        assert!(matches!(result, Err(FrameError::InvalidMessage { .. })));
    }

    #[test]
    fn test_reject_too_deep() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x91; 200]);
        buf.put_u8(0x90);

        let result = decode_message(&mut buf, &FrameConfig::default());
        assert!(matches!(result, Err(FrameError::TooDeep)));
    }

    #[test]
    fn test_reserved_marker_is_an_error() {
        let mut buf = BytesMut::from(&[0xc1u8][..]);
        assert!(decode_message(&mut buf, &FrameConfig::default()).is_err());
    }

    #[test]
    fn test_incomplete_message_over_limit() {
        let message = Message::request(1, "m", vec![Value::Binary(vec![0u8; 256])]);
        let full = encoded(&message);
        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        let config = FrameConfig {
            max_buffer: 64,
            ..FrameConfig::default()
        };

        let result = decode_message(&mut buf, &config);
        assert!(matches!(result, Err(FrameError::BufferOverflow { .. })));
    }

    #[test]
    fn test_error_value_shapes() {
        let plain = RpcError::from_value(&Value::from("boom"));
        assert_eq!(plain, RpcError::exception("boom"));

        let typed = RpcError::from_value(&RpcError::validation("nope").to_value());
        assert_eq!(typed.kind, ErrorKind::Validation);

        let odd = RpcError::from_value(&Value::from(12));
        assert_eq!(odd.message, "unknown error");
    }
}
