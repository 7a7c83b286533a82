//! msgpack-RPC message framing.
//!
//! Every message on the wire is one self-delimited msgpack array:
//! - Request `[0, id, method, params]`
//! - Response `[1, id, error, result]`
//! - Notification `[2, method, params]`
//!
//! The [`Decoder`] turns an append-only byte stream into discrete
//! [`Message`]s; callers never deal with partial values.

pub mod codec;
pub mod decoder;
pub mod error;
pub mod kind;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_message, encode_message, encode_notification, encode_request, encode_response,
    ErrorKind, FrameConfig, Message, RpcError, DEFAULT_MAX_BUFFER, DEFAULT_MAX_DEPTH,
};
pub use decoder::Decoder;
pub use error::{FrameError, Result};
pub use kind::{MAX_METHOD_NAME_LEN, NOTIFICATION, NO_RESPONSE, REQUEST, RESPONSE};
pub use reader::MessageReader;
pub use writer::MessageWriter;

pub use rmpv::Value;
