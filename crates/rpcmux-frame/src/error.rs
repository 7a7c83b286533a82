/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The byte stream is not valid msgpack.
    #[error("failed to decode msgpack: {0}")]
    Malformed(String),

    /// A value nests deeper than the configured limit.
    #[error("object was too deep to unpack")]
    TooDeep,

    /// The value decoded fine but is not a valid msgpack-RPC message.
    ///
    /// `request_id` is set when the message was recognisably a request, so the
    /// receiver can still answer it with an error.
    #[error("{reason}")]
    InvalidMessage {
        reason: String,
        request_id: Option<u32>,
    },

    /// An incomplete message grew past the configured buffer limit.
    #[error("incomplete message too large ({size} bytes buffered, max {max})")]
    BufferOverflow { size: usize, max: usize },

    /// Encoding a value failed.
    #[error("failed to encode msgpack: {0}")]
    Encode(String),

    /// An I/O error occurred while reading or writing messages.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete message was received.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,
}

impl FrameError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
            request_id: None,
        }
    }

    /// Request id carried by a rejected request, if any.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            Self::InvalidMessage { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
