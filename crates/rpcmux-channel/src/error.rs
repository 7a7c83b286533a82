use std::time::Duration;

use crate::channel::ChannelId;

/// Errors that can occur in channel operations.
///
/// The messages of the user-facing variants are part of the protocol: they
/// are returned verbatim to RPC clients.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// No channel with this id was ever allocated.
    #[error("Invalid channel id: {0}")]
    InvalidChannel(ChannelId),

    /// The requested part does not exist on this kind of channel.
    #[error("Invalid stream on channel")]
    InvalidStream,

    /// Stdin/stdout of an rpc channel cannot be closed on their own.
    #[error("Invalid stream on rpc job, use close(id, rpc)")]
    InvalidRpcStream,

    /// Raw data sent to a channel whose input is closed.
    #[error("Can't send data to closed stream")]
    ClosedStream,

    /// Raw data sent to an rpc channel.
    #[error("Can't send raw data to rpc channel")]
    RawToRpc,

    /// The channel is not an rpc channel.
    #[error("Channel {0} is not an rpc channel")]
    NotRpc(ChannelId),

    /// The channel is not a job.
    #[error("Channel {0} is not a job")]
    NotJob(ChannelId),

    /// Stdio was already claimed by a channel.
    #[error("channel was already open")]
    StdioAlreadyOpen,

    /// A server is already listening on the address.
    #[error("Already listening on {0}")]
    AlreadyListening(String),

    /// Mutually exclusive job options.
    #[error("job cannot have both 'pty' and 'rpc' options set")]
    PtyWithRpc,

    /// The write queue is over its memory cap.
    #[error("Write rejected: stream queue is full")]
    WriteRejected,

    /// Teardown did not converge within its budget.
    #[error("teardown did not finish within {0:?}")]
    TeardownTimeout(Duration),

    /// Event loop, socket or process failure.
    #[error(transparent)]
    Event(#[from] rpcmux_event::EventError),

    /// Encoding failure.
    #[error(transparent)]
    Frame(#[from] rpcmux_frame::FrameError),

    /// I/O failure outside a more specific category.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Negative status for callers that report failures as numbers
    /// (see [`rpcmux_event::EventError::status_code`]).
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Event(err) => err.status_code(),
            Self::Io(err) => match err.raw_os_error() {
                Some(errno) if errno > 0 => -errno,
                _ => -1,
            },
            _ => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_messages_are_stable() {
        assert_eq!(ChannelError::InvalidStream.to_string(), "Invalid stream on channel");
        assert_eq!(
            ChannelError::RawToRpc.to_string(),
            "Can't send raw data to rpc channel"
        );
        assert_eq!(
            ChannelError::AlreadyListening("/tmp/x".into()).to_string(),
            "Already listening on /tmp/x"
        );
    }

    #[test]
    fn spawn_errors_keep_errno() {
        let err = ChannelError::from(rpcmux_event::EventError::Spawn {
            program: "x".into(),
            source: std::io::Error::from_raw_os_error(libc::EACCES),
        });
        assert_eq!(err.status_code(), -libc::EACCES);
        assert_eq!(ChannelError::InvalidChannel(9).status_code(), -1);
    }
}
