use std::path::PathBuf;

/// Errors that can occur in event loop, socket and process operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on a loop-owned handle.
    #[error("event loop I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Spawning a child process failed.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl EventError {
    /// Negative status code for this failure (`-errno`, or `-1` when unknown).
    ///
    /// Always negative, so it can never be mistaken for a channel id.
    pub fn status_code(&self) -> i32 {
        let source = match self {
            Self::Bind { source, .. }
            | Self::Connect { source, .. }
            | Self::Spawn { source, .. }
            | Self::Accept(source)
            | Self::Io(source) => Some(source),
            Self::PathTooLong { .. } => return -libc::ENAMETOOLONG,
            Self::InvalidAddress(_) => return -libc::EINVAL,
        };
        match source.and_then(std::io::Error::raw_os_error) {
            Some(errno) if errno > 0 => -errno,
            _ => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_negative() {
        let missing = EventError::Spawn {
            program: "nope".to_string(),
            source: std::io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert_eq!(missing.status_code(), -libc::ENOENT);

        let unknown = EventError::Io(std::io::Error::other("boom"));
        assert_eq!(unknown.status_code(), -1);

        let bad = EventError::InvalidAddress("x".to_string());
        assert!(bad.status_code() < 0);
    }
}
