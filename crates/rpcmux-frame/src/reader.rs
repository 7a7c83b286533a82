use std::io::{ErrorKind, Read};
use std::os::unix::net::UnixStream;

use crate::codec::{FrameConfig, Message};
use crate::decoder::Decoder;
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete messages from any blocking `Read` stream.
///
/// Meant for simple synchronous peers (tests, one-shot clients). The event
/// loop side of a channel uses [`Decoder`] directly.
pub struct MessageReader<T> {
    inner: T,
    decoder: Decoder,
    config: FrameConfig,
}

impl<T: Read> MessageReader<T> {
    /// Create a new message reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new message reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            decoder: Decoder::with_config(config.clone()),
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(message);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.decoder.feed(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl MessageReader<UnixStream> {
    /// Create a reader for a Unix socket and apply the read timeout from config.
    pub fn with_config_unix(inner: UnixStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;
    use rmpv::Value;

    use super::*;
    use crate::codec::encode_message;
    use crate::writer::MessageWriter;

    fn wire(messages: &[Message]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for message in messages {
            encode_message(message, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_single_message() {
        let message = Message::request(1, "ping", vec![]);
        let mut reader = MessageReader::new(Cursor::new(wire(std::slice::from_ref(&message))));
        assert_eq!(reader.read_message().unwrap(), message);
    }

    #[test]
    fn read_multiple_messages() {
        let messages = vec![
            Message::notification("one", vec![]),
            Message::notification("two", vec![Value::from(2)]),
            Message::response(5, Ok(Value::from("three"))),
        ];
        let mut reader = MessageReader::new(Cursor::new(wire(&messages)));
        for expected in messages {
            assert_eq!(reader.read_message().unwrap(), expected);
        }
    }

    #[test]
    fn partial_read_handling() {
        let message = Message::request(4, "slow", vec![Value::from("payload")]);
        let byte_reader = ByteByByteReader {
            bytes: wire(std::slice::from_ref(&message)),
            pos: 0,
        };
        let mut reader = MessageReader::new(byte_reader);
        assert_eq!(reader.read_message().unwrap(), message);
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = MessageReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_message() {
        let bytes = wire(&[Message::notification("cut", vec![Value::from("short")])]);
        let mut reader = MessageReader::new(Cursor::new(bytes[..bytes.len() - 2].to_vec()));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn roundtrip_over_socket_pair() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut writer = MessageWriter::new(left);
        let mut reader = MessageReader::with_config_unix(right, FrameConfig::default()).unwrap();

        writer.request(1, "echo", vec![Value::from("hi")]).unwrap();
        writer.notify("event", vec![]).unwrap();

        assert_eq!(
            reader.read_message().unwrap(),
            Message::request(1, "echo", vec![Value::from("hi")])
        );
        assert_eq!(reader.read_message().unwrap().method(), Some("event"));
    }

    #[test]
    fn read_timeout_surfaces_as_io_error() {
        let (_left, right) = UnixStream::pair().unwrap();
        let config = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(20)),
            ..FrameConfig::default()
        };
        let mut reader = MessageReader::with_config_unix(right, config).unwrap();
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }
}
