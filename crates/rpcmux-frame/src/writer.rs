use std::io::{ErrorKind, Write};
use std::os::unix::net::UnixStream;

use bytes::BytesMut;
use rmpv::Value;

use crate::codec::{encode_message, FrameConfig, Message, RpcError};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete messages to any blocking `Write` stream.
pub struct MessageWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> MessageWriter<T> {
    /// Create a new message writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new message writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete message (blocking).
    pub fn write_message(&mut self, message: &Message) -> Result<()> {
        self.buf.clear();
        encode_message(message, &mut self.buf)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Send a request.
    pub fn request(&mut self, id: u32, method: &str, params: Vec<Value>) -> Result<()> {
        self.write_message(&Message::request(id, method, params))
    }

    /// Send a notification.
    pub fn notify(&mut self, method: &str, params: Vec<Value>) -> Result<()> {
        self.write_message(&Message::notification(method, params))
    }

    /// Answer request `id`.
    pub fn respond(&mut self, id: u32, outcome: std::result::Result<Value, RpcError>) -> Result<()> {
        self.write_message(&Message::response(id, outcome))
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
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

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl MessageWriter<UnixStream> {
    /// Create a writer for a Unix socket and apply the write timeout from config.
    pub fn with_config_unix(inner: UnixStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;

    #[test]
    fn writes_decodable_bytes() {
        let mut writer = MessageWriter::new(Vec::new());
        writer.respond(2, Err(RpcError::exception("failed"))).unwrap();
        writer.notify("after", vec![]).unwrap();

        let mut decoder = Decoder::new();
        decoder.feed(writer.get_ref());
        let first = decoder.next_message().unwrap().unwrap();
        let second = decoder.next_message().unwrap().unwrap();

        assert_eq!(first.id(), Some(2));
        assert_eq!(second.method(), Some("after"));
    }

    #[test]
    fn zero_write_is_connection_closed() {
        let mut writer = MessageWriter::new(ZeroWriter);
        let err = writer.notify("x", vec![]).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn interrupted_write_retries() {
        let mut writer = MessageWriter::new(InterruptOnce {
            interrupted: false,
            out: Vec::new(),
        });
        writer.notify("retry", vec![]).unwrap();
        assert!(!writer.get_ref().out.is_empty());
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct InterruptOnce {
        interrupted: bool,
        out: Vec<u8>,
    }

    impl Write for InterruptOnce {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.out.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
