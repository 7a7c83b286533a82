//! Blocking one-shot client used by `call`, `notify` and `channels`.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use rpcmux_event::SocketAddress;
use rpcmux_frame::{FrameConfig, Message, MessageReader, MessageWriter, RpcError, Value};
use tracing::debug;

use crate::exit::{event_error, frame_error, io_error, CliError, CliResult, DATA_INVALID};

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn connect(address: &str, timeout: Duration) -> CliResult<Self> {
        let parsed = SocketAddress::parse(address)
            .map_err(|err| event_error("invalid address", err))?
            .normalize();
        let stream = match &parsed {
            SocketAddress::Pipe(path) => UnixStream::connect(path)
                .map(Self::Unix)
                .map_err(|err| io_error(&format!("connect to {} failed", path.display()), err))?,
            SocketAddress::Tcp { host, port } => {
                let context = format!("connect to {parsed} failed");
                let candidates = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|err| io_error(&context, err))?;
                let mut last = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
                let mut connected = None;
                for candidate in candidates {
                    match TcpStream::connect_timeout(&candidate, timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(err) => last = err,
                    }
                }
                connected.map(Self::Tcp).ok_or_else(|| io_error(&context, last))?
            }
        };
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|err| io_error("set timeout failed", err))?;
        Ok(stream)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.set_read_timeout(timeout),
            Self::Tcp(s) => s.set_read_timeout(timeout),
        }
    }

    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Unix(s) => s.try_clone().map(Self::Unix),
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// A synchronous msgpack-RPC connection.
pub struct Client {
    reader: MessageReader<Stream>,
    writer: MessageWriter<Stream>,
    next_id: u32,
}

impl Client {
    /// Connect to `address` (socket path or `host:port`); reads give up after `timeout`.
    pub fn connect(address: &str, timeout: Duration) -> CliResult<Self> {
        let stream = Stream::connect(address, timeout)?;
        let write_half = stream
            .try_clone()
            .map_err(|err| io_error("clone connection failed", err))?;
        let config = FrameConfig {
            read_timeout: Some(timeout),
            ..FrameConfig::default()
        };
        Ok(Self {
            reader: MessageReader::with_config(stream, config.clone()),
            writer: MessageWriter::with_config(write_half, config),
            next_id: 1,
        })
    }

    /// Call `method` and wait for its response. Requests the server sends
    /// meanwhile are refused; notifications are skipped.
    pub fn call(&mut self, method: &str, args: Vec<Value>) -> CliResult<Result<Value, RpcError>> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.writer
            .request(id, method, args)
            .map_err(|err| frame_error("send failed", err))?;

        loop {
            let message = self
                .reader
                .read_message()
                .map_err(|err| frame_error("receive failed", err))?;
            match message {
                Message::Response {
                    id: response_id,
                    error,
                    result,
                } => {
                    if response_id != id {
                        return Err(CliError::new(
                            DATA_INVALID,
                            format!("response for unknown request id {response_id}"),
                        ));
                    }
                    if error.is_nil() {
                        return Ok(Ok(result));
                    }
                    return Ok(Err(RpcError::from_value(&error)));
                }
                Message::Request {
                    id: request_id,
                    method,
                    ..
                } => {
                    debug!(request_id, method, "refusing server request");
                    self.writer
                        .respond(
                            request_id,
                            Err(RpcError::exception(format!("Invalid method: {method}"))),
                        )
                        .map_err(|err| frame_error("send failed", err))?;
                }
                Message::Notification { method, .. } => {
                    debug!(method, "ignoring notification");
                }
            }
        }
    }

    /// Send a notification.
    pub fn notify(&mut self, event: &str, args: Vec<Value>) -> CliResult<()> {
        self.writer
            .notify(event, args)
            .map_err(|err| frame_error("send failed", err))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::thread;

    use super::*;

    #[test]
    fn call_skips_notifications_and_refuses_requests() {
        let dir = std::env::temp_dir().join(format!(
            "rpcmux-client-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("s.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = MessageReader::new(stream.try_clone().unwrap());
            let mut writer = MessageWriter::new(stream);
            let Message::Request { id, .. } = reader.read_message().unwrap() else {
                panic!("expected a request");
            };
            writer.notify("progress", vec![]).unwrap();
            writer.request(9, "ask", vec![]).unwrap();
            let Message::Response { id: answered, error, .. } = reader.read_message().unwrap()
            else {
                panic!("expected a response");
            };
            assert_eq!(answered, 9);
            assert!(!error.is_nil());
            writer.respond(id, Ok(Value::from("pong"))).unwrap();
        });

        let mut client = Client::connect(path.to_str().unwrap(), Duration::from_secs(5)).unwrap();
        assert_eq!(client.call("ping", vec![]).unwrap(), Ok(Value::from("pong")));
        server.join().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_socket_is_a_transport_error() {
        let err = Client::connect("/nonexistent/rpcmux.sock", Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err.code, crate::exit::TRANSPORT_ERROR);
    }
}
