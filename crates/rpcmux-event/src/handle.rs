use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use mio::unix::pipe;
use mio::{Interest, Registry, Token};

/// A non-blocking OS endpoint owned by the event loop.
///
/// Sockets are bidirectional; pipe handles are one-directional and fail the
/// unsupported direction with `ErrorKind::Unsupported`.
pub struct IoHandle {
    inner: IoHandleInner,
}

enum IoHandleInner {
    Tcp(TcpStream),
    Unix(UnixStream),
    PipeRead(pipe::Receiver),
    PipeWrite(pipe::Sender),
}

impl IoHandle {
    /// Wrap a connected TCP stream, switching it to non-blocking mode.
    pub fn from_tcp(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: IoHandleInner::Tcp(TcpStream::from_std(stream)),
        })
    }

    /// Wrap a connected Unix socket stream, switching it to non-blocking mode.
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: IoHandleInner::Unix(UnixStream::from_std(stream)),
        })
    }

    pub(crate) fn from_mio_tcp(stream: TcpStream) -> Self {
        Self {
            inner: IoHandleInner::Tcp(stream),
        }
    }

    pub(crate) fn from_mio_unix(stream: UnixStream) -> Self {
        Self {
            inner: IoHandleInner::Unix(stream),
        }
    }

    /// Read side of a pipe, pty master or inherited descriptor.
    pub fn pipe_reader(fd: OwnedFd) -> io::Result<Self> {
        // SAFETY: `fd` is an owned, open descriptor; ownership moves into the receiver.
        let receiver = unsafe { pipe::Receiver::from_raw_fd(fd.into_raw_fd()) };
        receiver.set_nonblocking(true)?;
        Ok(Self {
            inner: IoHandleInner::PipeRead(receiver),
        })
    }

    /// Write side of a pipe, pty master or inherited descriptor.
    pub fn pipe_writer(fd: OwnedFd) -> io::Result<Self> {
        // SAFETY: `fd` is an owned, open descriptor; ownership moves into the sender.
        let sender = unsafe { pipe::Sender::from_raw_fd(fd.into_raw_fd()) };
        sender.set_nonblocking(true)?;
        Ok(Self {
            inner: IoHandleInner::PipeWrite(sender),
        })
    }

    /// Duplicate the underlying descriptor (close-on-exec).
    ///
    /// Used to split a socket into independently registered read and write halves.
    pub fn try_clone(&self) -> io::Result<Self> {
        // SAFETY: the raw fd stays open for the duration of this borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) }.try_clone_to_owned()?;
        match &self.inner {
            IoHandleInner::Tcp(_) => Self::from_tcp(std::net::TcpStream::from(fd)),
            IoHandleInner::Unix(_) => Self::from_unix(std::os::unix::net::UnixStream::from(fd)),
            IoHandleInner::PipeRead(_) => Self::pipe_reader(fd),
            IoHandleInner::PipeWrite(_) => Self::pipe_writer(fd),
        }
    }

    /// Short transport name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match &self.inner {
            IoHandleInner::Tcp(_) => "tcp",
            IoHandleInner::Unix(_) => "unix",
            IoHandleInner::PipeRead(_) | IoHandleInner::PipeWrite(_) => "pipe",
        }
    }
}

fn unsupported(direction: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("handle is not {direction}"),
    )
}

impl Read for IoHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            IoHandleInner::Tcp(stream) => stream.read(buf),
            IoHandleInner::Unix(stream) => stream.read(buf),
            IoHandleInner::PipeRead(receiver) => receiver.read(buf),
            IoHandleInner::PipeWrite(_) => Err(unsupported("readable")),
        }
    }
}

impl Write for IoHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            IoHandleInner::Tcp(stream) => stream.write(buf),
            IoHandleInner::Unix(stream) => stream.write(buf),
            IoHandleInner::PipeWrite(sender) => sender.write(buf),
            IoHandleInner::PipeRead(_) => Err(unsupported("writable")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            IoHandleInner::Tcp(stream) => stream.flush(),
            IoHandleInner::Unix(stream) => stream.flush(),
            IoHandleInner::PipeWrite(sender) => sender.flush(),
            IoHandleInner::PipeRead(_) => Ok(()),
        }
    }
}

impl AsRawFd for IoHandle {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            IoHandleInner::Tcp(stream) => stream.as_raw_fd(),
            IoHandleInner::Unix(stream) => stream.as_raw_fd(),
            IoHandleInner::PipeRead(receiver) => receiver.as_raw_fd(),
            IoHandleInner::PipeWrite(sender) => sender.as_raw_fd(),
        }
    }
}

impl Source for IoHandle {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match &mut self.inner {
            IoHandleInner::Tcp(stream) => stream.register(registry, token, interests),
            IoHandleInner::Unix(stream) => stream.register(registry, token, interests),
            IoHandleInner::PipeRead(receiver) => receiver.register(registry, token, interests),
            IoHandleInner::PipeWrite(sender) => sender.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match &mut self.inner {
            IoHandleInner::Tcp(stream) => stream.reregister(registry, token, interests),
            IoHandleInner::Unix(stream) => stream.reregister(registry, token, interests),
            IoHandleInner::PipeRead(receiver) => receiver.reregister(registry, token, interests),
            IoHandleInner::PipeWrite(sender) => sender.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match &mut self.inner {
            IoHandleInner::Tcp(stream) => stream.deregister(registry),
            IoHandleInner::Unix(stream) => stream.deregister(registry),
            IoHandleInner::PipeRead(receiver) => receiver.deregister(registry),
            IoHandleInner::PipeWrite(sender) => sender.deregister(registry),
        }
    }
}

impl std::fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle")
            .field("type", &self.kind())
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_pair_reads_and_writes() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut left = IoHandle::from_unix(left).unwrap();
        let mut right = IoHandle::from_unix(right).unwrap();

        left.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(left.kind(), "unix");
    }

    fn os_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: both descriptors were just created and are owned here.
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn pipe_handles_are_one_directional() {
        let (reader, writer) = os_pipe();
        let mut reader = IoHandle::pipe_reader(reader).unwrap();
        let mut writer = IoHandle::pipe_writer(writer).unwrap();

        writer.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");

        let err = reader.write(b"no").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        let err = writer.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn clone_shares_the_connection() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let left = IoHandle::from_unix(left).unwrap();
        let mut left_writer = left.try_clone().unwrap();
        let mut right = IoHandle::from_unix(right).unwrap();

        assert_ne!(left.as_raw_fd(), left_writer.as_raw_fd());
        left_writer.write_all(b"dup").unwrap();
        let mut buf = [0u8; 3];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"dup");
    }
}
