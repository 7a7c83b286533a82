use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::handle::IoHandle;

/// Buffered bytes at which reading pauses until the consumer catches up.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Result of one [`RStream::read_available`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Bytes appended to the buffer by this call.
    pub bytes: usize,
    /// The peer closed its end (or the handle failed).
    pub eof: bool,
}

/// Read side of one OS handle.
///
/// Readiness is edge-triggered: [`RStream::read_available`] reads until the
/// handle would block, the buffer is full (reading pauses) or EOF. After
/// [`RStream::take_buffered`] reports a resume, the caller must read again.
///
/// Closing is deferred while delivered reads are still being processed, so
/// the handle outlives every read event that refers to it.
pub struct RStream {
    handle: Option<IoHandle>,
    token: Token,
    buffer: BytesMut,
    capacity: usize,
    paused: bool,
    eof: bool,
    eof_taken: bool,
    closed: bool,
    num_bytes: u64,
    pending_reqs: usize,
}

impl RStream {
    /// Wrap `handle`; `capacity` is the full threshold.
    pub fn new(handle: IoHandle, token: Token, capacity: usize) -> Self {
        Self {
            handle: Some(handle),
            token,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            capacity: capacity.max(1),
            paused: false,
            eof: false,
            eof_taken: false,
            closed: false,
            num_bytes: 0,
            pending_reqs: 0,
        }
    }

    /// Register for read readiness.
    pub fn start(&mut self, registry: &Registry) -> std::io::Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.register(registry, self.token, Interest::READABLE),
            None => Ok(()),
        }
    }

    /// Token this stream is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Read whatever the handle has, up to the full threshold.
    ///
    /// Read errors other than `WouldBlock` are reported as EOF.
    pub fn read_available(&mut self) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        if self.closed || self.eof || self.paused {
            return outcome;
        }
        let Some(handle) = self.handle.as_mut() else {
            return outcome;
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let room = self.capacity.saturating_sub(self.buffer.len());
            if room == 0 {
                debug!(token = self.token.0, "read buffer full, pausing");
                self.paused = true;
                break;
            }
            let want = room.min(READ_CHUNK);
            match handle.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.eof = true;
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    self.num_bytes += n as u64;
                    outcome.bytes += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(token = self.token.0, error = %err, "read failed, treating as eof");
                    self.eof = true;
                    outcome.eof = true;
                    break;
                }
            }
        }
        outcome
    }

    /// Take everything buffered. The flag is true when this resumed a paused
    /// stream, in which case the caller should read again.
    pub fn take_buffered(&mut self) -> (Bytes, bool) {
        let data = self.buffer.split().freeze();
        let resumed = std::mem::replace(&mut self.paused, false);
        (data, resumed)
    }

    /// Number of bytes buffered and not yet taken.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes read over the stream's lifetime.
    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// True exactly once after EOF was seen, so EOF is delivered once.
    pub fn take_eof(&mut self) -> bool {
        if self.eof && !self.eof_taken {
            self.eof_taken = true;
            return true;
        }
        false
    }

    /// Treat the stream as finished even though the peer has not closed it.
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// Whether a delivered read is still being processed.
    pub fn has_pending(&self) -> bool {
        self.pending_reqs > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the OS handle has been released.
    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    /// Note a read event queued for the consumer.
    pub fn begin_request(&mut self) {
        self.pending_reqs += 1;
    }

    /// Note a read event delivered. Returns true if this released a close
    /// that was waiting on it.
    pub fn finish_request(&mut self, registry: &Registry) -> bool {
        self.pending_reqs = self.pending_reqs.saturating_sub(1);
        if self.pending_reqs == 0 && self.closed && self.handle.is_some() {
            self.release(registry);
            return true;
        }
        false
    }

    /// Mark the stream closed. Returns true if the handle was released now,
    /// false if the release waits for pending read events (or already happened).
    pub fn close(&mut self, registry: &Registry) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        if self.pending_reqs == 0 {
            return self.release(registry);
        }
        false
    }

    fn release(&mut self, registry: &Registry) -> bool {
        match self.handle.take() {
            Some(mut handle) => {
                let _ = handle.deregister(registry);
                debug!(token = self.token.0, "read stream released");
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for RStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RStream")
            .field("token", &self.token)
            .field("buffered", &self.buffer.len())
            .field("paused", &self.paused)
            .field("eof", &self.eof)
            .field("closed", &self.closed)
            .field("pending_reqs", &self.pending_reqs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use mio::Poll;

    use super::*;

    fn pair(capacity: usize) -> (RStream, UnixStream, Poll) {
        let poll = Poll::new().unwrap();
        let (left, right) = UnixStream::pair().unwrap();
        let mut stream = RStream::new(IoHandle::from_unix(left).unwrap(), Token(1), capacity);
        stream.start(poll.registry()).unwrap();
        (stream, right, poll)
    }

    #[test]
    fn reads_until_would_block() {
        let (mut stream, mut peer, _poll) = pair(DEFAULT_READ_BUFFER_SIZE);
        peer.write_all(b"hello").unwrap();

        let outcome = stream.read_available();
        assert_eq!(outcome, ReadOutcome { bytes: 5, eof: false });
        let (data, resumed) = stream.take_buffered();
        assert_eq!(&data[..], b"hello");
        assert!(!resumed);

        // Spurious wakeup: nothing to read, not EOF.
        assert_eq!(stream.read_available(), ReadOutcome::default());
    }

    #[test]
    fn eof_is_reported_once() {
        let (mut stream, peer, _poll) = pair(DEFAULT_READ_BUFFER_SIZE);
        drop(peer);
        assert!(stream.read_available().eof);
        assert!(stream.is_eof());
        assert!(!stream.read_available().eof);
        assert!(stream.take_eof());
        assert!(!stream.take_eof());
    }

    #[test]
    fn full_buffer_pauses_until_taken() {
        let (mut stream, mut peer, _poll) = pair(16);
        peer.write_all(&[7u8; 40]).unwrap();

        let first = stream.read_available();
        assert_eq!(first.bytes, 16);
        assert!(stream.is_paused());
        assert_eq!(stream.read_available().bytes, 0);

        let (data, resumed) = stream.take_buffered();
        assert_eq!(data.len(), 16);
        assert!(resumed);
        assert_eq!(stream.read_available().bytes, 16);
        stream.take_buffered();
        assert_eq!(stream.read_available().bytes, 8);
        assert_eq!(stream.num_bytes(), 40);
    }

    #[test]
    fn close_waits_for_pending_requests() {
        let (mut stream, _peer, poll) = pair(DEFAULT_READ_BUFFER_SIZE);
        stream.begin_request();
        stream.begin_request();

        assert!(!stream.close(poll.registry()));
        assert!(stream.is_closed());
        assert!(!stream.is_released());

        assert!(!stream.finish_request(poll.registry()));
        assert!(stream.finish_request(poll.registry()));
        assert!(stream.is_released());
        assert!(!stream.close(poll.registry()));
    }

    #[test]
    fn close_without_pending_releases_now() {
        let (mut stream, _peer, poll) = pair(DEFAULT_READ_BUFFER_SIZE);
        assert!(stream.close(poll.registry()));
        assert!(stream.is_released());
        assert_eq!(stream.read_available(), ReadOutcome::default());
    }
}
