use std::collections::VecDeque;
use std::io::{ErrorKind, Write};

use bytes::Bytes;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::handle::IoHandle;

/// Default cap on bytes queued but not yet written.
pub const DEFAULT_MAXMEM: usize = 10 * 1024 * 1024;

/// Write side of one OS handle.
///
/// Buffers are reference counted ([`Bytes`]); the same buffer may be queued
/// on many streams and is freed once the last of them has written it.
pub struct WStream {
    handle: Option<IoHandle>,
    token: Token,
    queue: VecDeque<(Bytes, usize)>,
    curmem: usize,
    maxmem: usize,
    failed: bool,
    closed: bool,
}

impl WStream {
    /// Wrap `handle`; `maxmem` bounds queued bytes.
    pub fn new(handle: IoHandle, token: Token, maxmem: usize) -> Self {
        Self {
            handle: Some(handle),
            token,
            queue: VecDeque::new(),
            curmem: 0,
            maxmem,
            failed: false,
            closed: false,
        }
    }

    /// Register for write readiness.
    pub fn start(&mut self, registry: &Registry) -> std::io::Result<()> {
        match self.handle.as_mut() {
            Some(handle) => handle.register(registry, self.token, Interest::WRITABLE),
            None => Ok(()),
        }
    }

    /// Token this stream is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Queue `data` and try to write it right away.
    ///
    /// Fails when the stream is closed or broken, or when the bytes already
    /// queued exceed the memory cap. Queued data is never touched by a
    /// rejected write.
    pub fn write(&mut self, data: Bytes) -> bool {
        if self.closed || self.failed || self.handle.is_none() {
            return false;
        }
        if self.maxmem > 0 && self.curmem > self.maxmem {
            debug!(
                token = self.token.0,
                queued = self.curmem,
                max = self.maxmem,
                "write rejected, queue over memory cap"
            );
            return false;
        }
        if data.is_empty() {
            return true;
        }
        self.curmem += data.len();
        self.queue.push_back((data, 0));
        self.flush()
    }

    /// Write as much queued data as the handle accepts.
    ///
    /// Returns false once the stream is broken; queued data is dropped then.
    pub fn flush(&mut self) -> bool {
        if self.failed {
            return false;
        }
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        while let Some((data, offset)) = self.queue.front_mut() {
            match handle.write(&data[*offset..]) {
                Ok(0) => {
                    self.fail("write returned zero bytes");
                    return false;
                }
                Ok(n) => {
                    *offset += n;
                    self.curmem -= n;
                    if *offset == data.len() {
                        self.queue.pop_front();
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.fail(&err.to_string());
                    return false;
                }
            }
        }
        true
    }

    fn fail(&mut self, reason: &str) {
        warn!(token = self.token.0, %reason, "write stream failed");
        self.failed = true;
        self.queue.clear();
        self.curmem = 0;
    }

    /// Bytes queued and not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.curmem
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flush what can be written without blocking, then release the handle.
    /// Anything still queued is dropped.
    pub fn close(&mut self, registry: &Registry) {
        if self.closed {
            return;
        }
        self.flush();
        self.closed = true;
        if !self.queue.is_empty() {
            debug!(
                token = self.token.0,
                dropped = self.curmem,
                "closing write stream with unwritten data"
            );
        }
        self.queue.clear();
        self.curmem = 0;
        if let Some(mut handle) = self.handle.take() {
            let _ = handle.deregister(registry);
        }
    }
}

impl std::fmt::Debug for WStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WStream")
            .field("token", &self.token)
            .field("queued", &self.curmem)
            .field("maxmem", &self.maxmem)
            .field("failed", &self.failed)
            .field("closed", &self.closed)
            .finish()
    }
}
