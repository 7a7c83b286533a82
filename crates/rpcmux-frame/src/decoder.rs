use bytes::BytesMut;

use crate::codec::{decode_message, FrameConfig, Message};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Finds where the first msgpack value in a buffer ends without building it.
///
/// The scan resumes where the previous call stopped, so a large message fed
/// in many chunks is walked once instead of re-parsed on every feed.
#[derive(Debug, Default)]
struct Scanner {
    /// Bytes of the current value already walked.
    offset: usize,
    /// Items still expected by each open array or map, innermost last.
    open: Vec<u64>,
    started: bool,
}

/// Outcome of inspecting one msgpack header.
struct Header {
    /// Header plus inline payload bytes.
    len: usize,
    /// Nested items that follow (array elements, map keys and values).
    items: u64,
}

impl Scanner {
    /// Length of the complete first value in `buf`, or `None` if more bytes
    /// are needed.
    fn scan(&mut self, buf: &[u8], max_depth: usize) -> Result<Option<usize>> {
        loop {
            if self.started && self.open.is_empty() {
                return Ok(Some(self.offset));
            }
            let Some(header) = header_at(&buf[self.offset..])? else {
                return Ok(None);
            };
            if buf.len() - self.offset < header.len {
                return Ok(None);
            }
            self.started = true;
            self.offset += header.len;
            if let Some(parent) = self.open.last_mut() {
                *parent -= 1;
            }
            if header.items > 0 {
                if self.open.len() >= max_depth {
                    return Err(FrameError::TooDeep);
                }
                self.open.push(header.items);
            }
            while self.open.last() == Some(&0) {
                self.open.pop();
            }
        }
    }
}

fn be(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
}

/// Parse the header at the front of `buf`. `None` means it is cut short.
fn header_at(buf: &[u8]) -> Result<Option<Header>> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };
    // Fixed-size prefix after the marker, and what it describes.
    let (size_bytes, kind) = match marker {
        0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => {
            return Ok(Some(Header { len: 1, items: 0 }))
        }
        0x80..=0x8f => {
            let items = 2 * u64::from(marker & 0x0f);
            return Ok(Some(Header { len: 1, items }));
        }
        0x90..=0x9f => {
            let items = u64::from(marker & 0x0f);
            return Ok(Some(Header { len: 1, items }));
        }
        0xa0..=0xbf => {
            let len = 1 + usize::from(marker & 0x1f);
            return Ok(Some(Header { len, items: 0 }));
        }
        0xc1 => return Err(FrameError::Malformed("reserved marker 0xc1".into())),
        0xc4 | 0xd9 => (1, Kind::Blob),
        0xc5 | 0xda => (2, Kind::Blob),
        0xc6 | 0xdb => (4, Kind::Blob),
        0xc7 => (1, Kind::Ext),
        0xc8 => (2, Kind::Ext),
        0xc9 => (4, Kind::Ext),
        0xca | 0xce | 0xd2 => return Ok(Some(Header { len: 5, items: 0 })),
        0xcb | 0xcf | 0xd3 => return Ok(Some(Header { len: 9, items: 0 })),
        0xcc | 0xd0 => return Ok(Some(Header { len: 2, items: 0 })),
        0xcd | 0xd1 => return Ok(Some(Header { len: 3, items: 0 })),
        0xd4 => return Ok(Some(Header { len: 3, items: 0 })),
        0xd5 => return Ok(Some(Header { len: 4, items: 0 })),
        0xd6 => return Ok(Some(Header { len: 6, items: 0 })),
        0xd7 => return Ok(Some(Header { len: 10, items: 0 })),
        0xd8 => return Ok(Some(Header { len: 18, items: 0 })),
        0xdc => (2, Kind::Array),
        0xdd => (4, Kind::Array),
        0xde => (2, Kind::Map),
        0xdf => (4, Kind::Map),
    };
    let Some(size) = buf.get(1..1 + size_bytes) else {
        return Ok(None);
    };
    let n = be(size);
    let prefix = 1 + size_bytes;
    Ok(Some(match kind {
        Kind::Blob => Header {
            len: prefix + n,
            items: 0,
        },
        Kind::Ext => Header {
            len: prefix + 1 + n,
            items: 0,
        },
        Kind::Array => Header {
            len: prefix,
            items: n as u64,
        },
        Kind::Map => Header {
            len: prefix,
            items: 2 * n as u64,
        },
    }))
}

enum Kind {
    Blob,
    Ext,
    Array,
    Map,
}

/// Incremental message decoder.
///
/// Bytes are appended with [`Decoder::feed`]; complete messages are pulled
/// with [`Decoder::next_message`] until it returns `Ok(None)` (need more data).
/// Any `Err` is fatal for the stream: the buffered bytes can no longer be
/// trusted to start at a message boundary.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    config: FrameConfig,
    scanner: Scanner,
}

impl Decoder {
    /// Create a decoder with default limits.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a decoder with explicit limits.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            scanner: Scanner::default(),
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.scanner.scan(&self.buf, self.config.max_depth)?.is_none() {
            if self.buf.len() > self.config.max_buffer {
                return Err(FrameError::BufferOverflow {
                    size: self.buf.len(),
                    max: self.config.max_buffer,
                });
            }
            return Ok(None);
        }
        self.scanner = Scanner::default();
        decode_message(&mut self.buf, &self.config)
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanner = Scanner::default();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
