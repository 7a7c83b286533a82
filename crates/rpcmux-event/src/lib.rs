//! Event loop and I/O plumbing for rpcmux.
//!
//! This is the lowest layer. It provides:
//! - [`Loop`]: a single-threaded reactor over mio readiness, with a
//!   parent/child work-queue hierarchy, one-shot timers and a thread-safe
//!   hand-off queue
//! - [`RStream`] / [`WStream`]: buffered read and write sides of one OS handle
//! - [`SocketWatcher`]: TCP / Unix socket listeners and outbound connects
//! - [`Process`]: child processes on pipes or a pseudo-terminal
//!
//! Everything above (channels, RPC) builds on these types.

pub mod error;
pub mod event_loop;
pub mod handle;
pub mod process;
pub mod pty;
pub mod queue;
pub mod rstream;
pub mod socket;
pub mod wstream;

pub use error::{EventError, Result};
pub use event_loop::{
    drain_queue, process_events_until, run_once, Loop, LoopContext, LoopHandle, Readiness,
    Timeout, TimerId,
};
pub use handle::IoHandle;
pub use process::{Process, ProcessKind, SpawnOptions, SpawnedStreams, StdioMode, StopStage};
pub use pty::PtySize;
pub use queue::{Event, MultiQueue, QueueId};
pub use rstream::{ReadOutcome, RStream, DEFAULT_READ_BUFFER_SIZE};
pub use socket::{connect, SocketAddress, SocketWatcher, DEFAULT_TCP_PORT};
pub use wstream::{WStream, DEFAULT_MAXMEM};

pub use mio::event::Source;
pub use mio::{Interest, Registry, Token};
