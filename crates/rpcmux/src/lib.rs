//! msgpack-RPC channels over sockets, pipes and child processes.
//!
//! rpcmux multiplexes many peers onto one single-threaded event loop. Each
//! peer is a channel: a child process (on pipes or a pty), a socket
//! connection, the process' own stdio, or an in-process loopback. Channels
//! either pass raw bytes to callbacks or speak msgpack-RPC, with nested
//! synchronous calls in both directions.
//!
//! # Crate Structure
//!
//! - [`event`]: event loop, byte streams, sockets and child processes
//! - [`frame`]: msgpack-RPC message model, incremental decoder, blocking reader/writer
//! - [`channel`]: channels, RPC dispatch, servers and the [`Runtime`] that owns them

/// Re-export event loop types.
pub mod event {
    pub use rpcmux_event::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rpcmux_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use rpcmux_channel::*;
}

pub use rpcmux_channel::{ChannelError, ChannelId, Runtime, RuntimeConfig, StreamOptions};
pub use rpcmux_frame::{RpcError, Value};
