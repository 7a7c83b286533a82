//! msgpack-RPC channels for rpcmux.
//!
//! A [`Runtime`] owns one event loop and every channel driven by it. A
//! channel wraps exactly one transport (child process, pty, socket, stdio,
//! stderr or in-process loopback) and either passes raw bytes to callbacks
//! or speaks msgpack-RPC:
//!
//! ```no_run
//! use rpcmux_channel::{Runtime, RuntimeConfig, StreamOptions};
//! use rpcmux_frame::Value;
//!
//! let mut rt = Runtime::new(RuntimeConfig::default())?;
//! rt.register_handler("add", true, |_, _, args| {
//!     let sum: u64 = args.iter().filter_map(Value::as_u64).sum();
//!     Ok(Value::from(sum))
//! });
//! let address = rt.server_start("/tmp/rpcmux.sock")?;
//! let id = rt.connect(&address, StreamOptions::rpc())?;
//! let sum = rt.send_call(id, "add", vec![Value::from(1), Value::from(2)]);
//! # Ok::<(), rpcmux_channel::ChannelError>(())
//! ```
//!
//! Channels are reference counted. The last reference schedules the free on
//! the main queue, so events already queued for a channel never observe it
//! half-destroyed.

pub mod builtins;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod info;
pub mod job;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod server;

pub use channel::{
    Channel, ChannelId, ChannelPart, ExitCallback, Mode, OutputCallback, StreamKind, STDERR_ID,
    STDIO_ID,
};
pub use config::{RuntimeConfig, LISTEN_ADDRESS_ENV};
pub use dispatch::{Handler, HandlerFn, HandlerTable, ERROR_EVENT};
pub use error::{ChannelError, Result};
pub use info::{json_to_value, value_to_json, ChannelInfo};
pub use job::{JobOptions, WAIT_INTERRUPTED, WAIT_INVALID, WAIT_TIMEOUT};
pub use registry::ChannelRegistry;
pub use rpc::RpcState;
pub use runtime::{Runtime, StreamOptions};
pub use server::ServerRegistry;

pub use rpcmux_event::{PtySize, SpawnOptions, StdioMode, Timeout};
pub use rpcmux_frame::{ErrorKind, RpcError, Value};
