use std::time::Duration;

use rpcmux_event::{DEFAULT_MAXMEM, DEFAULT_READ_BUFFER_SIZE};
use rpcmux_frame::{FrameConfig, DEFAULT_MAX_BUFFER, DEFAULT_MAX_DEPTH};

/// Environment variable carrying the default listen address.
pub const LISTEN_ADDRESS_ENV: &str = "RPCMUX_LISTEN_ADDRESS";

/// Runtime limits and timeouts.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Queued write bytes per stream before writes are refused.
    pub max_write_memory: usize,
    /// Buffered read bytes per stream before reading pauses.
    pub read_buffer_size: usize,
    /// Maximum nesting depth of a decoded message.
    pub max_decode_depth: usize,
    /// Maximum bytes buffered for one incomplete message.
    pub max_decode_buffer: usize,
    /// Time between closing a stopped job's stdin and SIGTERM.
    pub stop_term_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub stop_kill_timeout: Duration,
    /// Bound on outbound TCP connects.
    pub connect_timeout: Duration,
    /// Budget for [`crate::Runtime::teardown`].
    pub teardown_timeout: Duration,
    /// How often children are checked for exit while any are running.
    pub reap_interval: Duration,
    /// Variable read by `server_init` and written after the first listen.
    pub listen_env_var: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_write_memory: DEFAULT_MAXMEM,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_decode_depth: DEFAULT_MAX_DEPTH,
            max_decode_buffer: DEFAULT_MAX_BUFFER,
            stop_term_timeout: Duration::from_secs(2),
            stop_kill_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            teardown_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_millis(20),
            listen_env_var: LISTEN_ADDRESS_ENV.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Decoder limits for channel input.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_depth: self.max_decode_depth,
            max_buffer: self.max_decode_buffer,
            ..FrameConfig::default()
        }
    }
}
