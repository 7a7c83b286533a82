use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use rpcmux_event::{Process, ProcessKind, QueueId, RStream, Registry, WStream};
use serde::{Deserialize, Serialize};

use crate::rpc::RpcState;
use crate::runtime::Runtime;

/// Process-unique channel identifier.
pub type ChannelId = u64;

/// Reserved id of the primary stdio channel.
pub const STDIO_ID: ChannelId = 1;
/// Reserved id of the stderr channel.
pub const STDERR_ID: ChannelId = 2;
/// First id handed out to other channels.
pub const FIRST_DYNAMIC_ID: ChannelId = 3;

/// Receives raw output: channel id, bytes, EOF flag.
pub type OutputCallback = Rc<dyn Fn(&mut Runtime, ChannelId, &[u8], bool)>;
/// Receives a job's exit status.
pub type ExitCallback = Rc<dyn Fn(&mut Runtime, ChannelId, i32)>;

/// Which part of a channel to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPart {
    Stdin,
    Stdout,
    Stderr,
    Rpc,
    All,
}

impl FromStr for ChannelPart {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdin" => Ok(Self::Stdin),
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "rpc" => Ok(Self::Rpc),
            "" | "all" => Ok(Self::All),
            other => Err(format!("Invalid channel stream \"{other}\"")),
        }
    }
}

/// Transport category, as reported by introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Job,
    Stdio,
    Stderr,
    Socket,
    Internal,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Stdio => "stdio",
            Self::Stderr => "stderr",
            Self::Socket => "socket",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a channel's bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Rpc,
    Terminal,
    Bytes,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Terminal => "terminal",
            Self::Bytes => "bytes",
        }
    }
}

/// Stream slots a loop token can refer to. Sockets and stdio read into
/// `Stdout` and write from `Stdin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Stdin,
    Stdout,
    Stderr,
}

/// A child process plus the parent ends of its streams.
pub struct Job {
    pub(crate) process: Process,
    pub(crate) stdin: Option<WStream>,
    pub(crate) stdout: Option<RStream>,
    pub(crate) stderr: Option<RStream>,
}

/// A bidirectional stream split into independently registered halves.
pub struct Duplex {
    pub(crate) read: Option<RStream>,
    pub(crate) write: Option<WStream>,
    pub(crate) address: Option<String>,
}

/// The one transport a channel owns.
pub enum Transport {
    Process(Job),
    Pty(Job),
    Socket(Duplex),
    Stdio(Duplex),
    Stderr { closed: bool },
    Internal { closed: bool },
}

impl Transport {
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Process(_) | Self::Pty(_) => StreamKind::Job,
            Self::Socket(_) => StreamKind::Socket,
            Self::Stdio(_) => StreamKind::Stdio,
            Self::Stderr { .. } => StreamKind::Stderr,
            Self::Internal { .. } => StreamKind::Internal,
        }
    }

    pub(crate) fn job(&self) -> Option<&Job> {
        match self {
            Self::Process(job) | Self::Pty(job) => Some(job),
            _ => None,
        }
    }

    pub(crate) fn job_mut(&mut self) -> Option<&mut Job> {
        match self {
            Self::Process(job) | Self::Pty(job) => Some(job),
            _ => None,
        }
    }

    pub(crate) fn read_stream(&mut self, slot: Slot) -> Option<&mut RStream> {
        match (self, slot) {
            (Self::Process(job) | Self::Pty(job), Slot::Stdout) => job.stdout.as_mut(),
            (Self::Process(job) | Self::Pty(job), Slot::Stderr) => job.stderr.as_mut(),
            (Self::Socket(duplex) | Self::Stdio(duplex), Slot::Stdout) => duplex.read.as_mut(),
            _ => None,
        }
    }

    pub(crate) fn write_stream(&mut self) -> Option<&mut WStream> {
        match self {
            Self::Process(job) | Self::Pty(job) => job.stdin.as_mut(),
            Self::Socket(duplex) | Self::Stdio(duplex) => duplex.write.as_mut(),
            _ => None,
        }
    }

    /// Close one slot. Returns true when the slot existed.
    pub(crate) fn close_slot(&mut self, slot: Slot, registry: &Registry) -> bool {
        match slot {
            Slot::Stdin => match self.write_stream() {
                Some(stream) => {
                    stream.close(registry);
                    true
                }
                None => false,
            },
            Slot::Stdout | Slot::Stderr => match self.read_stream(slot) {
                Some(stream) => {
                    stream.close(registry);
                    true
                }
                None => false,
            },
        }
    }

    /// Whether every part of the transport has been shut down.
    pub(crate) fn is_finished(&self) -> bool {
        fn read_done(stream: &Option<RStream>) -> bool {
            stream.as_ref().is_none_or(RStream::is_released)
        }
        fn write_done(stream: &Option<WStream>) -> bool {
            stream.as_ref().is_none_or(WStream::is_closed)
        }
        match self {
            Self::Process(job) | Self::Pty(job) => {
                job.process.has_exited()
                    && write_done(&job.stdin)
                    && read_done(&job.stdout)
                    && read_done(&job.stderr)
            }
            Self::Socket(duplex) | Self::Stdio(duplex) => {
                read_done(&duplex.read) && write_done(&duplex.write)
            }
            Self::Stderr { closed } | Self::Internal { closed } => *closed,
        }
    }
}

/// One logical peer connection.
pub struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) refcount: usize,
    pub(crate) transport: Transport,
    pub(crate) events: QueueId,
    pub(crate) rpc: Option<RpcState>,
    pub(crate) closed: bool,
    pub(crate) transport_released: bool,
    pub(crate) exit_status: i32,
    pub(crate) on_stdout: Option<OutputCallback>,
    pub(crate) on_stderr: Option<OutputCallback>,
    pub(crate) on_exit: Option<ExitCallback>,
    pub(crate) buffer: Option<u64>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, transport: Transport, events: QueueId) -> Self {
        Self {
            id,
            refcount: 1,
            transport,
            events,
            rpc: None,
            closed: false,
            transport_released: false,
            exit_status: -1,
            on_stdout: None,
            on_stderr: None,
            on_exit: None,
            buffer: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_rpc(&self) -> bool {
        self.rpc.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// RPC state, for rpc channels.
    pub fn rpc(&self) -> Option<&RpcState> {
        self.rpc.as_ref()
    }

    pub fn stream_kind(&self) -> StreamKind {
        self.transport.kind()
    }

    pub fn mode(&self) -> Mode {
        if self.rpc.is_some() {
            Mode::Rpc
        } else if self.buffer.is_some() {
            Mode::Terminal
        } else {
            Mode::Bytes
        }
    }

    /// Exit status of a job channel, `-1` while running (and for non-jobs).
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Current reference count.
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub(crate) fn process(&self) -> Option<&Process> {
        self.transport.job().map(|job| &job.process)
    }

    pub(crate) fn is_pty(&self) -> bool {
        self.process()
            .is_some_and(|process| process.kind() == ProcessKind::Pty)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("stream", &self.stream_kind())
            .field("mode", &self.mode())
            .field("refcount", &self.refcount)
            .field("closed", &self.closed)
            .finish()
    }
}
