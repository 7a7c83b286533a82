use std::collections::HashMap;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rpcmux_event::{
    drain_queue, process_events_until, IoHandle, Loop, LoopContext, LoopHandle, QueueId,
    RStream, Readiness, Timeout, TimerId, Token, WStream,
};
use tracing::{debug, info, trace, warn};

use crate::channel::{
    Channel, ChannelId, ChannelPart, Duplex, OutputCallback, Slot, Transport, STDERR_ID,
};
use crate::config::RuntimeConfig;
use crate::dispatch::HandlerTable;
use crate::error::{ChannelError, Result};
use crate::registry::ChannelRegistry;
use crate::server::ServerRegistry;

/// What a loop token belongs to.
#[derive(Debug, Clone)]
pub(crate) enum IoOwner {
    Channel(ChannelId, Slot),
    Server(String),
}

/// Options for socket and stdio channels.
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Speak msgpack-RPC instead of passing raw bytes.
    pub rpc: bool,
    /// Raw output callback (ignored for rpc channels).
    pub on_output: Option<OutputCallback>,
}

impl StreamOptions {
    pub fn rpc() -> Self {
        Self {
            rpc: true,
            on_output: None,
        }
    }
}

/// One event loop plus every channel, server and handler driven by it.
///
/// All channel operations happen on the thread that owns the runtime.
/// Operations that wait ([`Runtime::send_call`], [`Runtime::job_wait`])
/// pump the loop, so handlers and callbacks may run re-entrantly during them.
pub struct Runtime {
    pub(crate) event_loop: Loop<Runtime>,
    pub(crate) channels: ChannelRegistry,
    pub(crate) servers: ServerRegistry,
    pub(crate) handlers: HandlerTable,
    pub(crate) io: HashMap<Token, IoOwner>,
    pub(crate) config: RuntimeConfig,
    pub(crate) kill_timer: Option<TimerId>,
    pub(crate) interrupted: Arc<AtomicBool>,
}

impl LoopContext for Runtime {
    fn event_loop(&mut self) -> &mut Loop<Self> {
        &mut self.event_loop
    }

    fn on_io(&mut self, readiness: Readiness) {
        match self.io.get(&readiness.token).cloned() {
            Some(IoOwner::Server(address)) => self.accept_connections(&address),
            Some(IoOwner::Channel(id, Slot::Stdin)) => self.on_writable(id),
            Some(IoOwner::Channel(id, slot)) => self.on_readable(id, slot),
            None => trace!(token = readiness.token.0, "readiness for unknown token"),
        }
    }

    fn on_tick(&mut self) {
        self.reap_children();
    }
}

impl Runtime {
    /// Create a runtime with the stderr channel (id 2) and built-in handlers.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let mut event_loop = Loop::new()?;
        let mut handlers = HandlerTable::new();
        crate::builtins::register(&mut handlers);

        let mut channels = ChannelRegistry::new();
        let queue = event_loop.new_queue();
        channels.insert(Channel::new(
            STDERR_ID,
            Transport::Stderr { closed: false },
            queue,
        ));

        Ok(Self {
            event_loop,
            channels,
            servers: ServerRegistry::new(),
            handlers,
            io: HashMap::new(),
            config,
            kill_timer: None,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The channel table (read-only).
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    /// Handle for scheduling work from other threads.
    pub fn loop_handle(&self) -> LoopHandle<Runtime> {
        self.event_loop.handle()
    }

    /// Flag checked by waits; setting it interrupts [`Runtime::job_wait`].
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Queue a callback on the main queue.
    pub fn schedule(&mut self, event: impl FnOnce(&mut Runtime) + 'static) {
        self.event_loop.schedule(Box::new(event));
    }

    /// One loop iteration followed by draining the main queue.
    pub fn run_once(&mut self, timeout: Timeout) {
        rpcmux_event::run_once(self, timeout);
        drain_queue(self, QueueId::MAIN);
    }

    /// Process main-queue events until `done` holds or `timeout` elapses.
    pub fn run_until<F>(&mut self, timeout: Timeout, done: F) -> bool
    where
        F: FnMut(&mut Runtime) -> bool,
    {
        process_events_until(self, QueueId::MAIN, timeout, done)
    }

    pub(crate) fn add_read_stream(
        &mut self,
        id: ChannelId,
        slot: Slot,
        handle: IoHandle,
    ) -> Result<RStream> {
        let token = self.event_loop.next_token();
        let mut stream = RStream::new(handle, token, self.config.read_buffer_size);
        stream.start(self.event_loop.registry())?;
        self.io.insert(token, IoOwner::Channel(id, slot));
        Ok(stream)
    }

    pub(crate) fn add_write_stream(&mut self, id: ChannelId, handle: IoHandle) -> Result<WStream> {
        let token = self.event_loop.next_token();
        let mut stream = WStream::new(handle, token, self.config.max_write_memory);
        stream.start(self.event_loop.registry())?;
        self.io.insert(token, IoOwner::Channel(id, Slot::Stdin));
        Ok(stream)
    }

    pub(crate) fn forget_tokens(&mut self, id: ChannelId) {
        self.io
            .retain(|_, owner| !matches!(owner, IoOwner::Channel(owner_id, _) if *owner_id == id));
    }

    /// Create an rpc or byte channel over a connected socket.
    pub(crate) fn create_socket_channel(
        &mut self,
        handle: IoHandle,
        address: String,
        options: StreamOptions,
    ) -> Result<ChannelId> {
        let id = self.channels.reserve_id();
        let built = handle
            .try_clone()
            .map_err(ChannelError::from)
            .and_then(|writer| {
                let read = self.add_read_stream(id, Slot::Stdout, handle)?;
                let write = self.add_write_stream(id, writer)?;
                Ok((read, write))
            });
        let (read, write) = match built {
            Ok(streams) => streams,
            Err(err) => {
                self.forget_tokens(id);
                self.channels.release_id(id);
                return Err(err);
            }
        };

        let queue = self.event_loop.new_queue();
        let mut channel = Channel::new(
            id,
            Transport::Socket(Duplex {
                read: Some(read),
                write: Some(write),
                address: Some(address),
            }),
            queue,
        );
        channel.on_stdout = options.on_output;
        self.channels.insert(channel);
        if options.rpc {
            self.rpc_start(id);
        }
        Ok(id)
    }

    /// Open the process' own stdin/stdout as channel 1. Only once per runtime.
    pub fn from_stdio(&mut self, options: StreamOptions) -> Result<ChannelId> {
        let id = self.channels.claim_stdio().ok_or(ChannelError::StdioAlreadyOpen)?;
        let input = IoHandle::pipe_reader(std::io::stdin().as_fd().try_clone_to_owned()?)?;
        let output = IoHandle::pipe_writer(std::io::stdout().as_fd().try_clone_to_owned()?)?;

        let streams = self
            .add_read_stream(id, Slot::Stdout, input)
            .and_then(|read| Ok((read, self.add_write_stream(id, output)?)));
        let (read, write) = match streams {
            Ok(streams) => streams,
            Err(err) => {
                self.forget_tokens(id);
                return Err(err);
            }
        };

        let queue = self.event_loop.new_queue();
        let mut channel = Channel::new(
            id,
            Transport::Stdio(Duplex {
                read: Some(read),
                write: Some(write),
                address: None,
            }),
            queue,
        );
        channel.on_stdout = options.on_output;
        self.channels.insert(channel);
        if options.rpc {
            self.rpc_start(id);
        }
        info!(id, rpc = options.rpc, "stdio channel opened");
        Ok(id)
    }

    /// Open an in-process rpc channel whose writes are read back by itself.
    pub fn open_loopback(&mut self) -> ChannelId {
        let id = self.channels.reserve_id();
        let queue = self.event_loop.new_queue();
        self.channels
            .insert(Channel::new(id, Transport::Internal { closed: false }, queue));
        self.rpc_start(id);
        debug!(id, "loopback channel opened");
        id
    }

    fn on_readable(&mut self, id: ChannelId, slot: Slot) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        let queue = channel.events;
        let Some(stream) = channel.transport.read_stream(slot) else {
            return;
        };
        let outcome = stream.read_available();
        // A queued read takes everything buffered, including what just arrived.
        if stream.has_pending() || (stream.buffered() == 0 && !outcome.eof) {
            return;
        }
        stream.begin_request();
        self.event_loop
            .put(queue, Box::new(move |rt: &mut Runtime| rt.on_read_event(id, slot)));
    }

    fn on_read_event(&mut self, id: ChannelId, slot: Slot) {
        let registry = self.event_loop.registry();
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        let Some(stream) = channel.transport.read_stream(slot) else {
            return;
        };
        let (data, resumed) = stream.take_buffered();
        let eof = stream.take_eof();
        let closed = stream.is_closed();
        stream.finish_request(registry);

        if !closed {
            // The retry runs from the fast queue, so reaping and timers get
            // a turn between reads of a busy stream.
            if resumed {
                self.event_loop.put(
                    QueueId::FAST,
                    Box::new(move |rt: &mut Runtime| rt.on_readable(id, slot)),
                );
            }
            self.deliver(id, slot, data, eof);
        }
        self.maybe_release_transport(id);
    }

    /// Hand received bytes to the rpc layer or the output callback.
    pub(crate) fn deliver(&mut self, id: ChannelId, slot: Slot, data: Bytes, eof: bool) {
        let Some(channel) = self.channels.get(id) else {
            return;
        };
        if channel.rpc.is_some() && slot == Slot::Stdout {
            self.rpc_receive(id, &data, eof);
        } else {
            let callback = match slot {
                Slot::Stdout => channel.on_stdout.clone(),
                Slot::Stderr => channel.on_stderr.clone(),
                Slot::Stdin => None,
            };
            match callback {
                Some(callback) => callback(self, id, &data, eof),
                None if !data.is_empty() => {
                    debug!(id, ?slot, bytes = data.len(), "discarding output without a reader");
                }
                None => {}
            }
        }
        if eof {
            self.on_stream_eof(id, slot);
        }
    }

    fn on_stream_eof(&mut self, id: ChannelId, slot: Slot) {
        let registry = self.event_loop.registry();
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        let byte_socket =
            channel.rpc.is_none() && matches!(channel.transport, Transport::Socket(_));
        match &mut channel.transport {
            Transport::Process(job) | Transport::Pty(job) => {
                let stream = match slot {
                    Slot::Stdout => job.stdout.as_mut(),
                    Slot::Stderr => job.stderr.as_mut(),
                    Slot::Stdin => None,
                };
                if let Some(stream) = stream {
                    stream.close(registry);
                }
            }
            Transport::Socket(duplex) | Transport::Stdio(duplex) => {
                if let Some(read) = duplex.read.as_mut() {
                    read.close(registry);
                }
                // A byte socket is over once the peer hangs up.
                if byte_socket {
                    if let Some(write) = duplex.write.as_mut() {
                        write.close(registry);
                    }
                }
            }
            Transport::Stderr { .. } | Transport::Internal { .. } => {}
        }
        if byte_socket {
            channel.closed = true;
        }
        self.maybe_release_transport(id);
    }

    fn on_writable(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        let flushed = match channel.transport.write_stream() {
            Some(stream) if !stream.is_closed() => stream.flush(),
            _ => true,
        };
        if !flushed {
            self.write_failed(id);
        }
    }

    pub(crate) fn write_failed(&mut self, id: ChannelId) {
        let is_rpc = self
            .channels
            .get(id)
            .is_some_and(|channel| channel.rpc.is_some());
        if is_rpc {
            self.close_with_error(
                id,
                format!("ch {id}: stream write failed. RPC canceled; closing channel"),
                tracing::Level::ERROR,
            );
        } else {
            warn!(id, "stream write failed");
            let registry = self.event_loop.registry();
            if let Some(stream) = self
                .channels
                .get_mut(id)
                .and_then(|channel| channel.transport.write_stream())
            {
                stream.close(registry);
            }
            self.maybe_release_transport(id);
        }
    }

    /// Close part of a channel.
    ///
    /// Closing a channel that no longer exists succeeds if its id was ever
    /// handed out; an id that never existed is an error.
    pub fn close(&mut self, id: ChannelId, part: ChannelPart) -> Result<()> {
        let Some(channel) = self.channels.get(id) else {
            if self.channels.was_allocated(id) {
                return Ok(());
            }
            return Err(ChannelError::InvalidChannel(id));
        };
        if channel.closed {
            return Ok(());
        }

        let is_rpc = channel.rpc.is_some();
        let close_main = matches!(part, ChannelPart::Rpc | ChannelPart::All);
        match part {
            ChannelPart::Rpc if !is_rpc => return Err(ChannelError::InvalidStream),
            ChannelPart::Stdin | ChannelPart::Stdout if is_rpc => {
                return Err(ChannelError::InvalidRpcStream)
            }
            _ => {}
        }
        match (&channel.transport, part) {
            (Transport::Socket(_) | Transport::Internal { .. }, _) if !close_main => {
                return Err(ChannelError::InvalidStream)
            }
            (Transport::Stdio(_), ChannelPart::Stderr) => return Err(ChannelError::InvalidStream),
            (Transport::Stderr { .. }, ChannelPart::Stderr | ChannelPart::All) => {}
            (Transport::Stderr { .. }, _) => return Err(ChannelError::InvalidStream),
            _ => {}
        }

        if close_main && is_rpc {
            self.rpc_close(id);
        }

        let registry = self.event_loop.registry();
        let Some(channel) = self.channels.get_mut(id) else {
            return Ok(());
        };
        let wants = |slot: ChannelPart| close_main || part == slot;
        match &mut channel.transport {
            Transport::Process(job) | Transport::Pty(job) => {
                if wants(ChannelPart::Stdin) {
                    if let Some(stream) = job.stdin.as_mut() {
                        stream.close(registry);
                    }
                }
                if wants(ChannelPart::Stdout) {
                    if let Some(stream) = job.stdout.as_mut() {
                        stream.close(registry);
                    }
                }
                if wants(ChannelPart::Stderr) {
                    if let Some(stream) = job.stderr.as_mut() {
                        stream.close(registry);
                    }
                }
                if close_main {
                    job.process.close_master();
                }
            }
            Transport::Stdio(duplex) => {
                // From this process' point of view: stdin is what we read.
                if wants(ChannelPart::Stdin) {
                    if let Some(stream) = duplex.read.as_mut() {
                        stream.close(registry);
                    }
                }
                if wants(ChannelPart::Stdout) {
                    if let Some(stream) = duplex.write.as_mut() {
                        stream.close(registry);
                    }
                }
            }
            Transport::Socket(duplex) => {
                if let Some(stream) = duplex.read.as_mut() {
                    stream.close(registry);
                }
                if let Some(stream) = duplex.write.as_mut() {
                    stream.close(registry);
                }
            }
            Transport::Stderr { closed } | Transport::Internal { closed } => *closed = true,
        }
        if close_main {
            channel.closed = true;
        }
        debug!(id, ?part, "channel part closed");
        self.maybe_release_transport(id);
        Ok(())
    }

    /// Drop the transport's reference once every part of it is shut down.
    pub(crate) fn maybe_release_transport(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        if channel.transport_released || !channel.transport.is_finished() {
            return;
        }
        channel.transport_released = true;
        channel.closed = true;
        debug!(id, "transport released");
        self.decref(id);
    }

    pub(crate) fn incref(&mut self, id: ChannelId) {
        if let Some(channel) = self.channels.get_mut(id) {
            channel.refcount += 1;
        }
    }

    /// Drop a reference. The last one schedules the free on the main queue,
    /// so events already queued for this channel never see it half-destroyed.
    pub(crate) fn decref(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        channel.refcount = channel.refcount.saturating_sub(1);
        if channel.refcount == 0 {
            self.event_loop
                .schedule(Box::new(move |rt: &mut Runtime| rt.free_channel(id)));
        }
    }

    fn free_channel(&mut self, id: ChannelId) {
        if self.channels.get(id).is_none_or(|channel| channel.refcount > 0) {
            return;
        }
        let Some(channel) = self.channels.remove(id) else {
            return;
        };
        self.event_loop.free_queue(channel.events);
        self.forget_tokens(id);
        info!(id, "channel freed");
    }

    /// Stop children, close servers and channels, then wait (bounded by
    /// `teardown_timeout`) for children to exit and queues to drain.
    pub fn teardown(&mut self) -> Result<()> {
        info!("tearing down runtime");
        self.close_all_servers();
        for id in self.channels.ids() {
            let is_job = self
                .channels
                .get(id)
                .is_some_and(|channel| channel.transport.job().is_some());
            if is_job {
                let _ = self.job_stop(id);
            } else if id != STDERR_ID {
                let _ = self.close(id, ChannelPart::All);
            }
        }

        let budget = self.config.teardown_timeout;
        let done = self.run_until(Timeout::After(budget), |rt| {
            !rt.has_children() && rt.event_loop.queue_is_empty(QueueId::MAIN)
        });
        if done {
            info!("teardown complete");
            Ok(())
        } else {
            warn!(?budget, "teardown timed out with children still running");
            Err(ChannelError::TeardownTimeout(budget))
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("channels", &self.channels.len())
            .field("servers", &self.servers.len())
            .finish()
    }
}
