//! Job channels: child processes on pipes or a pseudo-terminal.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rpcmux_event::{
    process_events_until, Process, ProcessKind, PtySize, RStream, SpawnOptions, SpawnedStreams,
    StdioMode, Timeout, WStream,
};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelId, ExitCallback, Job, OutputCallback, Slot, Transport};
use crate::error::{ChannelError, Result};
use crate::runtime::Runtime;

/// Exit code reported by [`Runtime::job_wait`] when the wait timed out.
pub const WAIT_TIMEOUT: i32 = -1;
/// The wait was interrupted; the job has been asked to stop.
pub const WAIT_INTERRUPTED: i32 = -2;
/// The id is not a job.
pub const WAIT_INVALID: i32 = -3;

/// Most bytes drained from one output stream after the job exits.
const EXIT_FLUSH_LIMIT: usize = 64 * 1024;

/// How to start a job channel.
#[derive(Clone, Default)]
pub struct JobOptions {
    pub spawn: SpawnOptions,
    /// Speak msgpack-RPC over the child's stdin/stdout.
    pub rpc: bool,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
    pub on_exit: Option<ExitCallback>,
}

impl JobOptions {
    pub fn new(spawn: SpawnOptions) -> Self {
        Self {
            spawn,
            ..Self::default()
        }
    }

    /// An rpc job running `argv`.
    pub fn rpc<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            spawn: SpawnOptions::new(argv),
            rpc: true,
            ..Self::default()
        }
    }
}

impl Runtime {
    /// Spawn a child and wrap it in a channel.
    ///
    /// On failure the reserved id is given back and nothing stays registered.
    pub fn job_start(&mut self, options: JobOptions) -> Result<ChannelId> {
        let JobOptions {
            mut spawn,
            rpc,
            on_stdout,
            on_stderr,
            on_exit,
        } = options;
        if rpc && spawn.pty.is_some() {
            return Err(ChannelError::PtyWithRpc);
        }
        if rpc {
            spawn.stdin = StdioMode::Pipe;
            spawn.stdout = StdioMode::Pipe;
        }

        let id = self.channels.reserve_id();
        let (mut process, streams) = match Process::spawn(&spawn) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.channels.release_id(id);
                warn!(id, error = %err, "job failed to start");
                return Err(err.into());
            }
        };

        let job = match self.attach_job_streams(id, streams) {
            Ok((stdin, stdout, stderr)) => Job {
                stdin,
                stdout,
                stderr,
                process,
            },
            Err(err) => {
                let _ = process.signal(libc::SIGKILL);
                self.forget_tokens(id);
                self.channels.release_id(id);
                return Err(err);
            }
        };

        let pid = job.process.pid();
        let transport = match job.process.kind() {
            ProcessKind::Pty => Transport::Pty(job),
            ProcessKind::Pipes => Transport::Process(job),
        };
        let queue = self.event_loop.new_queue();
        let mut channel = Channel::new(id, transport, queue);
        channel.on_stdout = on_stdout;
        channel.on_stderr = on_stderr;
        channel.on_exit = on_exit;
        self.channels.insert(channel);
        if rpc {
            self.rpc_start(id);
        }
        self.event_loop.set_tick(Some(self.config.reap_interval));
        info!(id, pid, rpc, "job started");
        Ok(id)
    }

    fn attach_job_streams(
        &mut self,
        id: ChannelId,
        streams: SpawnedStreams,
    ) -> Result<(Option<WStream>, Option<RStream>, Option<RStream>)> {
        let stdin = streams
            .stdin
            .map(|handle| self.add_write_stream(id, handle))
            .transpose()?;
        let stdout = streams
            .stdout
            .map(|handle| self.add_read_stream(id, Slot::Stdout, handle))
            .transpose()?;
        let stderr = streams
            .stderr
            .map(|handle| self.add_read_stream(id, Slot::Stderr, handle))
            .transpose()?;
        Ok((stdin, stdout, stderr))
    }

    /// Poll running children; queue an exit event for each one that ended.
    pub(crate) fn reap_children(&mut self) {
        let mut running = false;
        let mut exited = Vec::new();
        for channel in self.channels.iter_mut() {
            let (id, queue) = (channel.id, channel.events);
            let Some(job) = channel.transport.job_mut() else {
                continue;
            };
            if job.process.has_exited() {
                continue;
            }
            match job.process.try_reap() {
                Some(status) => exited.push((id, queue, status)),
                None => running = true,
            }
        }
        for (id, queue, status) in exited {
            self.event_loop.put(
                queue,
                Box::new(move |rt: &mut Runtime| rt.on_process_exit(id, status)),
            );
        }
        if !running {
            self.event_loop.set_tick(None);
        }
    }

    /// Whether any job child has not been reaped yet.
    pub fn has_children(&self) -> bool {
        self.channels
            .iter()
            .filter_map(Channel::process)
            .any(|process| !process.has_exited())
    }

    fn on_process_exit(&mut self, id: ChannelId, status: i32) {
        let registry = self.event_loop.registry();
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        channel.exit_status = status;

        // Whatever the child wrote before exiting is still delivered.
        let mut output = Vec::new();
        for slot in [Slot::Stdout, Slot::Stderr] {
            let Some(stream) = channel.transport.read_stream(slot) else {
                continue;
            };
            let mut drained = 0;
            loop {
                let (data, resumed) = stream.take_buffered();
                drained += data.len();
                if !data.is_empty() {
                    output.push((slot, data, false));
                }
                // A grandchild holding the pipe open can write forever.
                if drained >= EXIT_FLUSH_LIMIT {
                    break;
                }
                let more = stream.read_available();
                if !resumed && more.bytes == 0 {
                    break;
                }
            }
            stream.mark_eof();
            if stream.take_eof() {
                output.push((slot, Bytes::new(), true));
            }
        }
        if let Some(stdin) = channel.transport.write_stream() {
            stdin.close(registry);
        }
        let on_exit = channel.on_exit.clone();

        for (slot, data, eof) in output {
            self.deliver(id, slot, data, eof);
        }
        let registry = self.event_loop.registry();
        if let Some(channel) = self.channels.get_mut(id) {
            channel.transport.close_slot(Slot::Stdout, registry);
            channel.transport.close_slot(Slot::Stderr, registry);
        }
        debug!(id, status, "job exit processed");
        if let Some(on_exit) = on_exit {
            on_exit(self, id, status);
        }
        self.maybe_release_transport(id);
    }

    /// Ask a job to stop: close its input now, SIGTERM after
    /// `stop_term_timeout`, SIGKILL after `stop_kill_timeout` more.
    pub fn job_stop(&mut self, id: ChannelId) -> Result<()> {
        let registry = self.event_loop.registry();
        let channel = self
            .channels
            .get_mut(id)
            .ok_or(ChannelError::InvalidChannel(id))?;
        let pty = channel.is_pty();
        let job = channel
            .transport
            .job_mut()
            .ok_or(ChannelError::NotJob(id))?;
        if !job.process.request_stop(Instant::now()) {
            return Ok(());
        }
        info!(id, pid = job.process.pid(), "stopping job");
        if let Some(stdin) = job.stdin.as_mut() {
            stdin.close(registry);
        }
        if pty {
            // The child only sees hangup once every master descriptor is gone.
            if let Some(stdout) = job.stdout.as_mut() {
                stdout.close(registry);
            }
        }
        self.ensure_kill_timer();
        Ok(())
    }

    fn ensure_kill_timer(&mut self) {
        if self.kill_timer.is_some() {
            return;
        }
        let interval = self
            .config
            .stop_term_timeout
            .min(self.config.stop_kill_timeout)
            .max(Duration::from_millis(1));
        self.kill_timer = Some(
            self.event_loop
                .start_timer(interval, Box::new(|rt: &mut Runtime| rt.on_kill_timer())),
        );
    }

    fn on_kill_timer(&mut self) {
        self.kill_timer = None;
        let now = Instant::now();
        let (term_after, kill_after) = (self.config.stop_term_timeout, self.config.stop_kill_timeout);
        let mut stopping = false;
        for channel in self.channels.iter_mut() {
            if let Some(job) = channel.transport.job_mut() {
                if job.process.is_stopping() {
                    job.process.escalate(now, term_after, kill_after);
                    stopping = true;
                }
            }
        }
        if stopping {
            self.ensure_kill_timer();
        }
    }

    /// Wait for jobs to exit.
    ///
    /// Each result is the exit status, [`WAIT_TIMEOUT`], [`WAIT_INTERRUPTED`]
    /// or [`WAIT_INVALID`]. Interrupting (see [`Runtime::interrupt_handle`])
    /// stops every job still running.
    pub fn job_wait(&mut self, ids: &[ChannelId], timeout: Timeout) -> Vec<i32> {
        let deadline = match timeout {
            Timeout::After(after) => Some(Instant::now() + after),
            _ => None,
        };
        let waited: Vec<Option<ChannelId>> = ids
            .iter()
            .map(|&id| {
                let is_job = self
                    .channels
                    .get(id)
                    .is_some_and(|channel| channel.transport.job().is_some());
                is_job.then_some(id)
            })
            .collect();
        // Keep the channels alive across the wait even if they exit and close.
        for id in waited.iter().flatten() {
            self.incref(*id);
        }

        let mut interrupted = false;
        for id in waited.iter().flatten().copied() {
            let Some(queue) = self.channels.get(id).map(|channel| channel.events) else {
                continue;
            };
            let remaining = match (timeout, deadline) {
                (Timeout::After(_), Some(deadline)) => {
                    Timeout::After(deadline.saturating_duration_since(Instant::now()))
                }
                (other, _) => other,
            };
            process_events_until(self, queue, remaining, |rt| {
                rt.job_exited(id) || rt.is_interrupted()
            });
            if self.is_interrupted() {
                interrupted = true;
                break;
            }
        }

        let results = waited
            .iter()
            .map(|slot| match slot {
                None => WAIT_INVALID,
                Some(id) if self.job_exited(*id) => self
                    .channels
                    .get(*id)
                    .map_or(WAIT_INVALID, Channel::exit_status),
                Some(_) if interrupted => WAIT_INTERRUPTED,
                Some(_) => WAIT_TIMEOUT,
            })
            .collect();

        if interrupted {
            self.interrupted.store(false, Ordering::SeqCst);
            for id in waited.iter().flatten().copied() {
                if !self.job_exited(id) {
                    let _ = self.job_stop(id);
                }
            }
        }
        for id in waited.iter().flatten().copied() {
            self.decref(id);
        }
        results
    }

    fn job_exited(&self, id: ChannelId) -> bool {
        self.channels
            .get(id)
            .is_none_or(|channel| channel.exit_status != -1)
    }

    pub fn job_pid(&self, id: ChannelId) -> Result<u32> {
        let channel = self.channels.get(id).ok_or(ChannelError::InvalidChannel(id))?;
        channel
            .process()
            .map(|process| process.pid())
            .ok_or(ChannelError::NotJob(id))
    }

    /// Whether the job's child is still running.
    pub fn job_running(&self, id: ChannelId) -> bool {
        self.channels
            .get(id)
            .and_then(Channel::process)
            .is_some_and(|process| !process.has_exited())
    }

    /// Resize a pty job's terminal.
    pub fn job_resize(&mut self, id: ChannelId, width: u16, height: u16) -> Result<()> {
        let channel = self.channels.get(id).ok_or(ChannelError::InvalidChannel(id))?;
        let process = channel.process().ok_or(ChannelError::NotJob(id))?;
        if process.kind() != ProcessKind::Pty {
            return Err(ChannelError::InvalidStream);
        }
        process.resize(PtySize { width, height })?;
        Ok(())
    }

    /// Send raw bytes to a non-rpc channel's input.
    pub fn send_raw(&mut self, id: ChannelId, data: &[u8]) -> Result<usize> {
        let channel = self
            .channels
            .get_mut(id)
            .ok_or(ChannelError::InvalidChannel(id))?;
        if channel.rpc.is_some() {
            return Err(ChannelError::RawToRpc);
        }
        match &mut channel.transport {
            Transport::Stderr { closed: true } => Err(ChannelError::ClosedStream),
            Transport::Stderr { closed: false } => {
                std::io::stderr().write_all(data)?;
                Ok(data.len())
            }
            Transport::Internal { .. } => Err(ChannelError::InvalidStream),
            transport => {
                let stream = transport
                    .write_stream()
                    .filter(|stream| !stream.is_closed())
                    .ok_or(ChannelError::ClosedStream)?;
                if stream.write(Bytes::copy_from_slice(data)) {
                    Ok(data.len())
                } else {
                    Err(ChannelError::WriteRejected)
                }
            }
        }
    }
}
