use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{EventError, Result};
use crate::handle::IoHandle;
use crate::pty::{self, PtySize};

/// How one standard stream of a child is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// A pipe owned by the parent.
    #[default]
    Pipe,
    /// `/dev/null`.
    Null,
    /// The parent's own descriptor.
    Inherit,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            Self::Pipe => Stdio::piped(),
            Self::Null => Stdio::null(),
            Self::Inherit => Stdio::inherit(),
        }
    }
}

/// Whether a child runs on plain pipes or a pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Pipes,
    Pty,
}

/// Everything needed to start a child.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Full environment for the child. `None` inherits the parent's.
    pub env: Option<Vec<(String, String)>>,
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
    /// Run on a pty of this size. Stdio modes are ignored then.
    pub pty: Option<PtySize>,
    /// Put the child in its own process group.
    pub detach: bool,
}

impl SpawnOptions {
    /// Options for `argv` with every stream piped.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Parent-side ends of the child's standard streams.
#[derive(Debug, Default)]
pub struct SpawnedStreams {
    pub stdin: Option<IoHandle>,
    pub stdout: Option<IoHandle>,
    pub stderr: Option<IoHandle>,
}

/// Progress of a graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopStage {
    Running,
    StdinClosed,
    TermSent,
    KillSent,
}

/// A spawned child process.
///
/// Exit is observed by polling [`Process::try_reap`]; the status is `-1`
/// until then.
pub struct Process {
    child: Child,
    kind: ProcessKind,
    pid: u32,
    argv: Vec<String>,
    status: i32,
    exited: bool,
    stage: StopStage,
    stop_requested_at: Option<Instant>,
    pty_master: Option<OwnedFd>,
    tty_name: Option<String>,
}

impl Process {
    /// Start a child per `options`.
    ///
    /// On failure nothing is left running and the error carries the OS errno
    /// (see [`EventError::status_code`]).
    pub fn spawn(options: &SpawnOptions) -> Result<(Process, SpawnedStreams)> {
        let Some(program) = options.argv.first() else {
            return Err(EventError::Spawn {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty argv"),
            });
        };
        let mut command = Command::new(program);
        command.args(&options.argv[1..]);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = &options.env {
            command.env_clear();
            command.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        // pty children get a session of their own; setsid would fail on a group leader
        if options.detach && options.pty.is_none() {
            command.process_group(0);
        }

        let spawn_err = |source: io::Error| EventError::Spawn {
            program: program.clone(),
            source,
        };

        let (process, streams) = match options.pty {
            Some(size) => Self::spawn_pty(command, size).map_err(spawn_err)?,
            None => Self::spawn_pipes(command, options).map_err(spawn_err)?,
        };

        let process = Process {
            argv: options.argv.clone(),
            ..process
        };
        info!(
            pid = process.pid,
            program = %program,
            kind = ?process.kind,
            "spawned child process"
        );
        Ok((process, streams))
    }

    fn spawn_pipes(mut command: Command, options: &SpawnOptions) -> io::Result<(Process, SpawnedStreams)> {
        command
            .stdin(options.stdin.to_stdio())
            .stdout(options.stdout.to_stdio())
            .stderr(options.stderr.to_stdio());
        let mut child = command.spawn()?;

        let streams = SpawnedStreams {
            stdin: child
                .stdin
                .take()
                .map(|s| IoHandle::pipe_writer(OwnedFd::from(s)))
                .transpose()?,
            stdout: child
                .stdout
                .take()
                .map(|s| IoHandle::pipe_reader(OwnedFd::from(s)))
                .transpose()?,
            stderr: child
                .stderr
                .take()
                .map(|s| IoHandle::pipe_reader(OwnedFd::from(s)))
                .transpose()?,
        };
        Ok((Self::from_child(child, ProcessKind::Pipes, None, None), streams))
    }

    fn spawn_pty(mut command: Command, size: PtySize) -> io::Result<(Process, SpawnedStreams)> {
        let pair = pty::open(size)?;
        command
            .stdin(Stdio::from(pair.slave.try_clone()?))
            .stdout(Stdio::from(pair.slave.try_clone()?))
            .stderr(Stdio::from(pair.slave.try_clone()?));
        // SAFETY: the hook only makes async-signal-safe libc calls.
        unsafe {
            command.pre_exec(pty::make_controlling_terminal);
        }
        let child = command.spawn()?;
        // The parent must not keep the slave open, or EOF never arrives.
        drop(command);
        drop(pair.slave);

        let streams = SpawnedStreams {
            stdin: Some(IoHandle::pipe_writer(pair.master.try_clone()?)?),
            stdout: Some(IoHandle::pipe_reader(pair.master.try_clone()?)?),
            stderr: None,
        };
        Ok((
            Self::from_child(child, ProcessKind::Pty, Some(pair.master), Some(pair.name)),
            streams,
        ))
    }

    fn from_child(
        child: Child,
        kind: ProcessKind,
        pty_master: Option<OwnedFd>,
        tty_name: Option<String>,
    ) -> Self {
        Self {
            pid: child.id(),
            child,
            kind,
            argv: Vec::new(),
            status: -1,
            exited: false,
            stage: StopStage::Running,
            stop_requested_at: None,
            pty_master,
            tty_name,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Exit status, `-1` while running.
    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// Slave device path for pty children.
    pub fn tty_name(&self) -> Option<&str> {
        self.tty_name.as_deref()
    }

    pub fn stop_stage(&self) -> StopStage {
        self.stage
    }

    /// Check for exit without blocking. Returns the status exactly once.
    pub fn try_reap(&mut self) -> Option<i32> {
        if self.exited {
            return None;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exited = true;
                self.status = exit_code(status);
                self.pty_master = None;
                info!(pid = self.pid, status = self.status, "child process exited");
                Some(self.status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(pid = self.pid, error = %err, "waiting on child failed");
                None
            }
        }
    }

    /// Send `signal` to the child. No-op once it has been reaped.
    pub fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        if self.exited {
            return Ok(());
        }
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid, signal) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Begin a graceful stop. Returns true the first time; the caller then
    /// closes the child's stdin stream(s).
    pub fn request_stop(&mut self, now: Instant) -> bool {
        if self.exited || self.stage != StopStage::Running {
            return false;
        }
        debug!(pid = self.pid, "stop requested");
        self.stage = StopStage::StdinClosed;
        self.stop_requested_at = Some(now);
        // A pty child sees hangup once every master descriptor is closed.
        self.pty_master = None;
        true
    }

    /// Advance a pending stop: SIGTERM once `term_after` has passed since
    /// the request, SIGKILL once `kill_after` more has passed.
    pub fn escalate(&mut self, now: Instant, term_after: Duration, kill_after: Duration) -> StopStage {
        let Some(requested) = self.stop_requested_at else {
            return self.stage;
        };
        if self.exited {
            return self.stage;
        }
        let elapsed = now.saturating_duration_since(requested);
        if self.stage == StopStage::StdinClosed && elapsed >= term_after {
            debug!(pid = self.pid, "sending SIGTERM");
            if let Err(err) = self.signal(libc::SIGTERM) {
                warn!(pid = self.pid, error = %err, "SIGTERM failed");
            }
            self.stage = StopStage::TermSent;
        }
        if self.stage == StopStage::TermSent && elapsed >= term_after + kill_after {
            debug!(pid = self.pid, "sending SIGKILL");
            if let Err(err) = self.signal(libc::SIGKILL) {
                warn!(pid = self.pid, error = %err, "SIGKILL failed");
            }
            self.stage = StopStage::KillSent;
        }
        self.stage
    }

    /// Drop the parent's own pty master descriptor. The child sees hangup
    /// once the stream handles are closed too.
    pub fn close_master(&mut self) {
        self.pty_master = None;
    }

    /// Whether a stop has been requested and the child is still around.
    pub fn is_stopping(&self) -> bool {
        !self.exited && self.stage != StopStage::Running
    }

    /// Resize a pty child's terminal.
    pub fn resize(&self, size: PtySize) -> io::Result<()> {
        match &self.pty_master {
            Some(master) => pty::set_size(master.as_raw_fd(), size),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "process has no terminal",
            )),
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("stage", &self.stage)
            .finish()
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[cfg(test)]
mod tests {
    use std::io::{ErrorKind, Read, Write};

    use super::*;

    fn wait_exit(process: &mut Process) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = process.try_reap() {
                return status;
            }
            assert!(Instant::now() < deadline, "child did not exit");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn read_all(handle: &mut IoHandle) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match handle.read(&mut buf) {
                Ok(0) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "no eof from child");
                    std::thread::sleep(Duration::from_millis(5));
                }
                // pty masters report EIO once the slave side is gone
                Err(_) => return out,
            }
        }
    }

    #[test]
    fn pipes_round_trip_through_cat() {
        let (mut process, streams) = Process::spawn(&SpawnOptions::new(["cat"])).unwrap();
        assert_eq!(process.status(), -1);
        let mut stdin = streams.stdin.unwrap();
        let mut stdout = streams.stdout.unwrap();

        stdin.write_all(b"meow\n").unwrap();
        drop(stdin);
        assert_eq!(read_all(&mut stdout), b"meow\n");
        assert_eq!(wait_exit(&mut process), 0);
        assert!(process.try_reap().is_none(), "status is reported once");
    }

    #[test]
    fn exit_code_and_env() {
        let options = SpawnOptions {
            env: Some(vec![("RPCMUX_TEST_VAR".to_string(), "42".to_string())]),
            ..SpawnOptions::new(["/bin/sh", "-c", "echo $RPCMUX_TEST_VAR; exit 3"])
        };
        let (mut process, streams) = Process::spawn(&options).unwrap();
        let mut stdout = streams.stdout.unwrap();
        assert_eq!(read_all(&mut stdout), b"42\n");
        assert_eq!(wait_exit(&mut process), 3);
    }

    #[test]
    fn null_stdio_gives_no_handles() {
        let options = SpawnOptions {
            stdin: StdioMode::Null,
            stdout: StdioMode::Null,
            stderr: StdioMode::Null,
            ..SpawnOptions::new(["true"])
        };
        let (mut process, streams) = Process::spawn(&options).unwrap();
        assert!(streams.stdin.is_none());
        assert!(streams.stdout.is_none());
        assert!(streams.stderr.is_none());
        assert_eq!(wait_exit(&mut process), 0);
    }

    #[test]
    fn spawn_failure_is_negative_errno() {
        let err = Process::spawn(&SpawnOptions::new(["/nonexistent/rpcmux-binary"]))
            .expect_err("spawn should fail");
        assert_eq!(err.status_code(), -libc::ENOENT);

        let empty = Process::spawn(&SpawnOptions::default()).expect_err("empty argv");
        assert!(empty.status_code() < 0);
    }

    #[test]
    fn stop_escalates_to_term() {
        let (mut process, _streams) =
            Process::spawn(&SpawnOptions::new(["sleep", "30"])).unwrap();
        let start = Instant::now();
        assert!(process.request_stop(start));
        assert!(!process.request_stop(start));
        assert_eq!(process.stop_stage(), StopStage::StdinClosed);

        let stage = process.escalate(
            start + Duration::from_millis(10),
            Duration::from_millis(5),
            Duration::from_secs(60),
        );
        assert_eq!(stage, StopStage::TermSent);
        assert_eq!(wait_exit(&mut process), 128 + libc::SIGTERM);
        assert!(!process.is_stopping());
    }

    fn read_until(handle: &mut IoHandle, marker: &[u8]) {
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(10);
        while !seen.windows(marker.len()).any(|w| w == marker) {
            assert!(Instant::now() < deadline, "marker never arrived");
            match handle.read(&mut buf) {
                Ok(0) => panic!("eof before marker"),
                Ok(n) => seen.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    #[test]
    fn kill_after_both_timeouts() {
        let options = SpawnOptions::new([
            "/bin/sh",
            "-c",
            "trap '' TERM; echo ready; exec sleep 30",
        ]);
        let (mut process, streams) = Process::spawn(&options).unwrap();
        let mut stdout = streams.stdout.unwrap();
        // TERM must not land before the trap is in place.
        read_until(&mut stdout, b"ready");
        let start = Instant::now();
        process.request_stop(start);
        let stage = process.escalate(
            start + Duration::from_millis(20),
            Duration::from_millis(5),
            Duration::from_millis(5),
        );
        assert_eq!(stage, StopStage::KillSent);
        assert_eq!(wait_exit(&mut process), 128 + libc::SIGKILL);
    }

    #[test]
    fn pty_child_sees_a_terminal() {
        let options = SpawnOptions {
            pty: Some(PtySize {
                width: 90,
                height: 20,
            }),
            ..SpawnOptions::new(["/bin/sh", "-c", "test -t 0 && stty size"])
        };
        let (mut process, streams) = Process::spawn(&options).unwrap();
        assert_eq!(process.kind(), ProcessKind::Pty);
        assert!(process.tty_name().is_some());
        assert!(streams.stderr.is_none());

        process
            .resize(PtySize {
                width: 90,
                height: 20,
            })
            .unwrap();
        let mut stdout = streams.stdout.unwrap();
        let output = String::from_utf8_lossy(&read_all(&mut stdout)).into_owned();
        assert!(output.contains("20 90"), "unexpected output: {output:?}");
        assert_eq!(wait_exit(&mut process), 0);
    }
}
