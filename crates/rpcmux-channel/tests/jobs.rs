//! Job channels over real child processes.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rpcmux_channel::{
    ChannelError, ChannelPart, JobOptions, Mode, OutputCallback, PtySize, Runtime, RuntimeConfig,
    SpawnOptions, StreamKind, Timeout, Value, STDERR_ID, WAIT_INTERRUPTED, WAIT_INVALID,
    WAIT_TIMEOUT,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn config() -> RuntimeConfig {
    RuntimeConfig {
        listen_env_var: format!("RPCMUX_JOBS_TEST_{}", COUNTER.fetch_add(1, Ordering::SeqCst)),
        stop_term_timeout: Duration::from_millis(50),
        stop_kill_timeout: Duration::from_millis(50),
        reap_interval: Duration::from_millis(5),
        ..RuntimeConfig::default()
    }
}

fn runtime() -> Runtime {
    Runtime::new(config()).unwrap()
}

fn sh(script: &str) -> SpawnOptions {
    SpawnOptions::new(["sh", "-c", script])
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    eof: bool,
}

fn capture() -> (Rc<RefCell<Captured>>, OutputCallback) {
    let captured = Rc::new(RefCell::new(Captured::default()));
    let sink = Rc::clone(&captured);
    let callback: OutputCallback = Rc::new(move |_: &mut Runtime, _: u64, data: &[u8], eof: bool| {
        let mut captured = sink.borrow_mut();
        captured.bytes.extend_from_slice(data);
        captured.eof |= eof;
    });
    (captured, callback)
}

const FIVE_SECONDS: Timeout = Timeout::After(Duration::from_secs(5));

#[test]
fn raw_job_round_trip() {
    let mut rt = runtime();
    let (stdout, on_stdout) = capture();
    let exits = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&exits);

    let options = JobOptions {
        on_stdout: Some(on_stdout),
        on_exit: Some(Rc::new(move |_: &mut Runtime, id: u64, status: i32| {
            sink.borrow_mut().push((id, status))
        })),
        ..JobOptions::new(SpawnOptions::new(["cat"]))
    };
    let id = rt.job_start(options).unwrap();
    assert!(rt.job_running(id));
    assert!(rt.job_pid(id).unwrap() > 0);

    assert_eq!(rt.send_raw(id, b"hello\n").unwrap(), 6);
    assert!(matches!(
        rt.close(id, ChannelPart::Rpc),
        Err(ChannelError::InvalidStream)
    ));
    rt.close(id, ChannelPart::Stdin).unwrap();
    assert!(matches!(
        rt.send_raw(id, b"late"),
        Err(ChannelError::ClosedStream)
    ));

    assert_eq!(rt.job_wait(&[id], FIVE_SECONDS), vec![0]);
    assert_eq!(stdout.borrow().bytes, b"hello\n");
    assert!(stdout.borrow().eof);
    assert_eq!(*exits.borrow(), vec![(id, 0)]);

    // Exit and both streams done: the channel goes away.
    assert!(rt.run_until(FIVE_SECONDS, |rt| rt.channel(id).is_none()));
}

#[test]
fn exit_status_and_stderr_are_reported() {
    let mut rt = runtime();
    let (stderr, on_stderr) = capture();
    let options = JobOptions {
        on_stderr: Some(on_stderr),
        ..JobOptions::new(sh("echo oops >&2; exit 7"))
    };
    let id = rt.job_start(options).unwrap();
    assert_eq!(rt.job_wait(&[id], FIVE_SECONDS), vec![7]);
    assert_eq!(stderr.borrow().bytes, b"oops\n");
    assert!(stderr.borrow().eof);
    assert!(!rt.job_running(id));
}

#[test]
fn output_written_just_before_exit_is_not_lost() {
    let mut rt = runtime();
    let (stdout, on_stdout) = capture();
    let options = JobOptions {
        on_stdout: Some(on_stdout),
        ..JobOptions::new(sh("i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done"))
    };
    let id = rt.job_start(options).unwrap();
    assert_eq!(rt.job_wait(&[id], FIVE_SECONDS), vec![0]);
    let text = String::from_utf8(stdout.borrow().bytes.clone()).unwrap();
    assert_eq!(text.lines().count(), 200);
    assert!(text.ends_with("line199\n"));
}

#[test]
fn spawn_failure_reports_errno_and_reuses_id() {
    let mut rt = runtime();
    let before = rt.channels().next_id();
    let err = rt
        .job_start(JobOptions::new(SpawnOptions::new(["/nonexistent/rpcmux-test-binary"])))
        .unwrap_err();
    match err {
        ChannelError::Event(err) => assert_eq!(err.status_code(), -libc::ENOENT),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(rt.channels().next_id(), before);
    assert!(rt.channel(before).is_none());
}

#[test]
fn pty_and_rpc_are_exclusive() {
    let mut rt = runtime();
    let mut options = JobOptions::rpc(["cat"]);
    options.spawn.pty = Some(PtySize::default());
    assert!(matches!(
        rt.job_start(options),
        Err(ChannelError::PtyWithRpc)
    ));
}

#[test]
fn rpc_job_talks_to_itself_through_cat() {
    // cat echoes the request back; we answer it, and cat echoes the answer.
    let mut rt = runtime();
    let id = rt.job_start(JobOptions::rpc(["cat"])).unwrap();
    assert_eq!(rt.channel(id).map(|c| c.mode()), Some(Mode::Rpc));
    assert_eq!(rt.send_call(id, "get_channel_id", vec![]), Ok(Value::from(id)));

    assert!(matches!(
        rt.send_raw(id, b"raw"),
        Err(ChannelError::RawToRpc)
    ));
    assert!(matches!(
        rt.close(id, ChannelPart::Stdout),
        Err(ChannelError::InvalidRpcStream)
    ));
    rt.close(id, ChannelPart::Rpc).unwrap();
    assert_eq!(rt.job_wait(&[id], FIVE_SECONDS), vec![0]);
}

#[test]
fn wait_reports_timeouts_and_invalid_ids() {
    let mut rt = runtime();
    let id = rt.job_start(JobOptions::new(SpawnOptions::new(["sleep", "30"]))).unwrap();
    let loopback = rt.open_loopback();

    let results = rt.job_wait(
        &[id, 999, loopback],
        Timeout::After(Duration::from_millis(50)),
    );
    assert_eq!(results, vec![WAIT_TIMEOUT, WAIT_INVALID, WAIT_INVALID]);
    assert!(rt.job_running(id));

    rt.job_stop(id).unwrap();
    let status = rt.job_wait(&[id], FIVE_SECONDS)[0];
    assert_ne!(status, WAIT_TIMEOUT);
    assert!(!rt.job_running(id));
}

#[test]
fn interrupted_wait_stops_jobs() {
    let mut rt = runtime();
    let id = rt.job_start(JobOptions::new(SpawnOptions::new(["sleep", "30"]))).unwrap();

    rt.interrupt_handle().store(true, Ordering::SeqCst);
    assert_eq!(rt.job_wait(&[id], Timeout::Forever), vec![WAIT_INTERRUPTED]);
    assert!(!rt.interrupt_handle().load(Ordering::SeqCst));

    // The interrupt asked the job to stop; it goes down without further help.
    let status = rt.job_wait(&[id], FIVE_SECONDS)[0];
    assert_ne!(status, WAIT_TIMEOUT);
}

#[test]
fn stop_escalates_to_kill() {
    let mut rt = runtime();
    let id = rt
        .job_start(JobOptions::new(sh("trap '' TERM; exec sleep 30")))
        .unwrap();
    // Give the shell a moment to install the trap.
    rt.run_until(Timeout::After(Duration::from_millis(100)), |_| false);

    rt.job_stop(id).unwrap();
    let status = rt.job_wait(&[id], FIVE_SECONDS)[0];
    assert_ne!(status, WAIT_TIMEOUT);
    assert!(!rt.has_children());
}

#[test]
fn teardown_stops_everything() {
    let mut rt = runtime();
    let stubborn = rt
        .job_start(JobOptions::new(sh("trap '' TERM; exec sleep 30")))
        .unwrap();
    let polite = rt.job_start(JobOptions::new(SpawnOptions::new(["cat"]))).unwrap();
    rt.open_loopback();
    rt.run_until(Timeout::After(Duration::from_millis(100)), |_| false);

    rt.teardown().unwrap();
    assert!(!rt.has_children());
    assert!(rt.channel(stubborn).is_none_or(|c| c.is_closed()));
    assert!(rt.channel(polite).is_none_or(|c| c.is_closed()));
}

#[test]
fn pty_job_reports_terminal_and_resizes() {
    let mut rt = runtime();
    let mut spawn = SpawnOptions::new(["cat"]);
    spawn.pty = Some(PtySize {
        width: 80,
        height: 24,
    });
    let (stdout, on_stdout) = capture();
    let options = JobOptions {
        on_stdout: Some(on_stdout),
        ..JobOptions::new(spawn)
    };
    let id = rt.job_start(options).unwrap();

    let info = rt.channel_info(id).unwrap();
    assert_eq!(info.stream, StreamKind::Job);
    assert!(info.pty.as_deref().is_some_and(|name| name.starts_with("/dev/")));
    assert_eq!(info.argv, Some(vec!["cat".to_string()]));
    rt.job_resize(id, 120, 40).unwrap();

    rt.send_raw(id, b"ping\n").unwrap();
    assert!(rt.run_until(FIVE_SECONDS, |_| {
        String::from_utf8_lossy(&stdout.borrow().bytes).contains("ping")
    }));

    rt.job_stop(id).unwrap();
    assert_ne!(rt.job_wait(&[id], FIVE_SECONDS)[0], WAIT_TIMEOUT);
}

#[test]
fn resize_requires_a_pty() {
    let mut rt = runtime();
    let id = rt.job_start(JobOptions::new(SpawnOptions::new(["cat"]))).unwrap();
    assert!(matches!(
        rt.job_resize(id, 10, 10),
        Err(ChannelError::InvalidStream)
    ));
    let loopback = rt.open_loopback();
    assert!(matches!(
        rt.job_resize(loopback, 10, 10),
        Err(ChannelError::NotJob(_))
    ));
    rt.close(id, ChannelPart::All).unwrap();
    assert_eq!(rt.job_wait(&[id], FIVE_SECONDS), vec![0]);
}

#[test]
fn stderr_channel_closes_once() {
    let mut rt = runtime();
    assert_eq!(
        rt.channel(STDERR_ID).map(|c| c.stream_kind()),
        Some(StreamKind::Stderr)
    );
    assert!(matches!(
        rt.close(STDERR_ID, ChannelPart::Rpc),
        Err(ChannelError::InvalidStream)
    ));
    rt.close(STDERR_ID, ChannelPart::Stderr).unwrap();
    assert!(matches!(
        rt.send_raw(STDERR_ID, b"x"),
        Err(ChannelError::ClosedStream)
    ));
    rt.close(STDERR_ID, ChannelPart::All).unwrap();
}

#[test]
fn attached_buffer_switches_mode_to_terminal() {
    let mut rt = runtime();
    let id = rt.job_start(JobOptions::new(SpawnOptions::new(["cat"]))).unwrap();
    assert_eq!(rt.channel(id).map(|c| c.mode()), Some(Mode::Bytes));

    rt.attach_buffer(id, 17).unwrap();
    let info = rt.channel_info(id).unwrap();
    assert_eq!(info.mode, Mode::Terminal);
    assert_eq!(info.buffer, Some(17));
    assert!(matches!(
        rt.attach_buffer(999, 1),
        Err(ChannelError::InvalidChannel(999))
    ));

    rt.close(id, ChannelPart::All).unwrap();
    assert_eq!(rt.job_wait(&[id], FIVE_SECONDS), vec![0]);
}

#[test]
fn exit_flush_stops_when_a_grandchild_keeps_writing() {
    let mut rt = runtime();
    let (stdout, on_stdout) = capture();
    let options = JobOptions {
        on_stdout: Some(on_stdout),
        ..JobOptions::new(sh("yes flood & sleep 0.2; exit 0"))
    };
    let id = rt.job_start(options).unwrap();
    assert_eq!(rt.job_wait(&[id], FIVE_SECONDS), vec![0]);
    assert!(stdout.borrow().eof);
    assert!(stdout.borrow().bytes.starts_with(b"flood\n"));
}
