use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rpcmux_channel::{
    JobOptions, OutputCallback, PtySize, Runtime, RuntimeConfig, SpawnOptions, StdioMode, Timeout,
    WAIT_INTERRUPTED, WAIT_TIMEOUT,
};

use crate::cmd::{parse_duration, RunArgs};
use crate::exit::{channel_error, CliError, CliResult, INTERNAL, TIMEOUT};

/// Exit status reported after Ctrl-C, as a shell would.
const INTERRUPTED_STATUS: i32 = 130;

pub fn run(args: RunArgs) -> CliResult<i32> {
    let timeout = match &args.timeout {
        Some(timeout) => Timeout::After(parse_duration(timeout)?),
        None => Timeout::Forever,
    };
    let mut rt = Runtime::new(RuntimeConfig::default())
        .map_err(|err| channel_error("runtime setup failed", err))?;

    let mut spawn = SpawnOptions::new(args.argv.iter().cloned());
    if args.pty {
        spawn.pty = Some(PtySize::default());
    } else {
        spawn.stdin = StdioMode::Null;
    }
    let options = JobOptions {
        on_stdout: Some(relay(std::io::stdout)),
        on_stderr: Some(relay(std::io::stderr)),
        ..JobOptions::new(spawn)
    };
    let id = rt
        .job_start(options)
        .map_err(|err| channel_error("failed to start job", err))?;
    tracing::debug!(id, argv = ?args.argv, "job started");

    install_ctrlc_handler(rt.interrupt_handle())?;

    let status = rt.job_wait(&[id], timeout)[0];
    let code = match status {
        WAIT_TIMEOUT => {
            let _ = rt.job_stop(id);
            finish(&mut rt, id);
            return Err(CliError::new(TIMEOUT, "job timed out"));
        }
        WAIT_INTERRUPTED => {
            finish(&mut rt, id);
            INTERRUPTED_STATUS
        }
        status => status,
    };
    let _ = rt.teardown();
    Ok(code)
}

/// Wait (bounded by the stop escalation) for a stopped job to go away.
fn finish(rt: &mut Runtime, id: u64) {
    let config = rt.config();
    let budget = config.stop_term_timeout + config.stop_kill_timeout + config.stop_kill_timeout;
    let _ = rt.job_wait(&[id], Timeout::After(budget));
}

fn relay<W: Write + 'static>(target: fn() -> W) -> OutputCallback {
    Rc::new(move |_: &mut Runtime, _: u64, data: &[u8], _: bool| {
        let mut out = target();
        let _ = out.write_all(data);
        let _ = out.flush();
    })
}

fn install_ctrlc_handler(interrupted: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        interrupted.store(true, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
