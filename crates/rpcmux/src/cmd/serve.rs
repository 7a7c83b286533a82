use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rpcmux_channel::{RpcError, Runtime, RuntimeConfig, StreamOptions, Timeout, Value, STDIO_ID};
use rpcmux_event::LoopHandle;

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{channel_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_listening, OutputFormat};

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = RuntimeConfig {
        teardown_timeout: parse_duration(&args.teardown_timeout)?,
        ..RuntimeConfig::default()
    };
    let mut rt = Runtime::new(config).map_err(|err| channel_error("runtime setup failed", err))?;
    register_handlers(&mut rt);

    let stdio = if args.stdio {
        Some(
            rt.from_stdio(StreamOptions::rpc())
                .map_err(|err| channel_error("stdio setup failed", err))?,
        )
    } else {
        None
    };

    match rt
        .server_init(args.address.as_deref())
        .map_err(|err| channel_error("listen failed", err))?
    {
        // Stdout carries the rpc stream in stdio mode.
        Some(address) if stdio.is_some() => tracing::info!(%address, "listening"),
        Some(address) => print_listening(&address, format),
        None if stdio.is_some() => {}
        None => {
            return Err(CliError::new(
                USAGE,
                "no address given and RPCMUX_LISTEN_ADDRESS is not set",
            ))
        }
    }

    let interrupted = rt.interrupt_handle();
    install_ctrlc_handler(interrupted.clone(), rt.loop_handle())?;

    rt.run_until(Timeout::Forever, |rt| {
        interrupted.load(Ordering::SeqCst) || (stdio.is_some() && stdio_done(rt))
    });
    interrupted.store(false, Ordering::SeqCst);
    tracing::info!("shutting down");

    rt.teardown()
        .map_err(|err| channel_error("teardown failed", err))?;
    Ok(SUCCESS)
}

fn stdio_done(rt: &Runtime) -> bool {
    rt.channel(STDIO_ID).is_none_or(|channel| channel.is_closed())
}

/// Built-ins plus the methods this server adds: `echo` returns its
/// arguments, `broadcast(event, ...)` notifies every subscriber.
fn register_handlers(rt: &mut Runtime) {
    rt.register_handler("echo", true, |_, _, args| Ok(Value::Array(args)));
    rt.register_handler("broadcast", false, |rt, _, mut args| {
        if args.is_empty() {
            return Err(RpcError::validation(
                "Wrong number of arguments: expecting at least 1 but got 0",
            ));
        }
        let event = match args.remove(0) {
            Value::String(name) => name
                .into_str()
                .ok_or_else(|| RpcError::validation("event name is not valid UTF-8"))?,
            _ => return Err(RpcError::validation("Expected event (string) at argument 0")),
        };
        Ok(Value::from(rt.broadcast(&event, args)))
    });
}

fn install_ctrlc_handler(interrupted: Arc<AtomicBool>, handle: LoopHandle<Runtime>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        interrupted.store(true, Ordering::SeqCst);
        // Wake the loop so the flag is seen.
        let _ = handle.schedule(Box::new(|_| {}));
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_and_broadcast_are_registered() {
        let mut rt = Runtime::new(RuntimeConfig {
            listen_env_var: "RPCMUX_SERVE_UNIT_TEST".to_string(),
            ..RuntimeConfig::default()
        })
        .unwrap();
        register_handlers(&mut rt);
        let id = rt.open_loopback();

        assert_eq!(
            rt.send_call(id, "echo", vec![Value::from(1), Value::from("x")]),
            Ok(Value::Array(vec![Value::from(1), Value::from("x")]))
        );
        rt.send_call(id, "subscribe", vec![Value::from("news")])
            .unwrap();
        assert_eq!(
            rt.send_call(id, "broadcast", vec![Value::from("news"), Value::from(1)]),
            Ok(Value::from(1))
        );
        assert_eq!(
            rt.send_call(id, "broadcast", vec![]).unwrap_err().kind,
            rpcmux_channel::ErrorKind::Validation
        );
    }
}
