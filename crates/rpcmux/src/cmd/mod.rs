use std::time::Duration;

use clap::{Args, Subcommand};
use rpcmux_channel::{json_to_value, LISTEN_ADDRESS_ENV};
use rpcmux_frame::Value;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod channels;
pub mod run;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve msgpack-RPC on a socket (or stdio) until interrupted.
    Serve(ServeArgs),
    /// Call a method and print its result.
    Call(CallArgs),
    /// Send a notification.
    Notify(NotifyArgs),
    /// List the channels of a running server.
    Channels(ChannelsArgs),
    /// Run a command as a job, relaying its output, and exit with its status.
    Run(RunArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run_call(args, format),
        Command::Notify(args) => call::run_notify(args),
        Command::Channels(args) => channels::run(args, format),
        Command::Run(args) => run::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on: a socket path or host:port (port 0 picks one).
    #[arg(env = LISTEN_ADDRESS_ENV)]
    pub address: Option<String>,
    /// Also serve msgpack-RPC on this process' stdin/stdout.
    #[arg(long)]
    pub stdio: bool,
    /// Time allowed for jobs and connections to shut down (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub teardown_timeout: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Server address (socket path or host:port).
    pub address: String,
    /// Method to call.
    pub method: String,
    /// Arguments as a JSON array (a single non-array value is wrapped).
    #[arg(long, default_value = "[]")]
    pub args: String,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Server address (socket path or host:port).
    pub address: String,
    /// Event name.
    pub event: String,
    /// Arguments as a JSON array (a single non-array value is wrapped).
    #[arg(long, default_value = "[]")]
    pub args: String,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ChannelsArgs {
    /// Server address (socket path or host:port).
    pub address: String,
    /// Maximum time to wait for the listing (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run on a pseudo-terminal.
    #[arg(long)]
    pub pty: bool,
    /// Give up after this long (e.g. 30s); the job is stopped then.
    #[arg(long)]
    pub timeout: Option<String>,
    /// Command and arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub argv: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

/// Parse `--args`: a JSON array becomes the parameter list, anything else a
/// single parameter.
pub fn parse_args(input: &str) -> CliResult<Vec<Value>> {
    let json: serde_json::Value = serde_json::from_str(input)
        .map_err(|err| CliError::new(USAGE, format!("--args is not valid JSON: {err}")))?;
    Ok(match json {
        serde_json::Value::Array(items) => items.iter().map(json_to_value).collect(),
        other => vec![json_to_value(&other)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn args_wrap_scalars() {
        assert_eq!(
            parse_args("[1, \"two\"]").unwrap(),
            vec![Value::from(1), Value::from("two")]
        );
        assert_eq!(parse_args("{\"k\": 1}").unwrap().len(), 1);
        assert!(parse_args("[1,").is_err());
    }
}
