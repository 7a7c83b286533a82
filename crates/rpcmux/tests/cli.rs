#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Output, Stdio};
use std::time::Duration;

use rpcmux_frame::{Message, MessageReader, MessageWriter, Value};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/rpcmux-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn rpcmux() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_rpcmux"));
    command
        .env_remove("RPCMUX_LISTEN_ADDRESS")
        .env_remove("RPCMUX_LOG")
        .args(["--log-level", "error", "--format", "json"]);
    command
}

struct Server {
    child: Child,
    address: String,
    _stdout: BufReader<ChildStdout>,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Start `rpcmux serve <address>` and wait for its listening line.
fn serve(address: &str) -> Server {
    let mut child = rpcmux()
        .arg("serve")
        .arg(address)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve should start");
    let mut stdout = BufReader::new(child.stdout.take().expect("stdout is piped"));
    let mut line = String::new();
    stdout
        .read_line(&mut line)
        .expect("serve should announce its address");
    let announced: serde_json::Value =
        serde_json::from_str(&line).expect("listening line should be json");
    assert_eq!(announced["event"], "listening");
    let address = announced["address"]
        .as_str()
        .expect("address should be a string")
        .to_string();
    Server {
        child,
        address,
        _stdout: stdout,
    }
}

fn run(command: &mut Command) -> Output {
    command.output().expect("rpcmux should run")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).expect("stdout should be json")
}

#[test]
fn call_echo_over_unix_socket() {
    let dir = unique_temp_dir("echo");
    let socket = dir.join("serve.sock");
    let server = serve(socket.to_str().unwrap());
    assert_eq!(server.address, socket.to_str().unwrap());

    let output = run(rpcmux()
        .args(["call", &server.address, "echo", "--args"])
        .arg(r#"[1, "two", {"three": 3}]"#));
    assert!(output.status.success(), "{output:?}");
    let json = stdout_json(&output);
    assert_eq!(json["method"], "echo");
    assert_eq!(json["result"], serde_json::json!([1, "two", {"three": 3}]));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn call_over_tcp_with_chosen_port() {
    let server = serve("127.0.0.1:0");
    assert!(!server.address.ends_with(":0"));

    let output = run(rpcmux().args(["call", &server.address, "get_channel_id"]));
    assert!(output.status.success(), "{output:?}");
    let id = stdout_json(&output)["result"].as_u64().expect("id is a number");
    assert!(id >= 3);
}

#[test]
fn failing_call_exits_1() {
    let dir = unique_temp_dir("fail");
    let socket = dir.join("serve.sock");
    let server = serve(socket.to_str().unwrap());

    let output = run(rpcmux().args(["call", &server.address, "no_such_method"]));
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid method: no_such_method"), "{stderr}");

    let output = run(rpcmux()
        .args(["call", &server.address, "get_channel_info", "--args"])
        .arg("[1, 2]"));
    assert_eq!(output.status.code(), Some(1));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn channels_lists_the_caller() {
    let dir = unique_temp_dir("channels");
    let socket = dir.join("serve.sock");
    let server = serve(socket.to_str().unwrap());

    let notify = run(rpcmux()
        .args(["notify", &server.address, "anything", "--args"])
        .arg("[true]"));
    assert!(notify.status.success(), "{notify:?}");

    let output = run(rpcmux().args(["channels", &server.address]));
    assert!(output.status.success(), "{output:?}");
    let listing = stdout_json(&output);
    let rows = listing.as_array().expect("listing is an array");
    assert_eq!(rows[0]["id"], 2);
    assert_eq!(rows[0]["stream"], "stderr");
    let me = rows
        .iter()
        .find(|row| row["client"]["name"] == "rpcmux-cli")
        .expect("the listing includes the caller");
    assert_eq!(me["stream"], "socket");
    assert_eq!(me["mode"], "rpc");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn serve_over_stdio() {
    let mut child = rpcmux()
        .args(["serve", "--stdio"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve should start");

    let mut writer = MessageWriter::new(child.stdin.take().expect("stdin is piped"));
    let mut reader = MessageReader::new(child.stdout.take().expect("stdout is piped"));
    writer
        .request(1, "echo", vec![Value::from("over stdio")])
        .expect("request should be written");
    let Message::Response { id, error, result } = reader.read_message().expect("response") else {
        panic!("expected a response");
    };
    assert_eq!(id, 1);
    assert_eq!(error, Value::Nil);
    assert_eq!(result, Value::Array(vec![Value::from("over stdio")]));

    writer
        .request(2, "get_channel_id", vec![])
        .expect("request should be written");
    let Message::Response { result, .. } = reader.read_message().expect("response") else {
        panic!("expected a response");
    };
    assert_eq!(result, Value::from(1));

    // Closing stdin ends the server.
    drop(writer);
    let status = child.wait().expect("serve should exit");
    assert!(status.success());
}

#[test]
fn serve_without_address_is_usage_error() {
    let output = run(rpcmux().arg("serve"));
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn call_to_missing_socket_is_transport_error() {
    let dir = unique_temp_dir("missing");
    let socket = dir.join("nobody.sock");
    let output = run(rpcmux().args(["call", socket.to_str().unwrap(), "echo"]));
    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_relays_output_and_status() {
    let output = run(rpcmux().args(["run", "--", "sh", "-c", "echo out; echo err >&2; exit 3"]));
    assert_eq!(output.status.code(), Some(3));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
    assert!(String::from_utf8_lossy(&output.stderr).contains("err\n"));
}

#[test]
fn run_timeout_returns_124() {
    let start = std::time::Instant::now();
    let output = run(rpcmux().args(["run", "--timeout", "200ms", "--", "sleep", "30"]));
    assert_eq!(output.status.code(), Some(124));
    assert!(start.elapsed() < Duration::from_secs(20));
}

#[test]
fn version_prints_name() {
    let output = run(rpcmux().arg("version"));
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("rpcmux "));

    let output = run(rpcmux().args(["version", "--extended"]));
    assert!(String::from_utf8_lossy(&output.stdout).contains("listen_env: RPCMUX_LISTEN_ADDRESS"));
}
