use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use rpcmux_channel::value_to_json;
use rpcmux_frame::Value;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ResultOutput<'a> {
    method: &'a str,
    result: serde_json::Value,
}

/// Print the result of a call.
pub fn print_result(method: &str, result: &Value, format: OutputFormat) {
    let json = value_to_json(result);
    match format {
        OutputFormat::Json => {
            let out = ResultOutput {
                method,
                result: json,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "RESULT"])
                .add_row(vec![method.to_string(), json.to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string())
            );
        }
        OutputFormat::Raw => match result {
            Value::String(s) => print_raw(s.as_bytes()),
            Value::Binary(bytes) => print_raw(bytes),
            other => println!("{other}"),
        },
    }
}

/// Print the entries returned by `list_channels`.
pub fn print_channels(channels: &Value, format: OutputFormat) {
    let json = value_to_json(channels);
    let rows = json.as_array().cloned().unwrap_or_default();
    match format {
        OutputFormat::Json => println!("{json}"),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "STREAM", "MODE", "PEER", "CLIENT"]);
            for row in &rows {
                table.add_row(vec![
                    field(row, "id"),
                    field(row, "stream"),
                    field(row, "mode"),
                    peer(row),
                    row.get("client")
                        .and_then(|client| client.get("name"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("-")
                        .to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for row in &rows {
                println!(
                    "id={} stream={} mode={} peer={}",
                    field(row, "id"),
                    field(row, "stream"),
                    field(row, "mode"),
                    peer(row)
                );
            }
        }
    }
}

#[derive(Serialize)]
struct ListeningOutput<'a> {
    event: &'static str,
    address: &'a str,
    pid: u32,
}

/// Announce a listening address on stdout, one line, so scripts can pick it up.
pub fn print_listening(address: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ListeningOutput {
                event: "listening",
                address,
                pid: std::process::id(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Raw => println!("{address}"),
        OutputFormat::Table | OutputFormat::Pretty => println!("listening on {address}"),
    }
    let _ = std::io::stdout().flush();
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn field(row: &serde_json::Value, key: &str) -> String {
    match row.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

fn peer(row: &serde_json::Value) -> String {
    if let Some(address) = row.get("address").and_then(serde_json::Value::as_str) {
        return address.to_string();
    }
    if let Some(argv) = row.get("argv").and_then(serde_json::Value::as_array) {
        return argv
            .iter()
            .filter_map(serde_json::Value::as_str)
            .collect::<Vec<_>>()
            .join(" ");
    }
    "-".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_prefers_address_then_argv() {
        let socket = serde_json::json!({"id": 3, "address": "/tmp/s"});
        assert_eq!(peer(&socket), "/tmp/s");
        let job = serde_json::json!({"id": 4, "argv": ["sh", "-c", "true"]});
        assert_eq!(peer(&job), "sh -c true");
        assert_eq!(peer(&serde_json::json!({"id": 2})), "-");
    }

    #[test]
    fn field_renders_scalars() {
        let row = serde_json::json!({"id": 7, "mode": "rpc"});
        assert_eq!(field(&row, "id"), "7");
        assert_eq!(field(&row, "mode"), "rpc");
        assert_eq!(field(&row, "pty"), "-");
    }
}
