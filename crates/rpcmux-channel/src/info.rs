//! Channel introspection.

use rpcmux_frame::Value;
use serde::{Serialize, Serializer};

use crate::channel::{Channel, ChannelId, Mode, StreamKind, Transport};
use crate::error::{ChannelError, Result};
use crate::runtime::Runtime;

/// Snapshot of one channel, as reported to management clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub stream: StreamKind,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<u64>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_client"
    )]
    pub client: Option<Vec<(Value, Value)>>,
}

fn serialize_client<S: Serializer>(
    client: &Option<Vec<(Value, Value)>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match client {
        Some(map) => value_to_json(&Value::Map(map.clone())).serialize(serializer),
        None => serializer.serialize_none(),
    }
}

impl ChannelInfo {
    pub(crate) fn from_channel(channel: &Channel) -> Self {
        let (pty, argv) = match &channel.transport {
            Transport::Process(job) | Transport::Pty(job) => (
                job.process.tty_name().map(str::to_string),
                Some(job.process.argv().to_vec()),
            ),
            _ => (None, None),
        };
        let address = match &channel.transport {
            Transport::Socket(duplex) => duplex.address.clone(),
            _ => None,
        };
        Self {
            id: channel.id,
            stream: channel.stream_kind(),
            mode: channel.mode(),
            pty,
            argv,
            address,
            buffer: channel.buffer,
            client: channel.rpc.as_ref().and_then(|rpc| rpc.client_info.clone()),
        }
    }

    /// msgpack map form, as returned by `get_channel_info`.
    pub fn to_value(&self) -> Value {
        let mut map = vec![
            (Value::from("id"), Value::from(self.id)),
            (Value::from("stream"), Value::from(self.stream.as_str())),
            (Value::from("mode"), Value::from(self.mode.as_str())),
        ];
        if let Some(pty) = &self.pty {
            map.push((Value::from("pty"), Value::from(pty.as_str())));
        }
        if let Some(argv) = &self.argv {
            let argv = argv.iter().map(|arg| Value::from(arg.as_str())).collect();
            map.push((Value::from("argv"), Value::Array(argv)));
        }
        if let Some(address) = &self.address {
            map.push((Value::from("address"), Value::from(address.as_str())));
        }
        if let Some(buffer) = self.buffer {
            map.push((Value::from("buffer"), Value::from(buffer)));
        }
        if let Some(client) = &self.client {
            map.push((Value::from("client"), Value::Map(client.clone())));
        }
        Value::Map(map)
    }
}

/// Convert a msgpack value to JSON. Binary becomes an array of bytes, map
/// keys are stringified, non-finite floats become null.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => serde_json::Value::from(u),
            (None, Some(i)) => serde_json::Value::from(i),
            _ => serde_json::Value::Null,
        },
        Value::F32(f) => serde_json::Number::from_f64(f64::from(*f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) => {
            serde_json::Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        Value::Binary(bytes) => {
            serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(key, value)| {
                    let key = match key {
                        Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                        other => other.to_string(),
                    };
                    (key, value_to_json(value))
                })
                .collect(),
        ),
        Value::Ext(_, bytes) => {
            serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
        }
    }
}

/// Convert JSON to a msgpack value.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::from(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(key, value)| (Value::from(key.as_str()), json_to_value(value)))
                .collect(),
        ),
    }
}

impl Runtime {
    pub fn channel_info(&self, id: ChannelId) -> Option<ChannelInfo> {
        self.channels.get(id).map(ChannelInfo::from_channel)
    }

    /// Info for every live channel, sorted by id.
    pub fn all_channel_info(&self) -> Vec<ChannelInfo> {
        self.channels.iter().map(ChannelInfo::from_channel).collect()
    }

    /// Store client-provided info on an rpc channel.
    pub fn set_client_info(&mut self, id: ChannelId, info: Vec<(Value, Value)>) -> Result<()> {
        let rpc = self
            .channels
            .get_mut(id)
            .ok_or(ChannelError::InvalidChannel(id))?
            .rpc
            .as_mut()
            .ok_or(ChannelError::NotRpc(id))?;
        rpc.set_client_info(info);
        tracing::debug!(id, client_type = rpc.client_type(), "client info set");
        Ok(())
    }

    /// Associate an opaque buffer handle; the channel then reports mode
    /// `terminal` (unless it is an rpc channel).
    pub fn attach_buffer(&mut self, id: ChannelId, buffer: u64) -> Result<()> {
        let channel = self
            .channels
            .get_mut(id)
            .ok_or(ChannelError::InvalidChannel(id))?;
        channel.buffer = Some(buffer);
        Ok(())
    }
}
