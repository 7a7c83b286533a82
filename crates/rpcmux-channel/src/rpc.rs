//! Per-channel RPC state: decoder, call stack, subscriptions.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use rpcmux_frame::{Decoder, FrameConfig, Value};

/// Bookkeeping for one outstanding synchronous call.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub request_id: u32,
    pub returned: bool,
    pub errored: bool,
    pub result: Value,
}

impl CallFrame {
    fn new(request_id: u32) -> Self {
        Self {
            request_id,
            returned: false,
            errored: false,
            result: Value::Nil,
        }
    }
}

/// Client type names accepted from `set_client_info`.
const CLIENT_TYPES: &[&str] = &["remote", "msgpack-rpc", "ui", "embedder", "host", "plugin"];

/// RPC layer of a channel.
#[derive(Debug)]
pub struct RpcState {
    pub(crate) closed: bool,
    pub(crate) decoder: Decoder,
    pub(crate) next_request_id: u32,
    pub(crate) call_stack: Vec<CallFrame>,
    pub(crate) subscriptions: HashSet<String>,
    pub(crate) pending_notifications: VecDeque<Bytes>,
    pub(crate) client_info: Option<Vec<(Value, Value)>>,
    pub(crate) client_type: String,
}

impl RpcState {
    pub(crate) fn new(config: FrameConfig) -> Self {
        Self {
            closed: false,
            decoder: Decoder::with_config(config),
            next_request_id: 1,
            call_stack: Vec::new(),
            subscriptions: HashSet::new(),
            pending_notifications: VecDeque::new(),
            client_info: None,
            client_type: "unknown".to_string(),
        }
    }

    /// Allocate the next request id and push its frame.
    pub(crate) fn push_call(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        self.call_stack.push(CallFrame::new(id));
        id
    }

    /// Remove the frame for `request_id`.
    pub(crate) fn pop_call(&mut self, request_id: u32) -> Option<CallFrame> {
        let pos = self
            .call_stack
            .iter()
            .rposition(|frame| frame.request_id == request_id)?;
        Some(self.call_stack.remove(pos))
    }

    pub(crate) fn frame_returned(&self, request_id: u32) -> bool {
        self.call_stack
            .iter()
            .rev()
            .find(|frame| frame.request_id == request_id)
            .is_none_or(|frame| frame.returned)
    }

    /// Resolve the most recent unanswered frame with a response.
    ///
    /// Fails (leaving the stack untouched) when there is no unanswered frame
    /// or its id differs from `request_id`.
    pub(crate) fn resolve(&mut self, request_id: u32, error: Value, result: Value) -> bool {
        let Some(frame) = self.call_stack.iter_mut().rev().find(|frame| !frame.returned) else {
            return false;
        };
        if frame.request_id != request_id {
            return false;
        }
        frame.returned = true;
        if error.is_nil() {
            frame.result = result;
        } else {
            frame.errored = true;
            frame.result = error;
        }
        true
    }

    /// Fail every unanswered frame with `message`, oldest first.
    pub(crate) fn fail_all(&mut self, message: &str) {
        for frame in self.call_stack.iter_mut().filter(|frame| !frame.returned) {
            frame.returned = true;
            frame.errored = true;
            frame.result = Value::from(message);
        }
    }

    /// Whether a synchronous call is outstanding.
    pub(crate) fn has_pending_calls(&self) -> bool {
        !self.call_stack.is_empty()
    }

    /// Store client info and derive the client type from its `type` key.
    pub(crate) fn set_client_info(&mut self, info: Vec<(Value, Value)>) {
        self.client_type = info
            .iter()
            .find(|(key, _)| key.as_str() == Some("type"))
            .and_then(|(_, value)| value.as_str())
            .filter(|kind| CLIENT_TYPES.contains(kind))
            .unwrap_or("unknown")
            .to_string();
        self.client_info = Some(info);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn client_type(&self) -> &str {
        &self.client_type
    }

    pub fn pending_notifications(&self) -> usize {
        self.pending_notifications.len()
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.subscriptions.contains(event)
    }
}
