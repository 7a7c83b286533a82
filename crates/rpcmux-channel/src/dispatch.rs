//! msgpack-RPC over a channel: inbound dispatch, outbound calls and events.

use std::collections::HashMap;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use rpcmux_event::{process_events_until, QueueId, Timeout};
use rpcmux_frame::{encode_notification, encode_request, encode_response, Message, RpcError, Value};
use tracing::{debug, error, info, warn, Level};

use crate::channel::{ChannelId, ChannelPart, Transport};
use crate::rpc::RpcState;
use crate::runtime::Runtime;

/// Handler signature: runtime, calling channel, positional arguments.
pub type HandlerFn = dyn Fn(&mut Runtime, ChannelId, Vec<Value>) -> Result<Value, RpcError>;

/// Notification sent to a client whose notification failed.
pub const ERROR_EVENT: &str = "error_event";

/// A registered method.
#[derive(Clone)]
pub struct Handler {
    func: Rc<HandlerFn>,
    fast: bool,
}

impl Handler {
    /// Whether the handler runs inline instead of on the channel's queue.
    pub fn is_fast(&self) -> bool {
        self.fast
    }
}

/// Method name to handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` under `name`, replacing any previous handler.
    ///
    /// Fast handlers run as soon as the request is decoded, even while the
    /// runtime is blocked in a call; the rest are queued on the channel.
    pub fn register<F>(&mut self, name: impl Into<String>, fast: bool, func: F)
    where
        F: Fn(&mut Runtime, ChannelId, Vec<Value>) -> Result<Value, RpcError> + 'static,
    {
        self.handlers.insert(
            name.into(),
            Handler {
                func: Rc::new(func),
                fast,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("methods", &self.names())
            .finish()
    }
}

impl Runtime {
    /// Register a request handler (see [`HandlerTable::register`]).
    pub fn register_handler<F>(&mut self, name: impl Into<String>, fast: bool, func: F)
    where
        F: Fn(&mut Runtime, ChannelId, Vec<Value>) -> Result<Value, RpcError> + 'static,
    {
        self.handlers.register(name, fast, func);
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Attach RPC state to a channel. The rpc layer holds its own reference
    /// until it is closed.
    pub(crate) fn rpc_start(&mut self, id: ChannelId) {
        let frame_config = self.config.frame_config();
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        if channel.rpc.is_some() {
            return;
        }
        channel.rpc = Some(RpcState::new(frame_config));
        channel.refcount += 1;
        debug!(id, "rpc started");
    }

    /// Mark the rpc layer closed and drop its reference on the fast queue.
    pub(crate) fn rpc_close(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get_mut(id) else {
            return;
        };
        let is_stdio = matches!(channel.transport, Transport::Stdio(_));
        let Some(rpc) = channel.rpc.as_mut() else {
            return;
        };
        if rpc.closed {
            return;
        }
        rpc.closed = true;
        rpc.pending_notifications.clear();
        rpc.decoder.clear();
        if is_stdio {
            info!(id, "stdio rpc channel closed");
        } else {
            debug!(id, "rpc closed");
        }
        self.event_loop
            .put(QueueId::FAST, Box::new(move |rt: &mut Runtime| rt.decref(id)));
    }

    /// Fail every outstanding call with `message`, log it and close the rpc layer.
    pub(crate) fn close_with_error(&mut self, id: ChannelId, message: String, level: Level) {
        if let Some(rpc) = self.channels.get_mut(id).and_then(|c| c.rpc.as_mut()) {
            rpc.fail_all(&message);
        }
        if level == Level::ERROR {
            error!(id, "{message}");
        } else {
            info!(id, "{message}");
        }
        let _ = self.close(id, ChannelPart::Rpc);
    }

    /// Feed received bytes to the channel's decoder and handle every
    /// complete message.
    pub(crate) fn rpc_receive(&mut self, id: ChannelId, data: &[u8], eof: bool) {
        match self.channels.get_mut(id).and_then(|c| c.rpc.as_mut()) {
            Some(rpc) if !rpc.closed => {
                if !data.is_empty() {
                    rpc.decoder.feed(data);
                }
            }
            _ => return,
        }

        loop {
            let next = match self.channels.get_mut(id).and_then(|c| c.rpc.as_mut()) {
                Some(rpc) if !rpc.closed => rpc.decoder.next_message(),
                _ => return,
            };
            match next {
                Ok(Some(message)) => self.handle_message(id, message),
                Ok(None) => break,
                Err(err) => match err.request_id() {
                    Some(request_id) => {
                        warn!(id, request_id, error = %err, "rejecting invalid request");
                        self.send_response(id, request_id, Err(RpcError::validation(err.to_string())));
                    }
                    None => {
                        self.close_with_error(
                            id,
                            format!(
                                "ch {id}: invalid msgpack payload ({err}). \
                                 Client must send valid msgpack-rpc data"
                            ),
                            Level::ERROR,
                        );
                        return;
                    }
                },
            }
        }

        if eof {
            self.close_with_error(id, format!("ch {id} was closed by the client"), Level::INFO);
        }
    }

    fn handle_message(&mut self, id: ChannelId, message: Message) {
        match message {
            Message::Response {
                id: request_id,
                error,
                result,
            } => {
                let resolved = self
                    .channels
                    .get_mut(id)
                    .and_then(|c| c.rpc.as_mut())
                    .is_some_and(|rpc| rpc.resolve(request_id, error, result));
                if !resolved {
                    self.close_with_error(
                        id,
                        format!(
                            "ch {id} returned a response with an unknown request id {request_id}. \
                             Ensure the client is properly synchronized"
                        ),
                        Level::ERROR,
                    );
                }
            }
            Message::Request {
                id: request_id,
                method,
                params,
            } => self.handle_request(id, Some(request_id), method, params),
            Message::Notification { method, params } => {
                self.handle_request(id, None, method, params)
            }
        }
    }

    fn handle_request(
        &mut self,
        id: ChannelId,
        request_id: Option<u32>,
        method: String,
        params: Vec<Value>,
    ) {
        let handler = self.handlers.get(&method);
        // Unknown methods are answered right away.
        if handler.as_ref().is_none_or(Handler::is_fast) {
            self.run_request(id, request_id, &method, handler, params);
            return;
        }
        let Some(queue) = self.channels.get(id).map(|c| c.events) else {
            return;
        };
        self.event_loop.put(
            queue,
            Box::new(move |rt: &mut Runtime| rt.run_request(id, request_id, &method, handler, params)),
        );
    }

    fn run_request(
        &mut self,
        id: ChannelId,
        request_id: Option<u32>,
        method: &str,
        handler: Option<Handler>,
        params: Vec<Value>,
    ) {
        let result = match handler {
            Some(handler) => (handler.func)(self, id, params),
            None => Err(RpcError::exception(format!("Invalid method: {method}"))),
        };
        match request_id {
            Some(request_id) => self.send_response(id, request_id, result),
            None => {
                if let Err(err) = result {
                    warn!(id, method, error = %err, "notification handler failed");
                    // Never answer a failed error report with another one.
                    if method == ERROR_EVENT {
                        return;
                    }
                    self.send_event(
                        id,
                        ERROR_EVENT,
                        vec![Value::from(err.kind.code()), Value::from(err.message)],
                    );
                }
            }
        }
    }

    fn send_response(&mut self, id: ChannelId, request_id: u32, result: Result<Value, RpcError>) {
        let mut buf = BytesMut::new();
        match encode_response(request_id, result, &mut buf) {
            Ok(()) => {
                self.write_rpc(id, buf.freeze());
            }
            Err(err) => error!(id, request_id, error = %err, "failed to encode response"),
        }
    }

    /// Queue encoded bytes on an rpc channel. A failed write closes the
    /// rpc layer.
    pub(crate) fn write_rpc(&mut self, id: ChannelId, bytes: Bytes) -> bool {
        let Some(channel) = self.channels.get_mut(id) else {
            return false;
        };
        if channel.rpc.as_ref().is_none_or(RpcState::is_closed) {
            return false;
        }
        let queue = channel.events;
        let written = match &mut channel.transport {
            Transport::Internal { .. } => {
                channel.refcount += 1;
                self.event_loop.put(
                    queue,
                    Box::new(move |rt: &mut Runtime| rt.internal_read_event(id, bytes)),
                );
                true
            }
            Transport::Stderr { .. } => false,
            transport => transport
                .write_stream()
                .is_some_and(|stream| stream.write(bytes)),
        };
        if !written {
            self.close_with_error(
                id,
                format!("ch {id}: stream write failed. RPC canceled; closing channel"),
                Level::ERROR,
            );
        }
        written
    }

    fn internal_read_event(&mut self, id: ChannelId, bytes: Bytes) {
        self.rpc_receive(id, &bytes, false);
        self.decref(id);
    }

    /// Send a request and wait for its response, processing events
    /// meanwhile (including requests from the same peer).
    pub fn send_call(
        &mut self,
        id: ChannelId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        let invalid = || RpcError::exception(format!("Invalid channel: {id}"));
        let (queue, request_id) = {
            let Some(channel) = self.channels.get_mut(id) else {
                return Err(invalid());
            };
            let Some(rpc) = channel.rpc.as_mut().filter(|rpc| !rpc.closed) else {
                return Err(invalid());
            };
            let request_id = rpc.push_call();
            channel.refcount += 1;
            (channel.events, request_id)
        };

        let mut buf = BytesMut::new();
        if let Err(err) = encode_request(request_id, method, args, &mut buf) {
            self.pop_call(id, request_id);
            self.decref(id);
            return Err(RpcError::exception(err.to_string()));
        }
        debug!(id, request_id, method, "sending call");
        self.write_rpc(id, buf.freeze());

        process_events_until(self, queue, Timeout::Forever, |rt| {
            rt.call_finished(id, request_id)
        });

        let frame = self.pop_call(id, request_id);
        self.decref(id);
        match frame {
            Some(frame) if frame.errored => Err(RpcError::from_value(&frame.result)),
            Some(frame) if frame.returned => Ok(frame.result),
            _ => Err(invalid()),
        }
    }

    fn call_finished(&self, id: ChannelId, request_id: u32) -> bool {
        match self.channels.get(id).and_then(|c| c.rpc.as_ref()) {
            Some(rpc) if !rpc.closed => rpc.frame_returned(request_id),
            _ => true,
        }
    }

    /// Pop a call frame; once no call is outstanding, flush notifications
    /// deferred while waiting.
    fn pop_call(&mut self, id: ChannelId, request_id: u32) -> Option<crate::rpc::CallFrame> {
        let rpc = self.channels.get_mut(id)?.rpc.as_mut()?;
        let frame = rpc.pop_call(request_id);
        if !rpc.has_pending_calls() && !rpc.closed {
            let deferred: Vec<Bytes> = rpc.pending_notifications.drain(..).collect();
            for bytes in deferred {
                if !self.write_rpc(id, bytes) {
                    break;
                }
            }
        }
        frame
    }

    /// Send a notification. Id `0` broadcasts to every subscribed channel.
    ///
    /// Returns false only when `id` is not an open rpc channel.
    pub fn send_event(&mut self, id: ChannelId, name: &str, args: Vec<Value>) -> bool {
        if id == 0 {
            self.broadcast(name, args);
            return true;
        }
        let open = self
            .channels
            .get(id)
            .and_then(|c| c.rpc.as_ref())
            .is_some_and(|rpc| !rpc.closed);
        if !open {
            return false;
        }
        let mut buf = BytesMut::new();
        if let Err(err) = encode_notification(name, args, &mut buf) {
            error!(id, event = name, error = %err, "failed to encode notification");
            return false;
        }
        self.push_notification(id, buf.freeze());
        true
    }

    /// Send `name` to every channel subscribed to it, encoding once.
    /// Returns how many channels it was sent to.
    pub fn broadcast(&mut self, name: &str, args: Vec<Value>) -> usize {
        let targets: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|c| {
                c.rpc
                    .as_ref()
                    .is_some_and(|rpc| !rpc.closed && rpc.is_subscribed(name))
            })
            .map(|c| c.id)
            .collect();
        if targets.is_empty() {
            return 0;
        }
        let mut buf = BytesMut::new();
        if let Err(err) = encode_notification(name, args, &mut buf) {
            error!(event = name, error = %err, "failed to encode broadcast");
            return 0;
        }
        let bytes = buf.freeze();
        for &id in &targets {
            self.push_notification(id, bytes.clone());
        }
        targets.len()
    }

    /// Write now, or defer while a call on this channel is outstanding so
    /// the peer never sees a notification ahead of the reply it waits on.
    fn push_notification(&mut self, id: ChannelId, bytes: Bytes) {
        let Some(rpc) = self.channels.get_mut(id).and_then(|c| c.rpc.as_mut()) else {
            return;
        };
        if rpc.has_pending_calls() {
            rpc.pending_notifications.push_back(bytes);
        } else {
            self.write_rpc(id, bytes);
        }
    }

    /// Subscribe a channel to a broadcast event.
    pub fn subscribe(&mut self, id: ChannelId, event: &str) -> bool {
        match self.channels.get_mut(id).and_then(|c| c.rpc.as_mut()) {
            Some(rpc) => {
                rpc.subscriptions.insert(event.to_string());
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&mut self, id: ChannelId, event: &str) -> bool {
        match self.channels.get_mut(id).and_then(|c| c.rpc.as_mut()) {
            Some(rpc) => rpc.subscriptions.remove(event),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_registers_and_replaces() {
        let mut table = HandlerTable::new();
        table.register("b", false, |_, _, _| Ok(Value::Nil));
        table.register("a", true, |_, _, _| Ok(Value::from(1)));
        assert_eq!(table.names(), vec!["a", "b"]);
        assert!(table.get("a").is_some_and(|h| h.is_fast()));

        table.register("a", false, |_, _, _| Ok(Value::from(2)));
        assert!(table.get("a").is_some_and(|h| !h.is_fast()));
        assert!(table.remove("b"));
        assert!(table.get("b").is_none());
    }
}
