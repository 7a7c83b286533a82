//! Handlers every runtime registers.

use rpcmux_frame::{RpcError, Value};

use crate::channel::ChannelId;
use crate::dispatch::HandlerTable;
use crate::runtime::Runtime;

fn string_arg(args: &[Value], index: usize, name: &str) -> Result<String, RpcError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::validation(format!("Expected {name} (string) at argument {index}")))
}

fn arity(args: &[Value], expected: usize) -> Result<(), RpcError> {
    if args.len() != expected {
        return Err(RpcError::validation(format!(
            "Wrong number of arguments: expecting {expected} but got {}",
            args.len()
        )));
    }
    Ok(())
}

fn subscribe(rt: &mut Runtime, id: ChannelId, args: Vec<Value>) -> Result<Value, RpcError> {
    arity(&args, 1)?;
    let event = string_arg(&args, 0, "event")?;
    rt.subscribe(id, &event);
    Ok(Value::Nil)
}

fn unsubscribe(rt: &mut Runtime, id: ChannelId, args: Vec<Value>) -> Result<Value, RpcError> {
    arity(&args, 1)?;
    let event = string_arg(&args, 0, "event")?;
    rt.unsubscribe(id, &event);
    Ok(Value::Nil)
}

fn set_client_info(rt: &mut Runtime, id: ChannelId, args: Vec<Value>) -> Result<Value, RpcError> {
    arity(&args, 1)?;
    let Some(Value::Map(info)) = args.into_iter().next() else {
        return Err(RpcError::validation("Expected info (map) at argument 0"));
    };
    rt.set_client_info(id, info)
        .map_err(|err| RpcError::exception(err.to_string()))?;
    Ok(Value::Nil)
}

fn get_channel_info(rt: &mut Runtime, id: ChannelId, args: Vec<Value>) -> Result<Value, RpcError> {
    arity(&args, 1)?;
    let target = args[0]
        .as_u64()
        .ok_or_else(|| RpcError::validation("Expected id (integer) at argument 0"))?;
    // 0 means the calling channel.
    let target = if target == 0 { id } else { target };
    Ok(rt
        .channel_info(target)
        .map_or(Value::Nil, |info| info.to_value()))
}

fn list_channels(rt: &mut Runtime, _id: ChannelId, args: Vec<Value>) -> Result<Value, RpcError> {
    arity(&args, 0)?;
    Ok(Value::Array(
        rt.all_channel_info().iter().map(|info| info.to_value()).collect(),
    ))
}

fn get_channel_id(_rt: &mut Runtime, id: ChannelId, args: Vec<Value>) -> Result<Value, RpcError> {
    arity(&args, 0)?;
    Ok(Value::from(id))
}

/// Register the built-in methods. All of them run inline.
pub fn register(table: &mut HandlerTable) {
    table.register("subscribe", true, subscribe);
    table.register("unsubscribe", true, unsubscribe);
    table.register("set_client_info", true, set_client_info);
    table.register("get_channel_info", true, get_channel_info);
    table.register("list_channels", true, list_channels);
    table.register("get_channel_id", true, get_channel_id);
}
