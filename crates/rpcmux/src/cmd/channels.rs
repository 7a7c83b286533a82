use rpcmux_frame::Value;

use crate::client::Client;
use crate::cmd::{parse_duration, ChannelsArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_channels, OutputFormat};

pub fn run(args: ChannelsArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let mut client = Client::connect(&args.address, timeout)?;

    // Identify ourselves so the listing shows who asked.
    let info = Value::Map(vec![
        (Value::from("name"), Value::from("rpcmux-cli")),
        (Value::from("type"), Value::from("remote")),
    ]);
    client
        .call("set_client_info", vec![info])?
        .map_err(|err| rpc_error("set_client_info", err))?;

    let channels = client
        .call("list_channels", vec![])?
        .map_err(|err| rpc_error("list_channels", err))?;
    print_channels(&channels, format);
    Ok(SUCCESS)
}
