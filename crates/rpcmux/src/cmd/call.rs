use crate::client::Client;
use crate::cmd::{parse_args, parse_duration, CallArgs, NotifyArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_result, OutputFormat};

pub fn run_call(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let params = parse_args(&args.args)?;
    let mut client = Client::connect(&args.address, timeout)?;

    tracing::debug!(address = %args.address, method = %args.method, "calling");
    let result = client
        .call(&args.method, params)?
        .map_err(|err| rpc_error(&args.method, err))?;
    print_result(&args.method, &result, format);
    Ok(SUCCESS)
}

pub fn run_notify(args: NotifyArgs) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let params = parse_args(&args.args)?;
    let mut client = Client::connect(&args.address, timeout)?;
    client.notify(&args.event, params)?;
    tracing::debug!(address = %args.address, event = %args.event, "notification sent");
    Ok(SUCCESS)
}
