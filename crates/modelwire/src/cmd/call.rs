use modelwire_comm::RpcClient;

use crate::cmd::{parse_duration, payloads, CallArgs};
use crate::exit::{comm_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let client = RpcClient::connect(&args.service)
        .map_err(|err| comm_error(&format!("failed connecting to '{}'", args.service), err))?;

    for request in payloads(&args.requests, args.stdin)? {
        let response = match timeout {
            Some(timeout) => client.call_with_timeout(&request, timeout),
            None => client.call(&request),
        }
        .map_err(|err| comm_error(&format!("call to '{}' failed", args.service), err))?;
        print_message(&args.service, &response, format);
    }

    client
        .close()
        .map_err(|err| comm_error(&format!("failed closing '{}'", args.service), err))?;
    Ok(SUCCESS)
}
