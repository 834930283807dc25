use modelwire_comm::open_output;
use tracing::debug;

use crate::cmd::{payloads, SendArgs};
use crate::exit::{comm_error, CliResult, SUCCESS};

/// Closing an output finishes it, so everything a model sends on one
/// endpoint goes through a single invocation.
pub fn run(args: SendArgs) -> CliResult<i32> {
    let context = |what: &str| format!("{what} '{}'", args.endpoint);

    let mut output =
        open_output(&args.endpoint).map_err(|err| comm_error(&context("failed opening"), err))?;

    let messages = payloads(&args.messages, args.stdin)?;
    for payload in &messages {
        output
            .send(payload)
            .map_err(|err| comm_error(&context("send failed on"), err))?;
    }
    debug!(endpoint = %args.endpoint, count = messages.len(), "messages sent");

    output
        .close()
        .map_err(|err| comm_error(&context("failed closing"), err))?;
    Ok(SUCCESS)
}
