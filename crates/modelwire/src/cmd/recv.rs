use modelwire_comm::{open_input, CommError, Received, RecvPolicy};
use tracing::debug;

use crate::cmd::{parse_duration, RecvArgs};
use crate::exit::{comm_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: RecvArgs, format: OutputFormat) -> CliResult<i32> {
    let mut policy = RecvPolicy::from_env();
    if let Some(timeout) = &args.timeout {
        policy.timeout = Some(parse_duration(timeout)?);
    }

    let mut input = open_input(&args.endpoint)
        .map_err(|err| comm_error(&format!("failed opening '{}'", args.endpoint), err))?;

    let mut printed = 0usize;
    while args.count.is_none_or(|count| printed < count) {
        match policy.recv(&mut *input) {
            Ok(Received::Message(payload)) if payload.is_empty() && !args.heartbeats => {
                debug!(endpoint = %args.endpoint, "heartbeat");
            }
            Ok(Received::Message(payload)) => {
                print_message(&args.endpoint, &payload, format);
                printed += 1;
            }
            Ok(Received::Eof) => {
                debug!(endpoint = %args.endpoint, received = printed, "EOF");
                break;
            }
            Ok(Received::Timeout) => {
                let err = CommError::RecvTimeout {
                    endpoint: args.endpoint.clone(),
                    waited: policy.timeout.unwrap_or_default(),
                };
                return Err(comm_error("receive failed", err));
            }
            Err(err) => return Err(comm_error("receive failed", err)),
        }
    }

    // A consumer leaving early is not an error for the producer.
    if let Err(err) = input.close() {
        debug!(endpoint = %args.endpoint, error = %err, "close failed");
    }
    Ok(SUCCESS)
}
