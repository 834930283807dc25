use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod recv;
pub mod run;
pub mod send;
pub mod validate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch a model graph and supervise it to completion.
    Run(RunArgs),
    /// Check a graph description without launching anything.
    Validate(ValidateArgs),
    /// Send messages on one of this model's outputs, then finish it with EOF.
    Send(SendArgs),
    /// Print messages arriving on one of this model's inputs.
    Recv(RecvArgs),
    /// Call an RPC service and print each response.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: Option<OutputFormat>) -> CliResult<i32> {
    let report = || format.unwrap_or_else(OutputFormat::default_for_stdout);
    let messages = format.unwrap_or(OutputFormat::Raw);
    match command {
        Command::Run(args) => run::run(args, report()),
        Command::Validate(args) => validate::run(args, report()),
        Command::Send(args) => send::run(args),
        Command::Recv(args) => recv::run(args, messages),
        Command::Call(args) => call::run(args, messages),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Graph description (YAML, or JSON by extension).
    pub graph: PathBuf,
    /// Liveness and channel health poll interval (e.g. 50ms).
    #[arg(long, env = "MODELWIRE_POLL_INTERVAL")]
    pub poll_interval: Option<String>,
    /// How long a model may take to connect (e.g. 30s).
    #[arg(long, env = "MODELWIRE_STARTUP_TIMEOUT")]
    pub startup_timeout: Option<String>,
    /// Time between SIGTERM and SIGKILL on teardown (e.g. 5s).
    #[arg(long, env = "MODELWIRE_GRACE_PERIOD")]
    pub grace_period: Option<String>,
    /// Capture model stdout/stderr under this directory.
    #[arg(long, value_name = "DIR", env = "MODELWIRE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
    /// Keep the broker socket and file channels here instead of a temporary directory.
    #[arg(long, value_name = "DIR", env = "MODELWIRE_RUN_DIR")]
    pub run_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Graph description (YAML, or JSON by extension).
    pub graph: PathBuf,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Output endpoint name.
    pub endpoint: String,
    /// Messages to send, one per argument.
    #[arg(conflicts_with = "stdin")]
    pub messages: Vec<String>,
    /// Send each line read from stdin as a message.
    #[arg(long)]
    pub stdin: bool,
}

#[derive(Args, Debug)]
pub struct RecvArgs {
    /// Input endpoint name.
    pub endpoint: String,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Wait at most this long per message (e.g. 5s, 500ms). Overrides the injected receive timeout.
    #[arg(long)]
    pub timeout: Option<String>,
    /// Print zero-length heartbeat messages as empty lines.
    #[arg(long)]
    pub heartbeats: bool,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Service name.
    pub service: String,
    /// Requests to send, one call per argument.
    #[arg(conflicts_with = "stdin")]
    pub requests: Vec<String>,
    /// Send each line read from stdin as a request.
    #[arg(long)]
    pub stdin: bool,
    /// Wait at most this long per attempt (e.g. 5s). Overrides the injected RPC timeout.
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

/// Payloads from the positional arguments, or one per stdin line.
pub(crate) fn payloads(args: &[String], stdin: bool) -> CliResult<Vec<Vec<u8>>> {
    if !stdin {
        return Ok(args.iter().map(|s| s.as_bytes().to_vec()).collect());
    }
    std::io::stdin()
        .lines()
        .map(|line| {
            line.map(String::into_bytes)
                .map_err(|err| crate::exit::io_error("failed reading stdin", err))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_zero_and_garbage() {
        assert_eq!(parse_duration("0ms").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("soon").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("  ").unwrap_err().code, USAGE);
    }

    #[test]
    fn positional_payloads_keep_order() {
        let args = vec!["{\"a\":1}".to_string(), String::new()];
        assert_eq!(
            payloads(&args, false).unwrap(),
            vec![b"{\"a\":1}".to_vec(), Vec::new()]
        );
    }
}
