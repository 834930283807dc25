mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "modelwire", version, about = "Run and talk to coupled model graphs")]
struct Cli {
    /// Output format. Summaries default to a table on a terminal and JSON
    /// otherwise; received messages default to raw.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "warn",
        env = "MODELWIRE_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    let _model_span = init_logging(cli.log_format, cli.log_level);

    match cmd::run(cli.command, cli.format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "modelwire",
            "run",
            "graph.yaml",
            "--grace-period",
            "2s",
            "--log-dir",
            "/tmp/logs",
        ])
        .expect("run args should parse");

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.grace_period.as_deref(), Some("2s"));
    }

    #[test]
    fn send_rejects_messages_with_stdin() {
        let err = Cli::try_parse_from(["modelwire", "send", "out", "{}", "--stdin"])
            .expect_err("conflicting args should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_recv_count() {
        let cli = Cli::try_parse_from(["modelwire", "recv", "B_in", "--count", "1"])
            .expect("recv args should parse");
        let Command::Recv(args) = cli.command else {
            panic!("expected recv");
        };
        assert_eq!(args.count, Some(1));
    }
}
