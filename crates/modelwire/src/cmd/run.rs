use modelwire_orchestrator::{CancelHandle, Graph, Orchestrator, RunConfig};
use tracing::{info, warn};

use crate::cmd::{parse_duration, RunArgs};
use crate::exit::{orchestrator_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::{print_summary, OutputFormat};

pub fn run(args: RunArgs, format: OutputFormat) -> CliResult<i32> {
    let graph = Graph::from_path(&args.graph)
        .map_err(|err| orchestrator_error(&format!("failed loading {}", args.graph.display()), err))?;
    let config = run_config(&graph, &args)?;

    let orchestrator = Orchestrator::new(graph, config);
    install_ctrlc_handler(orchestrator.cancel_handle())?;

    info!(graph = %args.graph.display(), "running graph");
    let summary = orchestrator
        .run()
        .map_err(|err| orchestrator_error("run failed", err))?;
    print_summary(&summary, format);

    Ok(if summary.success { SUCCESS } else { FAILURE })
}

/// Defaults, then the graph's `run:` section, then flags.
fn run_config(graph: &Graph, args: &RunArgs) -> CliResult<RunConfig> {
    let mut config = RunConfig::from_section(&graph.run);
    if let Some(value) = &args.poll_interval {
        config.poll_interval = parse_duration(value)?;
    }
    if let Some(value) = &args.startup_timeout {
        config.startup_timeout = parse_duration(value)?;
    }
    if let Some(value) = &args.grace_period {
        config.grace_period = parse_duration(value)?;
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.run_dir {
        config.run_dir = Some(dir.clone());
    }
    Ok(config)
}

fn install_ctrlc_handler(cancel: CancelHandle) -> CliResult<()> {
    ctrlc::set_handler(move || {
        warn!("interrupted, tearing down");
        cancel.cancel();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            graph: PathBuf::from("graph.yaml"),
            poll_interval: None,
            startup_timeout: None,
            grace_period: Some("250ms".to_string()),
            log_dir: Some(PathBuf::from("/tmp/mw-logs")),
            run_dir: None,
        }
    }

    #[test]
    fn flags_override_the_run_section() {
        let graph = Graph::from_yaml_str(
            r#"
run: {grace_period_ms: 9000, poll_interval_ms: 20, log_dir: /var/log/mw}
models:
  - {name: a, language: shell, args: ["-c", "true"]}
"#,
        )
        .unwrap();

        let config = run_config(&graph, &args()).unwrap();
        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/mw-logs")));
    }

    #[test]
    fn bad_durations_are_usage_errors() {
        let graph = Graph::from_yaml_str("models: []").unwrap();
        let mut args = args();
        args.startup_timeout = Some("eventually".to_string());
        assert_eq!(
            run_config(&graph, &args).unwrap_err().code,
            crate::exit::USAGE
        );
    }
}
