use modelwire_orchestrator::Graph;
use modelwire_router::FunctionRegistry;
use serde::Serialize;

use crate::cmd::ValidateArgs;
use crate::exit::{orchestrator_error, CliResult, DATA_INVALID, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct ValidationOutput<'a> {
    graph: String,
    valid: bool,
    models: usize,
    connections: usize,
    issues: &'a [String],
}

pub fn run(args: ValidateArgs, format: OutputFormat) -> CliResult<i32> {
    let graph = Graph::from_path(&args.graph)
        .map_err(|err| orchestrator_error(&format!("failed loading {}", args.graph.display()), err))?;
    let issues = modelwire_orchestrator::issues(&graph, &FunctionRegistry::new());

    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            let out = ValidationOutput {
                graph: args.graph.display().to_string(),
                valid: issues.is_empty(),
                models: graph.models.len(),
                connections: graph.connections.len(),
                issues: &issues,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            if issues.is_empty() {
                println!(
                    "{}: ok ({} models, {} connections)",
                    args.graph.display(),
                    graph.models.len(),
                    graph.connections.len()
                );
            }
            for issue in &issues {
                println!("{}: {issue}", args.graph.display());
            }
        }
    }

    Ok(if issues.is_empty() { SUCCESS } else { DATA_INVALID })
}
