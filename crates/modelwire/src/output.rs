use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use modelwire_orchestrator::{ModelState, RunSummary};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    endpoint: &'a str,
    size: usize,
    payload: String,
}

/// Print one received message or RPC response.
///
/// `Raw` writes the payload as-is followed by a newline unless it already
/// ends in one, so `$(modelwire recv ...)` captures exactly the message.
pub fn print_message(endpoint: &str, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Raw => {
            let mut out = std::io::stdout();
            let _ = out.write_all(payload);
            if !payload.ends_with(b"\n") {
                let _ = out.write_all(b"\n");
            }
            let _ = out.flush();
        }
        OutputFormat::Json => {
            let out = MessageOutput {
                endpoint,
                size: payload.len(),
                payload: payload_preview(payload),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!(
                "endpoint={} size={} payload={}",
                endpoint,
                payload.len(),
                payload_preview(payload).trim_end()
            );
        }
    }
}

pub fn print_summary(summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            println!(
                "{}",
                serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            println!("{}", summary_table(summary));
            println!("{}", status_line(summary));
        }
        OutputFormat::Pretty => {
            for model in &summary.models {
                println!(
                    "model={} language={} state={} exit={}",
                    model.name,
                    model.language,
                    model.state,
                    exit_cell(model.exit_code, model.signal)
                );
            }
            println!("{}", status_line(summary));
        }
    }
}

pub fn summary_table(summary: &RunSummary) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["MODEL", "LANGUAGE", "STATE", "EXIT", "HISTORY"]);
    for model in &summary.models {
        table.add_row(vec![
            model.name.clone(),
            model.language.to_string(),
            model.state.to_string(),
            exit_cell(model.exit_code, model.signal),
            history(&model.history),
        ]);
    }
    table
}

fn status_line(summary: &RunSummary) -> String {
    match &summary.first_failure {
        None => format!("run succeeded in {} ms", summary.duration_ms),
        Some(failure) => format!("run failed after {} ms: {failure}", summary.duration_ms),
    }
}

fn exit_cell(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => code.to_string(),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "-".to_string(),
    }
}

fn history(states: &[ModelState]) -> String {
    states
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" > ")
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use modelwire_orchestrator::{Failure, FailureKind, Language, ModelSummary};

    use super::*;

    fn summary() -> RunSummary {
        let failure = Failure::new("crash", FailureKind::ProcessExitError, "exited with code 3");
        RunSummary {
            success: false,
            models: vec![ModelSummary {
                name: "crash".to_string(),
                language: Language::Shell,
                state: ModelState::Failed,
                exit_code: Some(3),
                signal: None,
                history: vec![
                    ModelState::Declared,
                    ModelState::Starting,
                    ModelState::Running,
                    ModelState::Failed,
                ],
            }],
            first_failure: Some(failure.clone()),
            failures: vec![failure],
            duration_ms: 12,
        }
    }

    #[test]
    fn table_lists_every_model() {
        let rendered = summary_table(&summary()).to_string();
        assert!(rendered.contains("crash"));
        assert!(rendered.contains("shell"));
        assert!(rendered.contains("failed"));
    }

    #[test]
    fn status_names_the_first_failure() {
        let line = status_line(&summary());
        assert!(line.starts_with("run failed after 12 ms"));
        assert!(line.contains("crash"));
    }

    #[test]
    fn exit_cell_prefers_code_over_signal() {
        assert_eq!(exit_cell(Some(0), None), "0");
        assert_eq!(exit_cell(None, Some(9)), "signal 9");
        assert_eq!(exit_cell(None, None), "-");
    }
}
