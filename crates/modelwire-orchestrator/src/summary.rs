use std::fmt;

use modelwire_router::RouterEvent;
use serde::Serialize;

use crate::graph::Language;
use crate::state::{ModelRecord, ModelState};

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    FramingError,
    Timeout,
    RpcTimeout,
    TransportBroken,
    TransformError,
    ProcessExitError,
    /// The graph or a launch spec could not be turned into a running process.
    Configuration,
    /// The run was cancelled from outside.
    Interrupted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One failure observed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Model, edge (`source -> destination`) or endpoint that failed.
    pub component: String,
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(component: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            kind,
            message: message.into(),
        }
    }

    /// Failure described by a router event, `None` for progress events.
    pub fn from_router_event(event: &RouterEvent) -> Option<Self> {
        let failure = match event {
            RouterEvent::SourceFinished { .. } | RouterEvent::DestinationFinished { .. } => {
                return None
            }
            RouterEvent::SourceFailed {
                source,
                error,
                framing,
            } => {
                let kind = if *framing {
                    FailureKind::FramingError
                } else {
                    FailureKind::TransportBroken
                };
                Failure::new(source, kind, error)
            }
            RouterEvent::DecodeFailed { source, error } => {
                Failure::new(source, FailureKind::TransformError, error)
            }
            RouterEvent::TransformFailed {
                source,
                destination,
                error,
                message,
            } => Failure::new(
                format!("{source} -> {destination}"),
                FailureKind::TransformError,
                format!("{error} (message: {message})"),
            ),
            RouterEvent::DeliveryFailed {
                source,
                destination,
                error,
            } => Failure::new(
                format!("{source} -> {destination}"),
                FailureKind::TransportBroken,
                error,
            ),
        };
        Some(failure)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.kind, self.component, self.message)
    }
}

/// Final view of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub language: Language,
    pub state: ModelState,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub history: Vec<ModelState>,
}

impl From<&ModelRecord> for ModelSummary {
    fn from(record: &ModelRecord) -> Self {
        Self {
            name: record.name.clone(),
            language: record.language(),
            state: record.state(),
            exit_code: record.exit.and_then(|e| e.code),
            signal: record.exit.and_then(|e| e.signal),
            history: record.history().to_vec(),
        }
    }
}

/// Outcome of one run of a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub success: bool,
    pub models: Vec<ModelSummary>,
    /// The failure that triggered teardown.
    pub first_failure: Option<Failure>,
    /// Every failure, in the order observed.
    pub failures: Vec<Failure>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn model(&self, name: &str) -> Option<&ModelSummary> {
        self.models.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_events_map_to_kinds() {
        let framing = RouterEvent::SourceFailed {
            source: "A_out".to_string(),
            error: "out of order".to_string(),
            framing: true,
        };
        let failure = Failure::from_router_event(&framing).unwrap();
        assert_eq!(failure.kind, FailureKind::FramingError);
        assert_eq!(failure.component, "A_out");

        let transform = RouterEvent::TransformFailed {
            source: "A_out".to_string(),
            destination: "B_in".to_string(),
            error: "division by zero".to_string(),
            message: "{\"x\":0}".to_string(),
        };
        let failure = Failure::from_router_event(&transform).unwrap();
        assert_eq!(failure.kind, FailureKind::TransformError);
        assert_eq!(failure.component, "A_out -> B_in");
        assert!(failure.message.contains("{\"x\":0}"));

        let done = RouterEvent::DestinationFinished {
            destination: "B_in".to_string(),
        };
        assert!(Failure::from_router_event(&done).is_none());
    }

    #[test]
    fn summary_serializes_for_machines() {
        let summary = RunSummary {
            success: false,
            models: vec![ModelSummary {
                name: "A".to_string(),
                language: Language::Shell,
                state: ModelState::Failed,
                exit_code: Some(3),
                signal: None,
                history: vec![ModelState::Declared, ModelState::Starting, ModelState::Failed],
            }],
            first_failure: Some(Failure::new("A", FailureKind::ProcessExitError, "exit code 3")),
            failures: Vec::new(),
            duration_ms: 12,
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["models"][0]["state"], "failed");
        assert_eq!(json["models"][0]["language"], "shell");
        assert_eq!(json["first_failure"]["kind"], "ProcessExitError");
        assert!(json["models"][0].get("signal").is_none());
        assert_eq!(
            summary.first_failure.unwrap().to_string(),
            "ProcessExitError in A: exit code 3"
        );
    }
}
