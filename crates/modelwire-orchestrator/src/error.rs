use modelwire_comm::CommError;
use modelwire_router::RouterError;
use modelwire_schema::SchemaError;

use crate::state::ModelState;

/// Errors raised while loading, validating or running a model graph.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Comm driver or broker error.
    #[error("comm error: {0}")]
    Comm(#[from] CommError),

    /// Routing table could not be built.
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// An endpoint datatype is not a valid schema.
    #[error("datatype error: {0}")]
    Schema(#[from] SchemaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The graph description is not valid YAML.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The graph description is not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The graph description violates one or more graph rules.
    #[error("invalid graph: {}", issues.join("; "))]
    InvalidGraph { issues: Vec<String> },

    /// A model's launch settings are unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A model process could not be started.
    #[error("failed to start model '{model}': {source}")]
    Spawn {
        model: String,
        #[source]
        source: std::io::Error,
    },

    /// A lifecycle transition the state machine forbids.
    #[error("model '{model}' cannot go from {from} to {to}")]
    InvalidTransition {
        model: String,
        from: ModelState,
        to: ModelState,
    },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
