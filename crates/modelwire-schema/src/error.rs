/// Errors raised while compiling datatypes or validating records.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The schema itself is not valid JSON Schema.
    #[error("failed to compile schema for endpoint '{endpoint}': {message}")]
    CompileFailed { endpoint: String, message: String },

    /// A record does not match its endpoint's datatype.
    #[error("datatype mismatch at endpoint '{endpoint}': {message}")]
    ValidationFailed { endpoint: String, message: String },

    /// The payload is not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchemaError>;
