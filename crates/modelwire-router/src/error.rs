/// Errors raised while building or running the connection router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Comm driver failure on a source or destination channel.
    #[error("comm error: {0}")]
    Comm(#[from] modelwire_comm::CommError),

    /// Datatype schema could not be loaded or compiled.
    #[error("schema error: {0}")]
    Schema(#[from] modelwire_schema::SchemaError),

    /// File sink or source I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A C-style row format string could not be parsed.
    #[error("invalid row format '{format}': {message}")]
    Format { format: String, message: String },

    /// A transform expression could not be parsed.
    #[error("invalid expression '{expression}': {message}")]
    Expression { expression: String, message: String },

    /// A message could not be decoded with its endpoint's format.
    #[error("cannot decode message for '{endpoint}': {message}")]
    Decode { endpoint: String, message: String },

    /// A record could not be encoded with its endpoint's format.
    #[error("cannot encode record for '{endpoint}': {message}")]
    Encode { endpoint: String, message: String },

    /// A transform failed or produced an invalid record.
    #[error("transform failed: {0}")]
    Transform(String),

    /// A transform function reference names nothing registered.
    #[error("unknown transform function '{0}'")]
    UnknownFunction(String),

    /// The routing table is inconsistent.
    #[error("invalid routing configuration: {0}")]
    Configuration(String),
}

impl RouterError {
    /// Convenience constructor for transform functions reporting failure.
    pub fn transform(message: impl Into<String>) -> Self {
        RouterError::Transform(message.into())
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
