use std::fmt;
use std::io;

use modelwire_comm::CommError;
use modelwire_orchestrator::OrchestratorError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn comm_error(context: &str, err: CommError) -> CliError {
    match err {
        err if err.is_framing() => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        CommError::Io(source) => io_error(context, source),
        CommError::RecvTimeout { .. } | CommError::RpcTimeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        CommError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        CommError::MissingEndpoint { .. }
        | CommError::InvalidAddress(_)
        | CommError::WrongDirection { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn orchestrator_error(context: &str, err: OrchestratorError) -> CliError {
    match err {
        OrchestratorError::Io(source) => io_error(context, source),
        OrchestratorError::Comm(err) => comm_error(context, err),
        OrchestratorError::InvalidGraph { .. }
        | OrchestratorError::Yaml(_)
        | OrchestratorError::Json(_)
        | OrchestratorError::Schema(_)
        | OrchestratorError::Router(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        OrchestratorError::Configuration(_) => CliError::new(USAGE, format!("{context}: {err}")),
        OrchestratorError::Spawn { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn comm_errors_map_to_exit_codes() {
        let missing = CommError::MissingEndpoint {
            name: "x".to_string(),
            var: "MODELWIRE_EP_X".to_string(),
        };
        assert_eq!(comm_error("open", missing).code, USAGE);
        assert_eq!(
            comm_error("call", CommError::RpcTimeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            comm_error("send", CommError::Broken("gone".to_string())).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn graph_errors_are_data_errors() {
        let err = OrchestratorError::InvalidGraph {
            issues: vec!["model 'a' listed twice".to_string()],
        };
        let mapped = orchestrator_error("load failed", err);
        assert_eq!(mapped.code, DATA_INVALID);
        assert!(mapped.message.contains("listed twice"));
    }
}
