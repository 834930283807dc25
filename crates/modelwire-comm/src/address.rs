use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::driver::TransportKind;
use crate::error::CommError;

/// Environment variable carrying the model's name.
pub const MODEL_ENV: &str = "MODELWIRE_MODEL";
/// Prefix of the per-endpoint address variables.
pub const ENDPOINT_ENV_PREFIX: &str = "MODELWIRE_EP_";

/// Where an endpoint's channel lives.
///
/// Textual forms: `queue:<broker-socket>#<queue>`, `file:<path>`,
/// `pipe:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Queue { socket: PathBuf, queue: String },
    File(PathBuf),
    Pipe(String),
}

impl Address {
    pub fn kind(&self) -> TransportKind {
        match self {
            Address::Queue { .. } => TransportKind::Queue,
            Address::File(_) => TransportKind::File,
            Address::Pipe(_) => TransportKind::Pipe,
        }
    }
}

impl FromStr for Address {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CommError::InvalidAddress(s.to_string());
        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }
        match scheme {
            "queue" => {
                let (socket, queue) = rest.rsplit_once('#').ok_or_else(invalid)?;
                if socket.is_empty() || queue.is_empty() {
                    return Err(invalid());
                }
                Ok(Address::Queue {
                    socket: PathBuf::from(socket),
                    queue: queue.to_string(),
                })
            }
            "file" => Ok(Address::File(PathBuf::from(rest))),
            "pipe" => Ok(Address::Pipe(rest.to_string())),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Queue { socket, queue } => write!(f, "queue:{}#{queue}", socket.display()),
            Address::File(path) => write!(f, "file:{}", path.display()),
            Address::Pipe(name) => write!(f, "pipe:{name}"),
        }
    }
}

/// Name of the environment variable carrying `endpoint`'s address.
///
/// Letters are upper-cased; anything other than ASCII letters and digits
/// becomes `_`.
pub fn endpoint_env_var(endpoint: &str) -> String {
    let sanitised: String = endpoint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ENDPOINT_ENV_PREFIX}{sanitised}")
}
