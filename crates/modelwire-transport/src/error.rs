use std::path::PathBuf;

/// Socket-level failures of the broker transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot bind broker socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot reach broker socket {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("broker accept failed: {0}")]
    Accept(std::io::Error),

    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// `sun_path` cannot hold the requested socket path.
    #[error("socket path {path} is {len} bytes, the platform allows fewer than {max}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

impl TransportError {
    /// Collapse into a plain I/O error, keeping the original kind where there is one.
    pub fn into_io(self) -> std::io::Error {
        match self {
            TransportError::Bind { source, .. }
            | TransportError::Connect { source, .. }
            | TransportError::Accept(source)
            | TransportError::Io(source) => source,
            other @ TransportError::PathTooLong { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, other.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_io_keeps_the_source_kind() {
        let err = TransportError::Connect {
            path: PathBuf::from("/run/broker.sock"),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(err.into_io().kind(), std::io::ErrorKind::ConnectionRefused);

        let err = TransportError::PathTooLong {
            path: PathBuf::from("/x"),
            len: 200,
            max: 108,
        };
        assert_eq!(err.into_io().kind(), std::io::ErrorKind::InvalidInput);
    }
}
