/// Errors that can occur while framing, chunking or reassembling messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4D57 \"MW\")")]
    InvalidMagic,

    /// The frame header names a kind this version does not know.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// A single chunk exceeds the configured chunk size.
    #[error("chunk too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The announced message length exceeds the configured maximum.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A chunk arrived with an unexpected sequence index.
    #[error("out-of-order chunk (expected index {expected}, got {got})")]
    OutOfOrder { expected: u32, got: u32 },

    /// Chunk headers of one message disagree with each other.
    #[error("inconsistent chunk sequence: {0}")]
    SequenceMismatch(String),

    /// The sequence ended (EOF, disconnect or reassembly timeout) before all
    /// chunks arrived.
    #[error("incomplete message ({received} of {expected} chunks received)")]
    Incomplete { received: u32, expected: u32 },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer stopped accepting writes.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// True for violations of the framing protocol itself, as opposed to
    /// transport I/O failures.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, FrameError::Io(_) | FrameError::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
