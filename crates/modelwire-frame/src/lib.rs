//! Message framing for modelwire channels.
//!
//! Every frame carries a fixed 20-byte header:
//! - 2-byte magic ("MW") for stream synchronization
//! - 1-byte frame kind (data, EOF, control) and 1 reserved byte
//! - total message length, chunk index, chunk count and chunk length
//!   (4 bytes each, little-endian)
//!
//! Messages larger than the transport's chunk limit are split into several
//! data frames and reassembled on the receiving side. A zero-length message is
//! a heartbeat and stays distinct from the EOF frame that ends a channel.

pub mod chunk;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use chunk::{reassemble, split_message, Reassembler};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameKind, Received, DEFAULT_MAX_CHUNK,
    DEFAULT_MAX_MESSAGE, HEADER_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
