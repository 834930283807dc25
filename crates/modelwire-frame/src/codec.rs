use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + kind (1) + reserved (1) + total, index, count,
/// chunk length (4 each) = 20 bytes.
pub const HEADER_SIZE: usize = 20;

/// Magic bytes: "MW" (0x4D 0x57).
pub const MAGIC: [u8; 2] = [0x4D, 0x57];

/// Default maximum chunk payload: 64 KiB.
pub const DEFAULT_MAX_CHUNK: usize = 64 * 1024;

/// Default maximum reassembled message size: 64 MiB.
pub const DEFAULT_MAX_MESSAGE: usize = 64 * 1024 * 1024;

/// What a frame carries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// One chunk of a message (possibly the only one).
    Data = 0,
    /// The sender will not send any more messages.
    Eof = 1,
    /// Out-of-band control payload (broker registration).
    Control = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Eof),
            2 => Ok(FrameKind::Control),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Length of the whole message this chunk belongs to.
    pub total_len: u32,
    /// Zero-based position of this chunk in its message.
    pub index: u32,
    /// Number of chunks in the message.
    pub count: u32,
    pub payload: Bytes,
}

impl Frame {
    /// A single-chunk data frame.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            kind: FrameKind::Data,
            total_len: payload.len() as u32,
            index: 0,
            count: 1,
            payload,
        }
    }

    /// The end-of-stream frame.
    pub fn eof() -> Self {
        Self {
            kind: FrameKind::Eof,
            total_len: 0,
            index: 0,
            count: 0,
            payload: Bytes::new(),
        }
    }

    /// A control frame.
    pub fn control(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Control,
            ..Self::data(payload)
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// True if this is the final chunk of its message.
    pub fn is_last_chunk(&self) -> bool {
        self.index + 1 == self.count
    }
}

/// Outcome of a blocking message receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete message. Empty payloads are heartbeats.
    Message(Bytes),
    /// The channel is closed; no further messages will arrive.
    Eof,
    /// Nothing arrived before the receive timeout. Not an error.
    Timeout,
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────┬──────┬──────┬───────────┬───────────┬───────────┬───────────┬─────────┐
/// │ Magic  │ Kind │ Rsvd │ Total     │ Index     │ Count     │ Chunk len │ Payload │
/// │ "MW"   │ (1B) │ (1B) │ (4B LE)   │ (4B LE)   │ (4B LE)   │ (4B LE)   │         │
/// └────────┴──────┴──────┴───────────┴───────────┴───────────┴───────────┴─────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(frame.wire_size());
    dst.put_slice(&MAGIC);
    dst.put_u8(frame.kind as u8);
    dst.put_u8(0);
    dst.put_u32_le(frame.total_len);
    dst.put_u32_le(frame.index);
    dst.put_u32_le(frame.count);
    dst.put_u32_le(frame.payload.len() as u32);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_chunk: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let kind = FrameKind::try_from(src[2])?;
    let mut header = &src[4..HEADER_SIZE];
    let total_len = header.get_u32_le();
    let index = header.get_u32_le();
    let count = header.get_u32_le();
    let chunk_len = header.get_u32_le() as usize;

    if chunk_len > max_chunk {
        return Err(FrameError::PayloadTooLarge {
            size: chunk_len,
            max: max_chunk,
        });
    }

    if kind != FrameKind::Eof {
        if count == 0 || index >= count {
            return Err(FrameError::SequenceMismatch(format!(
                "chunk index {index} outside count {count}"
            )));
        }
        if chunk_len > total_len as usize {
            return Err(FrameError::SequenceMismatch(format!(
                "chunk of {chunk_len} bytes exceeds message length {total_len}"
            )));
        }
    }

    let total = HEADER_SIZE + chunk_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(chunk_len).freeze();

    Ok(Some(Frame {
        kind,
        total_len,
        index,
        count,
        payload,
    }))
}

/// Configuration for framed readers and writers.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest payload carried by a single frame. Default: 64 KiB.
    pub max_chunk_size: usize,
    /// Largest reassembled message accepted. Default: 64 MiB.
    pub max_message_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<Duration>,
    /// How long a partially received message may wait for its next chunk.
    pub reassembly_timeout: Duration,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK,
            max_message_size: DEFAULT_MAX_MESSAGE,
            read_timeout: None,
            write_timeout: None,
            reassembly_timeout: Duration::from_secs(5),
        }
    }
}
