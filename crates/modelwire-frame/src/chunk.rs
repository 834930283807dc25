use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::codec::{Frame, FrameKind};
use crate::error::{FrameError, Result};

/// Split a message into data frames of at most `max_chunk` payload bytes.
///
/// An empty message still produces exactly one frame, so a heartbeat is
/// visible on the wire.
pub fn split_message(payload: &Bytes, max_chunk: usize) -> Result<Vec<Frame>> {
    if max_chunk == 0 {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: 0,
        });
    }
    let total_len = u32::try_from(payload.len()).map_err(|_| FrameError::MessageTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    if payload.len() <= max_chunk {
        return Ok(vec![Frame::data(payload.clone())]);
    }

    let count = payload.len().div_ceil(max_chunk) as u32;
    let frames = (0..count)
        .map(|index| {
            let start = index as usize * max_chunk;
            let end = (start + max_chunk).min(payload.len());
            Frame {
                kind: FrameKind::Data,
                total_len,
                index,
                count,
                payload: payload.slice(start..end),
            }
        })
        .collect();
    Ok(frames)
}

struct Partial {
    total_len: u32,
    count: u32,
    next: u32,
    buf: BytesMut,
    last_chunk_at: Instant,
}

/// Incremental reassembly of chunked messages.
///
/// Chunks of one message must arrive contiguously and in index order. Any
/// deviation is reported as an error and the partial message is dropped.
pub struct Reassembler {
    max_message: usize,
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new(max_message: usize) -> Self {
        Self {
            max_message,
            partial: None,
        }
    }

    /// Feed one data frame. Returns the message once its last chunk arrives.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Bytes>> {
        if frame.kind != FrameKind::Data {
            return Err(FrameError::SequenceMismatch(format!(
                "{:?} frame inside a data sequence",
                frame.kind
            )));
        }

        let result = self.push_data(frame);
        if result.is_err() {
            self.partial = None;
        }
        result
    }

    fn start(&mut self, frame: Frame) -> Result<Option<Bytes>> {
        if frame.index != 0 {
            return Err(FrameError::OutOfOrder {
                expected: 0,
                got: frame.index,
            });
        }
        if frame.total_len as usize > self.max_message {
            return Err(FrameError::MessageTooLarge {
                size: frame.total_len as usize,
                max: self.max_message,
            });
        }
        if frame.count == 1 {
            check_length(frame.payload.len(), frame.total_len)?;
            return Ok(Some(frame.payload));
        }

        let mut buf = BytesMut::with_capacity(frame.total_len as usize);
        buf.extend_from_slice(&frame.payload);
        self.partial = Some(Partial {
            total_len: frame.total_len,
            count: frame.count,
            next: 1,
            buf,
            last_chunk_at: Instant::now(),
        });
        Ok(None)
    }

    fn push_data(&mut self, frame: Frame) -> Result<Option<Bytes>> {
        if self.partial.is_none() {
            return self.start(frame);
        }
        let Some(partial) = self.partial.as_mut() else {
            return Ok(None);
        };

        if frame.index != partial.next {
            return Err(FrameError::OutOfOrder {
                expected: partial.next,
                got: frame.index,
            });
        }
        if frame.total_len != partial.total_len || frame.count != partial.count {
            return Err(FrameError::SequenceMismatch(format!(
                "chunk {} announces {} bytes in {} chunks, sequence started with {} bytes in {}",
                frame.index, frame.total_len, frame.count, partial.total_len, partial.count
            )));
        }

        partial.buf.extend_from_slice(&frame.payload);
        if partial.buf.len() > partial.total_len as usize {
            return Err(FrameError::SequenceMismatch(format!(
                "chunks carry more than the announced {} bytes",
                partial.total_len
            )));
        }
        partial.next += 1;
        partial.last_chunk_at = Instant::now();

        if partial.next < partial.count {
            return Ok(None);
        }

        let Some(done) = self.partial.take() else {
            return Ok(None);
        };
        check_length(done.buf.len(), done.total_len)?;
        Ok(Some(done.buf.freeze()))
    }

    /// `(received, expected)` chunk counts of the message being assembled.
    pub fn in_progress(&self) -> Option<(u32, u32)> {
        self.partial.as_ref().map(|p| (p.next, p.count))
    }

    /// When the latest chunk of the pending message arrived. The reassembly
    /// timeout runs from here.
    pub fn last_chunk_at(&self) -> Option<Instant> {
        self.partial.as_ref().map(|p| p.last_chunk_at)
    }

    /// Drop any partial message and return the error describing it.
    pub fn abandon(&mut self) -> Option<FrameError> {
        self.partial.take().map(|p| FrameError::Incomplete {
            received: p.next,
            expected: p.count,
        })
    }

    pub fn reset(&mut self) {
        self.partial = None;
    }
}

fn check_length(actual: usize, announced: u32) -> Result<()> {
    if actual != announced as usize {
        return Err(FrameError::SequenceMismatch(format!(
            "reassembled {actual} bytes, header announced {announced}"
        )));
    }
    Ok(())
}

/// Reassemble a complete, ordered chunk sequence into one message.
pub fn reassemble(frames: impl IntoIterator<Item = Frame>, max_message: usize) -> Result<Bytes> {
    let mut reassembler = Reassembler::new(max_message);
    let mut frames = frames.into_iter();
    while let Some(frame) = frames.next() {
        if let Some(message) = reassembler.push(frame)? {
            if frames.next().is_some() {
                return Err(FrameError::SequenceMismatch(
                    "frames left over after the final chunk".to_string(),
                ));
            }
            return Ok(message);
        }
    }
    Err(reassembler.abandon().unwrap_or(FrameError::Incomplete {
        received: 0,
        expected: 1,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MAX_MESSAGE;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    #[test]
    fn small_message_is_one_frame() {
        let frames = split_message(&payload(100), 2048).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].count, 1);
    }

    #[test]
    fn empty_message_is_one_empty_frame() {
        let frames = split_message(&Bytes::new(), 2048).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
        assert_eq!(frames[0].kind, FrameKind::Data);
    }

    #[test]
    fn message_at_exact_limit_is_not_split() {
        let frames = split_message(&payload(2048), 2048).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn large_message_splits_and_reassembles() {
        let original = payload(10_000);
        let frames = split_message(&original, 2048).unwrap();

        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(|f| f.payload.len() <= 2048));
        assert!(frames.iter().all(|f| f.total_len == 10_000 && f.count == 5));

        let message = reassemble(frames, DEFAULT_MAX_MESSAGE).unwrap();
        assert_eq!(message, original);
    }

    #[test]
    fn out_of_order_chunk_is_rejected() {
        let mut frames = split_message(&payload(5000), 2048).unwrap();
        frames.swap(1, 2);

        let err = reassemble(frames, DEFAULT_MAX_MESSAGE).unwrap_err();
        assert!(matches!(
            err,
            FrameError::OutOfOrder {
                expected: 1,
                got: 2
            }
        ));
    }

    #[test]
    fn sequence_not_starting_at_zero_is_rejected() {
        let frames = split_message(&payload(5000), 2048).unwrap();
        let mut reassembler = Reassembler::new(DEFAULT_MAX_MESSAGE);
        let err = reassembler.push(frames[1].clone()).unwrap_err();
        assert!(matches!(err, FrameError::OutOfOrder { expected: 0, .. }));
    }

    #[test]
    fn missing_tail_is_incomplete() {
        let mut frames = split_message(&payload(5000), 2048).unwrap();
        frames.pop();

        let err = reassemble(frames, DEFAULT_MAX_MESSAGE).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Incomplete {
                received: 2,
                expected: 3
            }
        ));
    }

    #[test]
    fn oversized_announcement_is_rejected() {
        let frames = split_message(&payload(5000), 2048).unwrap();
        let err = reassemble(frames, 4096).unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge { .. }));
    }

    #[test]
    fn mismatched_count_is_rejected() {
        let mut frames = split_message(&payload(5000), 2048).unwrap();
        frames[1].count = 7;

        let err = reassemble(frames, DEFAULT_MAX_MESSAGE).unwrap_err();
        assert!(matches!(err, FrameError::SequenceMismatch(_)));
    }

    #[test]
    fn each_chunk_refreshes_the_reassembly_clock() {
        let frames = split_message(&payload(5000), 2048).unwrap();
        let mut reassembler = Reassembler::new(DEFAULT_MAX_MESSAGE);

        assert!(reassembler.push(frames[0].clone()).unwrap().is_none());
        let first = reassembler.last_chunk_at().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(reassembler.push(frames[1].clone()).unwrap().is_none());
        assert!(reassembler.last_chunk_at().unwrap() > first);
    }

    #[test]
    fn error_clears_partial_state() {
        let frames = split_message(&payload(5000), 2048).unwrap();
        let mut reassembler = Reassembler::new(DEFAULT_MAX_MESSAGE);

        assert!(reassembler.push(frames[0].clone()).unwrap().is_none());
        assert_eq!(reassembler.in_progress(), Some((1, 3)));
        assert!(reassembler.last_chunk_at().is_some());

        assert!(reassembler.push(frames[2].clone()).is_err());
        assert!(reassembler.in_progress().is_none());

        let whole = Frame::data(&b"next"[..]);
        assert_eq!(
            reassembler.push(whole).unwrap().unwrap().as_ref(),
            b"next"
        );
    }

    #[test]
    fn eof_inside_sequence_is_rejected() {
        let frames = split_message(&payload(5000), 2048).unwrap();
        let mut reassembler = Reassembler::new(DEFAULT_MAX_MESSAGE);
        reassembler.push(frames[0].clone()).unwrap();

        assert!(reassembler.push(Frame::eof()).is_err());
    }
}
