use std::io::{ErrorKind, Read};
use std::time::Duration;

use bytes::BytesMut;
use modelwire_transport::IpcStream;
use tracing::{debug, warn};

use crate::chunk::Reassembler;
use crate::codec::{decode_frame, Frame, FrameConfig, FrameKind, Received};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames and messages from any `Read` stream.
///
/// Handles partial reads internally. [`FrameReader::read_frame`] yields raw
/// frames; [`FrameReader::recv_message`] reassembles chunked messages and maps
/// read timeouts and end-of-stream onto [`Received`].
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
    reassembler: Reassembler,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            reassembler: Reassembler::new(config.max_message_size),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when the stream ends.
    /// Bytes of a partially received frame survive a read timeout and are
    /// completed by the next call.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_chunk_size)? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Receive the next complete message.
    ///
    /// - `Received::Message` for a reassembled message (empty = heartbeat)
    /// - `Received::Eof` for an EOF frame or a closed stream between messages
    /// - `Received::Timeout` when the read timeout elapses between messages
    ///
    /// A stream that ends, or stalls past the reassembly timeout, while a
    /// chunked message is only partly received fails with
    /// [`FrameError::Incomplete`].
    pub fn recv_message(&mut self) -> Result<Received> {
        loop {
            let frame = match self.read_frame() {
                Ok(frame) => frame,
                Err(FrameError::Io(err)) if is_timeout(&err) => {
                    let Some(last_chunk) = self.reassembler.last_chunk_at() else {
                        return Ok(Received::Timeout);
                    };
                    if last_chunk.elapsed() >= self.config.reassembly_timeout {
                        warn!(
                            timeout = ?self.config.reassembly_timeout,
                            "chunked message stalled; abandoning reassembly"
                        );
                        return Err(self.incomplete());
                    }
                    continue;
                }
                Err(FrameError::ConnectionClosed) => {
                    return match self.reassembler.abandon() {
                        Some(err) => Err(err),
                        None => Ok(Received::Eof),
                    };
                }
                Err(err) => {
                    self.reassembler.reset();
                    return Err(err);
                }
            };

            match frame.kind {
                FrameKind::Data => {
                    if let Some(message) = self.reassembler.push(frame)? {
                        return Ok(Received::Message(message));
                    }
                }
                FrameKind::Eof => {
                    return match self.reassembler.abandon() {
                        Some(err) => Err(err),
                        None => Ok(Received::Eof),
                    };
                }
                FrameKind::Control => {
                    debug!(len = frame.payload.len(), "ignoring control frame on data path");
                }
            }
        }
    }

    fn incomplete(&mut self) -> FrameError {
        self.reassembler.abandon().unwrap_or(FrameError::Incomplete {
            received: 0,
            expected: 1,
        })
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout used by subsequent receives.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

pub(crate) fn transport_to_frame_error(err: modelwire_transport::TransportError) -> FrameError {
    FrameError::Io(err.into_io())
}
