use std::io::{ErrorKind, Write};

use bytes::{Bytes, BytesMut};
use modelwire_transport::IpcStream;

use crate::chunk::split_message;
use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::reader::transport_to_frame_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes frames and chunked messages to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a single pre-built frame (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.payload.len() > self.config.max_chunk_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_chunk_size,
            });
        }

        self.buf.clear();
        encode_frame(frame, &mut self.buf)?;
        self.write_buffered()
    }

    /// Send a message, splitting it into chunks of at most
    /// `max_chunk_size` bytes. All chunks go out back to back.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            });
        }

        let payload = Bytes::copy_from_slice(payload);
        let frames = split_message(&payload, self.config.max_chunk_size)?;

        self.buf.clear();
        for frame in &frames {
            encode_frame(frame, &mut self.buf)?;
        }
        self.write_buffered()
    }

    /// Signal that no further messages follow.
    pub fn send_eof(&mut self) -> Result<()> {
        self.write_frame(&Frame::eof())
    }

    /// Send an out-of-band control payload.
    pub fn send_control(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(&Frame::control(Bytes::copy_from_slice(payload)))
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_stalled(&err) => self.stalled(err)?,
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    return Err(FrameError::ConnectionClosed)
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_stalled(&err) => self.stalled(err)?,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// A blocked write is retried only when no write timeout is configured.
    /// Sockets report an expired `SO_SNDTIMEO` as `WouldBlock`, so with a
    /// timeout set both kinds mean the peer stopped reading.
    fn stalled(&self, err: std::io::Error) -> Result<()> {
        match self.config.write_timeout {
            Some(timeout) => Err(FrameError::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("write stalled for {timeout:?}: {err}"),
            ))),
            None => Ok(()),
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn is_stalled(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}
