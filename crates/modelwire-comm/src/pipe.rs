use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use modelwire_frame::{split_message, Frame, FrameError, FrameKind, Reassembler, Received};
use tracing::{debug, warn};

use crate::driver::{CloseHandle, CommDriver, Direction, DriverConfig, TransportKind};
use crate::error::{CommError, Result};
use crate::health::HealthProbe;

enum PipeEnd {
    Sender(Sender<Frame>),
    Receiver {
        frames: Receiver<Frame>,
        reassembler: Reassembler,
    },
}

/// In-process comm driver over a `crossbeam-channel`.
///
/// Pipes never leave the process: both ends are created together by
/// [`channel`], or claimed one at a time by name through [`open_named`].
pub struct PipeDriver {
    name: String,
    end: PipeEnd,
    max_chunk: usize,
    max_message: usize,
    reassembly_timeout: Duration,
    cancel: Receiver<()>,
    health: HealthProbe,
    close: CloseHandle,
    eof_sent: bool,
    eof_seen: bool,
}

/// Create a connected `(output, input)` pipe pair.
pub fn channel(name: &str, config: &DriverConfig) -> (PipeDriver, PipeDriver) {
    let (tx, rx) = unbounded();
    let output = PipeDriver::new(name, PipeEnd::Sender(tx), config);
    let input = PipeDriver::new(
        name,
        PipeEnd::Receiver {
            frames: rx,
            reassembler: Reassembler::new(config.max_message_size),
        },
        config,
    );
    (output, input)
}

fn registry() -> &'static Mutex<HashMap<String, PipeDriver>> {
    static PIPES: OnceLock<Mutex<HashMap<String, PipeDriver>>> = OnceLock::new();
    PIPES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Claim one end of the process-wide pipe called `pipe`.
///
/// The first caller creates the pair and parks the opposite end for the
/// second caller. Each end can be claimed once.
pub fn open_named(
    name: &str,
    pipe: &str,
    direction: Direction,
    config: &DriverConfig,
) -> Result<PipeDriver> {
    let mut pipes = registry().lock().unwrap_or_else(PoisonError::into_inner);

    let mut driver = match pipes.remove(pipe) {
        Some(parked) if parked.direction() == direction => parked,
        Some(parked) => {
            pipes.insert(pipe.to_string(), parked);
            return Err(CommError::InvalidAddress(format!(
                "pipe:{pipe} already has an {direction} end"
            )));
        }
        None => {
            let (output, input) = channel(pipe, config);
            let (mine, parked) = match direction {
                Direction::Output => (output, input),
                Direction::Input => (input, output),
            };
            pipes.insert(pipe.to_string(), parked);
            mine
        }
    };
    driver.name = name.to_string();
    debug!(endpoint = name, pipe, %direction, "pipe end claimed");
    Ok(driver)
}

impl PipeDriver {
    fn new(name: &str, end: PipeEnd, config: &DriverConfig) -> Self {
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
        let cancel_tx = Mutex::new(Some(cancel_tx));
        let close = CloseHandle::new(move || {
            // Dropping the sender disconnects `cancel`, waking any select.
            cancel_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        });
        Self {
            name: name.to_string(),
            end,
            max_chunk: TransportKind::Pipe.max_frame_size(),
            max_message: config.max_message_size,
            reassembly_timeout: config.reassembly_timeout,
            cancel: cancel_rx,
            health: HealthProbe::new(),
            close,
            eof_sent: false,
            eof_seen: false,
        }
    }

    fn sender(&self) -> Result<&Sender<Frame>> {
        if self.close.is_closed() || self.eof_sent {
            return Err(CommError::Closed(self.name.clone()));
        }
        match &self.end {
            PipeEnd::Sender(tx) => Ok(tx),
            PipeEnd::Receiver { .. } => Err(CommError::WrongDirection {
                name: self.name.clone(),
                direction: Direction::Input,
            }),
        }
    }

    fn push(&self, frame: Frame) -> Result<()> {
        self.sender()?.send(frame).map_err(|_| {
            self.health.mark_broken();
            CommError::Broken(format!("pipe '{}' has no receiver", self.name))
        })
    }
}

impl CommDriver for PipeDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    fn direction(&self) -> Direction {
        match self.end {
            PipeEnd::Sender(_) => Direction::Output,
            PipeEnd::Receiver { .. } => Direction::Input,
        }
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_message {
            return Err(FrameError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message,
            }
            .into());
        }
        let payload = Bytes::copy_from_slice(payload);
        for frame in split_message(&payload, self.max_chunk)? {
            self.push(frame)?;
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Received> {
        let PipeEnd::Receiver {
            frames,
            reassembler,
        } = &mut self.end
        else {
            return Err(CommError::WrongDirection {
                name: self.name.clone(),
                direction: Direction::Output,
            });
        };
        let frames: &Receiver<Frame> = frames;
        if self.eof_seen || self.close.is_closed() {
            return Ok(Received::Eof);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // While a chunked message is pending, only the reassembly
            // timeout applies, counted from its latest chunk.
            let wait_until = match reassembler.last_chunk_at() {
                Some(last_chunk) => Some(last_chunk + self.reassembly_timeout),
                None => deadline,
            };
            let timer = match wait_until {
                Some(at) => after(at.saturating_duration_since(Instant::now())),
                None => never(),
            };

            select! {
                recv(frames) -> frame => match frame {
                    Ok(frame) => match frame.kind {
                        FrameKind::Data => {
                            if let Some(message) = reassembler.push(frame)? {
                                return Ok(Received::Message(message));
                            }
                        }
                        FrameKind::Eof => {
                            self.eof_seen = true;
                            return match reassembler.abandon() {
                                Some(err) => Err(err.into()),
                                None => Ok(Received::Eof),
                            };
                        }
                        FrameKind::Control => {}
                    },
                    Err(_) => {
                        self.eof_seen = true;
                        if let Some(err) = reassembler.abandon() {
                            self.health.mark_broken();
                            return Err(err.into());
                        }
                        warn!(endpoint = %self.name, "pipe sender dropped without EOF");
                        return Ok(Received::Eof);
                    }
                },
                recv(self.cancel) -> _ => {
                    self.eof_seen = true;
                    return Ok(Received::Eof);
                }
                recv(timer) -> _ => {
                    if let Some(err) = reassembler.abandon() {
                        self.health.mark_broken();
                        return Err(err.into());
                    }
                    return Ok(Received::Timeout);
                }
            }
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        if self.eof_sent {
            return Ok(());
        }
        self.push(Frame::eof())?;
        self.eof_sent = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.close.is_closed() {
            return Ok(());
        }
        let result = match self.end {
            PipeEnd::Sender(_) => self.send_eof(),
            PipeEnd::Receiver { .. } => Ok(()),
        };
        self.close.close();
        result
    }

    fn health(&self) -> HealthProbe {
        self.health.clone()
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}
