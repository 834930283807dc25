use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modelwire_frame::{FrameConfig, Received, DEFAULT_MAX_MESSAGE};
use serde::{Deserialize, Serialize};

use crate::error::{CommError, Result};
use crate::health::{Health, HealthProbe};

/// Reassembly timeout override injected into model processes.
pub const REASSEMBLY_TIMEOUT_ENV: &str = "MODELWIRE_REASSEMBLY_TIMEOUT_MS";
/// Per-wait receive timeout injected into model processes.
pub const RECV_TIMEOUT_ENV: &str = "MODELWIRE_RECV_TIMEOUT_MS";
/// Extra waits allowed after a receive times out.
pub const RECV_RETRIES_ENV: &str = "MODELWIRE_RECV_RETRIES";

/// Which way messages flow through an endpoint, seen from its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Input => "input",
            Direction::Output => "output",
        })
    }
}

/// The transport behind an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Queue,
    File,
    Pipe,
}

impl TransportKind {
    /// Largest frame payload the transport carries without chunking.
    pub const fn max_frame_size(self) -> usize {
        match self {
            TransportKind::Queue => 64 * 1024,
            TransportKind::File | TransportKind::Pipe => 1024 * 1024,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Queue => "queue",
            TransportKind::File => "file",
            TransportKind::Pipe => "pipe",
        })
    }
}

/// Settings shared by every driver kind.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Largest reassembled message accepted.
    pub max_message_size: usize,
    /// How long a partly received chunked message may stall.
    pub reassembly_timeout: Duration,
    /// Write timeout for socket-backed drivers.
    pub write_timeout: Option<Duration>,
    /// Attempts made to reach the broker socket.
    pub connect_attempts: u32,
    /// Pause between broker connect attempts.
    pub connect_delay: Duration,
    /// How long to wait for the broker's registration acknowledgement.
    pub registration_timeout: Duration,
    /// Poll interval of file input drivers waiting for data.
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
            reassembly_timeout: Duration::from_secs(5),
            write_timeout: None,
            connect_attempts: 50,
            connect_delay: Duration::from_millis(100),
            registration_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl DriverConfig {
    /// Defaults, with overrides taken from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_millis(REASSEMBLY_TIMEOUT_ENV) {
            config.reassembly_timeout = ms;
        }
        config
    }

    /// Frame settings for a transport with the given chunk limit.
    pub fn frame_config(&self, max_chunk_size: usize) -> FrameConfig {
        FrameConfig {
            max_chunk_size,
            max_message_size: self.max_message_size,
            read_timeout: None,
            write_timeout: self.write_timeout,
            reassembly_timeout: self.reassembly_timeout,
        }
    }
}

pub(crate) fn env_millis(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_millis)
}

/// How long model-side receives wait before giving up.
///
/// A wait that times out is retried up to `retries` more times; the driver
/// reports itself degraded meanwhile. Without a timeout receives block until
/// a message or EOF arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvPolicy {
    pub timeout: Option<Duration>,
    pub retries: u32,
}

impl RecvPolicy {
    /// Policy injected by the orchestrator, if any.
    pub fn from_env() -> Self {
        Self {
            timeout: env_millis(RECV_TIMEOUT_ENV),
            retries: std::env::var(RECV_RETRIES_ENV)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
        }
    }

    /// Receive one message, EOF, or fail with [`CommError::RecvTimeout`].
    pub fn recv(&self, driver: &mut dyn CommDriver) -> Result<Received> {
        let Some(timeout) = self.timeout else {
            return driver.recv(None);
        };
        let health = driver.health();
        for attempt in 0..=self.retries {
            match driver.recv(Some(timeout))? {
                Received::Timeout => {
                    tracing::debug!(endpoint = driver.name(), attempt, "receive timed out");
                    health.set(Health::Degraded);
                }
                received => {
                    health.set(Health::Healthy);
                    return Ok(received);
                }
            }
        }
        Err(CommError::RecvTimeout {
            endpoint: driver.name().to_string(),
            waited: timeout * (self.retries + 1),
        })
    }
}

/// Closes a driver from any thread.
///
/// Closing unblocks a receive in progress on the owning driver, which then
/// reports [`Received::Eof`]. Closing twice is a no-op.
#[derive(Clone)]
pub struct CloseHandle {
    closed: Arc<AtomicBool>,
    signal: Arc<dyn Fn() + Send + Sync>,
}

impl CloseHandle {
    /// A handle that runs `signal` once on the first close.
    pub fn new(signal: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            signal: Arc::new(signal),
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            (self.signal)();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One endpoint's view of a framed channel.
pub trait CommDriver: Send {
    /// Endpoint name this driver serves.
    fn name(&self) -> &str;

    fn kind(&self) -> TransportKind;

    fn direction(&self) -> Direction;

    /// Largest frame payload before messages are chunked.
    fn max_frame_size(&self) -> usize {
        self.kind().max_frame_size()
    }

    /// Send one message, chunking it when it exceeds the frame limit.
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Wait for the next message. `None` blocks until a message or EOF.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Received>;

    /// Tell the receiving side no more messages follow.
    fn send_eof(&mut self) -> Result<()>;

    /// Release the endpoint. Output drivers send EOF first if they have not.
    fn close(&mut self) -> Result<()>;

    fn health(&self) -> HealthProbe;

    fn close_handle(&self) -> CloseHandle;
}

impl fmt::Debug for dyn CommDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommDriver")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("direction", &self.direction())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn close_handle_signals_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = CloseHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let other = handle.clone();

        handle.close();
        other.close();

        assert!(other.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frame_limits_per_transport() {
        assert_eq!(TransportKind::Queue.max_frame_size(), 65_536);
        assert_eq!(TransportKind::File.max_frame_size(), 1_048_576);
        assert_eq!(TransportKind::Pipe.max_frame_size(), 1_048_576);
    }

    #[test]
    fn recv_policy_gives_up_after_retries() {
        let (_output, mut input) = crate::pipe::channel("p", &DriverConfig::default());
        let policy = RecvPolicy {
            timeout: Some(Duration::from_millis(5)),
            retries: 2,
        };

        let err = policy.recv(&mut input).unwrap_err();
        assert!(matches!(
            err,
            CommError::RecvTimeout { waited, .. } if waited == Duration::from_millis(15)
        ));
        assert_eq!(input.health().get(), Health::Degraded);
    }

    #[test]
    fn recv_policy_returns_messages() {
        let (mut output, mut input) = crate::pipe::channel("p", &DriverConfig::default());
        output.send(b"m").unwrap();
        let policy = RecvPolicy {
            timeout: Some(Duration::from_millis(50)),
            retries: 0,
        };
        assert_eq!(
            policy.recv(&mut input).unwrap(),
            Received::Message(bytes::Bytes::from_static(b"m"))
        );
    }

    #[test]
    fn kinds_deserialize_lowercase() {
        let kind: TransportKind = serde_json::from_str("\"file\"").unwrap();
        assert_eq!(kind, TransportKind::File);
        let dir: Direction = serde_json::from_str("\"output\"").unwrap();
        assert_eq!(dir, Direction::Output);
    }
}
