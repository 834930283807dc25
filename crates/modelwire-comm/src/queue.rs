use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use modelwire_frame::{FrameError, FrameKind, FrameReader, FrameWriter, Received};
use modelwire_transport::{IpcStream, UnixDomainSocket};
use tracing::{debug, warn};

use crate::control::{QueueRole, Registration, RegistrationAck};
use crate::driver::{CloseHandle, CommDriver, Direction, DriverConfig, TransportKind};
use crate::error::{CommError, Result};
use crate::health::HealthProbe;

/// Comm driver bound to one queue of the run's broker.
///
/// Output drivers register as producers, input drivers as consumers.
pub struct QueueDriver {
    name: String,
    queue: String,
    socket: PathBuf,
    direction: Direction,
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
    health: HealthProbe,
    close: CloseHandle,
    read_timeout: Option<Duration>,
    eof_sent: bool,
    eof_seen: bool,
}

impl QueueDriver {
    /// Connect to the broker at `socket` and register on `queue`.
    pub fn connect(
        name: &str,
        socket: &Path,
        queue: &str,
        direction: Direction,
        config: &DriverConfig,
    ) -> Result<Self> {
        let (stream, retries) = UnixDomainSocket::connect_with_retry(
            socket,
            config.connect_attempts,
            config.connect_delay,
        )?;
        if retries > 0 {
            debug!(endpoint = name, retries, "broker reachable after retries");
        }

        let frame_config = config.frame_config(TransportKind::Queue.max_frame_size());
        let reader_stream = stream.try_clone()?;
        let close_stream = stream.try_clone()?;
        let mut reader = FrameReader::with_config_ipc(reader_stream, frame_config.clone())?;
        let mut writer = FrameWriter::with_config_ipc(stream, frame_config)?;

        let role = match direction {
            Direction::Output => QueueRole::Producer,
            Direction::Input => QueueRole::Consumer,
        };
        register(
            &mut reader,
            &mut writer,
            queue,
            role,
            config.registration_timeout,
        )?;
        debug!(endpoint = name, queue, ?role, "queue endpoint registered");

        let close = CloseHandle::new(move || {
            let _ = close_stream.shutdown();
        });

        Ok(Self {
            name: name.to_string(),
            queue: queue.to_string(),
            socket: socket.to_path_buf(),
            direction,
            reader,
            writer,
            health: HealthProbe::new(),
            close,
            read_timeout: None,
            eof_sent: false,
            eof_seen: false,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn expect(&self, direction: Direction) -> Result<()> {
        if self.direction != direction {
            return Err(CommError::WrongDirection {
                name: self.name.clone(),
                direction: self.direction,
            });
        }
        if self.close.is_closed() {
            return Err(CommError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn fail(&self, err: FrameError) -> CommError {
        self.health.mark_broken();
        warn!(endpoint = %self.name, queue = %self.queue, error = %err, "queue channel failed");
        err.into()
    }
}

fn register(
    reader: &mut FrameReader<IpcStream>,
    writer: &mut FrameWriter<IpcStream>,
    queue: &str,
    role: QueueRole,
    timeout: Duration,
) -> Result<()> {
    let registration = Registration::register(queue, role);
    writer.send_control(&serde_json::to_vec(&registration)?)?;

    reader.set_read_timeout(Some(timeout))?;
    let frame = match reader.read_frame() {
        Ok(frame) => frame,
        Err(FrameError::Io(err))
            if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
        {
            return Err(CommError::Registration(format!(
                "no acknowledgement for queue '{queue}' within {timeout:?}"
            )));
        }
        Err(err) => return Err(err.into()),
    };
    reader.set_read_timeout(None)?;

    if frame.kind != FrameKind::Control {
        return Err(CommError::Registration(format!(
            "unexpected {:?} frame before acknowledgement",
            frame.kind
        )));
    }
    let ack: RegistrationAck = serde_json::from_slice(&frame.payload)?;
    if !ack.ok {
        return Err(CommError::Registration(
            ack.error.unwrap_or_else(|| format!("queue '{queue}' refused")),
        ));
    }
    Ok(())
}

impl CommDriver for QueueDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Queue
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.expect(Direction::Output)?;
        if self.eof_sent {
            return Err(CommError::Closed(self.name.clone()));
        }
        self.writer
            .send_message(payload)
            .map_err(|err| self.fail(err))
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Received> {
        if self.direction != Direction::Input {
            return Err(CommError::WrongDirection {
                name: self.name.clone(),
                direction: self.direction,
            });
        }
        if self.eof_seen || self.close.is_closed() {
            return Ok(Received::Eof);
        }

        // A zero read timeout means "block forever" to the socket layer.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        if timeout != self.read_timeout {
            self.reader.set_read_timeout(timeout)?;
            self.read_timeout = timeout;
        }

        match self.reader.recv_message() {
            Ok(Received::Eof) => {
                self.eof_seen = true;
                Ok(Received::Eof)
            }
            Ok(received) => Ok(received),
            Err(_) if self.close.is_closed() => {
                self.eof_seen = true;
                Ok(Received::Eof)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        self.expect(Direction::Output)?;
        if self.eof_sent {
            return Ok(());
        }
        self.writer.send_eof().map_err(|err| self.fail(err))?;
        self.eof_sent = true;
        debug!(endpoint = %self.name, queue = %self.queue, "EOF sent");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.close.is_closed() {
            return Ok(());
        }
        let result = match self.direction {
            Direction::Output => self.send_eof(),
            Direction::Input => {
                let deregister = Registration::deregister(&self.queue, QueueRole::Consumer);
                serde_json::to_vec(&deregister)
                    .map_err(CommError::from)
                    .and_then(|payload| self.writer.send_control(&payload).map_err(Into::into))
            }
        };
        self.close.close();
        if let Err(err) = &result {
            debug!(endpoint = %self.name, error = %err, "queue endpoint closed uncleanly");
        }
        result
    }

    fn health(&self) -> HealthProbe {
        self.health.clone()
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

/// An output dropped without `close` still finishes its queue, so only a
/// process that dies mid-stream leaves the queue broken.
impl Drop for QueueDriver {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(endpoint = %self.name, error = %err, "close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::broker::Broker;
    use crate::health::Health;

    fn endpoints(
        path: &Path,
        queue: &str,
    ) -> (QueueDriver, QueueDriver) {
        let config = DriverConfig::default();
        let output = QueueDriver::connect("out", path, queue, Direction::Output, &config).unwrap();
        let input = QueueDriver::connect("in", path, queue, Direction::Input, &config).unwrap();
        (output, input)
    }

    #[test]
    fn fifo_order_through_broker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let _broker = Broker::start(&path).unwrap();
        let (mut output, mut input) = endpoints(&path, "fifo");

        for i in 0..50 {
            output.send(format!("m{i}").as_bytes()).unwrap();
        }
        output.close().unwrap();

        for i in 0..50 {
            let expected = Bytes::from(format!("m{i}"));
            assert_eq!(input.recv(None).unwrap(), Received::Message(expected));
        }
        assert_eq!(input.recv(None).unwrap(), Received::Eof);
        assert_eq!(input.recv(None).unwrap(), Received::Eof);
    }

    #[test]
    fn large_message_crosses_queue_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let _broker = Broker::start(&path).unwrap();
        let (mut output, mut input) = endpoints(&path, "big");

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        output.send(&payload).unwrap();

        assert_eq!(
            input.recv(Some(Duration::from_secs(5))).unwrap(),
            Received::Message(Bytes::from(payload))
        );
    }

    #[test]
    fn empty_message_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let _broker = Broker::start(&path).unwrap();
        let (mut output, mut input) = endpoints(&path, "beat");

        output.send(b"").unwrap();
        output.close().unwrap();

        assert_eq!(input.recv(None).unwrap(), Received::Message(Bytes::new()));
        assert_eq!(input.recv(None).unwrap(), Received::Eof);
    }

    #[test]
    fn recv_times_out_without_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let _broker = Broker::start(&path).unwrap();
        let (_output, mut input) = endpoints(&path, "quiet");

        assert_eq!(
            input.recv(Some(Duration::from_millis(20))).unwrap(),
            Received::Timeout
        );
        assert_eq!(input.health().get(), Health::Healthy);
    }

    #[test]
    fn close_handle_unblocks_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let _broker = Broker::start(&path).unwrap();
        let (_output, mut input) = endpoints(&path, "blocked");

        let handle = input.close_handle();
        let waiter = std::thread::spawn(move || input.recv(None).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        handle.close();

        assert_eq!(waiter.join().unwrap(), Received::Eof);
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let _broker = Broker::start(&path).unwrap();
        let (mut output, mut input) = endpoints(&path, "dir");

        assert!(matches!(
            output.recv(None),
            Err(CommError::WrongDirection { .. })
        ));
        assert!(matches!(
            input.send(b"x"),
            Err(CommError::WrongDirection { .. })
        ));
    }

    #[test]
    fn missing_broker_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let config = DriverConfig {
            connect_attempts: 2,
            connect_delay: Duration::from_millis(1),
            ..DriverConfig::default()
        };
        let result = QueueDriver::connect(
            "orphan",
            &dir.path().join("absent.sock"),
            "q",
            Direction::Output,
            &config,
        );
        assert!(matches!(result, Err(CommError::Transport(_))));
    }
}
