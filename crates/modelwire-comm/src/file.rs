use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use modelwire_frame::{FrameReader, FrameWriter, Received};
use tracing::{debug, warn};

use crate::driver::{CloseHandle, CommDriver, Direction, DriverConfig, TransportKind};
use crate::error::{CommError, Result};
use crate::health::HealthProbe;

/// Follows a file that another process is still appending to.
///
/// Reads block (polling) until data appears, the per-receive deadline
/// passes (`TimedOut`) or the driver is closed (end of stream).
struct TailReader {
    path: PathBuf,
    file: Option<File>,
    close: CloseHandle,
    poll_interval: Duration,
    deadline: Option<Instant>,
}

impl Read for TailReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.close.is_closed() {
                return Ok(0);
            }
            if self.file.is_none() {
                match File::open(&self.path) {
                    Ok(file) => self.file = Some(file),
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
            if let Some(file) = self.file.as_mut() {
                let n = file.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
            }

            let pause = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(std::io::Error::from(ErrorKind::TimedOut));
                    }
                    (deadline - now).min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            std::thread::sleep(pause);
        }
    }
}

enum FileEnd {
    Output(FrameWriter<File>),
    Input(FrameReader<TailReader>),
}

/// Comm driver backed by a file of frames.
///
/// The output side truncates the file and appends one frame sequence per
/// message. The input side reads from the start and tails the file until it
/// reads an EOF frame, so it may be opened before the writer creates it.
pub struct FileDriver {
    name: String,
    path: PathBuf,
    end: FileEnd,
    health: HealthProbe,
    close: CloseHandle,
    eof_sent: bool,
    eof_seen: bool,
}

impl FileDriver {
    /// Create (or truncate) `path` for writing.
    pub fn create(name: &str, path: impl AsRef<Path>, config: &DriverConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let writer = FrameWriter::with_config(
            file,
            config.frame_config(TransportKind::File.max_frame_size()),
        );
        debug!(endpoint = name, ?path, "file output opened");
        Ok(Self {
            name: name.to_string(),
            path,
            end: FileEnd::Output(writer),
            health: HealthProbe::new(),
            close: CloseHandle::new(|| {}),
            eof_sent: false,
            eof_seen: false,
        })
    }

    /// Tail `path` for reading. The file need not exist yet.
    pub fn open(name: &str, path: impl AsRef<Path>, config: &DriverConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        let close = CloseHandle::new(|| {});
        let tail = TailReader {
            path: path.clone(),
            file: None,
            close: close.clone(),
            poll_interval: config.poll_interval,
            deadline: None,
        };
        let reader = FrameReader::with_config(
            tail,
            config.frame_config(TransportKind::File.max_frame_size()),
        );
        debug!(endpoint = name, ?path, "file input opened");
        Self {
            name: name.to_string(),
            path,
            end: FileEnd::Input(reader),
            health: HealthProbe::new(),
            close,
            eof_sent: false,
            eof_seen: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut FrameWriter<File>> {
        if self.close.is_closed() || self.eof_sent {
            return Err(CommError::Closed(self.name.clone()));
        }
        match &mut self.end {
            FileEnd::Output(writer) => Ok(writer),
            FileEnd::Input(_) => Err(CommError::WrongDirection {
                name: self.name.clone(),
                direction: Direction::Input,
            }),
        }
    }
}

impl CommDriver for FileDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::File
    }

    fn direction(&self) -> Direction {
        match self.end {
            FileEnd::Output(_) => Direction::Output,
            FileEnd::Input(_) => Direction::Input,
        }
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        let health = self.health.clone();
        self.writer()?.send_message(payload).map_err(|err| {
            health.mark_broken();
            err.into()
        })
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Received> {
        let FileEnd::Input(reader) = &mut self.end else {
            return Err(CommError::WrongDirection {
                name: self.name.clone(),
                direction: Direction::Output,
            });
        };
        if self.eof_seen || self.close.is_closed() {
            return Ok(Received::Eof);
        }

        reader.get_mut().deadline = timeout.map(|t| Instant::now() + t);
        match reader.recv_message() {
            Ok(Received::Eof) => {
                self.eof_seen = true;
                Ok(Received::Eof)
            }
            Ok(received) => Ok(received),
            Err(_) if self.close.is_closed() => {
                self.eof_seen = true;
                Ok(Received::Eof)
            }
            Err(err) => {
                self.health.mark_broken();
                warn!(endpoint = %self.name, path = ?self.path, error = %err, "file channel failed");
                Err(err.into())
            }
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        if self.eof_sent {
            return Ok(());
        }
        self.writer()?.send_eof()?;
        self.eof_sent = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.close.is_closed() {
            return Ok(());
        }
        let result = match self.end {
            FileEnd::Output(_) => self.send_eof(),
            FileEnd::Input(_) => Ok(()),
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

/// Dropping an output writes the EOF frame if `close` was never called.
impl Drop for FileDriver {
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

    #[test]
    fn fifo_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.mwf");
        let config = DriverConfig::default();

        let mut output = FileDriver::create("out", &path, &config).unwrap();
        for i in 0..20 {
            output.send(format!("row {i}").as_bytes()).unwrap();
        }
        output.close().unwrap();

        let mut input = FileDriver::open("in", &path, &config);
        for i in 0..20 {
            assert_eq!(
                input.recv(None).unwrap(),
                Received::Message(Bytes::from(format!("row {i}")))
            );
        }
        assert_eq!(input.recv(None).unwrap(), Received::Eof);
    }

    #[test]
    fn reader_tails_a_growing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.mwf");
        let config = DriverConfig::default();

        let mut input = FileDriver::open("in", &path, &config);
        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let mut output =
                FileDriver::create("out", &writer_path, &DriverConfig::default()).unwrap();
            output.send(b"late").unwrap();
            std::thread::sleep(Duration::from_millis(30));
            output.close().unwrap();
        });

        assert_eq!(
            input.recv(Some(Duration::from_secs(5))).unwrap(),
            Received::Message(Bytes::from_static(b"late"))
        );
        assert_eq!(
            input.recv(Some(Duration::from_secs(5))).unwrap(),
            Received::Eof
        );
        writer.join().unwrap();
    }

    #[test]
    fn recv_times_out_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = FileDriver::open("in", dir.path().join("never.mwf"), &DriverConfig::default());

        assert_eq!(
            input.recv(Some(Duration::from_millis(20))).unwrap(),
            Received::Timeout
        );
    }

    #[test]
    fn large_message_is_chunked_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mwf");
        let config = DriverConfig::default();

        let payload: Vec<u8> = vec![42; 3 * 1024 * 1024 + 7];
        let mut output = FileDriver::create("out", &path, &config).unwrap();
        output.send(&payload).unwrap();
        output.close().unwrap();

        let mut input = FileDriver::open("in", &path, &config);
        assert_eq!(
            input.recv(None).unwrap(),
            Received::Message(Bytes::from(payload))
        );
    }

    #[test]
    fn close_handle_unblocks_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = FileDriver::open("in", dir.path().join("idle.mwf"), &DriverConfig::default());
        let handle = input.close_handle();

        let waiter = std::thread::spawn(move || input.recv(None).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        handle.close();

        assert_eq!(waiter.join().unwrap(), Received::Eof);
    }

    #[test]
    fn send_after_eof_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut output =
            FileDriver::create("out", dir.path().join("done.mwf"), &DriverConfig::default())
                .unwrap();
        output.send_eof().unwrap();
        assert!(matches!(output.send(b"late"), Err(CommError::Closed(_))));
    }
}
