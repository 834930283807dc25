use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use modelwire_frame::{Frame, FrameConfig, FrameError, FrameKind, FrameReader, FrameWriter};
use modelwire_transport::{IpcStream, UnixDomainSocket};
use tracing::{debug, info, warn};

use crate::control::{QueueRole, Registration, RegistrationAck, OP_DEREGISTER, OP_REGISTER};
use crate::driver::TransportKind;
use crate::error::Result;
use crate::health::Health;

/// How long shutdown lets consumer writers flush EOF before connections are cut.
const SHUTDOWN_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Outbound side of a registered consumer. Frames sent here are written by
/// that consumer's own thread.
struct ConsumerLink {
    id: u64,
    frames: Sender<Frame>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Frame>,
    consumer: Option<ConsumerLink>,
    next_consumer: u64,
    consumer_seen: bool,
    producers: usize,
    producer_seen: bool,
    eof: bool,
    broken: bool,
}

impl QueueState {
    /// Hand a frame to the consumer, or keep it until one connects. Never
    /// blocks on the consumer's socket.
    fn deliver(&mut self, queue: &str, mut frame: Frame) {
        if let Some(link) = &self.consumer {
            match link.frames.send(frame) {
                Ok(()) => return,
                Err(returned) => frame = returned.into_inner(),
            }
            warn!(queue, "consumer writer gone; buffering");
            self.consumer = None;
        }
        self.pending.push_back(frame);
    }

    /// Drop the link of consumer `id` if it is still the registered one.
    fn release(&mut self, id: u64) -> bool {
        if self.consumer.as_ref().is_some_and(|link| link.id == id) {
            self.consumer = None;
            true
        } else {
            false
        }
    }

    fn health(&self) -> Health {
        if self.broken {
            Health::Broken
        } else if self.consumer_seen && self.consumer.is_none() && !self.eof {
            Health::Degraded
        } else {
            Health::Healthy
        }
    }
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, Arc<Mutex<QueueState>>>>,
    shutting_down: AtomicBool,
    streams: Mutex<Vec<IpcStream>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    consumer_writers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn queue(&self, name: &str) -> Arc<Mutex<QueueState>> {
        let mut queues = lock(&self.queues);
        Arc::clone(queues.entry(name.to_string()).or_default())
    }

    fn existing(&self, name: &str) -> Option<Arc<Mutex<QueueState>>> {
        lock(&self.queues).get(name).cloned()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn consumer_writers_done(&self) -> bool {
        lock(&self.consumer_writers)
            .iter()
            .all(JoinHandle::is_finished)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run-owned message queue service.
///
/// Queue drivers connect over a Unix domain socket and register as producer
/// or consumer of a named queue with a JSON control frame. Frames are
/// forwarded in arrival order; frames sent before the consumer registers are
/// buffered. EOF reaches the consumer once every producer has finished. A
/// producer that disconnects without EOF marks its queue broken.
///
/// Each consumer is written to from its own thread, so a consumer that stops
/// reading holds up neither producers nor [`Broker::shutdown`].
pub struct Broker {
    path: PathBuf,
    shared: Arc<Shared>,
    acceptor: Option<JoinHandle<()>>,
}

impl Broker {
    /// Bind the broker socket and start accepting drivers.
    pub fn start(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        let path = socket.path().to_path_buf();
        let shared = Arc::new(Shared::default());

        let acceptor = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("modelwire-broker".to_string())
                .spawn(move || accept_loop(socket, shared))?
        };

        info!(?path, "queue broker started");
        Ok(Self {
            path,
            shared,
            acceptor: Some(acceptor),
        })
    }

    /// Socket path drivers connect to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Health of a queue, `None` if nothing has registered on it yet.
    pub fn queue_health(&self, queue: &str) -> Option<Health> {
        self.shared
            .existing(queue)
            .map(|state| lock(&state).health())
    }

    /// Names of every queue currently marked broken.
    pub fn broken_queues(&self) -> Vec<String> {
        let queues = lock(&self.shared.queues);
        let mut broken: Vec<String> = queues
            .iter()
            .filter(|(_, state)| lock(state).broken)
            .map(|(name, _)| name.clone())
            .collect();
        broken.sort();
        broken
    }

    /// Whether a driver with `role` has ever registered on `queue`.
    pub fn is_registered(&self, queue: &str, role: QueueRole) -> bool {
        self.shared.existing(queue).is_some_and(|state| {
            let state = lock(&state);
            match role {
                QueueRole::Producer => state.producer_seen,
                QueueRole::Consumer => state.consumer_seen,
            }
        })
    }

    /// Close every queue and stop the broker.
    ///
    /// Connected consumers get EOF queued and a short grace to receive it,
    /// then all connections are shut down and the socket file is removed.
    /// Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(path = ?self.path, "shutting down queue broker");

        let queues: Vec<(String, Arc<Mutex<QueueState>>)> = lock(&self.shared.queues)
            .iter()
            .map(|(name, state)| (name.clone(), Arc::clone(state)))
            .collect();
        for (name, state) in queues {
            let mut state = lock(&state);
            if !state.eof {
                state.eof = true;
                if state.consumer.is_some() {
                    state.deliver(&name, Frame::eof());
                }
            }
            // Dropping the link ends the writer once its backlog is written.
            state.consumer = None;
        }

        let deadline = Instant::now() + SHUTDOWN_FLUSH_GRACE;
        while !self.shared.consumer_writers_done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        for stream in lock(&self.shared.streams).drain(..) {
            let _ = stream.shutdown();
        }

        // Wake the acceptor so it observes the shutdown flag.
        let _ = UnixDomainSocket::connect(&self.path);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.shared.workers).drain(..).collect();
        let writers: Vec<JoinHandle<()>> =
            lock(&self.shared.consumer_writers).drain(..).collect();
        for handle in workers.into_iter().chain(writers) {
            let _ = handle.join();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("path", &self.path).finish()
    }
}

fn accept_loop(socket: UnixDomainSocket, shared: Arc<Shared>) {
    loop {
        let stream = match socket.accept() {
            Ok(stream) => stream,
            Err(err) => {
                if shared.is_shutting_down() {
                    break;
                }
                warn!(error = %err, "broker accept failed");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };
        if shared.is_shutting_down() {
            break;
        }

        match stream.try_clone() {
            Ok(clone) => lock(&shared.streams).push(clone),
            Err(err) => {
                warn!(error = %err, "dropping connection that cannot be tracked");
                continue;
            }
        }

        let worker_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name("modelwire-broker-conn".to_string())
            .spawn(move || {
                if let Err(err) = handle_connection(stream, &worker_shared) {
                    if !worker_shared.is_shutting_down() {
                        warn!(error = %err, "broker connection failed");
                    }
                }
            });
        match spawned {
            Ok(handle) => lock(&shared.workers).push(handle),
            Err(err) => warn!(error = %err, "could not spawn broker connection thread"),
        }
    }
    debug!("broker acceptor stopped");
}

fn broker_frame_config() -> FrameConfig {
    FrameConfig {
        max_chunk_size: TransportKind::Queue.max_frame_size(),
        ..FrameConfig::default()
    }
}

fn handle_connection(stream: IpcStream, shared: &Shared) -> Result<()> {
    let reader_stream = stream.try_clone()?;
    let mut reader = FrameReader::with_config_ipc(reader_stream, broker_frame_config())?;
    let mut writer = FrameWriter::with_config_ipc(stream, broker_frame_config())?;

    let frame = match reader.read_frame() {
        Ok(frame) => frame,
        Err(FrameError::ConnectionClosed) => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    if frame.kind != FrameKind::Control {
        reject(&mut writer, "first frame must be a registration")?;
        return Ok(());
    }
    let registration: Registration = match serde_json::from_slice(&frame.payload) {
        Ok(registration) => registration,
        Err(err) => {
            reject(&mut writer, format!("malformed registration: {err}"))?;
            return Ok(());
        }
    };
    if registration.op != OP_REGISTER {
        reject(&mut writer, format!("unexpected operation '{}'", registration.op))?;
        return Ok(());
    }

    debug!(queue = %registration.queue, role = ?registration.role, "registration");
    match registration.role {
        QueueRole::Producer => serve_producer(shared, &registration.queue, reader, writer),
        QueueRole::Consumer => serve_consumer(shared, &registration.queue, reader, writer),
    }
}

fn reject(writer: &mut FrameWriter<IpcStream>, reason: impl Into<String>) -> Result<()> {
    let ack = RegistrationAck::rejected(reason);
    writer.send_control(&serde_json::to_vec(&ack)?)?;
    Ok(())
}

fn accept(writer: &mut FrameWriter<IpcStream>) -> Result<()> {
    writer.send_control(&serde_json::to_vec(&RegistrationAck::accepted())?)?;
    Ok(())
}

fn serve_consumer(
    shared: &Shared,
    queue: &str,
    mut reader: FrameReader<IpcStream>,
    mut writer: FrameWriter<IpcStream>,
) -> Result<()> {
    let state = shared.queue(queue);
    let (frames, backlog) = crossbeam_channel::unbounded();
    let id = {
        let mut guard = lock(&state);
        if guard.consumer.is_some() {
            drop(guard);
            return reject(&mut writer, format!("queue '{queue}' already has a consumer"));
        }
        let id = guard.next_consumer;
        guard.next_consumer += 1;
        for frame in guard.pending.drain(..) {
            let _ = frames.send(frame);
        }
        guard.consumer = Some(ConsumerLink { id, frames });
        guard.consumer_seen = true;
        id
    };

    let consumer_writer = {
        let state = Arc::clone(&state);
        let queue = queue.to_string();
        std::thread::Builder::new()
            .name("modelwire-broker-out".to_string())
            .spawn(move || write_to_consumer(&queue, id, writer, &backlog, &state))
    };
    match consumer_writer {
        Ok(handle) => lock(&shared.consumer_writers).push(handle),
        Err(err) => {
            lock(&state).release(id);
            return Err(err.into());
        }
    }
    info!(queue, "consumer registered");

    loop {
        match reader.read_frame() {
            Ok(frame) if frame.kind == FrameKind::Control => {
                if is_deregister(&frame) {
                    debug!(queue, "consumer deregistered");
                    break;
                }
            }
            Ok(_) => debug!(queue, "ignoring data frame from consumer"),
            Err(_) => break,
        }
    }

    if lock(&state).release(id) {
        debug!(queue, "consumer left");
    }
    Ok(())
}

/// Acknowledge the registration, then write queued frames until the link is
/// dropped or the connection fails.
fn write_to_consumer(
    queue: &str,
    id: u64,
    mut writer: FrameWriter<IpcStream>,
    backlog: &Receiver<Frame>,
    state: &Mutex<QueueState>,
) {
    if let Err(err) = accept(&mut writer) {
        debug!(queue, error = %err, "consumer gone before acknowledgement");
        requeue(id, Vec::new(), backlog, state);
        return;
    }
    for frame in backlog.iter() {
        if let Err(err) = writer.write_frame(&frame) {
            warn!(queue, error = %err, "consumer connection lost; buffering");
            requeue(id, vec![frame], backlog, state);
            return;
        }
    }
    debug!(queue, "consumer writer finished");
}

/// Return frames the consumer never received to the head of the queue.
fn requeue(
    id: u64,
    mut unsent: Vec<Frame>,
    backlog: &Receiver<Frame>,
    state: &Mutex<QueueState>,
) {
    let mut state = lock(state);
    unsent.extend(backlog.try_iter());
    state.release(id);
    for frame in unsent.into_iter().rev() {
        state.pending.push_front(frame);
    }
}

fn serve_producer(
    shared: &Shared,
    queue: &str,
    mut reader: FrameReader<IpcStream>,
    mut writer: FrameWriter<IpcStream>,
) -> Result<()> {
    let state = shared.queue(queue);
    {
        let mut state = lock(&state);
        if state.eof {
            debug!(queue, "producer joined after EOF was forwarded");
        }
        state.producers += 1;
        state.producer_seen = true;
    }
    accept(&mut writer)?;
    info!(queue, "producer registered");

    // Chunks of one message are forwarded together so messages from several
    // producers never interleave.
    let mut sequence: Vec<Frame> = Vec::new();
    let finished = loop {
        match reader.read_frame() {
            Ok(frame) => match frame.kind {
                FrameKind::Data => {
                    let last = frame.is_last_chunk();
                    sequence.push(frame);
                    if last {
                        let mut state = lock(&state);
                        for frame in sequence.drain(..) {
                            state.deliver(queue, frame);
                        }
                    }
                }
                FrameKind::Eof => break sequence.is_empty(),
                FrameKind::Control => {
                    if is_deregister(&frame) {
                        break sequence.is_empty();
                    }
                }
            },
            Err(FrameError::ConnectionClosed) => break false,
            Err(err) if err.is_protocol_violation() => {
                warn!(queue, error = %err, "producer violated framing");
                break false;
            }
            Err(_) => break false,
        }
    };

    let mut state = lock(&state);
    state.producers = state.producers.saturating_sub(1);
    if finished {
        if state.producers == 0 && !state.eof {
            state.eof = true;
            state.deliver(queue, Frame::eof());
            debug!(queue, "all producers finished; EOF forwarded");
        }
    } else if !shared.is_shutting_down() {
        state.broken = true;
        warn!(queue, "producer disconnected without EOF; queue broken");
    }
    Ok(())
}

fn is_deregister(frame: &Frame) -> bool {
    serde_json::from_slice::<Registration>(&frame.payload)
        .map(|registration| registration.op == OP_DEREGISTER)
        .unwrap_or(false)
}
