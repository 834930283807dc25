use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use modelwire_comm::{CloseHandle, CommDriver, Health, HealthProbe, Received};
use modelwire_schema::SchemaRegistry;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RouterError};
use crate::file::{FileSink, FileSource};
use crate::record::{Format, Layout, Payload};
use crate::transform::{FunctionRegistry, Transform, TransformSpec};

/// Where a source's messages come from.
pub enum SourceInput {
    /// The router side of a model output endpoint.
    Channel(Box<dyn CommDriver>),
    /// A file replayed once, followed by EOF.
    File(FileSource),
}

/// Where a destination's messages go.
pub enum Sink {
    /// The router side of a model input endpoint.
    Channel(Box<dyn CommDriver>),
    File(FileSink),
}

/// Progress and failures reported by router workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A source reached EOF.
    SourceFinished { source: String, messages: u64 },
    /// Every source feeding a destination finished and EOF was forwarded.
    DestinationFinished { destination: String },
    /// A source could not be read any more.
    SourceFailed {
        source: String,
        error: String,
        framing: bool,
    },
    /// A message could not be decoded with its source's layout.
    DecodeFailed { source: String, error: String },
    /// A branch's transform, re-encoding or datatype check failed. The
    /// branch is disabled.
    TransformFailed {
        source: String,
        destination: String,
        error: String,
        message: String,
    },
    /// Delivery to a destination failed. The branch is disabled.
    DeliveryFailed {
        source: String,
        destination: String,
        error: String,
    },
}

impl RouterEvent {
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            RouterEvent::SourceFinished { .. } | RouterEvent::DestinationFinished { .. }
        )
    }
}

struct Destination {
    name: String,
    layout: Layout,
    sink: Mutex<Sink>,
    feeders: AtomicUsize,
    finished: AtomicBool,
}

impl Destination {
    fn lock(&self) -> std::sync::MutexGuard<'_, Sink> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_channel(&self) -> bool {
        matches!(*self.lock(), Sink::Channel(_))
    }

    fn heartbeat(&self) -> Result<()> {
        match &mut *self.lock() {
            Sink::Channel(driver) => Ok(driver.send(&[])?),
            Sink::File(_) => Ok(()),
        }
    }

    fn deliver(&self, payload: &Payload) -> Result<()> {
        let mut sink = self.lock();
        match &mut *sink {
            Sink::Channel(driver) => {
                let bytes = self.layout.encode(&self.name, payload)?;
                driver.send(&bytes)?;
            }
            Sink::File(file) => file.write(payload)?,
        }
        Ok(())
    }

    /// Forward EOF once. Returns true if this call did it.
    fn finish(&self) -> Result<bool> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        match &mut *self.lock() {
            Sink::Channel(driver) => driver.close()?,
            Sink::File(file) => file.finish()?,
        }
        Ok(true)
    }
}

struct Branch {
    destination: Arc<Destination>,
    transform: Option<Transform>,
}

impl Branch {
    /// Transform a private copy of `payload` for this branch and check it
    /// against the destination's layout and datatype.
    fn prepare(&self, payload: &Payload, schemas: &SchemaRegistry) -> Result<Payload> {
        let dest = &self.destination;
        let payload = match (&self.transform, payload) {
            (Some(transform), Payload::Record(record)) => {
                Payload::Record(transform.apply(record.clone())?)
            }
            (Some(_), Payload::Raw(_)) => {
                return Err(RouterError::transform("cannot transform a raw payload"));
            }
            (None, payload) => payload.clone(),
        };

        match payload {
            Payload::Record(record) => {
                let record = dest.layout.conform(&dest.name, &record)?;
                if schemas.has_schema(&dest.name) {
                    schemas.validate_value(&dest.name, &record.to_json())?;
                }
                Ok(Payload::Record(record))
            }
            Payload::Raw(bytes) => {
                if schemas.has_schema(&dest.name) {
                    schemas.validate(&dest.name, &bytes)?;
                }
                Ok(Payload::Raw(bytes))
            }
        }
    }
}

struct Route {
    name: String,
    layout: Layout,
    branches: Vec<Branch>,
}

/// Collects sources, destinations and edges, then builds a [`Router`].
pub struct RouterBuilder {
    functions: FunctionRegistry,
    schemas: SchemaRegistry,
    sources: Vec<(String, Layout, SourceInput)>,
    destinations: Vec<(String, Layout, Sink)>,
    edges: Vec<(String, String, Option<TransformSpec>)>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            functions: FunctionRegistry::new(),
            schemas: SchemaRegistry::new(),
            sources: Vec::new(),
            destinations: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Functions available to `{ function: name }` transforms.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Datatypes checked on delivery, keyed by destination name.
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn source(mut self, name: impl Into<String>, layout: Layout, input: SourceInput) -> Self {
        self.sources.push((name.into(), layout, input));
        self
    }

    pub fn destination(mut self, name: impl Into<String>, layout: Layout, sink: Sink) -> Self {
        self.destinations.push((name.into(), layout, sink));
        self
    }

    pub fn edge(
        mut self,
        source: impl Into<String>,
        destination: impl Into<String>,
        transform: Option<TransformSpec>,
    ) -> Self {
        self.edges.push((source.into(), destination.into(), transform));
        self
    }

    /// Resolve transforms and check the routing table.
    ///
    /// Every source must feed at least one destination and every
    /// destination must be fed. A source feeds a destination at most once.
    pub fn build(self) -> Result<Router> {
        let config_err = |message: String| Err(RouterError::Configuration(message));

        let mut destinations: HashMap<String, Arc<Destination>> = HashMap::new();
        let mut destination_order = Vec::new();
        for (name, layout, sink) in self.destinations {
            if destinations.contains_key(&name) {
                return config_err(format!("destination '{name}' declared twice"));
            }
            destination_order.push(name.clone());
            destinations.insert(
                name.clone(),
                Arc::new(Destination {
                    name,
                    layout,
                    sink: Mutex::new(sink),
                    feeders: AtomicUsize::new(0),
                    finished: AtomicBool::new(false),
                }),
            );
        }

        let mut source_layouts: HashMap<&str, &Layout> = HashMap::new();
        for (name, layout, _) in &self.sources {
            if source_layouts.insert(name.as_str(), layout).is_some() {
                return config_err(format!("source '{name}' declared twice"));
            }
        }

        let mut branches: HashMap<String, Vec<Branch>> = HashMap::new();
        let mut seen = HashSet::new();
        for (source, destination, spec) in &self.edges {
            let Some(layout) = source_layouts.get(source.as_str()) else {
                return config_err(format!("edge from undeclared source '{source}'"));
            };
            let Some(dest) = destinations.get(destination) else {
                return config_err(format!("edge to undeclared destination '{destination}'"));
            };
            if !seen.insert((source.clone(), destination.clone())) {
                return config_err(format!("'{source}' feeds '{destination}' twice"));
            }
            let transform = match spec {
                Some(spec) if layout.format == Format::Raw => {
                    return config_err(format!(
                        "transform {spec:?} on '{source}', which carries raw bytes"
                    ));
                }
                Some(spec) => Some(spec.resolve(&self.functions)?),
                None => None,
            };
            dest.feeders.fetch_add(1, Ordering::Relaxed);
            branches.entry(source.clone()).or_default().push(Branch {
                destination: Arc::clone(dest),
                transform,
            });
        }

        for name in &destination_order {
            if destinations[name].feeders.load(Ordering::Relaxed) == 0 {
                return config_err(format!("destination '{name}' is not fed by any source"));
            }
        }

        let mut routes = Vec::new();
        for (name, layout, input) in self.sources {
            let Some(branches) = branches.remove(&name) else {
                return config_err(format!("output '{name}' is not connected to anything"));
            };
            routes.push((
                Route {
                    name,
                    layout,
                    branches,
                },
                input,
            ));
        }

        Ok(Router {
            routes,
            destinations: destination_order
                .iter()
                .filter_map(|name| destinations.remove(name))
                .collect(),
            schemas: Arc::new(self.schemas),
        })
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated routing table, ready to start.
///
/// The fan-out map is fixed at build time; workers only read it.
pub struct Router {
    routes: Vec<(Route, SourceInput)>,
    destinations: Vec<Arc<Destination>>,
    schemas: Arc<SchemaRegistry>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.routes.iter().map(|(r, _)| r.name.as_str()).collect()
    }

    pub fn destination_names(&self) -> Vec<&str> {
        self.destinations.iter().map(|d| d.name.as_str()).collect()
    }

    /// Spawn one worker thread per source.
    pub fn start(self) -> Result<RouterHandle> {
        let (events_tx, events_rx) = unbounded();
        let stopping = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        let mut closers = Vec::new();
        let mut probes = Vec::new();

        for destination in &self.destinations {
            if let Sink::Channel(driver) = &*destination.lock() {
                probes.push((destination.name.clone(), driver.health()));
            }
        }

        for (route, input) in self.routes {
            if let SourceInput::Channel(driver) = &input {
                closers.push(driver.close_handle());
                probes.push((route.name.clone(), driver.health()));
            }
            let worker = Worker {
                route,
                schemas: Arc::clone(&self.schemas),
                events: events_tx.clone(),
                stopping: Arc::clone(&stopping),
            };
            let handle = std::thread::Builder::new()
                .name(format!("route-{}", worker.route.name))
                .spawn(move || worker.run(input))?;
            workers.push(handle);
        }
        info!(
            sources = workers.len(),
            destinations = self.destinations.len(),
            "router started"
        );

        Ok(RouterHandle {
            events: events_rx,
            workers,
            closers,
            probes,
            destinations: self.destinations,
            stopping,
        })
    }
}

struct Worker {
    route: Route,
    schemas: Arc<SchemaRegistry>,
    events: Sender<RouterEvent>,
    stopping: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, input: SourceInput) {
        let source = self.route.name.clone();
        let mut disabled = vec![false; self.route.branches.len()];
        let mut messages = 0u64;

        let completed = match input {
            SourceInput::Channel(mut driver) => {
                let completed = self.pump_channel(&mut *driver, &mut disabled, &mut messages);
                if let Err(err) = driver.close() {
                    debug!(source = %source, error = %err, "closing source failed");
                }
                completed
            }
            SourceInput::File(file) => self.pump_file(&file, &mut disabled, &mut messages),
        };

        if !completed {
            return;
        }
        debug!(source = %source, messages, "source finished");
        self.emit(RouterEvent::SourceFinished {
            source: source.clone(),
            messages,
        });

        for branch in &self.route.branches {
            let dest = &branch.destination;
            if dest.feeders.fetch_sub(1, Ordering::AcqRel) != 1 {
                continue;
            }
            match dest.finish() {
                Ok(true) => {
                    debug!(destination = %dest.name, "EOF forwarded");
                    self.emit(RouterEvent::DestinationFinished {
                        destination: dest.name.clone(),
                    });
                }
                Ok(false) => {}
                Err(err) => self.emit(RouterEvent::DeliveryFailed {
                    source: source.clone(),
                    destination: dest.name.clone(),
                    error: err.to_string(),
                }),
            }
        }
    }

    /// Returns false if the source failed.
    fn pump_channel(
        &self,
        driver: &mut dyn CommDriver,
        disabled: &mut [bool],
        messages: &mut u64,
    ) -> bool {
        loop {
            match driver.recv(None) {
                Ok(Received::Message(bytes)) => {
                    *messages += 1;
                    self.route_bytes(bytes, disabled);
                }
                Ok(Received::Timeout) => continue,
                Ok(Received::Eof) => return true,
                Err(err) => {
                    error!(source = %self.route.name, error = %err, "source failed");
                    self.emit(RouterEvent::SourceFailed {
                        source: self.route.name.clone(),
                        error: err.to_string(),
                        framing: err.is_framing(),
                    });
                    return false;
                }
            }
        }
    }

    fn pump_file(&self, file: &FileSource, disabled: &mut [bool], messages: &mut u64) -> bool {
        let payloads = match file.read() {
            Ok(payloads) => payloads,
            Err(err) => {
                error!(source = %self.route.name, error = %err, "file source failed");
                self.emit(RouterEvent::SourceFailed {
                    source: self.route.name.clone(),
                    error: err.to_string(),
                    framing: false,
                });
                return false;
            }
        };
        for payload in payloads {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            *messages += 1;
            self.fan_out(&payload, disabled);
        }
        true
    }

    fn route_bytes(&self, bytes: Bytes, disabled: &mut [bool]) {
        if bytes.is_empty() {
            for (branch, off) in self.route.branches.iter().zip(disabled.iter_mut()) {
                if *off || !branch.destination.is_channel() {
                    continue;
                }
                if let Err(err) = branch.destination.heartbeat() {
                    self.fail_branch(branch, off, err, "<heartbeat>");
                }
            }
            return;
        }

        match self.route.layout.decode(&self.route.name, &bytes) {
            Ok(payload) => self.fan_out(&payload, disabled),
            Err(err) => {
                warn!(source = %self.route.name, error = %err, "undecodable message dropped");
                self.emit(RouterEvent::DecodeFailed {
                    source: self.route.name.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    fn fan_out(&self, payload: &Payload, disabled: &mut [bool]) {
        for (branch, off) in self.route.branches.iter().zip(disabled.iter_mut()) {
            if *off {
                continue;
            }
            let delivered = branch
                .prepare(payload, &self.schemas)
                .and_then(|prepared| branch.destination.deliver(&prepared));
            if let Err(err) = delivered {
                self.fail_branch(branch, off, err, &describe(payload));
            }
        }
    }

    fn fail_branch(&self, branch: &Branch, off: &mut bool, err: RouterError, context: &str) {
        *off = true;
        let source = self.route.name.clone();
        let destination = branch.destination.name.clone();
        let error = err.to_string();
        match err {
            RouterError::Comm(_) | RouterError::Io(_) => {
                error!(%source, %destination, %error, "delivery failed, branch disabled");
                self.emit(RouterEvent::DeliveryFailed {
                    source,
                    destination,
                    error,
                });
            }
            _ => {
                error!(
                    %source,
                    %destination,
                    %error,
                    message = context,
                    "transform failed, branch disabled"
                );
                self.emit(RouterEvent::TransformFailed {
                    source,
                    destination,
                    error,
                    message: context.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: RouterEvent) {
        // Nobody listening is fine; the handle may already be gone.
        let _ = self.events.send(event);
    }
}

/// Short rendering of a message for error context.
fn describe(payload: &Payload) -> String {
    const MAX: usize = 200;
    let text = match payload {
        Payload::Record(record) => record.to_json().to_string(),
        Payload::Raw(bytes) => format!("{} raw bytes", bytes.len()),
    };
    if text.chars().count() > MAX {
        text.chars().take(MAX).collect::<String>() + "..."
    } else {
        text
    }
}

/// A running router.
pub struct RouterHandle {
    events: Receiver<RouterEvent>,
    workers: Vec<JoinHandle<()>>,
    closers: Vec<CloseHandle>,
    probes: Vec<(String, HealthProbe)>,
    destinations: Vec<Arc<Destination>>,
    stopping: Arc<AtomicBool>,
}

impl RouterHandle {
    /// Events from the workers, in the order they happened per worker.
    pub fn events(&self) -> &Receiver<RouterEvent> {
        &self.events
    }

    /// Health of every router-side channel, by endpoint name.
    pub fn health(&self) -> Vec<(String, Health)> {
        self.probes
            .iter()
            .map(|(name, probe)| (name.clone(), probe.get()))
            .collect()
    }

    /// True once every source worker has exited.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }

    /// Wait for every source to reach EOF or fail.
    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("router worker panicked");
            }
        }
    }

    /// Stop routing: close every source so blocked receives return EOF,
    /// wait for the workers, then close destinations still open.
    pub fn close(&mut self) {
        self.stopping.store(true, Ordering::Release);
        for closer in &self.closers {
            closer.close();
        }
        self.join();
        for destination in &self.destinations {
            if let Err(err) = destination.finish() {
                debug!(destination = %destination.name, error = %err, "closing destination failed");
            }
        }
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle")
            .field("workers", &self.workers.len())
            .field("destinations", &self.destinations.len())
            .finish()
    }
}
