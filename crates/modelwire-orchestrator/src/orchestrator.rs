use std::collections::HashSet;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use modelwire_comm::{Health, MODEL_ENV};
use modelwire_router::{FunctionRegistry, RouterEvent};
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::error::{OrchestratorError, Result};
use crate::graph::{Graph, ModelSpec};
use crate::launch::LaunchSpec;
use crate::state::{ModelRecord, ModelState};
use crate::summary::{Failure, FailureKind, ModelSummary, RunSummary};
use crate::validate::validate;
use crate::wiring::{wire, Wiring};

/// Requests teardown of a running graph from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs one model graph from launch to teardown.
pub struct Orchestrator {
    graph: Graph,
    config: RunConfig,
    functions: FunctionRegistry,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(graph: Graph, config: RunConfig) -> Self {
        Self {
            graph,
            config,
            functions: FunctionRegistry::new(),
            cancel: CancelHandle::default(),
        }
    }

    /// Functions available to `{ function: name }` transforms.
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Validate, wire and launch the graph, supervise it until every model
    /// is done or one fails, then tear everything down.
    ///
    /// Errors are returned only when nothing was launched. Failures once
    /// models run are reported in the summary.
    pub fn run(self) -> Result<RunSummary> {
        validate(&self.graph, &self.functions)?;
        let started = Instant::now();

        let scratch;
        let run_dir = match &self.config.run_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => {
                scratch = tempfile::Builder::new().prefix("modelwire-").tempdir()?;
                scratch.path().to_path_buf()
            }
        };
        if let Some(dir) = &self.config.log_dir {
            std::fs::create_dir_all(dir)?;
        }

        let records = self
            .graph
            .models
            .iter()
            .map(|model| {
                let mut record = ModelRecord::new(
                    &model.name,
                    LaunchSpec::from_model(model)?,
                    model.endpoint_names(),
                );
                record.wait_for_connect = model.wait_for_connect;
                Ok(record)
            })
            .collect::<Result<Vec<_>>>()?;

        let wiring = wire(&self.graph, &self.config, &self.functions, &run_dir)?;
        info!(models = records.len(), run_dir = ?run_dir, "starting run");

        let mut run = Run {
            graph: &self.graph,
            config: &self.config,
            cancel: &self.cancel,
            records,
            wiring,
            failures: Vec::new(),
            broken: HashSet::new(),
        };
        run.launch();
        run.supervise();
        run.teardown();
        let summary = run.summary(started);

        if summary.success {
            info!(duration_ms = summary.duration_ms, "run finished");
        } else if let Some(failure) = &summary.first_failure {
            error!(
                component = %failure.component,
                kind = %failure.kind,
                duration_ms = summary.duration_ms,
                "run failed: {}",
                failure.message
            );
        }
        Ok(summary)
    }
}

struct Run<'a> {
    graph: &'a Graph,
    config: &'a RunConfig,
    cancel: &'a CancelHandle,
    records: Vec<ModelRecord>,
    wiring: Wiring,
    failures: Vec<Failure>,
    /// Channels already reported broken.
    broken: HashSet<String>,
}

impl Run<'_> {
    fn launch(&mut self) {
        let graph = self.graph;
        for index in 0..self.records.len() {
            let name = self.records[index].name.clone();
            let Some(spec) = graph.model(&name) else {
                continue;
            };
            if let Err(err) = self.records[index].transition(ModelState::Starting) {
                warn!(model = %name, error = %err, "cannot start model");
                continue;
            }
            if let Err(err) = self.spawn(index, spec) {
                let failure = Failure::new(&name, FailureKind::Configuration, err.to_string());
                self.fail(Some(&name), failure);
                return;
            }
        }
    }

    fn spawn(&mut self, index: usize, spec: &ModelSpec) -> Result<()> {
        let record = &mut self.records[index];
        let mut command = record.launch.command();
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        command.env(MODEL_ENV, &record.name);
        for (key, value) in self.config.model_env() {
            command.env(key, value);
        }
        if let Some(endpoints) = self.wiring.env.get(&record.name) {
            command.envs(endpoints.iter().map(|(k, v)| (k, v)));
        }
        command.envs(&spec.env);

        command.stdin(Stdio::null());
        if let Some(dir) = &self.config.log_dir {
            command.stdout(log_file(dir, &record.name, "stdout")?);
            command.stderr(log_file(dir, &record.name, "stderr")?);
        }
        // Own process group, so teardown reaches the model's children too.
        command.process_group(0);

        let child = command.spawn().map_err(|source| OrchestratorError::Spawn {
            model: record.name.clone(),
            source,
        })?;
        info!(model = %record.name, pid = child.id(), language = %record.language(), "model launched");
        record.child = Some(child);
        record.started_at = Some(Instant::now());
        Ok(())
    }

    fn supervise(&mut self) {
        loop {
            if self.cancel.is_cancelled() {
                self.fail(None, Failure::new("run", FailureKind::Interrupted, "run cancelled"));
            }
            if self.failures.is_empty() {
                self.check_exits();
                self.check_router();
                self.check_channels();
                self.check_startup();
            }
            if !self.failures.is_empty() {
                return;
            }
            if self.records.iter().all(|r| r.state().is_terminal()) {
                self.drain_router();
                return;
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn check_exits(&mut self) {
        for index in 0..self.records.len() {
            let record = &mut self.records[index];
            if !matches!(record.state(), ModelState::Starting | ModelState::Running) {
                continue;
            }
            let name = record.name.clone();
            match record.poll_exit() {
                Ok(None) => {}
                Ok(Some(exit)) if exit.success() => {
                    info!(model = %name, "model finished");
                    let done = record
                        .transition(ModelState::Stopping)
                        .and_then(|()| record.transition(ModelState::Stopped));
                    if let Err(err) = done {
                        warn!(model = %name, error = %err, "unexpected state change");
                    }
                }
                Ok(Some(exit)) => self.fail(
                    Some(&name),
                    Failure::new(&name, FailureKind::ProcessExitError, format!("exited with {exit}")),
                ),
                Err(err) => self.fail(
                    Some(&name),
                    Failure::new(&name, FailureKind::ProcessExitError, err.to_string()),
                ),
            }
        }
    }

    fn check_router(&mut self) {
        let events: Vec<RouterEvent> = match &self.wiring.router {
            Some(router) => router.events().try_iter().collect(),
            None => return,
        };
        for event in events {
            debug!(?event, "router event");
            if let Some(failure) = Failure::from_router_event(&event) {
                let owner = self.event_owner(&event);
                self.fail(owner.as_deref(), failure);
            }
        }
    }

    /// Model blamed for a router failure.
    fn event_owner(&self, event: &RouterEvent) -> Option<String> {
        let owner = |endpoint: &str| self.graph.owner_of(endpoint).map(|m| m.name.clone());
        match event {
            RouterEvent::SourceFailed { source, .. } | RouterEvent::DecodeFailed { source, .. } => {
                owner(source)
            }
            RouterEvent::TransformFailed {
                source,
                destination,
                ..
            } => owner(source).or_else(|| owner(destination)),
            RouterEvent::DeliveryFailed { destination, .. } => owner(destination),
            RouterEvent::SourceFinished { .. } | RouterEvent::DestinationFinished { .. } => None,
        }
    }

    fn check_channels(&mut self) {
        let mut broken = Vec::new();
        if let Some(router) = &self.wiring.router {
            broken.extend(
                router
                    .health()
                    .into_iter()
                    .filter(|(_, health)| *health == Health::Broken)
                    .map(|(name, _)| name),
            );
        }
        if let Some(broker) = &self.wiring.broker {
            broken.extend(broker.broken_queues());
        }

        for channel in broken {
            if !self.broken.insert(channel.clone()) {
                continue;
            }
            let owner = self.producer_of(&channel);
            self.fail(
                owner.as_deref(),
                Failure::new(&channel, FailureKind::TransportBroken, "channel is broken"),
            );
        }
    }

    /// Model writing into `channel`: the output's owner, or the RPC side
    /// that sends on it.
    fn producer_of(&self, channel: &str) -> Option<String> {
        let client = self.graph.models.iter().find(|m| {
            m.rpc_clients
                .iter()
                .any(|s| modelwire_comm::request_endpoint(s) == channel)
        });
        client
            .or_else(|| self.graph.owner_of(channel))
            .map(|m| m.name.clone())
    }

    fn check_startup(&mut self) {
        for index in 0..self.records.len() {
            if self.records[index].state() != ModelState::Starting {
                continue;
            }
            let name = self.records[index].name.clone();
            if !self.records[index].wait_for_connect || self.wiring.is_connected(&name) {
                if let Err(err) = self.records[index].transition(ModelState::Running) {
                    warn!(model = %name, error = %err, "unexpected state change");
                }
                continue;
            }
            let waited = self.records[index]
                .started_at
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if waited > self.config.startup_timeout {
                self.fail(
                    Some(&name),
                    Failure::new(
                        &name,
                        FailureKind::Timeout,
                        format!("endpoints not connected within {:?}", self.config.startup_timeout),
                    ),
                );
            }
        }
    }

    /// Let the router deliver what finished models sent before closing it.
    fn drain_router(&mut self) {
        let deadline = Instant::now() + self.config.grace_period;
        loop {
            self.check_router();
            let finished = self
                .wiring
                .router
                .as_ref()
                .is_none_or(|router| router.is_finished());
            if finished || !self.failures.is_empty() {
                self.check_router();
                return;
            }
            if Instant::now() >= deadline {
                warn!("router still busy after every model finished");
                return;
            }
            std::thread::sleep(self.config.poll_interval.min(Duration::from_millis(10)));
        }
    }

    fn fail(&mut self, model: Option<&str>, failure: Failure) {
        error!(
            component = %failure.component,
            kind = %failure.kind,
            "{}",
            failure.message
        );
        if let Some(record) = model.and_then(|m| self.records.iter_mut().find(|r| r.name == m)) {
            if record.state().can_become(ModelState::Failed) {
                if let Err(err) = record.transition(ModelState::Failed) {
                    warn!(model = %record.name, error = %err, "unexpected state change");
                }
            }
        }
        self.failures.push(failure);
    }

    fn teardown(&mut self) {
        for record in &mut self.records {
            if !record.state().is_terminal() {
                if let Err(err) = record.transition(ModelState::Stopping) {
                    warn!(model = %record.name, error = %err, "unexpected state change");
                }
            }
        }

        if let Some(mut router) = self.wiring.router.take() {
            router.close();
        }
        if let Some(broker) = self.wiring.broker.as_mut() {
            broker.shutdown();
        }

        self.signal_all(libc::SIGTERM);
        let deadline = Instant::now() + self.config.grace_period;
        while self.running().next().is_some() && Instant::now() < deadline {
            std::thread::sleep(self.config.poll_interval.min(Duration::from_millis(20)));
        }
        let survivors: Vec<String> = self.running().map(|r| r.name.clone()).collect();
        if !survivors.is_empty() {
            warn!(?survivors, "killing models still alive after the grace period");
            self.signal_all(libc::SIGKILL);
            for record in &mut self.records {
                if let Some(child) = record.child.as_mut() {
                    if record.exit.is_none() {
                        let _ = child.kill();
                        if let Ok(status) = child.wait() {
                            record.exit = Some(crate::state::ExitInfo::from_status(status));
                        }
                    }
                }
            }
        }

        for record in &mut self.records {
            if record.state() == ModelState::Stopping {
                if let Err(err) = record.transition(ModelState::Stopped) {
                    warn!(model = %record.name, error = %err, "unexpected state change");
                }
            }
        }
    }

    /// Records whose process has not been reaped yet.
    fn running(&mut self) -> impl Iterator<Item = &ModelRecord> {
        for record in &mut self.records {
            if let Err(err) = record.poll_exit() {
                debug!(model = %record.name, error = %err, "cannot poll model process");
            }
        }
        self.records
            .iter()
            .filter(|r| r.child.is_some() && r.exit.is_none())
    }

    fn signal_all(&mut self, signal: libc::c_int) {
        for record in self.running().collect::<Vec<_>>() {
            let Some(pid) = record.pid() else {
                continue;
            };
            debug!(model = %record.name, pid, signal, "signalling model");
            // SAFETY: plain kill(2) on the process group we created at spawn.
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
            if rc != 0 {
                debug!(
                    model = %record.name,
                    error = %std::io::Error::last_os_error(),
                    "signal not delivered"
                );
            }
        }
    }

    fn summary(&self, started: Instant) -> RunSummary {
        let success = self.failures.is_empty()
            && self
                .records
                .iter()
                .all(|r| r.state() == ModelState::Stopped && !r.has_failed());
        RunSummary {
            success,
            models: self.records.iter().map(ModelSummary::from).collect(),
            first_failure: self.failures.first().cloned(),
            failures: self.failures.clone(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

fn log_file(dir: &Path, model: &str, stream: &str) -> Result<File> {
    let path: PathBuf = dir.join(format!("{model}.{stream}.log"));
    Ok(File::create(path)?)
}
