use std::fmt;
use std::process::Child;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::graph::Language;
use crate::launch::LaunchSpec;

/// Lifecycle of one model process.
///
/// `Declared → Starting → Running → Stopping → Stopped`, with `Failed`
/// reachable from `Starting` and `Running`. `Stopped` and `Failed` are
/// terminal. Records that never launched go straight to `Stopping` on
/// teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Declared,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ModelState {
    pub fn can_become(self, next: ModelState) -> bool {
        use ModelState::*;
        matches!(
            (self, next),
            (Declared, Starting)
                | (Declared, Stopping)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ModelState::Stopped | ModelState::Failed)
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelState::Declared => "declared",
            ModelState::Starting => "starting",
            ModelState::Running => "running",
            ModelState::Stopping => "stopping",
            ModelState::Stopped => "stopped",
            ModelState::Failed => "failed",
        })
    }
}

/// How a model process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Everything the orchestrator tracks for one model.
pub struct ModelRecord {
    pub name: String,
    pub launch: LaunchSpec,
    /// Endpoint names bound to this model, RPC queues included.
    pub endpoints: Vec<String>,
    pub wait_for_connect: bool,
    state: ModelState,
    history: Vec<ModelState>,
    pub(crate) child: Option<Child>,
    pub exit: Option<ExitInfo>,
    pub started_at: Option<Instant>,
}

impl ModelRecord {
    pub fn new(name: impl Into<String>, launch: LaunchSpec, endpoints: Vec<String>) -> Self {
        Self {
            name: name.into(),
            launch,
            endpoints,
            wait_for_connect: false,
            state: ModelState::Declared,
            history: vec![ModelState::Declared],
            child: None,
            exit: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    /// Every state this record passed through, oldest first.
    pub fn history(&self) -> &[ModelState] {
        &self.history
    }

    pub fn language(&self) -> Language {
        self.launch.language()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn has_failed(&self) -> bool {
        self.history.contains(&ModelState::Failed)
    }

    pub fn transition(&mut self, next: ModelState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(OrchestratorError::InvalidTransition {
                model: self.name.clone(),
                from: self.state,
                to: next,
            });
        }
        match next {
            ModelState::Failed => info!(model = %self.name, from = %self.state, "model failed"),
            _ => debug!(model = %self.name, from = %self.state, to = %next, "model state change"),
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Check whether the process has exited, recording how.
    pub(crate) fn poll_exit(&mut self) -> std::io::Result<Option<ExitInfo>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let exit = child.try_wait()?.map(ExitInfo::from_status);
        if exit.is_some() {
            self.exit = exit;
        }
        Ok(exit)
    }
}

impl fmt::Debug for ModelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRecord")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .field("exit", &self.exit)
            .finish()
    }
}
