//! Supervision of a modelwire model graph.
//!
//! An [`Orchestrator`] takes a [`Graph`] (loaded from YAML or JSON), checks
//! it, starts the queue broker, opens the router side of every endpoint,
//! launches each model as a subprocess with its endpoint addresses in the
//! environment and watches exit codes and channel health. The first failure
//! tears the whole graph down; the run ends with a [`RunSummary`].

pub mod config;
pub mod error;
pub mod graph;
pub mod launch;
pub mod orchestrator;
pub mod state;
pub mod summary;
pub mod validate;
mod wiring;

pub use config::RunConfig;
pub use error::{OrchestratorError, Result};
pub use graph::{
    ConnectionSpec, DestinationSpec, EndpointSpec, Graph, Language, ModelSpec, RunSection,
};
pub use launch::LaunchSpec;
pub use orchestrator::{CancelHandle, Orchestrator};
pub use state::{ExitInfo, ModelRecord, ModelState};
pub use summary::{Failure, FailureKind, ModelSummary, RunSummary};
pub use validate::{issues, validate};
