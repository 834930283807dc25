//! Comm drivers for modelwire endpoints.
//!
//! Every endpoint of a model graph is served by one [`CommDriver`]: a queue
//! driver talking to the run's [`Broker`] over a Unix domain socket, a file
//! driver appending frames to (or tailing) a file, or an in-process pipe. All
//! of them share the framed message contract of `modelwire-frame`: blocking
//! send, receive with timeout, EOF and heartbeats.
//!
//! Models find their endpoints through environment variables set by the
//! orchestrator; [`open_input`] and [`open_output`] resolve them.

pub mod address;
pub mod broker;
pub mod connector;
pub mod control;
pub mod driver;
pub mod error;
pub mod file;
pub mod health;
pub mod pipe;
pub mod queue;
pub mod rpc;

pub use address::{endpoint_env_var, Address, ENDPOINT_ENV_PREFIX, MODEL_ENV};
pub use broker::Broker;
pub use connector::{address_from_env, open, open_input, open_output};
pub use control::{QueueRole, Registration, RegistrationAck};
pub use driver::{
    CloseHandle, CommDriver, Direction, DriverConfig, RecvPolicy, TransportKind,
    REASSEMBLY_TIMEOUT_ENV, RECV_RETRIES_ENV, RECV_TIMEOUT_ENV,
};
pub use error::{CommError, Result};
pub use file::FileDriver;
pub use health::{Health, HealthProbe};
pub use modelwire_frame::Received;
pub use pipe::PipeDriver;
pub use queue::QueueDriver;
pub use rpc::{
    request_endpoint, response_endpoint, RpcClient, RpcConfig, RpcServer, RPC_RETRIES_ENV,
    RPC_TIMEOUT_ENV,
};
