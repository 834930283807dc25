//! Couple independently written model programs into one coupled run.
//!
//! Each model is an ordinary subprocess. Its inputs and outputs are framed
//! channels; a router moves records between them, applying per-edge
//! transforms, and an orchestrator supervises the processes and tears the
//! whole graph down when any part fails.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket plumbing
//! - [`frame`]: message framing, chunking and reassembly
//! - [`comm`]: queue, file and pipe drivers, RPC pairs, the queue broker
//! - [`schema`]: JSON Schema checks on delivered records
//! - [`router`]: connection routing, record layouts and transforms
//! - [`orchestrator`]: graph descriptions and supervised runs

/// Re-export transport types.
pub mod transport {
    pub use modelwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use modelwire_frame::*;
}

/// Re-export comm driver types.
pub mod comm {
    pub use modelwire_comm::*;
}

/// Re-export schema types.
pub mod schema {
    pub use modelwire_schema::*;
}

/// Re-export router types.
pub mod router {
    pub use modelwire_router::*;
}

/// Re-export orchestrator types.
pub mod orchestrator {
    pub use modelwire_orchestrator::*;
}
