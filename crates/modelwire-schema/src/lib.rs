//! JSON Schema datatypes for modelwire endpoints.
//!
//! An endpoint may declare a `datatype` schema in the graph description.
//! The router validates each record against its destination's schema after
//! transforms run, so a mismatch surfaces as a transform failure on that
//! branch instead of a confusing failure inside the receiving model.

pub mod error;
pub mod registry;

pub use error::{Result, SchemaError};
pub use registry::SchemaRegistry;
