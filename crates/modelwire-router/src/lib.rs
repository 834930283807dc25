//! Connection router for modelwire graphs.
//!
//! The router owns the router side of every model endpoint. One worker thread
//! per source reads messages, decodes them with the source's [`Layout`],
//! hands each destination its own copy (transformed when the edge carries a
//! [`Transform`]), and delivers it to a channel or a file sink. The fan-out
//! table is fixed when the router is built.

pub mod cformat;
pub mod error;
pub mod file;
pub mod record;
pub mod router;
pub mod transform;

pub use cformat::{CFormat, RowError};
pub use error::{Result, RouterError};
pub use file::{FileSink, FileSource, FileSpec};
pub use record::{Field, FieldSpec, Format, Layout, Payload, Record, Value};
pub use router::{Router, RouterBuilder, RouterEvent, RouterHandle, Sink, SourceInput};
pub use transform::{Expression, FunctionRegistry, Transform, TransformFn, TransformSpec};
