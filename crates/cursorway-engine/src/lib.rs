//! cursorway query engine
//!
//! The push-based engine contract consumed by the gateway, and its embedded
//! DuckDB implementation.

pub mod arrow;
pub mod engine;
pub mod executor;

pub use engine::{CancellationToken, Delivery, ExecutionHandle, QueryEngine, ResultSink};
pub use executor::{DuckDbDatabase, DuckDbSession, TxControl, IN_MEMORY};
