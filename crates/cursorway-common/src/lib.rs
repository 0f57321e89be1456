//! cursorway common library
//!
//! Shared error taxonomy, configuration, result model and the wire codec
//! used by the engine and the gateway.

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use codec::TypeClass;
pub use config::GatewayConfig;
pub use error::{CursorwayError, ExecutionError, Result};
pub use types::{Column, Row, SqlType, Value};
