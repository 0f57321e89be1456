//! Contract between a push-based query engine and its consumers
//!
//! An engine accepts a statement, runs it on a thread it owns, and reports the
//! outcome through a [`ResultSink`]: schema first, then zero or more row
//! deliveries, then exactly one of `on_complete` or `on_error`. A delivery that
//! answers [`Delivery::Stop`] ends the run quietly with no terminal callback.

use cursorway_common::{Column, ExecutionError, Result, Row, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Answer from a sink after accepting rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Continue,
    Stop,
}

/// Receiver of engine callbacks for one execution
pub trait ResultSink: Send + Sync {
    fn on_schema(&self, columns: Vec<Column>);

    /// May block the engine thread (backpressure)
    fn on_rows(&self, rows: Vec<Row>) -> Delivery;

    fn on_error(&self, error: ExecutionError);

    fn on_complete(&self);
}

/// Push-based query engine
pub trait QueryEngine: Send + Sync {
    /// Queue a statement with positional parameters (bound 1-based).
    fn submit(
        &self,
        query: &str,
        params: Vec<Value>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<ExecutionHandle>;

    /// Best-effort cancellation. Never blocks.
    fn cancel(&self, handle: &ExecutionHandle) {
        handle.cancel();
    }
}

/// Cancellation token for a running execution
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Identifies a submitted execution and carries its cancellation token
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    id: u64,
    token: Arc<CancellationToken>,
}

impl ExecutionHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            token: Arc::new(CancellationToken::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
