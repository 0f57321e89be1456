//! Bridge between the push-based engine and pull-based fetch requests
//!
//! Each cursor owns one [`ExecutionBridge`]. Every execute swaps a fresh
//! [`Execution`] into the bridge and retires the one it replaces, so callbacks
//! from a stale engine run never reach the new execution's buffer or error slot.

use crate::metrics;
use crate::row_channel::{FetchLimit, RowChannel};
use cursorway_common::{Column, CursorwayError, ExecutionError, Result, Row, Value};
use cursorway_engine::{Delivery, ExecutionHandle, QueryEngine, ResultSink};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Submitted, schema not yet known
    Running,
    /// Schema known, rows may still be streaming
    Described,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Running => "running",
            ExecutionState::Described => "described",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        }
    }
}

/// One run of a query on behalf of a cursor
pub struct Execution {
    id: u64,
    query: String,
    columns: OnceCell<Vec<Column>>,
    rows: RowChannel,
    error: Mutex<Option<ExecutionError>>,
    state: watch::Sender<ExecutionState>,
    superseded: AtomicBool,
    handle: Mutex<Option<ExecutionHandle>>,
    started: Instant,
}

impl Execution {
    fn new(id: u64, query: String, row_capacity: usize) -> Self {
        let (state, _) = watch::channel(ExecutionState::Running);
        Self {
            id,
            query,
            columns: OnceCell::new(),
            rows: RowChannel::new(row_capacity),
            error: Mutex::new(None),
            state,
            superseded: AtomicBool::new(false),
            handle: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    pub fn columns(&self) -> Vec<Column> {
        self.columns.get().cloned().unwrap_or_default()
    }

    fn completion(&self) -> Completion {
        Completion {
            state: self.state.subscribe(),
        }
    }

    /// Move forward in the lifecycle. Terminal states are final.
    fn transition(&self, next: ExecutionState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            if next == ExecutionState::Described && *state != ExecutionState::Running {
                return false;
            }
            *state = next;
            true
        });

        if changed && next.is_terminal() {
            let elapsed = self.started.elapsed().as_secs_f64();
            metrics::record_execution(next.as_str(), elapsed);
            debug!(
                execution_id = self.id,
                state = next.as_str(),
                elapsed_secs = elapsed,
                "Execution finished"
            );
        }
        changed
    }

    fn fail(&self, error: ExecutionError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.rows.close();
        self.transition(ExecutionState::Failed);
    }

    fn take_error(&self) -> Option<ExecutionError> {
        self.error.lock().take()
    }

    /// Detach from the cursor: unblock consumers, resolve as cancelled, stop the engine.
    fn retire(&self, engine: &dyn QueryEngine) {
        if self.superseded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.rows.close();
        self.transition(ExecutionState::Cancelled);
        if let Some(handle) = self.handle.lock().as_ref() {
            engine.cancel(handle);
        }
    }
}

/// Engine callbacks for one execution
struct ExecutionSink {
    execution: Arc<Execution>,
}

impl ResultSink for ExecutionSink {
    fn on_schema(&self, columns: Vec<Column>) {
        if self.execution.is_superseded() {
            return;
        }
        let _ = self.execution.columns.set(columns);
        self.execution.transition(ExecutionState::Described);
    }

    fn on_rows(&self, rows: Vec<Row>) -> Delivery {
        if self.execution.is_superseded() {
            return Delivery::Stop;
        }
        match self.execution.rows.push(rows) {
            Ok(()) => Delivery::Continue,
            Err(_) => Delivery::Stop,
        }
    }

    fn on_error(&self, error: ExecutionError) {
        if self.execution.is_superseded() {
            return;
        }
        debug!(execution_id = self.execution.id, error = %error, "Execution failed");
        self.execution.fail(error);
    }

    fn on_complete(&self) {
        if self.execution.is_superseded() {
            return;
        }
        self.execution.rows.close();
        self.execution.transition(ExecutionState::Completed);
    }
}

/// Awaitable view of an execution's lifecycle
#[derive(Clone)]
pub struct Completion {
    state: watch::Receiver<ExecutionState>,
}

impl Completion {
    /// Resolves once the execution completed, failed or was cancelled
    pub async fn finished(self) -> ExecutionState {
        self.wait(ExecutionState::is_terminal).await
    }

    /// Resolves once the schema is known or the execution is terminal
    pub async fn ready(self) -> ExecutionState {
        self.wait(|state| state != ExecutionState::Running).await
    }

    async fn wait(mut self, done: impl Fn(ExecutionState) -> bool) -> ExecutionState {
        let reached = match self.state.wait_for(|state| done(*state)).await {
            Ok(state) => *state,
            // Sender dropped without reaching a terminal state
            Err(_) => ExecutionState::Cancelled,
        };
        reached
    }
}

/// Rows taken by one fetch together with the schema they belong to
#[derive(Debug)]
pub struct FetchedRows {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
    pub finished: bool,
}

/// Owns the current execution of a cursor
pub struct ExecutionBridge {
    engine: Arc<dyn QueryEngine>,
    current: Mutex<Option<Arc<Execution>>>,
    last_query: Mutex<Option<String>>,
    row_capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ExecutionBridge {
    pub fn new(engine: Arc<dyn QueryEngine>, row_capacity: usize) -> Self {
        Self {
            engine,
            current: Mutex::new(None),
            last_query: Mutex::new(None),
            row_capacity,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Start a new execution, retiring the current one.
    ///
    /// `None` re-runs the last query text with the new parameters.
    pub fn execute(&self, query: Option<String>, params: Vec<Value>) -> Result<Completion> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CursorwayError::NotFound("cursor is closed".into()));
        }

        let query = {
            let mut last = self.last_query.lock();
            if let Some(query) = query {
                *last = Some(query);
            }
            last.clone().ok_or(CursorwayError::NoQuery)?
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let execution = Arc::new(Execution::new(id, query, self.row_capacity));
        let completion = execution.completion();

        let previous = self.current.lock().replace(execution.clone());
        if let Some(previous) = previous {
            debug!(
                execution_id = previous.id,
                buffered_rows = previous.rows.buffered(),
                "Retiring execution superseded by {}", id
            );
            previous.retire(self.engine.as_ref());
        }

        let sink = Arc::new(ExecutionSink {
            execution: execution.clone(),
        });
        match self.engine.submit(&execution.query, params, sink) {
            Ok(handle) => {
                *execution.handle.lock() = Some(handle.clone());
                // Lost a race with a newer execute or close
                if execution.is_superseded() {
                    self.engine.cancel(&handle);
                }
            }
            Err(e) => {
                warn!(execution_id = id, "Failed to submit query: {}", e);
                execution.fail(ExecutionError::new(e.to_string()));
            }
        }

        Ok(completion)
    }

    fn current(&self) -> Option<Arc<Execution>> {
        self.current.lock().clone()
    }

    /// Take the current execution's pending error, if any
    pub fn fetch_error(&self) -> Option<ExecutionError> {
        self.current().and_then(|execution| execution.take_error())
    }

    pub fn have_query(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn columns(&self) -> Vec<Column> {
        self.current()
            .map(|execution| execution.columns())
            .unwrap_or_default()
    }

    /// Block until rows are available per `limit` or the stream ends
    pub fn fetch(&self, limit: FetchLimit) -> Result<FetchedRows> {
        let execution = self.current().ok_or(CursorwayError::NoQuery)?;
        let rows = execution.rows.fetch(limit);
        Ok(FetchedRows {
            columns: execution.columns(),
            rows,
            finished: execution.rows.is_finished(),
        })
    }

    /// Retire the current execution. The bridge accepts no further work.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(execution) = self.current() {
            execution.retire(self.engine.as_ref());
        }
    }
}

impl Drop for ExecutionBridge {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cursorway_common::SqlType;
    use std::collections::HashMap;
    use std::thread;
    use std::time::Duration;

    /// What the scripted engine does for a given query text
    #[derive(Clone)]
    pub(crate) enum Script {
        /// Schema, then `rows` single-column rows in chunks, then complete
        Rows { rows: i64, chunk: usize },
        /// Schema, `rows` rows, then an error
        FailAfter { rows: i64, message: String },
        /// Error before any schema
        FailImmediately(String),
        /// Schema, then block until cancelled
        Hang,
        /// No callbacks; the test drives the recorded sink itself
        Manual,
    }

    /// Engine that runs each submission on its own thread following a script
    pub(crate) struct ScriptedEngine {
        scripts: HashMap<String, Script>,
        next_id: AtomicU64,
        pub(crate) submissions: Mutex<Vec<(String, Vec<Value>)>>,
        pub(crate) sinks: Mutex<Vec<Arc<dyn ResultSink>>>,
    }

    impl ScriptedEngine {
        pub(crate) fn new(scripts: Vec<(&str, Script)>) -> Self {
            Self {
                scripts: scripts
                    .into_iter()
                    .map(|(query, script)| (query.to_string(), script))
                    .collect(),
                next_id: AtomicU64::new(1),
                submissions: Mutex::new(Vec::new()),
                sinks: Mutex::new(Vec::new()),
            }
        }

        fn run(script: Script, handle: ExecutionHandle, sink: Arc<dyn ResultSink>) {
            let schema = || vec![Column::new("n", SqlType::BigInt)];
            let deliver = |range: std::ops::Range<i64>, chunk: usize| -> bool {
                let rows: Vec<Row> = range.map(|i| Row::new(vec![Value::Int(i)])).collect();
                for part in rows.chunks(chunk.max(1)) {
                    if handle.is_cancelled() || sink.on_rows(part.to_vec()) == Delivery::Stop {
                        return false;
                    }
                }
                true
            };

            match script {
                Script::Rows { rows, chunk } => {
                    sink.on_schema(schema());
                    if deliver(0..rows, chunk) {
                        sink.on_complete();
                    }
                }
                Script::FailAfter { rows, message } => {
                    sink.on_schema(schema());
                    if deliver(0..rows, 1) {
                        sink.on_error(ExecutionError::with_cause(message, "scripted failure"));
                    }
                }
                Script::FailImmediately(message) => {
                    sink.on_error(ExecutionError::new(message));
                }
                Script::Hang => {
                    sink.on_schema(schema());
                    while !handle.is_cancelled() {
                        thread::sleep(Duration::from_millis(5));
                    }
                }
                Script::Manual => {}
            }
        }
    }

    impl QueryEngine for ScriptedEngine {
        fn submit(
            &self,
            query: &str,
            params: Vec<Value>,
            sink: Arc<dyn ResultSink>,
        ) -> Result<ExecutionHandle> {
            let script = self
                .scripts
                .get(query)
                .cloned()
                .ok_or_else(|| CursorwayError::DatabaseError(format!("no script for {}", query)))?;
            self.submissions.lock().push((query.to_string(), params));
            self.sinks.lock().push(sink.clone());

            let handle = ExecutionHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst));
            let worker_handle = handle.clone();
            thread::spawn(move || ScriptedEngine::run(script, worker_handle, sink));
            Ok(handle)
        }
    }

    fn bridge(scripts: Vec<(&str, Script)>, capacity: usize) -> (Arc<ScriptedEngine>, ExecutionBridge) {
        let engine = Arc::new(ScriptedEngine::new(scripts));
        let bridge = ExecutionBridge::new(engine.clone(), capacity);
        (engine, bridge)
    }

    fn values(fetched: &FetchedRows) -> Vec<i64> {
        fetched
            .rows
            .iter()
            .map(|row| match row.values[0] {
                Value::Int(v) => v,
                ref other => panic!("unexpected value {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_fetch_before_execute_is_no_query() {
        let (_, bridge) = bridge(vec![], 50);
        assert!(!bridge.have_query());
        assert!(matches!(
            bridge.fetch(FetchLimit::AtMost(1)),
            Err(CursorwayError::NoQuery)
        ));
        assert!(bridge.columns().is_empty());
        assert!(bridge.fetch_error().is_none());
    }

    #[test]
    fn test_execute_without_text_needs_a_previous_query() {
        let (_, bridge) = bridge(vec![], 50);
        assert!(matches!(
            bridge.execute(None, vec![]),
            Err(CursorwayError::NoQuery)
        ));
        assert!(!bridge.have_query());
    }

    #[tokio::test]
    async fn test_rerun_reuses_last_query_with_new_params() {
        let (engine, bridge) = bridge(vec![("q", Script::Rows { rows: 1, chunk: 1 })], 50);

        let first = bridge.execute(Some("q".into()), vec![Value::Int(1)]).unwrap();
        assert_eq!(first.finished().await, ExecutionState::Completed);
        let second = bridge.execute(None, vec![Value::Int(2)]).unwrap();
        assert_eq!(second.finished().await, ExecutionState::Completed);

        let submissions = engine.submissions.lock();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[1], ("q".to_string(), vec![Value::Int(2)]));
    }

    #[tokio::test]
    async fn test_paged_fetch_across_backpressure() {
        let (_, bridge) = bridge(vec![("q", Script::Rows { rows: 120, chunk: 16 })], 50);
        let completion = bridge.execute(Some("q".into()), vec![]).unwrap();
        assert_eq!(completion.clone().ready().await, ExecutionState::Described);
        assert_eq!(bridge.columns().len(), 1);

        let mut seen = Vec::new();
        loop {
            let fetched = bridge.fetch(FetchLimit::AtMost(25)).unwrap();
            let short = fetched.rows.len() < 25;
            seen.extend(values(&fetched));
            if short {
                assert!(fetched.finished);
                break;
            }
        }
        assert_eq!(seen, (0..120).collect::<Vec<_>>());
        assert_eq!(completion.finished().await, ExecutionState::Completed);
        assert!(bridge.fetch(FetchLimit::AtMost(25)).unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_fetch_returns_everything() {
        let (_, bridge) = bridge(vec![("q", Script::Rows { rows: 120, chunk: 10 })], 50);
        bridge.execute(Some("q".into()), vec![]).unwrap();

        let fetched = bridge.fetch(FetchLimit::Unbounded).unwrap();
        assert_eq!(values(&fetched), (0..120).collect::<Vec<_>>());
        assert!(fetched.finished);
    }

    #[tokio::test]
    async fn test_reexecute_cancels_blocked_producer() {
        let (_, bridge) = bridge(
            vec![
                ("big", Script::Rows { rows: 10_000, chunk: 10 }),
                ("small", Script::Rows { rows: 3, chunk: 3 }),
            ],
            50,
        );

        let first = bridge.execute(Some("big".into()), vec![]).unwrap();
        let page = bridge.fetch(FetchLimit::AtMost(10)).unwrap();
        assert_eq!(values(&page), (0..10).collect::<Vec<_>>());

        let second = bridge.execute(Some("small".into()), vec![]).unwrap();
        assert_eq!(first.finished().await, ExecutionState::Cancelled);

        let fetched = bridge.fetch(FetchLimit::AtMost(10)).unwrap();
        assert_eq!(values(&fetched), vec![0, 1, 2]);
        assert!(fetched.finished);
        assert_eq!(second.finished().await, ExecutionState::Completed);
        assert!(bridge.fetch_error().is_none());
    }

    #[tokio::test]
    async fn test_reexecute_unblocks_waiting_fetch() {
        let (_, bridge) = bridge(
            vec![
                ("hang", Script::Hang),
                ("small", Script::Rows { rows: 1, chunk: 1 }),
            ],
            50,
        );
        let bridge = Arc::new(bridge);

        let first = bridge.execute(Some("hang".into()), vec![]).unwrap();
        assert_eq!(first.clone().ready().await, ExecutionState::Described);

        let fetcher = {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.fetch(FetchLimit::AtMost(5)))
        };
        thread::sleep(Duration::from_millis(50));

        bridge.execute(Some("small".into()), vec![]).unwrap();
        let stale = fetcher.join().unwrap().unwrap();
        assert!(stale.rows.is_empty());
        assert_eq!(first.finished().await, ExecutionState::Cancelled);
    }

    #[tokio::test]
    async fn test_error_is_reported_once() {
        let (_, bridge) = bridge(
            vec![("bad", Script::FailImmediately("no such table: t".into()))],
            50,
        );
        let completion = bridge.execute(Some("bad".into()), vec![]).unwrap();
        assert_eq!(completion.finished().await, ExecutionState::Failed);

        let error = bridge.fetch_error().unwrap();
        assert_eq!(error.message, "no such table: t");
        assert!(bridge.fetch_error().is_none());
        assert!(bridge.columns().is_empty());
        assert!(bridge.fetch(FetchLimit::Unbounded).unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_error_keeps_delivered_rows() {
        let (_, bridge) = bridge(
            vec![(
                "q",
                Script::FailAfter {
                    rows: 3,
                    message: "division by zero".into(),
                },
            )],
            50,
        );
        let completion = bridge.execute(Some("q".into()), vec![]).unwrap();
        assert_eq!(completion.finished().await, ExecutionState::Failed);

        let fetched = bridge.fetch(FetchLimit::AtMost(10)).unwrap();
        assert_eq!(values(&fetched), vec![0, 1, 2]);
        let error = bridge.fetch_error().unwrap();
        assert_eq!(error.message, "division by zero");
        assert_eq!(error.cause.as_deref(), Some("scripted failure"));
    }

    #[tokio::test]
    async fn test_superseded_error_is_not_surfaced() {
        let (_, bridge) = bridge(
            vec![
                ("hang", Script::Hang),
                ("ok", Script::Rows { rows: 0, chunk: 1 }),
            ],
            50,
        );
        let first = bridge.execute(Some("hang".into()), vec![]).unwrap();
        first.clone().ready().await;
        let second = bridge.execute(Some("ok".into()), vec![]).unwrap();

        assert_eq!(first.finished().await, ExecutionState::Cancelled);
        assert_eq!(second.finished().await, ExecutionState::Completed);
        assert!(bridge.fetch_error().is_none());
    }

    #[tokio::test]
    async fn test_stale_callbacks_are_dropped() {
        let (engine, bridge) = bridge(
            vec![
                ("manual", Script::Manual),
                ("ok", Script::Rows { rows: 2, chunk: 2 }),
            ],
            50,
        );
        let first = bridge.execute(Some("manual".into()), vec![]).unwrap();
        let stale = engine.sinks.lock()[0].clone();

        // Schema is fixed by the first report
        stale.on_schema(vec![Column::new("a", SqlType::Integer)]);
        stale.on_schema(vec![Column::new("b", SqlType::Varchar)]);
        assert_eq!(first.clone().ready().await, ExecutionState::Described);
        assert_eq!(bridge.columns(), vec![Column::new("a", SqlType::Integer)]);

        let second = bridge.execute(Some("ok".into()), vec![]).unwrap();
        assert_eq!(first.finished().await, ExecutionState::Cancelled);

        stale.on_schema(vec![Column::new("b", SqlType::Varchar)]);
        stale.on_error(ExecutionError::new("late failure"));
        stale.on_complete();
        assert_eq!(
            stale.on_rows(vec![Row::new(vec![Value::Int(99)])]),
            Delivery::Stop
        );

        assert_eq!(second.finished().await, ExecutionState::Completed);
        assert!(bridge.fetch_error().is_none());
        assert_eq!(bridge.columns()[0].name, "n");
        assert_eq!(values(&bridge.fetch(FetchLimit::Unbounded).unwrap()), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_submit_failure_becomes_execution_error() {
        let (_, bridge) = bridge(vec![], 50);
        let completion = bridge.execute(Some("unscripted".into()), vec![]).unwrap();
        assert_eq!(completion.finished().await, ExecutionState::Failed);
        assert!(bridge.have_query());
        assert!(bridge.fetch_error().unwrap().message.contains("no script"));
    }

    #[tokio::test]
    async fn test_close_cancels_and_rejects_execute() {
        let (_, bridge) = bridge(vec![("hang", Script::Hang)], 50);
        let completion = bridge.execute(Some("hang".into()), vec![]).unwrap();
        completion.clone().ready().await;

        bridge.close();
        bridge.close();
        assert_eq!(completion.finished().await, ExecutionState::Cancelled);
        assert!(bridge.execute(Some("hang".into()), vec![]).is_err());
    }
}
