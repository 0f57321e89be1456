//! DuckDB query executor
//!
//! One [`DuckDbDatabase`] per data source. Each client connection gets a
//! [`DuckDbSession`]: a cloned DuckDB connection owned by a dedicated worker
//! thread that runs queued statements in order and streams Arrow batches into
//! the submitting sink.

use crate::arrow::{columns_from_schema, rows_from_batch};
use crate::engine::{Delivery, ExecutionHandle, QueryEngine, ResultSink};
use crossbeam_channel::{Receiver, Sender};
use cursorway_common::config::EngineSettings;
use cursorway_common::{CursorwayError, ExecutionError, Result, Value};
use duckdb::types::Value as DuckValue;
use duckdb::{params, Connection};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub const IN_MEMORY: &str = ":memory:";

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

/// Transaction control statements run on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxControl {
    Commit,
    Rollback,
}

impl TxControl {
    fn sql(self) -> &'static str {
        match self {
            TxControl::Commit => "COMMIT",
            TxControl::Rollback => "ROLLBACK",
        }
    }
}

/// An opened DuckDB database shared by all sessions of a data source
pub struct DuckDbDatabase {
    root: Mutex<Connection>,
    url: String,
    settings: EngineSettings,
}

impl DuckDbDatabase {
    /// Open a database file, or an in-memory database for `:memory:`/empty urls
    pub fn open(url: &str, settings: EngineSettings) -> Result<Self> {
        let connection = if url.is_empty() || url == IN_MEMORY {
            Connection::open_in_memory()
        } else {
            Connection::open(url)
        }
        .map_err(database_error)?;

        let threads = settings.threads.unwrap_or_else(num_cpus::get).max(1);
        connection
            .execute(&format!("SET threads = {}", threads), params![])
            .map_err(database_error)?;
        if let Some(limit) = &settings.memory_limit {
            connection
                .execute(&format!("SET memory_limit = '{}'", limit.replace('\'', "")), params![])
                .map_err(database_error)?;
        }

        info!(url = %url, threads, memory_limit = ?settings.memory_limit, "Opened DuckDB database");

        Ok(Self {
            root: Mutex::new(connection),
            url: url.to_string(),
            settings,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a session with its own worker thread
    pub fn connect(&self, autocommit: bool) -> Result<DuckDbSession> {
        let connection = self.root.lock().try_clone().map_err(database_error)?;
        if !autocommit {
            connection
                .execute_batch("BEGIN TRANSACTION")
                .map_err(database_error)?;
        }
        DuckDbSession::spawn(connection, autocommit, &self.settings)
    }
}

struct QueryJob {
    handle: ExecutionHandle,
    query: String,
    params: Vec<Value>,
    sink: Arc<dyn ResultSink>,
}

enum Job {
    Query(QueryJob),
    Control {
        statement: TxControl,
        reply: Sender<std::result::Result<(), ExecutionError>>,
    },
}

enum Outcome {
    Completed(usize),
    Stopped(usize),
}

/// A DuckDB connection driven by its own worker thread
pub struct DuckDbSession {
    id: u64,
    jobs: Mutex<Option<Sender<Job>>>,
    active: Arc<Mutex<Option<ExecutionHandle>>>,
    next_execution: AtomicU64,
    autocommit: bool,
    control_timeout: Duration,
}

impl DuckDbSession {
    fn spawn(connection: Connection, autocommit: bool, settings: &EngineSettings) -> Result<Self> {
        let id = SESSION_IDS.fetch_add(1, Ordering::Relaxed);
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let active = Arc::new(Mutex::new(None));

        let worker = Worker {
            session_id: id,
            connection,
            active: active.clone(),
            batch_rows: settings.batch_rows.max(1),
            autocommit,
        };
        std::thread::Builder::new()
            .name(format!("cursorway-session-{}", id))
            .spawn(move || worker.run(jobs_rx))?;

        debug!(session_id = id, autocommit, "Started DuckDB session");

        Ok(Self {
            id,
            jobs: Mutex::new(Some(jobs_tx)),
            active,
            next_execution: AtomicU64::new(1),
            autocommit,
            control_timeout: Duration::from_secs(settings.control_timeout_secs),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn commit(&self) -> Result<()> {
        self.control(TxControl::Commit)
    }

    pub fn rollback(&self) -> Result<()> {
        self.control(TxControl::Rollback)
    }

    /// Runs after every statement queued before it. Waits at most `control_timeout`,
    /// since a statement blocked on an undrained cursor holds the worker.
    #[instrument(skip(self), fields(session_id = self.id))]
    fn control(&self, statement: TxControl) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(Job::Control {
            statement,
            reply: reply_tx,
        })?;

        match reply_rx.recv_timeout(self.control_timeout) {
            Ok(result) => result.map_err(CursorwayError::from),
            Err(_) => Err(CursorwayError::DatabaseError(format!(
                "{} timed out after {:?}: connection is busy",
                statement.sql(),
                self.control_timeout
            ))),
        }
    }

    fn send(&self, job: Job) -> Result<()> {
        let jobs = self.jobs.lock();
        let sender = jobs
            .as_ref()
            .ok_or_else(|| CursorwayError::DatabaseError("connection is closed".into()))?;
        sender
            .send(job)
            .map_err(|_| CursorwayError::DatabaseError("connection worker has exited".into()))
    }

    /// Stop accepting work and cancel the running statement. The worker thread
    /// exits once the current statement notices the cancellation.
    pub fn shutdown(&self) {
        if self.jobs.lock().take().is_some() {
            debug!(session_id = self.id, "Shutting down DuckDB session");
        }
        if let Some(handle) = self.active.lock().as_ref() {
            handle.cancel();
        }
    }
}

impl QueryEngine for DuckDbSession {
    fn submit(
        &self,
        query: &str,
        params: Vec<Value>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<ExecutionHandle> {
        let handle = ExecutionHandle::new(self.next_execution.fetch_add(1, Ordering::Relaxed));
        self.send(Job::Query(QueryJob {
            handle: handle.clone(),
            query: query.to_string(),
            params,
            sink,
        }))?;
        Ok(handle)
    }
}

impl Drop for DuckDbSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    session_id: u64,
    connection: Connection,
    active: Arc<Mutex<Option<ExecutionHandle>>>,
    batch_rows: usize,
    autocommit: bool,
}

impl Worker {
    fn run(self, jobs: Receiver<Job>) {
        for job in jobs.iter() {
            match job {
                Job::Query(job) => {
                    if job.handle.is_cancelled() {
                        debug!(session_id = self.session_id, execution_id = job.handle.id(), "Skipping cancelled execution");
                        continue;
                    }
                    *self.active.lock() = Some(job.handle.clone());
                    self.run_query(&job);
                    *self.active.lock() = None;
                }
                Job::Control { statement, reply } => {
                    // The requester may have timed out and gone away
                    let _ = reply.send(self.run_control(statement));
                }
            }
        }
        debug!(session_id = self.session_id, "DuckDB session worker exited");
    }

    fn run_query(&self, job: &QueryJob) {
        let start = Instant::now();
        match self.stream_query(job) {
            Ok(Outcome::Completed(rows)) => {
                debug!(
                    session_id = self.session_id,
                    execution_id = job.handle.id(),
                    rows,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Execution completed"
                );
                job.sink.on_complete();
            }
            Ok(Outcome::Stopped(rows)) => {
                debug!(
                    session_id = self.session_id,
                    execution_id = job.handle.id(),
                    rows,
                    "Execution stopped before completion"
                );
            }
            Err(err) => {
                warn!(
                    session_id = self.session_id,
                    execution_id = job.handle.id(),
                    error = %err,
                    "Execution failed"
                );
                job.sink.on_error(err);
            }
        }
    }

    fn stream_query(&self, job: &QueryJob) -> std::result::Result<Outcome, ExecutionError> {
        let mut stmt = self.connection.prepare(&job.query).map_err(execution_error)?;
        let params: Vec<DuckValue> = job.params.iter().map(to_duckdb_value).collect();
        let batches = stmt
            .query_arrow(duckdb::params_from_iter(params))
            .map_err(execution_error)?;

        job.sink.on_schema(columns_from_schema(&batches.get_schema()));

        let mut delivered = 0;
        for batch in batches {
            let mut rows = rows_from_batch(&batch).into_iter().peekable();
            while rows.peek().is_some() {
                if job.handle.is_cancelled() {
                    return Ok(Outcome::Stopped(delivered));
                }
                let chunk: Vec<_> = rows.by_ref().take(self.batch_rows).collect();
                delivered += chunk.len();
                if job.sink.on_rows(chunk) == Delivery::Stop {
                    return Ok(Outcome::Stopped(delivered));
                }
            }
        }
        Ok(Outcome::Completed(delivered))
    }

    fn run_control(&self, statement: TxControl) -> std::result::Result<(), ExecutionError> {
        match self.connection.execute_batch(statement.sql()) {
            Ok(()) => {}
            // Commit/rollback without an open transaction is a no-op in autocommit mode
            Err(err) if self.autocommit && is_no_transaction(&err) => {
                debug!(session_id = self.session_id, statement = statement.sql(), "No active transaction");
            }
            Err(err) => return Err(execution_error(err)),
        }
        if !self.autocommit {
            self.connection
                .execute_batch("BEGIN TRANSACTION")
                .map_err(execution_error)?;
        }
        Ok(())
    }
}

fn is_no_transaction(err: &duckdb::Error) -> bool {
    err.to_string().contains("no transaction is active")
}

/// Bind a parameter. Temporal and decimal values go over as text and are cast by DuckDB.
fn to_duckdb_value(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Int(v) => DuckValue::BigInt(*v),
        Value::BigInt(v) => i128::try_from(v)
            .map(DuckValue::HugeInt)
            .unwrap_or_else(|_| DuckValue::Text(v.to_string())),
        Value::Bool(v) => DuckValue::Boolean(*v),
        Value::Float(v) => DuckValue::Double(*v),
        Value::Decimal(v) | Value::Text(v) => DuckValue::Text(v.clone()),
        Value::Bytes(v) => DuckValue::Blob(v.clone()),
        Value::Date(_) | Value::Time(_) | Value::DateTime(_) => DuckValue::Text(value.to_string()),
    }
}

fn execution_error(err: duckdb::Error) -> ExecutionError {
    ExecutionError::with_cause(err.to_string(), format!("{:?}", err))
}

fn database_error(err: duckdb::Error) -> CursorwayError {
    CursorwayError::DatabaseError(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursorway_common::{Column, Row, SqlType};
    use std::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Schema(Vec<Column>),
        Rows(Vec<Row>),
        Error(ExecutionError),
        Complete,
    }

    /// Records callbacks; optionally stops after the first delivery or waits for a gate
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
        done: Mutex<Option<mpsc::Sender<()>>>,
        stop_after_first: bool,
        gate: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl RecordingSink {
        fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
            Self::build(false, None)
        }

        fn build(stop_after_first: bool, gate: Option<mpsc::Receiver<()>>) -> (Arc<Self>, mpsc::Receiver<()>) {
            let (tx, rx) = mpsc::channel();
            let sink = Arc::new(Self {
                events: Mutex::new(Vec::new()),
                done: Mutex::new(Some(tx)),
                stop_after_first,
                gate: Mutex::new(gate),
            });
            (sink, rx)
        }

        fn finish(&self) {
            if let Some(tx) = self.done.lock().take() {
                let _ = tx.send(());
            }
        }

        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl ResultSink for RecordingSink {
        fn on_schema(&self, columns: Vec<Column>) {
            self.events.lock().push(Event::Schema(columns));
        }

        fn on_rows(&self, rows: Vec<Row>) -> Delivery {
            if let Some(gate) = self.gate.lock().take() {
                gate.recv().unwrap();
            }
            self.events.lock().push(Event::Rows(rows));
            if self.stop_after_first {
                self.finish();
                Delivery::Stop
            } else {
                Delivery::Continue
            }
        }

        fn on_error(&self, error: ExecutionError) {
            self.events.lock().push(Event::Error(error));
            self.finish();
        }

        fn on_complete(&self) {
            self.events.lock().push(Event::Complete);
            self.finish();
        }
    }

    fn session(batch_rows: usize, autocommit: bool) -> DuckDbSession {
        let settings = EngineSettings {
            threads: Some(1),
            batch_rows,
            ..EngineSettings::default()
        };
        let db = DuckDbDatabase::open(IN_MEMORY, settings).unwrap();
        db.connect(autocommit).unwrap()
    }

    fn run(session: &DuckDbSession, sql: &str, params: Vec<Value>) -> Vec<Event> {
        let (sink, done) = RecordingSink::new();
        session.submit(sql, params, sink.clone()).unwrap();
        done.recv_timeout(Duration::from_secs(10)).unwrap();
        sink.take()
    }

    fn single_value(session: &DuckDbSession, sql: &str) -> Value {
        match run(session, sql, vec![]).as_slice() {
            [Event::Schema(_), Event::Rows(rows), Event::Complete] => rows[0].values[0].clone(),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_select_one() {
        let session = session(1024, true);
        let events = run(&session, "SELECT 1", vec![]);
        assert_eq!(
            events,
            vec![
                Event::Schema(vec![Column::new("1", SqlType::Integer)]),
                Event::Rows(vec![Row::new(vec![Value::Int(1)])]),
                Event::Complete,
            ]
        );
    }

    #[test]
    fn test_positional_parameters() {
        let session = session(1024, true);
        let events = run(
            &session,
            "SELECT ?::INTEGER + 1 AS n, ? AS s, ?::INTEGER IS NULL AS missing",
            vec![Value::Int(41), Value::Text("mama".into()), Value::Null],
        );
        match events.as_slice() {
            [Event::Schema(columns), Event::Rows(rows), Event::Complete] => {
                assert_eq!(columns[1].name, "s");
                assert_eq!(
                    rows[0].values,
                    vec![Value::Int(42), Value::Text("mama".into()), Value::Bool(true)]
                );
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_rows_delivered_in_chunks() {
        let session = session(3, true);
        let events = run(&session, "SELECT * FROM range(10)", vec![]);
        let sizes: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                Event::Rows(rows) => Some(rows.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(events.last(), Some(&Event::Complete));
    }

    #[test]
    fn test_error_reported_once() {
        let session = session(1024, true);
        let events = run(&session, "SELECT * FROM missing_table", vec![]);
        match events.as_slice() {
            [Event::Error(err)] => {
                assert!(err.message.contains("missing_table"), "{}", err.message);
                assert!(err.cause.is_some());
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_stop_ends_execution_quietly() {
        let session = session(2, true);
        let (sink, done) = RecordingSink::build(true, None);
        session.submit("SELECT * FROM range(10)", vec![], sink.clone()).unwrap();
        done.recv_timeout(Duration::from_secs(10)).unwrap();

        // The session keeps serving statements after a stop
        assert_eq!(single_value(&session, "SELECT 2"), Value::Int(2));
        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(!events.contains(&Event::Complete));
    }

    #[test]
    fn test_cancelled_job_is_skipped() {
        let session = session(1024, true);
        let (gate_tx, gate_rx) = mpsc::channel();
        let (blocker, blocker_done) = RecordingSink::build(false, Some(gate_rx));
        session.submit("SELECT 1", vec![], blocker).unwrap();

        let (skipped, _skipped_done) = RecordingSink::new();
        let handle = session.submit("SELECT 2", vec![], skipped.clone()).unwrap();
        session.cancel(&handle);

        gate_tx.send(()).unwrap();
        blocker_done.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(single_value(&session, "SELECT 3"), Value::Int(3));
        assert!(skipped.take().is_empty());
    }

    #[test]
    fn test_rollback_discards_changes() {
        let session = session(1024, false);
        run(&session, "CREATE TABLE a(a INTEGER)", vec![]);
        session.commit().unwrap();

        run(&session, "INSERT INTO a VALUES (1), (2)", vec![]);
        session.rollback().unwrap();
        assert_eq!(single_value(&session, "SELECT count(*) FROM a"), Value::Int(0));

        run(&session, "INSERT INTO a VALUES (3)", vec![]);
        session.commit().unwrap();
        assert_eq!(single_value(&session, "SELECT count(*) FROM a"), Value::Int(1));
    }

    #[test]
    fn test_autocommit_commit_is_noop() {
        let session = session(1024, true);
        run(&session, "CREATE TABLE t(x INTEGER)", vec![]);
        session.commit().unwrap();
        session.rollback().unwrap();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let session = session(1024, true);
        session.shutdown();
        let (sink, _done) = RecordingSink::new();
        assert!(matches!(
            session.submit("SELECT 1", vec![], sink),
            Err(CursorwayError::DatabaseError(_))
        ));
    }

    #[test]
    fn test_sessions_share_database() {
        let settings = EngineSettings {
            threads: Some(1),
            ..EngineSettings::default()
        };
        let db = DuckDbDatabase::open(IN_MEMORY, settings).unwrap();
        let first = db.connect(true).unwrap();
        let second = db.connect(true).unwrap();

        run(&first, "CREATE TABLE shared AS SELECT 42 AS v", vec![]);
        assert_eq!(single_value(&second, "SELECT v FROM shared"), Value::Int(42));
    }
}
