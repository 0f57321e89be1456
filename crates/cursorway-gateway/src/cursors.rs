//! Cursors: addressable query executions on a connection
//!
//! # Cursor Lifecycle
//! 1. Created empty under a connection
//! 2. `execute` starts a run, retiring any run still in flight
//! 3. `fetch` pages through the current run's rows
//! 4. `close` (or idle reaping) retires the run and frees the slot

use crate::execution::{Completion, ExecutionBridge, FetchedRows};
use crate::metrics;
use crate::row_channel::FetchLimit;
use cursorway_common::{Column, ExecutionError, Result, Value};
use cursorway_engine::QueryEngine;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

pub struct Cursor {
    id: Uuid,
    bridge: ExecutionBridge,
    created_at: chrono::DateTime<chrono::Utc>,
    last_accessed: Mutex<Instant>,
}

impl Cursor {
    pub fn new(engine: Arc<dyn QueryEngine>, row_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            bridge: ExecutionBridge::new(engine, row_capacity),
            created_at: chrono::Utc::now(),
            last_accessed: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    /// Mark cursor as accessed (resets idle timer)
    pub fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    /// Check if cursor is idle beyond `timeout`
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_accessed.lock().elapsed() > timeout
    }

    pub fn execute(&self, query: Option<String>, params: Vec<Value>) -> Result<Completion> {
        self.touch();
        self.bridge.execute(query, params)
    }

    /// Blocks; call from a blocking context
    pub fn fetch(&self, limit: FetchLimit) -> Result<FetchedRows> {
        self.touch();
        self.bridge.fetch(limit)
    }

    pub fn fetch_error(&self) -> Option<ExecutionError> {
        self.bridge.fetch_error()
    }

    /// Column schema of the current run, empty if none
    pub fn describe(&self) -> Vec<Column> {
        self.touch();
        self.bridge.columns()
    }

    pub fn have_query(&self) -> bool {
        self.bridge.have_query()
    }

    pub fn close(&self) {
        self.bridge.close();
    }
}

/// Cursors owned by one connection
#[derive(Default)]
pub struct ConnectionCursors {
    cursors: DashMap<Uuid, Arc<Cursor>>,
}

impl ConnectionCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, engine: Arc<dyn QueryEngine>, row_capacity: usize) -> Arc<Cursor> {
        let cursor = Arc::new(Cursor::new(engine, row_capacity));
        self.cursors.insert(cursor.id(), cursor.clone());
        metrics::ACTIVE_CURSORS.inc();
        cursor
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Cursor>> {
        self.cursors.get(id).map(|entry| entry.value().clone())
    }

    /// Remove and close a cursor
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Cursor>> {
        let (_, cursor) = self.cursors.remove(id)?;
        metrics::ACTIVE_CURSORS.dec();
        cursor.close();
        Some(cursor)
    }

    pub fn list(&self) -> Vec<Arc<Cursor>> {
        let mut cursors: Vec<_> = self
            .cursors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        cursors.sort_by_key(|cursor| cursor.created_at());
        cursors
    }

    /// Close cursors idle longer than `timeout` (call periodically)
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<Uuid> = self
            .cursors
            .iter()
            .filter(|entry| entry.value().is_idle(timeout))
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for id in idle {
            if self.remove(&id).is_some() {
                info!(cursor = %id, "Closed idle cursor");
                reaped += 1;
            }
        }
        reaped
    }

    pub fn close_all(&self) {
        let ids: Vec<Uuid> = self.cursors.iter().map(|entry| *entry.key()).collect();
        let count = ids.len();
        for id in ids {
            self.remove(&id);
        }
        if count > 0 {
            info!("Closed all {} cursors", count);
        }
    }
}
