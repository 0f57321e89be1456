//! Resource registry: data sources → connections → cursors
//!
//! Every level is keyed by a generated UUID. Disposing a level disposes
//! everything beneath it. Map locks are only held for the insert/remove itself,
//! never while a cursor or session is being closed.

use crate::cursors::{ConnectionCursors, Cursor};
use crate::metrics;
use cursorway_common::config::{CursorSettings, EngineSettings};
use cursorway_common::{CursorwayError, Result};
use cursorway_engine::{DuckDbDatabase, DuckDbSession};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Engine family reported for every data source
pub const DBMS: &str = "DuckDB";

fn lookup_id(kind: &str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| CursorwayError::NotFound(format!("{} {}", kind, raw)))
}

/// An open connection with its own engine session
pub struct Connection {
    id: Uuid,
    session: Arc<DuckDbSession>,
    cursors: ConnectionCursors,
    row_capacity: usize,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn create_cursor(&self) -> Arc<Cursor> {
        self.cursors.create(self.session.clone(), self.row_capacity)
    }

    pub fn cursor(&self, id: &str) -> Result<Arc<Cursor>> {
        let id = lookup_id("cursor", id)?;
        self.cursors
            .get(&id)
            .ok_or_else(|| CursorwayError::NotFound(format!("cursor {}", id)))
    }

    pub fn close_cursor(&self, id: &str) -> Result<()> {
        let id = lookup_id("cursor", id)?;
        self.cursors
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CursorwayError::NotFound(format!("cursor {}", id)))
    }

    pub fn cursors(&self) -> Vec<Arc<Cursor>> {
        self.cursors.list()
    }

    /// Blocks until queued statements ahead of it have run
    pub fn commit(&self) -> Result<()> {
        self.session.commit()
    }

    /// Blocks until queued statements ahead of it have run
    pub fn rollback(&self) -> Result<()> {
        self.session.rollback()
    }

    fn reap_idle(&self, timeout: Duration) -> usize {
        self.cursors.reap_idle(timeout)
    }

    fn close(&self) {
        self.cursors.close_all();
        self.session.shutdown();
    }
}

/// A registered database
pub struct DataSource {
    id: Uuid,
    name: String,
    url: String,
    user: Option<String>,
    database: DuckDbDatabase,
    connections: DashMap<Uuid, Arc<Connection>>,
    row_capacity: usize,
}

impl DataSource {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn dbms(&self) -> &'static str {
        DBMS
    }

    /// Open a connection. Blocks while DuckDB sets up the session.
    pub fn connect(&self, autocommit: bool) -> Result<Arc<Connection>> {
        let session = self.database.connect(autocommit)?;
        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            session: Arc::new(session),
            cursors: ConnectionCursors::new(),
            row_capacity: self.row_capacity,
        });
        self.connections.insert(connection.id, connection.clone());
        metrics::ACTIVE_CONNECTIONS.inc();
        info!(
            data_source = %self.name,
            connection = %connection.id,
            autocommit,
            "Opened connection"
        );
        Ok(connection)
    }

    pub fn connection(&self, id: &str) -> Result<Arc<Connection>> {
        let id = lookup_id("connection", id)?;
        self.connections
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CursorwayError::NotFound(format!("connection {}", id)))
    }

    pub fn close_connection(&self, id: &str) -> Result<()> {
        let id = lookup_id("connection", id)?;
        let (_, connection) = self
            .connections
            .remove(&id)
            .ok_or_else(|| CursorwayError::NotFound(format!("connection {}", id)))?;
        metrics::ACTIVE_CONNECTIONS.dec();
        connection.close();
        info!(data_source = %self.name, connection = %id, "Closed connection");
        Ok(())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn reap_idle(&self, timeout: Duration) -> usize {
        self.connections()
            .iter()
            .map(|connection| connection.reap_idle(timeout))
            .sum()
    }

    fn dispose(&self) {
        let ids: Vec<Uuid> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, connection)) = self.connections.remove(&id) {
                metrics::ACTIVE_CONNECTIONS.dec();
                connection.close();
            }
        }
    }
}

/// All data sources known to the gateway
pub struct Registry {
    data_sources: DashMap<Uuid, Arc<DataSource>>,
    engine: EngineSettings,
    cursors: CursorSettings,
}

impl Registry {
    pub fn new(engine: EngineSettings, cursors: CursorSettings) -> Self {
        Self {
            data_sources: DashMap::new(),
            engine,
            cursors,
        }
    }

    pub fn cursor_settings(&self) -> &CursorSettings {
        &self.cursors
    }

    /// Open the database behind `url` and register it. Blocking.
    pub fn add_data_source(
        &self,
        name: &str,
        url: &str,
        user: Option<String>,
    ) -> Result<Arc<DataSource>> {
        if name.trim().is_empty() {
            return Err(CursorwayError::InvalidArgument(
                "data source name must not be empty".into(),
            ));
        }

        let database = DuckDbDatabase::open(url, self.engine.clone())?;
        let data_source = Arc::new(DataSource {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: database.url().to_string(),
            user,
            database,
            connections: DashMap::new(),
            row_capacity: self.cursors.row_buffer_capacity,
        });
        self.data_sources
            .insert(data_source.id, data_source.clone());
        metrics::ACTIVE_DATA_SOURCES.inc();
        info!(
            data_source = %data_source.id,
            name = %name,
            url = %url,
            user = ?data_source.user(),
            "Registered data source"
        );
        Ok(data_source)
    }

    /// Data sources ordered by name
    pub fn data_sources(&self) -> Vec<Arc<DataSource>> {
        let mut data_sources: Vec<_> = self
            .data_sources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        data_sources.sort_by(|a, b| a.name.cmp(&b.name));
        data_sources
    }

    pub fn data_source(&self, id: &str) -> Result<Arc<DataSource>> {
        let id = lookup_id("data source", id)?;
        self.data_sources
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CursorwayError::NotFound(format!("data source {}", id)))
    }

    pub fn remove_data_source(&self, id: &str) -> Result<()> {
        let id = lookup_id("data source", id)?;
        let (_, data_source) = self
            .data_sources
            .remove(&id)
            .ok_or_else(|| CursorwayError::NotFound(format!("data source {}", id)))?;
        metrics::ACTIVE_DATA_SOURCES.dec();
        data_source.dispose();
        info!(data_source = %id, name = %data_source.name, "Removed data source");
        Ok(())
    }

    pub fn connection(&self, data_source: &str, connection: &str) -> Result<Arc<Connection>> {
        self.data_source(data_source)?.connection(connection)
    }

    pub fn cursor(&self, data_source: &str, connection: &str, cursor: &str) -> Result<Arc<Cursor>> {
        self.connection(data_source, connection)?.cursor(cursor)
    }

    /// Close cursors idle beyond the configured timeout
    pub fn reap_idle_cursors(&self) -> usize {
        if self.cursors.idle_timeout_secs == 0 {
            return 0;
        }
        let timeout = Duration::from_secs(self.cursors.idle_timeout_secs);
        let reaped = self
            .data_sources()
            .iter()
            .map(|data_source| data_source.reap_idle(timeout))
            .sum();
        metrics::record_cursors_reaped(reaped);
        reaped
    }

    /// Dispose every data source (shutdown)
    pub fn dispose_all(&self) {
        let ids: Vec<Uuid> = self.data_sources.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, data_source)) = self.data_sources.remove(&id) {
                metrics::ACTIVE_DATA_SOURCES.dec();
                data_source.dispose();
            }
        }
        info!("Disposed all data sources");
    }
}

/// Spawn the idle cursor reaper. Returns `None` when reaping is disabled.
pub fn start_reaper(registry: Arc<Registry>) -> Option<tokio::task::JoinHandle<()>> {
    let settings = registry.cursor_settings().clone();
    if settings.idle_timeout_secs == 0 {
        warn!("Idle cursor reaping disabled");
        return None;
    }
    let interval = Duration::from_secs(settings.cleanup_interval_secs.max(1));

    Some(tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);
        loop {
            interval_timer.tick().await;
            let reaped = registry.reap_idle_cursors();
            if reaped > 0 {
                info!(reaped, "Reaped idle cursors");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionState;
    use crate::row_channel::FetchLimit;
    use cursorway_common::Value;
    use cursorway_engine::IN_MEMORY;

    fn registry() -> Registry {
        Registry::new(EngineSettings::default(), CursorSettings::default())
    }

    #[test]
    fn test_lookup_unknown_and_malformed_ids() {
        let registry = registry();
        assert!(matches!(
            registry.data_source("not-a-uuid"),
            Err(CursorwayError::NotFound(_))
        ));
        assert!(matches!(
            registry.data_source(&Uuid::new_v4().to_string()),
            Err(CursorwayError::NotFound(_))
        ));
        assert!(registry.remove_data_source("nope").is_err());
    }

    #[test]
    fn test_data_sources_sorted_by_name() {
        let registry = registry();
        registry.add_data_source("zeta", IN_MEMORY, None).unwrap();
        registry
            .add_data_source("alpha", IN_MEMORY, Some("sa".into()))
            .unwrap();

        let names: Vec<_> = registry
            .data_sources()
            .iter()
            .map(|ds| ds.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(registry.add_data_source("  ", IN_MEMORY, None).is_err());
    }

    #[tokio::test]
    async fn test_cursor_runs_against_duckdb() {
        let registry = registry();
        let ds = registry.add_data_source("mem", IN_MEMORY, None).unwrap();
        let connection = ds.connect(true).unwrap();
        let cursor = connection.create_cursor();

        let found = registry
            .cursor(
                &ds.id().to_string(),
                &connection.id().to_string(),
                &cursor.id().to_string(),
            )
            .unwrap();
        assert_eq!(found.id(), cursor.id());

        let completion = cursor
            .execute(Some("SELECT ?::INTEGER * 2 AS doubled".into()), vec![Value::Int(21)])
            .unwrap();
        assert_eq!(completion.finished().await, ExecutionState::Completed);

        let fetched = cursor.fetch(FetchLimit::Unbounded).unwrap();
        assert_eq!(fetched.columns[0].name, "doubled");
        assert_eq!(fetched.rows.len(), 1);
        assert_eq!(fetched.rows[0].values[0].to_string(), "42");
    }

    #[test]
    fn test_remove_data_source_cascades() {
        let registry = registry();
        let ds = registry.add_data_source("mem", IN_MEMORY, None).unwrap();
        let connection = ds.connect(true).unwrap();
        let cursor = connection.create_cursor();

        registry.remove_data_source(&ds.id().to_string()).unwrap();
        assert!(cursor.execute(Some("SELECT 1".into()), vec![]).is_err());
        assert!(ds.connections().is_empty());
        assert!(registry.data_sources().is_empty());
    }

    #[test]
    fn test_close_connection_closes_its_cursors() {
        let registry = registry();
        let ds = registry.add_data_source("mem", IN_MEMORY, None).unwrap();
        let connection = ds.connect(false).unwrap();
        let cursor = connection.create_cursor();

        ds.close_connection(&connection.id().to_string()).unwrap();
        assert!(cursor.execute(Some("SELECT 1".into()), vec![]).is_err());
        assert!(ds.connection(&connection.id().to_string()).is_err());
        assert!(ds.close_connection(&connection.id().to_string()).is_err());
    }

    #[test]
    fn test_reaping_disabled_with_zero_timeout() {
        let registry = Registry::new(
            EngineSettings::default(),
            CursorSettings {
                idle_timeout_secs: 0,
                ..CursorSettings::default()
            },
        );
        let ds = registry.add_data_source("mem", IN_MEMORY, None).unwrap();
        ds.connect(true).unwrap().create_cursor();
        assert_eq!(registry.reap_idle_cursors(), 0);
    }
}
