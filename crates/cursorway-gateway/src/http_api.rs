//! HTTP REST API for data sources, connections and cursors
//!
//! All resources live under `/api/database/dataSources/`. Row data crosses the
//! wire as arrays of strings (or nulls) encoded by the shared codec.

use crate::cursors::Cursor;
use crate::errors::{ApiError, ErrorCategory};
use crate::execution::ExecutionState;
use crate::metrics;
use crate::registry::{DataSource, Registry};
use crate::row_channel::FetchLimit;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use cursorway_common::{codec, CursorwayError, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

type ApiResult<T> = Result<T, ApiError>;

/// All API routes. Layers (CORS, tracing) are added by the caller.
pub fn router(state: AppState) -> Router {
    const DS: &str = "/api/database/dataSources/:ds";
    const CON: &str = "/api/database/dataSources/:ds/connections/:con";
    const CUR: &str = "/api/database/dataSources/:ds/connections/:con/cursors/:cur";

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .route(
            "/api/database/dataSources/",
            get(list_data_sources).post(create_data_source),
        )
        .route(&format!("{}/", DS), get(get_data_source).delete(delete_data_source))
        .route(
            &format!("{}/connections/", DS),
            get(list_connections).post(create_connection),
        )
        .route(&format!("{}/", CON), axum::routing::delete(close_connection))
        .route(&format!("{}/commit", CON), post(commit))
        .route(&format!("{}/rollback", CON), post(rollback))
        .route(&format!("{}/cursors/", CON), get(list_cursors).post(create_cursor))
        .route(&format!("{}/", CUR), axum::routing::delete(close_cursor))
        .route(&format!("{}/execute", CUR), post(execute))
        .route(&format!("{}/fetch", CUR), get(fetch))
        .route(&format!("{}/nextSet", CUR), post(next_set))
        .route(&format!("{}/describe", CUR), get(describe))
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct DataSourceInfo {
    pub uuid: String,
    pub name: String,
    pub url: String,
    pub dbms: String,
}

impl From<&DataSource> for DataSourceInfo {
    fn from(data_source: &DataSource) -> Self {
        Self {
            uuid: data_source.id().to_string(),
            name: data_source.name().to_string(),
            url: data_source.url().to_string(),
            dbms: data_source.dbms().to_string(),
        }
    }
}

/// Connections and cursors are described by their id only
#[derive(Debug, Serialize)]
pub struct HandleInfo {
    pub uuid: String,
}

/// Password is accepted for compatibility and not stored
#[derive(Debug, Deserialize)]
pub struct NewDataSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NewConnection {
    #[serde(default)]
    pub autocommit: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub parameters: Option<Vec<ParamRequest>>,
}

/// One positional parameter: `{value, type}` and nothing else
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamRequest {
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default, rename = "type")]
    pub type_code: Option<String>,
}

impl ParamRequest {
    fn decode(&self) -> cursorway_common::Result<Value> {
        let raw = match &self.value {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            Some(other) => {
                return Err(CursorwayError::InvalidArgument(format!(
                    "parameter value must be a string, got {}",
                    other
                )))
            }
        };
        codec::decode_param(raw.as_deref(), self.type_code.as_deref())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FetchQuery {
    pub limit: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_code: &'static str,
    pub precision: u32,
    pub scale: u32,
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Malformed request: {}", e)))
}

/// An empty body stands for the request's defaults
fn parse_optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    parse_json(body)
}

fn parse_limit(raw: Option<&str>) -> cursorway_common::Result<FetchLimit> {
    match raw {
        None => FetchLimit::from_wire(-1),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| CursorwayError::InvalidArgument(format!("invalid fetch limit {:?}", raw)))
            .and_then(FetchLimit::from_wire),
    }
}

/// Surface (and clear) an execution error waiting on the cursor
fn report_pending_error(cursor: &Cursor) -> ApiResult<()> {
    match cursor.fetch_error() {
        Some(err) => Err(ApiError::execution(err)),
        None => Ok(()),
    }
}

/// Checks ahead of a fetch. A malformed limit is rejected before the error slot is read.
fn fetch_limit(cursor: &Cursor, raw: Option<&str>) -> ApiResult<FetchLimit> {
    let limit = parse_limit(raw)?;
    report_pending_error(cursor)?;
    if !cursor.have_query() {
        return Err(CursorwayError::NoQuery.into());
    }
    Ok(limit)
}

/// Run engine work that may block off the async reactor
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> cursorway_common::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::from)
}

fn ok() -> Json<serde_json::Value> {
    Json(json!({}))
}

// ═══════════════════════════════════════════════════════════════════════════
// DATA SOURCES
// ═══════════════════════════════════════════════════════════════════════════

pub async fn list_data_sources(State(state): State<AppState>) -> Json<Vec<DataSourceInfo>> {
    Json(
        state
            .registry
            .data_sources()
            .iter()
            .map(|ds| DataSourceInfo::from(ds.as_ref()))
            .collect(),
    )
}

pub async fn create_data_source(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<DataSourceInfo>> {
    let request: NewDataSource = parse_json(&body)?;
    let registry = state.registry.clone();
    let data_source = blocking(move || {
        registry.add_data_source(&request.name, &request.url, request.user)
    })
    .await?;
    Ok(Json(DataSourceInfo::from(data_source.as_ref())))
}

pub async fn get_data_source(
    State(state): State<AppState>,
    Path(ds): Path<String>,
) -> ApiResult<Json<DataSourceInfo>> {
    let data_source = state.registry.data_source(&ds)?;
    Ok(Json(DataSourceInfo::from(data_source.as_ref())))
}

pub async fn delete_data_source(
    State(state): State<AppState>,
    Path(ds): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.remove_data_source(&ds)?;
    Ok(ok())
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTIONS
// ═══════════════════════════════════════════════════════════════════════════

pub async fn list_connections(
    State(state): State<AppState>,
    Path(ds): Path<String>,
) -> ApiResult<Json<Vec<HandleInfo>>> {
    let data_source = state.registry.data_source(&ds)?;
    Ok(Json(
        data_source
            .connections()
            .iter()
            .map(|c| HandleInfo {
                uuid: c.id().to_string(),
            })
            .collect(),
    ))
}

pub async fn create_connection(
    State(state): State<AppState>,
    Path(ds): Path<String>,
    body: Bytes,
) -> ApiResult<Json<HandleInfo>> {
    let request: NewConnection = parse_optional_json(&body)?;
    let data_source = state.registry.data_source(&ds)?;
    let autocommit = request.autocommit.unwrap_or(true);
    let connection = blocking(move || data_source.connect(autocommit)).await?;
    Ok(Json(HandleInfo {
        uuid: connection.id().to_string(),
    }))
}

pub async fn close_connection(
    State(state): State<AppState>,
    Path((ds, con)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.data_source(&ds)?.close_connection(&con)?;
    Ok(ok())
}

pub async fn commit(
    State(state): State<AppState>,
    Path((ds, con)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let connection = state.registry.connection(&ds, &con)?;
    tokio::task::spawn_blocking(move || connection.commit())
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::operation)?;
    Ok(ok())
}

pub async fn rollback(
    State(state): State<AppState>,
    Path((ds, con)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let connection = state.registry.connection(&ds, &con)?;
    tokio::task::spawn_blocking(move || connection.rollback())
        .await
        .map_err(ApiError::internal)?
        .map_err(ApiError::operation)?;
    Ok(ok())
}

// ═══════════════════════════════════════════════════════════════════════════
// CURSORS
// ═══════════════════════════════════════════════════════════════════════════

pub async fn list_cursors(
    State(state): State<AppState>,
    Path((ds, con)): Path<(String, String)>,
) -> ApiResult<Json<Vec<HandleInfo>>> {
    let connection = state.registry.connection(&ds, &con)?;
    Ok(Json(
        connection
            .cursors()
            .iter()
            .map(|c| HandleInfo {
                uuid: c.id().to_string(),
            })
            .collect(),
    ))
}

pub async fn create_cursor(
    State(state): State<AppState>,
    Path((ds, con)): Path<(String, String)>,
) -> ApiResult<Json<HandleInfo>> {
    let cursor = state.registry.connection(&ds, &con)?.create_cursor();
    Ok(Json(HandleInfo {
        uuid: cursor.id().to_string(),
    }))
}

pub async fn close_cursor(
    State(state): State<AppState>,
    Path((ds, con, cur)): Path<(String, String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.connection(&ds, &con)?.close_cursor(&cur)?;
    Ok(ok())
}

/// Start a query on the cursor. Replies once the result schema is known, so a
/// client can describe right away and page through rows with fetch.
pub async fn execute(
    State(state): State<AppState>,
    Path((ds, con, cur)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let cursor = state.registry.cursor(&ds, &con, &cur)?;
    let request: ExecuteRequest = parse_optional_json(&body)?;
    let params = request
        .parameters
        .unwrap_or_default()
        .iter()
        .map(ParamRequest::decode)
        .collect::<cursorway_common::Result<Vec<_>>>()?;

    debug!(
        cursor = %cur,
        rerun = request.operation.is_none(),
        params = params.len(),
        "Execute"
    );

    let completion = cursor.execute(request.operation, params)?;
    match completion.ready().await {
        ExecutionState::Failed => Err(cursor
            .fetch_error()
            .map(ApiError::execution)
            .unwrap_or_else(|| ApiError::new(ErrorCategory::Execution, "Query failed"))),
        ExecutionState::Cancelled => Err(CursorwayError::QueryCancelled.into()),
        _ => Ok(Json(json!({ "rowcount": -1 }))),
    }
}

pub async fn fetch(
    State(state): State<AppState>,
    Path((ds, con, cur)): Path<(String, String, String)>,
    Query(query): Query<FetchQuery>,
) -> ApiResult<Json<Vec<Vec<Option<String>>>>> {
    let cursor = state.registry.cursor(&ds, &con, &cur)?;
    let limit = fetch_limit(&cursor, query.limit.as_deref())?;

    let fetched = blocking(move || cursor.fetch(limit)).await?;
    debug!(
        cursor = %cur,
        rows = fetched.rows.len(),
        finished = fetched.finished,
        "Fetch"
    );
    let rows: Vec<_> = fetched
        .rows
        .iter()
        .map(|row| codec::serialize_row(&fetched.columns, row))
        .collect();
    metrics::record_rows_fetched(rows.len());
    Ok(Json(rows))
}

/// Only single result sets are produced
pub async fn next_set(
    State(state): State<AppState>,
    Path((ds, con, cur)): Path<(String, String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let cursor = state.registry.cursor(&ds, &con, &cur)?;
    report_pending_error(&cursor)?;
    Ok(Json(json!({ "more": false })))
}

pub async fn describe(
    State(state): State<AppState>,
    Path((ds, con, cur)): Path<(String, String, String)>,
) -> ApiResult<Json<Vec<ColumnInfo>>> {
    let cursor = state.registry.cursor(&ds, &con, &cur)?;
    report_pending_error(&cursor)?;
    Ok(Json(
        cursor
            .describe()
            .iter()
            .map(|column| ColumnInfo {
                name: column.name.clone(),
                type_code: codec::classify(column).code(),
                precision: column.precision,
                scale: column.scale,
            })
            .collect(),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════
// SERVICE
// ═══════════════════════════════════════════════════════════════════════════

/// Prometheus metrics endpoint
pub async fn prometheus_metrics() -> impl IntoResponse {
    let body = metrics::encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Ready check endpoint
pub async fn ready() -> &'static str {
    "OK"
}

/// Root endpoint
pub async fn root() -> &'static str {
    "cursorway gateway"
}
