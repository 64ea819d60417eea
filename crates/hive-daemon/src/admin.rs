//! Database administration routes: table DDL, ad-hoc SQL and its history.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hive_db::{validate_workspace_id, AlterTableRequest, CreateTableRequest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::server::{ApiError, AppState};

const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryHistoryItem {
    pub sql: String,
    pub duration_ms: u64,
    pub status: &'static str,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-workspace record of admin SQL, newest first. Lives only in memory.
#[derive(Debug, Default)]
pub struct QueryHistory {
    entries: Mutex<HashMap<String, VecDeque<QueryHistoryItem>>>,
}

impl QueryHistory {
    pub fn record(&self, workspace: &str, item: QueryHistoryItem) {
        let mut entries = self.entries.lock();
        let list = entries.entry(workspace.to_string()).or_default();
        list.push_front(item);
        list.truncate(HISTORY_LIMIT);
    }

    pub fn list(&self, workspace: &str) -> Vec<QueryHistoryItem> {
        self.entries
            .lock()
            .get(workspace)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

pub async fn list_tables(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
) -> Result<Response, ApiError> {
    let tables = state.store.list_tables(&workspace).await?;
    Ok(Json(json!({ "tables": tables })).into_response())
}

pub async fn create_table(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
    Json(request): Json<CreateTableRequest>,
) -> Result<Response, ApiError> {
    state.store.create_table(&workspace, &request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "table": request.name }))).into_response())
}

pub async fn table_schema(
    State(state): State<Arc<AppState>>,
    Path((workspace, table)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let schema = state.store.get_table_schema(&workspace, &table).await?;
    Ok(Json(schema).into_response())
}

pub async fn alter_table(
    State(state): State<Arc<AppState>>,
    Path((workspace, table)): Path<(String, String)>,
    Json(request): Json<AlterTableRequest>,
) -> Result<Response, ApiError> {
    state.store.alter_table(&workspace, &table, &request).await?;
    let name = request
        .rename
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(table);
    info!(workspace = %workspace, table = %name, "table altered");
    Ok(Json(json!({ "table": name })).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DropTableBody {
    confirm: bool,
}

pub async fn drop_table(
    State(state): State<Arc<AppState>>,
    Path((workspace, table)): Path<(String, String)>,
    body: Option<Json<DropTableBody>>,
) -> Result<Response, ApiError> {
    let confirmed = body.map(|Json(body)| body.confirm).unwrap_or(false);
    if !confirmed {
        return Err(ApiError::bad_request("drop requires {\"confirm\": true}")
            .with_code("CONFIRM_REQUIRED"));
    }
    state.store.drop_table(&workspace, &table).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
pub struct SqlBody {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
}

pub async fn execute_sql(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
    Json(body): Json<SqlBody>,
) -> Result<Response, ApiError> {
    validate_workspace_id(&workspace)?;
    if body.sql.trim().is_empty() {
        return Err(ApiError::bad_request("sql cannot be empty"));
    }

    let start = Instant::now();
    let result = state
        .store
        .execute_sql(&workspace, &body.sql, &body.params)
        .await;
    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    let (status, error) = match &result {
        Ok(_) => ("success", None),
        Err(err) => ("error", Some(err.to_string())),
    };
    state.history.record(
        &workspace,
        QueryHistoryItem {
            sql: body.sql,
            duration_ms,
            status,
            created_at_ms: unix_millis(),
            error,
        },
    );
    Ok(Json(result?).into_response())
}

pub async fn query_history(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
) -> Result<Response, ApiError> {
    validate_workspace_id(&workspace)?;
    Ok(Json(json!({ "history": state.history.list(&workspace) })).into_response())
}
