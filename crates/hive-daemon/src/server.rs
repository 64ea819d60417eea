use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use hive_db::{validate_workspace_id, QueryFilter, QueryParams, Store, StoreError};
use hive_kernel::{CodeLoader, FsCodeLoader, PoolError, VmError, VmPool, VmRequest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    admin::{self, QueryHistory},
    config::AppConfig,
    hooks,
};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    tokio::fs::create_dir_all(&config.runtime.base_dir)
        .await
        .with_context(|| format!("failed to create {}", config.runtime.base_dir.display()))?;

    let store = Store::new(config.runtime.store_config());
    let loader: Arc<dyn CodeLoader> = Arc::new(FsCodeLoader::new(&config.code_dir));
    let pool = Arc::new(VmPool::new(store.clone(), loader, &config.runtime));

    let sweeper = config
        .runtime
        .idle_eviction
        .map(|idle| pool.spawn_idle_evictor(idle, idle));

    let state = Arc::new(AppState::new(Arc::clone(&pool), store.clone()));
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        base_dir = %config.runtime.base_dir.display(),
        code_dir = %config.code_dir.display(),
        max_vms = pool.max_vms(),
        "hive-daemon listening"
    );
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited");

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    pool.close();
    store.close().await;
    info!("hive-daemon stopped");
    served
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/runtime/:workspace/api", any(dispatch_root))
        .route("/runtime/:workspace/api/*path", any(dispatch))
        .route(
            "/runtime/:workspace/data/:table",
            get(query_table)
                .post(insert_row)
                .put(update_row)
                .delete(delete_rows),
        )
        .route(
            "/runtime/:workspace/tables",
            get(admin::list_tables).post(admin::create_table),
        )
        .route(
            "/runtime/:workspace/tables/:table",
            get(admin::table_schema)
                .patch(admin::alter_table)
                .delete(admin::drop_table),
        )
        .route("/runtime/:workspace/sql", post(admin::execute_sql))
        .route("/runtime/:workspace/sql/history", get(admin::query_history))
        .route("/runtime/:workspace/schema", get(schema_graph))
        .route("/runtime/:workspace/stats", get(stats))
        .with_state(state)
}

pub struct AppState {
    pub pool: Arc<VmPool>,
    pub store: Store,
    pub history: QueryHistory,
}

impl AppState {
    pub fn new(pool: Arc<VmPool>, store: Store) -> Self {
        Self {
            pool,
            store,
            history: QueryHistory::default(),
        }
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn dispatch_root(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
    method: Method,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    forward(&state, &workspace, "/", method, query, &headers, &body).await
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    Path((workspace, path)): Path<(String, String)>,
    method: Method,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    forward(&state, &workspace, &path, method, query, &headers, &body).await
}

async fn forward(
    state: &AppState,
    workspace: &str,
    path: &str,
    method: Method,
    query: BTreeMap<String, String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(
            serde_json::from_slice::<Value>(body)
                .map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))?,
        )
    };

    let request = VmRequest {
        method: method.as_str().to_string(),
        path: path.to_string(),
        query,
        body,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        ..VmRequest::default()
    };

    let vm = state.pool.get_or_create(workspace).await?;
    let response = vm.handle(request).await?;
    let status = StatusCode::from_u16(response.status).map_err(ApiError::internal)?;
    Ok((status, Json(response.body)).into_response())
}

const MAX_FILTERS: usize = 20;

/// Reads paging, ordering and `filters[i][column|operator|value]` from the
/// query string. Missing paging values stay zero so the store applies its
/// defaults; filters stop at the first index without a column.
fn table_params(query: &BTreeMap<String, String>) -> Result<QueryParams, ApiError> {
    let number = |key: &str| -> Result<i64, ApiError> {
        match query.get(key).map(|raw| raw.trim()).filter(|raw| !raw.is_empty()) {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request(format!("invalid {key}: {raw:?}"))),
        }
    };

    let mut filters = Vec::new();
    for i in 0..MAX_FILTERS {
        let field = |name: &str| {
            query
                .get(&format!("filters[{i}][{name}]"))
                .cloned()
                .unwrap_or_default()
        };
        let column = field("column");
        if column.is_empty() {
            break;
        }
        filters.push(QueryFilter::new(column, field("operator"), field("value")));
    }

    Ok(QueryParams {
        page: number("page")?,
        page_size: number("page_size")?,
        order_by: query.get("order_by").cloned(),
        order_dir: query.get("order_dir").cloned(),
        filters,
        filter_combinator: query.get("filter_combinator").cloned(),
    })
}

async fn query_table(
    State(state): State<Arc<AppState>>,
    Path((workspace, table)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Response, ApiError> {
    let params = table_params(&query)?;
    let result = state.store.query_rows(&workspace, &table, &params).await?;
    Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
struct RowBody {
    #[serde(default)]
    data: Map<String, Value>,
}

async fn insert_row(
    State(state): State<Arc<AppState>>,
    Path((workspace, table)): Path<(String, String)>,
    Json(payload): Json<RowBody>,
) -> Result<Response, ApiError> {
    validate_workspace_id(&workspace)?;
    let mut row = payload.data;
    if row.is_empty() {
        return Err(ApiError::bad_request("data cannot be empty"));
    }
    hooks::before_write(&state, &workspace, "before-insert", &table, &mut row).await?;

    let result = state.store.insert_row(&workspace, &table, &row).await?;
    hooks::spawn_after(
        Arc::clone(&state),
        workspace,
        "after-insert",
        table,
        Value::Object(row),
    );
    Ok((StatusCode::CREATED, Json(result)).into_response())
}

/// The `id` key of the row selects what to update; every other key is set.
async fn update_row(
    State(state): State<Arc<AppState>>,
    Path((workspace, table)): Path<(String, String)>,
    Json(payload): Json<RowBody>,
) -> Result<Response, ApiError> {
    validate_workspace_id(&workspace)?;
    let mut row = payload.data;
    if row.is_empty() {
        return Err(ApiError::bad_request("data cannot be empty"));
    }
    hooks::before_write(&state, &workspace, "before-update", &table, &mut row).await?;

    let mut changes = row.clone();
    let Some(id) = changes.remove("id") else {
        return Err(ApiError::bad_request("data must include 'id' field"));
    };
    let mut key = Map::new();
    key.insert("id".to_string(), id);

    let result = state
        .store
        .update_row(&workspace, &table, &changes, &key)
        .await?;
    hooks::spawn_after(
        Arc::clone(&state),
        workspace,
        "after-update",
        table,
        Value::Object(row),
    );
    Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
struct DeleteBody {
    #[serde(default)]
    ids: Vec<Value>,
}

async fn delete_rows(
    State(state): State<Arc<AppState>>,
    Path((workspace, table)): Path<(String, String)>,
    Json(payload): Json<DeleteBody>,
) -> Result<Response, ApiError> {
    validate_workspace_id(&workspace)?;
    if payload.ids.is_empty() {
        return Err(ApiError::bad_request("ids cannot be empty"));
    }
    let result = state
        .store
        .delete_rows(&workspace, &table, &payload.ids)
        .await?;
    hooks::spawn_after(
        Arc::clone(&state),
        workspace,
        "after-delete",
        table,
        serde_json::json!({ "ids": payload.ids }),
    );
    Ok(Json(result).into_response())
}

async fn schema_graph(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
) -> Result<Response, ApiError> {
    let graph = state.store.get_schema_graph(&workspace).await?;
    Ok(Json(graph).into_response())
}

async fn stats(
    State(state): State<Arc<AppState>>,
    Path(workspace): Path<String>,
) -> Result<Response, ApiError> {
    let stats = state.store.get_stats(&workspace).await?;
    Ok(Json(stats).into_response())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    /// Adds a machine-readable `code` to the error body.
    pub(crate) fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::InvalidWorkspace(_) | StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StoreError::TableNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Sqlite { .. } | StoreError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<VmError> for ApiError {
    fn from(err: VmError) -> Self {
        let status = match &err {
            VmError::CodeTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            VmError::ExecTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            VmError::Request(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NotDeployed(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            PoolError::Store(inner) => {
                let mapped = ApiError::from(inner);
                ApiError::new(mapped.status, format!("vmpool: {}", mapped.message))
            }
            PoolError::Vm(inner) => {
                let mapped = ApiError::from(inner);
                ApiError::new(mapped.status, format!("vmpool: {}", mapped.message))
            }
            PoolError::Loader { .. } => ApiError::internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "api error");
        } else {
            warn!(status = %self.status, message = %self.message, "api error");
        }
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use hive_db::{ColumnDef, CreateTableRequest};
    use hive_kernel::{MemoryCodeLoader, RuntimeConfig};
    use serde_json::json;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        loader: Arc<MemoryCodeLoader>,
        store: Store,
        _dir: TempDir,
    }

    fn setup_test_app() -> TestApp {
        let dir = TempDir::new().expect("tempdir");
        let config = RuntimeConfig {
            base_dir: dir.path().to_path_buf(),
            ..RuntimeConfig::default()
        };
        let store = Store::new(config.store_config());
        let loader = Arc::new(MemoryCodeLoader::new());
        let pool = Arc::new(VmPool::new(store.clone(), loader.clone(), &config));
        let state = Arc::new(AppState::new(pool, store.clone()));
        TestApp {
            router: build_router(state),
            loader,
            store,
            _dir: dir,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        json_request("POST", uri, body)
    }

    fn tasks_table(name: &str) -> CreateTableRequest {
        CreateTableRequest {
            name: name.into(),
            columns: vec![
                ColumnDef::new("id", "INTEGER"),
                ColumnDef::new("title", "TEXT"),
            ],
            primary_key: vec!["id".into()],
            indexes: vec![],
        }
    }

    async fn seed_tasks(app: &TestApp, workspace: &str, titles: &[&str]) {
        app.store
            .create_table(workspace, &tasks_table("tasks"))
            .await
            .unwrap();
        for title in titles {
            let mut row = Map::new();
            row.insert("title".into(), json!(title));
            app.store.insert_row(workspace, "tasks", &row).await.unwrap();
        }
    }

    async fn all_rows(app: &TestApp, workspace: &str, table: &str) -> Vec<Value> {
        let params = QueryParams {
            order_by: Some("id".into()),
            ..QueryParams::default()
        };
        let result = app.store.query_rows(workspace, table, &params).await.unwrap();
        result.rows.into_iter().map(Value::Object).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn healthz_is_ok() {
        let app = setup_test_app();
        let (status, _) = send(&app.router, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_requests_reach_workspace_routes() {
        let app = setup_test_app();
        app.loader.deploy(
            "ws-http",
            r#"exports.routes = {
                "GET /": () => "root",
                "GET /users/:id": ctx => ({ userId: ctx.params.id, q: ctx.query.q ?? null }),
                "POST /echo": ctx => ({ status: 201, body: ctx.body }),
            };"#,
        );

        let (status, body) = send(&app.router, get("/runtime/ws-http/api/users/42?q=x")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"userId": "42", "q": "x"}));

        let (status, body) = send(&app.router, get("/runtime/ws-http/api")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("root"));

        let (status, body) = send(
            &app.router,
            post_json("/runtime/ws-http/api/echo", json!({"hello": "world"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({"hello": "world"}));

        let (status, body) = send(&app.router, get("/runtime/ws-http/api/nothing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "no route matches GET /nothing"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undeployed_workspace_is_404() {
        let app = setup_test_app();
        let (status, body) = send(&app.router, get("/runtime/ws-none/api/ping")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().starts_with("vmpool: no logic code deployed"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_failure_is_500() {
        let app = setup_test_app();
        app.loader.deploy(
            "ws-fail",
            r#"exports.routes = { "GET /boom": () => { throw new Error("kaboom"); } };"#,
        );
        let (status, body) = send(&app.router, get("/runtime/ws-fail/api/boom")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("kaboom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_json_body_is_400() {
        let app = setup_test_app();
        app.loader
            .deploy("ws-json", r#"exports.routes = { "POST /x": () => 1 };"#);
        let request = Request::builder()
            .method("POST")
            .uri("/runtime/ws-json/api/x")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid JSON body"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn data_endpoints_expose_the_store() {
        let app = setup_test_app();
        app.store
            .create_table(
                "ws-data",
                &CreateTableRequest {
                    name: "tasks".into(),
                    columns: vec![
                        ColumnDef::new("id", "INTEGER"),
                        ColumnDef::new("title", "TEXT"),
                    ],
                    primary_key: vec!["id".into()],
                    indexes: vec![],
                },
            )
            .await
            .unwrap();

        for title in ["one", "two", "three"] {
            let (status, body) = send(
                &app.router,
                post_json("/runtime/ws-data/data/tasks", json!({"data": {"title": title}})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body["affected_rows"], json!(1));
        }

        let (status, body) = send(
            &app.router,
            get("/runtime/ws-data/data/tasks?page=2&page_size=2&order_by=id&order_dir=asc"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], json!(3));
        assert_eq!(body["rows"], json!([{"id": 3, "title": "three"}]));

        let (status, body) = send(&app.router, get("/runtime/ws-data/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["table_count"], json!(1));

        let (status, body) = send(&app.router, get("/runtime/ws-data/schema")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodes"][0]["name"], json!("tasks"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_workspace_is_400() {
        let app = setup_test_app();
        let (status, body) = send(&app.router, get("/runtime/bad.id/stats")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("vmstore:"));
    }

    #[test]
    fn table_params_read_indexed_filters() {
        let query: BTreeMap<String, String> = [
            ("page", "2"),
            ("filters[0][column]", "title"),
            ("filters[0][operator]", "LIKE"),
            ("filters[0][value]", "t%"),
            ("filters[1][column]", "id"),
            ("filters[1][value]", "3"),
            ("filters[3][column]", "skipped"),
            ("filter_combinator", "OR"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let params = table_params(&query).unwrap();
        assert_eq!(params.page, 2);
        assert_eq!(params.page_size, 0);
        assert_eq!(
            params.filters,
            vec![
                QueryFilter::new("title", "LIKE", "t%"),
                QueryFilter::new("id", "", "3"),
            ]
        );
        assert_eq!(params.filter_combinator.as_deref(), Some("OR"));

        let bad: BTreeMap<String, String> =
            [("page_size".to_string(), "lots".to_string())].into_iter().collect();
        assert!(table_params(&bad).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn filtered_reads_over_http() {
        let app = setup_test_app();
        seed_tasks(&app, "ws-filter", &["one", "two", "three"]).await;

        let (status, body) = send(
            &app.router,
            get("/runtime/ws-filter/data/tasks?order_by=id\
                 &filters%5B0%5D%5Bcolumn%5D=title\
                 &filters%5B0%5D%5Boperator%5D=LIKE\
                 &filters%5B0%5D%5Bvalue%5D=t%25"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], json!(2));
        assert_eq!(
            body["rows"],
            json!([{"id": 2, "title": "two"}, {"id": 3, "title": "three"}])
        );

        let (status, body) = send(
            &app.router,
            get("/runtime/ws-filter/data/tasks?order_by=id&filter_combinator=OR\
                 &filters%5B0%5D%5Bcolumn%5D=title&filters%5B0%5D%5Bvalue%5D=one\
                 &filters%5B1%5D%5Bcolumn%5D=title&filters%5B1%5D%5Bvalue%5D=three"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], json!(2));
        assert_eq!(body["rows"][1]["title"], json!("three"));

        let (status, _) = send(&app.router, get("/runtime/ws-filter/data/tasks?page=abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rows_can_be_updated_and_deleted() {
        let app = setup_test_app();
        seed_tasks(&app, "ws-rows", &["one", "two", "three"]).await;

        let (status, body) = send(
            &app.router,
            json_request(
                "PUT",
                "/runtime/ws-rows/data/tasks",
                json!({"data": {"id": 2, "title": "TWO"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["affected_rows"], json!(1));

        let (status, body) = send(
            &app.router,
            json_request("PUT", "/runtime/ws-rows/data/tasks", json!({"data": {"title": "x"}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("data must include 'id' field"));

        let (status, body) = send(
            &app.router,
            json_request("DELETE", "/runtime/ws-rows/data/tasks", json!({"ids": [1, 3]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["affected_rows"], json!(2));

        let (status, _) = send(
            &app.router,
            json_request("DELETE", "/runtime/ws-rows/data/tasks", json!({"ids": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app.router,
            post_json("/runtime/ws-rows/data/tasks", json!({"data": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(
            all_rows(&app, "ws-rows", "tasks").await,
            vec![json!({"id": 2, "title": "TWO"})]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn before_hooks_can_reject_and_amend_writes() {
        let app = setup_test_app();
        app.store
            .create_table(
                "ws-hooks",
                &CreateTableRequest {
                    name: "notes".into(),
                    columns: vec![
                        ColumnDef::new("id", "INTEGER"),
                        ColumnDef::new("title", "TEXT"),
                        ColumnDef::new("slug", "TEXT").nullable(),
                    ],
                    primary_key: vec!["id".into()],
                    indexes: vec![],
                },
            )
            .await
            .unwrap();
        app.loader.deploy(
            "ws-hooks",
            r#"exports.routes = {
                "POST /hooks/before-insert/notes": ctx => {
                    const row = ctx.body.data;
                    if (!row.title) return { allow: false, error: "title required" };
                    return { allow: true, data: { slug: row.title.toLowerCase() } };
                },
                "POST /hooks/before-update/notes": ctx => ({ data: { slug: "edited" } }),
            };"#,
        );

        let (status, body) = send(
            &app.router,
            post_json("/runtime/ws-hooks/data/notes", json!({"data": {"title": ""}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "title required", "code": "HOOK_REJECTED"}));

        let (status, _) = send(
            &app.router,
            post_json("/runtime/ws-hooks/data/notes", json!({"data": {"title": "Hello"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            all_rows(&app, "ws-hooks", "notes").await,
            vec![json!({"id": 1, "title": "Hello", "slug": "hello"})]
        );

        let (status, _) = send(
            &app.router,
            json_request(
                "PUT",
                "/runtime/ws-hooks/data/notes",
                json!({"data": {"id": 1, "title": "Bye"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            all_rows(&app, "ws-hooks", "notes").await,
            vec![json!({"id": 1, "title": "Bye", "slug": "edited"})]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_pass_through_missing_or_failing_hooks() {
        let app = setup_test_app();
        seed_tasks(&app, "ws-plain", &[]).await;
        app.loader.deploy(
            "ws-plain",
            r#"exports.routes = {
                "GET /ping": () => "pong",
                "POST /hooks/before-update/tasks": () => { throw new Error("broken hook"); },
            };"#,
        );

        let (status, body) = send(
            &app.router,
            post_json("/runtime/ws-plain/data/tasks", json!({"data": {"title": "a"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["last_insert_id"], json!(1));

        let (status, _) = send(
            &app.router,
            json_request(
                "PUT",
                "/runtime/ws-plain/data/tasks",
                json!({"data": {"id": 1, "title": "b"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            all_rows(&app, "ws-plain", "tasks").await,
            vec![json!({"id": 1, "title": "b"})]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn after_hooks_run_in_the_background() {
        let app = setup_test_app();
        seed_tasks(&app, "ws-after", &[]).await;
        app.store
            .create_table(
                "ws-after",
                &CreateTableRequest {
                    name: "audit".into(),
                    columns: vec![
                        ColumnDef::new("id", "INTEGER"),
                        ColumnDef::new("note", "TEXT"),
                    ],
                    primary_key: vec!["id".into()],
                    indexes: vec![],
                },
            )
            .await
            .unwrap();
        app.loader.deploy(
            "ws-after",
            r#"exports.routes = {
                "POST /hooks/after-insert/tasks": ctx => {
                    db.insert("audit", { note: "inserted " + ctx.body.data.title });
                },
                "POST /hooks/after-delete/tasks": ctx => {
                    db.insert("audit", { note: "deleted " + ctx.body.data.ids.join(",") });
                },
            };"#,
        );

        async fn wait_for_audit(app: &TestApp, expected: usize) -> Vec<Value> {
            for _ in 0..100 {
                let rows = all_rows(app, "ws-after", "audit").await;
                if rows.len() >= expected {
                    return rows;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            panic!("audit rows never reached {expected}");
        }

        let (status, _) = send(
            &app.router,
            post_json("/runtime/ws-after/data/tasks", json!({"data": {"title": "first"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        wait_for_audit(&app, 1).await;

        let (status, _) = send(
            &app.router,
            json_request("DELETE", "/runtime/ws-after/data/tasks", json!({"ids": [1]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let notes: Vec<Value> = wait_for_audit(&app, 2)
            .await
            .into_iter()
            .map(|row| row["note"].clone())
            .collect();
        assert_eq!(notes, vec![json!("inserted first"), json!("deleted 1")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn admin_routes_manage_tables() {
        let app = setup_test_app();

        let (status, body) = send(
            &app.router,
            post_json(
                "/runtime/ws-admin/tables",
                json!({
                    "name": "people",
                    "columns": [
                        {"name": "id", "type": "INTEGER"},
                        {"name": "name", "type": "VARCHAR(64)"},
                    ],
                    "primary_key": ["id"],
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, json!({"table": "people"}));

        let (status, body) = send(&app.router, get("/runtime/ws-admin/tables")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tables"][0]["name"], json!("people"));
        assert_eq!(body["tables"][0]["column_count"], json!(2));

        let (status, body) = send(
            &app.router,
            json_request(
                "PATCH",
                "/runtime/ws-admin/tables/people",
                json!({"add_columns": [{"name": "email", "type": "TEXT", "nullable": true}]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"table": "people"}));

        let (status, body) = send(&app.router, get("/runtime/ws-admin/tables/people")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["primary_key"], json!(["id"]));
        let names: Vec<&str> = body["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["id", "name", "email"]);

        let request = Request::builder()
            .method("DELETE")
            .uri("/runtime/ws-admin/tables/people")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], json!("CONFIRM_REQUIRED"));

        let (status, _) = send(
            &app.router,
            json_request("DELETE", "/runtime/ws-admin/tables/people", json!({"confirm": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app.router, get("/runtime/ws-admin/tables/people")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sql_route_records_history() {
        let app = setup_test_app();
        seed_tasks(&app, "ws-sql", &[]).await;

        let (status, body) = send(
            &app.router,
            post_json(
                "/runtime/ws-sql/sql",
                json!({"sql": "INSERT INTO tasks (title) VALUES (?)", "params": ["ada"]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["affected_rows"], json!(1));

        let (status, body) = send(
            &app.router,
            post_json("/runtime/ws-sql/sql", json!({"sql": "SELECT title FROM tasks"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"], json!([{"title": "ada"}]));

        let (status, _) = send(
            &app.router,
            post_json("/runtime/ws-sql/sql", json!({"sql": "SELECT * FROM missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = send(&app.router, post_json("/runtime/ws-sql/sql", json!({"sql": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app.router, get("/runtime/ws-sql/sql/history")).await;
        assert_eq!(status, StatusCode::OK);
        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["sql"], json!("SELECT * FROM missing"));
        assert_eq!(history[0]["status"], json!("error"));
        assert!(history[0]["error"].as_str().unwrap().contains("missing"));
        assert_eq!(history[1]["status"], json!("success"));
        assert!(history[1].get("error").is_none());
        assert_eq!(history[2]["sql"], json!("INSERT INTO tasks (title) VALUES (?)"));

        let (_, body) = send(&app.router, get("/runtime/ws-other/sql/history")).await;
        assert_eq!(body, json!({"history": []}));
    }
}
