//! Per-workspace SQLite ownership for the Hive runtime.
//!
//! Every workspace gets its own database file under a configured base
//! directory. The [`Store`] memoises exactly one [`WorkspaceDb`] handle per
//! workspace; each handle is a sqlx pool pinned to a single physical
//! connection so that all DDL and DML for one workspace is serialized, while
//! different workspaces proceed in parallel.

mod query;
mod schema;
mod types;

use std::{
    borrow::Cow,
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex as SyncMutex, RwLock};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, instrument, warn};

pub use query::build_where_clause;
pub use schema::map_column_type;
pub use types::*;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

const MAX_WORKSPACE_ID_LEN: usize = 128;

/// Pragmas applied to every freshly opened workspace handle, in order.
pub fn default_pragmas() -> Vec<(String, String)> {
    [
        ("journal_mode", "WAL"),
        ("busy_timeout", "5000"),
        ("foreign_keys", "ON"),
        ("synchronous", "NORMAL"),
        ("cache_size", "-2000"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_dir: PathBuf,
    pub pragmas: Vec<(String, String)>,
}

impl StoreConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            pragmas: default_pragmas(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("data/vm")
    }
}

/// Errors returned by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vmstore: invalid workspace id {0:?}")]
    InvalidWorkspace(String),
    #[error("vmstore: {0}")]
    InvalidInput(&'static str),
    #[error("vmstore: table {0:?} not found")]
    TableNotFound(String),
    #[error("vmstore: store is closed")]
    Closed,
    #[error("vmstore: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("vmstore: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn sql_err(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Sqlite { context, source }
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Io { context, source }
}

/// Rejects identifiers that could escape the base directory or collide with
/// journal sidecar names.
pub fn validate_workspace_id(workspace_id: &str) -> Result<(), StoreError> {
    let valid = !workspace_id.is_empty()
        && workspace_id.len() <= MAX_WORKSPACE_ID_LEN
        && workspace_id
            .chars()
            .all(|c| matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidWorkspace(workspace_id.to_string()))
    }
}

/// Process-local handle to one workspace database.
///
/// Cloning is cheap and clones compare equal under [`WorkspaceDb::ptr_eq`].
#[derive(Clone, Debug)]
pub struct WorkspaceDb {
    inner: Arc<DbInner>,
}

#[derive(Debug)]
struct DbInner {
    workspace_id: String,
    path: PathBuf,
    pool: SqlitePool,
}

impl WorkspaceDb {
    pub fn workspace_id(&self) -> &str {
        &self.inner.workspace_id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Exposes the underlying single-connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub fn ptr_eq(&self, other: &WorkspaceDb) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    async fn close(&self) {
        self.inner.pool.close().await;
    }
}

/// Owner of every workspace database handle in the process.
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    config: StoreConfig,
    dbs: RwLock<HashMap<String, WorkspaceDb>>,
    open_locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                dbs: RwLock::new(HashMap::new()),
                open_locks: SyncMutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Deterministic location of the main database file for a workspace.
    pub fn db_path(&self, workspace_id: &str) -> PathBuf {
        self.inner
            .config
            .base_dir
            .join(format!("{workspace_id}.db"))
    }

    pub fn exists(&self, workspace_id: &str) -> bool {
        validate_workspace_id(workspace_id).is_ok() && self.db_path(workspace_id).exists()
    }

    /// Returns the memoised handle, creating the file and connection on first use.
    pub async fn get_db(&self, workspace_id: &str) -> Result<WorkspaceDb, StoreError> {
        validate_workspace_id(workspace_id)?;
        if let Some(db) = self.cached(workspace_id)? {
            return Ok(db);
        }

        // First opens are serialised per workspace only.
        let lock = Arc::clone(
            self.inner
                .open_locks
                .lock()
                .entry(workspace_id.to_string())
                .or_default(),
        );
        let opened = {
            let _guard = lock.lock().await;
            self.open_once(workspace_id).await
        };
        let mut locks = self.inner.open_locks.lock();
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(workspace_id);
        }
        opened
    }

    async fn open_once(&self, workspace_id: &str) -> Result<WorkspaceDb, StoreError> {
        if let Some(db) = self.cached(workspace_id)? {
            return Ok(db);
        }
        let db = self.open(workspace_id).await?;
        self.inner
            .dbs
            .write()
            .insert(workspace_id.to_string(), db.clone());
        Ok(db)
    }

    fn cached(&self, workspace_id: &str) -> Result<Option<WorkspaceDb>, StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.inner.dbs.read().get(workspace_id).cloned())
    }

    #[instrument(skip(self))]
    async fn open(&self, workspace_id: &str) -> Result<WorkspaceDb, StoreError> {
        let base_dir = &self.inner.config.base_dir;
        fs::create_dir_all(base_dir)
            .await
            .map_err(io_err(format!("create base dir {}", base_dir.display())))?;

        let path = self.db_path(workspace_id);
        let mut options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));
        for (name, value) in &self.inner.config.pragmas {
            options = options.pragma(
                Cow::Owned(name.clone()),
                Cow::Owned(value.clone()),
            );
        }

        // One physical connection: max-open = max-idle = 1.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(sql_err(format!("open {}", path.display())))?;

        info!(workspace = %workspace_id, path = %path.display(), "workspace database opened");
        Ok(WorkspaceDb {
            inner: Arc::new(DbInner {
                workspace_id: workspace_id.to_string(),
                path,
                pool,
            }),
        })
    }

    /// Closes the live handle, if any. The file stays on disk.
    pub async fn close_db(&self, workspace_id: &str) -> Result<(), StoreError> {
        validate_workspace_id(workspace_id)?;
        let removed = self.inner.dbs.write().remove(workspace_id);
        if let Some(db) = removed {
            db.close().await;
            debug!(workspace = %workspace_id, "workspace database closed");
        }
        Ok(())
    }

    /// Closes the handle and removes the database file plus its sidecars.
    #[instrument(skip(self))]
    pub async fn delete(&self, workspace_id: &str) -> Result<(), StoreError> {
        self.close_db(workspace_id).await?;
        let main = self.db_path(workspace_id);
        let mut targets = vec![main.clone()];
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = main.clone().into_os_string();
            sidecar.push(suffix);
            targets.push(PathBuf::from(sidecar));
        }

        for target in targets {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StoreError::Io {
                        context: format!("remove {}", target.display()),
                        source: err,
                    })
                }
            }
        }
        info!(workspace = %workspace_id, "workspace database deleted");
        Ok(())
    }

    /// Checkpoints the WAL and copies the main file while holding the
    /// workspace's only connection, so no write can land mid-copy.
    #[instrument(skip(self, dest), fields(dest = %dest.as_ref().display()))]
    pub async fn backup_to(
        &self,
        workspace_id: &str,
        dest: impl AsRef<Path>,
    ) -> Result<u64, StoreError> {
        let dest = dest.as_ref();
        let db = self.get_db(workspace_id).await?;
        let mut conn = db
            .pool()
            .acquire()
            .await
            .map_err(sql_err("backup: acquire connection"))?;

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut *conn)
            .await
            .map_err(sql_err("backup: checkpoint"))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(io_err(format!("backup: create {}", parent.display())))?;
        }
        let copied = fs::copy(db.path(), dest)
            .await
            .map_err(io_err(format!("backup: copy to {}", dest.display())))?;
        drop(conn);
        Ok(copied)
    }

    /// Closes every handle. Subsequent `get_db` calls fail with [`StoreError::Closed`].
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<WorkspaceDb> = self.inner.dbs.write().drain().map(|(_, db)| db).collect();
        for db in drained {
            db.close().await;
        }
        info!("store closed");
    }

    pub async fn list_tables(&self, workspace_id: &str) -> Result<Vec<TableInfo>, StoreError> {
        self.get_db(workspace_id).await?.list_tables().await
    }

    pub async fn get_table_schema(
        &self,
        workspace_id: &str,
        table: &str,
    ) -> Result<TableSchema, StoreError> {
        self.get_db(workspace_id).await?.table_schema(table).await
    }

    pub async fn get_schema_graph(&self, workspace_id: &str) -> Result<SchemaGraph, StoreError> {
        self.get_db(workspace_id).await?.schema_graph().await
    }

    pub async fn get_stats(&self, workspace_id: &str) -> Result<DatabaseStats, StoreError> {
        self.get_db(workspace_id).await?.stats().await
    }

    pub async fn create_table(
        &self,
        workspace_id: &str,
        request: &CreateTableRequest,
    ) -> Result<(), StoreError> {
        self.get_db(workspace_id).await?.create_table(request).await
    }

    pub async fn alter_table(
        &self,
        workspace_id: &str,
        table: &str,
        request: &AlterTableRequest,
    ) -> Result<(), StoreError> {
        self.get_db(workspace_id)
            .await?
            .alter_table(table, request)
            .await
    }

    pub async fn drop_table(&self, workspace_id: &str, table: &str) -> Result<(), StoreError> {
        self.get_db(workspace_id).await?.drop_table(table).await
    }

    pub async fn insert_row(
        &self,
        workspace_id: &str,
        table: &str,
        data: &Map<String, Value>,
    ) -> Result<ExecResult, StoreError> {
        self.get_db(workspace_id).await?.insert_row(table, data).await
    }

    pub async fn update_row(
        &self,
        workspace_id: &str,
        table: &str,
        data: &Map<String, Value>,
        where_: &Map<String, Value>,
    ) -> Result<ExecResult, StoreError> {
        self.get_db(workspace_id)
            .await?
            .update_row(table, data, where_)
            .await
    }

    pub async fn delete_rows(
        &self,
        workspace_id: &str,
        table: &str,
        ids: &[Value],
    ) -> Result<ExecResult, StoreError> {
        self.get_db(workspace_id).await?.delete_rows(table, ids).await
    }

    pub async fn query_rows(
        &self,
        workspace_id: &str,
        table: &str,
        params: &QueryParams,
    ) -> Result<QueryResult, StoreError> {
        self.get_db(workspace_id)
            .await?
            .query_rows(table, params)
            .await
    }

    pub async fn execute_sql(
        &self,
        workspace_id: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, StoreError> {
        self.get_db(workspace_id)
            .await?
            .execute_sql(sql, params)
            .await
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) && !self.dbs.get_mut().is_empty() {
            warn!("store dropped without close; connections are released lazily");
        }
    }
}
