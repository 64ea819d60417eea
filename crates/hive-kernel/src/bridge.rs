//! The `db` and `console` objects installed into every VM.
//!
//! Ops are synchronous from the JavaScript point of view. The VM runs on its
//! own OS thread, so each op blocks that thread on the tokio runtime that owns
//! the workspace's database pool.

use std::future::Future;

use deno_core::{op2, OpState};
use hive_db::{ExecResult, Row, StoreError, WorkspaceDb};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::short_id;

/// Errors surfaced to user code as JavaScript exceptions.
#[derive(Debug, Error, deno_error::JsError)]
pub enum BridgeError {
    #[class(generic)]
    #[error(transparent)]
    Store(#[from] StoreError),
    #[class(type)]
    #[error("db.{method}: {reason}")]
    InvalidArgument {
        method: &'static str,
        reason: &'static str,
    },
}

/// Per-VM state placed into the op state before any script runs.
pub(crate) struct DataBridge {
    workspace_id: String,
    db: WorkspaceDb,
    rt: Handle,
}

impl DataBridge {
    pub(crate) fn new(workspace_id: String, db: WorkspaceDb, rt: Handle) -> Self {
        Self {
            workspace_id,
            db,
            rt,
        }
    }

    fn block_on<T>(&self, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, BridgeError> {
        self.rt.block_on(fut).map_err(BridgeError::from)
    }
}

fn non_empty_object(
    value: Value,
    method: &'static str,
    reason: &'static str,
) -> Result<Map<String, Value>, BridgeError> {
    match value {
        Value::Object(map) if !map.is_empty() => Ok(map),
        _ => Err(BridgeError::InvalidArgument { method, reason }),
    }
}

fn affected(result: ExecResult) -> Value {
    json!({ "affectedRows": result.affected_rows })
}

#[op2]
fn op_hive_log(state: &mut OpState, #[string] level: String, #[serde] parts: Vec<String>) {
    let bridge = state.borrow::<DataBridge>();
    let workspace = short_id(&bridge.workspace_id);
    let message = parts.join(" ");
    match level.as_str() {
        "error" => error!(workspace, console = %level, "{message}"),
        "warn" => warn!(workspace, console = %level, "{message}"),
        _ => info!(workspace, console = %level, "{message}"),
    }
}

#[op2]
#[serde]
fn op_db_query(
    state: &mut OpState,
    #[string] sql: String,
    #[serde] params: Option<Vec<Value>>,
) -> Result<Vec<Row>, BridgeError> {
    let bridge = state.borrow::<DataBridge>();
    let params = params.unwrap_or_default();
    bridge.block_on(bridge.db.query(&sql, &params))
}

#[op2]
#[serde]
fn op_db_query_one(
    state: &mut OpState,
    #[string] sql: String,
    #[serde] params: Option<Vec<Value>>,
) -> Result<Option<Row>, BridgeError> {
    let bridge = state.borrow::<DataBridge>();
    let params = params.unwrap_or_default();
    bridge.block_on(bridge.db.query_one(&sql, &params))
}

#[op2]
#[serde]
fn op_db_insert(
    state: &mut OpState,
    #[string] table: String,
    #[serde] data: Value,
) -> Result<Value, BridgeError> {
    let data = non_empty_object(data, "insert", "data must be a non-empty object")?;
    let bridge = state.borrow::<DataBridge>();
    let result = bridge.block_on(bridge.db.insert_row(&table, &data))?;
    Ok(json!({
        "lastInsertId": result.last_insert_id,
        "affectedRows": result.affected_rows,
    }))
}

#[op2]
#[serde]
fn op_db_update(
    state: &mut OpState,
    #[string] table: String,
    #[serde] data: Value,
    #[serde] where_: Value,
) -> Result<Value, BridgeError> {
    let data = non_empty_object(data, "update", "data must be a non-empty object")?;
    let where_ = non_empty_object(where_, "update", "where must be a non-empty object")?;
    let bridge = state.borrow::<DataBridge>();
    let result = bridge.block_on(bridge.db.update_row(&table, &data, &where_))?;
    Ok(affected(result))
}

#[op2]
#[serde]
fn op_db_delete(
    state: &mut OpState,
    #[string] table: String,
    #[serde] where_: Value,
) -> Result<Value, BridgeError> {
    let where_ = non_empty_object(where_, "delete", "where must be a non-empty object")?;
    let bridge = state.borrow::<DataBridge>();
    let result = bridge.block_on(bridge.db.delete_where(&table, &where_))?;
    Ok(affected(result))
}

#[op2]
#[serde]
fn op_db_execute(
    state: &mut OpState,
    #[string] sql: String,
    #[serde] params: Option<Vec<Value>>,
) -> Result<Value, BridgeError> {
    let bridge = state.borrow::<DataBridge>();
    let params = params.unwrap_or_default();
    let result = bridge.block_on(bridge.db.execute(&sql, &params))?;
    Ok(affected(result))
}

deno_core::extension!(
    hive_bridge,
    ops = [
        op_hive_log,
        op_db_query,
        op_db_query_one,
        op_db_insert,
        op_db_update,
        op_db_delete,
        op_db_execute,
    ],
);

pub(crate) fn extension() -> deno_core::Extension {
    hive_bridge::init_ops()
}

/// Installs `console`, `db` and `exports`, then hides every global that
/// could evaluate strings, load modules, reach the host, or reflect on the
/// sandbox.
pub(crate) const BOOTSTRAP_JS: &str = r#"
((ops) => {
  "use strict";
  const stringify = (value) => {
    if (typeof value === "string") return value;
    try {
      const json = JSON.stringify(value);
      return json === undefined ? String(value) : json;
    } catch (_) {
      return String(value);
    }
  };
  const emit = (level) => (...args) => {
    ops.op_hive_log(level, args.map(stringify));
  };
  const g = globalThis;
  g.console = Object.freeze({
    log: emit("log"),
    info: emit("info"),
    warn: emit("warn"),
    error: emit("error"),
  });
  g.db = Object.freeze({
    query: (sql, params) => ops.op_db_query(String(sql), params ?? null),
    queryOne: (sql, params) => ops.op_db_query_one(String(sql), params ?? null),
    insert: (table, data) => ops.op_db_insert(String(table), data ?? null),
    update: (table, data, where) => ops.op_db_update(String(table), data ?? null, where ?? null),
    delete: (table, where) => ops.op_db_delete(String(table), where ?? null),
    execute: (sql, params) => ops.op_db_execute(String(sql), params ?? null),
  });
  g.exports = {};
  const hidden = ["eval", "Function", "require", "process", "Proxy", "Reflect", "Deno", "globalThis"];
  for (const name of hidden) {
    try {
      Object.defineProperty(g, name, { value: undefined, writable: true, configurable: true });
    } catch (_) {
      try { g[name] = undefined; } catch (_) {}
    }
  }
})(Deno.core.ops);
"#;

/// Evaluates to `[[key, fn], ...]` for the callable entries of `exports.routes`.
pub(crate) const ROUTES_JS: &str = r#"
(() => {
  const out = [];
  if (typeof exports !== "object" || exports === null) return out;
  const routes = exports.routes;
  if (typeof routes !== "object" || routes === null) return out;
  for (const key of Object.keys(routes)) {
    const handler = routes[key];
    if (typeof handler === "function") out.push([key, handler]);
  }
  return out;
})()
"#;
