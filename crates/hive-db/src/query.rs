//! Row-level reads and writes, ad-hoc SQL and the value conversions between
//! JSON and SQLite storage classes.

use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Number, Value};
use sqlx::{
    pool::PoolConnection,
    query::Query,
    sqlite::{SqliteArguments, SqliteRow},
    Column, Executor, Row as _, Sqlite, Statement, TypeInfo, ValueRef,
};
use tracing::debug;

use crate::{sql_err, ExecResult, QueryFilter, QueryParams, QueryResult, Row, StoreError, WorkspaceDb};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 1000;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Double-quotes an identifier, doubling any embedded quote.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_columns(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds a parameterised WHERE body (without the keyword) from dashboard filters.
///
/// Operators are matched case-insensitively; unknown ones degrade to `=`.
/// `IN` splits its value on commas and trims each element.
pub fn build_where_clause(filters: &[QueryFilter], combinator: Option<&str>) -> (String, Vec<Value>) {
    if filters.is_empty() {
        return (String::new(), Vec::new());
    }

    let joiner = match combinator {
        Some(c) if c.eq_ignore_ascii_case("or") => " OR ",
        _ => " AND ",
    };

    let mut clauses = Vec::with_capacity(filters.len());
    let mut args = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = quote_ident(&filter.column);
        let op = filter.operator.trim().to_ascii_uppercase();
        match op.as_str() {
            "=" | "!=" | ">" | ">=" | "<" | "<=" | "LIKE" | "NOT LIKE" => {
                clauses.push(format!("{column} {op} ?"));
                args.push(Value::String(filter.value.clone()));
            }
            "IS NULL" | "IS NOT NULL" => clauses.push(format!("{column} {op}")),
            "IN" => {
                let parts: Vec<&str> = filter.value.split(',').map(str::trim).collect();
                let placeholders = vec!["?"; parts.len()].join(",");
                clauses.push(format!("{column} IN ({placeholders})"));
                args.extend(parts.into_iter().map(|p| Value::String(p.to_string())));
            }
            _ => {
                clauses.push(format!("{column} = ?"));
                args.push(Value::String(filter.value.clone()));
            }
        }
    }
    (clauses.join(joiner), args)
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        nested => query.bind(nested.to_string()),
    }
}

fn bind_all<'q>(sql: &'q str, values: &[Value]) -> SqliteQuery<'q> {
    values
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

/// Converts one column of a row into JSON using the value's storage class.
fn decode_column(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let value = match storage.as_str() {
        "INTEGER" | "BIGINT" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "BLOB" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
            match String::from_utf8(bytes) {
                Ok(text) => Value::String(text),
                Err(err) => Value::String(STANDARD.encode(err.into_bytes())),
            }
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

fn decode_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut out = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        out.insert(column.name().to_string(), decode_column(row, column.ordinal())?);
    }
    Ok(out)
}

/// Runs a row-returning statement on an already acquired connection and
/// materialises every row before returning.
async fn fetch_rows(
    conn: &mut PoolConnection<Sqlite>,
    sql: &str,
    params: &[Value],
) -> Result<(Vec<String>, Vec<Row>), sqlx::Error> {
    let rows = bind_all(sql, params).fetch_all(&mut **conn).await?;
    let columns = match rows.first() {
        Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
        None => {
            let statement = (&mut **conn).prepare(sql).await?;
            statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect()
        }
    };
    let decoded = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
    Ok((columns, decoded))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn sorted_entries(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn is_query_statement(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_uppercase();
    ["SELECT", "PRAGMA", "EXPLAIN"]
        .iter()
        .any(|kw| head.starts_with(kw))
}

impl WorkspaceDb {
    pub(crate) async fn acquire(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        self.pool()
            .acquire()
            .await
            .map_err(sql_err("acquire connection"))
    }

    /// Paged, filtered, ordered read of one table.
    pub async fn query_rows(&self, table: &str, params: &QueryParams) -> Result<QueryResult, StoreError> {
        let start = Instant::now();
        let page = if params.page <= 0 { 1 } else { params.page };
        let page_size = match params.page_size {
            n if n <= 0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let (where_clause, where_args) =
            build_where_clause(&params.filters, params.filter_combinator.as_deref());
        let where_sql = if where_clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {where_clause}")
        };

        let mut conn = self.acquire().await?;
        let count_sql = format!("SELECT COUNT(*) FROM {}{where_sql}", quote_ident(table));
        let total_count: i64 = bind_all(&count_sql, &where_args)
            .fetch_one(&mut *conn)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(sql_err("count rows"))?;

        let mut select_sql = format!("SELECT * FROM {}{where_sql}", quote_ident(table));
        if let Some(order_by) = params.order_by.as_deref().filter(|c| !c.is_empty()) {
            let dir = match params.order_dir.as_deref() {
                Some(d) if d.eq_ignore_ascii_case("desc") => "DESC",
                _ => "ASC",
            };
            select_sql.push_str(&format!(" ORDER BY {} {dir}", quote_ident(order_by)));
        }
        // Pages past the representable range read nothing instead of wrapping.
        let offset = (page - 1).saturating_mul(page_size);
        select_sql.push_str(&format!(" LIMIT {page_size} OFFSET {offset}"));

        let (columns, rows) = fetch_rows(&mut conn, &select_sql, &where_args)
            .await
            .map_err(sql_err("query rows"))?;

        Ok(QueryResult {
            columns,
            rows,
            affected_rows: 0,
            total_count,
            duration_ms: elapsed_ms(start),
        })
    }

    pub async fn insert_row(&self, table: &str, data: &Map<String, Value>) -> Result<ExecResult, StoreError> {
        if data.is_empty() {
            return Err(StoreError::InvalidInput("insert requires at least one column"));
        }
        let entries = sorted_entries(data);
        let columns = entries
            .iter()
            .map(|(c, _)| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; entries.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            quote_ident(table)
        );
        let values: Vec<Value> = entries.into_iter().map(|(_, v)| v.clone()).collect();

        let result = bind_all(&sql, &values)
            .execute(self.pool())
            .await
            .map_err(sql_err("insert row"))?;
        debug!(workspace = %self.workspace_id(), table, "row inserted");
        Ok(ExecResult {
            last_insert_id: result.last_insert_rowid(),
            affected_rows: result.rows_affected(),
        })
    }

    /// `UPDATE table SET ... WHERE a = ? AND b = ?`; both maps must be non-empty.
    pub async fn update_row(
        &self,
        table: &str,
        data: &Map<String, Value>,
        where_: &Map<String, Value>,
    ) -> Result<ExecResult, StoreError> {
        if data.is_empty() {
            return Err(StoreError::InvalidInput("update requires at least one column"));
        }
        if where_.is_empty() {
            return Err(StoreError::InvalidInput("update requires a WHERE clause"));
        }

        let set_entries = sorted_entries(data);
        let where_entries = sorted_entries(where_);
        let set_sql = set_entries
            .iter()
            .map(|(c, _)| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let where_sql = where_entries
            .iter()
            .map(|(c, _)| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("UPDATE {} SET {set_sql} WHERE {where_sql}", quote_ident(table));
        let values: Vec<Value> = set_entries
            .into_iter()
            .chain(where_entries)
            .map(|(_, v)| v.clone())
            .collect();

        let result = bind_all(&sql, &values)
            .execute(self.pool())
            .await
            .map_err(sql_err("update row"))?;
        Ok(ExecResult {
            last_insert_id: 0,
            affected_rows: result.rows_affected(),
        })
    }

    /// `DELETE FROM table WHERE id IN (...)`.
    pub async fn delete_rows(&self, table: &str, ids: &[Value]) -> Result<ExecResult, StoreError> {
        if ids.is_empty() {
            return Err(StoreError::InvalidInput("delete requires at least one ID"));
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM {} WHERE id IN ({placeholders})", quote_ident(table));
        let result = bind_all(&sql, ids)
            .execute(self.pool())
            .await
            .map_err(sql_err("delete rows"))?;
        Ok(ExecResult {
            last_insert_id: 0,
            affected_rows: result.rows_affected(),
        })
    }

    /// AND-joined equality delete; an empty map is rejected rather than
    /// truncating the table.
    pub async fn delete_where(&self, table: &str, where_: &Map<String, Value>) -> Result<ExecResult, StoreError> {
        if where_.is_empty() {
            return Err(StoreError::InvalidInput("delete requires a WHERE clause"));
        }
        let entries = sorted_entries(where_);
        let where_sql = entries
            .iter()
            .map(|(c, _)| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("DELETE FROM {} WHERE {where_sql}", quote_ident(table));
        let values: Vec<Value> = entries.into_iter().map(|(_, v)| v.clone()).collect();
        let result = bind_all(&sql, &values)
            .execute(self.pool())
            .await
            .map_err(sql_err("delete rows"))?;
        Ok(ExecResult {
            last_insert_id: 0,
            affected_rows: result.rows_affected(),
        })
    }

    /// Routes on the leading keyword: SELECT, PRAGMA and EXPLAIN return rows,
    /// everything else returns an affected-row count.
    pub async fn execute_sql(&self, sql: &str, params: &[Value]) -> Result<QueryResult, StoreError> {
        let start = Instant::now();
        if is_query_statement(sql) {
            let mut conn = self.acquire().await?;
            let (columns, rows) = fetch_rows(&mut conn, sql, params)
                .await
                .map_err(sql_err("execute sql"))?;
            let total_count = i64::try_from(rows.len()).unwrap_or(i64::MAX);
            return Ok(QueryResult {
                columns,
                rows,
                affected_rows: 0,
                total_count,
                duration_ms: elapsed_ms(start),
            });
        }

        let result = bind_all(sql, params)
            .execute(self.pool())
            .await
            .map_err(sql_err("execute sql"))?;
        Ok(QueryResult {
            affected_rows: result.rows_affected(),
            duration_ms: elapsed_ms(start),
            ..QueryResult::default()
        })
    }

    /// Prepared read returning every row.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let rows = bind_all(sql, params)
            .fetch_all(self.pool())
            .await
            .map_err(sql_err("query"))?;
        rows.iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err("decode row"))
    }

    pub async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>, StoreError> {
        let row = bind_all(sql, params)
            .fetch_optional(self.pool())
            .await
            .map_err(sql_err("query one"))?;
        row.as_ref()
            .map(decode_row)
            .transpose()
            .map_err(sql_err("decode row"))
    }

    /// Non-query statement; reports the affected-row count.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult, StoreError> {
        let result = bind_all(sql, params)
            .execute(self.pool())
            .await
            .map_err(sql_err("execute"))?;
        Ok(ExecResult {
            last_insert_id: result.last_insert_rowid(),
            affected_rows: result.rows_affected(),
        })
    }
}
