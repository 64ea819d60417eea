//! Catalog introspection and DDL for workspace databases.
//!
//! Nothing is persisted besides SQLite's own catalog; every view is derived on
//! demand from `sqlite_master` and the `PRAGMA` table functions. Each method
//! holds the workspace's single connection for its whole duration and drains
//! every result set before issuing the next statement.

use std::collections::HashSet;

use futures::TryStreamExt;
use sqlx::Row as _;
use tracing::{info, warn};

use crate::{
    query::{quote_columns, quote_ident},
    sql_err, AlterTableRequest, ColumnInfo, CreateTableRequest, DatabaseStats, ForeignKeyInfo,
    IndexInfo, SchemaGraph, SchemaGraphEdge, SchemaGraphNode, StoreError, TableInfo, TableSchema,
    WorkspaceDb,
};

/// Maps the vendor-neutral DDL vocabulary onto SQLite storage types.
///
/// A trailing size such as `(11)` or `(10,2)` is ignored when matching. Unknown
/// types pass through verbatim, which keeps the mapping idempotent.
pub fn map_column_type(data_type: &str) -> String {
    let upper = data_type.trim().to_ascii_uppercase();
    let base = match upper.split_once('(') {
        Some((base, _)) => base.trim_end(),
        None => upper.as_str(),
    };
    let mapped = match base {
        "TEXT" | "LONGTEXT" | "MEDIUMTEXT" | "TINYTEXT" | "VARCHAR" | "CHAR" | "ENUM" => "TEXT",
        "DATETIME" | "TIMESTAMP" | "DATE" | "TIME" => "TEXT",
        "INT" | "BIGINT" | "SMALLINT" | "TINYINT" | "MEDIUMINT" | "INTEGER" | "BOOLEAN" => "INTEGER",
        "FLOAT" | "DOUBLE" | "REAL" | "DECIMAL" | "NUMERIC" => "REAL",
        "BLOB" | "LONGBLOB" | "MEDIUMBLOB" => "BLOB",
        _ => return data_type.to_string(),
    };
    mapped.to_string()
}

fn is_integer_type(mapped: &str) -> bool {
    map_column_type(mapped) == "INTEGER"
}

fn column_definition(name: &str, data_type: &str, nullable: bool, default: Option<&str>) -> String {
    let mut def = format!("{} {}", quote_ident(name), map_column_type(data_type));
    if !nullable {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = default {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }
    def
}

/// Renders the `CREATE TABLE` statement and the follow-up index statements.
pub(crate) fn create_table_statements(request: &CreateTableRequest) -> Vec<String> {
    let mut defs: Vec<String> = request
        .columns
        .iter()
        .map(|col| {
            let mut def = column_definition(
                &col.name,
                &col.data_type,
                col.nullable,
                col.default_value.as_deref(),
            );
            if col.unique {
                def.push_str(" UNIQUE");
            }
            def
        })
        .collect();

    match request.primary_key.as_slice() {
        [] => {}
        [single] => {
            let position = request.columns.iter().position(|c| &c.name == single);
            match position {
                Some(i) if is_integer_type(&map_column_type(&request.columns[i].data_type)) => {
                    defs[i] = format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(single));
                }
                _ => defs.push(format!("PRIMARY KEY ({})", quote_columns(&request.primary_key))),
            }
        }
        composite => defs.push(format!("PRIMARY KEY ({})", quote_columns(composite))),
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        quote_ident(&request.name),
        defs.join(",\n  ")
    )];
    for index in &request.indexes {
        statements.push(format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            quote_ident(&index.name),
            quote_ident(&request.name),
            quote_columns(&index.columns)
        ));
    }
    statements
}

impl WorkspaceDb {
    /// User tables in name order with row and column counts.
    pub async fn list_tables(&self) -> Result<Vec<TableInfo>, StoreError> {
        let mut conn = self.acquire().await?;

        let mut names = Vec::new();
        {
            let mut stream = sqlx::query_scalar::<_, String>(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .fetch(&mut *conn);
            while let Some(name) = stream.try_next().await.map_err(sql_err("list tables"))? {
                names.push(name);
            }
        }

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let row_count = match sqlx::query_scalar::<_, i64>(&format!(
                "SELECT COUNT(*) FROM {}",
                quote_ident(&name)
            ))
            .fetch_one(&mut *conn)
            .await
            {
                Ok(count) => count,
                Err(err) => {
                    warn!(workspace = %self.workspace_id(), table = %name, error = %err, "list tables: row count unavailable");
                    0
                }
            };
            let column_count = match sqlx::query(&format!("PRAGMA table_info({})", quote_ident(&name)))
                .fetch_all(&mut *conn)
                .await
            {
                Ok(rows) => rows.len(),
                Err(err) => {
                    warn!(workspace = %self.workspace_id(), table = %name, error = %err, "list tables: column count unavailable");
                    0
                }
            };
            tables.push(TableInfo {
                name,
                row_count,
                column_count,
            });
        }
        Ok(tables)
    }

    /// Columns, indexes, foreign keys, primary key and DDL of one table.
    pub async fn table_schema(&self, table: &str) -> Result<TableSchema, StoreError> {
        let mut conn = self.acquire().await?;
        let quoted = quote_ident(table);
        let mut schema = TableSchema {
            name: table.to_string(),
            ..TableSchema::default()
        };

        let column_rows = sqlx::query(&format!("PRAGMA table_info({quoted})"))
            .fetch_all(&mut *conn)
            .await
            .map_err(sql_err("table_info"))?;
        if column_rows.is_empty() {
            return Err(StoreError::TableNotFound(table.to_string()));
        }
        // `pk` is the 1-based position within the primary key.
        let mut key_columns: Vec<(i64, String)> = Vec::new();
        for (ordinal, row) in column_rows.iter().enumerate() {
            let name: String = row.try_get("name").map_err(sql_err("scan column"))?;
            let data_type: String = row.try_get("type").map_err(sql_err("scan column"))?;
            let not_null: i64 = row.try_get("notnull").map_err(sql_err("scan column"))?;
            let default_value: Option<String> =
                row.try_get("dflt_value").map_err(sql_err("scan column"))?;
            let pk: i64 = row.try_get("pk").map_err(sql_err("scan column"))?;

            let extra = if pk > 0 && data_type.eq_ignore_ascii_case("INTEGER") {
                "auto_increment".to_string()
            } else {
                String::new()
            };
            if pk > 0 {
                key_columns.push((pk, name.clone()));
            }
            schema.columns.push(ColumnInfo {
                name,
                data_type,
                nullable: not_null == 0,
                default_value,
                is_primary_key: pk > 0,
                is_unique: false,
                ordinal_position: ordinal + 1,
                extra,
            });
        }
        key_columns.sort();
        schema.primary_key = key_columns.into_iter().map(|(_, name)| name).collect();

        let fk_rows = sqlx::query(&format!("PRAGMA foreign_key_list({quoted})"))
            .fetch_all(&mut *conn)
            .await
            .map_err(sql_err("foreign_key_list"))?;
        for row in &fk_rows {
            let fk = (|| -> Result<ForeignKeyInfo, sqlx::Error> {
                let id: i64 = row.try_get("id")?;
                let column: String = row.try_get("from")?;
                Ok(ForeignKeyInfo {
                    name: format!("fk_{table}_{column}_{id}"),
                    referenced_table: row.try_get("table")?,
                    referenced_column: row.try_get::<Option<String>, _>("to")?.unwrap_or_default(),
                    on_update: row.try_get("on_update")?,
                    on_delete: row.try_get("on_delete")?,
                    column,
                })
            })();
            match fk {
                Ok(fk) => schema.foreign_keys.push(fk),
                Err(err) => warn!(workspace = %self.workspace_id(), table, error = %err, "skipping unreadable foreign key"),
            }
        }

        let index_entries: Vec<(String, bool, String)> =
            sqlx::query(&format!("PRAGMA index_list({quoted})"))
                .fetch_all(&mut *conn)
                .await
                .map_err(sql_err("index_list"))?
                .iter()
                .filter_map(|row| {
                    let name: String = row.try_get("name").ok()?;
                    let unique: i64 = row.try_get("unique").ok()?;
                    let origin: String = row.try_get("origin").ok()?;
                    Some((name, unique == 1, origin))
                })
                .collect();

        let mut unique_columns = HashSet::new();
        for (name, is_unique, origin) in index_entries {
            let columns: Vec<String> = sqlx::query(&format!("PRAGMA index_info({})", quote_ident(&name)))
                .fetch_all(&mut *conn)
                .await
                .map_err(sql_err("index_info"))?
                .iter()
                .filter_map(|row| row.try_get::<String, _>("name").ok())
                .collect();
            if let [only] = columns.as_slice() {
                if is_unique {
                    unique_columns.insert(only.clone());
                }
            }
            let is_primary = origin == "pk";
            schema.indexes.push(IndexInfo {
                name,
                columns,
                is_unique,
                is_primary,
                kind: if is_primary { "PRIMARY" } else { "BTREE" }.to_string(),
            });
        }
        for column in &mut schema.columns {
            column.is_unique = unique_columns.contains(&column.name);
        }

        schema.ddl = sqlx::query_scalar::<_, Option<String>>(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name=?",
        )
        .bind(table)
        .fetch_optional(&mut *conn)
        .await
        .map_err(sql_err("read ddl"))?
        .flatten()
        .unwrap_or_default();

        Ok(schema)
    }

    /// Every table as a node and every foreign key as an edge.
    pub async fn schema_graph(&self) -> Result<SchemaGraph, StoreError> {
        let mut graph = SchemaGraph::default();
        for table in self.list_tables().await? {
            let schema = match self.table_schema(&table.name).await {
                Ok(schema) => schema,
                Err(err) => {
                    warn!(workspace = %self.workspace_id(), table = %table.name, error = %err, "schema graph: skipping table");
                    continue;
                }
            };
            for fk in &schema.foreign_keys {
                graph.edges.push(SchemaGraphEdge {
                    id: format!(
                        "{}.{}->{}.{}",
                        table.name, fk.column, fk.referenced_table, fk.referenced_column
                    ),
                    source: table.name.clone(),
                    target: fk.referenced_table.clone(),
                    source_column: fk.column.clone(),
                    target_column: fk.referenced_column.clone(),
                    constraint_name: fk.name.clone(),
                });
            }
            graph.nodes.push(SchemaGraphNode {
                id: table.name.clone(),
                name: table.name,
                columns: schema.columns,
            });
        }
        Ok(graph)
    }

    pub async fn stats(&self) -> Result<DatabaseStats, StoreError> {
        let tables = self.list_tables().await?;
        let mut stats = DatabaseStats {
            table_count: tables.len(),
            total_rows: tables.iter().map(|t| t.row_count).sum(),
            ..DatabaseStats::default()
        };

        if let Ok(meta) = tokio::fs::metadata(self.path()).await {
            stats.file_size_kb = meta.len() / 1024;
        }

        let mut conn = self.acquire().await?;
        stats.index_count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sqlite_master WHERE type='index'")
                .fetch_one(&mut *conn)
                .await
                .map_err(sql_err("count indexes"))?;
        stats.journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode")
            .fetch_one(&mut *conn)
            .await
            .map_err(sql_err("journal mode"))?;
        Ok(stats)
    }

    pub async fn create_table(&self, request: &CreateTableRequest) -> Result<(), StoreError> {
        if request.name.is_empty() {
            return Err(StoreError::InvalidInput("create table requires a name"));
        }
        if request.columns.is_empty() {
            return Err(StoreError::InvalidInput("create table requires at least one column"));
        }

        let mut conn = self.acquire().await?;
        let mut statements = create_table_statements(request).into_iter();
        if let Some(ddl) = statements.next() {
            sqlx::query(&ddl)
                .execute(&mut *conn)
                .await
                .map_err(sql_err("create table"))?;
        }
        for (statement, index) in statements.zip(&request.indexes) {
            sqlx::query(&statement)
                .execute(&mut *conn)
                .await
                .map_err(sql_err(format!("create index {:?}", index.name)))?;
        }
        info!(workspace = %self.workspace_id(), table = %request.name, "table created");
        Ok(())
    }

    /// Applies rename, then added columns, renamed columns and dropped columns.
    pub async fn alter_table(&self, table: &str, request: &AlterTableRequest) -> Result<(), StoreError> {
        let mut conn = self.acquire().await?;
        let mut table = table.to_string();

        if let Some(new_name) = request.rename.as_deref().filter(|n| !n.is_empty()) {
            sqlx::query(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(&table),
                quote_ident(new_name)
            ))
            .execute(&mut *conn)
            .await
            .map_err(sql_err("rename table"))?;
            table = new_name.to_string();
        }

        for col in &request.add_columns {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(&table),
                column_definition(&col.name, &col.data_type, col.nullable, col.default_value.as_deref())
            );
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(sql_err(format!("add column {:?}", col.name)))?;
        }

        for col in &request.alter_columns {
            let Some(new_name) = col.new_name.as_deref() else {
                continue;
            };
            if new_name.is_empty() || new_name == col.name {
                continue;
            }
            let sql = format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(&table),
                quote_ident(&col.name),
                quote_ident(new_name)
            );
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(sql_err(format!("rename column {:?}", col.name)))?;
        }

        for name in &request.drop_columns {
            let sql = format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(&table),
                quote_ident(name)
            );
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(sql_err(format!("drop column {name:?}")))?;
        }
        Ok(())
    }

    pub async fn drop_table(&self, table: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(self.pool())
            .await
            .map_err(sql_err("drop table"))?;
        info!(workspace = %self.workspace_id(), table, "table dropped");
        Ok(())
    }
}
