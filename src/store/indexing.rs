//! The user-facing table store. Every write is shadowed by a checkpoint-
//! keyed operation log so a reorg can be undone by replaying inverse
//! images, without re-running handlers.

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::U256;
use sqlx::{AnyConnection, AnyPool, Row as _};

use crate::checkpoint::Checkpoint;
use crate::error::{IndexingError, StoreError};
use crate::store::dialect::{decode_u256, encode_u256, Dialect};

pub const MAX_LIMIT: usize = 1000;
pub const DEFAULT_LIMIT: usize = 50;

const OP_INSERT: i64 = 0;
const OP_UPDATE: i64 = 1;
const OP_DELETE: i64 = 2;

/// Scalar types a user column can hold. `BigInt` is stored as fixed-width
/// decimal text, `Bytes` as a raw byte column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int,
    BigInt,
    Text,
    Bytes,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// A user table. The first column must be `id` and is the primary key.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: &str, columns: Vec<Column>) -> eyre::Result<Self> {
        if columns.first().map(|c| c.name.as_str()) != Some("id") {
            return Err(eyre::eyre!("table '{name}' must lead with an `id` column"));
        }
        Ok(Table { name: name.to_string(), columns })
    }

    fn column(&self, name: &str) -> Result<&Column, IndexingError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| IndexingError::NonRetryable(format!(
                "unknown column '{}' on table '{}'",
                name, self.name
            )))
    }

    fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    fn reorg_table(&self) -> String {
        format!("_reorg_{}", self.name)
    }
}

/// A decoded scalar. The derived ordering backs cursor comparison in tests;
/// SQL comparison is authoritative at runtime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(U256),
    Text(String),
    Bytes(Vec<u8>),
}

pub type UserRow = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhereOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl WhereOp {
    fn sql(&self) -> &'static str {
        match self {
            WhereOp::Eq => "=",
            WhereOp::Ne => "<>",
            WhereOp::Lt => "<",
            WhereOp::Lte => "<=",
            WhereOp::Gt => ">",
            WhereOp::Gte => ">=",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub column: String,
    pub op: WhereOp,
    pub value: Value,
}

/// Arguments to `find_many`: filter, order, and cursor window.
#[derive(Debug, Clone, Default)]
pub struct FindMany {
    pub conditions: Vec<Condition>,
    pub order_by: Vec<(String, Direction)>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PageResult {
    pub rows: Vec<UserRow>,
    /// Cursor of the last row, for the next `after` call.
    pub end_cursor: Option<String>,
    /// Cursor of the first row, for the previous `before` call.
    pub start_cursor: Option<String>,
}

pub struct IndexingStore {
    pool: AnyPool,
    dialect: Dialect,
    tables: HashMap<String, Table>,
}

impl IndexingStore {
    pub fn new(pool: AnyPool, dialect: Dialect, tables: Vec<Table>) -> Self {
        let tables = tables.into_iter().map(|t| (t.name.clone(), t)).collect();
        IndexingStore { pool, dialect, tables }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn table(&self, name: &str) -> Result<&Table, IndexingError> {
        self.tables
            .get(name)
            .ok_or_else(|| IndexingError::NonRetryable(format!("unknown table '{name}'")))
    }

    /// Create user tables and their sibling op-log tables.
    pub async fn create_schema(&self) -> Result<(), StoreError> {
        for table in self.tables.values() {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    let ty = self.column_sql_type(c.ty);
                    let null = if c.nullable || c.name == "id" { "" } else { " NOT NULL" };
                    format!("{} {}{}", c.name, ty, null)
                })
                .collect();
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY (id))",
                table.name,
                columns.join(", ")
            );
            sqlx::query(&ddl).execute(&self.pool).await?;

            let serial = match self.dialect {
                Dialect::Postgres => "op_id BIGSERIAL PRIMARY KEY",
                Dialect::Sqlite => "op_id INTEGER PRIMARY KEY AUTOINCREMENT",
            };
            let reorg_ddl = format!(
                "CREATE TABLE IF NOT EXISTS {} ({serial}, checkpoint TEXT NOT NULL, \
                 operation BIGINT NOT NULL, row_id TEXT NOT NULL, prior TEXT)",
                table.reorg_table()
            );
            sqlx::query(&reorg_ddl).execute(&self.pool).await?;

            let index = format!(
                "CREATE INDEX IF NOT EXISTS {0}_checkpoint ON {0} (checkpoint)",
                table.reorg_table()
            );
            sqlx::query(&index).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn column_sql_type(&self, ty: ColumnType) -> &'static str {
        match ty {
            ColumnType::Bool => "BOOLEAN",
            ColumnType::Int => "BIGINT",
            // fixed-width text keeps ordering without native 256-bit ints
            ColumnType::BigInt => "TEXT",
            ColumnType::Text => "TEXT",
            ColumnType::Bytes => self.dialect.bytes_type(),
        }
    }

    pub async fn find_unique(
        &self,
        conn: &mut AnyConnection,
        table: &str,
        id: &Value,
    ) -> Result<Option<UserRow>, IndexingError> {
        let table = self.table(table)?;
        let sql = format!(
            "SELECT * FROM {} WHERE id = {}",
            table.name,
            self.dialect.placeholder(1)
        );
        let row = bind_value(sqlx::query(&sql), id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(StoreError::from_sqlx)?;
        row.map(|r| decode_row(table, &r)).transpose()
    }

    pub async fn find_many(
        &self,
        conn: &mut AnyConnection,
        table: &str,
        query: FindMany,
    ) -> Result<PageResult, IndexingError> {
        let table = self.table(table)?;
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
        if limit > MAX_LIMIT {
            return Err(IndexingError::NonRetryable(format!(
                "limit {limit} exceeds maximum {MAX_LIMIT}"
            )));
        }
        if query.before.is_some() && query.after.is_some() {
            return Err(IndexingError::NonRetryable(
                "cannot pass both `before` and `after`".to_string(),
            ));
        }

        // stable total order: requested columns, then id as tiebreak
        let mut order: Vec<(String, Direction)> = query.order_by.clone();
        if !order.iter().any(|(c, _)| c == "id") {
            order.push(("id".to_string(), Direction::Asc));
        }
        for (column, _) in &order {
            table.column(column)?;
        }
        let backwards = query.before.is_some();

        let mut sql = format!("SELECT * FROM {}", table.name);
        let mut binds: Vec<Value> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();

        for condition in &query.conditions {
            table.column(&condition.column)?;
            binds.push(condition.value.clone());
            clauses.push(format!(
                "{} {} {}",
                condition.column,
                condition.op.sql(),
                self.dialect.placeholder(binds.len())
            ));
        }

        if let Some(cursor) = query.after.as_deref().or(query.before.as_deref()) {
            let values = decode_cursor(cursor, order.len())?;
            clauses.push(self.keyset_clause(&order, &values, backwards, &mut binds));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let order_sql: Vec<String> = order
            .iter()
            .map(|(column, direction)| {
                // walking backwards flips the scan; rows are un-flipped below
                let flipped = match (direction, backwards) {
                    (Direction::Asc, false) | (Direction::Desc, true) => "ASC",
                    _ => "DESC",
                };
                format!("{column} {flipped}")
            })
            .collect();
        sql.push_str(&format!(" ORDER BY {} LIMIT {}", order_sql.join(", "), limit));

        let mut query_builder = sqlx::query(&sql);
        for value in &binds {
            query_builder = bind_value(query_builder, value);
        }
        let raw_rows = query_builder
            .fetch_all(&mut *conn)
            .await
            .map_err(StoreError::from_sqlx)?;
        let mut rows: Vec<UserRow> = raw_rows
            .iter()
            .map(|r| decode_row(table, r))
            .collect::<Result<_, _>>()?;
        if backwards {
            rows.reverse();
        }

        let cursor_of = |row: &UserRow| encode_cursor(&sort_key(row, &order));
        let start_cursor = rows.first().map(cursor_of);
        let end_cursor = rows.last().map(cursor_of);
        Ok(PageResult { rows, end_cursor, start_cursor })
    }

    /// Keyset condition after/before a cursor: expanded lexicographic
    /// comparison over the sort columns.
    fn keyset_clause(
        &self,
        order: &[(String, Direction)],
        cursor: &[Value],
        backwards: bool,
        binds: &mut Vec<Value>,
    ) -> String {
        let mut alternatives: Vec<String> = Vec::new();
        for depth in 0..order.len() {
            let mut parts: Vec<String> = Vec::new();
            for (i, (column, direction)) in order.iter().take(depth + 1).enumerate() {
                binds.push(cursor[i].clone());
                let placeholder = self.dialect.placeholder(binds.len());
                if i < depth {
                    parts.push(format!("{column} = {placeholder}"));
                } else {
                    let forward = matches!(direction, Direction::Asc) != backwards;
                    let op = if forward { ">" } else { "<" };
                    parts.push(format!("{column} {op} {placeholder}"));
                }
            }
            alternatives.push(format!("({})", parts.join(" AND ")));
        }
        format!("({})", alternatives.join(" OR "))
    }

    pub async fn create(
        &self,
        conn: &mut AnyConnection,
        checkpoint: &Checkpoint,
        table: &str,
        row: UserRow,
    ) -> Result<UserRow, IndexingError> {
        let table = self.table(table)?;
        self.insert_rows(conn, table, std::slice::from_ref(&row)).await?;
        self.log_operation(conn, table, checkpoint, OP_INSERT, &row, None).await?;
        Ok(row)
    }

    /// Bulk insert, chunked by the engine's bind budget over the column
    /// count.
    pub async fn create_many(
        &self,
        conn: &mut AnyConnection,
        checkpoint: &Checkpoint,
        table: &str,
        rows: Vec<UserRow>,
    ) -> Result<usize, IndexingError> {
        let table = self.table(table)?;
        let chunk_size = self.dialect.max_bind_params() / table.columns.len();
        for chunk in rows.chunks(chunk_size) {
            self.insert_rows(conn, table, chunk).await?;
            for row in chunk {
                self.log_operation(conn, table, checkpoint, OP_INSERT, row, None)
                    .await?;
            }
        }
        Ok(rows.len())
    }

    async fn insert_rows(
        &self,
        conn: &mut AnyConnection,
        table: &Table,
        rows: &[UserRow],
    ) -> Result<(), IndexingError> {
        if rows.is_empty() {
            return Ok(());
        }
        let names = table.column_names();
        let mut sql = format!("INSERT INTO {} ({}) VALUES ", table.name, names.join(", "));
        for (i, _) in rows.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(
                &self
                    .dialect
                    .values_tuple(i * names.len() + 1, names.len()),
            );
        }
        let mut query = sqlx::query(&sql);
        for row in rows {
            for column in &table.columns {
                let value = row.get(&column.name).unwrap_or(&Value::Null);
                query = bind_value(query, value);
            }
        }
        query
            .execute(&mut *conn)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Update one row through a mutator that receives the decoded current
    /// row. Missing rows are an error.
    pub async fn update<F>(
        &self,
        conn: &mut AnyConnection,
        checkpoint: &Checkpoint,
        table_name: &str,
        id: &Value,
        mutate: F,
    ) -> Result<UserRow, IndexingError>
    where
        F: FnOnce(&UserRow) -> UserRow,
    {
        let current = self
            .find_unique(conn, table_name, id)
            .await?
            .ok_or_else(|| IndexingError::NotFound {
                table: table_name.to_string(),
                id: format!("{id:?}"),
            })?;
        let table = self.table(table_name)?;
        let updated = self
            .apply_update(conn, table, id, &current, mutate(&current))
            .await?;
        self.log_operation(conn, table, checkpoint, OP_UPDATE, &updated, Some(&current))
            .await?;
        Ok(updated)
    }

    /// Update every row matching `conditions`, walking id-ascending pages
    /// so the working set stays bounded.
    pub async fn update_many<F>(
        &self,
        conn: &mut AnyConnection,
        checkpoint: &Checkpoint,
        table_name: &str,
        conditions: Vec<Condition>,
        mutate: F,
    ) -> Result<usize, IndexingError>
    where
        F: Fn(&UserRow) -> UserRow,
    {
        let page_size = self.dialect.max_row_limit().min(MAX_LIMIT);
        let mut updated = 0usize;
        let mut after: Option<String> = None;
        loop {
            let page = self
                .find_many(
                    conn,
                    table_name,
                    FindMany {
                        conditions: conditions.clone(),
                        order_by: vec![("id".to_string(), Direction::Asc)],
                        after: after.clone(),
                        before: None,
                        limit: Some(page_size),
                    },
                )
                .await?;
            if page.rows.is_empty() {
                return Ok(updated);
            }
            for current in &page.rows {
                let id = current.get("id").cloned().unwrap_or(Value::Null);
                let table = self.table(table_name)?;
                let next = self
                    .apply_update(conn, table, &id, current, mutate(current))
                    .await?;
                self.log_operation(conn, table, checkpoint, OP_UPDATE, &next, Some(current))
                    .await?;
                updated += 1;
            }
            after = page.end_cursor;
        }
    }

    async fn apply_update(
        &self,
        conn: &mut AnyConnection,
        table: &Table,
        id: &Value,
        current: &UserRow,
        patch: UserRow,
    ) -> Result<UserRow, IndexingError> {
        let mut merged = current.clone();
        for (name, value) in patch {
            table.column(&name)?;
            merged.insert(name, value);
        }
        merged.insert("id".to_string(), id.clone());

        let assignments: Vec<String> = table
            .columns
            .iter()
            .filter(|c| c.name != "id")
            .enumerate()
            .map(|(i, c)| format!("{} = {}", c.name, self.dialect.placeholder(i + 1)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = {}",
            table.name,
            assignments.join(", "),
            self.dialect.placeholder(assignments.len() + 1)
        );
        let mut query = sqlx::query(&sql);
        for column in table.columns.iter().filter(|c| c.name != "id") {
            let value = merged.get(&column.name).unwrap_or(&Value::Null);
            query = bind_value(query, value);
        }
        query = bind_value(query, id);
        query
            .execute(&mut *conn)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(merged)
    }

    /// Create-or-update in one call.
    pub async fn upsert<F>(
        &self,
        conn: &mut AnyConnection,
        checkpoint: &Checkpoint,
        table_name: &str,
        id: &Value,
        create_row: UserRow,
        mutate: F,
    ) -> Result<UserRow, IndexingError>
    where
        F: FnOnce(&UserRow) -> UserRow,
    {
        match self.find_unique(conn, table_name, id).await? {
            Some(current) => {
                let table = self.table(table_name)?;
                let updated = self
                    .apply_update(conn, table, id, &current, mutate(&current))
                    .await?;
                self.log_operation(conn, table, checkpoint, OP_UPDATE, &updated, Some(&current))
                    .await?;
                Ok(updated)
            }
            None => {
                let mut row = create_row;
                row.insert("id".to_string(), id.clone());
                self.create(conn, checkpoint, table_name, row).await
            }
        }
    }

    /// Delete one row; `Ok(false)` when it did not exist.
    pub async fn delete(
        &self,
        conn: &mut AnyConnection,
        checkpoint: &Checkpoint,
        table_name: &str,
        id: &Value,
    ) -> Result<bool, IndexingError> {
        let Some(current) = self.find_unique(conn, table_name, id).await? else {
            return Ok(false);
        };
        let table = self.table(table_name)?;
        let sql = format!(
            "DELETE FROM {} WHERE id = {}",
            table.name,
            self.dialect.placeholder(1)
        );
        bind_value(sqlx::query(&sql), id)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::from_sqlx)?;
        self.log_operation(conn, table, checkpoint, OP_DELETE, &current, Some(&current))
            .await?;
        Ok(true)
    }

    async fn log_operation(
        &self,
        conn: &mut AnyConnection,
        table: &Table,
        checkpoint: &Checkpoint,
        operation: i64,
        row: &UserRow,
        prior: Option<&UserRow>,
    ) -> Result<(), IndexingError> {
        let id = row.get("id").cloned().unwrap_or(Value::Null);
        let sql = format!(
            "INSERT INTO {} (checkpoint, operation, row_id, prior) VALUES {}",
            table.reorg_table(),
            self.dialect.values_tuple(1, 4)
        );
        let prior_json = prior
            .map(|p| serde_json::to_string(&row_to_json(p)))
            .transpose()
            .map_err(|e| IndexingError::NonRetryable(format!("op-log encode: {e}")))?;
        sqlx::query(&sql)
            .bind(checkpoint.encode())
            .bind(operation)
            .bind(value_to_json(&id).to_string())
            .bind(prior_json)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Undo every write newer than `to`: replay the op-log in reverse,
    /// inverting each operation, with op-logging suspended (the replay
    /// itself must leave no trace).
    pub async fn revert(&self, to: &Checkpoint) -> Result<u64, IndexingError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;
        let mut undone = 0u64;
        for table in self.tables.values() {
            let select = format!(
                "SELECT op_id, operation, row_id, prior FROM {} WHERE checkpoint > {} \
                 ORDER BY op_id DESC",
                table.reorg_table(),
                self.dialect.placeholder(1)
            );
            let ops = sqlx::query(&select)
                .bind(to.encode())
                .fetch_all(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;

            for op in &ops {
                let operation: i64 = op.try_get("operation").map_err(StoreError::from_sqlx)?;
                let row_id: String = op.try_get("row_id").map_err(StoreError::from_sqlx)?;
                let id = json_to_value(&serde_json::from_str(&row_id).map_err(|e| {
                    IndexingError::NonRetryable(format!("op-log id decode: {e}"))
                })?)?;
                let prior: Option<String> =
                    op.try_get("prior").map_err(StoreError::from_sqlx)?;

                match operation {
                    OP_INSERT => {
                        let sql = format!(
                            "DELETE FROM {} WHERE id = {}",
                            table.name,
                            self.dialect.placeholder(1)
                        );
                        bind_value(sqlx::query(&sql), &id)
                            .execute(&mut *tx)
                            .await
                            .map_err(StoreError::from_sqlx)?;
                    }
                    OP_UPDATE | OP_DELETE => {
                        let prior_text = prior.ok_or_else(|| {
                            IndexingError::NonRetryable(
                                "op-log update/delete without prior image".to_string(),
                            )
                        })?;
                        let prior_row = json_to_row(&prior_text)?;
                        // restore-prior and reinsert are both an upsert of
                        // the prior image
                        self.restore_row(&mut tx, table, &id, &prior_row).await?;
                    }
                    other => {
                        return Err(IndexingError::NonRetryable(format!(
                            "unknown op-log operation {other}"
                        )))
                    }
                }
                undone += 1;
            }

            let prune = format!(
                "DELETE FROM {} WHERE checkpoint > {}",
                table.reorg_table(),
                self.dialect.placeholder(1)
            );
            sqlx::query(&prune)
                .bind(to.encode())
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(undone)
    }

    async fn restore_row(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        table: &Table,
        id: &Value,
        prior: &UserRow,
    ) -> Result<(), IndexingError> {
        let names = table.column_names();
        let assignments: Vec<String> = names
            .iter()
            .filter(|n| **n != "id")
            .map(|n| format!("{n} = excluded.{n}"))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT (id) DO UPDATE SET {}",
            table.name,
            names.join(", "),
            self.dialect.values_tuple(1, names.len()),
            assignments.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for column in &table.columns {
            let value = if column.name == "id" {
                id.clone()
            } else {
                prior.get(&column.name).cloned().unwrap_or(Value::Null)
            };
            query = bind_owned_value(query, value);
        }
        query
            .execute(&mut **tx)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Writes at or before `c` can no longer be reverted; drop their op-log
    /// rows.
    pub async fn finalize(&self, c: &Checkpoint) -> Result<(), IndexingError> {
        for table in self.tables.values() {
            let sql = format!(
                "DELETE FROM {} WHERE checkpoint <= {}",
                table.reorg_table(),
                self.dialect.placeholder(1)
            );
            sqlx::query(&sql)
                .bind(c.encode())
                .execute(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        Ok(())
    }
}

type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>;

fn bind_value<'q>(query: AnyQuery<'q>, value: &Value) -> AnyQuery<'q> {
    bind_owned_value(query, value.clone())
}

fn bind_owned_value(query: AnyQuery<'_>, value: Value) -> AnyQuery<'_> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::BigInt(v) => query.bind(encode_u256(v)),
        Value::Text(s) => query.bind(s),
        Value::Bytes(b) => query.bind(b),
    }
}

fn decode_row(table: &Table, row: &sqlx::any::AnyRow) -> Result<UserRow, IndexingError> {
    let mut out = UserRow::new();
    for column in &table.columns {
        let name = column.name.as_str();
        let value = match column.ty {
            ColumnType::Bool => row
                .try_get::<Option<bool>, _>(name)
                .map_err(StoreError::from_sqlx)?
                .map_or(Value::Null, Value::Bool),
            ColumnType::Int => row
                .try_get::<Option<i64>, _>(name)
                .map_err(StoreError::from_sqlx)?
                .map_or(Value::Null, Value::Int),
            ColumnType::BigInt => match row
                .try_get::<Option<String>, _>(name)
                .map_err(StoreError::from_sqlx)?
            {
                Some(text) => Value::BigInt(decode_u256(&text)?),
                None => Value::Null,
            },
            ColumnType::Text => row
                .try_get::<Option<String>, _>(name)
                .map_err(StoreError::from_sqlx)?
                .map_or(Value::Null, Value::Text),
            ColumnType::Bytes => row
                .try_get::<Option<Vec<u8>>, _>(name)
                .map_err(StoreError::from_sqlx)?
                .map_or(Value::Null, Value::Bytes),
        };
        out.insert(column.name.clone(), value);
    }
    Ok(out)
}

fn sort_key(row: &UserRow, order: &[(String, Direction)]) -> Vec<Value> {
    order
        .iter()
        .map(|(column, _)| row.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Cursors are an opaque hex encoding of the JSON sort-key tuple.
pub fn encode_cursor(values: &[Value]) -> String {
    let json = serde_json::Value::Array(values.iter().map(value_to_json).collect());
    hex::encode(json.to_string())
}

pub fn decode_cursor(cursor: &str, expected: usize) -> Result<Vec<Value>, IndexingError> {
    let bytes = hex::decode(cursor)
        .map_err(|e| IndexingError::NonRetryable(format!("bad cursor: {e}")))?;
    let json: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| IndexingError::NonRetryable(format!("bad cursor json: {e}")))?;
    let serde_json::Value::Array(items) = json else {
        return Err(IndexingError::NonRetryable("cursor is not a tuple".to_string()));
    };
    if items.len() != expected {
        return Err(IndexingError::NonRetryable(format!(
            "cursor arity {} does not match sort columns {}",
            items.len(),
            expected
        )));
    }
    items.iter().map(json_to_value).collect()
}

fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::json;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!({ "b": b }),
        Value::Int(i) => json!({ "i": i }),
        Value::BigInt(v) => json!({ "u": encode_u256(*v) }),
        Value::Text(s) => json!({ "t": s }),
        Value::Bytes(bytes) => json!({ "x": hex::encode(bytes) }),
    }
}

fn json_to_value(json: &serde_json::Value) -> Result<Value, IndexingError> {
    let bad = || IndexingError::NonRetryable(format!("bad encoded value: {json}"));
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Object(map) => {
            if let Some(b) = map.get("b") {
                return b.as_bool().map(Value::Bool).ok_or_else(bad);
            }
            if let Some(i) = map.get("i") {
                return i.as_i64().map(Value::Int).ok_or_else(bad);
            }
            if let Some(u) = map.get("u") {
                let text = u.as_str().ok_or_else(bad)?;
                return Ok(Value::BigInt(decode_u256(text).map_err(|_| bad())?));
            }
            if let Some(t) = map.get("t") {
                return t.as_str().map(|s| Value::Text(s.to_string())).ok_or_else(bad);
            }
            if let Some(x) = map.get("x") {
                let text = x.as_str().ok_or_else(bad)?;
                return hex::decode(text).map(Value::Bytes).map_err(|_| bad());
            }
            Err(bad())
        }
        _ => Err(bad()),
    }
}

fn row_to_json(row: &UserRow) -> serde_json::Value {
    serde_json::Value::Object(
        row.iter()
            .map(|(name, value)| (name.clone(), value_to_json(value)))
            .collect(),
    )
}

fn json_to_row(text: &str) -> Result<UserRow, IndexingError> {
    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| IndexingError::NonRetryable(format!("op-log row decode: {e}")))?;
    let serde_json::Value::Object(map) = json else {
        return Err(IndexingError::NonRetryable("op-log row is not an object".to_string()));
    };
    map.iter()
        .map(|(name, value)| Ok((name.clone(), json_to_value(value)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_json_roundtrip() {
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::BigInt(U256::MAX),
            Value::Text("hello".to_string()),
            Value::Bytes(vec![0xde, 0xad]),
        ];
        for value in &values {
            let json = value_to_json(value);
            assert_eq!(&json_to_value(&json).unwrap(), value);
        }
    }

    #[test]
    fn test_cursor_roundtrip() {
        let key = vec![
            Value::Int(7),
            Value::Text("abc".to_string()),
            Value::BigInt(U256::from(10u64).pow(U256::from(30u64))),
        ];
        let cursor = encode_cursor(&key);
        assert_eq!(decode_cursor(&cursor, 3).unwrap(), key);
        assert!(decode_cursor(&cursor, 2).is_err());
        assert!(decode_cursor("zz-not-hex", 3).is_err());
    }

    #[test]
    fn test_row_json_roundtrip() {
        let mut row = UserRow::new();
        row.insert("id".to_string(), Value::Text("a".to_string()));
        row.insert("balance".to_string(), Value::BigInt(U256::from(12345u64)));
        row.insert("active".to_string(), Value::Bool(false));
        row.insert("note".to_string(), Value::Null);

        let json = serde_json::to_string(&row_to_json(&row)).unwrap();
        assert_eq!(json_to_row(&json).unwrap(), row);
    }

    #[test]
    fn test_table_requires_id_first() {
        let bad = Table::new(
            "accounts",
            vec![Column { name: "balance".to_string(), ty: ColumnType::BigInt, nullable: false }],
        );
        assert!(bad.is_err());

        let good = Table::new(
            "accounts",
            vec![
                Column { name: "id".to_string(), ty: ColumnType::Text, nullable: false },
                Column { name: "balance".to_string(), ty: ColumnType::BigInt, nullable: false },
            ],
        )
        .unwrap();
        assert_eq!(good.reorg_table(), "_reorg_accounts");
    }

    #[tokio::test]
    async fn test_keyset_clause_shape() {
        let store = IndexingStore::new_for_tests();
        let order = vec![
            ("balance".to_string(), Direction::Desc),
            ("id".to_string(), Direction::Asc),
        ];
        let cursor = vec![Value::Int(100), Value::Text("k".to_string())];
        let mut binds = Vec::new();
        let clause = store.keyset_clause(&order, &cursor, false, &mut binds);
        assert_eq!(clause, "((balance < $1) OR (balance = $2 AND id > $3))");
        assert_eq!(binds.len(), 3);

        // before-cursor flips every comparator
        let mut binds = Vec::new();
        let clause = store.keyset_clause(&order, &cursor, true, &mut binds);
        assert_eq!(clause, "((balance > $1) OR (balance = $2 AND id < $3))");
    }

    impl IndexingStore {
        fn new_for_tests() -> Self {
            sqlx::any::install_default_drivers();
            IndexingStore {
                pool: AnyPool::connect_lazy("sqlite::memory:").expect("lazy pool"),
                dialect: Dialect::Postgres,
                tables: HashMap::new(),
            }
        }
    }
}
