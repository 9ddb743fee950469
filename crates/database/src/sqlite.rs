//! Single-connection SQLite access.
//!
//! One `SqliteConnection` sits behind an async mutex: every statement,
//! read or write, waits for the lock, so concurrent tool calls against the
//! dataset execute strictly one at a time.

use crate::{DatabaseError, params};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, Sqlite, TypeInfo, ValueRef};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Rows returned by a read-only query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rowcount: usize,
    /// More rows matched than were returned
    pub truncated: bool,
}

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    pub last_row_id: i64,
}

/// The dataset the SQL tools run against.
pub struct Database {
    conn: Mutex<SqliteConnection>,
    location: String,
}

impl Database {
    /// Open the database named by `url`.
    ///
    /// Accepts `sqlite://path`, `sqlite:///abs/path`, `sqlite:////abs/path`,
    /// `sqlite::memory:`, `file:path`, or a bare filesystem path. The file is
    /// created if missing.
    pub async fn connect(url: &str) -> Result<Self, DatabaseError> {
        let options = match parse_location(url)? {
            Location::Memory => SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DatabaseError::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?,
            Location::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        DatabaseError::Connect(format!("create {}: {e}", parent.display()))
                    })?;
                }
                SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
            }
        }
        .foreign_keys(true);

        let conn = options
            .connect()
            .await
            .map_err(|e| DatabaseError::Connect(format!("Failed to open SQLite: {e}")))?;

        info!("SQLite dataset opened at {url}");
        Ok(Self {
            conn: Mutex::new(conn),
            location: url.to_string(),
        })
    }

    /// An ephemeral in-process database (useful for tests).
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        Self::connect("sqlite::memory:").await
    }

    /// The URL this database was opened from.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Describe every user table: columns and row count.
    ///
    /// Shape: `{dialect, tables: [{name, columns: [{cid, name, type, notnull, default, pk}], row_count}]}`.
    /// A table whose count fails reports `row_count: null`.
    pub async fn schema(&self) -> Result<Value, DatabaseError> {
        let mut conn = self.conn.lock().await;

        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(query_error)?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let ident = quote_ident(&name);
            let info = sqlx::query(&format!("PRAGMA table_info({ident})"))
                .fetch_all(&mut *conn)
                .await
                .map_err(query_error)?;

            let mut columns = Vec::with_capacity(info.len());
            for row in &info {
                columns.push(json!({
                    "cid": column_value(row, 0)?,
                    "name": column_value(row, 1)?,
                    "type": column_value(row, 2)?,
                    "notnull": column_value(row, 3)?.as_i64().unwrap_or(0) != 0,
                    "default": column_value(row, 4)?,
                    "pk": column_value(row, 5)?.as_i64().unwrap_or(0) != 0,
                }));
            }

            let row_count: Option<i64> = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {ident}"))
                .fetch_one(&mut *conn)
                .await
                .ok();

            tables.push(json!({ "name": name, "columns": columns, "row_count": row_count }));
        }

        Ok(json!({ "dialect": "sqlite", "tables": tables }))
    }

    /// Run a read-only `SELECT`/`WITH` statement, returning at most `max_rows` rows.
    ///
    /// The connection is switched to `query_only` for the duration, so a CTE
    /// wrapping a write is refused by SQLite itself.
    pub async fn query(&self, sql: &str, params: &Value, max_rows: usize) -> Result<QueryResult, DatabaseError> {
        if !params::is_read_only(sql) {
            return Err(DatabaseError::ReadOnlyViolation);
        }
        let (sql, values) = params::normalize(sql, params)?;

        let mut conn = self.conn.lock().await;
        sqlx::query("PRAGMA query_only = ON")
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        let result = Self::fetch_limited(&mut conn, &sql, &values, max_rows).await;
        sqlx::query("PRAGMA query_only = OFF")
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        result
    }

    async fn fetch_limited(
        conn: &mut SqliteConnection,
        sql: &str,
        values: &[Value],
        max_rows: usize,
    ) -> Result<QueryResult, DatabaseError> {
        let mut rows: Vec<SqliteRow> = Vec::new();
        let mut truncated = false;
        {
            let mut stream = bind_all(sqlx::query(sql), values).fetch(&mut *conn);
            while let Some(row) = stream.try_next().await.map_err(query_error)? {
                if rows.len() == max_rows {
                    truncated = true;
                    break;
                }
                rows.push(row);
            }
        }

        let columns: Vec<String> = match rows.first() {
            Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
            None => conn
                .describe(sql)
                .await
                .map(|d| d.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default(),
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..row.columns().len() {
                values.push(column_value(row, i)?);
            }
            out.push(values);
        }

        debug!(rows = out.len(), truncated, "Query complete");
        Ok(QueryResult {
            columns,
            rowcount: out.len(),
            rows: out,
            truncated,
        })
    }

    /// Execute a mutating statement. Used by seeding, never exposed as a tool.
    pub async fn execute(&self, sql: &str, params: &Value) -> Result<ExecuteResult, DatabaseError> {
        let (sql, values) = params::normalize(sql, params)?;
        let mut conn = self.conn.lock().await;
        let done = bind_all(sqlx::query(&sql), &values)
            .execute(&mut *conn)
            .await
            .map_err(query_error)?;
        Ok(ExecuteResult {
            rows_affected: done.rows_affected(),
            last_row_id: done.last_insert_rowid(),
        })
    }

    /// Run a batch of mutating statements atomically.
    pub async fn execute_many(&self, statements: &[(&str, Value)]) -> Result<u64, DatabaseError> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await.map_err(query_error)?;
        let mut affected = 0;
        for (sql, params) in statements {
            let (sql, values) = params::normalize(sql, params)?;
            let done = bind_all(sqlx::query(&sql), &values)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
            affected += done.rows_affected();
        }
        tx.commit().await.map_err(query_error)?;
        Ok(affected)
    }

    /// Close the connection, checkpointing the WAL.
    pub async fn close(self) -> Result<(), DatabaseError> {
        self.conn.into_inner().close().await.map_err(query_error)
    }
}

enum Location {
    Memory,
    File(PathBuf),
}

fn parse_location(url: &str) -> Result<Location, DatabaseError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(DatabaseError::InvalidUrl {
            url: url.to_string(),
            reason: "empty database URL".into(),
        });
    }
    if url == ":memory:" || url == "sqlite::memory:" || url == "sqlite://:memory:" {
        return Ok(Location::Memory);
    }

    let path = if let Some(rest) = url.strip_prefix("sqlite://") {
        // `sqlite:////abs` is the four-slash absolute form
        match rest.strip_prefix("//") {
            Some(abs) => format!("/{abs}"),
            None => rest.to_string(),
        }
    } else if let Some(rest) = url.strip_prefix("sqlite:") {
        rest.to_string()
    } else if let Some(rest) = url.strip_prefix("file:") {
        rest.trim_start_matches("//").to_string()
    } else {
        url.to_string()
    };

    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() {
        return Err(DatabaseError::InvalidUrl {
            url: url.to_string(),
            reason: "no file path".into(),
        });
    }
    Ok(Location::File(Path::new(path).to_path_buf()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, values: &[Value]) -> SqliteQuery<'q> {
    for value in values {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

/// Convert the value at `index` by its runtime storage class.
fn column_value(row: &SqliteRow, index: usize) -> Result<Value, DatabaseError> {
    let raw = row.try_get_raw(index).map_err(query_error)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let kind = raw.type_info().name().to_ascii_uppercase();
    let value = match kind.as_str() {
        "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(index).map_err(query_error)?),
        "REAL" | "NUMERIC" => {
            let f = row.try_get_unchecked::<f64, _>(index).map_err(query_error)?;
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        "BLOB" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(index).map_err(query_error)?;
            Value::String(BASE64.encode(bytes))
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(index).map_err(query_error)?),
    };
    Ok(value)
}

fn query_error(e: sqlx::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}
