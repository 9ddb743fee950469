//! SQL capabilities: schema introspection and read-only queries.

use async_trait::async_trait;
use datasage_core::error::ToolError;
use datasage_core::tool::{ResultCap, Tool};
use datasage_database::{Database, DatabaseError};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_MAX_ROWS: u64 = 100;
const ROW_LIMIT: u64 = 1000;

fn to_tool_error(tool: &str, e: DatabaseError) -> ToolError {
    match e {
        DatabaseError::ReadOnlyViolation => ToolError::PermissionDenied {
            tool_name: tool.into(),
            reason: e.to_string(),
        },
        DatabaseError::InvalidParams(reason) => ToolError::InvalidArguments(reason),
        other => ToolError::ExecutionFailed {
            tool_name: tool.into(),
            reason: other.to_string(),
        },
    }
}

/// Tables, columns, types, primary keys and row counts.
pub struct SqlSchemaTool {
    db: Arc<Database>,
}

impl SqlSchemaTool {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for SqlSchemaTool {
    fn name(&self) -> &str {
        "sql_schema"
    }

    fn description(&self) -> &str {
        "Return database schema (tables, columns, types, primary keys, row counts)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short human title (<= 6 words)"
                }
            }
        })
    }

    async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
        self.db
            .schema()
            .await
            .map_err(|e| to_tool_error("sql_schema", e))
    }
}

/// Read-only `SELECT` / `WITH` execution.
pub struct SqlQueryTool {
    db: Arc<Database>,
}

impl SqlQueryTool {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for SqlQueryTool {
    fn name(&self) -> &str {
        "sql_query"
    }

    fn description(&self) -> &str {
        "Execute a read-only SQL SELECT/CTE and return rows (up to max_rows)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short human title (<= 6 words)"
                },
                "sql": { "type": "string" },
                "params": {
                    "description": "Positional list or named dict parameters"
                },
                "max_rows": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": ROW_LIMIT,
                    "default": DEFAULT_MAX_ROWS
                }
            },
            "required": ["sql"]
        })
    }

    fn result_cap(&self) -> Option<ResultCap> {
        Some(ResultCap {
            field: "rows",
            max_items: ROW_LIMIT as usize,
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let sql = arguments["sql"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'sql' argument".into()))?;
        let max_rows = arguments["max_rows"]
            .as_u64()
            .unwrap_or(DEFAULT_MAX_ROWS)
            .clamp(1, ROW_LIMIT) as usize;

        debug!(sql, max_rows, "Running sql_query");
        let result = self
            .db
            .query(sql, &arguments["params"], max_rows)
            .await
            .map_err(|e| to_tool_error("sql_query", e))?;

        serde_json::to_value(result).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "sql_query".into(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn demo_db() -> Arc<Database> {
        let db = Database::in_memory().await.unwrap();
        db.execute_many(&[
            ("CREATE TABLE orders (id INTEGER PRIMARY KEY, city TEXT, total REAL)", Value::Null),
            ("INSERT INTO orders (city, total) VALUES ('Denver', 10.5)", Value::Null),
            ("INSERT INTO orders (city, total) VALUES ('Austin', 99.0)", Value::Null),
            ("INSERT INTO orders (city, total) VALUES ('Denver', 4.5)", Value::Null),
        ])
        .await
        .unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn schema_lists_tables() {
        let tool = SqlSchemaTool::new(demo_db().await);
        let out = tool.execute(json!({})).await.unwrap();
        assert_eq!(out["tables"][0]["name"], "orders");
        assert_eq!(out["tables"][0]["row_count"], 3);
    }

    #[tokio::test]
    async fn query_with_params() {
        let tool = SqlQueryTool::new(demo_db().await);
        let out = tool
            .execute(json!({
                "sql": "SELECT city, SUM(total) AS revenue FROM orders WHERE city = :city GROUP BY city",
                "params": {"city": "Denver"}
            }))
            .await
            .unwrap();
        assert_eq!(out["columns"], json!(["city", "revenue"]));
        assert_eq!(out["rows"], json!([["Denver", 15.0]]));
        assert_eq!(out["rowcount"], 1);
        assert_eq!(out["truncated"], false);

        let out = tool
            .execute(json!({"sql": "SELECT id FROM orders WHERE total > ?", "params": 50}))
            .await
            .unwrap();
        assert_eq!(out["rows"], json!([[2]]));
    }

    #[tokio::test]
    async fn max_rows_is_clamped_and_reported() {
        let tool = SqlQueryTool::new(demo_db().await);
        let out = tool
            .execute(json!({"sql": "SELECT id FROM orders ORDER BY id", "max_rows": 0}))
            .await
            .unwrap();
        assert_eq!(out["rows"], json!([[1]]));
        assert_eq!(out["truncated"], true);
    }

    #[tokio::test]
    async fn writes_are_denied() {
        let tool = SqlQueryTool::new(demo_db().await);
        let err = tool
            .execute(json!({"sql": "DELETE FROM orders"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn bad_sql_is_execution_failure() {
        let tool = SqlQueryTool::new(demo_db().await);
        let err = tool
            .execute(json!({"sql": "SELECT nope FROM missing"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution_failed");

        let err = tool.execute(json!({"sql": "  "})).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_arguments");
    }
}
