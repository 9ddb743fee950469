//! List every file in the workspace.

use crate::workspace::Workspace;
use async_trait::async_trait;
use datasage_core::error::ToolError;
use datasage_core::tool::{ResultCap, Tool};
use serde_json::{Value, json};

/// Most paths returned by one listing.
pub const MAX_FILES: usize = 2000;

pub struct ListFilesTool {
    workspace: Workspace,
}

impl ListFilesTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List all files under the project workspace root."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short human title for this step (<= 6 words)",
                    "default": "List files"
                }
            }
        })
    }

    fn result_cap(&self) -> Option<ResultCap> {
        Some(ResultCap {
            field: "files",
            max_items: MAX_FILES,
        })
    }

    async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
        let workspace = self.workspace.clone();
        let (files, truncated) = tokio::task::spawn_blocking(move || {
            let mut files: Vec<String> = workspace
                .walk_files()
                .take(MAX_FILES + 1)
                .map(|p| workspace.display_path(&p))
                .collect();
            let truncated = files.len() > MAX_FILES;
            files.truncate(MAX_FILES);
            (files, truncated)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: "list_files".into(),
            reason: e.to_string(),
        })?;

        let mut out = json!({ "files": files });
        if truncated {
            out["truncated"] = json!(true);
        }
        Ok(out)
    }
}
