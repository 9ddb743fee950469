//! Write a UTF-8 text file into the workspace.

use crate::workspace::Workspace;
use async_trait::async_trait;
use datasage_core::error::ToolError;
use datasage_core::tool::Tool;
use serde_json::{Value, json};
use tracing::debug;

pub struct WriteFileTool {
    workspace: Workspace,
}

impl WriteFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file to the project workspace, creating folders as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short human title (<= 6 words)"
                },
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        // Non-string content is written as its JSON text.
        let content = match &arguments["content"] {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };

        let resolved = self.workspace.resolve(path)?;
        let failed = |e: std::io::Error| ToolError::ExecutionFailed {
            tool_name: "write_file".into(),
            reason: format!("Failed to write file: {e}"),
        };
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(failed)?;
        }
        tokio::fs::write(&resolved, content.as_bytes())
            .await
            .map_err(failed)?;

        let shown = self.workspace.display_path(&resolved);
        debug!(path = %shown, bytes = content.len(), "Wrote workspace file");
        Ok(json!({ "path": shown, "bytes": content.len() }))
    }
}
