//! Read a UTF-8 text file from the workspace.

use crate::workspace::Workspace;
use async_trait::async_trait;
use datasage_core::error::ToolError;
use datasage_core::tool::Tool;
use serde_json::{Value, json};

pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the project workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short human title (<= 6 words)"
                },
                "path": {
                    "type": "string",
                    "description": "Relative path from workspace root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        let resolved = self.workspace.resolve(path)?;
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => Ok(json!({
                "path": self.workspace.display_path(&resolved),
                "content": content,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolError::ResourceNotFound(format!("File not found: {path}")))
            }
            Err(e) => Err(ToolError::ExecutionFailed {
                tool_name: "read_file".into(),
                reason: format!("Failed to read file: {e}"),
            }),
        }
    }
}
