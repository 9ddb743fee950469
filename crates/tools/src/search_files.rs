//! Case-insensitive substring search over workspace text files.

use crate::workspace::Workspace;
use async_trait::async_trait;
use datasage_core::error::ToolError;
use datasage_core::tool::{ResultCap, Tool};
use serde_json::{Value, json};

const DEFAULT_MAX_HITS: u64 = 20;
const HIT_LIMIT: u64 = 100;
const SNIPPET_CHARS: usize = 400;

pub struct SearchFilesTool {
    workspace: Workspace,
}

impl SearchFilesTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search for a case-insensitive substring within files in the workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short human title (<= 6 words)"
                },
                "query": { "type": "string" },
                "max_hits": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": HIT_LIMIT,
                    "default": DEFAULT_MAX_HITS
                }
            },
            "required": ["query"]
        })
    }

    fn result_cap(&self) -> Option<ResultCap> {
        Some(ResultCap {
            field: "hits",
            max_items: HIT_LIMIT as usize,
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let query = match &arguments["query"] {
            Value::String(s) => s.clone(),
            Value::Null => {
                return Err(ToolError::InvalidArguments("Missing 'query' argument".into()));
            }
            other => other.to_string(),
        };
        let max_hits = arguments["max_hits"]
            .as_u64()
            .unwrap_or(DEFAULT_MAX_HITS)
            .clamp(1, HIT_LIMIT) as usize;

        let workspace = self.workspace.clone();
        let needle = query.to_lowercase();
        let hits = tokio::task::spawn_blocking(move || {
            let mut hits = Vec::new();
            for path in workspace.walk_files() {
                // Non-UTF-8 and unreadable files are skipped.
                let Ok(bytes) = std::fs::read(&path) else { continue };
                let Ok(text) = String::from_utf8(bytes) else { continue };
                if text.to_lowercase().contains(&needle) {
                    let snippet: String = text.chars().take(SNIPPET_CHARS).collect();
                    hits.push(json!({
                        "path": workspace.display_path(&path),
                        "snippet": snippet,
                    }));
                    if hits.len() >= max_hits {
                        break;
                    }
                }
            }
            hits
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: "search_files".into(),
            reason: e.to_string(),
        })?;

        Ok(json!({ "query": query, "hits": hits }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, SearchFilesTool) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        let tool = SearchFilesTool::new(Workspace::new(dir.path()).unwrap());
        (dir, tool)
    }

    #[tokio::test]
    async fn finds_case_insensitive_matches() {
        let (_dir, tool) = workspace_with(&[
            ("a.md", b"Revenue grew in Q2"),
            ("b/c.txt", b"nothing here"),
            ("d.sql", b"SELECT revenue FROM orders"),
        ]);
        let out = tool.execute(json!({"query": "REVENUE"})).await.unwrap();
        assert_eq!(out["query"], "REVENUE");
        let paths: Vec<&str> = out["hits"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["a.md", "d.sql"]);
    }

    #[tokio::test]
    async fn skips_binary_files_and_truncates_snippet() {
        let long = "x".repeat(1000) + "needle";
        let (_dir, tool) = workspace_with(&[
            ("bin.dat", &[0xff, 0xfe, b'n', b'e', b'e', b'd', b'l', b'e']),
            ("long.txt", long.as_bytes()),
        ]);
        let out = tool.execute(json!({"query": "needle"})).await.unwrap();
        let hits = out["hits"].as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["path"], "long.txt");
        assert_eq!(hits[0]["snippet"].as_str().unwrap().chars().count(), 400);
    }

    #[tokio::test]
    async fn max_hits_is_clamped() {
        let files: Vec<(String, Vec<u8>)> = (0..5)
            .map(|i| (format!("f{i}.txt"), b"match".to_vec()))
            .collect();
        let refs: Vec<(&str, &[u8])> = files.iter().map(|(n, b)| (n.as_str(), b.as_slice())).collect();
        let (_dir, tool) = workspace_with(&refs);

        let out = tool.execute(json!({"query": "match", "max_hits": 2})).await.unwrap();
        assert_eq!(out["hits"].as_array().unwrap().len(), 2);

        let out = tool.execute(json!({"query": "match", "max_hits": 0})).await.unwrap();
        assert_eq!(out["hits"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_query_rejected() {
        let (_dir, tool) = workspace_with(&[]);
        let err = tool.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
