//! Tool capabilities for the Datasage agent.
//!
//! File tools are confined to one workspace directory; SQL tools share the
//! process-wide [`Database`] connection.

pub mod list_files;
pub mod read_file;
pub mod search_files;
pub mod sql;
pub mod write_file;
pub mod workspace;

use datasage_core::tool::ToolRegistry;
use datasage_database::Database;
use std::sync::Arc;

pub use list_files::ListFilesTool;
pub use read_file::ReadFileTool;
pub use search_files::SearchFilesTool;
pub use sql::{SqlQueryTool, SqlSchemaTool};
pub use workspace::Workspace;
pub use write_file::WriteFileTool;

/// Registry with every built-in tool.
pub fn default_registry(workspace: Workspace, db: Arc<Database>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ListFilesTool::new(workspace.clone())));
    registry.register(Arc::new(ReadFileTool::new(workspace.clone())));
    registry.register(Arc::new(WriteFileTool::new(workspace.clone())));
    registry.register(Arc::new(SearchFilesTool::new(workspace)));
    registry.register(Arc::new(SqlSchemaTool::new(db.clone())));
    registry.register(Arc::new(SqlQueryTool::new(db)));
    registry
}
