//! Workspace sandbox: every file tool resolves paths through here.

use datasage_core::error::ToolError;
use ignore::WalkBuilder;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// The directory file tools are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Use `root` as the workspace, creating it if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ToolError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| ToolError::ExecutionFailed {
            tool_name: "workspace".into(),
            reason: format!("cannot create workspace {}: {e}", root.display()),
        })?;
        let root = root.canonicalize().map_err(|e| ToolError::ExecutionFailed {
            tool_name: "workspace".into(),
            reason: format!("cannot resolve workspace {}: {e}", root.display()),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path.
    ///
    /// `..` components are folded lexically and the nearest existing
    /// ancestor is canonicalized, so neither traversal nor symlinks can
    /// leave the root. The target itself need not exist.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ToolError> {
        let escape = || ToolError::PathEscapesWorkspace(relative.to_string());

        let mut joined = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => joined.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if joined == self.root || !joined.pop() {
                        return Err(escape());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }
        if !joined.starts_with(&self.root) {
            return Err(escape());
        }

        let mut existing = joined.as_path();
        let mut tail = Vec::new();
        while !existing.exists() {
            match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Err(escape()),
            }
        }
        let mut resolved = existing.canonicalize().map_err(|_| escape())?;
        if !resolved.starts_with(&self.root) {
            return Err(escape());
        }
        resolved.extend(tail.iter().rev());
        Ok(resolved)
    }

    /// Every file under the root, in file-name order. Nothing is ignored.
    pub fn walk_files(&self) -> impl Iterator<Item = PathBuf> + use<> {
        WalkBuilder::new(&self.root)
            .standard_filters(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable workspace entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
            .map(|entry| entry.into_path())
    }

    /// Path relative to the root with `/` separators.
    pub fn display_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}
