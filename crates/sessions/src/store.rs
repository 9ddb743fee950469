//! File-backed session store.
//!
//! The whole map of sessions lives in memory and is written to a single JSON
//! document on every mutation. Writes go to `<file>.tmp`, are synced, then
//! renamed over the live file, so the file on disk is always a complete
//! snapshot. A mutation is only committed in memory once its snapshot is on
//! disk; a failed write leaves both the file and the in-memory state as they
//! were.

use chrono::{DateTime, Utc};
use datasage_core::error::SessionError;
use datasage_core::message::{Message, Session, SessionMeta};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type SessionMap = BTreeMap<String, Session>;

/// Random 16-hex-character session id.
pub fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Durable map from session id to [`Session`].
///
/// The internal lock serializes every mutation together with its snapshot
/// write. It is never held across provider or tool calls.
pub struct SessionStore {
    path: PathBuf,
    sessions: Mutex<SessionMap>,
}

impl SessionStore {
    /// Open the store at `path`.
    ///
    /// A missing file starts an empty store (the file is created on the first
    /// write). A file that is not a valid snapshot is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let sessions = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => SessionMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| SessionError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionMap::new(),
            Err(e) => return Err(io_error(&path, e)),
        };
        debug!(path = %path.display(), count = sessions.len(), "Session store loaded");
        Ok(Self {
            path,
            sessions: Mutex::new(sessions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a session unless one with this id already exists.
    ///
    /// Returns the stored session either way.
    pub async fn create(
        &self,
        id: &str,
        title: &str,
        created_at: DateTime<Utc>,
        model: Option<String>,
    ) -> Result<Session, SessionError> {
        if let Some(existing) = self.get(id).await {
            return Ok(existing);
        }
        self.mutate(|sessions| {
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Session::new(title, created_at, model))
                .clone()
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Messages of a session in append order; empty for unknown ids.
    pub async fn get_messages(&self, id: &str) -> Vec<Message> {
        self.sessions
            .lock()
            .await
            .get(id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Append one message, creating an untitled session on first reference.
    pub async fn append(
        &self,
        id: &str,
        message: Message,
        updated_at: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        self.mutate(|sessions| {
            let session = sessions
                .entry(id.to_string())
                .or_insert_with(|| Session::new("", updated_at, None));
            session.messages.push(message);
            session.touch(updated_at);
        })
        .await
    }

    /// Set the title. Returns `false` if the session does not exist.
    pub async fn rename(
        &self,
        id: &str,
        title: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, SessionError> {
        self.update(id, updated_at, |s| s.title = title.to_string()).await
    }

    /// Select the model for future turns. Returns `false` if the session does not exist.
    pub async fn update_model(
        &self,
        id: &str,
        model: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, SessionError> {
        self.update(id, updated_at, |s| s.model = model).await
    }

    /// Remove a session. Returns `false` if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool, SessionError> {
        if self.get(id).await.is_none() {
            return Ok(false);
        }
        self.mutate(|sessions| sessions.remove(id).is_some()).await
    }

    /// Session metadata, most recently updated first.
    pub async fn list(&self) -> Vec<SessionMeta> {
        let sessions = self.sessions.lock().await;
        let mut metas: Vec<SessionMeta> = sessions
            .iter()
            .map(|(id, s)| SessionMeta::from_session(id, s))
            .collect();
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        metas
    }

    async fn update(
        &self,
        id: &str,
        updated_at: DateTime<Utc>,
        apply: impl FnOnce(&mut Session),
    ) -> Result<bool, SessionError> {
        if self.get(id).await.is_none() {
            return Ok(false);
        }
        self.mutate(|sessions| match sessions.get_mut(id) {
            Some(session) => {
                apply(session);
                session.touch(updated_at);
                true
            }
            None => false,
        })
        .await
    }

    /// Apply `f` to a copy of the map, persist the copy, then commit it.
    async fn mutate<T>(&self, f: impl FnOnce(&mut SessionMap) -> T) -> Result<T, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let mut next = sessions.clone();
        let out = f(&mut next);
        if let Err(e) = self.write_snapshot(&next).await {
            warn!(path = %self.path.display(), error = %e, "Session snapshot write failed");
            return Err(e);
        }
        *sessions = next;
        Ok(out)
    }

    async fn write_snapshot(&self, sessions: &SessionMap) -> Result<(), SessionError> {
        let bytes =
            serde_json::to_vec(sessions).map_err(|e| SessionError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        file.write_all(&bytes).await.map_err(|e| io_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "sessions.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_error(path: &Path, e: std::io::Error) -> SessionError {
    SessionError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}
