//! Durable session storage
//!
//! Sessions are saved after every transition and weight change. Terminal
//! sessions are archived: still loadable by id, no longer listed as active.

use crate::error::Result;
use crate::session::{CutoverSession, SessionId};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the active copy of `session`.
    async fn save(&self, session: &CutoverSession) -> Result<()>;

    /// Active or archived session by id.
    async fn load(&self, id: &SessionId) -> Result<Option<CutoverSession>>;

    /// Sessions not yet archived, oldest first.
    async fn list_active(&self) -> Result<Vec<CutoverSession>>;

    /// Move a session out of the active set. Unknown ids are ignored.
    async fn archive(&self, id: &SessionId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    active: DashMap<SessionId, CutoverSession>,
    archived: DashMap<SessionId, CutoverSession>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, session: &CutoverSession) -> Result<()> {
        self.active.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<CutoverSession>> {
        Ok(self
            .active
            .get(id)
            .or_else(|| self.archived.get(id))
            .map(|s| s.clone()))
    }

    async fn list_active(&self) -> Result<Vec<CutoverSession>> {
        let mut sessions: Vec<CutoverSession> = self.active.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn archive(&self, id: &SessionId) -> Result<()> {
        if let Some((id, session)) = self.active.remove(id) {
            self.archived.insert(id, session);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore: <root>/active/<id>.json, <root>/archive/<id>.json
// ---------------------------------------------------------------------------

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("active")).await?;
        tokio::fs::create_dir_all(root.join("archive")).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn active_path(&self, id: &SessionId) -> PathBuf {
        self.root.join("active").join(format!("{id}.json"))
    }

    fn archive_path(&self, id: &SessionId) -> PathBuf {
        self.root.join("archive").join(format!("{id}.json"))
    }

    async fn read(path: &Path) -> Result<Option<CutoverSession>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for FileStore {
    async fn save(&self, session: &CutoverSession) -> Result<()> {
        let path = self.active_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(session)?;
        // Atomic replace: readers see the old or the new document, never a partial one.
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(session = %session.id, state = %session.state, "saved session");
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<CutoverSession>> {
        match Self::read(&self.active_path(id)).await? {
            Some(session) => Ok(Some(session)),
            None => Self::read(&self.archive_path(id)).await,
        }
    }

    async fn list_active(&self) -> Result<Vec<CutoverSession>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("active")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(session) = Self::read(&path).await? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn archive(&self, id: &SessionId) -> Result<()> {
        match tokio::fs::rename(self.active_path(id), self.archive_path(id)).await {
            Ok(()) => {
                debug!(session = %id, "archived session");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
