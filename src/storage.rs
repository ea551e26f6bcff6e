//! Persisted client state behind an injectable key-value port
//!
//! Single-writer, single-process semantics: nothing here locks the backing
//! store against concurrent processes. Two clients pointed at the same
//! directory can race; that is out of scope, matching the original behavior.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{Conversation, Session, Theme};

/// Logical storage keys
mod keys {
    pub const API_KEY: &str = "lumi_openrouter_api_key";
    pub const CURRENT_CHAT: &str = "lumi_current_chat";
    pub const CHAT_HISTORY: &str = "lumi_chat_history";
    pub const THEME: &str = "lumi_theme";
    pub const SELECTED_MODEL: &str = "lumi_selected_model";
    pub const CONVERSATIONS: &str = "lumi_conversations";
}

/// Key-value storage port
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}

/// In-memory backend for tests and ephemeral use
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// File-per-key backend rooted at a directory
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Storage(format!("create {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("read {}: {}", path.display(), e))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        std::fs::write(&path, value)
            .map_err(|e| Error::Storage(format!("write {}: {}", path.display(), e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("delete {}: {}", path.display(), e))),
        }
    }
}

/// Typed accessors over the raw port
pub struct ChatStore<S: StorageBackend> {
    backend: S,
}

impl<S: StorageBackend> ChatStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // A corrupt entry is dropped rather than wedging startup
                    tracing::warn!("discarding unreadable entry {}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).map_err(|e| Error::Storage(e.to_string()))?;
        self.backend.set(key, &raw).await
    }

    // API credential

    pub async fn api_key(&self) -> Result<Option<String>> {
        self.backend.get(keys::API_KEY).await
    }

    pub async fn set_api_key(&self, key: &str) -> Result<()> {
        self.backend.set(keys::API_KEY, key).await
    }

    pub async fn clear_api_key(&self) -> Result<()> {
        self.backend.delete(keys::API_KEY).await
    }

    // Current session

    pub async fn current_session(&self) -> Result<Option<Session>> {
        self.get_json(keys::CURRENT_CHAT).await
    }

    pub async fn set_current_session(&self, session: &Session) -> Result<()> {
        self.set_json(keys::CURRENT_CHAT, session).await
    }

    pub async fn clear_current_session(&self) -> Result<()> {
        self.backend.delete(keys::CURRENT_CHAT).await
    }

    // Session history

    pub async fn history(&self) -> Result<Vec<Session>> {
        Ok(self.get_json(keys::CHAT_HISTORY).await?.unwrap_or_default())
    }

    pub async fn session_by_id(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.history().await?.into_iter().find(|s| s.id == id))
    }

    /// Insert or replace a session in the history list
    pub async fn upsert_session(&self, session: &Session) -> Result<()> {
        let mut history = self.history().await?;
        match history.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session.clone(),
            None => history.push(session.clone()),
        }
        self.set_json(keys::CHAT_HISTORY, &history).await
    }

    /// Remove a session everywhere: history, conversation list, and the
    /// current pointer when it points at the removed session
    pub async fn remove_session(&self, id: &str) -> Result<()> {
        let mut history = self.history().await?;
        history.retain(|s| s.id != id);
        self.set_json(keys::CHAT_HISTORY, &history).await?;

        let mut conversations = self.conversations().await?;
        conversations.retain(|c| c.id != id);
        self.set_json(keys::CONVERSATIONS, &conversations).await?;

        if let Some(current) = self.current_session().await? {
            if current.id == id {
                self.clear_current_session().await?;
            }
        }
        Ok(())
    }

    // Conversation metadata list

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.get_json(keys::CONVERSATIONS).await?.unwrap_or_default())
    }

    /// Upsert by id, newest first, preserving the pinned flag
    pub async fn upsert_conversation(&self, conversation: Conversation) -> Result<()> {
        let mut conversations = self.conversations().await?;
        let pinned = conversations
            .iter()
            .find(|c| c.id == conversation.id)
            .map(|c| c.pinned)
            .unwrap_or(conversation.pinned);
        conversations.retain(|c| c.id != conversation.id);
        conversations.insert(
            0,
            Conversation {
                pinned,
                ..conversation
            },
        );
        conversations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.set_json(keys::CONVERSATIONS, &conversations).await
    }

    pub async fn set_pinned(&self, id: &str, pinned: bool) -> Result<()> {
        let mut conversations = self.conversations().await?;
        if let Some(conversation) = conversations.iter_mut().find(|c| c.id == id) {
            conversation.pinned = pinned;
        }
        self.set_json(keys::CONVERSATIONS, &conversations).await
    }

    // Preferences

    pub async fn theme(&self) -> Result<Theme> {
        let raw = self.backend.get(keys::THEME).await?;
        Ok(raw.as_deref().and_then(Theme::from_str).unwrap_or_default())
    }

    pub async fn set_theme(&self, theme: Theme) -> Result<()> {
        self.backend.set(keys::THEME, theme.as_str()).await
    }

    pub async fn selected_model(&self) -> Result<Option<String>> {
        self.backend.get(keys::SELECTED_MODEL).await
    }

    pub async fn set_selected_model(&self, model_id: &str) -> Result<()> {
        self.backend.set(keys::SELECTED_MODEL, model_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();

        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_session_history_upsert_and_remove() {
        let store = ChatStore::new(MemoryStore::new());

        let mut session = Session::new("test-model");
        session.messages.push(Message::user("hi", "test-model"));
        store.upsert_session(&session).await.unwrap();
        store.set_current_session(&session).await.unwrap();
        store
            .upsert_conversation(Conversation::from(&session))
            .await
            .unwrap();

        session.title = "retitled".to_string();
        store.upsert_session(&session).await.unwrap();

        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].title, "retitled");

        store.remove_session(&session.id).await.unwrap();
        assert!(store.history().await.unwrap().is_empty());
        assert!(store.conversations().await.unwrap().is_empty());
        assert!(store.current_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conversation_upsert_preserves_pinned() {
        let store = ChatStore::new(MemoryStore::new());

        let session = Session::new("test-model");
        store
            .upsert_conversation(Conversation::from(&session))
            .await
            .unwrap();
        store.set_pinned(&session.id, true).await.unwrap();

        // A later upsert (title refresh) must not unpin
        let mut updated = Conversation::from(&session);
        updated.title = "new title".to_string();
        store.upsert_conversation(updated).await.unwrap();

        let conversations = store.conversations().await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert!(conversations[0].pinned);
        assert_eq!(conversations[0].title, "new title");
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_discarded() {
        let backend = MemoryStore::new();
        backend.set("lumi_current_chat", "{not json").await.unwrap();

        let store = ChatStore::new(backend);
        assert!(store.current_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_theme_defaults_to_system() {
        let store = ChatStore::new(MemoryStore::new());
        assert_eq!(store.theme().await.unwrap(), Theme::System);

        store.set_theme(Theme::Dark).await.unwrap();
        assert_eq!(store.theme().await.unwrap(), Theme::Dark);
    }
}
