//! Token persistence.
//!
//! [`ApiClient`](crate::ApiClient) talks to storage only through the
//! [`TokenStore`] capability, chosen once at construction:
//!
//! - [`FileTokenStore`]: durable JSON key-value file, survives restarts.
//! - [`MemoryTokenStore`]: process-local; clones share one slot.
//! - [`NoopTokenStore`]: server and other non-interactive contexts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ClientConfig;
use crate::error::StoreError;
use crate::types::SessionToken;

pub trait TokenStore: Send + Sync + 'static {
    /// Read the persisted token, if any.
    fn load(&self) -> Result<Option<SessionToken>, StoreError>;

    /// Persist `token`, replacing any previous value.
    fn save(&self, token: &SessionToken) -> Result<(), StoreError>;

    /// Remove the persisted token. Succeeds when nothing is stored.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Durable store: a JSON object on disk, the token kept under one key.
///
/// Other keys in the file are left untouched.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
    key: String,
}

impl FileTokenStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    /// `<data dir>/washline/session.json`, if the platform has a data dir.
    #[cfg(feature = "file-store")]
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("washline").join("session.json"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<SessionToken>, StoreError> {
        let mut entries = self.read_entries()?;
        Ok(entries
            .remove(&self.key)
            .filter(|t| !t.is_empty())
            .map(SessionToken::from))
    }

    fn save(&self, token: &SessionToken) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        entries.insert(self.key.clone(), token.as_str().to_owned());
        self.write_entries(&entries)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        if entries.remove(&self.key).is_none() {
            return Ok(());
        }
        self.write_entries(&entries)
    }
}

/// In-process store. Clones share the same slot, which makes a "restart"
/// (a second client over the same store) easy to model.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    slot: Arc<Mutex<Option<SessionToken>>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(token: impl Into<SessionToken>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(token.into()))),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<SessionToken>, StoreError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, token: &SessionToken) -> Result<(), StoreError> {
        *self.slot.lock() = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// Store for contexts without durable storage. Nothing is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTokenStore;

impl TokenStore for NoopTokenStore {
    fn load(&self) -> Result<Option<SessionToken>, StoreError> {
        Ok(None)
    }

    fn save(&self, _token: &SessionToken) -> Result<(), StoreError> {
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Persistent store for `config`: the configured path, else the platform
/// default, else [`NoopTokenStore`].
pub(crate) fn default_store(config: &ClientConfig) -> Arc<dyn TokenStore> {
    if let Some(path) = config.token_path() {
        return Arc::new(FileTokenStore::new(path.clone(), config.token_key()));
    }

    #[cfg(feature = "file-store")]
    if let Some(path) = FileTokenStore::default_path() {
        return Arc::new(FileTokenStore::new(path, config.token_key()));
    }

    tracing::warn!("No durable token storage available, session will not persist");
    Arc::new(NoopTokenStore)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store(dir: &tempfile::TempDir) -> FileTokenStore {
        FileTokenStore::new(dir.path().join("nested").join("session.json"), "auth_token")
    }

    #[test]
    fn file_store_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        file_store(&dir).save(&SessionToken::new("abc")).unwrap();

        let reopened = file_store(&dir);
        assert_eq!(reopened.load().unwrap(), Some(SessionToken::new("abc")));

        reopened.clear().unwrap();
        assert!(file_store(&dir).load().unwrap().is_none());
    }

    #[test]
    fn file_store_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"theme":"dark"}"#).unwrap();

        let store = FileTokenStore::new(&path, "auth_token");
        store.save(&SessionToken::new("t1")).unwrap();
        store.clear().unwrap();

        let content: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(content.get("theme").map(String::as_str), Some("dark"));
        assert!(!content.contains_key("auth_token"));
    }

    #[test]
    fn file_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileTokenStore::new(&path, "auth_token");
        assert!(matches!(store.load(), Err(StoreError::Format(_))));
    }

    #[test]
    fn memory_store_clones_share_slot() {
        let a = MemoryTokenStore::new();
        let b = a.clone();
        a.save(&SessionToken::new("shared")).unwrap();
        assert_eq!(b.load().unwrap(), Some(SessionToken::new("shared")));
        b.clear().unwrap();
        assert!(a.load().unwrap().is_none());
    }

    #[test]
    fn noop_store_keeps_nothing() {
        let store = NoopTokenStore;
        store.save(&SessionToken::new("x")).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn default_store_uses_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let config = ClientConfig::default().with_token_path(&path);

        let store = default_store(&config);
        store.save(&SessionToken::new("via-config")).unwrap();
        assert!(path.exists());
    }
}
