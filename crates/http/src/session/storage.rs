//! Persisted token storage
//!
//! The access token, refresh token and cached role are three keys that are
//! always written and cleared together: a store only ever swaps in a whole
//! [`StoredTokens`] value.

use anagrafe_core::Role;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use super::lock;

/// Errors opening or writing a token file
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("token file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("token file encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot of the persisted keys
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "userRole", skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl StoredTokens {
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.role.is_none()
    }
}

impl fmt::Debug for StoredTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredTokens")
            .field("access_token", &self.access_token.as_ref().map(|_| "<set>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<set>"))
            .field("role", &self.role)
            .finish()
    }
}

/// Key/value storage backing the session
pub trait TokenStore: Send + Sync + 'static {
    /// Current persisted values
    fn snapshot(&self) -> StoredTokens;

    /// Replace all keys at once
    fn replace(&self, tokens: StoredTokens);

    /// Remove all keys
    fn clear(&self) {
        self.replace(StoredTokens::default());
    }
}

/// Process-local token storage
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<StoredTokens>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously persisted values
    pub fn with_tokens(tokens: StoredTokens) -> Self {
        Self {
            tokens: Mutex::new(tokens),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn snapshot(&self) -> StoredTokens {
        lock(&self.tokens).clone()
    }

    fn replace(&self, tokens: StoredTokens) {
        *lock(&self.tokens) = tokens;
    }
}

/// Token storage in a JSON file
///
/// The file is read once when opened and written through on every change. A
/// failed write is logged; the in-memory copy stays authoritative for the
/// running process.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    tokens: Mutex<StoredTokens>,
}

impl FileTokenStore {
    /// Open the token file at `path`, creating nothing until the first write
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let tokens = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring unreadable token file");
                StoredTokens::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoredTokens::default(),
            Err(err) => return Err(err.into()),
        };

        debug!(path = %path.display(), empty = tokens.is_empty(), "opened token file");
        Ok(Self {
            path,
            tokens: Mutex::new(tokens),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, tokens: &StoredTokens) -> Result<(), StorageError> {
        if tokens.is_empty() {
            return match std::fs::remove_file(&self.path) {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            };
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_vec_pretty(tokens)?;
        let tmp_path = self.path.with_extension("tmp");
        let mut file = open_private(&tmp_path)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn snapshot(&self) -> StoredTokens {
        lock(&self.tokens).clone()
    }

    fn replace(&self, tokens: StoredTokens) {
        let mut current = lock(&self.tokens);
        if let Err(err) = self.persist(&tokens) {
            warn!(path = %self.path.display(), error = %err, "failed to persist tokens");
        }
        *current = tokens;
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> StoredTokens {
        StoredTokens {
            access_token: Some("access".to_string()),
            refresh_token: Some("refresh".to_string()),
            role: Some(Role::Admin),
        }
    }

    #[test]
    fn memory_store_replaces_and_clears_together() {
        let store = MemoryTokenStore::new();
        assert!(store.snapshot().is_empty());

        store.replace(tokens());
        assert_eq!(store.snapshot(), tokens());

        store.clear();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("session.json");

        let store = FileTokenStore::open(&path).unwrap();
        store.replace(tokens());
        drop(store);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["accessToken"], "access");
        assert_eq!(raw["refreshToken"], "refresh");
        assert_eq!(raw["userRole"], "ADMIN");

        let reopened = FileTokenStore::open(&path).unwrap();
        assert_eq!(reopened.snapshot(), tokens());
    }

    #[test]
    fn file_store_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileTokenStore::open(&path).unwrap();
        store.replace(tokens());
        assert!(path.exists());

        store.clear();
        assert!(!path.exists());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = FileTokenStore::open(&path).unwrap();
        assert!(store.snapshot().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        FileTokenStore::open(&path).unwrap().replace(tokens());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
