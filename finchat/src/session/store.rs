//! Durable credential storage.
//!
//! One record — the session credentials — lives under the user config
//! directory. Absence means unauthenticated at startup. Operations are
//! synchronous so `logout()` can clear storage before returning.

use std::path::PathBuf;

use parking_lot::Mutex;

use super::SessionCredentials;

/// Errors that can occur in credential storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the credential file failed.
    #[error("credential storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored record could not be parsed.
    #[error("corrupt credential record: {0}")]
    Corrupt(String),

    /// No usable storage location could be determined.
    #[error("could not determine config directory (no HOME or XDG_CONFIG_HOME)")]
    NoStorageDir,
}

/// Trait for persisting session credentials.
///
/// Implementations:
/// - [`FileStore`] — JSON record under the user config directory
/// - [`MemoryStore`] — in-memory store for testing
pub trait CredentialStore: Send + Sync {
    /// Load the stored credentials, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record exists but cannot be read or
    /// parsed.
    fn load(&self) -> Result<Option<SessionCredentials>, StoreError>;

    /// Persist the credentials, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the record cannot be written.
    fn save(&self, credentials: &SessionCredentials) -> Result<(), StoreError>;

    /// Remove the stored record. A no-op when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if an existing record cannot be removed.
    fn clear(&self) -> Result<(), StoreError>;
}

/// File-backed credential store (one JSON record).
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Creates a store at an explicit path.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Creates a store at the default location,
    /// `<config dir>/finchat/credentials.json`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoStorageDir`] if no config directory exists.
    pub fn default_location() -> Result<Self, StoreError> {
        let dir = dirs::config_dir().ok_or(StoreError::NoStorageDir)?;
        Ok(Self::new(dir.join("finchat").join("credentials.json")))
    }

    /// The path this store reads and writes.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn load(&self) -> Result<Option<SessionCredentials>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let credentials =
            serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(credentials))
    }

    fn save(&self, credentials: &SessionCredentials) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(credentials)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// In-memory credential store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Option<SessionCredentials>>,
}

impl MemoryStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-loaded with credentials.
    #[must_use]
    pub fn with_credentials(credentials: SessionCredentials) -> Self {
        Self {
            inner: Mutex::new(Some(credentials)),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<Option<SessionCredentials>, StoreError> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, credentials: &SessionCredentials) -> Result<(), StoreError> {
        *self.inner.lock() = Some(credentials.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.inner.lock() = None;
        Ok(())
    }
}
