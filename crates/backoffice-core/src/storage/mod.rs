//! Durable client-side storage for session credentials.
//!
//! Every credential the session manager persists is a string value under a
//! fixed key (see [`keys`]). Three backends are provided:
//!
//! - `FileStore`: a JSON file in the cache directory (default)
//! - `KeyringStore`: the OS keychain via `keyring`
//! - `MemoryStore`: process-local, for tests and throwaway sessions

pub mod file;
pub mod keyring;
pub mod memory;

use thiserror::Error;

pub use self::file::FileStore;
pub use self::keyring::KeyringStore;
pub use self::memory::MemoryStore;

/// Storage keys shared by every backend.
pub mod keys {
    /// Backend-issued access token (custom JWT)
    pub const ACCESS_TOKEN: &str = "access-token";
    /// Backend-issued refresh token
    pub const REFRESH_TOKEN: &str = "refresh-token";
    /// JSON-serialized operator profile
    pub const PROFILE: &str = "profile";
    /// Identity-provider access token
    pub const KC_TOKEN: &str = "kc_token";
    /// Identity-provider refresh token
    pub const KC_REFRESH_TOKEN: &str = "kc_refreshToken";
    /// Identity-provider id token
    pub const KC_ID_TOKEN: &str = "kc_idToken";

    pub const CUSTOM_KEYS: [&str; 3] = [ACCESS_TOKEN, REFRESH_TOKEN, PROFILE];
    pub const IDENTITY_KEYS: [&str; 3] = [KC_TOKEN, KC_REFRESH_TOKEN, KC_ID_TOKEN];
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] ::keyring::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// String key/value storage that survives restarts.
///
/// Reads and writes are synchronous and local; there is a single writer.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Apply several writes and removals as one update.
    ///
    /// Backends that can persist in one step override this so a reader never
    /// observes a half-applied batch.
    fn apply(&self, changes: &[(&str, Option<&str>)]) -> Result<(), StorageError> {
        for (key, value) in changes {
            match value {
                Some(v) => self.set(key, v)?,
                None => self.remove(key)?,
            }
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[&str]) -> Result<(), StorageError> {
        let changes: Vec<(&str, Option<&str>)> = keys.iter().map(|k| (*k, None)).collect();
        self.apply(&changes)
    }
}
