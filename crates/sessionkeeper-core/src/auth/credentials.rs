use std::collections::HashMap;
use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;

/// Fixed key holding the persisted access/refresh token record
pub const TOKENS_KEY: &str = "session.tokens";

/// Fixed key holding the persisted reauthentication flag
pub const REAUTH_KEY: &str = "session.reauth_needed";

/// When a stored secret may be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Readable once the device has been unlocked after boot, including in
    /// background work afterwards.
    #[default]
    AfterFirstUnlock,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Stored credentials are corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Credential store error: {0}")]
    Backend(String),
}

/// Durable key/value storage for session secrets.
///
/// Only the session manager writes through this trait; everything else reads
/// session state from the manager.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str, durability: Durability) -> Result<(), StoreError>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Credential store backed by the OS keychain.
///
/// The keychain applies its platform default accessibility, so the requested
/// [`Durability`] is only logged.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str, durability: Durability) -> Result<(), StoreError> {
        tracing::trace!(key, ?durability, "Writing keychain entry");
        self.entry(key)?.set_password(value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local credential store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Durability)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durability class the key was last written with
    pub fn durability(&self, key: &str) -> Option<Durability> {
        self.lock().ok()?.get(key).map(|(_, d)| *d)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Durability)>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: &str, durability: Durability) -> Result<(), StoreError> {
        self.lock()?
            .insert(key.to_string(), (value.to_string(), durability));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
