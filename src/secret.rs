//! Secret storage keyed by `(connection id, secret kind)`.
//!
//! [`SecretStore`] derives a deterministic key from the service namespace, the
//! kind and the connection id, and delegates to a [`SecretBackend`].

use crate::error::{ApiError, ErrorCode, PilotResult};
use crate::profile::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    Password,
    SudoPassword,
    KeyPassphrase,
}

impl SecretKind {
    pub const ALL: [SecretKind; 3] = [
        SecretKind::Password,
        SecretKind::SudoPassword,
        SecretKind::KeyPassphrase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::Password => "password",
            SecretKind::SudoPassword => "sudo_password",
            SecretKind::KeyPassphrase => "key_passphrase",
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait SecretBackend: Send + Sync {
    fn set(&self, key: &str, secret: &str) -> PilotResult<()>;
    fn get(&self, key: &str) -> PilotResult<Option<String>>;
    fn delete(&self, key: &str) -> PilotResult<()>;
}

/// Process-local backend. Writes are visible to every thread as soon as `set` returns.
#[derive(Default)]
pub struct MemorySecretBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretBackend for MemorySecretBackend {
    fn set(&self, key: &str, secret: &str) -> PilotResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> PilotResult<Option<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn delete(&self, key: &str) -> PilotResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> ApiError {
    ApiError::new(ErrorCode::SecretBackend, "Secret table lock poisoned")
}

/// OS keychain backend. Platform stores are compiled in with the `os-keyring` feature.
pub struct KeyringSecretBackend {
    service: String,
}

impl KeyringSecretBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> PilotResult<keyring::Entry> {
        keyring::Entry::new(&self.service, key).map_err(|err| keyring_error("open", err).into())
    }
}

impl SecretBackend for KeyringSecretBackend {
    fn set(&self, key: &str, secret: &str) -> PilotResult<()> {
        self.entry(key)?
            .set_password(secret)
            .map_err(|err| keyring_error("store", err).into())
    }

    fn get(&self, key: &str) -> PilotResult<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(keyring_error("read", err).into()),
        }
    }

    fn delete(&self, key: &str) -> PilotResult<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(keyring_error("delete", err).into()),
        }
    }
}

fn keyring_error(action: &str, err: keyring::Error) -> ApiError {
    ApiError::new(
        ErrorCode::SecretBackend,
        format!("Failed to {action} keychain entry"),
    )
    .with_details(err.to_string())
}

#[derive(Clone)]
pub struct SecretStore {
    namespace: String,
    backend: Arc<dyn SecretBackend>,
}

impl SecretStore {
    pub fn new(namespace: impl Into<String>, backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
        }
    }

    pub fn in_memory(namespace: impl Into<String>) -> Self {
        Self::new(namespace, Arc::new(MemorySecretBackend::new()))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self, connection_id: &str, kind: SecretKind) -> String {
        format!("{}:{}:{}", self.namespace, kind.as_str(), connection_id)
    }

    pub fn put(&self, connection_id: &str, kind: SecretKind, secret: &SecretString) -> PilotResult<()> {
        tracing::debug!(connection_id, kind = %kind, "Storing secret");
        self.backend.set(&self.key(connection_id, kind), secret.expose())
    }

    pub fn get(&self, connection_id: &str, kind: SecretKind) -> PilotResult<Option<SecretString>> {
        Ok(self
            .backend
            .get(&self.key(connection_id, kind))?
            .map(SecretString::from))
    }

    pub fn delete(&self, connection_id: &str, kind: SecretKind) -> PilotResult<()> {
        tracing::debug!(connection_id, kind = %kind, "Deleting secret");
        self.backend.delete(&self.key(connection_id, kind))
    }

    /// Deletes every kind under `connection_id`; absent entries are ignored.
    pub fn purge(&self, connection_id: &str) -> PilotResult<()> {
        for kind in SecretKind::ALL {
            self.delete(connection_id, kind)?;
        }
        Ok(())
    }
}
