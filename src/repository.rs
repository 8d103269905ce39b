//! Profile collection with encrypt-on-write / decrypt-on-read around [`SecretStore`].

use crate::command::CommandBuilder;
use crate::config::{SecretBackendKind, StorageConfig};
use crate::error::{ApiError, ErrorCode, PilotResult};
use crate::profile::{PlainProfile, SecretMarker, SecretString, StoredProfile};
use crate::secret::{KeyringSecretBackend, SecretBackend, SecretKind, SecretStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;

const PROFILE_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ProfileDocument {
    version: u32,
    #[serde(default)]
    connections: Vec<StoredProfile>,
}

/// JSON file holding at-rest profiles. Rewritten whole, through a temp file
/// renamed over the target.
#[derive(Debug, Clone)]
pub struct ProfileFile {
    path: PathBuf,
}

impl ProfileFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> PilotResult<Vec<StoredProfile>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(ApiError::new(ErrorCode::StorageFailed, "Failed to read profiles")
                    .with_details(err.to_string())
                    .into());
            }
        };
        let document: ProfileDocument = serde_json::from_str(&content).map_err(|err| {
            ApiError::new(ErrorCode::StorageFailed, "Failed to parse profiles")
                .with_details(err.to_string())
        })?;
        if document.version > PROFILE_FILE_VERSION {
            return Err(ApiError::new(
                ErrorCode::StorageFailed,
                format!(
                    "Profile file version {} is newer than supported {}",
                    document.version, PROFILE_FILE_VERSION
                ),
            )
            .into());
        }
        Ok(document.connections)
    }

    pub fn save(&self, connections: &[StoredProfile]) -> PilotResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|err| storage_error("create profile directory", err))?;
        let document = ProfileDocument {
            version: PROFILE_FILE_VERSION,
            connections: connections.to_vec(),
        };
        let payload = serde_json::to_vec_pretty(&document)?;
        let mut temp =
            NamedTempFile::new_in(&dir).map_err(|err| storage_error("create temp file", err))?;
        temp.write_all(&payload)
            .map_err(|err| storage_error("write profiles", err))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| storage_error("flush profiles", err))?;
        temp.persist(&self.path)
            .map_err(|err| storage_error("replace profile file", err.error))?;
        Ok(())
    }
}

/// Secret backend for a file-backed repository. Backends that forget their
/// contents when the process exits are refused: the file would keep markers
/// pointing at nothing.
fn persistent_backend(storage: &StorageConfig) -> PilotResult<Arc<dyn SecretBackend>> {
    match storage.secret_backend {
        SecretBackendKind::Keyring if cfg!(feature = "os-keyring") => Ok(Arc::new(
            KeyringSecretBackend::new(storage.service_namespace.clone()),
        )),
        SecretBackendKind::Keyring => Err(ApiError::new(
            ErrorCode::Unsupported,
            "Built without the os-keyring feature; no persistent secret backend available",
        )
        .into()),
        SecretBackendKind::Memory => Err(ApiError::new(
            ErrorCode::Unsupported,
            "The in-memory secret backend cannot back a profile file",
        )
        .with_details(storage.profiles_path.clone())
        .into()),
    }
}

fn storage_error(action: &str, err: std::io::Error) -> ApiError {
    ApiError::new(ErrorCode::StorageFailed, format!("Failed to {action}"))
        .with_details(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SudoSecretSource {
    SudoPassword,
    LoginPassword,
}

#[derive(Debug, Clone)]
pub struct SudoSecret {
    pub source: SudoSecretSource,
    pub secret: SecretString,
}

pub struct ConnectionRepository {
    connections: Mutex<Vec<StoredProfile>>,
    secrets: SecretStore,
    file: Option<ProfileFile>,
}

impl ConnectionRepository {
    pub fn in_memory(secrets: SecretStore) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            secrets,
            file: None,
        }
    }

    /// Loads `file`, moving any cleartext left in it by older writers into the
    /// secret store before anything else sees it.
    pub fn open(secrets: SecretStore, file: ProfileFile) -> PilotResult<Self> {
        let loaded = file.load()?;
        let mut migrated = false;
        let mut connections = Vec::with_capacity(loaded.len());
        for profile in loaded {
            let profile = profile.try_map_secrets(|id, kind, marker| -> PilotResult<_> {
                if marker.is_marker() || marker.is_blank() {
                    return Ok(Some(marker));
                }
                migrated = true;
                tracing::warn!(connection_id = id, kind = %kind, "Migrating cleartext secret into secret store");
                secrets.put(id, kind, &SecretString::from(marker.into_inner()))?;
                Ok(Some(SecretMarker::for_kind(kind)))
            })?;
            connections.push(profile);
        }
        tracing::info!(
            path = %file.path().display(),
            connections = connections.len(),
            "Loaded connection profiles"
        );
        if migrated {
            file.save(&connections)?;
        }
        Ok(Self {
            connections: Mutex::new(connections),
            secrets,
            file: Some(file),
        })
    }

    /// Opens the configured profile file with the configured secret backend.
    pub fn open_configured(storage: &StorageConfig) -> PilotResult<Self> {
        let backend = persistent_backend(storage)?;
        let secrets = SecretStore::new(storage.service_namespace.clone(), backend);
        Self::open(secrets, ProfileFile::new(&storage.profiles_path))
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    pub fn list(&self) -> Vec<StoredProfile> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, id: &str) -> Option<StoredProfile> {
        self.lock().iter().find(|profile| profile.id == id).cloned()
    }

    /// Stores a new profile. Memory, secret store and file all change or none
    /// of them does.
    pub fn add(&self, profile: PlainProfile) -> PilotResult<StoredProfile> {
        let mut connections = self.lock();
        if connections.iter().any(|existing| existing.id == profile.id) {
            return Err(ApiError::new(ErrorCode::DuplicateId, "Connection id already exists")
                .with_details(profile.id)
                .into());
        }
        let id = profile.id.clone();
        let committed = self.seal(profile).and_then(|stored| {
            let mut next = connections.clone();
            next.push(stored.clone());
            self.persist(&next)?;
            Ok((stored, next))
        });
        let (stored, next) = match committed {
            Ok(committed) => committed,
            Err(err) => {
                tracing::warn!(connection_id = %id, error = %err, "Add failed; discarding its secrets");
                if let Err(purge_err) = self.secrets.purge(&id) {
                    tracing::warn!(connection_id = %id, error = %purge_err, "Failed to discard secrets");
                }
                return Err(err);
            }
        };
        *connections = next;
        tracing::info!(connection_id = %stored.id, alias = %stored.alias, "Added connection");
        Ok(stored)
    }

    /// Replaces the profile with the same id. An unknown id is a deliberate
    /// no-op reported as `Ok(false)`; nothing is stored for it. On failure the
    /// previous secrets are put back and the stored profile is unchanged.
    pub fn update(&self, profile: PlainProfile) -> PilotResult<bool> {
        let mut connections = self.lock();
        let Some(index) = connections.iter().position(|existing| existing.id == profile.id)
        else {
            tracing::debug!(connection_id = %profile.id, "Update ignored; unknown connection id");
            return Ok(false);
        };
        let id = profile.id.clone();
        let previous = self.secret_values(&id)?;
        let committed = self.seal(profile).and_then(|stored| {
            let mut next = connections.clone();
            next[index] = stored.clone();
            self.persist(&next)?;
            Ok((stored, next))
        });
        let (stored, next) = match committed {
            Ok(committed) => committed,
            Err(err) => {
                tracing::warn!(connection_id = %id, error = %err, "Update failed; restoring secrets");
                self.restore_secrets(&id, previous);
                return Err(err);
            }
        };
        *connections = next;
        tracing::info!(connection_id = %stored.id, alias = %stored.alias, "Updated connection");
        Ok(true)
    }

    /// Purges secrets then drops the profile. Returns whether a profile was removed.
    pub fn remove(&self, id: &str) -> PilotResult<bool> {
        let mut connections = self.lock();
        self.secrets.purge(id)?;
        let before = connections.len();
        connections.retain(|profile| profile.id != id);
        let removed = connections.len() != before;
        if removed {
            self.persist(&connections)?;
            tracing::info!(connection_id = id, "Removed connection");
        }
        Ok(removed)
    }

    /// Decrypted copy; the stored entry is left untouched.
    pub fn get_plaintext(&self, id: &str) -> PilotResult<Option<PlainProfile>> {
        match self.find(id) {
            Some(stored) => self.unseal(stored).map(Some),
            None => Ok(None),
        }
    }

    pub fn generate_connect_command(&self, id: &str) -> PilotResult<Option<String>> {
        Ok(self
            .get_plaintext(id)?
            .map(|profile| CommandBuilder::new(&profile).render()))
    }

    /// Adds a copy of `id` under a fresh identity and returns it.
    pub fn duplicate(&self, id: &str) -> PilotResult<Option<StoredProfile>> {
        let Some(profile) = self.get_plaintext(id)? else {
            return Ok(None);
        };
        self.add(profile.duplicate()).map(Some)
    }

    /// The secret an operator would paste at a sudo prompt: the sudo password,
    /// else the login password.
    pub fn sudo_secret(&self, id: &str) -> PilotResult<Option<SudoSecret>> {
        let Some(profile) = self.get_plaintext(id)? else {
            return Ok(None);
        };
        let sudo = profile
            .sudo_password
            .filter(|secret| !secret.is_empty())
            .map(|secret| SudoSecret {
                source: SudoSecretSource::SudoPassword,
                secret,
            });
        Ok(sudo.or_else(|| {
            profile
                .password
                .filter(|secret| !secret.is_empty())
                .map(|secret| SudoSecret {
                    source: SudoSecretSource::LoginPassword,
                    secret,
                })
        }))
    }

    fn seal(&self, profile: PlainProfile) -> PilotResult<StoredProfile> {
        let stored = profile.try_map_secrets(|id, kind, secret| -> PilotResult<_> {
            if secret.is_empty() {
                return Ok(Some(SecretMarker::blank()));
            }
            self.secrets.put(id, kind, &secret)?;
            Ok(Some(SecretMarker::for_kind(kind)))
        })?;
        for kind in SecretKind::ALL {
            if !stored.secret(kind).is_some_and(SecretMarker::is_marker) {
                self.secrets.delete(&stored.id, kind)?;
            }
        }
        Ok(stored)
    }

    fn unseal(&self, stored: StoredProfile) -> PilotResult<PlainProfile> {
        stored.try_map_secrets(|id, kind, marker| -> PilotResult<_> {
            if marker.is_blank() {
                return Ok(Some(SecretString::new("")));
            }
            let secret = self.secrets.get(id, kind)?;
            if secret.is_none() {
                tracing::warn!(connection_id = id, kind = %kind, "Secret marker has no stored value");
            }
            Ok(secret)
        })
    }

    fn secret_values(&self, id: &str) -> PilotResult<Vec<(SecretKind, Option<SecretString>)>> {
        SecretKind::ALL
            .into_iter()
            .map(|kind| Ok((kind, self.secrets.get(id, kind)?)))
            .collect()
    }

    fn restore_secrets(&self, id: &str, previous: Vec<(SecretKind, Option<SecretString>)>) {
        for (kind, value) in previous {
            let restored = match value {
                Some(secret) => self.secrets.put(id, kind, &secret),
                None => self.secrets.delete(id, kind),
            };
            if let Err(err) = restored {
                tracing::warn!(connection_id = id, kind = %kind, error = %err, "Failed to restore secret");
            }
        }
    }

    fn persist(&self, connections: &[StoredProfile]) -> PilotResult<()> {
        match &self.file {
            Some(file) => file.save(connections),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StoredProfile>> {
        self.connections.lock().expect("connections mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::SudoPolicy;
    use tempfile::tempdir;

    fn repo() -> ConnectionRepository {
        ConnectionRepository::in_memory(SecretStore::in_memory("test"))
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let repo = repo();
        let profile = PlainProfile::new("a", "h", "u").with_id("same");
        repo.add(profile.clone()).expect("first add");
        let err = repo.add(profile).expect_err("duplicate");
        assert_eq!(err.code(), Some(&ErrorCode::DuplicateId));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn list_is_a_snapshot() {
        let repo = repo();
        repo.add(PlainProfile::new("a", "h", "u")).expect("add");
        let mut listed = repo.list();
        listed.clear();
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn update_clearing_a_secret_purges_it() {
        let repo = repo();
        let profile = PlainProfile::new("a", "h", "u")
            .with_sudo(SudoPolicy::OwnPassword, Some("root".into()));
        let id = profile.id.clone();
        repo.add(profile.clone()).expect("add");
        assert!(repo.secrets().get(&id, SecretKind::SudoPassword).expect("get").is_some());

        assert!(repo.update(profile.with_sudo(SudoPolicy::Disabled, None)).expect("update"));
        assert!(repo.secrets().get(&id, SecretKind::SudoPassword).expect("get").is_none());
        assert!(repo.find(&id).expect("stored").sudo_password.is_none());
    }

    #[test]
    fn sudo_secret_falls_back_to_login_password() {
        let repo = repo();
        let stored = repo
            .add(PlainProfile::new("a", "h", "u").with_password("login"))
            .expect("add");
        let secret = repo.sudo_secret(&stored.id).expect("lookup").expect("present");
        assert_eq!(secret.source, SudoSecretSource::LoginPassword);
        assert_eq!(secret.secret.expose(), "login");
        assert!(repo.sudo_secret("missing").expect("lookup").is_none());
    }

    #[test]
    fn profile_file_round_trips_markers_only() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("connections.json");
        let secrets = SecretStore::in_memory("test");
        let repo = ConnectionRepository::open(secrets.clone(), ProfileFile::new(&path))
            .expect("open");
        let stored = repo
            .add(PlainProfile::new("a", "h", "u").with_password("p1"))
            .expect("add");

        let raw = fs::read_to_string(&path).expect("read");
        assert!(!raw.contains("p1"));
        assert!(raw.contains("encrypted:password"));

        let reopened = ConnectionRepository::open(secrets, ProfileFile::new(&path)).expect("reopen");
        let plain = reopened
            .get_plaintext(&stored.id)
            .expect("decrypt")
            .expect("present");
        assert_eq!(plain.password.as_ref().map(SecretString::expose), Some("p1"));
    }

    fn block_profile_file(path: &Path) {
        if path.exists() {
            fs::remove_file(path).expect("remove profile file");
        }
        fs::create_dir_all(path.join("occupied")).expect("block path");
    }

    #[test]
    fn failed_add_leaves_nothing_behind() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("connections.json");
        let repo = ConnectionRepository::open(SecretStore::in_memory("test"), ProfileFile::new(&path))
            .expect("open");
        block_profile_file(&path);

        let profile = PlainProfile::new("a", "h", "u").with_password("p1");
        let err = repo.add(profile.clone()).expect_err("save must fail");
        assert_eq!(err.code(), Some(&ErrorCode::StorageFailed));
        assert!(repo.is_empty());
        assert!(repo.secrets().get(&profile.id, SecretKind::Password).expect("get").is_none());
    }

    #[test]
    fn failed_update_keeps_previous_state() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("connections.json");
        let repo = ConnectionRepository::open(SecretStore::in_memory("test"), ProfileFile::new(&path))
            .expect("open");
        let original = PlainProfile::new("a", "h", "u")
            .with_password("old")
            .with_sudo(SudoPolicy::OwnPassword, Some("root".into()));
        repo.add(original.clone()).expect("add");
        block_profile_file(&path);

        let changed = original
            .clone()
            .with_password("new")
            .with_sudo(SudoPolicy::Disabled, None);
        repo.update(changed).expect_err("save must fail");
        let plain = repo
            .get_plaintext(&original.id)
            .expect("decrypt")
            .expect("present");
        assert_eq!(plain, original);
    }

    #[test]
    fn blank_secrets_round_trip_without_store_entries() {
        let repo = repo();
        let profile = PlainProfile::new("a", "h", "u").with_password("");
        let stored = repo.add(profile.clone()).expect("add");
        assert!(stored.password.as_ref().is_some_and(SecretMarker::is_blank));
        assert!(repo.secrets().get(&profile.id, SecretKind::Password).expect("get").is_none());
        assert_eq!(repo.get_plaintext(&profile.id).expect("decrypt"), Some(profile));
        assert!(repo.sudo_secret(&stored.id).expect("lookup").is_none());
    }

    #[test]
    fn memory_backend_cannot_back_a_profile_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("connections.json");
        let storage = StorageConfig {
            profiles_path: path.display().to_string(),
            secret_backend: SecretBackendKind::Memory,
            ..StorageConfig::default()
        };
        let err = ConnectionRepository::open_configured(&storage)
            .err()
            .expect("memory backend refused");
        assert_eq!(err.code(), Some(&ErrorCode::Unsupported));
        assert!(!path.exists());
    }

    #[test]
    fn open_migrates_cleartext_left_on_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("connections.json");
        fs::write(
            &path,
            r#"{"version":1,"connections":[{"id":"legacy","alias":"old","host":"h","port":22,"username":"u","password":"hunter2"}]}"#,
        )
        .expect("seed");

        let secrets = SecretStore::in_memory("test");
        let repo = ConnectionRepository::open(secrets.clone(), ProfileFile::new(&path))
            .expect("open");
        let stored = repo.find("legacy").expect("present");
        assert!(stored.password.as_ref().is_some_and(SecretMarker::is_marker));
        assert!(!fs::read_to_string(&path).expect("read").contains("hunter2"));
        assert_eq!(
            secrets
                .get("legacy", SecretKind::Password)
                .expect("get")
                .map(|secret| secret.expose().to_string()),
            Some("hunter2".to_string())
        );
    }
}
