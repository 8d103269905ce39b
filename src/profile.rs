//! Connection profiles.
//!
//! A profile exists in one of two forms, told apart by the type of its secret
//! fields: [`PlainProfile`] carries real values wrapped in [`SecretString`],
//! [`StoredProfile`] carries [`SecretMarker`]s pointing into the secret store.
//! Only the stored form is serialisable, so a plaintext profile cannot reach disk.

use crate::secret::SecretKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_SSH_PORT: u16 = 22;
const MARKER_PREFIX: &str = "encrypted:";
const DUPLICATE_ALIAS_PREFIX: &str = "Copy of ";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    Password,
    PublicKey {
        key_path: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    #[default]
    Linux,
    Windows,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SudoPolicy {
    #[default]
    #[serde(rename = "none")]
    Disabled,
    OwnPassword,
    UserPasswordReused,
}

/// A secret held in memory. Never printed, never serialised.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque at-rest stand-in for a secret that lives in the secret store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretMarker(String);

impl SecretMarker {
    pub fn for_kind(kind: SecretKind) -> Self {
        Self(format!("{MARKER_PREFIX}{}", kind.as_str()))
    }

    /// Stands for a secret the user left empty. Nothing is kept in the store
    /// for it and it reads back as an empty [`SecretString`].
    pub fn blank() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }

    /// False for blanks and for legacy cleartext secrets that still have to
    /// be moved into the store.
    pub fn is_marker(&self) -> bool {
        self.0.starts_with(MARKER_PREFIX)
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(bound(deserialize = "S: Deserialize<'de>"))]
pub struct ConnectionProfile<S> {
    pub id: String,
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<S>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<S>,
    #[serde(default)]
    pub os_family: OsFamily,
    #[serde(default)]
    pub post_connect_commands: Vec<String>,
    #[serde(default)]
    pub sudo_policy: SudoPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo_password: Option<S>,
    #[serde(default)]
    pub maximize_on_connect: bool,
}

pub type PlainProfile = ConnectionProfile<SecretString>;
pub type StoredProfile = ConnectionProfile<SecretMarker>;

impl<S> ConnectionProfile<S> {
    pub fn secret(&self, kind: SecretKind) -> Option<&S> {
        match kind {
            SecretKind::Password => self.password.as_ref(),
            SecretKind::KeyPassphrase => self.key_passphrase.as_ref(),
            SecretKind::SudoPassword => self.sudo_password.as_ref(),
        }
    }

    pub fn key_path(&self) -> Option<&str> {
        match &self.auth {
            AuthMode::PublicKey { key_path } => Some(key_path.as_str()),
            AuthMode::Password => None,
        }
    }

    pub fn uses_public_key(&self) -> bool {
        matches!(self.auth, AuthMode::PublicKey { .. })
    }

    /// Post-connect command lines with blanks and `#` comments removed.
    pub fn startup_commands(&self) -> impl Iterator<Item = &str> {
        self.post_connect_commands
            .iter()
            .map(|line| line.trim_end_matches(['\r', '\n']))
            .filter(|line| !line.trim().is_empty())
            .filter(|line| !line.trim_start().starts_with('#'))
    }

    /// Converts every present secret field, keeping all other fields as-is.
    /// The closure sees the owning id so it can address the secret store.
    pub fn try_map_secrets<T, E>(
        self,
        mut f: impl FnMut(&str, SecretKind, S) -> Result<Option<T>, E>,
    ) -> Result<ConnectionProfile<T>, E> {
        let id = self.id;
        let password = self
            .password
            .map(|value| f(&id, SecretKind::Password, value))
            .transpose()?
            .flatten();
        let key_passphrase = self
            .key_passphrase
            .map(|value| f(&id, SecretKind::KeyPassphrase, value))
            .transpose()?
            .flatten();
        let sudo_password = self
            .sudo_password
            .map(|value| f(&id, SecretKind::SudoPassword, value))
            .transpose()?
            .flatten();
        Ok(ConnectionProfile {
            id,
            alias: self.alias,
            host: self.host,
            port: self.port,
            username: self.username,
            auth: self.auth,
            password,
            key_passphrase,
            os_family: self.os_family,
            post_connect_commands: self.post_connect_commands,
            sudo_policy: self.sudo_policy,
            sudo_password,
            maximize_on_connect: self.maximize_on_connect,
        })
    }
}

impl PlainProfile {
    pub fn new(
        alias: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alias: alias.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            auth: AuthMode::Password,
            password: None,
            key_passphrase: None,
            os_family: OsFamily::Linux,
            post_connect_commands: Vec::new(),
            sudo_policy: SudoPolicy::Disabled,
            sudo_password: None,
            maximize_on_connect: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<SecretString>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_public_key(mut self, key_path: impl Into<String>) -> Self {
        self.auth = AuthMode::PublicKey {
            key_path: key_path.into(),
        };
        self
    }

    pub fn with_key_passphrase(mut self, passphrase: impl Into<SecretString>) -> Self {
        self.key_passphrase = Some(passphrase.into());
        self
    }

    pub fn with_os_family(mut self, os_family: OsFamily) -> Self {
        self.os_family = os_family;
        self
    }

    pub fn with_sudo(mut self, policy: SudoPolicy, password: Option<SecretString>) -> Self {
        self.sudo_policy = policy;
        self.sudo_password = password;
        self
    }

    pub fn with_commands<I, C>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.post_connect_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_maximize_on_connect(mut self, maximize: bool) -> Self {
        self.maximize_on_connect = maximize;
        self
    }

    /// A copy under a fresh identity, aliased "Copy of ...".
    pub fn duplicate(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.alias = format!("{DUPLICATE_ALIAS_PREFIX}{}", self.alias);
        copy
    }

    /// Secret typed after `sudo`: the dedicated sudo password, else the login
    /// password when the policy reuses it.
    pub fn sudo_credential(&self) -> Option<&SecretString> {
        let own = self.sudo_password.as_ref().filter(|value| !value.is_empty());
        match self.sudo_policy {
            SudoPolicy::UserPasswordReused => {
                own.or_else(|| self.password.as_ref().filter(|value| !value.is_empty()))
            }
            _ => own,
        }
    }

    /// Key passphrase, only when key authentication is in use.
    pub fn passphrase(&self) -> Option<&SecretString> {
        if !self.uses_public_key() {
            return None;
        }
        self.key_passphrase.as_ref().filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_commands_skip_comments_and_blanks() {
        let profile = PlainProfile::new("web", "example.com", "bob")
            .with_commands(["# comment", "", "   ", "ls -la", "  # indented", "uptime\r"]);
        let commands: Vec<&str> = profile.startup_commands().collect();
        assert_eq!(commands, vec!["ls -la", "uptime"]);
    }

    #[test]
    fn duplicate_gets_fresh_identity() {
        let profile = PlainProfile::new("web", "example.com", "bob").with_password("p1");
        let copy = profile.duplicate();
        assert_ne!(copy.id, profile.id);
        assert_eq!(copy.alias, "Copy of web");
        assert_eq!(copy.password, profile.password);
    }

    #[test]
    fn sudo_credential_follows_policy() {
        let base = PlainProfile::new("web", "example.com", "bob").with_password("login");
        let reused = base.clone().with_sudo(SudoPolicy::UserPasswordReused, None);
        assert_eq!(reused.sudo_credential().map(SecretString::expose), Some("login"));

        let own = base
            .clone()
            .with_sudo(SudoPolicy::OwnPassword, Some("root".into()));
        assert_eq!(own.sudo_credential().map(SecretString::expose), Some("root"));

        let missing = base.with_sudo(SudoPolicy::OwnPassword, None);
        assert!(missing.sudo_credential().is_none());
    }

    #[test]
    fn passphrase_requires_public_key() {
        let profile = PlainProfile::new("web", "example.com", "bob").with_key_passphrase("pp");
        assert!(profile.passphrase().is_none());
        let profile = profile.with_public_key("/k");
        assert_eq!(profile.passphrase().map(SecretString::expose), Some("pp"));
    }

    #[test]
    fn secret_string_debug_is_masked() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{secret:?}"), "SecretString(***)");
    }

    #[test]
    fn stored_profile_serializes_markers_only() {
        let stored: StoredProfile = PlainProfile::new("web", "example.com", "bob")
            .with_password("p1")
            .try_map_secrets(|_, kind, _| Ok::<_, ()>(Some(SecretMarker::for_kind(kind))))
            .expect("map");
        let json = serde_json::to_string(&stored).expect("serialize");
        assert!(json.contains("encrypted:password"));
        assert!(!json.contains("p1"));
    }

    #[test]
    fn stored_profile_loads_back_from_json() {
        let json = r#"{"id":"x","alias":"a","host":"h","port":22,"username":"u","password":"encrypted:password"}"#;
        let stored: StoredProfile = serde_json::from_str(json).expect("deserialize");
        assert!(stored.password.as_ref().is_some_and(SecretMarker::is_marker));
        assert!(stored.key_passphrase.is_none());
        assert_eq!(stored.sudo_policy, SudoPolicy::Disabled);
    }

    #[test]
    fn blank_marker_is_not_a_store_reference() {
        let blank = SecretMarker::blank();
        assert!(blank.is_blank());
        assert!(!blank.is_marker());
        assert!(!SecretMarker::for_kind(SecretKind::Password).is_blank());
    }
}
