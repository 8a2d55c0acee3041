//! Secret providers.
//!
//! A secret is declared in the manifest with a provider kind and a locator.
//! `file` secrets resolve to the raw bytes of the file at the locator,
//! `env` secrets to the value of the environment variable it names. The
//! registry is filled while the manifest loads and read-only afterwards, so
//! the secret endpoint can share it across request threads without locking.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("unknown secret provider '{0}'")]
    UnknownProvider(String),
    #[error("secret '{name}' is not registered with the {kind} provider")]
    NotRegistered { kind: SecretKind, name: String },
    #[error("secret '{name}' is already registered with a different value")]
    Conflict { name: String },
    #[error("failed to read secret file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("environment variable '{0}' is not set")]
    EnvNotSet(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretKind {
    File,
    Env,
}

impl SecretKind {
    pub const ALL: [SecretKind; 2] = [SecretKind::File, SecretKind::Env];

    pub fn as_str(self) -> &'static str {
        match self {
            SecretKind::File => "file",
            SecretKind::Env => "env",
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecretKind {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "file" => Ok(SecretKind::File),
            "env" => Ok(SecretKind::Env),
            other => Err(SecretError::UnknownProvider(other.to_owned())),
        }
    }
}

/// Parse a comma separated provider list such as `"file,env"`.
pub fn parse_provider_list(list: &str) -> Result<Vec<SecretKind>, SecretError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(SecretKind::from_str)
        .collect()
}

pub trait SecretProvider {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>, SecretError>;

    fn register_secret(&mut self, name: &str, value: &str) -> Result<(), SecretError>;
}

/// Registry of secrets for one provider kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretStore {
    kind: SecretKind,
    registry: BTreeMap<String, String>,
}

impl SecretStore {
    pub fn new(kind: SecretKind) -> Self {
        Self {
            kind,
            registry: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> SecretKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

impl SecretProvider for SecretStore {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>, SecretError> {
        let locator = self
            .registry
            .get(name)
            .ok_or_else(|| SecretError::NotRegistered {
                kind: self.kind,
                name: name.to_owned(),
            })?;

        match self.kind {
            SecretKind::File => {
                let path = PathBuf::from(locator);
                std::fs::read(&path).map_err(|source| SecretError::Read { path, source })
            }
            SecretKind::Env => std::env::var(locator)
                .map(String::into_bytes)
                .map_err(|_| SecretError::EnvNotSet(locator.clone())),
        }
    }

    fn register_secret(&mut self, name: &str, value: &str) -> Result<(), SecretError> {
        match self.registry.get(name) {
            Some(existing) if existing != value => Err(SecretError::Conflict {
                name: name.to_owned(),
            }),
            Some(_) => Ok(()),
            None => {
                self.registry.insert(name.to_owned(), value.to_owned());
                Ok(())
            }
        }
    }
}

/// One store per provider kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretProviders {
    file: SecretStore,
    env: SecretStore,
}

impl Default for SecretProviders {
    fn default() -> Self {
        Self {
            file: SecretStore::new(SecretKind::File),
            env: SecretStore::new(SecretKind::Env),
        }
    }
}

impl SecretProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self, kind: SecretKind) -> &SecretStore {
        match kind {
            SecretKind::File => &self.file,
            SecretKind::Env => &self.env,
        }
    }

    pub fn provider_mut(&mut self, kind: SecretKind) -> &mut SecretStore {
        match kind {
            SecretKind::File => &mut self.file,
            SecretKind::Env => &mut self.env,
        }
    }

    /// Look a secret up by the provider name used in request paths.
    pub fn lookup(&self, kind: &str, name: &str) -> Result<Vec<u8>, SecretError> {
        let kind = SecretKind::from_str(kind)?;
        self.provider(kind).get_secret(name)
    }

    pub fn register(&mut self, kind: SecretKind, name: &str, value: &str) -> Result<(), SecretError> {
        self.provider_mut(kind).register_secret(name, value)
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_empty() && self.env.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind() {
        assert_eq!("file".parse::<SecretKind>().unwrap(), SecretKind::File);
        assert_eq!(" env ".parse::<SecretKind>().unwrap(), SecretKind::Env);
        assert!("vault".parse::<SecretKind>().is_err());
    }

    #[test]
    fn provider_list_skips_blanks() {
        let kinds = parse_provider_list("file, env,").unwrap();
        assert_eq!(kinds, vec![SecretKind::File, SecretKind::Env]);
        assert!(parse_provider_list("file,ssm").is_err());
    }

    #[test]
    fn file_secret_reads_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "s3cr3t").unwrap();

        let mut providers = SecretProviders::new();
        providers
            .register(SecretKind::File, "token", path.to_str().unwrap())
            .unwrap();
        assert_eq!(providers.lookup("file", "token").unwrap(), b"s3cr3t");
    }

    #[test]
    fn file_secret_keeps_binary_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.der");
        let der = [0x30, 0x82, 0xff, 0xfe, 0x00, 0x01];
        std::fs::write(&path, der).unwrap();

        let mut providers = SecretProviders::new();
        providers
            .register(SecretKind::File, "key", path.to_str().unwrap())
            .unwrap();
        assert_eq!(providers.lookup("file", "key").unwrap(), der);
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut store = SecretStore::new(SecretKind::File);
        store
            .register_secret("gone", "/nonexistent/kiln/secret")
            .unwrap();
        assert!(matches!(
            store.get_secret("gone"),
            Err(SecretError::Read { .. })
        ));
    }

    #[test]
    fn env_secret_reads_variable() {
        let var = "KILN_TEST_SECRET_ENV_PROVIDER";
        std::env::set_var(var, "from-env");
        let mut store = SecretStore::new(SecretKind::Env);
        store.register_secret("api", var).unwrap();
        assert_eq!(store.get_secret("api").unwrap(), b"from-env");
        std::env::remove_var(var);
        assert!(matches!(
            store.get_secret("api"),
            Err(SecretError::EnvNotSet(_))
        ));
    }

    #[test]
    fn unregistered_secret_rejected() {
        let providers = SecretProviders::new();
        let err = providers.lookup("env", "nope").unwrap_err();
        assert!(err.to_string().contains("not registered"));
        assert!(providers.lookup("ssm", "nope").is_err());
    }

    #[test]
    fn conflicting_registration_rejected() {
        let mut store = SecretStore::new(SecretKind::Env);
        store.register_secret("a", "VAR_A").unwrap();
        store.register_secret("a", "VAR_A").unwrap();
        assert!(store.register_secret("a", "VAR_B").is_err());
        assert_eq!(store.len(), 1);
    }
}
