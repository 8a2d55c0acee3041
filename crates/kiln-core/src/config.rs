use crate::CoreError;
use kiln_runtime::DaemonConfig;
use kiln_schema::{parse_provider_list, BuildId, LoadOptions, ManifestError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Run-wide settings for one build.
///
/// Loaded from an optional TOML file and then overridden field by field by
/// the command line.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub workdir: PathBuf,
    /// Build file, relative to `workdir`.
    pub build_file: String,
    /// Suffix for every image and container name. `None` generates a fresh
    /// id per run; an empty string leaves names undecorated.
    pub unique_id: Option<String>,
    pub start_step: Option<String>,
    pub no_cache: bool,
    pub suppress_output: bool,
    pub rm: bool,
    pub force_rm: bool,
    pub keep_steps: bool,
    pub keep_artifacts: bool,
    pub no_squash: bool,
    /// Query artifact permissions with `stat` inside the container.
    pub use_stat: bool,
    pub allow_after_build_commands: bool,
    pub force_rmi: bool,
    pub no_prune_rmi: bool,
    pub fail_on_command_error: bool,
    pub network: Option<String>,
    /// Human size such as `512m` or `2GiB`.
    pub memory: Option<String>,
    pub cpu_shares: Option<u64>,
    pub cpuset_cpus: Option<String>,
    /// Build arguments applied to every step; step values win.
    pub build_args: BTreeMap<String, String>,
    /// Values for `_env(NAME)` placeholders. Empty means the process
    /// environment.
    pub env_vars: BTreeMap<String, String>,
    /// Comma separated list of enabled secret providers.
    pub secret_providers: String,
    pub daemon: DaemonConfig,
    pub secrets: SecretServerConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            build_file: "build.yml".to_owned(),
            unique_id: None,
            start_step: None,
            no_cache: false,
            suppress_output: false,
            rm: true,
            force_rm: false,
            keep_steps: false,
            keep_artifacts: false,
            no_squash: false,
            use_stat: false,
            allow_after_build_commands: false,
            force_rmi: false,
            no_prune_rmi: false,
            fail_on_command_error: false,
            network: None,
            memory: None,
            cpu_shares: None,
            cpuset_cpus: None,
            build_args: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            secret_providers: "file,env".to_owned(),
            daemon: DaemonConfig::default(),
            secrets: SecretServerConfig::default(),
        }
    }
}

/// Where and how the secret endpoint listens while a build runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretServerConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for SecretServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0".to_owned(),
            port: 8080,
            username: None,
            password: None,
        }
    }
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        debug!("loading config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        Ok(toml::from_str(content)?)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.workdir.join(&self.build_file)
    }

    /// The run's build id; generated unless one was configured.
    pub fn build_id(&self) -> BuildId {
        match &self.unique_id {
            Some(id) => BuildId::new(id.as_str()),
            None => BuildId::generate(),
        }
    }

    pub fn memory_bytes(&self) -> Result<Option<u64>, CoreError> {
        self.memory.as_deref().map(parse_memory).transpose()
    }

    pub fn load_options(&self) -> Result<LoadOptions, CoreError> {
        let secret_providers =
            parse_provider_list(&self.secret_providers).map_err(ManifestError::from)?;
        Ok(LoadOptions {
            env_vars: self.env_vars.clone(),
            no_squash: self.no_squash,
            secret_providers,
        })
    }

    /// Reject settings that would only fail once the daemon is involved.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.memory_bytes()?;
        if self.secrets.username.is_some() != self.secrets.password.is_some() {
            return Err(CoreError::Config(
                "secret server needs both a username and a password".to_owned(),
            ));
        }
        if let Some(cpus) = &self.cpuset_cpus {
            let valid = !cpus.is_empty()
                && cpus
                    .chars()
                    .all(|c| c.is_ascii_digit() || c == ',' || c == '-');
            if !valid {
                return Err(CoreError::Config(format!("invalid cpuset '{cpus}'")));
            }
        }
        Ok(())
    }
}

/// Parse a human size into bytes: `1024`, `512k`, `512m`, `1.5GB`, `2GiB`.
/// Decimal units are powers of 1000, `Ki`/`Mi`/`Gi`/`Ti` are powers of 1024.
pub fn parse_memory(input: &str) -> Result<u64, CoreError> {
    let invalid = || CoreError::Config(format!("invalid memory size '{input}'"));
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        _ => return Err(invalid()),
    };
    let bytes = (value * multiplier as f64).round();
    if !bytes.is_finite() || bytes < 1.0 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}
