use crate::DaemonError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

/// Everything one image build needs from the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Tag given to the built image.
    pub image: String,
    /// Dockerfile to build, usually the generated copy next to the original.
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub build_args: BTreeMap<String, String>,
    pub no_cache: bool,
    pub suppress_output: bool,
    pub remove_intermediate: bool,
    pub force_remove_intermediate: bool,
    pub network: Option<String>,
    /// Memory limit in bytes.
    pub memory: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub cpuset_cpus: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How to reach the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Client binary used by the CLI backend.
    pub binary: String,
    /// `unix:///var/run/docker.sock`, `tcp://host:2376`, ... `None` leaves the
    /// client's own default in place.
    pub host: Option<String>,
    /// Directory holding `ca.pem`, `cert.pem` and `key.pem`.
    pub cert_path: Option<PathBuf>,
    pub use_tls: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
            host: None,
            cert_path: None,
            use_tls: false,
        }
    }
}

pub trait ImageDaemon: Send + Sync {
    fn name(&self) -> &'static str;

    fn build_image(&self, request: &BuildRequest) -> Result<(), DaemonError>;

    /// Create a stopped container from `image`; returns its id.
    fn create_container(&self, image: &str, name: &str, cmd: &[String])
        -> Result<String, DaemonError>;

    fn start_container(&self, id: &str) -> Result<(), DaemonError>;

    /// Stop without a grace period.
    fn stop_container(&self, id: &str) -> Result<(), DaemonError>;

    fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<(), DaemonError>;

    /// Run `cmd` in a running container. A non-zero exit is reported in the
    /// output, not as an error.
    fn exec(&self, id: &str, cmd: &[String], tty: bool) -> Result<ExecOutput, DaemonError>;

    /// Commit a container to a new untagged image; returns the image id.
    fn commit_container(&self, id: &str) -> Result<String, DaemonError>;

    /// Stream `image` in the save format to `out`.
    fn export_image(&self, image: &str, out: &mut dyn Write) -> Result<(), DaemonError>;

    fn load_image(&self, input: &mut dyn Read) -> Result<(), DaemonError>;

    /// Stream `path` from the container's filesystem to `out` as a tar.
    fn copy_from_container(
        &self,
        id: &str,
        path: &str,
        out: &mut dyn Write,
    ) -> Result<(), DaemonError>;

    fn remove_image(&self, image: &str, force: bool, no_prune: bool) -> Result<(), DaemonError>;
}

pub fn select_daemon(
    name: &str,
    config: &DaemonConfig,
) -> Result<Box<dyn ImageDaemon>, DaemonError> {
    match name {
        "docker" => Ok(Box::new(crate::docker::DockerCli::new(config.clone()))),
        "mock" => Ok(Box::new(crate::mock::MockDaemon::new())),
        other => Err(DaemonError::BackendUnavailable(other.to_owned())),
    }
}
