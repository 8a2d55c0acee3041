//! Image daemon backends for Kiln.
//!
//! `ImageDaemon` is the narrow contract the scheduler drives: build an image,
//! run an ephemeral container, exec into it, commit, export and load images,
//! copy paths out, remove images. `DockerCli` fulfils it by shelling out to
//! the `docker` client; `MockDaemon` keeps everything in memory for tests.

pub mod daemon;
pub mod docker;
pub mod mock;
pub mod prereq;

pub use daemon::{select_daemon, BuildRequest, DaemonConfig, ExecOutput, ImageDaemon};
pub use docker::DockerCli;
pub use mock::MockDaemon;
pub use prereq::{check_docker_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon backend '{0}' is not available")]
    BackendUnavailable(String),
    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("container '{0}' is not running")]
    NotRunning(String),
    #[error("no such path in container {container}: {path}")]
    PathNotFound { container: String, path: String },
    #[error("daemon operation failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display() {
        let e = DaemonError::CommandFailed {
            command: "docker build".to_owned(),
            status: "exit code 1".to_owned(),
            stderr: "no space left".to_owned(),
        };
        assert_eq!(e.to_string(), "docker build failed (exit code 1): no space left");
    }
}
