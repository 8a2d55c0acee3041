//! Build orchestration for Kiln.
//!
//! This crate ties the schema, squash and runtime layers together into the
//! `Scheduler`: it walks a manifest's build levels, runs every step of a
//! level concurrently through the per-step pipeline (Dockerfile rewrite,
//! image build, cleanup and squash, artifact extraction, foreground command,
//! teardown) and joins the level before starting the next. It also owns the
//! run configuration, run-qualified naming and the interrupt handler.

pub mod artifacts;
pub mod concurrency;
pub mod config;
pub mod dockerfile;
pub mod naming;
pub mod pipeline;
pub mod scheduler;

pub use artifacts::{collect_host_artifact_roots, extract_artifact_tar, parse_stat_mode};
pub use concurrency::{install_signal_handler, shutdown_requested};
pub use config::{parse_memory, BuildConfig, SecretServerConfig};
pub use dockerfile::{read_to_target, rewrite_from};
pub use naming::{container_name, generated_dockerfile_path, unique_step_name};
pub use pipeline::{StepError, StepPhase};
pub use scheduler::{BuildReport, FailedStep, Scheduler};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] kiln_schema::ManifestError),
    #[error("squash error: {0}")]
    Squash(#[from] kiln_squash::SquashError),
    #[error("daemon error: {0}")]
    Daemon(#[from] kiln_runtime::DaemonError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("config file error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("Dockerfile error: {0}")]
    Dockerfile(String),
    #[error("invalid header type {kind} for '{path}'")]
    InvalidHeaderType { path: String, kind: String },
    #[error("after-build command '{command}' failed: {output}")]
    AfterBuildCommand { command: String, output: String },
    #[error("command '{command}' exited with {code}")]
    CommandExit { command: String, code: i32 },
    #[error("unknown start step '{0}'")]
    UnknownStartStep(String),
    #[error("{0}")]
    BuildFailed(BuildReport),
}
