//! The per-step build pipeline.
//!
//! A step moves through [`StepPhase`]s in order, skipping the container
//! phases when it declares no cleanup, artifacts or command:
//!
//! `RewriteFrom -> ImageBuild -> ContainerCreate -> CleanupRun -> Squash ->
//! ArtifactExtract -> CommandRun -> ContainerTeardown -> AfterBuild -> Done`
//!
//! The ephemeral container is always removed, also when a phase inside it
//! failed. The generated Dockerfile is only removed on success.

use crate::artifacts::{extract_artifact_tar, parse_stat_mode};
use crate::concurrency::shutdown_requested;
use crate::config::BuildConfig;
use crate::dockerfile::{read_to_target, rewrite_from};
use crate::naming::{container_name, generated_dockerfile_path};
use crate::CoreError;
use kiln_runtime::{BuildRequest, ImageDaemon};
use kiln_schema::{BuildId, Step};
use kiln_squash::Squasher;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufReader, Seek};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};

const CONTAINER_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Pending,
    RewriteFrom,
    ImageBuild,
    ContainerCreate,
    CleanupRun,
    Squash,
    ArtifactExtract,
    CommandRun,
    ContainerTeardown,
    AfterBuild,
    Done,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepPhase::Pending => "pending",
            StepPhase::RewriteFrom => "FROM rewrite",
            StepPhase::ImageBuild => "image build",
            StepPhase::ContainerCreate => "container create",
            StepPhase::CleanupRun => "cleanup",
            StepPhase::Squash => "squash",
            StepPhase::ArtifactExtract => "artifact extraction",
            StepPhase::CommandRun => "command",
            StepPhase::ContainerTeardown => "container teardown",
            StepPhase::AfterBuild => "after-build command",
            StepPhase::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("step '{step}' failed during {phase}: {source}")]
pub struct StepError {
    pub step: String,
    pub phase: StepPhase,
    pub source: CoreError,
}

/// Everything a step needs from its run, shared by all concurrently
/// building steps.
pub struct StepContext<'a> {
    pub config: &'a BuildConfig,
    pub daemon: &'a dyn ImageDaemon,
    pub build_id: &'a BuildId,
    pub workdir: &'a Path,
    /// Step name to run-qualified image name, for every step of the build.
    pub images: &'a BTreeMap<String, String>,
    /// Parsed memory limit in bytes.
    pub memory: Option<u64>,
}

/// Run one step through the whole pipeline.
pub fn build_step(ctx: &StepContext<'_>, step: &Step) -> Result<(), StepError> {
    let image = ctx
        .images
        .get(&step.name)
        .cloned()
        .unwrap_or_else(|| step.name.clone());
    let mut run = StepRun {
        ctx,
        step,
        image,
        phase: StepPhase::Pending,
    };
    match run.execute() {
        Ok(()) => Ok(()),
        Err(source) => Err(StepError {
            step: step.name.clone(),
            phase: run.phase,
            source,
        }),
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_owned).collect()
}

struct StepRun<'r, 'a> {
    ctx: &'r StepContext<'a>,
    step: &'r Step,
    image: String,
    phase: StepPhase,
}

impl StepRun<'_, '_> {
    fn enter(&mut self, phase: StepPhase) {
        debug!("step '{}': {phase}", self.step.name);
        self.phase = phase;
    }

    fn execute(&mut self) -> Result<(), CoreError> {
        self.enter(StepPhase::RewriteFrom);
        let generated = self.write_dockerfile()?;

        self.enter(StepPhase::ImageBuild);
        info!(
            "building {} from {}",
            self.image,
            generated.file_name().map_or_else(
                || generated.display().to_string(),
                |n| n.to_string_lossy().into_owned()
            )
        );
        self.ctx.daemon.build_image(&self.build_request(generated.clone()))?;

        if self.step.needs_container() {
            self.enter(StepPhase::ContainerCreate);
            let name = container_name(&self.image);
            let id = self.ctx.daemon.create_container(
                &self.image,
                &name,
                &[CONTAINER_SHELL.to_owned()],
            )?;
            debug!("step '{}': created container {name} ({id})", self.step.name);

            let result = self.in_container(&id);
            if result.is_ok() {
                self.enter(StepPhase::ContainerTeardown);
            }
            match self.ctx.daemon.remove_container(&id, true, true) {
                Ok(()) => {}
                Err(e) if result.is_err() => {
                    warn!("failed to remove container {name}: {e}");
                }
                Err(e) => return Err(e.into()),
            }
            result?;
        }

        let step = self.step;
        if let Some(command) = &step.after_build_command {
            self.enter(StepPhase::AfterBuild);
            self.run_after_build(command)?;
        }

        if let Err(e) = fs::remove_file(&generated) {
            warn!("failed to remove {}: {e}", generated.display());
        }
        self.enter(StepPhase::Done);
        Ok(())
    }

    fn write_dockerfile(&self) -> Result<PathBuf, CoreError> {
        let source = self.ctx.workdir.join(&self.step.dockerfile);
        let mut text = fs::read_to_string(&source)?;
        if let Some(target) = &self.step.target {
            text = read_to_target(&text, target)?;
        }
        let text = rewrite_from(&text, self.ctx.images)?;
        let path = generated_dockerfile_path(
            self.ctx.workdir,
            &self.step.dockerfile,
            &self.step.name,
            self.ctx.build_id,
        );
        fs::write(&path, text)?;
        Ok(path)
    }

    fn build_request(&self, dockerfile: PathBuf) -> BuildRequest {
        let config = self.ctx.config;
        let mut build_args = config.build_args.clone();
        build_args.extend(
            self.step
                .args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        BuildRequest {
            image: self.image.clone(),
            dockerfile,
            context: self.ctx.workdir.join(&self.step.context),
            build_args,
            no_cache: config.no_cache || self.step.no_cache,
            suppress_output: config.suppress_output,
            remove_intermediate: config.rm,
            force_remove_intermediate: config.force_rm,
            network: config.network.clone(),
            memory: self.ctx.memory,
            cpu_shares: config.cpu_shares,
            cpuset_cpus: config.cpuset_cpus.clone(),
        }
    }

    fn in_container(&mut self, id: &str) -> Result<(), CoreError> {
        let daemon = self.ctx.daemon;
        let step = self.step;

        if !self.ctx.config.no_squash && !step.cleanup.is_empty() {
            self.enter(StepPhase::CleanupRun);
            daemon.start_container(id)?;
            for command in &step.cleanup {
                let output = daemon.exec(id, &split_command(command), true)?;
                if !output.success() {
                    warn!(
                        "step '{}': cleanup command '{command}' exited with {}",
                        self.step.name, output.exit_code
                    );
                }
            }
            let committed = daemon.commit_container(id)?;
            daemon.stop_container(id)?;

            self.enter(StepPhase::Squash);
            self.squash(&committed)?;
        }

        if !step.artifacts.is_empty() {
            self.enter(StepPhase::ArtifactExtract);
            self.extract_artifacts(id)?;
        }

        if let Some(command) = &step.command {
            self.enter(StepPhase::CommandRun);
            daemon.start_container(id)?;
            let output = daemon.exec(id, &split_command(command), true)?;
            for line in output.stdout.lines() {
                info!("[{}] {line}", self.step.name);
            }
            if !output.success() {
                error!(
                    "step '{}': command '{command}' exited with {}: {}",
                    self.step.name,
                    output.exit_code,
                    output.stderr.trim()
                );
                if self.ctx.config.fail_on_command_error {
                    return Err(CoreError::CommandExit {
                        command: command.clone(),
                        code: output.exit_code,
                    });
                }
            }
        }
        Ok(())
    }

    /// Export the committed image, squash it and load it back under the
    /// step's image name.
    fn squash(&self, committed: &str) -> Result<(), CoreError> {
        let daemon = self.ctx.daemon;

        let mut exported = tempfile::tempfile()?;
        daemon.export_image(committed, &mut exported)?;
        exported.rewind()?;

        let mut squashed = tempfile::tempfile()?;
        let report = Squasher::new()
            .interrupt_check(shutdown_requested)
            .squash(BufReader::new(&mut exported), &mut squashed, Some(self.image.as_str()))?;
        squashed.rewind()?;
        info!(
            "step '{}': squashed {} layer(s) above {} ({} layers left)",
            self.step.name,
            report.merged_layers,
            report.squash_point.short(),
            report.layer_count
        );

        daemon.load_image(&mut squashed)?;
        if let Err(e) = daemon.remove_image(committed, false, false) {
            warn!("failed to remove intermediate image {committed}: {e}");
        }
        Ok(())
    }

    fn extract_artifacts(&self, id: &str) -> Result<(), CoreError> {
        let daemon = self.ctx.daemon;
        let artifacts = &self.step.artifacts;

        let modes = if self.ctx.config.use_stat {
            daemon.start_container(id)?;
            let mut modes = Vec::with_capacity(artifacts.len());
            for artifact in artifacts {
                let cmd = vec![
                    "stat".to_owned(),
                    "--format='%a'".to_owned(),
                    artifact.source.clone(),
                ];
                let output = daemon.exec(id, &cmd, false)?;
                let mode = if output.success() {
                    parse_stat_mode(&output.stdout)
                } else {
                    None
                };
                if mode.is_none() {
                    warn!(
                        "step '{}': could not read permissions of {}",
                        self.step.name, artifact.source
                    );
                }
                modes.push(mode);
            }
            daemon.stop_container(id)?;
            modes
        } else {
            vec![None; artifacts.len()]
        };

        for (artifact, mode) in artifacts.iter().zip(modes) {
            let dest = self.ctx.workdir.join(&artifact.dest);
            let mut stream = tempfile::tempfile()?;
            daemon.copy_from_container(id, &artifact.source, &mut stream)?;
            stream.rewind()?;
            let files = extract_artifact_tar(BufReader::new(stream), &dest, mode)?;
            info!(
                "step '{}': copied {} to {} ({} file(s))",
                self.step.name,
                artifact.source,
                dest.display(),
                files.len()
            );
        }
        Ok(())
    }

    fn run_after_build(&self, command: &str) -> Result<(), CoreError> {
        if !self.ctx.config.allow_after_build_commands {
            warn!(
                "step '{}': after-build commands are not allowed; skipping '{command}'",
                self.step.name
            );
            return Ok(());
        }
        info!("step '{}': running after-build command '{command}'", self.step.name);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.ctx.workdir)
            .output()?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        for line in combined.lines() {
            debug!("[{}] {line}", self.step.name);
        }
        if output.status.success() {
            Ok(())
        } else {
            Err(CoreError::AfterBuildCommand {
                command: command.to_owned(),
                output: combined.trim().to_owned(),
            })
        }
    }
}
