use crate::artifacts::collect_host_artifact_roots;
use crate::concurrency::shutdown_requested;
use crate::config::BuildConfig;
use crate::naming::unique_step_name;
use crate::pipeline::{build_step, StepContext, StepError, StepPhase};
use crate::CoreError;
use kiln_runtime::ImageDaemon;
use kiln_schema::{BuildId, Manifest};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::thread;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStep {
    pub name: String,
    pub phase: StepPhase,
    pub message: String,
}

/// Outcome of one run: which steps built, failed, or never started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub build_id: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedStep>,
    pub skipped: Vec<String>,
    pub interrupted: bool,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.interrupted
    }
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interrupted {
            write!(f, "build {} interrupted", self.build_id)?;
        } else {
            write!(f, "build {} failed", self.build_id)?;
        }
        for failed in &self.failed {
            write!(
                f,
                "; step '{}' failed during {}: {}",
                failed.name, failed.phase, failed.message
            )?;
        }
        if !self.skipped.is_empty() {
            write!(f, "; skipped: {}", self.skipped.join(", "))?;
        }
        Ok(())
    }
}

/// Runs a manifest level by level.
///
/// Every step of a level builds on its own thread; the level is joined
/// before the next one starts, so a step always sees the loaded images of
/// all earlier levels. A failure lets the rest of its level finish and skips
/// every later level.
pub struct Scheduler<'a> {
    manifest: &'a Manifest,
    config: &'a BuildConfig,
    daemon: &'a dyn ImageDaemon,
    build_id: BuildId,
    workdir: PathBuf,
}

impl<'a> Scheduler<'a> {
    pub fn new(manifest: &'a Manifest, config: &'a BuildConfig, daemon: &'a dyn ImageDaemon) -> Self {
        let workdir = match manifest.work_dir.as_deref() {
            Some(dir) if !dir.is_empty() => config.workdir.join(dir),
            _ => config.workdir.clone(),
        };
        Self {
            manifest,
            config,
            daemon,
            build_id: config.build_id(),
            workdir,
        }
    }

    #[must_use]
    pub fn with_build_id(mut self, build_id: BuildId) -> Self {
        self.build_id = build_id;
        self
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Run-qualified image name of every step, keyed by step name.
    pub fn image_names(&self) -> BTreeMap<String, String> {
        self.manifest
            .steps()
            .iter()
            .map(|s| (s.name.clone(), unique_step_name(&s.name, &self.build_id)))
            .collect()
    }

    /// Steps this run builds: everything, or the start step and all steps
    /// that transitively depend on it.
    pub fn selected_steps(&self) -> Result<BTreeSet<usize>, CoreError> {
        match self.config.start_step.as_deref() {
            None | Some("") => Ok((0..self.manifest.steps().len()).collect()),
            Some(start) => {
                let idx = self
                    .manifest
                    .find_by_name(start)
                    .or_else(|| self.manifest.find_by_label(start))
                    .ok_or_else(|| CoreError::UnknownStartStep(start.to_owned()))?;
                Ok(self.manifest.dependent_closure(idx))
            }
        }
    }

    pub fn run(&self) -> Result<BuildReport, CoreError> {
        self.config.validate()?;
        let memory = self.config.memory_bytes()?;
        let selected = self.selected_steps()?;
        let images = self.image_names();

        let artifact_roots = if self.config.keep_artifacts {
            Vec::new()
        } else {
            debug!("collecting artifact information");
            collect_host_artifact_roots(&self.workdir, self.manifest)
        };

        info!(
            "building {} step(s) in {} level(s), build id '{}'",
            selected.len(),
            self.manifest.levels().len(),
            self.build_id
        );
        for (level_idx, level) in self.manifest.levels().iter().enumerate() {
            for &idx in level {
                let step = self.manifest.step(idx);
                debug!(
                    "level {level_idx} - {} (image '{}'){}",
                    step.label,
                    images[&step.name],
                    if selected.contains(&idx) { "" } else { " [skipped]" }
                );
            }
        }

        let ctx = StepContext {
            config: self.config,
            daemon: self.daemon,
            build_id: &self.build_id,
            workdir: &self.workdir,
            images: &images,
            memory,
        };
        let mut report = BuildReport {
            build_id: self.build_id.to_string(),
            ..BuildReport::default()
        };
        let mut halted = false;

        for level in self.manifest.levels() {
            let (runnable, unselected): (Vec<usize>, Vec<usize>) =
                level.iter().copied().partition(|idx| selected.contains(idx));
            report
                .skipped
                .extend(unselected.iter().map(|&i| self.manifest.step(i).name.clone()));

            if !halted && shutdown_requested() {
                warn!("shutdown requested; not starting further steps");
                report.interrupted = true;
                halted = true;
            }
            if halted {
                report
                    .skipped
                    .extend(runnable.iter().map(|&i| self.manifest.step(i).name.clone()));
                continue;
            }

            for (idx, result) in self.run_level(&ctx, &runnable) {
                let name = self.manifest.step(idx).name.clone();
                match result {
                    Ok(()) => {
                        info!("step '{name}' built");
                        report.succeeded.push(name);
                    }
                    Err(e) => {
                        warn!("{e}");
                        report.failed.push(FailedStep {
                            name,
                            phase: e.phase,
                            message: e.source.to_string(),
                        });
                    }
                }
            }
            if !report.failed.is_empty() {
                halted = true;
            }
        }

        for root in &artifact_roots {
            debug!("removing artifact path {}", root.display());
            // overlapping roots may already be gone
            let _ = std::fs::remove_dir_all(root).or_else(|_| std::fs::remove_file(root));
        }

        if !report.is_success() {
            return Err(CoreError::BuildFailed(report));
        }
        if !self.config.keep_steps {
            self.remove_intermediate_images(&selected, &images);
        }
        info!("build {} finished: {} step(s)", self.build_id, report.succeeded.len());
        Ok(report)
    }

    /// Build the steps of one level concurrently and wait for all of them.
    fn run_level(
        &self,
        ctx: &StepContext<'_>,
        steps: &[usize],
    ) -> Vec<(usize, Result<(), StepError>)> {
        let manifest = self.manifest;
        thread::scope(|scope| {
            let handles: Vec<_> = steps
                .iter()
                .map(|&idx| (idx, scope.spawn(move || build_step(ctx, manifest.step(idx)))))
                .collect();
            handles
                .into_iter()
                .map(|(idx, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(StepError {
                            step: manifest.step(idx).name.clone(),
                            phase: StepPhase::Pending,
                            source: CoreError::Io(std::io::Error::other("step thread panicked")),
                        })
                    });
                    (idx, result)
                })
                .collect()
        })
    }

    /// Remove the images of steps that only served as a base for other steps.
    fn remove_intermediate_images(
        &self,
        selected: &BTreeSet<usize>,
        images: &BTreeMap<String, String>,
    ) {
        for &idx in selected {
            let step = self.manifest.step(idx);
            if step.keep || self.manifest.dependents(idx).is_empty() {
                continue;
            }
            let image = &images[&step.name];
            debug!("removing intermediate image {image}");
            if let Err(e) =
                self.daemon
                    .remove_image(image, self.config.force_rmi, self.config.no_prune_rmi)
            {
                warn!("failed to remove image {image}: {e}");
            }
        }
    }
}
