use crate::export::{parse_tag, Export, LayerConfig};
use crate::tree::{read_layer, LayerTree};
use crate::SquashError;
use chrono::{SecondsFormat, Utc};
use kiln_schema::{random_hex, LayerId};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

const HISTORY_COMMAND_WIDTH: usize = 60;

/// Where to start merging, overriding automatic squash point detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SquashFrom {
    Root,
    Layer(String),
}

impl FromStr for SquashFrom {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s == "root" {
            SquashFrom::Root
        } else {
            SquashFrom::Layer(s.to_owned())
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SquashReport {
    pub squash_point: LayerId,
    /// `None` when the squash point had no descendants.
    pub new_layer: Option<LayerId>,
    pub merged_layers: usize,
    pub layer_count: usize,
    pub tag: Option<String>,
}

/// Merges the layers above a squash point of an exported image into one.
///
/// Working files live in a temporary directory owned by a single
/// [`Squasher::squash`] call; it is removed when the call returns, whether it
/// succeeds, fails or is interrupted.
#[derive(Debug, Clone, Default)]
pub struct Squasher {
    from: Option<SquashFrom>,
    interrupted: Option<fn() -> bool>,
    temp_root: Option<PathBuf>,
}

impl Squasher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_layer(mut self, from: SquashFrom) -> Self {
        self.from = Some(from);
        self
    }

    /// Polled between layers; returning `true` aborts with
    /// [`SquashError::Interrupted`].
    #[must_use]
    pub fn interrupt_check(mut self, check: fn() -> bool) -> Self {
        self.interrupted = Some(check);
        self
    }

    #[must_use]
    pub fn temp_root(mut self, dir: PathBuf) -> Self {
        self.temp_root = Some(dir);
        self
    }

    fn check_interrupted(&self) -> Result<(), SquashError> {
        match self.interrupted {
            Some(check) if check() => Err(SquashError::Interrupted),
            _ => Ok(()),
        }
    }

    /// Squash the export read from `input` and write the result to `output`.
    pub fn squash<R: Read, W: Write>(
        &self,
        input: R,
        output: W,
        tag: Option<&str>,
    ) -> Result<SquashReport, SquashError> {
        let tag = tag.map(parse_tag).transpose()?;

        let workdir = match &self.temp_root {
            Some(root) => tempfile::Builder::new()
                .prefix("kiln-squash")
                .tempdir_in(root)?,
            None => tempfile::Builder::new().prefix("kiln-squash").tempdir()?,
        };
        debug!("squashing in {}", workdir.path().display());

        let mut export = Export::load(input, &workdir.path().join("export"))?;
        self.check_interrupted()?;

        let point = self.squash_point(&export)?;
        let point_id = export.layers()[point].id.clone();
        let descendants: Vec<LayerConfig> = export.layers()[point + 1..].to_vec();
        let merged_layers = descendants.len();

        let new_layer = if descendants.is_empty() {
            info!(
                "layer {} has no descendants; nothing to squash",
                point_id.short()
            );
            None
        } else {
            let new_id = LayerId::new(random_hex(point_id.as_str()));
            debug!(
                "inserting new layer {} after {}",
                new_id.short(),
                point_id.short()
            );

            let mut tree = LayerTree::new();
            for layer in &descendants {
                self.check_interrupted()?;
                let body_dir = workdir.path().join("bodies").join(layer.id.as_str());
                let file = File::open(export.layer_tar(&layer.id)?)?;
                tree.apply(read_layer(io::BufReader::new(file), &body_dir)?);
            }
            self.check_interrupted()?;

            let layer_dir = export.layer_dir(&new_id);
            fs::create_dir_all(&layer_dir)?;
            debug!("packing squashed layer {}", new_id.short());
            let packed = tree.pack(BufWriter::new(File::create(layer_dir.join("layer.tar"))?))?;
            packed.into_inner().map_err(io::IntoInnerError::into_error)?;

            let last = &descendants[descendants.len() - 1];
            let config = squashed_config(last, &new_id, &point_id);
            export.replace_descendants(point, config);
            Some(new_id)
        };

        let leaf = export.layers()[export.layers().len() - 1].id.clone();
        let tag_label = tag.map(|(repo, tag)| {
            debug!("tagging {} as {repo}:{tag}", leaf.short());
            export.set_tag(&repo, &tag, &leaf);
            format!("{repo}:{tag}")
        });

        export.write(output)?;
        log_history(&export, new_layer.as_ref());

        Ok(SquashReport {
            squash_point: point_id,
            new_layer,
            merged_layers,
            layer_count: export.layers().len(),
            tag: tag_label,
        })
    }

    /// Squash a tar on disk; without `output` the result goes to stdout.
    ///
    /// `output` only appears once the squashed image is complete.
    pub fn squash_file(
        &self,
        input: &Path,
        output: Option<&Path>,
        tag: Option<&str>,
    ) -> Result<SquashReport, SquashError> {
        let reader = io::BufReader::new(File::open(input)?);
        match output {
            Some(path) => {
                debug!("writing squashed image to {}", path.display());
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let staged = tempfile::Builder::new()
                    .prefix(".kiln-squash-out")
                    .tempfile_in(dir)?;
                let mut writer = BufWriter::new(staged);
                let report = self.squash(reader, &mut writer, tag)?;
                let staged = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
                staged.persist(path).map_err(|e| e.error)?;
                Ok(report)
            }
            None => {
                let stdout = io::stdout();
                let mut lock = stdout.lock();
                let report = self.squash(reader, &mut lock, tag)?;
                lock.flush()?;
                Ok(report)
            }
        }
    }

    fn squash_point(&self, export: &Export) -> Result<usize, SquashError> {
        match &self.from {
            Some(SquashFrom::Root) => Ok(0),
            Some(SquashFrom::Layer(id)) => export.position(id),
            None => Ok(export
                .last_squash()
                .or_else(|| export.first_from())
                .unwrap_or(0)),
        }
    }
}

fn squashed_config(last: &LayerConfig, new_id: &LayerId, parent: &LayerId) -> LayerConfig {
    let mut config = last.clone();
    config.id = new_id.clone();
    config.parent = Some(parent.clone());
    config.created = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    config.extra.remove("Size");
    let marker = format!("#(squash) from {}", parent.short());
    config.set_command(&["/bin/sh", "-c", &marker]);
    config
}

fn log_history(export: &Export, new_layer: Option<&LayerId>) {
    for layer in export.layers() {
        let cmd: String = layer.command().chars().take(HISTORY_COMMAND_WIDTH).collect();
        let marker = if new_layer == Some(&layer.id) { "->" } else { "- " };
        debug!("  {marker} {} {cmd}", layer.id.short());
    }
}
