//! Layer squashing for images exported in the daemon's legacy save format.
//!
//! An export is a tar holding a `repositories` tag map plus one directory per
//! layer (`VERSION`, `json`, `layer.tar`). `Squasher` picks a squash point in
//! the layer chain, merges every descendant into one new layer while honouring
//! whiteout markers, and writes a shorter but equivalent export.

pub mod export;
pub mod squasher;
pub mod tree;

pub use export::{parse_tag, split_tag, validate_tag, Export, LayerConfig, Repositories};
pub use squasher::{SquashFrom, SquashReport, Squasher};
pub use tree::{EntryKind, LayerTree, TreeEntry, OPAQUE_MARKER, WHITEOUT_PREFIX};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SquashError {
    #[error("squash I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid layer metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad tag format: {0}")]
    BadTag(String),
    #[error("export has no layers")]
    EmptyExport,
    #[error(
        "repository '{0}' holds multiple images; export a specific image id or tag instead"
    )]
    MultipleImages(String),
    #[error("layer {0} has more than one child; branched exports are not supported")]
    Branched(String),
    #[error("export must contain exactly one root layer, found {0}")]
    RootCount(usize),
    #[error("{0} layers are not reachable from the root layer")]
    Unreachable(usize),
    #[error("layer {id} references missing parent {parent}")]
    MissingParent { id: String, parent: String },
    #[error("no layer matching '{0}'")]
    LayerNotFound(String),
    #[error("layer {id} is missing {file}")]
    MissingLayerFile { id: String, file: &'static str },
    #[error("invalid header type {kind} for '{path}'")]
    InvalidEntryType { path: String, kind: String },
    #[error("squash interrupted")]
    Interrupted,
}
