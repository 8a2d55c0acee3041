//! Build file parsing, step model, dependency leveling, and secret providers for Kiln.
//!
//! This crate is the schema layer: YAML build file loading with `_env(NAME)`
//! substitution (`parse_manifest_file`), the immutable `Step` model, the
//! validated and leveled `Manifest`, and the `file`/`env` secret providers
//! the secret endpoint serves from.

pub mod manifest;
pub mod plan;
pub mod secrets;
pub mod step;
pub mod types;

pub use manifest::{
    parse_manifest_file, parse_manifest_str, substitute_env_placeholders, LoadOptions,
    ManifestError, SCHEMA_VERSION_V1, SCHEMA_VERSION_V2,
};
pub use plan::{build_levels, Manifest};
pub use secrets::{
    parse_provider_list, SecretError, SecretKind, SecretProvider, SecretProviders, SecretStore,
};
pub use step::{Artifact, Secret, Step};
pub use types::{random_hex, BuildId, LayerId};
