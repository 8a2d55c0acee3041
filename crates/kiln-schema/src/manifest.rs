//! Build file loading.
//!
//! The build file is YAML with a top-level `build:` section. `_env(NAME)`
//! placeholders are substituted in the raw text before parsing, so they may
//! appear anywhere, including in keys.

use crate::plan::Manifest;
use crate::secrets::{SecretError, SecretKind, SecretProviders};
use crate::step::{Artifact, Secret, Step};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

pub const SCHEMA_VERSION_V1: &str = "2016-02-13";
/// First schema version that carries `secrets`.
pub const SCHEMA_VERSION_V2: &str = "2016-03-14";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read build file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse build file: {0}")]
    ParseYaml(#[from] serde_yaml_ng::Error),
    #[error("unsupported build schema version '{0}'")]
    UnsupportedVersion(String),
    #[error("step name '{0}' is not unique")]
    DuplicateStepName(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("circular dependency between steps: {}", .0.join(", "))]
    CircularDependency(Vec<String>),
    #[error("invalid secret type '{kind}' for secret '{name}'")]
    InvalidSecretType { name: String, kind: String },
    #[error("unsupported secret type '{0}': provider not enabled")]
    UnsupportedSecretType(String),
    #[error("invalid artifact '{artifact}' in step '{step}'")]
    InvalidArtifact { step: String, artifact: String },
    #[error(transparent)]
    Secret(#[from] SecretError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildFile {
    build: BuildSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildSection {
    version: String,
    #[serde(default)]
    work_dir: Option<String>,
    #[serde(default)]
    steps: BTreeMap<String, StepSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StepSection {
    name: String,
    dockerfile: String,
    context: String,
    args: BTreeMap<String, String>,
    artifacts: Vec<String>,
    target: Option<String>,
    cleanup: Option<CleanupSection>,
    depends_on: Vec<String>,
    command: Option<String>,
    after_build_command: Option<String>,
    no_cache: bool,
    keep: bool,
    secrets: BTreeMap<String, SecretSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CleanupSection {
    commands: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SecretSection {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

/// Run-supplied inputs that shape how a build file is read.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Values for `_env(NAME)`. When empty the process environment is used.
    pub env_vars: BTreeMap<String, String>,
    /// Drop cleanup commands: without squashing they would only grow the image.
    pub no_squash: bool,
    /// Providers secrets may be declared against.
    pub secret_providers: Vec<SecretKind>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            env_vars: BTreeMap::new(),
            no_squash: false,
            secret_providers: SecretKind::ALL.to_vec(),
        }
    }
}

/// Replace each `_env(NAME)` with the value of `NAME`.
///
/// The match is non-greedy: `_env(A) _env(B)` is two placeholders. Unknown
/// names substitute the empty string. An unterminated placeholder is left
/// as is.
pub fn substitute_env_placeholders(text: &str, env_vars: &BTreeMap<String, String>) -> String {
    const OPEN: &str = "_env(";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(')') else {
            break;
        };
        let name = &after[..end];
        out.push_str(&rest[..start]);
        let value = if env_vars.is_empty() {
            std::env::var(name).unwrap_or_default()
        } else {
            env_vars.get(name).cloned().unwrap_or_default()
        };
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

pub fn parse_manifest_file(path: &Path, options: &LoadOptions) -> Result<Manifest, ManifestError> {
    info!("using '{}' as build file", path.display());
    let content = std::fs::read_to_string(path)?;
    parse_manifest_str(&content, options)
}

pub fn parse_manifest_str(input: &str, options: &LoadOptions) -> Result<Manifest, ManifestError> {
    let text = substitute_env_placeholders(input, &options.env_vars);
    let file: BuildFile = serde_yaml_ng::from_str(&text)?;
    let section = file.build;

    if section.version != SCHEMA_VERSION_V1 && section.version != SCHEMA_VERSION_V2 {
        return Err(ManifestError::UnsupportedVersion(section.version));
    }
    let with_secrets = section.version == SCHEMA_VERSION_V2;

    let mut providers = SecretProviders::new();
    let mut steps = Vec::with_capacity(section.steps.len());
    for (label, raw) in section.steps {
        steps.push(convert_step(
            label,
            raw,
            with_secrets,
            options,
            &mut providers,
        )?);
    }

    let mut manifest = Manifest::resolve(steps)?;
    manifest.work_dir = section.work_dir;
    manifest.secrets = providers;
    if manifest.is_privileged {
        info!("build file declares cleanup commands; containers will be committed and squashed");
    }
    Ok(manifest)
}

fn convert_step(
    label: String,
    raw: StepSection,
    with_secrets: bool,
    options: &LoadOptions,
    providers: &mut SecretProviders,
) -> Result<Step, ManifestError> {
    let name = if raw.name.is_empty() {
        label.clone()
    } else {
        raw.name
    };

    let mut artifacts = Vec::with_capacity(raw.artifacts.len());
    for spec in &raw.artifacts {
        let artifact = Artifact::parse(spec).ok_or_else(|| ManifestError::InvalidArtifact {
            step: name.clone(),
            artifact: spec.clone(),
        })?;
        artifacts.push(artifact);
    }

    let cleanup = match raw.cleanup {
        Some(c) if !options.no_squash => c.commands,
        Some(_) => {
            debug!("dropping cleanup commands of '{name}': squashing disabled");
            Vec::new()
        }
        None => Vec::new(),
    };

    let mut secrets = Vec::new();
    if with_secrets {
        for (secret_name, s) in raw.secrets {
            let kind =
                SecretKind::from_str(&s.kind).map_err(|_| ManifestError::InvalidSecretType {
                    name: secret_name.clone(),
                    kind: s.kind.clone(),
                })?;
            if !options.secret_providers.contains(&kind) {
                return Err(ManifestError::UnsupportedSecretType(s.kind));
            }
            providers.register(kind, &secret_name, &s.value)?;
            secrets.push(Secret {
                name: secret_name,
                kind,
                value: s.value,
            });
        }
    }

    Ok(Step {
        name,
        label,
        dockerfile: non_empty_or(raw.dockerfile, "Dockerfile"),
        context: non_empty_or(raw.context, "."),
        target: raw.target.filter(|t| !t.is_empty()),
        args: raw.args,
        secrets,
        depends_on: raw.depends_on,
        cleanup,
        command: raw.command.filter(|c| !c.is_empty()),
        after_build_command: raw.after_build_command.filter(|c| !c.is_empty()),
        artifacts,
        no_cache: raw.no_cache,
        keep: raw.keep,
    })
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_owned()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
build:
  version: 2016-03-14
  work_dir: /tmp/kiln
  steps:
    builder:
      name: builder
      dockerfile: Dockerfile.builder
      args:
        RUST_VERSION: "1.80"
      artifacts:
        - /app/target/release/server
        - /app/config.toml:etc
      cleanup:
        commands:
          - rm -rf /root/.cargo/registry
      secrets:
        token:
          type: env
          value: KILN_TEST_TOKEN
    deployment:
      name: app/deploy:1.0
      dockerfile: Dockerfile.deploy
      depends_on:
        - builder
      command: ls /app
      no_cache: true
      keep: true
"#;

    fn level_names(manifest: &Manifest) -> Vec<Vec<String>> {
        manifest.level_names()
    }

    #[test]
    fn parses_sample_build_file() {
        let manifest = parse_manifest_str(SAMPLE, &LoadOptions::default()).unwrap();
        assert_eq!(manifest.steps().len(), 2);
        assert_eq!(manifest.work_dir.as_deref(), Some("/tmp/kiln"));
        assert!(manifest.is_privileged);
        assert_eq!(
            level_names(&manifest),
            vec![vec!["builder".to_owned()], vec!["app/deploy:1.0".to_owned()]]
        );

        let builder = &manifest.steps()[manifest.find_by_label("builder").unwrap()];
        assert_eq!(builder.dockerfile, "Dockerfile.builder");
        assert_eq!(builder.context, ".");
        assert_eq!(builder.args["RUST_VERSION"], "1.80");
        assert_eq!(builder.artifacts.len(), 2);
        assert_eq!(builder.artifacts[0].dest, ".");
        assert_eq!(builder.artifacts[1].dest, "etc");
        assert_eq!(builder.cleanup, vec!["rm -rf /root/.cargo/registry"]);
        assert_eq!(builder.secrets.len(), 1);
        assert_eq!(builder.secrets[0].kind, SecretKind::Env);

        let deploy = &manifest.steps()[manifest.find_by_label("deployment").unwrap()];
        assert_eq!(deploy.label, "deployment");
        assert_eq!(deploy.command.as_deref(), Some("ls /app"));
        assert!(deploy.no_cache);
        assert!(deploy.keep);
    }

    #[test]
    fn secrets_registered_with_provider() {
        let manifest = parse_manifest_str(SAMPLE, &LoadOptions::default()).unwrap();
        assert_eq!(manifest.secrets.provider(SecretKind::Env).len(), 1);
        assert!(manifest.secrets.provider(SecretKind::File).is_empty());
    }

    #[test]
    fn secrets_ignored_under_first_schema_version() {
        let yaml = SAMPLE.replace("2016-03-14", "2016-02-13");
        let manifest = parse_manifest_str(&yaml, &LoadOptions::default()).unwrap();
        assert!(manifest.secrets.is_empty());
        assert!(manifest.steps().iter().all(|s| s.secrets.is_empty()));
    }

    #[test]
    fn unsupported_version_rejected() {
        let yaml = "build:\n  version: 2020-01-01\n  steps: {}\n";
        let err = parse_manifest_str(yaml, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedVersion(ref v) if v == "2020-01-01"));
    }

    #[test]
    fn no_squash_drops_cleanup() {
        let options = LoadOptions {
            no_squash: true,
            ..LoadOptions::default()
        };
        let manifest = parse_manifest_str(SAMPLE, &options).unwrap();
        assert!(!manifest.is_privileged);
        assert!(manifest.steps().iter().all(|s| s.cleanup.is_empty()));
    }

    #[test]
    fn invalid_secret_type_rejected() {
        let yaml = r"
build:
  version: 2016-03-14
  steps:
    a:
      secrets:
        key:
          type: vault
          value: x
";
        let err = parse_manifest_str(yaml, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidSecretType { .. }));
    }

    #[test]
    fn disabled_secret_provider_rejected() {
        let options = LoadOptions {
            secret_providers: vec![SecretKind::File],
            ..LoadOptions::default()
        };
        let err = parse_manifest_str(SAMPLE, &options).unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedSecretType(ref k) if k == "env"));
    }

    #[test]
    fn duplicate_step_names_rejected() {
        let yaml = r"
build:
  version: 2016-02-13
  steps:
    one:
      name: same
    two:
      name: same
";
        let err = parse_manifest_str(yaml, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateStepName(ref n) if n == "same"));
    }

    #[test]
    fn unknown_dependency_label_rejected() {
        let yaml = r"
build:
  version: 2016-02-13
  steps:
    one:
      depends_on: [missing]
";
        let err = parse_manifest_str(yaml, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, ManifestError::UnknownDependency { .. }));
    }

    #[test]
    fn unknown_keys_rejected() {
        let yaml = "build:\n  version: 2016-02-13\n  steps:\n    a:\n      dockerfil: x\n";
        assert!(matches!(
            parse_manifest_str(yaml, &LoadOptions::default()),
            Err(ManifestError::ParseYaml(_))
        ));
    }

    #[test]
    fn env_placeholders_from_supplied_vars() {
        let mut vars = BTreeMap::new();
        vars.insert("TAG".to_owned(), "1.2".to_owned());
        vars.insert("BASE".to_owned(), "alpine".to_owned());
        let out = substitute_env_placeholders("image: _env(BASE):_env(TAG) x_env(NONE)y", &vars);
        assert_eq!(out, "image: alpine:1.2 xy");
    }

    #[test]
    fn env_placeholders_fall_back_to_process_env() {
        std::env::set_var("KILN_TEST_PLACEHOLDER", "from-process");
        let out = substitute_env_placeholders("v: _env(KILN_TEST_PLACEHOLDER)", &BTreeMap::new());
        assert_eq!(out, "v: from-process");
        std::env::remove_var("KILN_TEST_PLACEHOLDER");
    }

    #[test]
    fn unterminated_placeholder_left_alone() {
        let vars = BTreeMap::from([("A".to_owned(), "1".to_owned())]);
        assert_eq!(substitute_env_placeholders("x _env(A", &vars), "x _env(A");
    }

    #[test]
    fn placeholders_substituted_before_parsing() {
        let yaml = r"
build:
  version: 2016-02-13
  steps:
    app:
      name: _env(APP_NAME)
      args:
        VERSION: _env(APP_VERSION)
";
        let options = LoadOptions {
            env_vars: BTreeMap::from([
                ("APP_NAME".to_owned(), "web".to_owned()),
                ("APP_VERSION".to_owned(), "3".to_owned()),
            ]),
            ..LoadOptions::default()
        };
        let manifest = parse_manifest_str(yaml, &options).unwrap();
        assert_eq!(manifest.steps()[0].name, "web");
        assert_eq!(manifest.steps()[0].args["VERSION"], "3");
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.yml");
        std::fs::write(&path, SAMPLE).unwrap();
        let manifest = parse_manifest_file(&path, &LoadOptions::default()).unwrap();
        assert_eq!(manifest.steps().len(), 2);
        assert!(matches!(
            parse_manifest_file(&dir.path().join("missing.yml"), &LoadOptions::default()),
            Err(ManifestError::Io(_))
        ));
    }
}
