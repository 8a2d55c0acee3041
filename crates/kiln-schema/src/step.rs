use crate::secrets::SecretKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One declared build unit producing one image.
///
/// `depends_on` holds the references exactly as written in the manifest
/// (labels or names). Resolution to step indices happens in
/// [`Manifest::resolve`](crate::Manifest::resolve) and never mutates the step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub label: String,
    pub dockerfile: String,
    pub context: String,
    pub target: Option<String>,
    pub args: BTreeMap<String, String>,
    pub secrets: Vec<Secret>,
    pub depends_on: Vec<String>,
    pub cleanup: Vec<String>,
    pub command: Option<String>,
    pub after_build_command: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub no_cache: bool,
    pub keep: bool,
}

impl Step {
    /// Minimal step with the given name, used as label too.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            label: name.to_owned(),
            dockerfile: "Dockerfile".to_owned(),
            context: ".".to_owned(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| (*d).to_owned()).collect();
        self
    }

    /// Whether this step needs an ephemeral container after its image build.
    pub fn needs_container(&self) -> bool {
        !self.artifacts.is_empty() || !self.cleanup.is_empty() || self.command.is_some()
    }
}

/// A file or directory copied out of the built container onto the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    /// Absolute path inside the image.
    pub source: String,
    /// Host directory, relative to the work directory. The file name comes
    /// from the source.
    pub dest: String,
}

impl Artifact {
    /// Parse `source[:dest]`. A missing destination means the work directory.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.splitn(2, ':');
        let source = parts.next()?.trim();
        if source.is_empty() {
            return None;
        }
        let dest = match parts.next().map(str::trim) {
            Some(d) if !d.is_empty() => d,
            _ => ".",
        };
        Some(Self {
            source: source.to_owned(),
            dest: dest.to_owned(),
        })
    }

    pub fn file_name(&self) -> &str {
        Path::new(self.source.trim_end_matches('/'))
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.source)
    }
}

/// A secret a step's build may fetch from the secret endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub kind: SecretKind,
    /// Provider specific locator: a file path or an environment variable name.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_with_dest() {
        let a = Artifact::parse("/app/bin/server:out/bin").unwrap();
        assert_eq!(a.source, "/app/bin/server");
        assert_eq!(a.dest, "out/bin");
        assert_eq!(a.file_name(), "server");
    }

    #[test]
    fn artifact_without_dest_defaults_to_workdir() {
        let a = Artifact::parse("/app/server.tar.gz").unwrap();
        assert_eq!(a.dest, ".");
        assert_eq!(a.file_name(), "server.tar.gz");
    }

    #[test]
    fn artifact_directory_source_file_name() {
        let a = Artifact::parse("/usr/local/lib/:libs").unwrap();
        assert_eq!(a.file_name(), "lib");
    }

    #[test]
    fn artifact_rejects_empty_source() {
        assert!(Artifact::parse("").is_none());
        assert!(Artifact::parse(":dest").is_none());
    }

    #[test]
    fn needs_container_only_with_post_build_work() {
        let mut step = Step::new("plain");
        assert!(!step.needs_container());
        step.command = Some("ls".to_owned());
        assert!(step.needs_container());

        let mut step = Step::new("cleanup");
        step.cleanup.push("rm -rf /tmp/*".to_owned());
        assert!(step.needs_container());
    }
}
