use kiln_schema::{random_hex, BuildId};
use kiln_squash::split_tag;
use std::path::{Path, PathBuf};

const CONTAINER_SUFFIX_LEN: usize = 16;

/// Image name for a step in this run: the build id is appended to the
/// repository part, keeping any tag. An empty build id leaves the name as is.
///
/// Only the repository is lowercased; build ids are lowercase already.
pub fn unique_step_name(name: &str, build_id: &BuildId) -> String {
    if build_id.is_empty() {
        return name.to_owned();
    }
    match split_tag(name) {
        (repo, Some(tag)) => format!("{}-{build_id}:{tag}", repo.to_lowercase()),
        (repo, None) => format!("{}-{build_id}", repo.to_lowercase()),
    }
}

/// Runs of characters outside `[A-Za-z0-9_-]` (and a leading `/`) become `-`.
fn sanitize(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.trim_start_matches('/').chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            sanitized.push(c);
            in_run = false;
        } else if !in_run {
            sanitized.push('-');
            in_run = true;
        }
    }
    sanitized
}

/// A fresh container name derived from an image name, with a random suffix.
pub fn container_name(image: &str) -> String {
    let suffix = random_hex(image);
    format!("{}.{}", sanitize(image), &suffix[..CONTAINER_SUFFIX_LEN])
}

/// Where the rewritten Dockerfile of a step is written. Steps sharing one
/// Dockerfile in the same run each get their own copy.
pub fn generated_dockerfile_path(
    workdir: &Path,
    dockerfile: &str,
    step_name: &str,
    build_id: &BuildId,
) -> PathBuf {
    let step = sanitize(step_name);
    if build_id.is_empty() {
        workdir.join(format!("{dockerfile}_{step}.generated"))
    } else {
        workdir.join(format!("{dockerfile}_{step}_{build_id}.generated"))
    }
}
