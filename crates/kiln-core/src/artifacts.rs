use crate::CoreError;
use kiln_schema::Manifest;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Host paths that artifact extraction will create and that did not exist
/// before the build. For each artifact the first missing component of
/// `workdir/dest/<source file name>` is recorded; removing these afterwards
/// removes everything the build wrote for artifacts.
pub fn collect_host_artifact_roots(workdir: &Path, manifest: &Manifest) -> Vec<PathBuf> {
    let workdir = normalize(workdir);
    let mut roots = Vec::new();
    for step in manifest.steps() {
        for artifact in &step.artifacts {
            let target = normalize(&workdir.join(&artifact.dest).join(artifact.file_name()));
            let (mut current, rest) = match target.strip_prefix(&workdir) {
                Ok(rel) => (workdir.clone(), rel.to_path_buf()),
                Err(_) => (PathBuf::new(), target.clone()),
            };
            for part in rest.components() {
                current.push(part);
                if !current.exists() {
                    if !roots.contains(&current) {
                        roots.push(current.clone());
                    }
                    break;
                }
            }
        }
    }
    roots
}

/// Parse the output of `stat --format='%a'` as octal permission bits.
pub fn parse_stat_mode(output: &str) -> Option<u32> {
    let cleaned: String = output
        .chars()
        .filter(|c| *c != '\'' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    u32::from_str_radix(&cleaned, 8).ok()
}

fn safe_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

/// Expand an artifact tar stream under `dest`.
///
/// Only directories and regular files are accepted. With `mode`, every
/// extracted file gets those permission bits plus owner `rwx`. Returns the
/// files written.
pub fn extract_artifact_tar<R: Read>(
    reader: R,
    dest: &Path,
    mode: Option<u32>,
) -> Result<Vec<PathBuf>, CoreError> {
    fs::create_dir_all(dest)?;
    let mut written = Vec::new();
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let Some(rel) = safe_relative(&raw) else {
            return Err(CoreError::InvalidHeaderType {
                path: raw.display().to_string(),
                kind: "escaping path".to_owned(),
            });
        };
        let target = dest.join(&rel);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&target)?;
                io::copy(&mut entry, &mut file)?;
                if let Some(mode) = mode {
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode | 0o700))?;
                }
                debug!("extracted {}", target.display());
                written.push(target);
            }
            other => {
                return Err(CoreError::InvalidHeaderType {
                    path: rel.display().to_string(),
                    kind: format!("{other:?}"),
                });
            }
        }
    }
    Ok(written)
}
