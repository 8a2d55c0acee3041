use crate::daemon::{BuildRequest, ExecOutput, ImageDaemon};
use crate::DaemonError;
use kiln_schema::random_hex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const BUILD_INFO: &str = "etc/kiln-build";
const CLEANUP_TARGET: &str = "var/cache/kiln-mock";

#[derive(Debug, Clone)]
struct MockFile {
    content: Vec<u8>,
    mode: u32,
}

#[derive(Debug, Clone)]
struct MockImage {
    id: String,
    dockerfile: String,
    build_args: BTreeMap<String, String>,
    committed: bool,
}

#[derive(Debug, Clone)]
struct MockContainer {
    image: String,
    running: bool,
}

#[derive(Debug, Default)]
struct MockState {
    images: BTreeMap<String, MockImage>,
    containers: BTreeMap<String, MockContainer>,
    calls: Vec<String>,
}

/// In-memory daemon. Every built image carries the files registered with
/// [`MockDaemon::with_file`], and exports as a small legacy save archive.
#[derive(Default)]
pub struct MockDaemon {
    state: Mutex<MockState>,
    files: BTreeMap<String, MockFile>,
    failing_builds: BTreeSet<String>,
    slow_builds: BTreeMap<String, Duration>,
    exec_exit_codes: BTreeMap<String, i32>,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a file at `path` (absolute, inside the image) in every image.
    #[must_use]
    pub fn with_file(mut self, path: &str, content: &str, mode: u32) -> Self {
        self.files.insert(
            path.trim_start_matches('/').to_owned(),
            MockFile {
                content: content.as_bytes().to_vec(),
                mode,
            },
        );
        self
    }

    /// Fail any build whose image name starts with `prefix`.
    #[must_use]
    pub fn failing_build(mut self, prefix: &str) -> Self {
        self.failing_builds.insert(prefix.to_owned());
        self
    }

    /// Wait `delay` before reading the Dockerfile of any build whose image
    /// name starts with `prefix`.
    #[must_use]
    pub fn slow_build(mut self, prefix: &str, delay: Duration) -> Self {
        self.slow_builds.insert(prefix.to_owned(), delay);
        self
    }

    /// Exit code returned for an exec of exactly `cmd` (joined by spaces).
    #[must_use]
    pub fn with_exec_exit_code(mut self, cmd: &str, code: i32) -> Self {
        self.exec_exit_codes.insert(cmd.to_owned(), code);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, DaemonError> {
        self.state
            .lock()
            .map_err(|e| DaemonError::Failed(format!("mutex poisoned: {e}")))
    }

    /// Every daemon call so far, e.g. `build app-1a2b`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.lock()
            .map(|s| s.images.contains_key(name))
            .unwrap_or(false)
    }

    pub fn image_names(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.images.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The Dockerfile text an image was built from.
    pub fn dockerfile_of(&self, name: &str) -> Option<String> {
        self.lock()
            .ok()
            .and_then(|s| s.images.get(name).map(|i| i.dockerfile.clone()))
    }

    pub fn build_args_of(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.lock()
            .ok()
            .and_then(|s| s.images.get(name).map(|i| i.build_args.clone()))
    }

    pub fn container_count(&self) -> usize {
        self.lock().map(|s| s.containers.len()).unwrap_or(0)
    }

    fn stat_mode(&self, path: &str) -> Option<u32> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if let Some(file) = self.files.get(path) {
            return Some(file.mode & 0o7777);
        }
        let prefix = format!("{path}/");
        self.files
            .keys()
            .any(|k| k.starts_with(&prefix))
            .then_some(0o755)
    }

    fn export_archive(&self, name: &str, image: &MockImage) -> Result<Vec<u8>, DaemonError> {
        let root_id = random_hex("mock-root");
        let build_id = image.id.clone();

        let mut root_files: Vec<(String, &[u8], u32)> = self
            .files
            .iter()
            .map(|(p, f)| (p.clone(), f.content.as_slice(), f.mode))
            .collect();
        root_files.push((CLEANUP_TARGET.to_owned(), b"cache", 0o644));
        let info = format!("built as {name}\n");

        let mut layers = vec![
            (
                root_id.clone(),
                None,
                "#(nop) ADD file:mock-rootfs in /".to_owned(),
                layer_tar(&root_files)?,
            ),
            (
                build_id.clone(),
                Some(root_id),
                "/bin/sh -c mock build".to_owned(),
                layer_tar(&[(BUILD_INFO.to_owned(), info.as_bytes(), 0o644)])?,
            ),
        ];
        if image.committed {
            let whiteout = format!("var/cache/.wh.{}", CLEANUP_TARGET.rsplit('/').next().unwrap_or(""));
            layers.push((
                random_hex("mock-commit"),
                Some(build_id),
                "/bin/sh".to_owned(),
                layer_tar(&[(whiteout, b"".as_slice(), 0o644)])?,
            ));
        }

        let mut builder = tar::Builder::new(Vec::new());
        if !image.committed {
            let leaf = layers.last().map(|l| l.0.clone()).unwrap_or_default();
            let (repo, tag) = split_name(name);
            let repositories = serde_json::json!({ repo: { tag: leaf } });
            append(&mut builder, "repositories", repositories.to_string().as_bytes(), 0o644)?;
        }
        for (id, parent, cmd, data) in &layers {
            let mut config = serde_json::json!({
                "id": id,
                "created": "2016-03-14T00:00:00Z",
                "container_config": { "Cmd": ["/bin/sh", "-c", cmd] },
            });
            if let Some(parent) = parent {
                config["parent"] = serde_json::Value::String(parent.clone());
            }
            append(&mut builder, &format!("{id}/VERSION"), b"1.0", 0o644)?;
            append(&mut builder, &format!("{id}/json"), config.to_string().as_bytes(), 0o644)?;
            append(&mut builder, &format!("{id}/layer.tar"), data, 0o644)?;
        }
        Ok(builder.into_inner()?)
    }
}

fn split_name(name: &str) -> (String, String) {
    match name.rfind(':') {
        Some(idx) if !name[idx + 1..].contains('/') => {
            (name[..idx].to_owned(), name[idx + 1..].to_owned())
        }
        _ => (name.to_owned(), "latest".to_owned()),
    }
}

fn append(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    data: &[u8],
    mode: u32,
) -> Result<(), DaemonError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

fn layer_tar(files: &[(String, &[u8], u32)]) -> Result<Vec<u8>, DaemonError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data, mode) in files {
        append(&mut builder, path, data, *mode)?;
    }
    Ok(builder.into_inner()?)
}

impl ImageDaemon for MockDaemon {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn build_image(&self, request: &BuildRequest) -> Result<(), DaemonError> {
        if let Some(delay) = self
            .slow_builds
            .iter()
            .find(|(p, _)| request.image.starts_with(p.as_str()))
            .map(|(_, d)| *d)
        {
            std::thread::sleep(delay);
        }
        let dockerfile = std::fs::read_to_string(&request.dockerfile)?;
        let mut state = self.lock()?;
        state.calls.push(format!("build {}", request.image));
        if self
            .failing_builds
            .iter()
            .any(|p| request.image.starts_with(p.as_str()))
        {
            return Err(DaemonError::CommandFailed {
                command: "mock build".to_owned(),
                status: "exit code 1".to_owned(),
                stderr: format!("build of {} failed", request.image),
            });
        }
        state.images.insert(
            request.image.clone(),
            MockImage {
                id: random_hex(&request.image),
                dockerfile,
                build_args: request.build_args.clone(),
                committed: false,
            },
        );
        Ok(())
    }

    fn create_container(
        &self,
        image: &str,
        name: &str,
        _cmd: &[String],
    ) -> Result<String, DaemonError> {
        let mut state = self.lock()?;
        state.calls.push(format!("create {name}"));
        if !state.images.contains_key(image) {
            return Err(DaemonError::ImageNotFound(image.to_owned()));
        }
        let id = random_hex(name)[..12].to_owned();
        state.containers.insert(
            id.clone(),
            MockContainer {
                image: image.to_owned(),
                running: false,
            },
        );
        Ok(id)
    }

    fn start_container(&self, id: &str) -> Result<(), DaemonError> {
        let mut state = self.lock()?;
        state.calls.push(format!("start {id}"));
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| DaemonError::ContainerNotFound(id.to_owned()))?;
        container.running = true;
        Ok(())
    }

    fn stop_container(&self, id: &str) -> Result<(), DaemonError> {
        let mut state = self.lock()?;
        state.calls.push(format!("stop {id}"));
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| DaemonError::ContainerNotFound(id.to_owned()))?;
        container.running = false;
        Ok(())
    }

    fn remove_container(&self, id: &str, force: bool, _volumes: bool) -> Result<(), DaemonError> {
        let mut state = self.lock()?;
        state.calls.push(format!("rm {id}"));
        match state.containers.get(id) {
            None => Err(DaemonError::ContainerNotFound(id.to_owned())),
            Some(c) if c.running && !force => Err(DaemonError::Failed(format!(
                "container {id} is running; stop it or force removal"
            ))),
            Some(_) => {
                state.containers.remove(id);
                Ok(())
            }
        }
    }

    fn exec(&self, id: &str, cmd: &[String], _tty: bool) -> Result<ExecOutput, DaemonError> {
        let joined = cmd.join(" ");
        let mut state = self.lock()?;
        state.calls.push(format!("exec {id} {joined}"));
        match state.containers.get(id) {
            None => return Err(DaemonError::ContainerNotFound(id.to_owned())),
            Some(c) if !c.running => return Err(DaemonError::NotRunning(id.to_owned())),
            Some(_) => {}
        }

        if let Some(code) = self.exec_exit_codes.get(&joined) {
            return Ok(ExecOutput {
                exit_code: *code,
                stdout: String::new(),
                stderr: format!("mock: '{joined}' exited with {code}"),
            });
        }
        if let [stat, _, path] = cmd {
            if stat == "stat" {
                return Ok(match self.stat_mode(path) {
                    Some(mode) => ExecOutput {
                        exit_code: 0,
                        stdout: format!("'{mode:o}'\n"),
                        stderr: String::new(),
                    },
                    None => ExecOutput {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: format!("stat: cannot stat '{path}'"),
                    },
                });
            }
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("mock-exec: {joined}\n"),
            stderr: String::new(),
        })
    }

    fn commit_container(&self, id: &str) -> Result<String, DaemonError> {
        let mut state = self.lock()?;
        state.calls.push(format!("commit {id}"));
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| DaemonError::ContainerNotFound(id.to_owned()))?;
        let base = state
            .images
            .get(&container.image)
            .cloned()
            .ok_or_else(|| DaemonError::ImageNotFound(container.image.clone()))?;
        let image_id = format!("sha256:{}", random_hex(id));
        state.images.insert(
            image_id.clone(),
            MockImage {
                committed: true,
                ..base
            },
        );
        Ok(image_id)
    }

    fn export_image(&self, image: &str, out: &mut dyn Write) -> Result<(), DaemonError> {
        let found = {
            let mut state = self.lock()?;
            state.calls.push(format!("save {image}"));
            state.images.get(image).cloned()
        };
        let found = found.ok_or_else(|| DaemonError::ImageNotFound(image.to_owned()))?;
        out.write_all(&self.export_archive(image, &found)?)?;
        Ok(())
    }

    fn load_image(&self, input: &mut dyn Read) -> Result<(), DaemonError> {
        let mut repositories: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut layer_count = 0usize;
        let mut archive = tar::Archive::new(input);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            if path == "repositories" {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                repositories = serde_json::from_slice(&data)
                    .map_err(|e| DaemonError::Failed(format!("invalid repositories: {e}")))?;
            } else if path.ends_with("/layer.tar") {
                layer_count += 1;
            }
        }

        let mut state = self.lock()?;
        for (repo, tags) in repositories {
            for (tag, id) in tags {
                let name = if tag == "latest" && !repo.contains(':') {
                    repo.clone()
                } else {
                    format!("{repo}:{tag}")
                };
                state.calls.push(format!("load {name} ({layer_count} layers)"));
                let previous = state.images.get(&name).cloned();
                state.images.insert(
                    name,
                    MockImage {
                        id,
                        dockerfile: previous
                            .as_ref()
                            .map(|p| p.dockerfile.clone())
                            .unwrap_or_default(),
                        build_args: previous.map(|p| p.build_args).unwrap_or_default(),
                        committed: false,
                    },
                );
            }
        }
        Ok(())
    }

    fn copy_from_container(
        &self,
        id: &str,
        path: &str,
        out: &mut dyn Write,
    ) -> Result<(), DaemonError> {
        {
            let mut state = self.lock()?;
            state.calls.push(format!("cp {id}:{path}"));
            if !state.containers.contains_key(id) {
                return Err(DaemonError::ContainerNotFound(id.to_owned()));
            }
        }

        let wanted = path.trim_start_matches('/').trim_end_matches('/');
        let base = wanted.rsplit('/').next().unwrap_or(wanted);
        let mut builder = tar::Builder::new(Vec::new());

        if let Some(file) = self.files.get(wanted) {
            append(&mut builder, base, &file.content, file.mode)?;
        } else {
            let prefix = format!("{wanted}/");
            let children: Vec<(&String, &MockFile)> = self
                .files
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .collect();
            if children.is_empty() {
                return Err(DaemonError::PathNotFound {
                    container: id.to_owned(),
                    path: path.to_owned(),
                });
            }
            let mut dirs = BTreeSet::new();
            for (key, _) in &children {
                let rel = &key[prefix.len()..];
                let mut acc = base.to_owned();
                dirs.insert(acc.clone());
                let parts: Vec<&str> = rel.split('/').collect();
                for part in &parts[..parts.len() - 1] {
                    acc = format!("{acc}/{part}");
                    dirs.insert(acc.clone());
                }
            }
            for dir in &dirs {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, format!("{dir}/"), std::io::empty())?;
            }
            for (key, file) in children {
                let rel = &key[prefix.len()..];
                append(&mut builder, &format!("{base}/{rel}"), &file.content, file.mode)?;
            }
        }

        out.write_all(&builder.into_inner()?)?;
        Ok(())
    }

    fn remove_image(&self, image: &str, force: bool, _no_prune: bool) -> Result<(), DaemonError> {
        let mut state = self.lock()?;
        state.calls.push(format!("rmi {image}"));
        if state.images.remove(image).is_none() && !force {
            return Err(DaemonError::ImageNotFound(image.to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request(dir: &Path, image: &str) -> BuildRequest {
        let dockerfile = dir.join("Dockerfile");
        std::fs::write(&dockerfile, "FROM alpine\n").unwrap();
        BuildRequest {
            image: image.to_owned(),
            dockerfile,
            context: dir.to_path_buf(),
            ..BuildRequest::default()
        }
    }

    #[test]
    fn build_records_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::new();
        daemon.build_image(&request(dir.path(), "app")).unwrap();
        assert!(daemon.has_image("app"));
        assert_eq!(daemon.dockerfile_of("app").unwrap(), "FROM alpine\n");
        assert_eq!(daemon.calls(), vec!["build app"]);
    }

    #[test]
    fn failing_build_configured_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::new().failing_build("broken");
        assert!(daemon.build_image(&request(dir.path(), "broken-1")).is_err());
        assert!(!daemon.has_image("broken-1"));
    }

    #[test]
    fn exec_requires_running_container() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::new();
        daemon.build_image(&request(dir.path(), "app")).unwrap();
        let id = daemon.create_container("app", "app.x", &[]).unwrap();
        let cmd = vec!["ls".to_owned()];
        assert!(matches!(daemon.exec(&id, &cmd, false), Err(DaemonError::NotRunning(_))));
        daemon.start_container(&id).unwrap();
        assert!(daemon.exec(&id, &cmd, false).unwrap().success());
    }

    #[test]
    fn stat_reports_octal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::new().with_file("/app/run.sh", "#!/bin/sh", 0o750);
        daemon.build_image(&request(dir.path(), "app")).unwrap();
        let id = daemon.create_container("app", "app.x", &[]).unwrap();
        daemon.start_container(&id).unwrap();
        let cmd: Vec<String> = ["stat", "--format='%a'", "/app/run.sh"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        assert_eq!(daemon.exec(&id, &cmd, false).unwrap().stdout, "'750'\n");
    }

    #[test]
    fn copy_directory_as_tar() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::new()
            .with_file("/app/dist/a.js", "a", 0o644)
            .with_file("/app/dist/lib/b.js", "b", 0o644);
        daemon.build_image(&request(dir.path(), "app")).unwrap();
        let id = daemon.create_container("app", "app.x", &[]).unwrap();

        let mut out = Vec::new();
        daemon.copy_from_container(&id, "/app/dist", &mut out).unwrap();
        let mut names = Vec::new();
        for entry in tar::Archive::new(out.as_slice()).entries().unwrap() {
            names.push(entry.unwrap().path().unwrap().to_string_lossy().into_owned());
        }
        assert!(names.contains(&"dist/a.js".to_owned()));
        assert!(names.contains(&"dist/lib/b.js".to_owned()));
        assert!(names.iter().any(|n| n.trim_end_matches('/') == "dist/lib"));

        assert!(matches!(
            daemon.copy_from_container(&id, "/missing", &mut Vec::new()),
            Err(DaemonError::PathNotFound { .. })
        ));
    }

    #[test]
    fn export_then_load_registers_tag() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = MockDaemon::new();
        daemon.build_image(&request(dir.path(), "web:1.0")).unwrap();
        let mut export = Vec::new();
        daemon.export_image("web:1.0", &mut export).unwrap();
        daemon.remove_image("web:1.0", false, false).unwrap();
        assert!(!daemon.has_image("web:1.0"));

        daemon.load_image(&mut export.as_slice()).unwrap();
        assert!(daemon.has_image("web:1.0"));
    }

    #[test]
    fn remove_missing_image_fails_unless_forced() {
        let daemon = MockDaemon::new();
        assert!(daemon.remove_image("ghost", false, false).is_err());
        assert!(daemon.remove_image("ghost", true, false).is_ok());
    }
}
