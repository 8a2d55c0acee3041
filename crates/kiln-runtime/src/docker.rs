use crate::daemon::{BuildRequest, DaemonConfig, ExecOutput, ImageDaemon};
use crate::DaemonError;
use std::io::{self, Read, Write};
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// Backend that drives the daemon through its command-line client.
pub struct DockerCli {
    config: DaemonConfig,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(DaemonConfig::default())
    }
}

impl DockerCli {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(global_args(&self.config));
        cmd
    }

    fn describe(&self, args: &[String]) -> String {
        let sub = args.first().map_or("", String::as_str);
        format!("{} {sub}", self.config.binary)
    }

    fn run(&self, args: &[String]) -> Result<Output, DaemonError> {
        debug!("{} {}", self.config.binary, args.join(" "));
        let output = self.command().args(args).output()?;
        self.check(args, &output)?;
        Ok(output)
    }

    fn check(&self, args: &[String], output: &Output) -> Result<(), DaemonError> {
        if output.status.success() {
            return Ok(());
        }
        Err(DaemonError::CommandFailed {
            command: self.describe(args),
            status: describe_status(output.status.code()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    /// Run a command whose stdout is a stream (save, cp).
    fn stream_out(&self, args: &[String], out: &mut dyn Write) -> Result<(), DaemonError> {
        debug!("{} {}", self.config.binary, args.join(" "));
        let mut child = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        if let Some(mut stdout) = child.stdout.take() {
            io::copy(&mut stdout, out)?;
        }
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(DaemonError::CommandFailed {
                command: self.describe(args),
                status: describe_status(status.code()),
                stderr: String::new(),
            })
        }
    }
}

fn describe_status(code: Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_owned(), |c| format!("exit code {c}"))
}

fn to_args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

/// Connection flags placed before every subcommand.
pub fn global_args(config: &DaemonConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(host) = &config.host {
        args.push("-H".to_owned());
        args.push(host.clone());
    }
    if config.use_tls {
        args.push("--tlsverify".to_owned());
        if let Some(dir) = &config.cert_path {
            for (flag, file) in [
                ("--tlscacert", "ca.pem"),
                ("--tlscert", "cert.pem"),
                ("--tlskey", "key.pem"),
            ] {
                args.push(flag.to_owned());
                args.push(dir.join(file).display().to_string());
            }
        }
    }
    args
}

pub fn build_args(request: &BuildRequest) -> Vec<String> {
    let mut args = to_args(&["build", "-t", &request.image]);
    args.push("-f".to_owned());
    args.push(request.dockerfile.display().to_string());
    for (key, value) in &request.build_args {
        args.push("--build-arg".to_owned());
        args.push(format!("{key}={value}"));
    }
    if request.no_cache {
        args.push("--no-cache".to_owned());
    }
    if request.suppress_output {
        args.push("--quiet".to_owned());
    }
    args.push(format!("--rm={}", request.remove_intermediate));
    if request.force_remove_intermediate {
        args.push("--force-rm".to_owned());
    }
    if let Some(network) = &request.network {
        args.push("--network".to_owned());
        args.push(network.clone());
    }
    if let Some(memory) = request.memory {
        args.push("--memory".to_owned());
        args.push(memory.to_string());
    }
    if let Some(shares) = request.cpu_shares {
        args.push("--cpu-shares".to_owned());
        args.push(shares.to_string());
    }
    if let Some(cpus) = &request.cpuset_cpus {
        args.push("--cpuset-cpus".to_owned());
        args.push(cpus.clone());
    }
    args.push(request.context.display().to_string());
    args
}

pub fn create_args(image: &str, name: &str, cmd: &[String]) -> Vec<String> {
    let mut args = to_args(&["create", "-t", "--name", name, image]);
    args.extend(cmd.iter().cloned());
    args
}

pub fn exec_args(id: &str, cmd: &[String], tty: bool) -> Vec<String> {
    let mut args = vec!["exec".to_owned()];
    if tty {
        args.push("-t".to_owned());
    }
    args.push(id.to_owned());
    args.extend(cmd.iter().cloned());
    args
}

pub fn remove_container_args(id: &str, force: bool, volumes: bool) -> Vec<String> {
    let mut args = vec!["rm".to_owned()];
    if force {
        args.push("-f".to_owned());
    }
    if volumes {
        args.push("-v".to_owned());
    }
    args.push(id.to_owned());
    args
}

pub fn remove_image_args(image: &str, force: bool, no_prune: bool) -> Vec<String> {
    let mut args = vec!["rmi".to_owned()];
    if force {
        args.push("-f".to_owned());
    }
    if no_prune {
        args.push("--no-prune".to_owned());
    }
    args.push(image.to_owned());
    args
}

impl ImageDaemon for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn build_image(&self, request: &BuildRequest) -> Result<(), DaemonError> {
        let args = build_args(request);
        debug!("{} {}", self.config.binary, args.join(" "));
        let status = self.command().args(&args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(DaemonError::CommandFailed {
                command: self.describe(&args),
                status: describe_status(status.code()),
                stderr: format!("building {}", request.image),
            })
        }
    }

    fn create_container(
        &self,
        image: &str,
        name: &str,
        cmd: &[String],
    ) -> Result<String, DaemonError> {
        let output = self.run(&create_args(image, name, cmd))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn start_container(&self, id: &str) -> Result<(), DaemonError> {
        self.run(&to_args(&["start", id])).map(|_| ())
    }

    fn stop_container(&self, id: &str) -> Result<(), DaemonError> {
        self.run(&to_args(&["stop", "-t", "0", id])).map(|_| ())
    }

    fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<(), DaemonError> {
        self.run(&remove_container_args(id, force, volumes))
            .map(|_| ())
    }

    fn exec(&self, id: &str, cmd: &[String], tty: bool) -> Result<ExecOutput, DaemonError> {
        let args = exec_args(id, cmd, tty);
        debug!("{} {}", self.config.binary, args.join(" "));
        let output = self.command().args(&args).output()?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn commit_container(&self, id: &str) -> Result<String, DaemonError> {
        let output = self.run(&to_args(&["commit", id]))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn export_image(&self, image: &str, out: &mut dyn Write) -> Result<(), DaemonError> {
        self.stream_out(&to_args(&["save", image]), out)
    }

    fn load_image(&self, input: &mut dyn Read) -> Result<(), DaemonError> {
        let args = to_args(&["load"]);
        debug!("{} load", self.config.binary);
        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            io::copy(input, &mut stdin)?;
        }
        let output = child.wait_with_output()?;
        self.check(&args, &output)
    }

    fn copy_from_container(
        &self,
        id: &str,
        path: &str,
        out: &mut dyn Write,
    ) -> Result<(), DaemonError> {
        self.stream_out(&to_args(&["cp", &format!("{id}:{path}"), "-"]), out)
    }

    fn remove_image(&self, image: &str, force: bool, no_prune: bool) -> Result<(), DaemonError> {
        self.run(&remove_image_args(image, force, no_prune))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    #[test]
    fn global_args_default_empty() {
        assert!(global_args(&DaemonConfig::default()).is_empty());
    }

    #[test]
    fn global_args_with_tls() {
        let config = DaemonConfig {
            host: Some("tcp://10.0.0.5:2376".to_owned()),
            cert_path: Some(PathBuf::from("/certs")),
            use_tls: true,
            ..DaemonConfig::default()
        };
        assert_eq!(
            global_args(&config),
            vec![
                "-H",
                "tcp://10.0.0.5:2376",
                "--tlsverify",
                "--tlscacert",
                "/certs/ca.pem",
                "--tlscert",
                "/certs/cert.pem",
                "--tlskey",
                "/certs/key.pem",
            ]
        );
    }

    #[test]
    fn build_args_include_limits_and_args() {
        let request = BuildRequest {
            image: "app-abc:1.0".to_owned(),
            dockerfile: PathBuf::from("/work/Dockerfile_abc.generated"),
            context: PathBuf::from("/work"),
            build_args: BTreeMap::from([("A".to_owned(), "1".to_owned())]),
            no_cache: true,
            remove_intermediate: true,
            network: Some("host".to_owned()),
            memory: Some(536_870_912),
            cpu_shares: Some(512),
            cpuset_cpus: Some("0-1".to_owned()),
            ..BuildRequest::default()
        };
        let args = build_args(&request);
        assert_eq!(&args[..5], &["build", "-t", "app-abc:1.0", "-f", "/work/Dockerfile_abc.generated"]);
        assert!(args.windows(2).any(|w| w == ["--build-arg", "A=1"]));
        assert!(args.contains(&"--no-cache".to_owned()));
        assert!(args.contains(&"--rm=true".to_owned()));
        assert!(!args.contains(&"--force-rm".to_owned()));
        assert!(args.windows(2).any(|w| w == ["--memory", "536870912"]));
        assert!(args.windows(2).any(|w| w == ["--cpuset-cpus", "0-1"]));
        assert_eq!(args.last().unwrap(), "/work");
    }

    #[test]
    fn container_and_image_args() {
        let cmd = vec!["/bin/sh".to_owned()];
        assert_eq!(
            create_args("img", "img.x1", &cmd),
            vec!["create", "-t", "--name", "img.x1", "img", "/bin/sh"]
        );
        assert_eq!(
            exec_args("c1", &["ls".to_owned(), "/".to_owned()], true),
            vec!["exec", "-t", "c1", "ls", "/"]
        );
        assert_eq!(remove_container_args("c1", true, true), vec!["rm", "-f", "-v", "c1"]);
        assert_eq!(remove_image_args("img", false, true), vec!["rmi", "--no-prune", "img"]);
    }

    #[test]
    fn missing_binary_is_io_error() {
        let cli = DockerCli::new(DaemonConfig {
            binary: "/nonexistent/kiln-docker".to_owned(),
            ..DaemonConfig::default()
        });
        assert!(matches!(cli.start_container("x"), Err(DaemonError::Io(_))));
    }
}
