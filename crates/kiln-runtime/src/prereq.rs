use crate::daemon::DaemonConfig;
use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn daemon_reachable(config: &DaemonConfig) -> bool {
    Command::new(&config.binary)
        .args(crate::docker::global_args(config))
        .args(["version", "--format", "{{.Server.Version}}"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check prerequisites for the Docker CLI backend.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_docker_prereqs(config: &DaemonConfig) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists(&config.binary) {
        missing.push(MissingPrereq {
            name: "docker",
            purpose: "building images and running build containers",
            install_hint: "zypper install docker | apt install docker.io | dnf install moby-engine | pacman -S docker",
        });
    } else if !daemon_reachable(config) {
        missing.push(MissingPrereq {
            name: "docker daemon",
            purpose: "image builds, container exec and image load",
            install_hint:
                "start the daemon (systemctl start docker) or set the daemon host / DOCKER_HOST",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nKiln needs a reachable image daemon to run builds.");
    msg
}
