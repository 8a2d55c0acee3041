use super::{
    colorize_outcome, json_pretty, load_manifest, parse_pairs, spin_fail, spin_ok, spinner,
    EXIT_FAILURE, EXIT_SUCCESS,
};
use clap::Args;
use kiln_core::{BuildConfig, CoreError, Scheduler};
use kiln_runtime::select_daemon;
use kiln_server::{BasicAuth, SecretService, ServerHandle};
use std::path::PathBuf;
use tracing::info;

/// Command-line overrides for [`BuildConfig`]. Unset flags keep the value
/// from the config file.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Default, Args)]
pub struct BuildArgs {
    /// Working directory; Dockerfiles, contexts and artifacts are relative to it.
    #[arg(short = 'w', long)]
    pub workdir: Option<PathBuf>,
    /// Build file, relative to the working directory.
    #[arg(short = 'f', long = "file")]
    pub build_file: Option<String>,
    /// Suffix for image and container names; generated when unset.
    #[arg(long)]
    pub unique_id: Option<String>,
    /// Start from this step (name or label) and build only its dependents.
    #[arg(long)]
    pub start_step: Option<String>,
    #[arg(long)]
    pub no_cache: bool,
    #[arg(long)]
    pub suppress_output: bool,
    /// Keep intermediate build containers.
    #[arg(long)]
    pub no_rm: bool,
    #[arg(long)]
    pub force_rm: bool,
    /// Keep the images of intermediate steps.
    #[arg(long)]
    pub keep_steps: bool,
    /// Keep extracted artifacts on the host.
    #[arg(long)]
    pub keep_artifacts: bool,
    /// Skip cleanup commands and squashing.
    #[arg(long)]
    pub no_squash: bool,
    /// Copy artifact permissions using `stat` inside the container.
    #[arg(long)]
    pub use_stat: bool,
    #[arg(long)]
    pub allow_after_build_commands: bool,
    #[arg(long)]
    pub force_rmi: bool,
    #[arg(long)]
    pub no_prune_rmi: bool,
    /// Fail the step when its foreground command exits non-zero.
    #[arg(long)]
    pub fail_on_command_error: bool,
    #[arg(long)]
    pub network: Option<String>,
    /// Memory limit for image builds, e.g. `512m` or `2GiB`.
    #[arg(long)]
    pub memory: Option<String>,
    #[arg(long)]
    pub cpu_shares: Option<u64>,
    #[arg(long)]
    pub cpuset_cpus: Option<String>,
    /// Build argument applied to every step (KEY=VALUE, repeatable).
    #[arg(long = "build-arg", value_name = "KEY=VALUE")]
    pub build_args: Vec<String>,
    /// Value for `_env(KEY)` placeholders (KEY=VALUE, repeatable).
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env_vars: Vec<String>,
    /// Comma separated list of enabled secret providers.
    #[arg(long)]
    pub secret_providers: Option<String>,
    /// Daemon address, e.g. `unix:///var/run/docker.sock` or `tcp://host:2376`.
    #[arg(long)]
    pub docker_host: Option<String>,
    /// Directory with `ca.pem`, `cert.pem` and `key.pem`.
    #[arg(long)]
    pub tls_cert_path: Option<PathBuf>,
    #[arg(long)]
    pub tls: bool,
    /// Serve build secrets over HTTP while the build runs.
    #[arg(long)]
    pub secret_server: bool,
    #[arg(long)]
    pub secret_bind: Option<String>,
    #[arg(long)]
    pub secret_port: Option<u16>,
    #[arg(long, requires = "secret_password")]
    pub secret_username: Option<String>,
    #[arg(long, requires = "secret_username")]
    pub secret_password: Option<String>,
}

impl BuildArgs {
    pub fn apply(&self, config: &mut BuildConfig) -> Result<(), String> {
        self.apply_selection(config);

        config.no_cache |= self.no_cache;
        config.suppress_output |= self.suppress_output;
        if self.no_rm {
            config.rm = false;
        }
        config.force_rm |= self.force_rm;
        config.keep_steps |= self.keep_steps;
        config.keep_artifacts |= self.keep_artifacts;
        config.no_squash |= self.no_squash;
        config.use_stat |= self.use_stat;
        config.allow_after_build_commands |= self.allow_after_build_commands;
        config.force_rmi |= self.force_rmi;
        config.no_prune_rmi |= self.no_prune_rmi;
        config.fail_on_command_error |= self.fail_on_command_error;

        if let Some(network) = &self.network {
            config.network = Some(network.clone());
        }
        if let Some(memory) = &self.memory {
            config.memory = Some(memory.clone());
        }
        if let Some(shares) = self.cpu_shares {
            config.cpu_shares = Some(shares);
        }
        if let Some(cpus) = &self.cpuset_cpus {
            config.cpuset_cpus = Some(cpus.clone());
        }
        config.build_args.extend(parse_pairs(&self.build_args)?);
        config.env_vars.extend(parse_pairs(&self.env_vars)?);
        if let Some(providers) = &self.secret_providers {
            config.secret_providers = providers.clone();
        }

        if let Some(host) = &self.docker_host {
            config.daemon.host = Some(host.clone());
        }
        if let Some(path) = &self.tls_cert_path {
            config.daemon.cert_path = Some(path.clone());
        }
        config.daemon.use_tls |= self.tls;

        config.secrets.enabled |= self.secret_server;
        if let Some(bind) = &self.secret_bind {
            config.secrets.bind = bind.clone();
        }
        if let Some(port) = self.secret_port {
            config.secrets.port = port;
        }
        if let (Some(user), Some(pass)) = (&self.secret_username, &self.secret_password) {
            config.secrets.username = Some(user.clone());
            config.secrets.password = Some(pass.clone());
        }
        Ok(())
    }

    /// Overrides that decide which build file and steps are used; shared
    /// with `plan`.
    pub fn apply_selection(&self, config: &mut BuildConfig) {
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
        }
        if let Some(file) = &self.build_file {
            config.build_file = file.clone();
        }
        if let Some(id) = &self.unique_id {
            config.unique_id = Some(id.clone());
        }
        if let Some(step) = &self.start_step {
            config.start_step = Some(step.clone());
        }
    }
}

fn start_secret_server(
    config: &BuildConfig,
    service: SecretService,
) -> Result<Option<ServerHandle>, String> {
    if !config.secrets.enabled {
        return Ok(None);
    }
    let service = match (&config.secrets.username, &config.secrets.password) {
        (Some(user), Some(pass)) => service.with_auth(BasicAuth::new(user, pass)),
        _ => service,
    };
    let addr = format!("{}:{}", config.secrets.bind, config.secrets.port);
    ServerHandle::spawn(service, &addr)
        .map(Some)
        .map_err(|e| e.to_string())
}

pub fn run(config: &BuildConfig, backend: &str, json: bool) -> Result<u8, String> {
    config.validate().map_err(|e| e.to_string())?;
    let manifest = load_manifest(config)?;
    if manifest.is_privileged {
        info!("build file runs cleanup commands; affected steps are committed and squashed");
    }

    let daemon = select_daemon(backend, &config.daemon)
        .map_err(|e| CoreError::from(e).to_string())?;
    let server = start_secret_server(config, SecretService::new(manifest.secrets.clone()))?;

    let scheduler = Scheduler::new(&manifest, config, daemon.as_ref());
    let total = manifest.steps().len();
    let pb = if json {
        None
    } else {
        Some(spinner(&format!(
            "building {total} step(s) as {}...",
            scheduler.build_id()
        )))
    };

    let result = scheduler.run();
    if let Some(server) = server {
        server.shutdown();
    }

    let report = match result {
        Ok(report) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, &format!("build {} finished", report.build_id));
            }
            report
        }
        Err(CoreError::BuildFailed(report)) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, &format!("build {} failed", report.build_id));
            }
            if json {
                println!("{}", json_pretty(&report)?);
                return Ok(EXIT_FAILURE);
            }
            for failed in &report.failed {
                println!(
                    "  {} {} ({}): {}",
                    colorize_outcome("failed"),
                    failed.name,
                    failed.phase,
                    failed.message
                );
            }
            for name in &report.skipped {
                println!("  {} {name}", colorize_outcome("skipped"));
            }
            return Err(report.to_string());
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        for name in &report.succeeded {
            println!("  {} {name}", colorize_outcome("built"));
        }
        for name in &report.skipped {
            println!("  {} {name}", colorize_outcome("skipped"));
        }
        println!("build id: {}", report.build_id);
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let mut config = BuildConfig {
            network: Some("host".to_owned()),
            build_args: [("A".to_owned(), "file".to_owned())].into(),
            ..BuildConfig::default()
        };

        let args = BuildArgs {
            no_rm: true,
            keep_steps: true,
            memory: Some("1g".to_owned()),
            build_args: vec!["A=flag".to_owned(), "B=2".to_owned()],
            docker_host: Some("tcp://10.0.0.1:2376".to_owned()),
            tls: true,
            secret_port: Some(9000),
            ..BuildArgs::default()
        };
        args.apply(&mut config).unwrap();

        assert!(!config.rm);
        assert!(config.keep_steps);
        assert_eq!(config.network.as_deref(), Some("host"));
        assert_eq!(config.memory.as_deref(), Some("1g"));
        assert_eq!(config.build_args["A"], "flag");
        assert_eq!(config.build_args["B"], "2");
        assert_eq!(config.daemon.host.as_deref(), Some("tcp://10.0.0.1:2376"));
        assert!(config.daemon.use_tls);
        assert_eq!(config.secrets.port, 9000);
        assert!(!config.secrets.enabled);
    }

    #[test]
    fn unset_flags_keep_config_values() {
        let mut config = BuildConfig {
            keep_artifacts: true,
            unique_id: Some("fromfile".to_owned()),
            ..BuildConfig::default()
        };
        BuildArgs::default().apply(&mut config).unwrap();
        assert!(config.keep_artifacts);
        assert!(config.rm);
        assert_eq!(config.unique_id.as_deref(), Some("fromfile"));
    }

    #[test]
    fn malformed_pair_rejected() {
        let args = BuildArgs {
            env_vars: vec!["oops".to_owned()],
            ..BuildArgs::default()
        };
        assert!(args.apply(&mut BuildConfig::default()).is_err());
    }
}
