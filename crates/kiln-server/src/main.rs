use clap::Parser;
use kiln_schema::{parse_manifest_file, parse_provider_list, LoadOptions};
use kiln_server::{BasicAuth, SecretService};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kiln-server", about = "Serve the secrets of a Kiln build file over HTTP")]
struct Cli {
    /// Build file whose secrets are served.
    #[arg(long, default_value = "build.yml")]
    build_file: PathBuf,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Comma separated list of enabled secret providers.
    #[arg(long, default_value = "file,env")]
    secret_providers: String,

    /// Basic auth username; requires --password.
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Basic auth password; requires --username.
    #[arg(long, requires = "username")]
    password: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let providers = match parse_provider_list(&cli.secret_providers) {
        Ok(p) => p,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    let options = LoadOptions {
        secret_providers: providers,
        ..LoadOptions::default()
    };
    let manifest = match parse_manifest_file(&cli.build_file, &options) {
        Ok(m) => m,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    let mut service = SecretService::new(manifest.secrets);
    if let (Some(user), Some(pass)) = (&cli.username, &cli.password) {
        service = service.with_auth(BasicAuth::new(user, pass));
    }

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("serving secrets from {}", cli.build_file.display());
    match kiln_server::run_server(&service, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
