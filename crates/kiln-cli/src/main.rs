mod commands;

use clap::{Parser, Subcommand};
use commands::build::BuildArgs;
use commands::{load_config, EXIT_DAEMON_ERROR, EXIT_FAILURE, EXIT_MANIFEST_ERROR};
use kiln_core::install_signal_handler;
use kiln_squash::SquashFrom;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Multi-step container image builder with layer squashing"
)]
struct Cli {
    /// TOML file with run settings; flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build every step of a build file, level by level.
    Build {
        #[command(flatten)]
        args: BuildArgs,
        /// Image daemon backend: docker or mock.
        #[arg(long, default_value = "docker")]
        backend: String,
    },
    /// Show the build levels and run-qualified image names without building.
    Plan {
        #[arg(short = 'w', long)]
        workdir: Option<PathBuf>,
        #[arg(short = 'f', long = "file")]
        build_file: Option<String>,
        #[arg(long)]
        unique_id: Option<String>,
    },
    /// Squash the layers of an exported image tar.
    Squash {
        /// Image tar in the daemon's save format.
        input: PathBuf,
        /// Output tar; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Tag the squashed image as repo[:tag].
        #[arg(short, long)]
        tag: Option<String>,
        /// Layer id (or prefix) to squash from, or `root`.
        #[arg(long)]
        from: Option<SquashFrom>,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let result = match cli.command {
        Commands::Build { args, backend } => load_config(cli.config.as_deref())
            .and_then(|mut config| {
                args.apply(&mut config)?;
                Ok(config)
            })
            .and_then(|config| {
                if backend == "docker" && std::env::var("KILN_SKIP_PREREQS").as_deref() != Ok("1")
                {
                    let missing = kiln_runtime::check_docker_prereqs(&config.daemon);
                    if !missing.is_empty() {
                        return Err(format!(
                            "daemon error: {}",
                            kiln_runtime::format_missing(&missing)
                        ));
                    }
                }
                commands::build::run(&config, &backend, cli.json)
            }),
        Commands::Plan {
            workdir,
            build_file,
            unique_id,
        } => load_config(cli.config.as_deref()).and_then(|mut config| {
            BuildArgs {
                workdir,
                build_file,
                unique_id,
                ..BuildArgs::default()
            }
            .apply_selection(&mut config);
            commands::plan::run(&config, cli.json)
        }),
        Commands::Squash {
            input,
            output,
            tag,
            from,
        } => commands::squash::run(&input, output.as_deref(), tag.as_deref(), from, cli.json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:") {
                EXIT_MANIFEST_ERROR
            } else if msg.starts_with("daemon error:") {
                EXIT_DAEMON_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
