use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use colored::Colorize;
use repeat_core::{Config, ControlServer, Engine, MountOptions, PluginRegistry};
use repeat_models::ProvenanceDoc;
use replicator::{ReplicateOptions, Replicator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repeatfs", about = "Provenance-recording passthrough filesystem", version)]
struct Cli {
    /// Configuration directory (defaults to REPEATFS_CONF or ~/.repeatfs).
    #[arg(short = 'c', long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a target directory with provenance tracking and VDFs.
    Mount {
        /// Real backing directory.
        target: PathBuf,
        /// Mount point served to users.
        mount: PathBuf,
        /// Stay in the foreground.
        #[arg(short = 'f', long)]
        foreground: bool,
        /// Allow access by other users (passed to the FUSE bridge).
        #[arg(short = 'a', long)]
        allow_other: bool,
        /// Disable provenance recording (VDF-only mode).
        #[arg(short = 'p', long)]
        disable_provenance: bool,
    },

    /// Reproduce an artifact from an exported provenance document.
    Replicate {
        /// Exported provenance JSON.
        provenance: PathBuf,
        /// Destination root for the replicated run.
        #[arg(short = 'r', long)]
        dest: Option<PathBuf>,
        /// List the schedule without executing anything.
        #[arg(short = 'l', long)]
        list_only: bool,
        /// Process IDs to split out and re-execute unconditionally.
        #[arg(short = 'e', long = "expand")]
        expand: Vec<String>,
        /// Environment keys restored from the recorded environment.
        #[arg(short = 'E', long = "env")]
        env_allow: Vec<String>,
        /// Redirect replicated stdout to a file.
        #[arg(long)]
        stdout: Option<PathBuf>,
        /// Redirect replicated stderr to a file.
        #[arg(long)]
        stderr: Option<PathBuf>,
    },

    /// Ask a running mount to shut down.
    Shutdown {
        /// Mount point, shown in messages.
        #[arg(short = 'm', long)]
        mount: Option<PathBuf>,
    },

    /// Write a default configuration template.
    Generate,

    /// List available plugins.
    Plugins,

    /// Print version information.
    Version,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    match run(cli.command, &config_dir) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("REPEATFS_CONF") {
        return PathBuf::from(dir);
    }
    match std::env::var("HOME") {
        Ok(home) => Path::new(&home).join(".repeatfs"),
        Err(_) => PathBuf::from(".repeatfs"),
    }
}

fn run(command: Commands, config_dir: &Path) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Mount {
            target,
            mount,
            foreground,
            allow_other,
            disable_provenance,
        } => {
            let config = Config::load(&config_dir.join(repeat_core::CONFIG_FILE))
                .context("loading configuration")?;
            let engine = Engine::mount(
                &target,
                &mount,
                config_dir,
                config,
                MountOptions {
                    disable_provenance,
                    allow_other,
                },
            )
            .context("mounting")?;

            if !foreground {
                // Daemonization is handled by the service wrapper.
                tracing::info!("no daemonization wrapper attached, staying in foreground");
            }
            tracing::info!(
                "serving {} over {}",
                engine.root().display(),
                engine.mount_path().display()
            );

            let server = ControlServer::start(engine, config_dir).context("control socket")?;
            server.wait();
            Ok(ExitCode::SUCCESS)
        }

        Commands::Replicate {
            provenance,
            dest,
            list_only,
            expand,
            env_allow,
            stdout,
            stderr,
        } => {
            let text = std::fs::read_to_string(&provenance)
                .with_context(|| format!("reading {}", provenance.display()))?;
            let doc = ProvenanceDoc::from_json(&text).context("parsing provenance document")?;

            let root = match dest {
                Some(dest) => dest,
                None => std::env::current_dir()?.join("replication"),
            };
            let rep = Replicator::new(
                doc,
                ReplicateOptions {
                    root,
                    expand: expand.into_iter().collect::<BTreeSet<_>>(),
                    env_allow,
                    stdout,
                    stderr,
                },
            )
            .context("preparing replication")?;

            if list_only {
                for line in rep.list().context("computing schedule")? {
                    println!("{line}");
                }
                return Ok(ExitCode::SUCCESS);
            }

            let report = rep.run().context("replicating")?;
            println!("replicated {} process(es)", report.executed);
            for warning in &report.warnings {
                println!("{} {warning}", "[warn]".yellow());
            }
            if report.warnings.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(3))
            }
        }

        Commands::Shutdown { mount } => {
            let socket = ControlServer::socket_path(config_dir);
            let reply = repeat_core::send_shutdown(&socket)
                .with_context(|| format!("connecting to {}", socket.display()))?;
            match mount {
                Some(mount) => println!("{}: {reply}", mount.display()),
                None => println!("{reply}"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Generate => {
            let path = Config::write_template(config_dir).context("writing template")?;
            println!("configuration created: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Plugins => {
            for name in PluginRegistry::available() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Version => {
            println!("repeatfs {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}
