//! Strata CLI - Command-line interface for the archival evidence service
//!
//! Runs archive, renewal and validation operations in-process against the
//! configured store, or hands tasks to a running daemon over its socket.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata_core::FileId;
use strata_daemon::{due_for_retimestamp, FileIdentifier, Services, StrataConfig, Task};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Long-term archival evidence: archive, retimestamp and validate files", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $STRATA_CONFIG or the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Archive a file and print its record
    Archive {
        /// Path of the original, local or on the remote store
        path: String,

        /// Owner recorded with the archived file
        #[arg(short, long)]
        owner: String,
    },

    /// Wrap an archived file's evidence in a fresh timestamp layer
    Retimestamp {
        /// FileID of the archived file
        file_id: FileId,
    },

    /// Validate an archived file
    Validate {
        /// FileID of the archived file
        #[arg(long, conflicts_with_all = ["owner", "name"])]
        id: Option<FileId>,

        /// Owner of the archived file (with --name)
        #[arg(long, requires = "name")]
        owner: Option<String>,

        /// Name of the archived file (with --owner)
        #[arg(long, requires = "owner")]
        name: Option<String>,

        /// Mail the result to these addresses instead of printing it
        #[arg(short, long = "recipient")]
        recipients: Vec<String>,
    },

    /// List archived files whose timestamps expire soon
    Due {
        /// Days before expiration a file counts as due (defaults to the configured margin)
        #[arg(long)]
        margin_days: Option<i64>,

        /// Queue a retimestamp task for each due file on the running daemon
        #[arg(long)]
        submit: bool,
    },

    /// Send a raw task message to the running daemon
    Submit {
        /// Task as JSON, e.g. '{"task":"retimestamp","file_id":7}'
        task: String,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata_cli=info,strata_daemon=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(StrataConfig::default_path);

    match cli.command {
        Commands::Archive { path, owner } => {
            let (_, services) = open(&config_path)?;
            let file = services.archiver().archive(&path, &owner).await?;
            println!("✓ Archived {}", file.file_name());
            println!("  FileID: {}", file.file_id);
            println!("  Owner: {}", file.owner_name());
            println!("  Evidence: {}", file.storage_path().display());
            println!("  Digest: {}", file.fields().origin_digest);
            println!("  Expires: {}", file.expiration());
        }

        Commands::Retimestamp { file_id } => {
            let (_, services) = open(&config_path)?;
            let package = services.retimestamper().retimestamp(file_id).await?;
            let file = services.store.archived(file_id)?;
            println!("✓ Renewed {}", file.file_name());
            println!("  PackageID: {}", package.package_id);
            println!("  Authority: {}", package.fields().time_stamping_authority);
            println!("  Issued: {}", package.issuing_date());
            println!("  Expires: {}", file.expiration());
        }

        Commands::Validate {
            id,
            owner,
            name,
            recipients,
        } => {
            let identifier = match (id, owner, name) {
                (Some(id), _, _) => FileIdentifier::Id(id),
                (None, Some(owner), Some(name)) => FileIdentifier::OwnerAndName { owner, name },
                _ => bail!("give either --id or both --owner and --name"),
            };
            let (_, services) = open(&config_path)?;
            let validator = services.validator();
            if recipients.is_empty() {
                let report = validator.verify(&identifier)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.is_valid() {
                    bail!(report.describe());
                }
            } else {
                let status = validator.validate(&identifier, &recipients).await?;
                println!("{} (result mailed to {})", status, recipients.join(", "));
            }
        }

        Commands::Due {
            margin_days,
            submit: queue,
        } => {
            let (config, services) = open(&config_path)?;
            let margin = margin_days.unwrap_or(config.worker.retimestamp_margin_days);
            let due = due_for_retimestamp(services.store.as_ref(), Utc::now(), margin)?;
            if due.is_empty() {
                println!("No files due within {} days", margin);
            }
            for file_id in due {
                let file = services.store.archived(file_id)?;
                println!(
                    "{:>8}  {}  {} ({})",
                    file_id,
                    file.expiration().format("%Y-%m-%d %H:%M:%S"),
                    file.file_name(),
                    file.owner_name()
                );
                if queue {
                    submit(&config, &Task::Retimestamp { file_id }).await?;
                }
            }
        }

        Commands::Submit { task } => {
            let config = load_config(&config_path)?;
            let task = Task::parse(task.as_bytes())?;
            submit(&config, &task).await?;
        }

        Commands::InitConfig { force } => init_config(&config_path, force)?,
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<StrataConfig> {
    let config = StrataConfig::load(path)
        .with_context(|| format!("cannot load {:?}; run `strata init-config` first", path))?;
    config.ensure_directories()?;
    Ok(config)
}

fn open(path: &Path) -> Result<(StrataConfig, Services)> {
    let config = load_config(path)?;
    let services = Services::from_config(&config)?;
    Ok((config, services))
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    StrataConfig::default().save(path)?;
    println!("✓ Wrote default configuration to {}", path.display());
    Ok(())
}

#[cfg(unix)]
async fn submit(config: &StrataConfig, task: &Task) -> Result<()> {
    use strata_daemon::{intake, IntakeResponse};

    match intake::submit(&config.worker.socket_path, task).await? {
        IntakeResponse::Queued { delivery, task } => {
            println!("✓ Queued {} task as delivery {}", task, delivery);
            Ok(())
        }
        IntakeResponse::Error { message } => bail!("daemon refused task: {}", message),
    }
}

#[cfg(not(unix))]
async fn submit(_config: &StrataConfig, _task: &Task) -> Result<()> {
    bail!("the task socket is only available on Unix")
}
