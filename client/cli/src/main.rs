use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod api;
mod config;
mod heal;
mod install;

use api::{ApiClient, CreateSession};
use config::Config;
use install::{Downloader, SessionGate};

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Depot game install client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save server settings
    Setup {
        #[arg(long)]
        server: String,
        /// Chunks downloaded in parallel
        #[arg(long)]
        parallel: Option<usize>,
        #[arg(long)]
        channel: Option<String>,
    },
    /// Print a game's manifest envelope
    Manifest {
        slug: String,
        #[arg(long)]
        version: Option<String>,
    },
    /// Download a game into a directory
    Install {
        slug: String,
        dir: PathBuf,
        #[arg(long)]
        version: Option<String>,
        /// Do not register a download session
        #[arg(long)]
        no_session: bool,
    },
    /// Scan an install for missing or damaged files
    Verify {
        slug: String,
        dir: PathBuf,
        #[arg(long)]
        version: Option<String>,
        /// Reuse the previous scan's fast hashes
        #[arg(long)]
        fast: bool,
    },
    /// Plan a repair, and with --apply re-fetch the damaged files
    Repair {
        slug: String,
        dir: PathBuf,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        apply: bool,
    },
    /// Show or control a download session
    Session {
        id: Uuid,
        /// pause, resume or cancel
        action: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    if let Commands::Setup {
        server,
        parallel,
        channel,
    } = &cli.command
    {
        let api = ApiClient::new(server);
        let info = api.get_server_info().await?;
        config.server_url = Some(server.clone());
        config.parallel_chunks = parallel.or(config.parallel_chunks);
        config.channel = channel.clone().or(config.channel);
        config.save()?;
        println!(
            "connected to {} {} (fast hash: {})",
            info.name, info.version, info.fast_hash
        );
        return Ok(());
    }

    let api = Arc::new(ApiClient::new(config.server_url()?));
    let channel = config.channel().to_string();

    match cli.command {
        Commands::Setup { .. } => unreachable!(),
        Commands::Manifest { slug, version } => {
            let envelope = api.get_manifest(&slug, version.as_deref(), &channel).await?;
            println!(
                "{} {} build {} ({} files, {} bytes, sha256 {})",
                envelope.slug,
                envelope.version,
                envelope.manifest.build_id,
                envelope.manifest.files.len(),
                envelope.manifest.total_size,
                envelope.integrity.canonical_hash
            );
        }
        Commands::Install {
            slug,
            dir,
            version,
            no_session,
        } => {
            let envelope = api.get_manifest(&slug, version.as_deref(), &channel).await?;
            let gate = if no_session {
                None
            } else {
                let created = api
                    .create_session(&CreateSession {
                        slug: &slug,
                        version: Some(&envelope.version),
                        channel: &channel,
                        method: "chunks",
                        install_path: Some(dir.to_string_lossy().to_string()),
                    })
                    .await?;
                println!("session {}", created.session.id);
                Some(Arc::new(SessionGate::new(Arc::clone(&api), created.session.id)))
            };

            tokio::fs::create_dir_all(&dir).await?;
            let downloader = Downloader::new(api.http().clone(), config.parallel_chunks(), gate)
                .with_progress(envelope.manifest.total_size);
            let installed = downloader.install(&envelope.manifest, &dir).await?;
            println!(
                "installed {} {} ({} bytes) into {}",
                envelope.slug,
                envelope.version,
                installed,
                dir.display()
            );
        }
        Commands::Verify {
            slug,
            dir,
            version,
            fast,
        } => {
            if !heal::verify(&api, &slug, version.as_deref(), &dir, fast).await? {
                std::process::exit(1);
            }
        }
        Commands::Repair {
            slug,
            dir,
            version,
            apply,
        } => {
            let downloader = Downloader::new(api.http().clone(), config.parallel_chunks(), None);
            heal::repair(&api, &downloader, &slug, version.as_deref(), &channel, &dir, apply).await?;
        }
        Commands::Session { id, action } => {
            let state = match action.as_deref() {
                None => api.session_state(id).await?,
                Some(action @ ("pause" | "resume" | "cancel")) => api.control_session(id, action).await?,
                Some(other) => anyhow::bail!("unknown action {other}; use pause, resume or cancel"),
            };
            println!(
                "{} {}@{}: {} / {}",
                state.session.id, state.session.slug, state.session.version, state.session.status, state.session.stage
            );
            if let Some(task) = state.task {
                println!("task {}", task);
            }
        }
    }

    Ok(())
}
