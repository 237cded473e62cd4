//! Depot content server (depotd)

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod delivery;
mod manifest;
mod selfheal;
mod session;
mod storage;

use config::Config;
use manifest::{build_from_directory, Manifest, ManifestIdentity, ManifestService};
use storage::select_fast_hasher;

#[derive(Parser)]
#[command(name = "depotd")]
#[command(about = "Game manifest, chunk delivery and self-heal server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server in the foreground
    Serve {
        /// Name reported by /server/info
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the manifest of a build directory
    Build {
        /// Build directory
        dir: PathBuf,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long)]
        game_id: Option<String>,
        #[arg(long, default_value = "latest")]
        version: String,
        /// Chunk size in bytes (defaults to CHUNK_SIZE)
        #[arg(long)]
        chunk_size: Option<u64>,
    },
    /// Verify an install against a manifest file and print the report
    Scan {
        /// Install directory
        install: PathBuf,
        /// Manifest JSON, bare or in the v2 envelope
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
    },
}

/// Load `.env` (or `dotenv_path`), then build the log filter from the
/// resulting `RUST_LOG`.
fn load_environment(dotenv_path: Option<&Path>) -> tracing_subscriber::EnvFilter {
    // a missing .env is fine
    let _ = match dotenv_path {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "depotd=info,tower_http=info".into())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = load_environment(None);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Serve { name } => {
            if let Some(name) = name {
                config.set_server_name(name);
            }
            run_server(config).await?;
        }
        Commands::Build {
            dir,
            slug,
            game_id,
            version,
            chunk_size,
        } => {
            build_manifest(&config, dir, slug, game_id, version, chunk_size).await?;
        }
        Commands::Scan {
            install,
            manifest,
            workers,
        } => {
            scan_install(&config, install, manifest, workers).await?;
        }
    }

    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let hasher = select_fast_hasher(config.fast_hash);
    let manifests = Arc::new(ManifestService::from_config(&config)?);
    let fetcher = delivery::ChunkFetcher::from_config(&config);
    let shutdown = CancellationToken::new();

    let prewarm = config
        .prewarm
        .then(|| manifests.spawn_prewarm(shutdown.child_token()));

    let rest_addr = format!("{}:{}", config.bind_addr, config.rest_port).parse()?;
    let app_state = api::AppState::new(config, manifests, fetcher, hasher);

    api::rest::serve(rest_addr, app_state, shutdown.clone()).await?;

    shutdown.cancel();
    if let Some(handle) = prewarm {
        let _ = handle.await;
    }
    tracing::info!("depotd stopped");
    Ok(())
}

async fn build_manifest(
    config: &Config,
    dir: PathBuf,
    slug: Option<String>,
    game_id: Option<String>,
    version: String,
    chunk_size: Option<u64>,
) -> anyhow::Result<()> {
    let slug = match slug {
        Some(slug) => slug,
        None => dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow::anyhow!("cannot derive a slug from {}", dir.display()))?,
    };
    let identity = ManifestIdentity {
        game_id: game_id.unwrap_or_else(|| slug.clone()),
        slug,
        version,
    };
    let chunk_size = chunk_size.unwrap_or(config.chunk_size);
    let hosts = config.cdn_hosts();

    let manifest =
        tokio::task::spawn_blocking(move || build_from_directory(&dir, &identity, chunk_size, &hosts))
            .await??;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn scan_install(
    config: &Config,
    install: PathBuf,
    manifest_path: PathBuf,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read(&manifest_path).await?;
    let mut value: serde_json::Value = serde_json::from_slice(&raw)?;
    let manifest_value = match value.get_mut("manifest") {
        Some(inner) => inner.take(),
        None => value,
    };
    let manifest: Manifest = serde_json::from_value(manifest_value)?;

    let service = selfheal::SelfHealService::new(select_fast_hasher(config.fast_hash));
    let report = service
        .scan(
            Arc::new(manifest),
            selfheal::ScanOptions {
                install_path: install,
                use_fast_delta: false,
                max_workers: workers,
            },
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&*report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotenv_log_level_reaches_filter() {
        let temp = tempfile::tempdir().unwrap();
        let dotenv = temp.path().join(".env");
        std::fs::write(&dotenv, "RUST_LOG=depotd=trace\n").unwrap();
        std::env::remove_var("RUST_LOG");

        let filter = load_environment(Some(&dotenv));
        assert_eq!(filter.to_string(), "depotd=trace");
        std::env::remove_var("RUST_LOG");
    }
}
