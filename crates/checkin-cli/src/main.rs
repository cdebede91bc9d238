use anyhow::{Context, Result};
use checkin_models::{ModelSource, ModelSourceResolver, SourceFetcher, REQUIRED_MODELS};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.checkin.Recognition1",
    default_service = "org.checkin.Recognition1",
    default_path = "/org/checkin/Recognition1"
)]
trait Recognition {
    async fn identify(&self, image_path: &str, route: &str) -> zbus::Result<String>;
    async fn track(&self, image_path: &str) -> zbus::Result<String>;
    async fn reload_roster(&self, path: &str) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "checkin", about = "Field check-in face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the face in an image against the enrolled roster
    Identify {
        /// Image file (JPEG or PNG)
        image: PathBuf,
        /// Compute the descriptor on the remote inference endpoint
        #[arg(long)]
        cloud: bool,
    },
    /// Run the fast tracker on an image and report the quality verdict
    Track {
        image: PathBuf,
    },
    /// Rebuild the matcher from a roster export (default: the daemon's configured path)
    Reload {
        path: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// Resolve the model bundle from the given sources without the daemon
    Resolve {
        /// Base URLs or directories, tried concurrently
        #[arg(required = true)]
        sources: Vec<String>,
        /// Manifest probe timeout in milliseconds
        #[arg(long, default_value_t = 4000)]
        probe_timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identify { image, cloud } => {
            let proxy = connect().await?;
            let route = if cloud { "cloud" } else { "local" };
            let verdict = proxy.identify(&absolute(&image)?, route).await?;
            print_json(&verdict);
        }
        Commands::Track { image } => {
            let proxy = connect().await?;
            print_json(&proxy.track(&absolute(&image)?).await?);
        }
        Commands::Reload { path } => {
            let proxy = connect().await?;
            let path = path.as_deref().map(absolute).transpose()?.unwrap_or_default();
            let count = proxy.reload_roster(&path).await?;
            println!("Roster reloaded: {count} identities enrolled");
        }
        Commands::Status => {
            let proxy = connect().await?;
            print_json(&proxy.status().await?);
        }
        Commands::Resolve {
            sources,
            probe_timeout_ms,
        } => {
            let candidates: Vec<ModelSource> = sources.iter().map(|s| ModelSource::parse(s)).collect();
            tracing::debug!(candidates = candidates.len(), probe_timeout_ms, "resolving model sources");
            let resolver = ModelSourceResolver::new(SourceFetcher::new()?, REQUIRED_MODELS)
                .with_probe_timeout(Duration::from_millis(probe_timeout_ms));

            match resolver.resolve(&candidates).await {
                Ok(resolved) => {
                    println!("Resolved from {}", resolved.source);
                    println!("Bundle version: {}", resolved.manifest.version);
                    for name in REQUIRED_MODELS {
                        let bytes = resolved.bundle.model(name).map_or(0, <[u8]>::len);
                        println!("  {name:<16} {bytes:>12} bytes");
                    }
                }
                Err(e) => {
                    tracing::debug!(error = ?e, "model resolution failed");
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<RecognitionProxy<'static>> {
    tracing::debug!("connecting to checkind on the system bus");
    let conn = zbus::connection::Builder::system()?
        .method_timeout(Duration::from_secs(30))
        .build()
        .await
        .context("cannot connect to the system bus")?;
    RecognitionProxy::new(&conn)
        .await
        .context("checkind is not running")
}

fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).with_context(|| format!("{}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!("{value:#}"),
        Err(_) => println!("{raw}"),
    }
}
