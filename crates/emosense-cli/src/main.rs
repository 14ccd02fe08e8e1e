use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;

mod proxy;

use proxy::ModelsProxy;

#[derive(Parser)]
#[command(name = "emosense", about = "Emosense emotion model management CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the installed model
    Status,
    /// Ask the backend whether a newer model exists
    Check {
        /// Ignore the cached result of a recent check
        #[arg(short, long)]
        force: bool,
    },
    /// Download and install a model version in the background
    Download {
        /// Version number to install
        version: u32,
        /// Artifact URL
        url: String,
    },
    /// Cancel an in-flight download
    Cancel { version: u32 },
    /// Show download progress
    Progress {
        version: u32,
        /// Keep printing until the download finishes
        #[arg(short, long)]
        follow: bool,
    },
}

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let models = ModelsProxy::new(&connection)
        .await
        .context("emosensed is not reachable")?;
    tracing::debug!(service = proxy::SERVICE, "connected to emosensed");

    match cli.command {
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&models.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Check { force } => {
            if models.check_for_updates(force).await? {
                println!("A newer model is available");
            } else {
                println!("Model is up to date");
            }
        }
        Commands::Download { version, url } => {
            models.download_model(version, &url).await?;
            println!("Download of model {version} scheduled");
        }
        Commands::Cancel { version } => {
            if models.cancel_download(version).await? {
                println!("Download of model {version} cancelled");
            } else {
                println!("No download of model {version} in progress");
            }
        }
        Commands::Progress { version, follow } => loop {
            let state = models.download_state(version).await?;
            let progress = models.download_progress(version).await?;
            println!("model {version}: {}", describe(&state, progress));

            if !follow || is_terminal(&state) {
                if state == "failed" {
                    bail!("download of model {version} failed");
                }
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        },
    }

    Ok(())
}

/// Nothing further will happen without a new request.
fn is_terminal(state: &str) -> bool {
    matches!(state, "succeeded" | "failed" | "cancelled" | "idle")
}

fn describe(state: &str, progress: f64) -> String {
    match state {
        "running" => format!("downloading {:.0}%", progress * 100.0),
        "blocked" => "waiting for network or storage".to_string(),
        "idle" => "no download requested".to_string(),
        other => other.to_string(),
    }
}
