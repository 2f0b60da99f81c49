//! CLI for multi-update operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "multiupdate")]
#[command(about = "Multi-update coordinator CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:7000")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a multi-update
    Submit {
        /// Namespace (db.collection)
        namespace: String,

        /// Update command (JSON)
        command: String,

        /// Return once the operation is accepted
        #[arg(long)]
        no_wait: bool,
    },

    /// Show the state of an operation
    Status {
        /// Operation ID
        id: String,
    },

    /// Wait for an operation's final result
    Result {
        /// Operation ID
        id: String,
    },

    /// Abort an operation
    Abort {
        /// Operation ID
        id: String,

        /// Reason recorded with the abort
        #[arg(long)]
        reason: Option<String>,
    },

    /// Remove the stored document of a finished operation
    Forget {
        /// Operation ID
        id: String,
    },

    /// List running coordinators
    CurrentOp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.coordinator.trim_end_matches('/');

    let (status, body) = match cli.command {
        Commands::Submit {
            namespace,
            command,
            no_wait,
        } => {
            let command: Value =
                serde_json::from_str(&command).context("update command must be JSON")?;
            send(client.post(format!("{}/multi-update", base)).json(&json!({
                "namespace": namespace,
                "command": command,
                "wait": !no_wait,
            })))
            .await?
        }

        Commands::Status { id } => send(client.get(format!("{}/multi-update/{}", base, id))).await?,

        Commands::Result { id } => {
            send(client.get(format!("{}/multi-update/{}/result", base, id))).await?
        }

        Commands::Abort { id, reason } => {
            send(
                client
                    .post(format!("{}/multi-update/{}/abort", base, id))
                    .json(&json!({ "reason": reason })),
            )
            .await?
        }

        Commands::Forget { id } => {
            send(client.delete(format!("{}/multi-update/{}", base, id))).await?
        }

        Commands::CurrentOp => send(client.get(format!("{}/current-op", base))).await?,
    };

    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("coordinator returned HTTP {}", status);
    }
    Ok(())
}

async fn send(request: reqwest::RequestBuilder) -> anyhow::Result<(reqwest::StatusCode, Value)> {
    let resp = request.send().await.context("coordinator unreachable")?;
    let status = resp.status();
    let body = resp.json().await.context("invalid response body")?;
    Ok((status, body))
}
