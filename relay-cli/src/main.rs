//! relay-cli: producer-side helper for the exchange relay
//!
//! Builds queue messages the way the game-side producer does (gzip of the
//! record JSON) and can push them straight to a running relay host. Also
//! exports the relayed containers for offline dataset building.
//!
//! # Subcommands
//! - `encode <file>`: print the base64 gzip payload to enqueue
//! - `send <file>`: POST the gzip payload to `/messages`
//! - `status`: show relay host health
//! - `dump`: write every stored document to `<out>/<container>/<id>.json`

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use relay_core::{DocumentStore, RelayConfig};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:7071";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "relay-cli",
    version,
    about = "Compress and submit conversation-exchange records to the relay"
)]
struct Cli {
    /// Relay HTTP host URL (overrides RELAY_HTTP_URL env var)
    #[arg(long, env = "RELAY_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the base64-encoded gzip payload for a record file
    Encode {
        /// JSON file holding input_json, output_json and api_output
        file: PathBuf,
    },

    /// Compress a record file and relay it through the host
    Send {
        /// JSON file holding input_json, output_json and api_output
        file: PathBuf,

        /// Print the raw JSON receipt
        #[arg(long)]
        json: bool,
    },

    /// Show relay host status
    Status,

    /// Export every document of the relay's containers, one JSON file per id
    Dump {
        /// Relay config file naming the store backend and containers
        #[arg(long, default_value = "relay.toml")]
        config: String,

        /// Output directory; each container gets a subdirectory
        #[arg(long, default_value = "dump")]
        out: PathBuf,

        /// Container to export (repeatable; default is all three)
        #[arg(long = "container")]
        containers: Vec<String>,
    },
}

// ============================================================================
// API Response Types
// ============================================================================

/// Receipt from POST /messages
#[derive(Debug, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub document_ids: Vec<String>,
}

/// Error body from POST /messages
#[derive(Debug, Deserialize)]
pub struct SendError {
    pub error: String,
    pub kind: Option<String>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Read and validate a record file, returning the gzip payload.
fn build_payload(file: &PathBuf) -> anyhow::Result<Vec<u8>> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    relay_ingest::parse(&text).with_context(|| format!("{} is not a valid record", file.display()))?;
    Ok(relay_ingest::compress(&text)?)
}

fn http_client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?)
}

fn format_receipt(receipt: &SendReceipt) -> String {
    let mut out = format!("message_id  {}\n", receipt.message_id);
    for (label, id) in ["api_output", "input", "output"]
        .iter()
        .zip(receipt.document_ids.iter())
    {
        out.push_str(&format!("{:<11} {}\n", label, id));
    }
    out
}

#[derive(Debug, Default, PartialEq)]
struct DumpSummary {
    written: usize,
    skipped: usize,
}

/// `<id>.json`; the three documents of one record share the id, so the
/// per-container directories join on file name.
fn dump_file_name(document: &Value) -> Option<String> {
    let id = document.get("id")?.as_str()?;
    let usable = !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\']);
    usable.then(|| format!("{}.json", id))
}

async fn dump_container(
    store: &dyn DocumentStore,
    container: &str,
    out: &Path,
) -> anyhow::Result<DumpSummary> {
    let documents = store
        .query_all(container)
        .await
        .with_context(|| format!("Failed to read container {}", container))?;

    let dir = out.join(container);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut summary = DumpSummary::default();
    for document in &documents {
        let Some(name) = dump_file_name(document) else {
            eprintln!("Skipping a {} document without a usable id", container);
            summary.skipped += 1;
            continue;
        };
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(document)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        summary.written += 1;
    }
    Ok(summary)
}

async fn run_dump(config: &RelayConfig, out: &Path, containers: &[String]) -> anyhow::Result<()> {
    let names: Vec<String> = if containers.is_empty() {
        config
            .store
            .containers
            .names()
            .iter()
            .map(|n| n.to_string())
            .collect()
    } else {
        containers.to_vec()
    };

    let store = relay_core::create_store(&config.store).await?;
    for name in &names {
        let summary = dump_container(store.as_ref(), name, out).await?;
        println!(
            "{:<11} {} written, {} skipped",
            name, summary.written, summary.skipped
        );
    }
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_encode(file: &PathBuf) -> anyhow::Result<()> {
    let payload = build_payload(file)?;
    println!("{}", STANDARD.encode(payload));
    Ok(())
}

fn cmd_send(server: &str, file: &PathBuf, json: bool) -> anyhow::Result<()> {
    let payload = build_payload(file)?;
    let url = format!("{}/messages", server.trim_end_matches('/'));

    let response = http_client()?
        .post(&url)
        .header("content-type", "application/octet-stream")
        .body(payload)
        .send()
        .with_context(|| format!("Failed to reach relay at {}", url))?;

    let status = response.status();
    let body = response.text()?;

    if !status.is_success() {
        let detail = serde_json::from_str::<SendError>(&body)
            .map(|e| match e.kind {
                Some(kind) => format!("{} ({})", e.error, kind),
                None => e.error,
            })
            .unwrap_or(body);
        bail!("relay returned {}: {}", status, detail);
    }

    if json {
        println!("{}", body);
    } else {
        let receipt: SendReceipt = serde_json::from_str(&body)?;
        print!("{}", format_receipt(&receipt));
    }
    Ok(())
}

fn cmd_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server.trim_end_matches('/'));
    let response = http_client()?
        .get(&url)
        .send()
        .with_context(|| format!("Failed to reach relay at {}", url))?;

    let status = response.status();
    let body: serde_json::Value = response.json()?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        bail!("relay unhealthy ({})", status);
    }
    Ok(())
}

fn cmd_dump(config_path: &str, out: &Path, containers: &[String]) -> anyhow::Result<()> {
    let config = RelayConfig::load(Some(config_path))
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_dump(&config, out, containers))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Encode { file } => cmd_encode(file),
        Commands::Send { file, json } => cmd_send(&cli.server, file, *json),
        Commands::Status => cmd_status(&cli.server),
        Commands::Dump {
            config,
            out,
            containers,
        } => cmd_dump(config, out, containers),
    }
}
