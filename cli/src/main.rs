use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use serde_json::Value;
use serde_json::json;
use skipper_browser::SessionRegistry;
use skipper_browser::handlers;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Browser automation session orchestrator.
///
/// `serve` speaks JSON lines on stdin/stdout: each request is
/// `{"op": "...", "params": {...}, "id"?: ...}` and each reply is the
/// success/error envelope with the request id echoed back.
#[derive(Debug, Parser)]
#[clap(name = "skipper", version)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the JSON-lines request loop on stdin/stdout (the default).
    Serve,
    /// Issue a single operation and print its envelope.
    Call {
        /// Operation name, e.g. launch, navigate, snapshot, click, close.
        op: String,
        /// JSON request body.
        #[clap(default_value = "{}")]
        params: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to build tokio runtime")?;
    runtime.block_on(async move {
        match cli.command.unwrap_or(Command::Serve) {
            Command::Serve => serve().await,
            Command::Call { op, params } => call(&op, &params).await,
        }
    })
}

/// Requests run concurrently (sessions are independent and intra-session
/// ordering is the library's job) while a single writer task keeps stdout
/// line-atomic. Replies carry the request id for correlation.
async fn serve() -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = reply_rx.recv().await {
            if stdout
                .write_all(format!("{envelope}\n").as_bytes())
                .await
                .is_err()
            {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!("ready for requests");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(&line) {
            Ok(request) => {
                let registry = Arc::clone(&registry);
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let op = request
                        .get("op")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));
                    let id = request.get("id").cloned();

                    let mut envelope = handlers::dispatch(&registry, &op, params).await;
                    if let (Some(id), Some(object)) = (id, envelope.as_object_mut()) {
                        object.insert("id".to_string(), id);
                    }
                    let _ = reply_tx.send(envelope);
                });
            }
            Err(e) => {
                let _ = reply_tx.send(json!({
                    "success": false,
                    "error": format!("invalid request: {e}"),
                    "code": "invalid_input",
                }));
            }
        }
    }

    // stdin closed: tear down every session so no browser process outlives us.
    registry.close_all().await;
    drop(reply_tx);
    let _ = writer.await;
    Ok(())
}

async fn call(op: &str, params: &str) -> anyhow::Result<()> {
    let params: Value =
        serde_json::from_str(params).with_context(|| format!("params is not JSON: {params}"))?;

    let registry = SessionRegistry::new();
    let envelope = handlers::dispatch(&registry, op, params).await;
    println!("{envelope}");

    // A one-shot launch would orphan its browser; close what we created.
    registry.close_all().await;
    Ok(())
}
