use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pricefeed_ingest::{
    consume_one_batch, coordinator_from_config, handle_value, IngestConfig, IngestError,
};
use pricefeed_queue::{sqs_client, ReceiveOptions, SqsQueue};
use pricefeed_storage::{PgPriceStore, PriceStore};
use serde_json::json;
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "pricefeed-cli")]
#[command(about = "Retail price feed ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the price table, or apply a SQL file when --file is given.
    Migrate {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Ingest a single JSON document from disk.
    ConsumeFile { path: PathBuf },
    /// Receive one batch from the queue and process it.
    ConsumeBatch {
        #[arg(long)]
        max_messages: Option<i32>,
        #[arg(long)]
        wait: Option<i32>,
        #[arg(long)]
        visibility: Option<i32>,
    },
    /// Handle an invocation event read from a JSON file.
    Invoke { event: PathBuf },
    /// Serve invocation events over HTTP.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_from_env()?;
    let cli = Cli::parse();
    let config = IngestConfig::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Migrate { file } => {
            let store = PgPriceStore::new(&config.database)?;
            match file {
                Some(path) => {
                    store.apply_migration_file(&path).await?;
                    info!(path = %path.display(), "migration applied");
                }
                None => {
                    store.ensure_schema().await?;
                    info!("schema ensured");
                }
            }
            print_json(&json!({"ok": true}))?;
        }
        Commands::ConsumeFile { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let coordinator = coordinator_from_config(&config).await?;
            match coordinator.process_file_contents(&bytes).await {
                Ok(upserted) => print_json(&json!({"ok": true, "upserted": upserted}))?,
                Err(err @ IngestError::Storage(_)) => return Err(err.into()),
                Err(err) => {
                    print_json(&json!({"ok": false, "error": err.to_string()}))?;
                    bail!("{} was rejected", path.display());
                }
            }
        }
        Commands::ConsumeBatch {
            max_messages,
            wait,
            visibility,
        } => {
            if !config.queue.is_sqs() {
                bail!("QUEUE_PROVIDER={} does not support consume-batch", config.queue.provider);
            }
            let queue_url = config
                .queue
                .queue_url
                .clone()
                .context("SQS_QUEUE_URL is required for consume-batch")?;
            let base = config.queue.receive;
            let options = ReceiveOptions {
                max_messages: max_messages.unwrap_or(base.max_messages),
                wait_seconds: wait.unwrap_or(base.wait_seconds),
                visibility_timeout: visibility.unwrap_or(base.visibility_timeout),
            };
            let queue = SqsQueue::new(sqs_client(&config.queue.region).await, queue_url, options);
            let coordinator = coordinator_from_config(&config).await?;
            let summary = consume_one_batch(&queue, &coordinator).await?;
            print_json(&serde_json::to_value(summary)?)?;
        }
        Commands::Invoke { event } => {
            let raw = tokio::fs::read_to_string(&event)
                .await
                .with_context(|| format!("reading {}", event.display()))?;
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not JSON", event.display()))?;
            let coordinator = coordinator_from_config(&config).await?;
            let response = handle_value(&coordinator, value).await?;
            print_json(&serde_json::to_value(response)?)?;
        }
        Commands::Serve { port } => {
            let coordinator = coordinator_from_config(&config).await?;
            let state = pricefeed_web::AppState::new(Arc::new(coordinator));
            pricefeed_web::serve(state, port.unwrap_or(config.web_port)).await?;
        }
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
