use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use durable_ingest::activities::{register_metadata_activities, FsBlobSource, SqliteMetadataSink};
use durable_ingest::config::EngineConfig;
use durable_ingest::logging::{init_logging, LoggingConfig};
use durable_ingest::providers::sqlite::SqliteHistoryStore;
use durable_ingest::providers::HistoryStore;
use durable_ingest::runtime::ActivityRegistry;
use durable_ingest::trigger::{request_for_upload, BlobCreatedEvent, TriggerRequest};
use durable_ingest::{InstanceStatus, Runtime, RuntimeOptions};

#[derive(Parser)]
#[command(name = "ingest-cli", about = "Durable upload metadata ingestion")]
struct Cli {
    /// History store database
    #[arg(long, env = "INGEST_HISTORY_DB", default_value = "sqlite:ingest-history.db")]
    history_db: String,
    /// Directory holding blobs as <container>/<name>
    #[arg(long, env = "INGEST_BLOB_ROOT", default_value = "./blobs")]
    blob_root: PathBuf,
    /// Metadata sink database
    #[arg(long, env = "INGEST_METADATA_DB", default_value = "sqlite:ingest-metadata.db")]
    metadata_db: String,
    /// Engine configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// How long to wait for instances to finish
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a local file into a container and ingest it
    Ingest {
        file: PathBuf,
        #[arg(long, default_value = "images-input")]
        container: String,
    },
    /// Start an instance from a blob-created notification (JSON file)
    Notify { event: PathBuf },
    /// Print the status of an instance
    Status { instance: String },
    /// Print the history of an instance as JSON lines
    History { instance: String },
    /// Cancel a running instance
    Cancel {
        instance: String,
        #[arg(long, default_value = "cancelled from cli")]
        reason: String,
    },
    /// Resume every unfinished instance and wait for them
    Recover,
}

fn print_status(instance: &str, status: &InstanceStatus) {
    match status {
        InstanceStatus::NotFound => println!("{instance}: not found"),
        InstanceStatus::Running => println!("{instance}: running"),
        InstanceStatus::Completed { output } => println!("{instance}: completed {output}"),
        InstanceStatus::Failed { error_kind, message } => println!("{instance}: failed {error_kind}: {message}"),
    }
}

async fn start_runtime(cli: &Cli, store: Arc<dyn HistoryStore>, options: RuntimeOptions) -> anyhow::Result<Arc<Runtime>> {
    let sink = SqliteMetadataSink::new(&cli.metadata_db)
        .await
        .with_context(|| format!("opening metadata database {}", cli.metadata_db))?;
    let registry = register_metadata_activities(
        ActivityRegistry::builder(),
        Arc::new(FsBlobSource::new(&cli.blob_root)),
        Arc::new(sink),
    )
    .build();
    Ok(Runtime::start_with_options(store, registry, options).await)
}

async fn run_to_completion(cli: &Cli, runtime: &Runtime, request: &TriggerRequest) -> anyhow::Result<()> {
    let outcome = runtime.trigger(request).await?;
    tracing::info!(instance_id = %request.instance_id, ?outcome, "trigger accepted");
    let status = runtime
        .client()
        .wait_for_instance(&request.instance_id, Duration::from_secs(cli.timeout_secs))
        .await?;
    print_status(&request.instance_id, &status);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let logging = config.logging.clone().unwrap_or_else(LoggingConfig::default);
    let _ = init_logging(&logging);
    let options = config.into_runtime_options()?;

    let store: Arc<dyn HistoryStore> = Arc::new(
        SqliteHistoryStore::new(&cli.history_db)
            .await
            .with_context(|| format!("opening history database {}", cli.history_db))?,
    );

    match &cli.command {
        Command::Ingest { file, container } => {
            let bytes = tokio::fs::read(file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                bail!("{} has no usable file name", file.display());
            };
            let path = FsBlobSource::new(&cli.blob_root).put(container, name, &bytes).await?;
            let request = request_for_upload(container, name, bytes.len() as u64, format!("file://{}", path.display()));
            let runtime = start_runtime(&cli, store, options).await?;
            let result = run_to_completion(&cli, &runtime, &request).await;
            runtime.shutdown().await;
            result?;
        }
        Command::Notify { event } => {
            let json = tokio::fs::read_to_string(event)
                .await
                .with_context(|| format!("reading {}", event.display()))?;
            let Some(request) = BlobCreatedEvent::from_json(&json)?.into_request()? else {
                println!("notification ignored");
                return Ok(());
            };
            let runtime = start_runtime(&cli, store, options).await?;
            let result = run_to_completion(&cli, &runtime, &request).await;
            runtime.shutdown().await;
            result?;
        }
        Command::Status { instance } => {
            let status = durable_ingest::Client::new(store).get_instance_status(instance).await?;
            print_status(instance, &status);
        }
        Command::History { instance } => {
            for event in store.read(instance).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Cancel { instance, reason } => {
            let runtime = start_runtime(&cli, store, options).await?;
            let decision = runtime.cancel_instance(instance, reason).await;
            runtime.shutdown().await;
            println!("{:?}", decision?);
        }
        Command::Recover => {
            let runtime = start_runtime(&cli, store.clone(), options).await?;
            let client = runtime.client();
            let timeout = Duration::from_secs(cli.timeout_secs);
            let mut failed = false;
            for instance in client.list_instances().await? {
                match client.wait_for_instance(&instance, timeout).await {
                    Ok(status) => print_status(&instance, &status),
                    Err(e) => {
                        failed = true;
                        eprintln!("{instance}: {e}");
                    }
                }
            }
            runtime.shutdown().await;
            if failed {
                bail!("some instances did not finish within {}s", cli.timeout_secs);
            }
        }
    }
    Ok(())
}
