//! `authorityd`: CLI/daemon for issuing, validating, revoking and delegating
//! execution mandates, plus `dlq` operator commands over the authority bus's
//! dead-letter topic.

mod keystore;
mod metrics;
mod rpc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use authority_bus::{check_dlq_alert, DlqEntry, EventBus, Producer, ProducerConfig, Topic};
use authority_core::cache::MandateCache;
use authority_core::store::{InMemoryStore, MandateStore, PersistentStore};
use authority_engine::{AuthorityEngine, EngineConfig, LedgerMaterializer, MaterializerConfig};

use keystore::Keystore;
use metrics::{DaemonMetrics, StatusState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase output verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Override log level (e.g. info, debug, trace).
    #[arg(long, env = "AUTHORITY_LOG_LEVEL")]
    log_level: Option<String>,
    /// HTTP bind address for metrics and health endpoints.
    #[arg(long, env = "AUTHORITY_STATUS_ADDR", default_value = "127.0.0.1:9090")]
    status_addr: String,
    /// HTTP bind address for the mandate RPC surface.
    #[arg(long, env = "AUTHORITY_RPC_ADDR", default_value = "127.0.0.1:8080")]
    rpc_addr: String,
    /// Directory containing the write-ahead ledger. Omit to run purely in
    /// memory (tests, local experimentation).
    #[arg(long, env = "AUTHORITY_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Directory of `<principal_id>.key` Ed25519 seed files this daemon may
    /// sign mandates with.
    #[arg(long, env = "AUTHORITY_KEYSTORE_DIR", default_value = "./keystore", value_name = "DIR")]
    keystore_dir: PathBuf,
    /// Subcommand.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the RPC server and background materializer tasks.
    Daemon,
    /// List messages currently parked on `authority.dlq`.
    DlqList {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Requeue a dead-lettered message back onto its original topic.
    DlqRequeue {
        /// Partition offset of the `authority.dlq` message to requeue.
        #[arg(long)]
        offset: u64,
        /// Original topic name recorded on the DLQ entry, e.g. `authority.issued`.
        #[arg(long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = cli
        .log_level
        .as_deref()
        .map(|lvl| lvl.to_ascii_uppercase())
        .map(|lvl| match lvl.as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            "INFO" => Level::INFO,
            _ => Level::INFO,
        })
        .unwrap_or_else(|| match cli.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        });
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_env_filter(env_filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store: Arc<dyn MandateStore> = match &cli.data_dir {
        Some(dir) => Arc::new(PersistentStore::open(dir)?),
        None => Arc::new(InMemoryStore::new()),
    };
    let bus = Arc::new(EventBus::new());
    let producer = Arc::new(Producer::new(bus.clone(), ProducerConfig::default()));
    let cache = Arc::new(MandateCache::new());
    let keystore = Arc::new(Keystore::load(&cli.keystore_dir)?);
    info!(principals = keystore.len(), "loaded issuer keystore");

    let engine = Arc::new(AuthorityEngine::new(
        store.clone(),
        cache,
        producer.clone(),
        EngineConfig::default(),
    ));

    match cli.command {
        Commands::Daemon => {
            daemon(engine, store, bus, producer, keystore, cli.status_addr, cli.rpc_addr).await
        }
        Commands::DlqList { limit } => dlq_list(&bus, limit),
        Commands::DlqRequeue { offset, topic } => dlq_requeue(&bus, &producer, offset, &topic),
    }
}

async fn daemon(
    engine: Arc<AuthorityEngine>,
    store: Arc<dyn MandateStore>,
    bus: Arc<EventBus>,
    _producer: Arc<Producer>,
    keystore: Arc<Keystore>,
    status_addr: String,
    rpc_addr: String,
) -> anyhow::Result<()> {
    let materializer_signing_key = SigningKey::generate(&mut OsRng);
    let materializer = Arc::new(LedgerMaterializer::new(
        store.clone(),
        MaterializerConfig::default(),
        materializer_signing_key,
    ));
    let merkle_task = materializer.spawn_merkle_batcher();
    let snapshot_task = materializer.spawn_snapshot_scheduler();

    let alert_bus = bus.clone();
    let alert_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            check_dlq_alert(&alert_bus, 1000);
        }
    });

    let daemon_metrics = DaemonMetrics::new();
    let status_state = StatusState {
        metrics: daemon_metrics.clone(),
        engine: engine.clone(),
        bus: bus.clone(),
    };
    let status_router = metrics::router(status_state);
    let status_listener = tokio::net::TcpListener::bind(&status_addr).await?;
    info!(addr = %status_addr, "status server listening");
    let status_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(status_listener, status_router).await {
            tracing::error!(%err, "status server exited");
        }
    });

    let rpc_state = Arc::new(rpc::RpcState {
        engine: engine.clone(),
        store,
        keystore,
        metrics: daemon_metrics,
    });
    let rpc_router = rpc::router(rpc_state);
    let rpc_listener = tokio::net::TcpListener::bind(&rpc_addr).await?;
    info!(addr = %rpc_addr, "rpc server listening");
    let rpc_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(rpc_listener, rpc_router).await {
            tracing::error!(%err, "rpc server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining materializer");
    materializer.shutdown();
    let _ = merkle_task.await;
    let _ = snapshot_task.await;
    alert_task.abort();
    status_task.abort();
    rpc_task.abort();
    Ok(())
}

fn dlq_list(bus: &EventBus, limit: usize) -> anyhow::Result<()> {
    for message in bus.dlq_messages(limit) {
        println!(
            "offset={} principal={} dedup_key={} published_at_millis={}",
            message.offset, message.principal_id, message.dedup_key, message.published_at_millis
        );
    }
    Ok(())
}

fn dlq_requeue(bus: &EventBus, producer: &Producer, offset: u64, topic: &str) -> anyhow::Result<()> {
    let target = Topic::from_name(topic)
        .ok_or_else(|| anyhow::anyhow!("unknown original topic name: {topic}"))?;
    let message = bus
        .dlq_messages(usize::MAX)
        .into_iter()
        .find(|m| m.offset == offset)
        .ok_or_else(|| anyhow::anyhow!("no authority.dlq message at offset {offset}"))?;
    let entry: DlqEntry = serde_json::from_value(message.payload)
        .map_err(|err| anyhow::anyhow!("dlq entry at offset {offset} is not a DlqEntry: {err}"))?;
    producer.publish(
        target,
        &message.principal_id,
        format!("requeue:{}", message.dedup_key),
        entry.payload,
    )?;
    info!(offset, topic, "requeued dead-lettered message");
    Ok(())
}
