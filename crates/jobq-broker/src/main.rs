use clap::Parser;
use jobq_broker::{Broker, BrokerConfig, StorageBackend};
use jobq_worker::{
    EchoHandler, HandlerRegistry, Ledger, LedgerDebitHandler, SleepHandler,
    UppercaseRecordsHandler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "jq-broker")]
#[command(about = "Reliable asynchronous job execution service", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "jobq.yaml")]
    config: String,

    /// API host
    #[arg(long)]
    host: Option<String>,

    /// API port
    #[arg(long, env = "JOBQ_PORT")]
    port: Option<u16>,

    /// Number of worker slots
    #[arg(long)]
    concurrency: Option<usize>,

    /// Persist to RocksDB under this directory instead of memory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        BrokerConfig::from_file(&args.config)?
    } else {
        BrokerConfig::default()
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(data_dir) = args.data_dir {
        config.persistence.backend = StorageBackend::Rocksdb;
        config.persistence.data_dir = data_dir;
    }
    if args.json_logs {
        config.monitoring.json = true;
    }

    init_tracing(&config);
    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }
    tracing::info!("Starting broker with config: {:?}", config);

    let broker = Arc::new(Broker::new(config, demo_handlers())?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    broker.run(shutdown).await
}

fn init_tracing(config: &BrokerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.monitoring.log_level.clone().into());

    if config.monitoring.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

fn demo_handlers() -> HandlerRegistry {
    HandlerRegistry::builder()
        .task("echo", EchoHandler)
        .task("sleep", SleepHandler::new(1000))
        .task("ledger.debit", LedgerDebitHandler::new(Ledger::new()))
        .batch("records.uppercase", UppercaseRecordsHandler)
        .build()
}
