mod chain;
mod config;
mod entities;
mod fanout;
mod insight;
mod processors;
mod rpc;
mod store;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::chain::monitor::ChainMonitor;
use crate::chain::pipeline::Pipeline;
use crate::config::Config;
use crate::entities::EntityResolver;
use crate::fanout::ConnectionRegistry;
use crate::fanout::ws::{self, StaticTokens};
use crate::insight::provider::ProviderChain;
use crate::insight::{GeneratorMetrics, InsightWorker};
use crate::processors::ProcessorSet;
use crate::rpc::NodeRpc;
use crate::store::SignalStore;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("chainpulse=info".parse().unwrap()),
        )
        .init();

    tracing::info!("⚡ ChainPulse starting...");

    // Load configuration
    let config = Config::load("config.toml");
    tracing::info!("Config: {:?}", config);

    // Open the signal store
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create database directory");
    }
    let store = SignalStore::open(db_path).expect("Failed to open signal store");
    tracing::info!("Signal store opened at {}", config.database.path);

    // Load known entities from CSV if available
    if let Some(ref csv_path_str) = config.database.entities_csv {
        let csv_path = Path::new(csv_path_str);
        if csv_path.exists() {
            match store.load_entities_from_csv(csv_path) {
                Ok(count) => tracing::info!("Loaded {count} entity addresses from CSV"),
                Err(e) => tracing::warn!("Failed to load entities CSV: {e}"),
            }
        }
    }

    // Build the in-memory entity lookup
    let records = store
        .all_entities()
        .expect("Failed to read entities from store");
    let resolver = EntityResolver::from_records(records);
    tracing::info!("Entity resolver ready ({} entities)", resolver.len());

    // Subscriber registry and WebSocket endpoint
    let heartbeat = Duration::from_secs(config.fanout.heartbeat_secs.max(1));
    let registry = Arc::new(ConnectionRegistry::new(
        config.fanout.queue_capacity,
        config.fanout.recent_window,
        heartbeat * config.fanout.missed_heartbeat_limit.max(1),
    ));
    let verifier = Arc::new(StaticTokens::new(
        config
            .fanout
            .auth_tokens
            .iter()
            .map(|e| (e.token.clone(), e.subject.clone())),
    ));
    {
        let registry = registry.clone();
        let listen = config.fanout.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = ws::serve(&listen, registry, verifier).await {
                tracing::error!("subscriber endpoint failed: {e}");
            }
        });
    }
    ws::spawn_heartbeat_sweeper(registry.clone(), heartbeat);

    // Carry the anonymous replay window across restarts
    match store.recent_insights(config.fanout.recent_window) {
        Ok(mut recent) => {
            recent.reverse(); // oldest first
            registry.seed_recent(recent);
        }
        Err(e) => tracing::warn!("Failed to preload recent insights: {e}"),
    }

    // Insight generation workers
    let metrics = Arc::new(GeneratorMetrics::default());
    if config.insight.providers.is_empty() {
        tracing::warn!("no inference providers configured; insight generation disabled");
    } else {
        let timeout = Duration::from_secs(config.insight.request_timeout_secs.max(1));
        for worker_id in 0..config.insight.workers.max(1) {
            let providers = ProviderChain::from_endpoints(&config.insight.providers, timeout)
                .expect("Failed to build provider clients");
            let worker = InsightWorker::new(
                store.clone(),
                providers,
                registry.clone(),
                config.insight.clone(),
                config.store.claim_ttl_secs,
                metrics.clone(),
                worker_id,
            );
            tokio::spawn(worker.run());
        }
        tracing::info!("{} insight workers started", config.insight.workers.max(1));
    }

    // Periodic metrics log
    {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tracing::info!(snapshot = ?metrics.snapshot(), "insight generation metrics");
            }
        });
    }

    // Chain monitor + processor pipeline (foreground)
    let node = NodeRpc::new(
        &config.node.rpc_url,
        config.node.rpc_user.as_deref(),
        config.node.rpc_password.as_deref(),
        config.node.request_timeout_secs,
    )
    .expect("Failed to build node RPC client");
    let monitor = ChainMonitor::new(node, &config.monitor);
    let processors = ProcessorSet::from_config(&config.processors);
    let pipeline = Pipeline::new(monitor, processors, resolver, store, registry, &config);
    tracing::info!("Pipeline started");

    if let Err(e) = pipeline.run().await {
        tracing::error!("pipeline halted: {e}");
        std::process::exit(1);
    }
}
