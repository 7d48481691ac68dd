use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::chain::ChainEvent;
use crate::chain::monitor::{ChainMonitor, Health, MonitorError};
use crate::config::Config;
use crate::entities::EntityResolver;
use crate::fanout::{ConnectionRegistry, OutboundEvent};
use crate::processors::ProcessorSet;
use crate::rpc::NodeClient;
use crate::store::SignalStore;

/// Ties the monitor, processors and store together: one poll cycle in,
/// persisted signals and subscriber notices out.
pub struct Pipeline<C> {
    monitor: ChainMonitor<C>,
    processors: ProcessorSet,
    resolver: EntityResolver,
    store: SignalStore,
    registry: Arc<ConnectionRegistry>,
    dedup_window_secs: u64,
    poll_interval: Duration,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl<C: NodeClient> Pipeline<C> {
    pub fn new(
        monitor: ChainMonitor<C>,
        processors: ProcessorSet,
        resolver: EntityResolver,
        store: SignalStore,
        registry: Arc<ConnectionRegistry>,
        cfg: &Config,
    ) -> Self {
        Self {
            monitor,
            processors,
            resolver,
            store,
            registry,
            dedup_window_secs: cfg.store.dedup_window_secs,
            poll_interval: Duration::from_secs(cfg.node.poll_interval_secs.max(1)),
            backoff_base_ms: cfg.monitor.backoff_base_ms,
            backoff_max_ms: cfg.monitor.backoff_max_ms,
        }
    }

    /// Poll forever. Node failures back off exponentially; an irreconcilable
    /// divergence is fatal and bubbles up to the caller.
    pub async fn run(mut self) -> Result<(), MonitorError> {
        let mut backoff_ms = self.backoff_base_ms;
        loop {
            match self.monitor.poll().await {
                Ok(events) => {
                    backoff_ms = self.backoff_base_ms;
                    if let Err(e) = self.handle_events(&events) {
                        error!(error = %e, "failed to persist signals for poll cycle");
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e @ MonitorError::IrreconcilableDivergence { .. }) => {
                    error!(error = %e, "halting pipeline");
                    return Err(e);
                }
                Err(MonitorError::Node(e)) => {
                    if let Health::Degraded {
                        consecutive_failures,
                    } = self.monitor.health()
                    {
                        error!(consecutive_failures, "monitor degraded, node still unreachable");
                    }
                    warn!(error = %e, backoff_ms, "node poll failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms.saturating_mul(2)).min(self.backoff_max_ms);
                }
            }
        }
    }

    /// Apply one poll cycle's events: supersede first on reorg, then let the
    /// processors replay, then append whatever they produced. Returns the ids
    /// of newly stored signals.
    pub fn handle_events(&mut self, events: &[ChainEvent]) -> Result<Vec<i64>, rusqlite::Error> {
        let mut candidates = Vec::new();
        for event in events {
            match event {
                ChainEvent::Reorg {
                    ancestor_height,
                    blocks,
                } => {
                    // Store invalidation happens before processor replay so a
                    // concurrent insight worker can't claim doomed signals.
                    let invalidated = self.store.mark_superseded(ancestor_height + 1)?;
                    warn!(
                        ancestor_height,
                        replaced = blocks.len(),
                        invalidated,
                        "chain reorganization"
                    );
                    self.registry.broadcast(&OutboundEvent::ReorgNotice {
                        ancestor_height: *ancestor_height,
                    });
                }
                ChainEvent::NewBlock(block) => {
                    debug!(height = block.height, hash = %block.hash, "new block");
                    self.registry.broadcast(&OutboundEvent::ChainMilestone {
                        height: block.height,
                        hash: block.hash.clone(),
                    });
                }
                ChainEvent::MempoolUpdate(snapshot) => {
                    if snapshot.anomalous {
                        info!(median_fee = snapshot.fees.p50, "anomalous mempool snapshot");
                    }
                }
            }
            candidates.extend(self.processors.run(event, &self.resolver));
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.store.append_batch(&candidates, self.dedup_window_secs)?;
        info!(
            produced = candidates.len(),
            stored = ids.len(),
            "poll cycle signals persisted"
        );
        Ok(ids)
    }
}
