pub mod provider;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::InsightConfig;
use crate::fanout::{ConnectionRegistry, OutboundEvent};
use crate::store::{EvidenceRef, InsightWriteOutcome, SignalStore, StoredSignal};
use provider::{InferenceProvider, InsightDraft, InsightRequest, ProviderChain, ProviderError};

const MAX_EVIDENCE_TXS: usize = 5;

/// Counters for the generation loop. Plain atomics; a snapshot is taken
/// for periodic logging.
#[derive(Debug, Default)]
pub struct GeneratorMetrics {
    pub generated: AtomicU64,
    pub failed_calls: AtomicU64,
    pub skipped: AtomicU64,
    pub discarded_superseded: AtomicU64,
    pub provider_calls: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub generated: u64,
    pub failed_calls: u64,
    pub skipped: u64,
    pub discarded_superseded: u64,
    pub provider_calls: u64,
    pub avg_latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl GeneratorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let calls = self.provider_calls.load(Ordering::Relaxed);
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            generated: self.generated.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            discarded_superseded: self.discarded_superseded.load(Ordering::Relaxed),
            provider_calls: calls,
            avg_latency_ms: if calls == 0 { 0 } else { total / calls },
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

enum GenerateFailure {
    Provider(ProviderError),
    Invalid(&'static str),
}

impl fmt::Display for GenerateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerateFailure::Provider(e) => write!(f, "{e}"),
            GenerateFailure::Invalid(reason) => write!(f, "invalid draft: {reason}"),
        }
    }
}

/// One generation worker: claims stored signals, drives the provider chain
/// with bounded retries, validates the draft and persists it atomically.
/// Multiple workers share the store; the claim protocol keeps them from
/// colliding.
pub struct InsightWorker<P> {
    store: SignalStore,
    providers: ProviderChain<P>,
    registry: Arc<ConnectionRegistry>,
    cfg: InsightConfig,
    metrics: Arc<GeneratorMetrics>,
    worker_id: u32,
    claim_ttl_secs: u64,
    claim_nonce: i64,
    claim_seq: u64,
}

// Distinguishes claim tokens across process restarts: a crashed run can
// leave live claims behind, and a fresh worker with the same id must not
// mint a token matching one of them before the TTL reclaims the row.
fn claim_nonce() -> i64 {
    static SALT: AtomicU64 = AtomicU64::new(0);
    let salt = SALT.fetch_add(1, Ordering::Relaxed) as i64;
    (Utc::now().timestamp_millis() + std::process::id() as i64 + salt) & 0x7f_ffff
}

impl<P: InferenceProvider> InsightWorker<P> {
    pub fn new(
        store: SignalStore,
        providers: ProviderChain<P>,
        registry: Arc<ConnectionRegistry>,
        cfg: InsightConfig,
        claim_ttl_secs: u64,
        metrics: Arc<GeneratorMetrics>,
        worker_id: u32,
    ) -> Self {
        Self {
            store,
            providers,
            registry,
            cfg,
            metrics,
            worker_id,
            claim_ttl_secs,
            claim_nonce: claim_nonce(),
            claim_seq: 0,
        }
    }

    // Unique across workers and restarts: process nonce in the high bits,
    // then worker id, then the local sequence.
    fn next_claim_token(&mut self) -> i64 {
        self.claim_seq += 1;
        (self.claim_nonce << 40)
            | (((self.worker_id as i64) & 0xff) << 32)
            | (self.claim_seq as i64 & 0xffff_ffff)
    }

    pub async fn run(mut self) {
        let idle = Duration::from_secs(self.cfg.poll_interval_secs.max(1));
        loop {
            match self.run_once().await {
                Ok(0) => tokio::time::sleep(idle).await,
                Ok(n) => debug!(worker = self.worker_id, handled = n, "batch complete"),
                Err(e) => {
                    error!(worker = self.worker_id, error = %e, "claim failed");
                    tokio::time::sleep(idle).await;
                }
            }
        }
    }

    /// Claim and handle one batch. Returns how many signals were claimed.
    pub async fn run_once(&mut self) -> Result<usize, rusqlite::Error> {
        let token = self.next_claim_token();
        let batch = self.store.claim_unprocessed(
            self.cfg.min_confidence,
            self.cfg.batch_size,
            token,
            self.claim_ttl_secs,
        )?;
        let n = batch.len();
        for signal in batch {
            if let Err(e) = self.handle(signal).await {
                error!(worker = self.worker_id, error = %e, "store error while handling signal");
            }
        }
        Ok(n)
    }

    async fn handle(&self, signal: StoredSignal) -> Result<(), rusqlite::Error> {
        let request = build_request(&signal);
        match self.generate_validated(&request).await {
            Ok(draft) => self.persist(&signal, draft).await,
            Err(last) => {
                let attempts = signal.attempts + 1;
                if attempts >= self.cfg.max_attempts {
                    let reason = format!("generation failed after {attempts} attempts: {last}");
                    warn!(signal = signal.id, %reason, "skipping signal");
                    self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
                    self.store.mark_skipped(signal.id, &reason)
                } else {
                    debug!(signal = signal.id, attempt = attempts, error = %last, "releasing claim for retry");
                    self.store.release_claim(signal.id)
                }
            }
        }
    }

    /// Inner retry loop: each provider-chain call is bounded by the request
    /// timeout, and an invalid draft counts as a failed call.
    async fn generate_validated(
        &self,
        request: &InsightRequest,
    ) -> Result<InsightDraft, GenerateFailure> {
        let deadline = Duration::from_secs(self.cfg.request_timeout_secs.max(1));
        let mut last = GenerateFailure::Provider(ProviderError::NoProvider);
        for round in 0..=self.cfg.retries_per_attempt {
            if round > 0 {
                let backoff = self.cfg.retry_backoff_ms.saturating_mul(round as u64);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            let started = Instant::now();
            self.metrics.provider_calls.fetch_add(1, Ordering::Relaxed);
            let outcome = match timeout(deadline, self.providers.generate(request)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(ProviderError::Timeout),
            };
            self.metrics
                .total_latency_ms
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            match outcome {
                Ok(draft) => match self.validate(&draft) {
                    Ok(()) => {
                        if let Some(usage) = &draft.usage {
                            self.metrics
                                .input_tokens
                                .fetch_add(usage.input_tokens, Ordering::Relaxed);
                            self.metrics
                                .output_tokens
                                .fetch_add(usage.output_tokens, Ordering::Relaxed);
                        }
                        return Ok(draft);
                    }
                    Err(reason) => {
                        self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);
                        warn!(reason, "draft rejected by validation");
                        last = GenerateFailure::Invalid(reason);
                    }
                },
                Err(e) => {
                    self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);
                    last = GenerateFailure::Provider(e);
                }
            }
        }
        Err(last)
    }

    // An invalid draft never reaches the store.
    fn validate(&self, draft: &InsightDraft) -> Result<(), &'static str> {
        if draft.headline.trim().is_empty() {
            return Err("empty headline");
        }
        if draft.headline.chars().count() > self.cfg.headline_max_chars {
            return Err("headline over length limit");
        }
        if draft.summary.trim().is_empty() {
            return Err("empty summary");
        }
        if draft.evidence.is_empty() {
            return Err("no evidence refs");
        }
        Ok(())
    }

    async fn persist(
        &self,
        signal: &StoredSignal,
        draft: InsightDraft,
    ) -> Result<(), rusqlite::Error> {
        let category = signal.signal_type.as_str();
        let outcome = self.store.insert_insight_and_mark(
            signal.id,
            category,
            &draft.headline,
            &draft.summary,
            &draft.evidence,
            signal.confidence,
        )?;
        match outcome {
            InsightWriteOutcome::Written(insight_id) => {
                self.metrics.generated.fetch_add(1, Ordering::Relaxed);
                info!(
                    signal = signal.id,
                    insight = insight_id,
                    category,
                    height = signal.source_height,
                    "insight written"
                );
                if let Some(record) = self.store.insight_for_signal(signal.id)? {
                    self.registry.broadcast(&OutboundEvent::Insight(record));
                }
                Ok(())
            }
            InsightWriteOutcome::Superseded => {
                // Reorg invalidated the source while generation was in flight.
                self.metrics
                    .discarded_superseded
                    .fetch_add(1, Ordering::Relaxed);
                info!(signal = signal.id, "discarding insight for superseded signal");
                self.store.mark_skipped(signal.id, "superseded by reorg")
            }
            InsightWriteOutcome::AlreadyProcessed => {
                warn!(signal = signal.id, "signal already processed, dropping draft");
                Ok(())
            }
            InsightWriteOutcome::Missing => {
                warn!(signal = signal.id, "claimed signal vanished from store");
                Ok(())
            }
        }
    }
}

/// Evidence starts from the source block; tx refs come from the signal's
/// own payload when the processor recorded any.
fn build_request(signal: &StoredSignal) -> InsightRequest {
    let mut evidence = vec![EvidenceRef::Block(signal.source_height)];
    if let Some(txids) = signal.metadata.get("txids").and_then(|v| v.as_array()) {
        for txid in txids.iter().take(MAX_EVIDENCE_TXS) {
            if let Some(t) = txid.as_str() {
                evidence.push(EvidenceRef::Tx(t.to_string()));
            }
        }
    }
    InsightRequest {
        signal_type: signal.signal_type,
        source_height: signal.source_height,
        confidence: signal.confidence,
        metadata: signal.metadata.clone(),
        evidence,
    }
}
