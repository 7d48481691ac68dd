use serde_json::json;

use crate::chain::{ChainBlock, ChainEvent, MempoolSnapshot};
use crate::config::MempoolProcessorConfig;
use crate::entities::EntityResolver;
use crate::processors::{CandidateSignal, HeightWindow, SignalProcessor, SignalType, clip01};

/// Fee congestion detector. Tracks the median fee rate over a trailing window
/// (block fee stats and mempool snapshots feed the same baseline) and emits
/// when the relative change exceeds the configured threshold. Confidence is
/// the normalized z-score of the deviation, clipped to [0,1].
pub struct MempoolProcessor {
    cfg: MempoolProcessorConfig,
    window: HeightWindow,
    last_height: u64,
}

impl MempoolProcessor {
    pub fn new(cfg: MempoolProcessorConfig) -> Self {
        let window = HeightWindow::new(cfg.window);
        Self {
            cfg,
            window,
            last_height: 0,
        }
    }

    fn evaluate(
        &self,
        height: u64,
        median: f64,
        source: &str,
        tx_count: Option<u64>,
    ) -> Option<CandidateSignal> {
        if self.window.len() < self.cfg.min_samples {
            return None;
        }
        let mean = self.window.mean();
        if mean.abs() < 1e-9 {
            return None;
        }
        let relative = (median - mean) / mean;
        if relative.abs() < self.cfg.relative_threshold {
            return None;
        }
        let floor = (mean.abs() * 1e-3).max(1e-9);
        let z = (median - mean) / self.window.std_dev().max(floor);
        let mut metadata = json!({
            "source": source,
            "median_fee": median,
            "baseline_mean": mean,
            "relative_change": relative,
            "z_score": z,
        });
        if let Some(n) = tx_count {
            metadata["tx_count"] = json!(n);
        }
        Some(CandidateSignal {
            signal_type: SignalType::MempoolCongestion,
            source_height: height,
            confidence: clip01(z.abs() / self.cfg.z_saturation),
            metadata,
        })
    }

    fn on_block(&mut self, block: &ChainBlock) -> Option<CandidateSignal> {
        self.last_height = block.height;
        let signal = self.evaluate(block.height, block.fees.p50, "block", None);
        self.window.push(block.height, block.fees.p50);
        signal
    }

    fn on_snapshot(&mut self, snap: &MempoolSnapshot) -> Option<CandidateSignal> {
        let signal = self.evaluate(self.last_height, snap.fees.p50, "mempool", Some(snap.tx_count));
        self.window.push(self.last_height, snap.fees.p50);
        signal
    }
}

impl SignalProcessor for MempoolProcessor {
    fn name(&self) -> &'static str {
        "mempool"
    }

    fn process(&mut self, event: &ChainEvent, _resolver: &EntityResolver) -> Vec<CandidateSignal> {
        match event {
            ChainEvent::NewBlock(b) => self.on_block(b).into_iter().collect(),
            ChainEvent::MempoolUpdate(s) => self.on_snapshot(s).into_iter().collect(),
            ChainEvent::Reorg {
                ancestor_height,
                blocks,
            } => {
                self.window.trim_from(ancestor_height + 1);
                blocks.iter().filter_map(|b| self.on_block(b)).collect()
            }
        }
    }
}
