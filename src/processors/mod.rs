pub mod exchange_flow;
pub mod mempool;
pub mod miner_treasury;
pub mod predictive;
pub mod whale;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::chain::ChainEvent;
use crate::config::ProcessorsConfig;
use crate::entities::EntityResolver;

/// Category of a produced signal, one per processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    MempoolCongestion,
    ExchangeFlow,
    MinerTreasury,
    WhaleAccumulation,
    Forecast,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::MempoolCongestion => "mempool_congestion",
            SignalType::ExchangeFlow => "exchange_flow",
            SignalType::MinerTreasury => "miner_treasury",
            SignalType::WhaleAccumulation => "whale_accumulation",
            SignalType::Forecast => "forecast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mempool_congestion" => Some(SignalType::MempoolCongestion),
            "exchange_flow" => Some(SignalType::ExchangeFlow),
            "miner_treasury" => Some(SignalType::MinerTreasury),
            "whale_accumulation" => Some(SignalType::WhaleAccumulation),
            "forecast" => Some(SignalType::Forecast),
            _ => None,
        }
    }
}

/// What a processor emits: a signal before it has an identity. The store
/// assigns the id and rejects duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub signal_type: SignalType,
    pub source_height: u64,
    pub confidence: f64,
    pub metadata: serde_json::Value,
}

/// A signal processor consumes chain events and emits candidate signals.
/// No I/O: rerunning one on an identical event stream yields identical
/// payloads (dedup is the store's concern).
pub trait SignalProcessor: Send {
    fn name(&self) -> &'static str;
    fn process(&mut self, event: &ChainEvent, resolver: &EntityResolver) -> Vec<CandidateSignal>;
}

/// All enabled processors, run in sequence over each chain event.
pub struct ProcessorSet {
    processors: Vec<Box<dyn SignalProcessor>>,
}

impl ProcessorSet {
    pub fn from_config(cfg: &ProcessorsConfig) -> Self {
        let mut processors: Vec<Box<dyn SignalProcessor>> = Vec::new();
        if cfg.mempool.enabled {
            processors.push(Box::new(mempool::MempoolProcessor::new(cfg.mempool.clone())));
        }
        if cfg.exchange_flow.enabled {
            processors.push(Box::new(exchange_flow::ExchangeFlowProcessor::new(
                cfg.exchange_flow.clone(),
            )));
        }
        if cfg.miner_treasury.enabled {
            processors.push(Box::new(miner_treasury::MinerTreasuryProcessor::new(
                cfg.miner_treasury.clone(),
            )));
        }
        if cfg.whale.enabled {
            processors.push(Box::new(whale::WhaleProcessor::new(cfg.whale.clone())));
        }
        if cfg.predictive.enabled {
            processors.push(Box::new(predictive::PredictiveProcessor::new(
                cfg.predictive.clone(),
            )));
        }
        tracing::info!(count = processors.len(), "signal processors enabled");
        Self { processors }
    }

    pub fn run(&mut self, event: &ChainEvent, resolver: &EntityResolver) -> Vec<CandidateSignal> {
        let mut out = Vec::new();
        for p in &mut self.processors {
            let produced = p.process(event, resolver);
            if !produced.is_empty() {
                tracing::debug!(processor = p.name(), count = produced.len(), "signals emitted");
            }
            out.extend(produced);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }
}

pub(crate) fn clip01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Bounded series of height-tagged observations. Supports trimming every
/// entry at or above a reorg watermark so superseded blocks drop out of
/// baselines before the corrected chain is replayed.
#[derive(Debug, Default)]
pub(crate) struct HeightWindow {
    entries: VecDeque<(u64, f64)>,
    capacity: usize,
}

impl HeightWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, height: u64, value: f64) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((height, value));
    }

    /// Drop every entry with height >= `from_height`.
    pub fn trim_from(&mut self, from_height: u64) {
        self.entries.retain(|(h, _)| *h < from_height);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn mean(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().map(|(_, v)| v).sum::<f64>() / self.entries.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        let n = self.entries.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .entries
            .iter()
            .map(|(_, v)| (v - mean) * (v - mean))
            .sum::<f64>()
            / n as f64;
        var.sqrt()
    }

    pub fn sum(&self) -> f64 {
        self.entries.iter().map(|(_, v)| v).sum()
    }

    pub fn values(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.entries.iter().copied()
    }
}
