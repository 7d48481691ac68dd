use std::collections::HashMap;

use serde_json::json;

use crate::chain::{ChainBlock, ChainEvent};
use crate::config::ExchangeFlowConfig;
use crate::entities::{EntityKind, EntityResolver};
use crate::processors::{CandidateSignal, HeightWindow, SignalProcessor, SignalType, clip01};

const MAX_EVIDENCE_TXIDS: usize = 5;

/// Sums inbound/outbound value per resolved exchange within each new block
/// and emits when the net flow crosses the absolute threshold and stands out
/// against that entity's rolling per-block baseline.
pub struct ExchangeFlowProcessor {
    cfg: ExchangeFlowConfig,
    baselines: HashMap<String, HeightWindow>,
}

struct BlockFlow {
    inflow: u64,
    outflow: u64,
    txids: Vec<String>,
}

impl ExchangeFlowProcessor {
    pub fn new(cfg: ExchangeFlowConfig) -> Self {
        Self {
            cfg,
            baselines: HashMap::new(),
        }
    }

    fn on_block(&mut self, block: &ChainBlock, resolver: &EntityResolver) -> Vec<CandidateSignal> {
        let mut flows: HashMap<String, BlockFlow> = HashMap::new();

        for tx in &block.txs {
            for side in &tx.outputs {
                if let Some(entity) = resolver.resolve(&side.address) {
                    if entity.kind == EntityKind::Exchange {
                        let f = flows.entry(entity.id.clone()).or_insert(BlockFlow {
                            inflow: 0,
                            outflow: 0,
                            txids: Vec::new(),
                        });
                        f.inflow += side.value;
                        if f.txids.len() < MAX_EVIDENCE_TXIDS && !f.txids.contains(&tx.txid) {
                            f.txids.push(tx.txid.clone());
                        }
                    }
                }
            }
            for side in &tx.inputs {
                if let Some(entity) = resolver.resolve(&side.address) {
                    if entity.kind == EntityKind::Exchange {
                        let f = flows.entry(entity.id.clone()).or_insert(BlockFlow {
                            inflow: 0,
                            outflow: 0,
                            txids: Vec::new(),
                        });
                        f.outflow += side.value;
                        if f.txids.len() < MAX_EVIDENCE_TXIDS && !f.txids.contains(&tx.txid) {
                            f.txids.push(tx.txid.clone());
                        }
                    }
                }
            }
        }

        let mut signals = Vec::new();
        // Deterministic emission order regardless of map iteration.
        let mut entity_ids: Vec<String> = flows.keys().cloned().collect();
        entity_ids.sort();

        for entity_id in entity_ids {
            let flow = &flows[&entity_id];
            let net = flow.inflow as i64 - flow.outflow as i64;
            let magnitude = net.unsigned_abs();

            let window = self
                .baselines
                .entry(entity_id.clone())
                .or_insert_with(|| HeightWindow::new(self.cfg.window));

            let baseline = if window.is_empty() {
                self.cfg.min_absolute_flow as f64
            } else {
                window.mean().max(1.0)
            };

            let above_absolute = magnitude >= self.cfg.min_absolute_flow;
            let above_relative =
                window.is_empty() || magnitude as f64 >= baseline * self.cfg.relative_multiple;

            if above_absolute && above_relative {
                let entity = resolver
                    .resolve_entity_id(&entity_id)
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| entity_id.clone());
                signals.push(CandidateSignal {
                    signal_type: SignalType::ExchangeFlow,
                    source_height: block.height,
                    confidence: clip01(
                        magnitude as f64 / (baseline * self.cfg.saturation_multiple),
                    ),
                    metadata: json!({
                        "entity_id": entity_id,
                        "entity_name": entity,
                        "inflow": flow.inflow,
                        "outflow": flow.outflow,
                        "net": net,
                        "direction": if net >= 0 { "inflow" } else { "outflow" },
                        "baseline_mean": baseline,
                        "txids": flow.txids,
                    }),
                });
            }

            window.push(block.height, magnitude as f64);
        }

        // Entities quiet this block still accrue a zero so their baseline
        // reflects typical (not just active) blocks.
        let quiet: Vec<String> = self
            .baselines
            .keys()
            .filter(|id| !flows.contains_key(*id))
            .cloned()
            .collect();
        for id in quiet {
            if let Some(w) = self.baselines.get_mut(&id) {
                w.push(block.height, 0.0);
            }
        }

        signals
    }
}

impl SignalProcessor for ExchangeFlowProcessor {
    fn name(&self) -> &'static str {
        "exchange_flow"
    }

    fn process(&mut self, event: &ChainEvent, resolver: &EntityResolver) -> Vec<CandidateSignal> {
        match event {
            ChainEvent::NewBlock(b) => self.on_block(b, resolver),
            ChainEvent::MempoolUpdate(_) => Vec::new(),
            ChainEvent::Reorg {
                ancestor_height,
                blocks,
            } => {
                for w in self.baselines.values_mut() {
                    w.trim_from(ancestor_height + 1);
                }
                blocks
                    .iter()
                    .flat_map(|b| self.on_block(b, resolver))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockTx, FeePercentiles, TxSide};
    use crate::entities::EntityRecord;
    use chrono::Utc;

    fn resolver() -> EntityResolver {
        EntityResolver::from_records(vec![EntityRecord {
            id: "binance".into(),
            name: "Binance".into(),
            kind: EntityKind::Exchange,
            addresses: vec!["ex1".into(), "ex2".into()],
            metadata: None,
        }])
    }

    fn block_with_txs(height: u64, txs: Vec<BlockTx>) -> ChainBlock {
        ChainBlock {
            height,
            hash: format!("h{height}"),
            parent_hash: format!("h{}", height - 1),
            timestamp: Utc::now(),
            txs,
            fees: FeePercentiles::default(),
        }
    }

    fn deposit(txid: &str, to: &str, value: u64) -> BlockTx {
        BlockTx {
            txid: txid.into(),
            inputs: vec![TxSide {
                address: "someone".into(),
                value,
            }],
            outputs: vec![TxSide {
                address: to.into(),
                value,
            }],
        }
    }

    #[test]
    fn large_net_inflow_emits_signal_with_evidence() {
        let r = resolver();
        let mut p = ExchangeFlowProcessor::new(ExchangeFlowConfig::default());
        let block = block_with_txs(
            100,
            vec![deposit("tx_a", "ex1", 200_0000_0000), deposit("tx_b", "ex2", 100_0000_0000)],
        );
        let signals = p.process(&ChainEvent::NewBlock(block), &r);
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::ExchangeFlow);
        assert_eq!(s.metadata["entity_id"], "binance");
        assert_eq!(s.metadata["direction"], "inflow");
        assert_eq!(s.metadata["net"], 300_0000_0000i64);
        let txids = s.metadata["txids"].as_array().unwrap();
        assert_eq!(txids.len(), 2);
        assert!(s.confidence > 0.0);
    }

    #[test]
    fn small_flow_below_absolute_threshold_is_quiet() {
        let r = resolver();
        let mut p = ExchangeFlowProcessor::new(ExchangeFlowConfig::default());
        let block = block_with_txs(100, vec![deposit("tx_a", "ex1", 1_0000_0000)]);
        assert!(p.process(&ChainEvent::NewBlock(block), &r).is_empty());
    }

    #[test]
    fn withdrawal_is_an_outflow() {
        let r = resolver();
        let mut p = ExchangeFlowProcessor::new(ExchangeFlowConfig::default());
        let tx = BlockTx {
            txid: "tx_w".into(),
            inputs: vec![TxSide {
                address: "ex1".into(),
                value: 400_0000_0000,
            }],
            outputs: vec![TxSide {
                address: "someone".into(),
                value: 400_0000_0000,
            }],
        };
        let signals = p.process(&ChainEvent::NewBlock(block_with_txs(100, vec![tx])), &r);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].metadata["direction"], "outflow");
    }

    #[test]
    fn routine_flow_suppressed_by_relative_baseline() {
        let r = resolver();
        let mut p = ExchangeFlowProcessor::new(ExchangeFlowConfig::default());
        // Establish a baseline of ~60 BTC per block; emission stops once the
        // window exists because 60 BTC is not 3x the 60 BTC baseline.
        let mut emitted = 0;
        for h in 1..=10u64 {
            let b = block_with_txs(h, vec![deposit(&format!("tx{h}"), "ex1", 60_0000_0000)]);
            emitted += p.process(&ChainEvent::NewBlock(b), &r).len();
        }
        assert_eq!(emitted, 1, "only the first (baseline-free) block emits");

        // A genuinely outsized flow still gets through.
        let big = block_with_txs(11, vec![deposit("tx_big", "ex1", 2_000_0000_0000)]);
        assert_eq!(p.process(&ChainEvent::NewBlock(big), &r).len(), 1);
    }

    #[test]
    fn unresolved_addresses_are_ignored() {
        let r = resolver();
        let mut p = ExchangeFlowProcessor::new(ExchangeFlowConfig::default());
        let block = block_with_txs(100, vec![deposit("tx_a", "nobody", 900_0000_0000)]);
        assert!(p.process(&ChainEvent::NewBlock(block), &r).is_empty());
    }
}
