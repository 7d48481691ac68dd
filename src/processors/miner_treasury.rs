use std::collections::HashMap;

use serde_json::json;

use crate::chain::{ChainBlock, ChainEvent};
use crate::config::MinerTreasuryConfig;
use crate::entities::{EntityKind, EntityResolver};
use crate::processors::{CandidateSignal, HeightWindow, SignalProcessor, SignalType, clip01};

/// Tracks balance deltas for resolved mining-pool and treasury-holder
/// entities across a window of blocks and emits once the cumulative move
/// is meaningful. The entity's window resets after an emission so one
/// sustained move produces one signal.
pub struct MinerTreasuryProcessor {
    cfg: MinerTreasuryConfig,
    deltas: HashMap<String, HeightWindow>,
}

impl MinerTreasuryProcessor {
    pub fn new(cfg: MinerTreasuryConfig) -> Self {
        Self {
            cfg,
            deltas: HashMap::new(),
        }
    }

    fn tracked(kind: EntityKind) -> bool {
        matches!(kind, EntityKind::MiningPool | EntityKind::TreasuryHolder)
    }

    fn on_block(&mut self, block: &ChainBlock, resolver: &EntityResolver) -> Vec<CandidateSignal> {
        let mut per_entity: HashMap<String, i64> = HashMap::new();

        for tx in &block.txs {
            for side in &tx.outputs {
                if let Some(e) = resolver.resolve(&side.address) {
                    if Self::tracked(e.kind) {
                        *per_entity.entry(e.id.clone()).or_default() += side.value as i64;
                    }
                }
            }
            for side in &tx.inputs {
                if let Some(e) = resolver.resolve(&side.address) {
                    if Self::tracked(e.kind) {
                        *per_entity.entry(e.id.clone()).or_default() -= side.value as i64;
                    }
                }
            }
        }

        // Entities already under observation accrue a zero for quiet blocks.
        for (id, w) in self.deltas.iter_mut() {
            if !per_entity.contains_key(id) {
                w.push(block.height, 0.0);
            }
        }

        let mut entity_ids: Vec<String> = per_entity.keys().cloned().collect();
        entity_ids.sort();

        let mut signals = Vec::new();
        for id in entity_ids {
            let delta = per_entity[&id];
            let window = self
                .deltas
                .entry(id.clone())
                .or_insert_with(|| HeightWindow::new(self.cfg.window));
            window.push(block.height, delta as f64);

            if window.len() < self.cfg.min_blocks {
                continue;
            }
            let cumulative = window.sum();
            if cumulative.abs() < self.cfg.min_cumulative as f64 {
                continue;
            }

            let entity = resolver.resolve_entity_id(&id);
            let name = entity.map(|e| e.name.clone()).unwrap_or_else(|| id.clone());
            let kind = entity
                .map(|e| e.kind.as_str())
                .unwrap_or(EntityKind::MiningPool.as_str());
            signals.push(CandidateSignal {
                signal_type: SignalType::MinerTreasury,
                source_height: block.height,
                confidence: clip01(cumulative.abs() / (self.cfg.min_cumulative as f64 * 4.0)),
                metadata: json!({
                    "entity_id": id,
                    "entity_name": name,
                    "entity_kind": kind,
                    "window_blocks": window.len(),
                    "cumulative_delta": cumulative as i64,
                    "direction": if cumulative >= 0.0 { "accumulation" } else { "distribution" },
                }),
            });
            window.clear();
        }
        signals
    }
}

impl SignalProcessor for MinerTreasuryProcessor {
    fn name(&self) -> &'static str {
        "miner_treasury"
    }

    fn process(&mut self, event: &ChainEvent, resolver: &EntityResolver) -> Vec<CandidateSignal> {
        match event {
            ChainEvent::NewBlock(b) => self.on_block(b, resolver),
            ChainEvent::MempoolUpdate(_) => Vec::new(),
            ChainEvent::Reorg {
                ancestor_height,
                blocks,
            } => {
                for w in self.deltas.values_mut() {
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
            id: "foundry".into(),
            name: "Foundry USA".into(),
            kind: EntityKind::MiningPool,
            addresses: vec!["pool1".into()],
            metadata: None,
        }])
    }

    fn coinbase_block(height: u64, to: &str, value: u64) -> ChainBlock {
        ChainBlock {
            height,
            hash: format!("h{height}"),
            parent_hash: format!("h{}", height - 1),
            timestamp: Utc::now(),
            txs: vec![BlockTx {
                txid: format!("cb{height}"),
                inputs: vec![],
                outputs: vec![TxSide {
                    address: to.into(),
                    value,
                }],
            }],
            fees: FeePercentiles::default(),
        }
    }

    #[test]
    fn sustained_accumulation_emits_once_then_resets() {
        let r = resolver();
        let mut p = MinerTreasuryProcessor::new(MinerTreasuryConfig::default());
        let mut signals = Vec::new();
        // 6.25 coins per block to the pool; crosses 10-coin cumulative at the
        // min_blocks gate (6 blocks = 37.5 coins).
        for h in 1..=6u64 {
            signals.extend(p.process(
                &ChainEvent::NewBlock(coinbase_block(h, "pool1", 6_2500_0000)),
                &r,
            ));
        }
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::MinerTreasury);
        assert_eq!(s.metadata["direction"], "accumulation");
        assert_eq!(s.metadata["entity_name"], "Foundry USA");

        // Window was cleared: the very next block cannot re-emit.
        let more = p.process(
            &ChainEvent::NewBlock(coinbase_block(7, "pool1", 6_2500_0000)),
            &r,
        );
        assert!(more.is_empty());
    }

    #[test]
    fn distribution_direction_detected() {
        let r = resolver();
        let mut p = MinerTreasuryProcessor::new(MinerTreasuryConfig::default());
        let mut signals = Vec::new();
        for h in 1..=6u64 {
            let b = ChainBlock {
                height: h,
                hash: format!("h{h}"),
                parent_hash: format!("h{}", h - 1),
                timestamp: Utc::now(),
                txs: vec![BlockTx {
                    txid: format!("tx{h}"),
                    inputs: vec![TxSide {
                        address: "pool1".into(),
                        value: 5_0000_0000,
                    }],
                    outputs: vec![TxSide {
                        address: "market".into(),
                        value: 5_0000_0000,
                    }],
                }],
                fees: FeePercentiles::default(),
            };
            signals.extend(p.process(&ChainEvent::NewBlock(b), &r));
        }
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].metadata["direction"], "distribution");
    }

    #[test]
    fn below_cumulative_threshold_stays_quiet() {
        let r = resolver();
        let mut p = MinerTreasuryProcessor::new(MinerTreasuryConfig::default());
        for h in 1..=20u64 {
            let s = p.process(
                &ChainEvent::NewBlock(coinbase_block(h, "pool1", 1000_0000)),
                &r,
            );
            assert!(s.is_empty(), "0.01-coin drips should not signal");
        }
    }
}
