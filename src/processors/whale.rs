use std::collections::HashMap;

use serde_json::json;

use crate::chain::{ChainBlock, ChainEvent};
use crate::config::WhaleConfig;
use crate::entities::EntityResolver;
use crate::processors::{CandidateSignal, SignalProcessor, SignalType, clip01};

const MAX_EVIDENCE_TXIDS: usize = 5;
/// A streak with no activity for this many blocks is forgotten.
const STREAK_IDLE_BLOCKS: u64 = 50;

#[derive(Debug, Default)]
struct Streak {
    /// (height, signed net move) per active block, same direction throughout.
    moves: Vec<(u64, i64)>,
    txids: Vec<String>,
}

impl Streak {
    fn total(&self) -> i64 {
        self.moves.iter().map(|(_, v)| v).sum()
    }

    fn direction(&self) -> i64 {
        self.moves.last().map(|(_, v)| v.signum()).unwrap_or(0)
    }

    fn last_height(&self) -> u64 {
        self.moves.last().map(|(h, _)| *h).unwrap_or(0)
    }
}

/// Tracks large unresolved addresses: a multi-block streak of same-direction
/// balance moves past the length and magnitude thresholds emits an
/// accumulation/divestment signal, then the streak restarts.
pub struct WhaleProcessor {
    cfg: WhaleConfig,
    streaks: HashMap<String, Streak>,
}

impl WhaleProcessor {
    pub fn new(cfg: WhaleConfig) -> Self {
        Self {
            cfg,
            streaks: HashMap::new(),
        }
    }

    fn on_block(&mut self, block: &ChainBlock, resolver: &EntityResolver) -> Vec<CandidateSignal> {
        // Net balance change per address within this block.
        let mut nets: HashMap<String, i64> = HashMap::new();
        let mut tx_of: HashMap<String, Vec<String>> = HashMap::new();
        for tx in &block.txs {
            for side in &tx.outputs {
                *nets.entry(side.address.clone()).or_default() += side.value as i64;
                tx_of.entry(side.address.clone()).or_default().push(tx.txid.clone());
            }
            for side in &tx.inputs {
                *nets.entry(side.address.clone()).or_default() -= side.value as i64;
                tx_of.entry(side.address.clone()).or_default().push(tx.txid.clone());
            }
        }

        let mut addrs: Vec<String> = nets
            .iter()
            .filter(|(addr, net)| {
                net.unsigned_abs() >= self.cfg.min_move && resolver.resolve(addr).is_none()
            })
            .map(|(addr, _)| addr.clone())
            .collect();
        addrs.sort();

        let mut signals = Vec::new();
        for addr in addrs {
            let net = nets[&addr];
            let streak = self.streaks.entry(addr.clone()).or_default();
            if streak.direction() != 0 && streak.direction() != net.signum() {
                // Direction flip: the old streak is over, start fresh.
                *streak = Streak::default();
            }
            streak.moves.push((block.height, net));
            for txid in tx_of.get(&addr).into_iter().flatten() {
                if streak.txids.len() < MAX_EVIDENCE_TXIDS && !streak.txids.contains(txid) {
                    streak.txids.push(txid.clone());
                }
            }

            let total = streak.total();
            if streak.moves.len() >= self.cfg.min_streak
                && total.unsigned_abs() >= self.cfg.min_total
            {
                let len_part = streak.moves.len() as f64 / (self.cfg.min_streak as f64 * 2.0);
                let mag_part = total.unsigned_abs() as f64 / (self.cfg.min_total as f64 * 2.0);
                let heights: Vec<u64> = streak.moves.iter().map(|(h, _)| *h).collect();
                signals.push(CandidateSignal {
                    signal_type: SignalType::WhaleAccumulation,
                    source_height: block.height,
                    confidence: clip01(0.5 * len_part + 0.5 * mag_part),
                    metadata: json!({
                        "address": addr,
                        "streak_length": streak.moves.len(),
                        "total_moved": total,
                        "direction": if total >= 0 { "accumulation" } else { "divestment" },
                        "heights": heights,
                        "txids": streak.txids,
                    }),
                });
                self.streaks.remove(&addr);
            }
        }

        // Forget long-idle streaks so the map stays bounded.
        let height = block.height;
        self.streaks
            .retain(|_, s| height.saturating_sub(s.last_height()) <= STREAK_IDLE_BLOCKS);

        signals
    }
}

impl SignalProcessor for WhaleProcessor {
    fn name(&self) -> &'static str {
        "whale"
    }

    fn process(&mut self, event: &ChainEvent, resolver: &EntityResolver) -> Vec<CandidateSignal> {
        match event {
            ChainEvent::NewBlock(b) => self.on_block(b, resolver),
            ChainEvent::MempoolUpdate(_) => Vec::new(),
            ChainEvent::Reorg {
                ancestor_height,
                blocks,
            } => {
                let watermark = ancestor_height + 1;
                for s in self.streaks.values_mut() {
                    let before = s.moves.len();
                    s.moves.retain(|(h, _)| *h < watermark);
                    if s.moves.len() != before {
                        // Evidence txids may reference superseded blocks.
                        s.txids.clear();
                    }
                }
                self.streaks.retain(|_, s| !s.moves.is_empty());
                blocks
                    .iter()
                    .flat_map(|b| self.on_block(b, resolver))
                    .collect()
            }
        }
    }
}
