pub mod anomaly;
pub mod monitor;
pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fee-rate distribution percentiles (chain-native units per vbyte).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeePercentiles {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

/// One side of a transaction: an address and the value it moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxSide {
    pub address: String,
    pub value: u64,
}

/// Transaction summary as reported by the node (prevouts already resolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTx {
    pub txid: String,
    pub inputs: Vec<TxSide>,
    pub outputs: Vec<TxSide>,
}

/// A confirmed block. Superseded (never mutated) when the chain reorganizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: DateTime<Utc>,
    pub txs: Vec<BlockTx>,
    pub fees: FeePercentiles,
}

/// Point-in-time mempool summary. Regenerated every poll cycle, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolSnapshot {
    pub taken_at: DateTime<Utc>,
    pub fees: FeePercentiles,
    pub tx_count: u64,
    pub total_vsize: u64,
    /// Set when the median fee rate deviates past the sigma limit from the
    /// rolling baseline (requires the minimum sample count).
    pub anomalous: bool,
}

/// What the monitor observed in one poll cycle.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    NewBlock(ChainBlock),
    /// The chain diverged inside the tracked window. `ancestor_height` is the
    /// last block common to both chains; `blocks` is the full corrected chain
    /// above it, ascending. Everything previously derived from heights above
    /// the ancestor is superseded.
    Reorg {
        ancestor_height: u64,
        blocks: Vec<ChainBlock>,
    },
    MempoolUpdate(MempoolSnapshot),
}
