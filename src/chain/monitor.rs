use std::collections::VecDeque;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::chain::anomaly::RollingBaseline;
use crate::chain::{ChainBlock, ChainEvent, MempoolSnapshot};
use crate::config::MonitorConfig;
use crate::rpc::{NodeClient, RpcError, TipInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockHeader {
    height: u64,
    hash: String,
    parent_hash: String,
}

#[derive(Debug)]
pub enum MonitorError {
    Node(RpcError),
    /// The node's tip ancestry left the tracked window without a common
    /// ancestor. Cannot be reconciled automatically; requires operator
    /// intervention (deeper window or manual resync).
    IrreconcilableDivergence { tip_hash: String, window: usize },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Node(e) => write!(f, "node error: {e}"),
            MonitorError::IrreconcilableDivergence { tip_hash, window } => write!(
                f,
                "chain divergence deeper than {window}-block window (tip {tip_hash})"
            ),
        }
    }
}

impl std::error::Error for MonitorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ok,
    Degraded { consecutive_failures: u32 },
}

/// Polls the node for tip/mempool changes and turns them into `ChainEvent`s.
///
/// Keeps a bounded window of recent block headers keyed by hash/parent-hash;
/// a tip whose ancestry rejoins the window above its floor is a reorg, one
/// that doesn't is fatal.
pub struct ChainMonitor<C> {
    node: C,
    window: VecDeque<BlockHeader>,
    reorg_window: usize,
    baseline: RollingBaseline,
    consecutive_failures: u32,
    max_failures: u32,
}

impl<C: NodeClient> ChainMonitor<C> {
    pub fn new(node: C, cfg: &MonitorConfig) -> Self {
        Self {
            node,
            window: VecDeque::with_capacity(cfg.reorg_window),
            reorg_window: cfg.reorg_window.max(10),
            baseline: RollingBaseline::new(
                cfg.anomaly_window,
                cfg.anomaly_min_samples,
                cfg.anomaly_sigma,
            ),
            consecutive_failures: 0,
            max_failures: cfg.max_consecutive_failures,
        }
    }

    pub fn health(&self) -> Health {
        if self.consecutive_failures >= self.max_failures {
            Health::Degraded {
                consecutive_failures: self.consecutive_failures,
            }
        } else {
            Health::Ok
        }
    }

    /// One poll cycle. Emits zero or more events; a node error is transient
    /// (caller backs off and retries), irreconcilable divergence is not.
    pub async fn poll(&mut self) -> Result<Vec<ChainEvent>, MonitorError> {
        let tip = match self.node.tip().await {
            Ok(t) => {
                self.consecutive_failures = 0;
                t
            }
            Err(e) => return Err(self.node_failure(e)),
        };

        let mut events = Vec::new();

        let at_tip = self
            .window
            .back()
            .map(|h| h.hash == tip.hash)
            .unwrap_or(false);
        if !at_tip {
            events.extend(self.sync_to_tip(&tip).await?);
        }

        match self.node.mempool().await {
            Ok(info) => {
                let anomalous = self.baseline.is_anomalous(info.fees.p50);
                self.baseline.observe(info.fees.p50);
                if anomalous {
                    info!(median_fee = info.fees.p50, "mempool fee anomaly flagged");
                }
                events.push(ChainEvent::MempoolUpdate(MempoolSnapshot {
                    taken_at: Utc::now(),
                    fees: info.fees,
                    tx_count: info.tx_count,
                    total_vsize: info.total_vsize,
                    anomalous,
                }));
            }
            Err(e) => {
                // Block events above are already committed to the header
                // window, so the next poll will not re-fetch them. Failing
                // here would lose them for good; skip the snapshot instead.
                if events.is_empty() {
                    return Err(self.node_failure(e));
                }
                warn!(error = %e, "mempool fetch failed, skipping snapshot");
            }
        }

        Ok(events)
    }

    fn node_failure(&mut self, e: RpcError) -> MonitorError {
        self.consecutive_failures += 1;
        if self.consecutive_failures == self.max_failures {
            warn!(
                failures = self.consecutive_failures,
                "node unreachable, monitor degraded"
            );
        }
        MonitorError::Node(e)
    }

    /// Walk back from the node's tip until the ancestry rejoins the window.
    async fn sync_to_tip(&mut self, tip: &TipInfo) -> Result<Vec<ChainEvent>, MonitorError> {
        if self.window.is_empty() {
            return self.bootstrap(tip).await;
        }

        let mut fetched: Vec<ChainBlock> = Vec::new();
        let mut cursor = tip.hash.clone();
        let mut ancestor_pos: Option<usize> = None;

        loop {
            let block = self
                .node
                .block_by_hash(&cursor)
                .await
                .map_err(|e| self.node_failure(e))?;
            let parent = block.parent_hash.clone();
            let height = block.height;
            fetched.push(block);

            if let Some(pos) = self.window.iter().position(|h| h.hash == parent) {
                ancestor_pos = Some(pos);
                break;
            }
            let floor = self.window.front().map(|h| h.height).unwrap_or(0);
            if height <= floor || height == 0 {
                return Err(MonitorError::IrreconcilableDivergence {
                    tip_hash: tip.hash.clone(),
                    window: self.reorg_window,
                });
            }
            cursor = parent;
        }

        fetched.reverse(); // ascending by height

        let is_reorg = ancestor_pos
            .map(|pos| pos + 1 < self.window.len())
            .unwrap_or(false);

        let mut events = Vec::new();
        if is_reorg {
            let pos = ancestor_pos.unwrap_or_default();
            let ancestor_height = self.window[pos].height;
            let dropped = self.window.len() - (pos + 1);
            self.window.truncate(pos + 1);
            warn!(
                ancestor_height,
                dropped,
                new_blocks = fetched.len(),
                "chain reorganization detected"
            );
            for b in &fetched {
                self.push_header(b);
            }
            events.push(ChainEvent::Reorg {
                ancestor_height,
                blocks: fetched,
            });
        } else {
            for b in fetched {
                debug!(height = b.height, hash = %b.hash, "new block");
                self.push_header(&b);
                events.push(ChainEvent::NewBlock(b));
            }
        }

        while self.window.len() > self.reorg_window {
            self.window.pop_front();
        }
        Ok(events)
    }

    /// Seed the empty window: walk back far enough to fill it, emitting the
    /// collected blocks so downstream baselines start warm.
    async fn bootstrap(&mut self, tip: &TipInfo) -> Result<Vec<ChainEvent>, MonitorError> {
        let mut fetched: Vec<ChainBlock> = Vec::new();
        let mut cursor = tip.hash.clone();

        while fetched.len() < self.reorg_window {
            match self.node.block_by_hash(&cursor).await {
                Ok(b) => {
                    let parent = b.parent_hash.clone();
                    let height = b.height;
                    fetched.push(b);
                    if height == 0 {
                        break;
                    }
                    cursor = parent;
                }
                Err(e) => {
                    if fetched.is_empty() {
                        return Err(self.node_failure(e));
                    }
                    // Ancestor unavailable (pruned or missing): track from here.
                    break;
                }
            }
        }

        fetched.reverse();
        info!(
            from = fetched.first().map(|b| b.height).unwrap_or_default(),
            to = fetched.last().map(|b| b.height).unwrap_or_default(),
            "monitor window seeded"
        );
        let mut events = Vec::new();
        for b in fetched {
            self.push_header(&b);
            events.push(ChainEvent::NewBlock(b));
        }
        Ok(events)
    }

    fn push_header(&mut self, block: &ChainBlock) {
        self.window.push_back(BlockHeader {
            height: block.height,
            hash: block.hash.clone(),
            parent_hash: block.parent_hash.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FeePercentiles;
    use crate::rpc::MempoolInfo;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        blocks: HashMap<String, ChainBlock>,
        tip: Option<TipInfo>,
        mempool_p50: f64,
        fail_calls: bool,
        fail_mempool: bool,
    }

    #[derive(Clone, Default)]
    struct FakeNode {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeNode {
        fn add_chain(&self, blocks: &[ChainBlock]) {
            let mut st = self.state.lock().unwrap();
            for b in blocks {
                st.blocks.insert(b.hash.clone(), b.clone());
            }
            if let Some(last) = blocks.last() {
                st.tip = Some(TipInfo {
                    height: last.height,
                    hash: last.hash.clone(),
                });
            }
        }

        fn set_mempool_p50(&self, p50: f64) {
            self.state.lock().unwrap().mempool_p50 = p50;
        }

        fn set_failing(&self, failing: bool) {
            self.state.lock().unwrap().fail_calls = failing;
        }

        fn set_mempool_failing(&self, failing: bool) {
            self.state.lock().unwrap().fail_mempool = failing;
        }
    }

    fn transient_error() -> RpcError {
        RpcError::Rpc(serde_json::json!({"code": -1, "message": "unavailable"}))
    }

    impl NodeClient for FakeNode {
        async fn tip(&self) -> Result<TipInfo, RpcError> {
            let st = self.state.lock().unwrap();
            if st.fail_calls {
                return Err(transient_error());
            }
            st.tip.clone().ok_or_else(transient_error)
        }

        async fn block_by_hash(&self, hash: &str) -> Result<ChainBlock, RpcError> {
            let st = self.state.lock().unwrap();
            st.blocks.get(hash).cloned().ok_or_else(transient_error)
        }

        async fn mempool(&self) -> Result<MempoolInfo, RpcError> {
            let st = self.state.lock().unwrap();
            if st.fail_calls || st.fail_mempool {
                return Err(transient_error());
            }
            Ok(MempoolInfo {
                fees: FeePercentiles {
                    p10: st.mempool_p50 / 2.0,
                    p50: st.mempool_p50,
                    p90: st.mempool_p50 * 2.0,
                },
                tx_count: 1000,
                total_vsize: 4_000_000,
            })
        }
    }

    fn block(height: u64, hash: &str, parent: &str) -> ChainBlock {
        ChainBlock {
            height,
            hash: hash.to_string(),
            parent_hash: parent.to_string(),
            timestamp: Utc::now(),
            txs: vec![],
            fees: FeePercentiles {
                p10: 2.0,
                p50: 10.0,
                p90: 40.0,
            },
        }
    }

    fn monitor(node: FakeNode) -> ChainMonitor<FakeNode> {
        let cfg = MonitorConfig {
            reorg_window: 10,
            anomaly_window: 50,
            anomaly_min_samples: 5,
            anomaly_sigma: 3.0,
            max_consecutive_failures: 3,
            ..MonitorConfig::default()
        };
        ChainMonitor::new(node, &cfg)
    }

    fn new_block_heights(events: &[ChainEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                ChainEvent::NewBlock(b) => Some(b.height),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn extension_emits_new_blocks_in_order() {
        let node = FakeNode::default();
        node.add_chain(&[block(1, "a1", "a0")]);
        node.set_mempool_p50(10.0);
        let mut mon = monitor(node.clone());

        let events = mon.poll().await.unwrap();
        assert_eq!(new_block_heights(&events), vec![1]);

        // Two more blocks land between polls; both come out ascending.
        node.add_chain(&[block(2, "a2", "a1"), block(3, "a3", "a2")]);
        let events = mon.poll().await.unwrap();
        assert_eq!(new_block_heights(&events), vec![2, 3]);
    }

    #[tokio::test]
    async fn mempool_failure_does_not_drop_block_events() {
        let node = FakeNode::default();
        node.add_chain(&[block(1, "a1", "a0")]);
        node.set_mempool_p50(10.0);
        node.set_mempool_failing(true);
        let mut mon = monitor(node.clone());

        // The block still comes out even though the snapshot fetch failed.
        let events = mon.poll().await.unwrap();
        assert_eq!(new_block_heights(&events), vec![1]);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, ChainEvent::MempoolUpdate(_)))
        );

        // Once the mempool recovers, snapshots resume; the block is not
        // re-emitted and nothing was lost in between.
        node.set_mempool_failing(false);
        let events = mon.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChainEvent::MempoolUpdate(_)));

        // A mempool failure with no pending blocks is still a poll failure.
        node.set_mempool_failing(true);
        assert!(mon.poll().await.is_err());
    }

    #[tokio::test]
    async fn unchanged_tip_emits_only_mempool_update() {
        let node = FakeNode::default();
        node.add_chain(&[block(1, "a1", "a0")]);
        let mut mon = monitor(node.clone());
        mon.poll().await.unwrap();

        let events = mon.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChainEvent::MempoolUpdate(_)));
    }

    #[tokio::test]
    async fn reorg_within_window_emits_corrected_chain() {
        let node = FakeNode::default();
        node.add_chain(&[
            block(100, "a100", "a99"),
            block(101, "a101", "a100"),
            block(102, "a102", "a101"),
            block(103, "a103", "a102"),
        ]);
        let mut mon = monitor(node.clone());
        mon.poll().await.unwrap();

        // Replace [101..103] with [101'..104'] branching off block 100.
        node.add_chain(&[
            block(101, "b101", "a100"),
            block(102, "b102", "b101"),
            block(103, "b103", "b102"),
            block(104, "b104", "b103"),
        ]);
        let events = mon.poll().await.unwrap();
        let reorg = events
            .iter()
            .find_map(|e| match e {
                ChainEvent::Reorg {
                    ancestor_height,
                    blocks,
                } => Some((*ancestor_height, blocks.clone())),
                _ => None,
            })
            .expect("expected a reorg event");
        assert_eq!(reorg.0, 100);
        let heights: Vec<u64> = reorg.1.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![101, 102, 103, 104]);
        assert_eq!(reorg.1[0].hash, "b101");
    }

    #[tokio::test]
    async fn divergence_beyond_window_is_fatal() {
        let node = FakeNode::default();
        let mut chain: Vec<ChainBlock> = vec![block(1, "a1", "a0")];
        for h in 2..=20u64 {
            chain.push(block(h, &format!("a{h}"), &format!("a{}", h - 1)));
        }
        node.add_chain(&chain);
        let mut mon = monitor(node.clone());
        mon.poll().await.unwrap();

        // A competing chain that forked below the 10-block window floor.
        let mut fork: Vec<ChainBlock> = vec![block(5, "b5", "a4")];
        for h in 6..=21u64 {
            fork.push(block(h, &format!("b{h}"), &format!("b{}", h - 1)));
        }
        node.add_chain(&fork);

        let err = mon.poll().await.unwrap_err();
        assert!(matches!(
            err,
            MonitorError::IrreconcilableDivergence { .. }
        ));
    }

    #[tokio::test]
    async fn repeated_failures_degrade_health() {
        let node = FakeNode::default();
        node.set_failing(true);
        let mut mon = monitor(node.clone());

        for _ in 0..3 {
            assert!(mon.poll().await.is_err());
        }
        assert!(matches!(mon.health(), Health::Degraded { .. }));

        node.set_failing(false);
        node.add_chain(&[block(1, "a1", "a0")]);
        mon.poll().await.unwrap();
        assert_eq!(mon.health(), Health::Ok);
    }

    #[tokio::test]
    async fn anomaly_flag_requires_min_samples_then_fires() {
        let node = FakeNode::default();
        node.add_chain(&[block(1, "a1", "a0")]);
        node.set_mempool_p50(10.0);
        let mut mon = monitor(node.clone());

        // First 4 polls are below the 5-sample gate: a spike must not flag.
        for _ in 0..4 {
            mon.poll().await.unwrap();
        }
        node.set_mempool_p50(500.0);
        let events = mon.poll().await.unwrap();
        let snap = match &events[0] {
            ChainEvent::MempoolUpdate(s) => s,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(!snap.anomalous, "cold start must never flag");

        // Rebuild the baseline, then spike again past the gate.
        node.set_mempool_p50(10.0);
        for _ in 0..10 {
            mon.poll().await.unwrap();
        }
        node.set_mempool_p50(500.0);
        let events = mon.poll().await.unwrap();
        let snap = match &events[0] {
            ChainEvent::MempoolUpdate(s) => s,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(snap.anomalous);
    }
}
