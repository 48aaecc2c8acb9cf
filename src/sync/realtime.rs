//! The chain tail: a bounded, hash-linked buffer of unfinalized blocks with
//! gap filling, shallow-reorg repair, and a finalization checkpoint. Head
//! processing is strictly serial; parent-hash linkage is the invariant
//! everything here defends.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use alloy::primitives::{Bloom, BloomInput, B256};
use alloy::rpc::types::Block;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::error::{RpcClientError, SyncError};
use crate::filter::{AddressSpec, ChildAddresses, Filter};
use crate::metrics::Metrics;
use crate::rpc::RpcClient;
use crate::store::sync::SyncStore;
use crate::types::{LightBlock, SyncBlock, SyncLog, SyncTrace, SyncTransaction};

const GAP_FETCH_CONCURRENCY: usize = 10;

/// A head block plus its transactions, ready for filter evaluation.
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    pub block: SyncBlock,
    pub transactions: Vec<SyncTransaction>,
}

impl FetchedBlock {
    pub fn from_rpc(chain_id: u64, rpc_block: &Block) -> Self {
        let block = SyncBlock::from_rpc(chain_id, rpc_block);
        let transactions = rpc_block
            .transactions
            .txns()
            .map(|tx| SyncTransaction::from_rpc(chain_id, &block, tx))
            .collect();
        FetchedBlock { block, transactions }
    }

    pub fn light(&self) -> LightBlock {
        LightBlock::from(&self.block)
    }
}

/// Where realtime sync gets chain data; the seam that keeps the reorg logic
/// testable against scripted chains.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn latest_number(&self) -> Result<u64, RpcClientError>;
    async fn by_number(&self, number: u64) -> Result<Option<FetchedBlock>, RpcClientError>;
    async fn by_hash(&self, hash: B256) -> Result<Option<FetchedBlock>, RpcClientError>;
    async fn logs_for_block(&self, hash: B256) -> Result<Vec<SyncLog>, RpcClientError>;
    async fn traces_for_block(
        &self,
        block: &SyncBlock,
        transactions: &[SyncTransaction],
    ) -> Result<Vec<SyncTrace>, RpcClientError>;
}

/// Blocks are immutable under their hash, so the fork walk's repeated
/// by-hash lookups hit a small cache.
const BLOCK_CACHE_CAPACITY: usize = 512;

pub struct RpcBlockSource {
    client: Arc<RpcClient>,
    cache: parking_lot::Mutex<lru::LruCache<B256, FetchedBlock>>,
}

impl RpcBlockSource {
    pub fn new(client: Arc<RpcClient>) -> Self {
        let capacity = std::num::NonZeroUsize::new(BLOCK_CACHE_CAPACITY)
            .unwrap_or(std::num::NonZeroUsize::MIN);
        RpcBlockSource {
            client,
            cache: parking_lot::Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    fn remember(&self, block: &FetchedBlock) {
        self.cache.lock().put(block.block.hash, block.clone());
    }
}

#[async_trait]
impl BlockSource for RpcBlockSource {
    async fn latest_number(&self) -> Result<u64, RpcClientError> {
        self.client.block_number().await
    }

    async fn by_number(&self, number: u64) -> Result<Option<FetchedBlock>, RpcClientError> {
        let fetched = self
            .client
            .get_block_by_number(number, true)
            .await?
            .map(|b| FetchedBlock::from_rpc(self.client.chain_id, &b));
        if let Some(block) = &fetched {
            self.remember(block);
        }
        Ok(fetched)
    }

    async fn by_hash(&self, hash: B256) -> Result<Option<FetchedBlock>, RpcClientError> {
        if let Some(cached) = self.cache.lock().get(&hash).cloned() {
            return Ok(Some(cached));
        }
        let fetched = self
            .client
            .get_block_by_hash(hash, true)
            .await?
            .map(|b| FetchedBlock::from_rpc(self.client.chain_id, &b));
        if let Some(block) = &fetched {
            self.remember(block);
        }
        Ok(fetched)
    }

    async fn logs_for_block(&self, hash: B256) -> Result<Vec<SyncLog>, RpcClientError> {
        let logs = self.client.get_logs_by_block_hash(hash).await?;
        Ok(logs
            .iter()
            .filter_map(|log| SyncLog::from_rpc(self.client.chain_id, log))
            .collect())
    }

    async fn traces_for_block(
        &self,
        block: &SyncBlock,
        transactions: &[SyncTransaction],
    ) -> Result<Vec<SyncTrace>, RpcClientError> {
        use alloy::rpc::types::trace::geth::{GethTrace, TraceResult};

        let tx_index_by_hash: HashMap<B256, u64> = transactions
            .iter()
            .map(|tx| (tx.hash, tx.transaction_index))
            .collect();
        let results = self.client.trace_block(block.number).await?;
        let mut out = Vec::new();
        for result in &results {
            let TraceResult::Success { result: trace, tx_hash } = result else {
                continue;
            };
            let (Some(tx_hash), GethTrace::CallTracer(frame)) = (tx_hash, trace) else {
                continue;
            };
            let Some(&tx_index) = tx_index_by_hash.get(tx_hash) else {
                continue;
            };
            out.extend(crate::types::flatten_call_frames(
                self.client.chain_id,
                block,
                *tx_hash,
                tx_index,
                frame,
            ));
        }
        Ok(out)
    }
}

/// Events a chain's realtime worker emits toward the omnichain driver.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Block {
        chain_id: u64,
        block: SyncBlock,
        logs: Vec<SyncLog>,
        transactions: Vec<SyncTransaction>,
        traces: Vec<SyncTrace>,
    },
    Reorg {
        chain_id: u64,
        common_ancestor: LightBlock,
        depth: u64,
    },
    Finalize {
        chain_id: u64,
        block: LightBlock,
    },
    DeepReorg {
        chain_id: u64,
        minimum_depth: u64,
    },
}

/// Outcome of offering a candidate head to the unfinalized chain.
#[derive(Debug, PartialEq, Eq)]
pub enum Advance {
    /// Hash already present.
    Duplicate,
    /// Candidate skipped ahead; `[from, to]` must be fetched first.
    Gap { from: u64, to: u64 },
    /// Appended. Carries the new finalized block when the append pushed the
    /// buffer past `2F` and the pointer moved forward by `F`.
    Extended { finalized: Option<LightBlock> },
    /// Does not link onto the head; an ancestor walk is needed.
    Forked,
}

/// Hash-linked list of unfinalized blocks, rooted at the finalized block.
#[derive(Debug, Clone)]
pub struct UnfinalizedChain {
    finality_depth: u64,
    pub finalized: LightBlock,
    pub blocks: Vec<LightBlock>,
}

/// Finalized block number for a fresh start: `F` behind the latest head,
/// floored at genesis.
pub fn initial_finalized(latest: u64, finality_depth: u64) -> u64 {
    latest.saturating_sub(finality_depth)
}

impl UnfinalizedChain {
    pub fn new(finalized: LightBlock, finality_depth: u64) -> Self {
        UnfinalizedChain {
            finality_depth,
            finalized,
            blocks: vec![finalized],
        }
    }

    pub fn head(&self) -> &LightBlock {
        self.blocks.last().unwrap_or(&self.finalized)
    }

    pub fn find(&self, hash: B256) -> Option<&LightBlock> {
        self.blocks.iter().find(|b| b.hash == hash)
    }

    pub fn try_extend(&mut self, candidate: &LightBlock) -> Advance {
        if self.find(candidate.hash).is_some() {
            return Advance::Duplicate;
        }
        let head = *self.head();
        if candidate.number > head.number + 1 {
            return Advance::Gap { from: head.number + 1, to: candidate.number - 1 };
        }
        if candidate.number == head.number + 1 && candidate.parent_hash == head.hash {
            self.blocks.push(*candidate);
            let mut finalized = None;
            if candidate.number > self.finalized.number + 2 * self.finality_depth {
                let target = self.finalized.number + self.finality_depth;
                if let Some(block) = self.blocks.iter().find(|b| b.number == target).copied() {
                    self.blocks.retain(|b| b.number >= target);
                    self.finalized = block;
                    finalized = Some(block);
                }
            }
            return Advance::Extended { finalized };
        }
        Advance::Forked
    }

    /// Drop every block above the common ancestor. Returns the ancestor and
    /// the number of local blocks discarded, or `None` when the hash is not
    /// local.
    pub fn truncate_to(&mut self, ancestor_hash: B256) -> Option<(LightBlock, u64)> {
        let position = self.blocks.iter().position(|b| b.hash == ancestor_hash)?;
        let removed = (self.blocks.len() - 1 - position) as u64;
        let ancestor = self.blocks[position];
        self.blocks.truncate(position + 1);
        Some((ancestor, removed))
    }

    /// The invariant everything above relies on.
    #[cfg(test)]
    fn assert_linked(&self) {
        for pair in self.blocks.windows(2) {
            assert_eq!(pair[1].parent_hash, pair[0].hash, "chain linkage broken");
            assert_eq!(pair[1].number, pair[0].number + 1);
        }
    }
}

/// Result of walking a forked candidate back to the local chain.
#[derive(Debug)]
pub enum Walk {
    /// Ancestor found above the finalized block; `canonical` holds the
    /// replacement chain, oldest first.
    Shallow {
        ancestor: LightBlock,
        canonical: Vec<FetchedBlock>,
        depth: u64,
    },
    /// The walk hit the finalized block without intersecting.
    Deep { minimum_depth: u64 },
}

/// Walk back from a forked candidate via parent hashes until a local block
/// is found, or the finalized boundary proves the reorg too deep.
pub async fn walk_to_common_ancestor<S: BlockSource>(
    chain: &UnfinalizedChain,
    source: &S,
    candidate: FetchedBlock,
) -> Result<Walk, SyncError> {
    let candidate_number = candidate.block.number;
    let mut tail = candidate.light();
    let mut fork_chain: Vec<FetchedBlock> = vec![candidate];
    loop {
        if let Some(ancestor) = chain.find(tail.parent_hash) {
            if ancestor.number < chain.finalized.number {
                // ancestor exists locally but below finality: still fatal
                return Ok(Walk::Deep {
                    minimum_depth: candidate_number.saturating_sub(chain.finalized.number),
                });
            }
            let ancestor = *ancestor;
            fork_chain.reverse();
            return Ok(Walk::Shallow {
                ancestor,
                depth: candidate_number.saturating_sub(ancestor.number),
                canonical: fork_chain,
            });
        }
        if tail.number <= chain.finalized.number + 1 {
            return Ok(Walk::Deep {
                minimum_depth: candidate_number.saturating_sub(chain.finalized.number),
            });
        }
        let parent = source
            .by_hash(tail.parent_hash)
            .await?
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "parent {} of forked block {} not retrievable",
                    tail.parent_hash, tail.number
                ))
            })?;
        tail = parent.light();
        fork_chain.push(parent);
    }
}

/// Can any log filter possibly match a block with this bloom? A miss skips
/// the `eth_getLogs` round trip.
pub fn bloom_might_match(filters: &[Filter], bloom: &Bloom) -> bool {
    filters.iter().any(|filter| match filter {
        Filter::Log(f) => {
            let address_hit = match &f.address {
                AddressSpec::Any | AddressSpec::Factory(_) => true,
                AddressSpec::Concrete(list) => list
                    .iter()
                    .any(|a| bloom.contains_input(BloomInput::Raw(a.as_slice()))),
            };
            let topic0_hit = f.topics[0].is_empty()
                || f.topics[0]
                    .iter()
                    .any(|t| bloom.contains_input(BloomInput::Raw(t.as_slice())));
            address_hit && topic0_hit
        }
        _ => false,
    })
}

struct HeapEntry(FetchedBlock);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.block.hash == other.0.block.hash
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap on block number: newest head first, stale heads become
        // duplicates or gap-fills naturally
        self.0
            .block
            .number
            .cmp(&other.0.block.number)
            .then_with(|| self.0.block.hash.cmp(&other.0.block.hash))
    }
}

pub struct RealtimeSync<S: BlockSource> {
    chain: ChainConfig,
    source: Arc<S>,
    store: Arc<SyncStore>,
    filters: Arc<Vec<Filter>>,
    children: Arc<RwLock<ChildAddresses>>,
    state: UnfinalizedChain,
    /// Ordered follow-up work (gap fills, post-reorg canonical blocks),
    /// drained before new heads.
    backlog: VecDeque<FetchedBlock>,
    heads: BinaryHeap<HeapEntry>,
    events: mpsc::Sender<RealtimeEvent>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl<S: BlockSource> RealtimeSync<S> {
    /// Establish the finalized root (`latest − F`, floored at genesis) and
    /// an empty unfinalized chain on top of it.
    #[allow(clippy::too_many_arguments)]
    pub async fn initialize(
        chain: ChainConfig,
        source: Arc<S>,
        store: Arc<SyncStore>,
        filters: Arc<Vec<Filter>>,
        children: Arc<RwLock<ChildAddresses>>,
        events: mpsc::Sender<RealtimeEvent>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Result<Self, SyncError> {
        let latest = source.latest_number().await?;
        let finalized_number = initial_finalized(latest, chain.finality_depth);
        let finalized = source
            .by_number(finalized_number)
            .await?
            .ok_or_else(|| {
                SyncError::Validation(format!("finalized block {finalized_number} missing"))
            })?
            .light();
        tracing::info!(
            chain = %chain.name,
            latest,
            finalized = finalized_number,
            "realtime sync starting"
        );
        let state = UnfinalizedChain::new(finalized, chain.finality_depth);
        Ok(RealtimeSync {
            chain,
            source,
            store,
            filters,
            children,
            state,
            backlog: VecDeque::new(),
            heads: BinaryHeap::new(),
            events,
            metrics,
            shutdown,
        })
    }

    /// Serial worker loop: follow-up work first, then queued heads in
    /// priority order, then wait for the subscription.
    pub async fn run(mut self, mut incoming: mpsc::Receiver<Block>) -> Result<(), SyncError> {
        loop {
            if let Some(candidate) = self.backlog.pop_front() {
                self.process(candidate).await?;
                continue;
            }
            if let Some(entry) = self.heads.pop() {
                self.process(entry.0).await?;
                continue;
            }
            tokio::select! {
                maybe_block = incoming.recv() => {
                    match maybe_block {
                        Some(block) => {
                            let fetched = FetchedBlock::from_rpc(self.chain.chain_id, &block);
                            self.heads.push(HeapEntry(fetched));
                        }
                        None => return Ok(()),
                    }
                }
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn process(&mut self, candidate: FetchedBlock) -> Result<(), SyncError> {
        let light = candidate.light();
        match self.state.try_extend(&light) {
            Advance::Duplicate => Ok(()),
            Advance::Gap { from, to } => self.fill_gap(from, to, candidate).await,
            Advance::Extended { finalized } => {
                self.apply_block(candidate).await?;
                if let Some(block) = finalized {
                    Metrics::incr(&self.metrics.finalizations);
                    tracing::info!(
                        chain = %self.chain.name,
                        finalized = block.number,
                        "finalization checkpoint advanced"
                    );
                    self.emit(RealtimeEvent::Finalize {
                        chain_id: self.chain.chain_id,
                        block,
                    })
                    .await;
                }
                Ok(())
            }
            Advance::Forked => self.handle_fork(candidate).await,
        }
    }

    async fn fill_gap(
        &mut self,
        from: u64,
        to: u64,
        candidate: FetchedBlock,
    ) -> Result<(), SyncError> {
        tracing::debug!(
            chain = %self.chain.name,
            from,
            to,
            head = candidate.block.number,
            "filling gap below new head"
        );
        let source = Arc::clone(&self.source);
        let mut fetched: Vec<FetchedBlock> = stream::iter(from..=to)
            .map(|number| {
                let source = Arc::clone(&source);
                async move { source.by_number(number).await }
            })
            .buffer_unordered(GAP_FETCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<Option<FetchedBlock>>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        fetched.sort_by_key(|b| b.block.number);
        if (fetched.len() as u64) < to - from + 1 {
            tracing::warn!(
                chain = %self.chain.name,
                from,
                to,
                fetched = fetched.len(),
                "provider is missing blocks inside the gap"
            );
        }
        // everything re-enters processing in ascending order, candidate last
        for block in fetched {
            self.backlog.push_back(block);
        }
        self.backlog.push_back(candidate);
        Ok(())
    }

    /// Happy path: persist the block's matched artifacts and emit it.
    async fn apply_block(&mut self, candidate: FetchedBlock) -> Result<(), SyncError> {
        let chain_id = self.chain.chain_id;
        let block = candidate.block.clone();

        let has_log_filters = self.filters.iter().any(|f| matches!(f, Filter::Log(_)));
        let mut logs: Vec<SyncLog> = Vec::new();
        if has_log_filters && bloom_might_match(&self.filters, &block.logs_bloom) {
            let fetched = self.source.logs_for_block(block.hash).await?;
            let children = self.children.read();
            for mut log in fetched {
                log.block_timestamp = Some(block.timestamp);
                let matched = self.filters.iter().any(|f| match f {
                    Filter::Log(lf) => lf.matches(&log, &children),
                    _ => false,
                });
                if matched {
                    logs.push(log);
                }
            }
        }

        let mut traces: Vec<SyncTrace> = Vec::new();
        if self.filters.iter().any(Filter::needs_traces) {
            let all = self
                .source
                .traces_for_block(&block, &candidate.transactions)
                .await?;
            let children = self.children.read();
            for trace in all {
                let wanted = self.filters.iter().any(|f| match f {
                    Filter::Trace(tf) => tf.matches(&trace, &children),
                    Filter::Transfer(tf) => tf.matches(&trace, &children),
                    _ => false,
                });
                if wanted {
                    traces.push(trace);
                }
            }
        }

        let transactions: Vec<SyncTransaction> = {
            let children = self.children.read();
            candidate
                .transactions
                .into_iter()
                .filter(|tx| {
                    logs.iter().any(|l| l.transaction_hash == tx.hash)
                        || traces.iter().any(|t| t.transaction_hash == tx.hash)
                        || self.filters.iter().any(|f| match f {
                            Filter::Transaction(tf) => tf.matches(tx, &children),
                            _ => false,
                        })
                })
                .collect()
        };

        self.store.insert_blocks(std::slice::from_ref(&block)).await?;
        self.store.insert_transactions(&transactions).await?;
        self.store.insert_logs(&logs).await?;
        self.store.insert_traces(&traces).await?;

        tracing::info!(
            chain = %self.chain.name,
            block = block.number,
            logs = logs.len(),
            transactions = transactions.len(),
            traces = traces.len(),
            "unfinalized block"
        );
        self.emit(RealtimeEvent::Block { chain_id, block, logs, transactions, traces }).await;
        Ok(())
    }

    async fn handle_fork(&mut self, candidate: FetchedBlock) -> Result<(), SyncError> {
        let candidate_number = candidate.block.number;
        match walk_to_common_ancestor(&self.state, self.source.as_ref(), candidate).await? {
            Walk::Shallow { ancestor, canonical, depth } => {
                if self.state.truncate_to(ancestor.hash).is_none() {
                    return Err(SyncError::Validation(format!(
                        "common ancestor {} vanished from the local chain",
                        ancestor.number
                    )));
                }
                self.store
                    .prune_from_block(self.chain.chain_id, ancestor.number + 1)
                    .await?;
                // queued heads may belong to the losing fork
                self.heads.clear();
                self.backlog.clear();

                Metrics::incr(&self.metrics.reorgs_handled);
                tracing::warn!(
                    chain = %self.chain.name,
                    common_ancestor = ancestor.number,
                    depth,
                    "shallow reorg"
                );
                self.emit(RealtimeEvent::Reorg {
                    chain_id: self.chain.chain_id,
                    common_ancestor: ancestor,
                    depth,
                })
                .await;
                for block in canonical {
                    self.backlog.push_back(block);
                }
                Ok(())
            }
            Walk::Deep { minimum_depth } => {
                tracing::error!(
                    chain = %self.chain.name,
                    candidate = candidate_number,
                    finalized = self.state.finalized.number,
                    minimum_depth,
                    "deep reorg beyond finality depth; stopping chain"
                );
                self.emit(RealtimeEvent::DeepReorg {
                    chain_id: self.chain.chain_id,
                    minimum_depth,
                })
                .await;
                Err(SyncError::DeepReorg {
                    chain_id: self.chain.chain_id,
                    finalized_block: self.state.finalized.number,
                    minimum_depth,
                })
            }
        }
    }

    async fn emit(&self, event: RealtimeEvent) {
        if self.events.capacity() == 0 {
            // consumer is behind; the bounded channel is our backpressure
            tracing::debug!(chain = %self.chain.name, "realtime event channel full");
        }
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    fn light(number: u64, tag: u8, parent_tag: u8) -> LightBlock {
        LightBlock {
            number,
            hash: block_hash(number, tag),
            parent_hash: block_hash(number.wrapping_sub(1), parent_tag),
            timestamp: 1_000 + number,
        }
    }

    fn block_hash(number: u64, tag: u8) -> B256 {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&number.to_be_bytes());
        bytes[31] = tag;
        B256::from(bytes)
    }

    fn sync_block(l: &LightBlock) -> SyncBlock {
        SyncBlock {
            chain_id: 1,
            number: l.number,
            hash: l.hash,
            parent_hash: l.parent_hash,
            timestamp: l.timestamp,
            miner: Address::ZERO,
            gas_used: 0,
            gas_limit: 30_000_000,
            base_fee_per_gas: None,
            logs_bloom: Bloom::ZERO,
            transaction_count: 0,
        }
    }

    fn fetched(l: &LightBlock) -> FetchedBlock {
        FetchedBlock { block: sync_block(l), transactions: vec![] }
    }

    /// In-memory chain the walk can traverse by hash.
    struct ScriptedSource {
        by_hash: HashMap<B256, FetchedBlock>,
    }

    impl ScriptedSource {
        fn new(blocks: &[LightBlock]) -> Self {
            ScriptedSource {
                by_hash: blocks.iter().map(|l| (l.hash, fetched(l))).collect(),
            }
        }
    }

    #[async_trait]
    impl BlockSource for ScriptedSource {
        async fn latest_number(&self) -> Result<u64, RpcClientError> {
            Ok(self.by_hash.values().map(|b| b.block.number).max().unwrap_or(0))
        }
        async fn by_number(&self, number: u64) -> Result<Option<FetchedBlock>, RpcClientError> {
            Ok(self
                .by_hash
                .values()
                .find(|b| b.block.number == number)
                .cloned())
        }
        async fn by_hash(&self, hash: B256) -> Result<Option<FetchedBlock>, RpcClientError> {
            Ok(self.by_hash.get(&hash).cloned())
        }
        async fn logs_for_block(&self, _hash: B256) -> Result<Vec<SyncLog>, RpcClientError> {
            Ok(vec![])
        }
        async fn traces_for_block(
            &self,
            _block: &SyncBlock,
            _transactions: &[SyncTransaction],
        ) -> Result<Vec<SyncTrace>, RpcClientError> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_initial_finalized_at_setup() {
        // latest 50, F = 10 -> finalized 40
        assert_eq!(initial_finalized(50, 10), 40);
        // latest 50, F = 75 -> floored at genesis
        assert_eq!(initial_finalized(50, 75), 0);
    }

    #[test]
    fn test_gap_detection_and_ordered_fill() {
        let base = light(40, 0, 0);
        let mut chain = UnfinalizedChain::new(base, 10);

        // head jumps 40 -> 50: blocks 41..=49 must come first
        let head50 = LightBlock {
            number: 50,
            hash: block_hash(50, 0),
            parent_hash: block_hash(49, 0),
            timestamp: 1_050,
        };
        assert_eq!(chain.try_extend(&head50), Advance::Gap { from: 41, to: 49 });

        // the eleven blocks 40..=50 then extend in order
        let mut extended = 1; // 40 is the root
        for n in 41..=50 {
            let b = light(n, 0, 0);
            assert_eq!(chain.try_extend(&b), Advance::Extended { finalized: None });
            extended += 1;
        }
        assert_eq!(extended, 11);
        assert_eq!(chain.head().number, 50);
        chain.assert_linked();
    }

    #[test]
    fn test_duplicate_heads_are_dropped() {
        let base = light(40, 0, 0);
        let mut chain = UnfinalizedChain::new(base, 10);
        let next = light(41, 0, 0);
        assert_eq!(chain.try_extend(&next), Advance::Extended { finalized: None });
        assert_eq!(chain.try_extend(&next), Advance::Duplicate);
        assert_eq!(chain.blocks.len(), 2);
    }

    #[test]
    fn test_finalization_advances_by_f_and_prunes() {
        let depth = 5;
        let base = light(100, 0, 0);
        let mut chain = UnfinalizedChain::new(base, depth);

        let mut finalizations = Vec::new();
        for n in 101..=111 {
            if let Advance::Extended { finalized: Some(f) } = chain.try_extend(&light(n, 0, 0)) {
                finalizations.push(f.number);
            }
        }
        // 111 > 100 + 2*5 fires the advance to 100 + 5
        assert_eq!(finalizations, vec![105]);
        assert_eq!(chain.finalized.number, 105);
        assert!(chain.blocks.iter().all(|b| b.number >= 105));
        chain.assert_linked();

        // monotone: the pointer never goes backwards
        for n in 112..=130 {
            chain.try_extend(&light(n, 0, 0));
            assert!(chain.finalized.number >= 105);
        }
        // buffer stays bounded near 2F
        assert!(chain.blocks.len() as u64 <= 2 * depth + 1);
    }

    #[tokio::test]
    async fn test_shallow_reorg_walks_to_common_ancestor() {
        // local chain: 40, 41a, 42a
        let b40 = light(40, 0, 0);
        let b41a = LightBlock {
            number: 41,
            hash: block_hash(41, 0xa),
            parent_hash: b40.hash,
            timestamp: 1_041,
        };
        let b42a = LightBlock {
            number: 42,
            hash: block_hash(42, 0xa),
            parent_hash: b41a.hash,
            timestamp: 1_042,
        };
        let mut chain = UnfinalizedChain::new(b40, 10);
        assert_eq!(chain.try_extend(&b41a), Advance::Extended { finalized: None });
        assert_eq!(chain.try_extend(&b42a), Advance::Extended { finalized: None });

        // remote fork: 42b (parent 41a), 43b (parent 42b)
        let b42b = LightBlock {
            number: 42,
            hash: block_hash(42, 0xb),
            parent_hash: b41a.hash,
            timestamp: 1_042,
        };
        let b43b = LightBlock {
            number: 43,
            hash: block_hash(43, 0xb),
            parent_hash: b42b.hash,
            timestamp: 1_043,
        };
        let source = ScriptedSource::new(&[b42b, b43b]);

        assert_eq!(chain.try_extend(&b43b), Advance::Forked);
        let walk = walk_to_common_ancestor(&chain, &source, fetched(&b43b))
            .await
            .unwrap();
        match walk {
            Walk::Shallow { ancestor, canonical, depth } => {
                assert_eq!(ancestor, b41a);
                assert_eq!(depth, 2);
                let numbers: Vec<u64> =
                    canonical.iter().map(|b| b.block.number).collect();
                assert_eq!(numbers, vec![42, 43]);
                assert_eq!(canonical[0].block.hash, b42b.hash);
            }
            other => panic!("expected shallow reorg, got {other:?}"),
        }

        let (ancestor, removed) = chain.truncate_to(b41a.hash).unwrap();
        assert_eq!(ancestor, b41a);
        assert_eq!(removed, 1); // 42a dropped
        chain.assert_linked();
    }

    #[tokio::test]
    async fn test_deep_reorg_when_walk_passes_finalized() {
        // local: finalized 40, then 41..43 on fork `a`
        let b40 = light(40, 0xa, 0xa);
        let mut chain = UnfinalizedChain::new(b40, 4);
        for n in 41..=43 {
            chain.try_extend(&light(n, 0xa, 0xa));
        }

        // canonical fork `b` reaches back past 40 without touching `a`
        let fork: Vec<LightBlock> = (39..=44).map(|n| light(n, 0xb, 0xb)).collect();
        let source = ScriptedSource::new(&fork);
        let candidate = fetched(fork.last().unwrap());

        assert_eq!(chain.try_extend(&candidate.light()), Advance::Forked);
        let walk = walk_to_common_ancestor(&chain, &source, candidate).await.unwrap();
        match walk {
            Walk::Deep { minimum_depth } => {
                assert!(minimum_depth >= chain.finality_depth);
                assert_eq!(minimum_depth, 4); // candidate 44 - finalized 40
            }
            other => panic!("expected deep reorg, got {other:?}"),
        }
    }

    #[test]
    fn test_bloom_precheck() {
        use crate::filter::LogFilter;
        let address = Address::repeat_byte(0x11);
        let topic = B256::repeat_byte(0x22);
        let filter = Filter::Log(LogFilter {
            id: "f".into(),
            chain_id: 1,
            address: AddressSpec::Concrete(vec![address]),
            topics: [vec![topic], vec![], vec![], vec![]],
            from_block: 0,
            to_block: None,
            include_receipts: false,
        });

        let mut bloom = Bloom::ZERO;
        assert!(!bloom_might_match(&[filter.clone()], &bloom));

        bloom.accrue(BloomInput::Raw(address.as_slice()));
        // address present but topic absent: still a miss
        assert!(!bloom_might_match(&[filter.clone()], &bloom));

        bloom.accrue(BloomInput::Raw(topic.as_slice()));
        assert!(bloom_might_match(&[filter], &bloom));
    }
}
