//! The omnichain driver: merges per-chain event streams into one
//! checkpoint-ordered stream, dispatches to handlers inside a database
//! transaction per batch, and keeps the per-chain checkpoints moving
//! atomically with the writes they cover.

pub mod events;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::config::ChainConfig;
use crate::error::{IndexingError, StoreError};
use crate::filter::{ChildAddresses, Filter};
use crate::metrics::Metrics;
use crate::rpc::RpcClient;
use crate::store::indexing::IndexingStore;
use crate::store::sync::{ChainCheckpointRow, EventPayload, StoredEvent, SyncStore};
use crate::sync::realtime::RealtimeEvent;
use crate::types::{SyncBlock, SyncLog, SyncReceipt, SyncTrace, SyncTransaction};
use events::{
    omni_current, omni_finalized, ChainProgress, Db, Event, HandlerRegistry,
};

/// Events dispatched per transaction during the historical phase.
const EVENT_BATCH: usize = 1000;
/// Wait between polls when producers are ahead of nothing.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// What the driver needs of one chain: its declared filters, the shared
/// child-address map, and the RPC client for refetching event fields the
/// filters did not cover.
pub struct ChainRuntime {
    pub config: ChainConfig,
    pub filters: Arc<Vec<Filter>>,
    pub children: Arc<RwLock<ChildAddresses>>,
    pub client: Arc<RpcClient>,
}

/// A chain's historical producer watermark: everything at or below
/// `through` is fully persisted; `complete` once the producer has reached
/// the finalized tip.
#[derive(Debug, Clone, Copy)]
pub struct SyncProgress {
    pub through: Checkpoint,
    pub complete: bool,
}

pub struct Driver {
    sync_store: Arc<SyncStore>,
    indexing_store: Arc<IndexingStore>,
    registry: Arc<HandlerRegistry>,
    chains: Vec<ChainRuntime>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl Driver {
    pub fn new(
        sync_store: Arc<SyncStore>,
        indexing_store: Arc<IndexingStore>,
        registry: Arc<HandlerRegistry>,
        chains: Vec<ChainRuntime>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Driver { sync_store, indexing_store, registry, chains, metrics, shutdown }
    }

    /// Dispatch setup events for chains without a persisted checkpoint row
    /// (a fresh database or a newly added chain), then make sure every
    /// chain has a row. Returns the rows, keyed by chain id.
    pub async fn ensure_setup(&self) -> Result<HashMap<u64, ChainCheckpointRow>, IndexingError> {
        let mut rows: HashMap<u64, ChainCheckpointRow> = self
            .sync_store
            .get_checkpoints()
            .await?
            .into_iter()
            .map(|row| (row.chain_id, row))
            .collect();

        for runtime in &self.chains {
            let chain_id = runtime.config.chain_id;
            if rows.contains_key(&chain_id) {
                continue;
            }

            let setup: Vec<_> = self
                .registry
                .setup_handlers()
                .iter()
                .filter(|(c, _)| *c == chain_id)
                .collect();
            if !setup.is_empty() {
                let mut tx = self
                    .indexing_store
                    .pool()
                    .begin()
                    .await
                    .map_err(StoreError::from_sqlx)?;
                for (_, handler) in &setup {
                    let mut db =
                        Db::new(&mut tx, &self.indexing_store, Checkpoint::ZERO);
                    handler.setup(chain_id, &mut db).await?;
                }
                tx.commit().await.map_err(StoreError::from_sqlx)?;
                tracing::info!(
                    chain = %runtime.config.name,
                    handlers = setup.len(),
                    "setup events dispatched"
                );
            }

            let row = ChainCheckpointRow {
                chain_id,
                chain_name: runtime.config.name.clone(),
                latest: Checkpoint::ZERO,
                safe: Checkpoint::ZERO,
                finalized: Checkpoint::ZERO,
            };
            self.sync_store.upsert_checkpoint(&row).await?;
            rows.insert(chain_id, row);
        }
        Ok(rows)
    }

    /// Historical phase: follow the per-chain producer watermarks, read
    /// events in checkpoint order bounded by the omnichain `current`
    /// checkpoint, zipper across chains, and dispatch transactionally.
    /// Returns once every chain's historical producer is complete and
    /// drained.
    pub async fn run_historical(
        &self,
        rows: &HashMap<u64, ChainCheckpointRow>,
        watermarks: HashMap<u64, watch::Receiver<SyncProgress>>,
    ) -> Result<(), IndexingError> {
        // crash recovery resumes strictly after `safe`
        let mut cursors: HashMap<u64, Checkpoint> = rows
            .iter()
            .map(|(chain_id, row)| (*chain_id, row.safe))
            .collect();

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let snapshot: HashMap<u64, SyncProgress> = watermarks
                .iter()
                .map(|(chain_id, rx)| (*chain_id, *rx.borrow()))
                .collect();
            let progress: Vec<ChainProgress> = self
                .chains
                .iter()
                .map(|runtime| {
                    let chain_id = runtime.config.chain_id;
                    let p = snapshot[&chain_id];
                    ChainProgress {
                        chain_id,
                        start: rows[&chain_id].safe,
                        current: p.through,
                        end: None,
                        finalized: rows[&chain_id].finalized,
                        done: p.complete,
                    }
                })
                .collect();
            let Some(target) = omni_current(&progress) else {
                return Ok(());
            };

            let mut batch: Vec<Event> = Vec::new();
            let mut advances: Vec<(u64, Checkpoint)> = Vec::new();
            for runtime in &self.chains {
                let chain_id = runtime.config.chain_id;
                let upper = target.min(snapshot[&chain_id].through);
                let cursor = cursors[&chain_id];
                if cursor >= upper {
                    continue;
                }
                let children = runtime.children.read().clone();
                let (stored, resume) = self
                    .sync_store
                    .get_events(chain_id, &runtime.filters, &children, &cursor, &upper, EVENT_BATCH)
                    .await?;
                // a partial scan pins the cursor to the last complete
                // checkpoint; a full scan covers the window
                advances.push((chain_id, resume.unwrap_or(upper)));
                batch.extend(stored.into_iter().map(|event| to_event(runtime, event)));
            }

            if batch.is_empty() && advances.is_empty() {
                let drained = self.chains.iter().all(|runtime| {
                    let chain_id = runtime.config.chain_id;
                    let p = snapshot[&chain_id];
                    p.complete && cursors[&chain_id] >= p.through
                });
                if drained {
                    tracing::info!("historical indexing complete");
                    return Ok(());
                }
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_WAIT) => continue,
                    _ = self.shutdown.cancelled() => return Ok(()),
                }
            }

            // zipper: the checkpoint encoding is a total order across
            // chains, chain id included
            batch.sort_by(|a, b| a.checkpoint.cmp(&b.checkpoint));
            self.dispatch_batch(&mut batch, &advances).await?;
            for (chain_id, checkpoint) in advances {
                cursors.insert(chain_id, checkpoint);
            }
        }
    }

    /// Realtime phase: consume the merged per-chain stream in production
    /// order. Block events dispatch as per-block sub-batches; reorgs undo
    /// user writes; finalization advances the watermark and prunes op-logs.
    pub async fn run_realtime(
        &self,
        rows: &HashMap<u64, ChainCheckpointRow>,
        mut incoming: mpsc::Receiver<RealtimeEvent>,
    ) -> Result<(), IndexingError> {
        let runtimes: HashMap<u64, &ChainRuntime> = self
            .chains
            .iter()
            .map(|r| (r.config.chain_id, r))
            .collect();
        let mut finalized: HashMap<u64, Checkpoint> = rows
            .iter()
            .map(|(chain_id, row)| (*chain_id, row.finalized))
            .collect();

        loop {
            let event = tokio::select! {
                maybe = incoming.recv() => match maybe {
                    Some(event) => event,
                    None => return Ok(()),
                },
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            match event {
                RealtimeEvent::Block { chain_id, block, logs, transactions, traces } => {
                    let Some(runtime) = runtimes.get(&chain_id) else { continue };
                    let mut batch =
                        build_block_events(runtime, &block, &logs, &transactions, &traces);
                    let end =
                        Checkpoint::block_end(block.timestamp, chain_id, block.number);
                    self.dispatch_batch(&mut batch, &[(chain_id, end)]).await?;
                }
                RealtimeEvent::Reorg { chain_id, common_ancestor, depth } => {
                    let to = Checkpoint::block_end(
                        common_ancestor.timestamp,
                        chain_id,
                        common_ancestor.number,
                    );
                    let undone = self.indexing_store.revert(&to).await?;
                    let mut conn = self
                        .sync_store
                        .pool()
                        .acquire()
                        .await
                        .map_err(StoreError::from_sqlx)?;
                    SyncStore::advance_checkpoint(
                        &mut conn,
                        self.sync_store.dialect(),
                        chain_id,
                        &to,
                        &to,
                    )
                    .await?;
                    Metrics::incr(&self.metrics.reorgs_handled);
                    tracing::warn!(
                        chain_id,
                        common_ancestor = common_ancestor.number,
                        depth,
                        undone,
                        "user tables rewound after reorg"
                    );
                }
                RealtimeEvent::Finalize { chain_id, block } => {
                    let checkpoint =
                        Checkpoint::block_end(block.timestamp, chain_id, block.number);
                    self.sync_store.set_finalized(chain_id, &checkpoint).await?;
                    finalized.insert(chain_id, checkpoint);
                    // op-log rows are prunable only below every chain's
                    // finalized point
                    let progress: Vec<ChainProgress> = finalized
                        .iter()
                        .map(|(chain_id, checkpoint)| ChainProgress {
                            chain_id: *chain_id,
                            start: Checkpoint::ZERO,
                            current: *checkpoint,
                            end: None,
                            finalized: *checkpoint,
                            done: false,
                        })
                        .collect();
                    if let Some(omni) = omni_finalized(&progress) {
                        if omni > Checkpoint::ZERO {
                            self.indexing_store.finalize(&omni).await?;
                        }
                    }
                }
                RealtimeEvent::DeepReorg { chain_id, minimum_depth } => {
                    tracing::error!(
                        chain_id,
                        minimum_depth,
                        "chain stopped on deep reorg; operator intervention required"
                    );
                }
            }
        }
    }

    /// One transaction around a batch: handler writes, op-log entries, and
    /// checkpoint advance commit or roll back together. A handler reading
    /// an unfetched field gets the batch refetched with that field
    /// populated and retried once; other user errors restore the metrics
    /// snapshot and abort.
    async fn dispatch_batch(
        &self,
        batch: &mut [Event],
        advances: &[(u64, Checkpoint)],
    ) -> Result<(), IndexingError> {
        if batch.is_empty() && advances.is_empty() {
            return Ok(());
        }
        let dialect = self.sync_store.dialect();

        for attempt in 0..2u8 {
            let snapshot = self.metrics.indexing_snapshot();
            let mut tx = self
                .indexing_store
                .pool()
                .begin()
                .await
                .map_err(StoreError::from_sqlx)?;
            let mut failure: Option<IndexingError> = None;

            for event in batch.iter() {
                let Some(handler) = self.registry.get(event.chain_id, &event.filter_id)
                else {
                    continue;
                };
                let mut db = Db::new(&mut tx, &self.indexing_store, event.checkpoint);
                if let Err(e) = handler.handle(event, &mut db).await {
                    failure = Some(e);
                    break;
                }
            }
            if failure.is_none() {
                for (chain_id, checkpoint) in advances {
                    if let Err(e) = SyncStore::advance_checkpoint(
                        &mut tx, dialect, *chain_id, checkpoint, checkpoint,
                    )
                    .await
                    {
                        failure = Some(e.into());
                        break;
                    }
                }
            }

            match failure {
                None => {
                    tx.commit().await.map_err(StoreError::from_sqlx)?;
                    Metrics::add(&self.metrics.events_dispatched, batch.len() as u64);
                    Metrics::incr(&self.metrics.batches_committed);
                    return Ok(());
                }
                Some(IndexingError::InvalidEventAccess { field }) if attempt == 0 => {
                    let _ = tx.rollback().await;
                    self.metrics.restore_indexing(snapshot);
                    tracing::warn!(
                        field = %field,
                        "handler read an unfetched event field; refetching and retrying batch once"
                    );
                    self.hydrate_batch(batch, &field).await?;
                }
                Some(error) if error.is_retryable() && attempt == 0 => {
                    let _ = tx.rollback().await;
                    self.metrics.restore_indexing(snapshot);
                    tracing::warn!(error = %error, "transient dispatch failure, retrying batch");
                }
                Some(error) => {
                    let _ = tx.rollback().await;
                    self.metrics.restore_indexing(snapshot);
                    return Err(error);
                }
            }
        }
        unreachable!("dispatch loop returns within two attempts")
    }

    /// Attach the event association a handler needed but the filters did
    /// not fetch. Transactions come from the sync store (phase 2 persists
    /// every matched transaction); receipts fall back to the chain's RPC
    /// client and are persisted so the refetch pays once.
    async fn hydrate_batch(
        &self,
        batch: &mut [Event],
        field: &str,
    ) -> Result<(), IndexingError> {
        match field {
            "transaction" => {
                for chain in &self.chains {
                    let chain_id = chain.config.chain_id;
                    let wanted: Vec<B256> = batch
                        .iter()
                        .filter(|e| {
                            e.chain_id == chain_id
                                && e.transaction.is_none()
                                && !matches!(e.payload, EventPayload::Transaction(_))
                        })
                        .filter_map(Event::transaction_hash)
                        .collect::<HashSet<_>>()
                        .into_iter()
                        .collect();
                    let found: HashMap<B256, SyncTransaction> = self
                        .sync_store
                        .get_transactions_by_hash(chain_id, &wanted)
                        .await?
                        .into_iter()
                        .map(|tx| (tx.hash, tx))
                        .collect();
                    for event in batch.iter_mut().filter(|e| e.chain_id == chain_id) {
                        if event.transaction.is_none() {
                            event.transaction = event
                                .transaction_hash()
                                .and_then(|hash| found.get(&hash).cloned());
                        }
                    }
                }
                Ok(())
            }
            "receipt" => {
                for chain in &self.chains {
                    let chain_id = chain.config.chain_id;
                    let wanted: Vec<B256> = batch
                        .iter()
                        .filter(|e| e.chain_id == chain_id && e.receipt.is_none())
                        .filter_map(Event::transaction_hash)
                        .collect::<HashSet<_>>()
                        .into_iter()
                        .collect();
                    let mut found: HashMap<B256, SyncReceipt> = self
                        .sync_store
                        .get_receipts_by_hash(chain_id, &wanted)
                        .await?
                        .into_iter()
                        .map(|r| (r.transaction_hash, r))
                        .collect();

                    // whatever the store is missing was never fetched;
                    // get it from the chain and persist it
                    let mut fetched: Vec<SyncReceipt> = Vec::new();
                    for hash in wanted.iter().filter(|h| !found.contains_key(*h)) {
                        let receipt = chain
                            .client
                            .get_transaction_receipt(*hash)
                            .await
                            .map_err(|e| {
                                if e.is_retryable() {
                                    IndexingError::Retryable(e.to_string())
                                } else {
                                    IndexingError::NonRetryable(e.to_string())
                                }
                            })?;
                        if let Some(raw) = receipt {
                            fetched.push(SyncReceipt::from_rpc(chain_id, &raw));
                        }
                    }
                    self.sync_store.insert_receipts(&fetched).await?;
                    for receipt in fetched {
                        found.insert(receipt.transaction_hash, receipt);
                    }

                    for event in batch.iter_mut().filter(|e| e.chain_id == chain_id) {
                        if event.receipt.is_none() {
                            event.receipt = event
                                .transaction_hash()
                                .and_then(|hash| found.get(&hash).cloned());
                        }
                    }
                }
                Ok(())
            }
            other => Err(IndexingError::NonRetryable(format!(
                "handler requested unknown event field '{other}'"
            ))),
        }
    }
}

fn to_event(runtime: &ChainRuntime, stored: StoredEvent) -> Event {
    Event {
        chain_id: runtime.config.chain_id,
        chain_name: runtime.config.name.clone(),
        filter_id: runtime.filters[stored.filter_index].id().clone(),
        checkpoint: stored.checkpoint,
        payload: stored.payload,
        // associations stay lazy: a handler touching one triggers the
        // refetch-and-retry path
        transaction: None,
        receipt: None,
    }
}

/// Expand one realtime block into its filter-matched events, ordered by
/// checkpoint within the block.
fn build_block_events(
    runtime: &ChainRuntime,
    block: &SyncBlock,
    logs: &[SyncLog],
    transactions: &[SyncTransaction],
    traces: &[SyncTrace],
) -> Vec<Event> {
    let children = runtime.children.read().clone();
    let mut batch: Vec<Event> = Vec::new();
    // the block's transactions are already in hand, so log/trace events get
    // their enclosing transaction eagerly
    let enclosing = |hash: B256| transactions.iter().find(|t| t.hash == hash).cloned();
    let mut push = |filter_id: &str,
                    checkpoint: Checkpoint,
                    payload: EventPayload,
                    transaction: Option<SyncTransaction>| {
        batch.push(Event {
            chain_id: runtime.config.chain_id,
            chain_name: runtime.config.name.clone(),
            filter_id: filter_id.to_string(),
            checkpoint,
            payload,
            transaction,
            receipt: None,
        });
    };

    for filter in runtime.filters.iter() {
        match filter {
            Filter::Log(f) => {
                for log in logs.iter().filter(|l| f.matches(l, &children)) {
                    push(
                        &f.id,
                        log.checkpoint(block.timestamp),
                        EventPayload::Log(log.clone()),
                        enclosing(log.transaction_hash),
                    );
                }
            }
            Filter::Transaction(f) => {
                for tx in transactions.iter().filter(|t| f.matches(t, &children)) {
                    push(&f.id, tx.checkpoint(), EventPayload::Transaction(tx.clone()), None);
                }
            }
            Filter::Trace(f) => {
                for trace in traces.iter().filter(|t| f.matches(t, &children)) {
                    push(
                        &f.id,
                        trace.checkpoint(),
                        EventPayload::Trace(trace.clone()),
                        enclosing(trace.transaction_hash),
                    );
                }
            }
            Filter::Transfer(f) => {
                for trace in traces.iter().filter(|t| f.matches(t, &children)) {
                    push(
                        &f.id,
                        trace.transfer_checkpoint(),
                        EventPayload::Transfer(trace.clone()),
                        enclosing(trace.transaction_hash),
                    );
                }
            }
            Filter::Block(f) => {
                if f.matches(block.number) {
                    push(&f.id, block.checkpoint(), EventPayload::Block(block.clone()), None);
                }
            }
        }
    }

    batch.sort_by(|a, b| a.checkpoint.cmp(&b.checkpoint));
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AddressSpec, BlockFilter, LogFilter};
    use alloy::primitives::{Address, Bloom, Bytes, B256};

    fn runtime(filters: Vec<Filter>) -> ChainRuntime {
        let config = ChainConfig {
            name: "testnet".to_string(),
            chain_id: 1,
            rpc: vec!["http://localhost:8545".to_string()],
            ws: None,
            poll_interval_ms: 2000,
            finality_depth: 8,
            cache: true,
            filters: vec![],
        };
        let client = Arc::new(
            RpcClient::new(&config, CancellationToken::new(), Arc::new(Metrics::default()))
                .expect("client over a static url"),
        );
        ChainRuntime {
            config,
            filters: Arc::new(filters),
            children: Arc::new(RwLock::new(ChildAddresses::default())),
            client,
        }
    }

    fn block(number: u64) -> SyncBlock {
        SyncBlock {
            chain_id: 1,
            number,
            hash: B256::repeat_byte(number as u8),
            parent_hash: B256::repeat_byte(number.wrapping_sub(1) as u8),
            timestamp: 1_000 + number,
            miner: Address::ZERO,
            gas_used: 0,
            gas_limit: 30_000_000,
            base_fee_per_gas: None,
            logs_bloom: Bloom::ZERO,
            transaction_count: 0,
        }
    }

    fn log(block_number: u64, log_index: u64, tx_index: u64) -> SyncLog {
        SyncLog {
            chain_id: 1,
            block_hash: B256::repeat_byte(block_number as u8),
            block_number,
            block_timestamp: Some(1_000 + block_number),
            log_index,
            transaction_hash: B256::repeat_byte(0x70),
            transaction_index: tx_index,
            address: Address::repeat_byte(0x11),
            topics: vec![B256::repeat_byte(0x22)],
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_block_events_ordered_within_block() {
        let log_filter = Filter::Log(LogFilter {
            id: "logs".into(),
            chain_id: 1,
            address: AddressSpec::Any,
            topics: [vec![], vec![], vec![], vec![]],
            from_block: 0,
            to_block: None,
            include_receipts: false,
        });
        let block_filter = Filter::Block(BlockFilter {
            id: "every".into(),
            chain_id: 1,
            interval: 1,
            offset: 0,
            from_block: 0,
            to_block: None,
        });
        let runtime = runtime(vec![block_filter, log_filter]);

        let b = block(10);
        let logs = vec![log(10, 1, 0), log(10, 0, 0)];
        let events = build_block_events(&runtime, &b, &logs, &[], &[]);

        // logs in log-index order, the block event after all of them
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].filter_id, "logs");
        assert_eq!(events[1].filter_id, "logs");
        assert_eq!(events[2].filter_id, "every");
        assert!(events[0].checkpoint < events[1].checkpoint);
        assert!(events[1].checkpoint < events[2].checkpoint);
    }

    #[test]
    fn test_block_events_respect_filter_ranges() {
        let log_filter = Filter::Log(LogFilter {
            id: "logs".into(),
            chain_id: 1,
            address: AddressSpec::Any,
            topics: [vec![], vec![], vec![], vec![]],
            from_block: 100,
            to_block: None,
            include_receipts: false,
        });
        let runtime = runtime(vec![log_filter]);
        let b = block(10);
        let events = build_block_events(&runtime, &b, &[log(10, 0, 0)], &[], &[]);
        assert!(events.is_empty());
    }
}
