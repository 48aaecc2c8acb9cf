//! Interval-aware backfill. Phase 1 discovers logs (and factory children,
//! which must land before dependent filters run). Phase 2 assembles the
//! blocks, transactions, receipts and traces those discoveries require.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::trace::geth::{GethTrace, TraceResult};
use alloy::rpc::types::{Filter as WireFilter, Log};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::error::{RpcClientError, SyncError};
use crate::filter::fragment::{self, required_intervals};
use crate::filter::{ChildAddresses, Factory, Filter, LogFilter};
use crate::interval::Interval;
use crate::rpc::RpcClient;
use crate::store::sync::SyncStore;
use crate::types::{
    flatten_call_frames, SyncBlock, SyncLog, SyncReceipt, SyncTrace, SyncTransaction,
};

/// First `eth_getLogs` range guess; adapted per provider feedback.
const INITIAL_LOG_RANGE: u64 = 500;
const MAX_LOG_RANGE: u64 = 10_000;
/// Addresses per `eth_getLogs` call.
const ADDRESS_BATCH: usize = 50;
/// Past this many child addresses, fetch unfiltered and match client-side.
const MAX_ADDRESS_COUNT: usize = 1000;

const BLOCK_CONCURRENCY: usize = 40;
const LOG_RANGE_CONCURRENCY: usize = 10;

pub struct HistoricalSync {
    chain: ChainConfig,
    client: Arc<RpcClient>,
    store: Arc<SyncStore>,
    filters: Arc<Vec<Filter>>,
    children: Arc<RwLock<ChildAddresses>>,
    estimated_range: AtomicU64,
    /// Largest range a provider has confirmed workable; growth cap.
    confirmed_range: AtomicU64,
    /// Set once `eth_getBlockReceipts` fails; per-hash receipts for the rest
    /// of the run.
    per_transaction_receipts: AtomicBool,
    shutdown: CancellationToken,
}

impl HistoricalSync {
    pub fn new(
        chain: ChainConfig,
        client: Arc<RpcClient>,
        store: Arc<SyncStore>,
        filters: Arc<Vec<Filter>>,
        children: Arc<RwLock<ChildAddresses>>,
        shutdown: CancellationToken,
    ) -> Self {
        HistoricalSync {
            chain,
            client,
            store,
            filters,
            children,
            estimated_range: AtomicU64::new(INITIAL_LOG_RANGE),
            confirmed_range: AtomicU64::new(0),
            per_transaction_receipts: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Bring every filter's coverage of `request` up to date. Idempotent:
    /// a rerun with identical inputs fetches nothing and changes nothing.
    pub async fn sync_range(&self, request: Interval) -> Result<(), SyncError> {
        let fragment_ids: Vec<String> = self
            .filters
            .iter()
            .flat_map(|f| fragment::fragments(f))
            .map(|f| f.id)
            .collect();
        let cached = if self.chain.cache {
            self.store.get_intervals(&fragment_ids).await?
        } else {
            HashMap::new()
        };
        let required = required_intervals(request, &cached, &self.filters);
        if required.is_empty() {
            tracing::debug!(
                chain = %self.chain.name,
                range = %request,
                "range already cached"
            );
            return Ok(());
        }

        // Phase 1: factories first, then log discovery.
        let mut resolved_factories: HashSet<(String, Interval)> = HashSet::new();
        let mut discovered_logs: Vec<SyncLog> = Vec::new();

        for (index, intervals) in &required {
            let filter = &self.filters[*index];
            for iv in intervals {
                if self.shutdown.is_cancelled() {
                    return Err(RpcClientError::Shutdown.into());
                }
                if let Some(factory) = filter.factory() {
                    if let Some(live) = factory.range_within(*iv) {
                        if resolved_factories.insert((factory.id.clone(), live)) {
                            self.resolve_factory(factory, live).await?;
                        }
                    }
                }
                if let Filter::Log(log_filter) = filter {
                    if let Some(own) = filter.range_within(*iv) {
                        let logs = self.sync_logs_dynamic(log_filter, own).await?;
                        discovered_logs.extend(logs);
                    }
                }
            }
        }

        dedupe_logs(&mut discovered_logs);
        tracing::info!(
            chain = %self.chain.name,
            range = %request,
            logs = discovered_logs.len(),
            "log discovery complete"
        );

        // Phase 2: per-block assembly of everything the discoveries need.
        let plans = plan_blocks(&self.filters, &required, discovered_logs);
        let mut work = stream::iter(plans.into_iter())
            .map(|(number, plan)| self.process_block(number, plan))
            .buffer_unordered(BLOCK_CONCURRENCY);
        while let Some(result) = work.next().await {
            result?;
        }

        // Non-log fragments become cached only once their blocks landed.
        if self.chain.cache {
            for (index, intervals) in &required {
                let filter = &self.filters[*index];
                if matches!(filter, Filter::Log(_)) {
                    continue;
                }
                for iv in intervals {
                    for frag in fragment::fragments(filter) {
                        self.store.insert_interval(&frag.id, *iv).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a factory's parent logs over `live`, persist the extracted
    /// children, and publish them to the shared in-memory map.
    async fn resolve_factory(&self, factory: &Factory, live: Interval) -> Result<(), SyncError> {
        let wire = WireFilter::new()
            .address(factory.address)
            .event_signature(factory.event_selector);
        let raw = self.fetch_logs_dynamic(&wire, live).await?;

        let mut pairs: Vec<(Address, u64)> = Vec::new();
        for log in &raw {
            let Some(sync_log) = SyncLog::from_rpc(self.chain.chain_id, log) else {
                continue;
            };
            if let Some(child) = factory.extract_child(&sync_log) {
                pairs.push((child, sync_log.block_number));
            }
        }

        self.store.insert_child_addresses(&factory.id, &pairs).await?;
        if self.chain.cache {
            self.store.insert_interval(&factory.id, live).await?;
        }
        {
            let mut children = self.children.write();
            for (address, block) in &pairs {
                children.insert(&factory.id, *address, *block);
            }
        }
        tracing::info!(
            chain = %self.chain.name,
            factory = %factory.id,
            range = %live,
            children = pairs.len(),
            "factory children resolved"
        );
        Ok(())
    }

    /// Fetch and persist a log filter's rows over `own`, adapting the
    /// request shape to the address set and the provider's range limits.
    async fn sync_logs_dynamic(
        &self,
        filter: &LogFilter,
        own: Interval,
    ) -> Result<Vec<SyncLog>, SyncError> {
        let mut wire_filters: Vec<WireFilter> = Vec::new();
        let base = log_wire_filter(filter);

        match &filter.address {
            crate::filter::AddressSpec::Any => wire_filters.push(base),
            crate::filter::AddressSpec::Concrete(addresses) => {
                for batch in addresses.chunks(ADDRESS_BATCH) {
                    wire_filters.push(base.clone().address(batch.to_vec()));
                }
            }
            crate::filter::AddressSpec::Factory(factory) => {
                let targets = self
                    .children
                    .read()
                    .targets(&factory.id, filter.from_block, own.hi);
                if targets.is_empty() {
                    // no children yet: nothing can match, but the range is
                    // still complete and falls through to be cached
                } else if targets.len() > MAX_ADDRESS_COUNT {
                    tracing::debug!(
                        chain = %self.chain.name,
                        children = targets.len(),
                        "child set too large for address filter, matching client-side"
                    );
                    wire_filters.push(base);
                } else {
                    for batch in targets.chunks(ADDRESS_BATCH) {
                        wire_filters.push(base.clone().address(batch.to_vec()));
                    }
                }
            }
        }

        let mut matched: Vec<SyncLog> = Vec::new();
        let children = &self.children;
        for wire in &wire_filters {
            let raw = self.fetch_logs_dynamic(wire, own).await?;
            for log in &raw {
                let Some(sync_log) = SyncLog::from_rpc(self.chain.chain_id, log) else {
                    continue;
                };
                // wire filters over-approximate; the filter engine decides
                if filter.matches(&sync_log, &children.read()) {
                    matched.push(sync_log);
                }
            }
        }

        let fragment_ids: Vec<String> = fragment::fragments(&Filter::Log(filter.clone()))
            .into_iter()
            .map(|f| f.id)
            .collect();
        if self.chain.cache {
            self.store
                .insert_logs_with_interval(&matched, &fragment_ids, own)
                .await?;
        } else {
            self.store.insert_logs(&matched).await?;
        }

        // phase 2 only needs coordinates
        Ok(matched.into_iter().map(SyncLog::strip_data).collect())
    }

    /// Chunked fetch over `iv` with the current estimated range; chunks run
    /// concurrently and shrink recursively on provider range complaints.
    async fn fetch_logs_dynamic(
        &self,
        wire: &WireFilter,
        iv: Interval,
    ) -> Result<Vec<Log>, SyncError> {
        let chunk_size = self.estimated_range.load(Ordering::Relaxed).max(1);
        let mut work = stream::iter(iv.chunks(chunk_size))
            .map(|chunk| self.fetch_chunk(wire.clone(), chunk))
            .buffer_unordered(LOG_RANGE_CONCURRENCY);
        let mut out = Vec::new();
        while let Some(result) = work.next().await {
            out.extend(result?);
        }
        Ok(out)
    }

    fn fetch_chunk(
        &self,
        wire: WireFilter,
        chunk: Interval,
    ) -> BoxFuture<'_, Result<Vec<Log>, SyncError>> {
        async move {
            match self.client.get_logs(&wire, chunk).await {
                Ok(logs) => {
                    let cap = match self.confirmed_range.load(Ordering::Relaxed) {
                        0 => MAX_LOG_RANGE,
                        confirmed => confirmed,
                    };
                    let estimate = self.estimated_range.load(Ordering::Relaxed);
                    let grown = ((estimate as f64 * 1.05) as u64)
                        .max(estimate + 1)
                        .min(cap);
                    self.estimated_range.store(grown, Ordering::Relaxed);
                    Ok(logs)
                }
                Err(RpcClientError::LogRange { suggested }) => {
                    let confirmed = suggested.iter().map(Interval::len).max().unwrap_or(1);
                    self.confirmed_range.store(confirmed, Ordering::Relaxed);
                    self.estimated_range
                        .fetch_min(confirmed, Ordering::Relaxed);
                    tracing::debug!(
                        chain = %self.chain.name,
                        chunk = %chunk,
                        confirmed_range = confirmed,
                        "shrinking log range"
                    );
                    let mut out = Vec::new();
                    for sub in suggested {
                        out.extend(self.fetch_chunk(wire.clone(), sub).await?);
                    }
                    Ok(out)
                }
                Err(e) => Err(e.into()),
            }
        }
        .boxed()
    }

    /// Fetch, validate, and persist one block's artifacts as a unit.
    async fn process_block(&self, number: u64, plan: BlockPlan) -> Result<(), SyncError> {
        let chain_id = self.chain.chain_id;
        let need_transactions = plan.scan_transactions || !plan.logs.is_empty();
        let rpc_block = self
            .client
            .get_block_by_number(number, need_transactions)
            .await?
            .ok_or_else(|| SyncError::Validation(format!("block {number} disappeared")))?;
        let block = SyncBlock::from_rpc(chain_id, &rpc_block);

        for log in &plan.logs {
            if log.block_hash != block.hash {
                return Err(SyncError::Validation(format!(
                    "log {}#{} references block hash {} but block {} has {}",
                    log.block_number, log.log_index, log.block_hash, number, block.hash
                )));
            }
        }

        let block_transactions: Vec<SyncTransaction> = rpc_block
            .transactions
            .txns()
            .map(|tx| SyncTransaction::from_rpc(chain_id, &block, tx))
            .collect();
        let tx_index_by_hash: HashMap<B256, u64> = block_transactions
            .iter()
            .map(|tx| (tx.hash, tx.transaction_index))
            .collect();

        // Traces, when any trace/transfer filter wants this block.
        let mut matched_traces: Vec<SyncTrace> = Vec::new();
        if plan.needs_traces {
            let results = self.client.trace_block(number).await?;
            let children = self.children.read();
            for result in &results {
                let TraceResult::Success { result: trace, tx_hash } = result else {
                    continue;
                };
                let Some(tx_hash) = tx_hash else { continue };
                let Some(&tx_index) = tx_index_by_hash.get(tx_hash) else {
                    return Err(SyncError::Validation(format!(
                        "trace for {tx_hash} not in block {number}"
                    )));
                };
                let GethTrace::CallTracer(frame) = trace else {
                    return Err(SyncError::Validation(
                        "unexpected tracer output shape".to_string(),
                    ));
                };
                let flattened =
                    flatten_call_frames(chain_id, &block, *tx_hash, tx_index, frame);
                for trace in flattened {
                    let wanted = self.filters.iter().any(|f| match f {
                        Filter::Trace(tf) => tf.matches(&trace, &children),
                        Filter::Transfer(tf) => tf.matches(&trace, &children),
                        _ => false,
                    });
                    if wanted {
                        matched_traces.push(trace);
                    }
                }
            }
        }

        // Which transactions must be persisted in full.
        let mut required_tx_hashes: HashSet<B256> = HashSet::new();
        for log in &plan.logs {
            if log.transaction_hash == B256::ZERO {
                // some chains emit system logs outside any transaction
                tracing::debug!(
                    chain = %self.chain.name,
                    block = number,
                    log_index = log.log_index,
                    "log carries zero transaction hash, skipping transaction fetch"
                );
                continue;
            }
            required_tx_hashes.insert(log.transaction_hash);
        }
        for trace in &matched_traces {
            required_tx_hashes.insert(trace.transaction_hash);
        }
        let mut receipts_wanted: HashSet<B256> = HashSet::new();
        {
            let children = self.children.read();
            for tx in &block_transactions {
                for filter in self.filters.iter() {
                    if let Filter::Transaction(tf) = filter {
                        if tf.matches(tx, &children) {
                            required_tx_hashes.insert(tx.hash);
                            if tf.include_receipts {
                                receipts_wanted.insert(tx.hash);
                            }
                        }
                    }
                }
            }
        }
        if self.filters.iter().any(|f| f.include_receipts()) {
            // receipts only for transactions some filter asked about
            for hash in &required_tx_hashes {
                receipts_wanted.insert(*hash);
            }
        }

        let transactions: Vec<SyncTransaction> = block_transactions
            .into_iter()
            .filter(|tx| required_tx_hashes.contains(&tx.hash))
            .collect();

        let receipts = if receipts_wanted.is_empty() {
            Vec::new()
        } else {
            self.fetch_receipts(number, &block, &receipts_wanted).await?
        };

        let logs: Vec<SyncLog> = plan
            .logs
            .into_iter()
            .map(|mut log| {
                log.block_timestamp = Some(block.timestamp);
                log
            })
            .collect();

        // one transaction: a crash cannot leave this block half-mirrored
        self.store
            .insert_block_unit(&block, &transactions, &receipts, &matched_traces, &logs)
            .await?;

        tracing::debug!(
            chain = %self.chain.name,
            block = number,
            logs = logs.len(),
            transactions = transactions.len(),
            traces = matched_traces.len(),
            receipts = receipts.len(),
            "block assembled"
        );
        Ok(())
    }

    /// Receipts via `eth_getBlockReceipts`, falling back permanently to
    /// per-hash fetches the first time the provider rejects it. Every
    /// required hash must yield a receipt.
    async fn fetch_receipts(
        &self,
        number: u64,
        block: &SyncBlock,
        wanted: &HashSet<B256>,
    ) -> Result<Vec<SyncReceipt>, SyncError> {
        if !self.per_transaction_receipts.load(Ordering::Relaxed) {
            match self.client.get_block_receipts(number).await {
                Ok(Some(all)) => {
                    let receipts: Vec<SyncReceipt> = all
                        .iter()
                        .filter(|r| wanted.contains(&r.transaction_hash))
                        .map(|r| SyncReceipt::from_rpc(self.chain.chain_id, r))
                        .collect();
                    return validate_receipts(block, wanted, receipts);
                }
                Ok(None) => {
                    self.per_transaction_receipts.store(true, Ordering::Relaxed);
                    tracing::warn!(
                        chain = %self.chain.name,
                        block = number,
                        "eth_getBlockReceipts returned nothing, switching to per-transaction receipts"
                    );
                }
                Err(e) => {
                    self.per_transaction_receipts.store(true, Ordering::Relaxed);
                    tracing::warn!(
                        chain = %self.chain.name,
                        block = number,
                        error = %e,
                        "eth_getBlockReceipts failed, switching to per-transaction receipts"
                    );
                }
            }
        }

        let mut receipts = Vec::with_capacity(wanted.len());
        for hash in wanted {
            let receipt = self
                .client
                .get_transaction_receipt(*hash)
                .await?
                .ok_or_else(|| {
                    SyncError::Validation(format!("missing receipt for transaction {hash}"))
                })?;
            receipts.push(SyncReceipt::from_rpc(self.chain.chain_id, &receipt));
        }
        validate_receipts(block, wanted, receipts)
    }
}

fn validate_receipts(
    block: &SyncBlock,
    wanted: &HashSet<B256>,
    receipts: Vec<SyncReceipt>,
) -> Result<Vec<SyncReceipt>, SyncError> {
    for receipt in &receipts {
        if receipt.block_hash != block.hash {
            return Err(SyncError::Validation(format!(
                "receipt {} references block {} but expected {}",
                receipt.transaction_hash, receipt.block_hash, block.hash
            )));
        }
    }
    let seen: HashSet<B256> = receipts.iter().map(|r| r.transaction_hash).collect();
    if let Some(missing) = wanted.iter().find(|h| !seen.contains(*h)) {
        return Err(SyncError::Validation(format!(
            "no receipt returned for required transaction {missing}"
        )));
    }
    Ok(receipts)
}

fn log_wire_filter(filter: &LogFilter) -> WireFilter {
    // unset topic slots are omitted entirely; strict providers reject
    // trailing nulls
    let mut wire = WireFilter::new();
    if !filter.topics[0].is_empty() {
        wire = wire.event_signature(filter.topics[0].clone());
    }
    if !filter.topics[1].is_empty() {
        wire = wire.topic1(filter.topics[1].clone());
    }
    if !filter.topics[2].is_empty() {
        wire = wire.topic2(filter.topics[2].clone());
    }
    if !filter.topics[3].is_empty() {
        wire = wire.topic3(filter.topics[3].clone());
    }
    wire
}

fn dedupe_logs(logs: &mut Vec<SyncLog>) {
    let mut seen: HashSet<(B256, u64)> = HashSet::new();
    logs.retain(|log| seen.insert((log.block_hash, log.log_index)));
}

/// What phase 2 must do for one block.
#[derive(Debug, Default)]
pub(crate) struct BlockPlan {
    pub logs: Vec<SyncLog>,
    pub needs_traces: bool,
    pub scan_transactions: bool,
}

/// Group phase-1 discoveries and filter demands into per-block work. A
/// block is needed when a log landed in it, a block filter selects it, or a
/// transaction/trace/transfer filter must scan it.
pub(crate) fn plan_blocks(
    filters: &[Filter],
    required: &[(usize, Vec<Interval>)],
    logs: Vec<SyncLog>,
) -> BTreeMap<u64, BlockPlan> {
    let mut plans: BTreeMap<u64, BlockPlan> = BTreeMap::new();

    for log in logs {
        plans.entry(log.block_number).or_default().logs.push(log);
    }

    for (index, intervals) in required {
        let filter = &filters[*index];
        match filter {
            Filter::Block(block_filter) => {
                for iv in intervals {
                    // first multiple of `interval` at/after iv.lo (plus offset)
                    let mut n = if iv.lo <= block_filter.offset {
                        block_filter.offset
                    } else {
                        let span = iv.lo - block_filter.offset;
                        block_filter.offset + span.div_ceil(block_filter.interval) * block_filter.interval
                    };
                    while n <= iv.hi {
                        if block_filter.matches(n) {
                            plans.entry(n).or_default();
                        }
                        n += block_filter.interval;
                    }
                }
            }
            Filter::Transaction(_) | Filter::Trace(_) | Filter::Transfer(_) => {
                for iv in intervals {
                    for n in iv.lo..=iv.hi {
                        let plan = plans.entry(n).or_default();
                        plan.scan_transactions = true;
                        plan.needs_traces |= filter.needs_traces();
                    }
                }
            }
            Filter::Log(_) => {}
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AddressSpec, BlockFilter, TransferFilter};
    use alloy::primitives::Bytes;

    fn sync_log(block_number: u64, log_index: u64) -> SyncLog {
        SyncLog {
            chain_id: 1,
            block_hash: B256::repeat_byte(block_number as u8),
            block_number,
            block_timestamp: None,
            log_index,
            transaction_hash: B256::repeat_byte(0x77),
            transaction_index: 0,
            address: Address::repeat_byte(1),
            topics: vec![],
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_plan_groups_logs_by_block() {
        let plans = plan_blocks(
            &[],
            &[],
            vec![sync_log(5, 0), sync_log(5, 1), sync_log(9, 0)],
        );
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[&5].logs.len(), 2);
        assert_eq!(plans[&9].logs.len(), 1);
        assert!(!plans[&5].scan_transactions);
    }

    #[test]
    fn test_plan_block_filter_selects_modulo_blocks() {
        let filters = vec![Filter::Block(BlockFilter {
            id: "b".into(),
            chain_id: 1,
            interval: 10,
            offset: 3,
            from_block: 0,
            to_block: None,
        })];
        let required = vec![(0usize, vec![Interval::new(0, 40)])];
        let plans = plan_blocks(&filters, &required, vec![]);
        let blocks: Vec<u64> = plans.keys().copied().collect();
        assert_eq!(blocks, vec![3, 13, 23, 33]);
    }

    #[test]
    fn test_plan_transfer_filter_scans_every_block() {
        let filters = vec![Filter::Transfer(TransferFilter {
            id: "t".into(),
            chain_id: 1,
            from_address: AddressSpec::Any,
            to_address: AddressSpec::Any,
            min_value: None,
            from_block: 0,
            to_block: None,
            include_receipts: false,
        })];
        let required = vec![(0usize, vec![Interval::new(10, 13)])];
        let plans = plan_blocks(&filters, &required, vec![]);
        assert_eq!(plans.len(), 4);
        assert!(plans.values().all(|p| p.scan_transactions && p.needs_traces));
    }

    #[test]
    fn test_dedupe_logs_by_block_hash_and_index() {
        let mut logs = vec![sync_log(5, 0), sync_log(5, 0), sync_log(5, 1)];
        dedupe_logs(&mut logs);
        assert_eq!(logs.len(), 2);
    }
}
