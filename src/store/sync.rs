//! Persistence of raw chain data and cached-interval bookkeeping.
//!
//! All writes are idempotent upserts on natural keys, chunked to the
//! engine's bind-parameter budget. Interval bookkeeping is merged in the
//! same transaction as the rows it describes.

use std::collections::HashMap;

use alloy::primitives::{Address, Bloom, Bytes, B256};
use sqlx::{AnyPool, Row};

use crate::checkpoint::Checkpoint;
use crate::error::StoreError;
use crate::filter::{ChildAddresses, Filter};
use crate::interval::{self, Interval};
use crate::store::dialect::{
    decode_address, decode_b256, decode_trace_address, decode_u256, encode_address,
    encode_b256, encode_trace_address, encode_u256, Dialect,
};
use crate::store::with_db_retry;
use crate::types::{SyncBlock, SyncLog, SyncReceipt, SyncTrace, SyncTransaction};

/// Cap on rows per multi-row INSERT, further limited by the engine's bind
/// budget.
const MAX_ROWS_PER_INSERT: usize = 1000;

const BLOCK_COLUMNS: usize = 12;
const TRANSACTION_COLUMNS: usize = 13;
const RECEIPT_COLUMNS: usize = 10;
const LOG_COLUMNS: usize = 14;
const TRACE_COLUMNS: usize = 17;

/// One persisted per-chain checkpoint row.
#[derive(Debug, Clone)]
pub struct ChainCheckpointRow {
    pub chain_id: u64,
    pub chain_name: String,
    pub latest: Checkpoint,
    pub safe: Checkpoint,
    pub finalized: Checkpoint,
}

/// An event row read back in checkpoint order, tagged with the filter that
/// matched it.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub filter_index: usize,
    pub checkpoint: Checkpoint,
    pub payload: EventPayload,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Block(SyncBlock),
    Transaction(SyncTransaction),
    Log(SyncLog),
    Trace(SyncTrace),
    Transfer(SyncTrace),
}

pub struct SyncStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SyncStore {
    pub fn new(pool: AnyPool, dialect: Dialect) -> Self {
        SyncStore { pool, dialect }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Create the sync-side schema. Idempotent; shared verbatim by both
    /// engines apart from the byte-column type.
    pub async fn create_schema(&self) -> Result<(), StoreError> {
        let b = self.dialect.bytes_type();
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS blocks (
                    chain_id BIGINT NOT NULL,
                    number BIGINT NOT NULL,
                    hash {b} NOT NULL,
                    parent_hash {b} NOT NULL,
                    timestamp BIGINT NOT NULL,
                    miner {b} NOT NULL,
                    gas_used BIGINT NOT NULL,
                    gas_limit BIGINT NOT NULL,
                    base_fee_per_gas BIGINT,
                    logs_bloom {b} NOT NULL,
                    transaction_count BIGINT NOT NULL,
                    checkpoint TEXT NOT NULL,
                    PRIMARY KEY (chain_id, hash)
                )"
            ),
            "CREATE INDEX IF NOT EXISTS blocks_chain_number ON blocks (chain_id, number)"
                .to_string(),
            "CREATE INDEX IF NOT EXISTS blocks_chain_checkpoint ON blocks (chain_id, checkpoint)"
                .to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS transactions (
                    chain_id BIGINT NOT NULL,
                    hash {b} NOT NULL,
                    block_hash {b} NOT NULL,
                    block_number BIGINT NOT NULL,
                    block_timestamp BIGINT NOT NULL,
                    transaction_index BIGINT NOT NULL,
                    from_address {b} NOT NULL,
                    to_address {b},
                    value TEXT NOT NULL,
                    input {b} NOT NULL,
                    gas_limit BIGINT NOT NULL,
                    nonce BIGINT NOT NULL,
                    checkpoint TEXT NOT NULL,
                    PRIMARY KEY (chain_id, hash)
                )"
            ),
            "CREATE INDEX IF NOT EXISTS transactions_chain_checkpoint
             ON transactions (chain_id, checkpoint)"
                .to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS receipts (
                    chain_id BIGINT NOT NULL,
                    transaction_hash {b} NOT NULL,
                    block_hash {b} NOT NULL,
                    block_number BIGINT NOT NULL,
                    transaction_index BIGINT NOT NULL,
                    status BIGINT NOT NULL,
                    gas_used BIGINT NOT NULL,
                    contract_address {b},
                    from_address {b} NOT NULL,
                    to_address {b},
                    PRIMARY KEY (chain_id, transaction_hash)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS logs (
                    chain_id BIGINT NOT NULL,
                    block_hash {b} NOT NULL,
                    log_index BIGINT NOT NULL,
                    block_number BIGINT NOT NULL,
                    block_timestamp BIGINT,
                    transaction_hash {b} NOT NULL,
                    transaction_index BIGINT NOT NULL,
                    address {b} NOT NULL,
                    topic0 {b},
                    topic1 {b},
                    topic2 {b},
                    topic3 {b},
                    data {b} NOT NULL,
                    checkpoint TEXT,
                    PRIMARY KEY (chain_id, block_hash, log_index)
                )"
            ),
            "CREATE INDEX IF NOT EXISTS logs_chain_checkpoint ON logs (chain_id, checkpoint)"
                .to_string(),
            "CREATE INDEX IF NOT EXISTS logs_chain_number ON logs (chain_id, block_number)"
                .to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS traces (
                    chain_id BIGINT NOT NULL,
                    transaction_hash {b} NOT NULL,
                    trace_address TEXT NOT NULL,
                    block_hash {b} NOT NULL,
                    block_number BIGINT NOT NULL,
                    block_timestamp BIGINT NOT NULL,
                    transaction_index BIGINT NOT NULL,
                    trace_index BIGINT NOT NULL,
                    kind TEXT NOT NULL,
                    from_address {b} NOT NULL,
                    to_address {b},
                    value TEXT NOT NULL,
                    input {b} NOT NULL,
                    output {b},
                    gas_used BIGINT NOT NULL,
                    error TEXT,
                    checkpoint TEXT NOT NULL,
                    PRIMARY KEY (chain_id, transaction_hash, trace_address)
                )"
            ),
            "CREATE INDEX IF NOT EXISTS traces_chain_checkpoint ON traces (chain_id, checkpoint)"
                .to_string(),
            "CREATE TABLE IF NOT EXISTS intervals (
                fragment_id TEXT NOT NULL,
                lo BIGINT NOT NULL,
                hi BIGINT NOT NULL,
                PRIMARY KEY (fragment_id, lo)
            )"
            .to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS child_addresses (
                    factory_id TEXT NOT NULL,
                    address {b} NOT NULL,
                    first_seen_block BIGINT NOT NULL,
                    PRIMARY KEY (factory_id, address)
                )"
            ),
            "CREATE TABLE IF NOT EXISTS _chainmirror_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"
            .to_string(),
            "CREATE TABLE IF NOT EXISTS _chainmirror_checkpoint (
                chain_id BIGINT PRIMARY KEY,
                chain_name TEXT NOT NULL,
                latest TEXT NOT NULL,
                safe TEXT NOT NULL,
                finalized TEXT NOT NULL
            )"
            .to_string(),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn rows_per_chunk(&self, columns: usize) -> usize {
        MAX_ROWS_PER_INSERT.min(self.dialect.max_bind_params() / columns)
    }

    pub async fn insert_blocks(&self, blocks: &[SyncBlock]) -> Result<(), StoreError> {
        for chunk in blocks.chunks(self.rows_per_chunk(BLOCK_COLUMNS)) {
            with_db_retry(|| async {
                execute_block_chunk(&self.pool, self.dialect, chunk).await
            })
            .await?;
        }
        Ok(())
    }

    pub async fn insert_transactions(
        &self,
        transactions: &[SyncTransaction],
    ) -> Result<(), StoreError> {
        for chunk in transactions.chunks(self.rows_per_chunk(TRANSACTION_COLUMNS)) {
            with_db_retry(|| async {
                execute_transaction_chunk(&self.pool, self.dialect, chunk).await
            })
            .await?;
        }
        Ok(())
    }

    pub async fn insert_receipts(&self, receipts: &[SyncReceipt]) -> Result<(), StoreError> {
        for chunk in receipts.chunks(self.rows_per_chunk(RECEIPT_COLUMNS)) {
            with_db_retry(|| async {
                execute_receipt_chunk(&self.pool, self.dialect, chunk).await
            })
            .await?;
        }
        Ok(())
    }

    /// Persist one assembled block and everything discovered in it as a
    /// single transaction: a crash can never leave the block partially
    /// mirrored. The logs were inserted during discovery and get their
    /// timestamps and checkpoints confirmed here.
    pub async fn insert_block_unit(
        &self,
        block: &SyncBlock,
        transactions: &[SyncTransaction],
        receipts: &[SyncReceipt],
        traces: &[SyncTrace],
        logs: &[SyncLog],
    ) -> Result<(), StoreError> {
        debug_assert!(logs.iter().all(|l| l.block_timestamp.is_some()));
        with_db_retry(|| async {
            let mut tx = self.pool.begin().await?;
            execute_block_chunk(&mut *tx, self.dialect, std::slice::from_ref(block)).await?;
            for chunk in transactions.chunks(self.rows_per_chunk(TRANSACTION_COLUMNS)) {
                execute_transaction_chunk(&mut *tx, self.dialect, chunk).await?;
            }
            for chunk in receipts.chunks(self.rows_per_chunk(RECEIPT_COLUMNS)) {
                execute_receipt_chunk(&mut *tx, self.dialect, chunk).await?;
            }
            for chunk in traces.chunks(self.rows_per_chunk(TRACE_COLUMNS)) {
                execute_trace_chunk(&mut *tx, self.dialect, chunk).await?;
            }
            for chunk in logs.chunks(self.rows_per_chunk(LOG_COLUMNS)) {
                execute_log_chunk(&mut *tx, self.dialect, chunk, true).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Insert logs. Rows whose block timestamp is already known get their
    /// checkpoint immediately; the rest stay invisible to event reads until
    /// [`SyncStore::insert_block_unit`] confirms their block.
    pub async fn insert_logs(&self, logs: &[SyncLog]) -> Result<(), StoreError> {
        for chunk in logs.chunks(self.rows_per_chunk(LOG_COLUMNS)) {
            with_db_retry(|| async {
                execute_log_chunk(&self.pool, self.dialect, chunk, false).await
            })
            .await?;
        }
        Ok(())
    }

    /// Insert logs and merge the covering interval into each fragment's
    /// cached set, atomically: the cache may never claim rows that were not
    /// committed.
    pub async fn insert_logs_with_interval(
        &self,
        logs: &[SyncLog],
        fragment_ids: &[String],
        iv: Interval,
    ) -> Result<(), StoreError> {
        with_db_retry(|| async {
            let mut tx = self.pool.begin().await?;
            for chunk in logs.chunks(self.rows_per_chunk(LOG_COLUMNS)) {
                execute_log_chunk(&mut *tx, self.dialect, chunk, false).await?;
            }
            for fragment_id in fragment_ids {
                merge_interval_in_tx(&mut tx, self.dialect, fragment_id, iv).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn insert_traces(&self, traces: &[SyncTrace]) -> Result<(), StoreError> {
        for chunk in traces.chunks(self.rows_per_chunk(TRACE_COLUMNS)) {
            with_db_retry(|| async {
                execute_trace_chunk(&self.pool, self.dialect, chunk).await
            })
            .await?;
        }
        Ok(())
    }

    /// Record discovered children. Re-discovery at an earlier block lowers
    /// `first_seen_block`, never raises it.
    pub async fn insert_child_addresses(
        &self,
        factory_id: &str,
        entries: &[(Address, u64)],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let least = self.dialect.least_fn();
        for chunk in entries.chunks(self.rows_per_chunk(3)) {
            with_db_retry(|| async {
                let mut sql = String::from(
                    "INSERT INTO child_addresses (factory_id, address, first_seen_block) VALUES ",
                );
                push_tuples(&mut sql, self.dialect, chunk.len(), 3);
                sql.push_str(&format!(
                    " ON CONFLICT (factory_id, address) DO UPDATE SET first_seen_block = \
                     {least}(child_addresses.first_seen_block, excluded.first_seen_block)"
                ));

                let mut query = sqlx::query(&sql);
                for (address, block) in chunk {
                    query = query
                        .bind(factory_id)
                        .bind(encode_address(*address))
                        .bind(*block as i64);
                }
                query.execute(&self.pool).await?;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    pub async fn get_child_addresses(
        &self,
        factory_id: &str,
    ) -> Result<Vec<(Address, u64)>, StoreError> {
        let sql = format!(
            "SELECT address, first_seen_block FROM child_addresses WHERE factory_id = {}",
            self.dialect.placeholder(1)
        );
        let rows = sqlx::query(&sql)
            .bind(factory_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let address = decode_address(&row.try_get::<Vec<u8>, _>("address")?)?;
                let block = row.try_get::<i64, _>("first_seen_block")? as u64;
                Ok((address, block))
            })
            .collect()
    }

    /// Merge one interval into a fragment's cached set, keeping the stored
    /// rows in union-normal form.
    pub async fn insert_interval(
        &self,
        fragment_id: &str,
        iv: Interval,
    ) -> Result<(), StoreError> {
        with_db_retry(|| async {
            let mut tx = self.pool.begin().await?;
            merge_interval_in_tx(&mut tx, self.dialect, fragment_id, iv).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn get_intervals(
        &self,
        fragment_ids: &[String],
    ) -> Result<HashMap<String, Vec<Interval>>, StoreError> {
        let mut out: HashMap<String, Vec<Interval>> = HashMap::new();
        if fragment_ids.is_empty() {
            return Ok(out);
        }
        let sql = format!(
            "SELECT fragment_id, lo, hi FROM intervals WHERE fragment_id IN ({}) \
             ORDER BY fragment_id, lo",
            self.dialect.placeholder_list(1, fragment_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in fragment_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        for row in rows {
            let id: String = row.try_get("fragment_id")?;
            let lo = row.try_get::<i64, _>("lo")? as u64;
            let hi = row.try_get::<i64, _>("hi")? as u64;
            out.entry(id).or_default().push(Interval::new(lo, hi));
        }
        Ok(out)
    }

    /// Drop unfinalized raw data at and above `from_block` after a shallow
    /// reorg discarded those blocks.
    pub async fn prune_from_block(
        &self,
        chain_id: u64,
        from_block: u64,
    ) -> Result<(), StoreError> {
        with_db_retry(|| async {
            let mut tx = self.pool.begin().await?;
            for table in ["blocks", "transactions", "receipts", "logs", "traces"] {
                let sql = format!(
                    "DELETE FROM {table} WHERE chain_id = {} AND block_number >= {}",
                    self.dialect.placeholder(1),
                    self.dialect.placeholder(2)
                );
                sqlx::query(&sql)
                    .bind(chain_id as i64)
                    .bind(from_block as i64)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn get_checkpoints(&self) -> Result<Vec<ChainCheckpointRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT chain_id, chain_name, latest, safe, finalized FROM _chainmirror_checkpoint",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_checkpoint_row).collect()
    }

    pub async fn upsert_checkpoint(&self, row: &ChainCheckpointRow) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO _chainmirror_checkpoint (chain_id, chain_name, latest, safe, finalized) \
             VALUES {} ON CONFLICT (chain_id) DO UPDATE SET \
             chain_name = excluded.chain_name, latest = excluded.latest, \
             safe = excluded.safe, finalized = excluded.finalized",
            self.dialect.values_tuple(1, 5)
        );
        sqlx::query(&sql)
            .bind(row.chain_id as i64)
            .bind(row.chain_name.as_str())
            .bind(row.latest.encode())
            .bind(row.safe.encode())
            .bind(row.finalized.encode())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Advance a chain's latest/safe watermarks inside the caller's
    /// transaction, so checkpoint movement commits atomically with the
    /// events it covers.
    pub async fn advance_checkpoint(
        conn: &mut sqlx::AnyConnection,
        dialect: Dialect,
        chain_id: u64,
        latest: &Checkpoint,
        safe: &Checkpoint,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE _chainmirror_checkpoint SET latest = {}, safe = {} WHERE chain_id = {}",
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3)
        );
        sqlx::query(&sql)
            .bind(latest.encode())
            .bind(safe.encode())
            .bind(chain_id as i64)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn set_finalized(
        &self,
        chain_id: u64,
        finalized: &Checkpoint,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE _chainmirror_checkpoint SET finalized = {} WHERE chain_id = {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        sqlx::query(&sql)
            .bind(finalized.encode())
            .bind(chain_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let sql = format!(
            "SELECT value FROM _chainmirror_meta WHERE key = {}",
            self.dialect.placeholder(1)
        );
        let row = sqlx::query(&sql).bind(key).fetch_optional(&self.pool).await?;
        row.map(|row| {
            let text: String = row.try_get("value")?;
            serde_json::from_str(&text)
                .map_err(|e| StoreError::Decode(format!("bad meta json for '{key}': {e}")))
        })
        .transpose()
    }

    pub async fn set_meta(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO _chainmirror_meta (key, value) VALUES {} \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            self.dialect.values_tuple(1, 2)
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read events for one chain in `(from, to]` checkpoint order, matched
    /// against `filters` and capped at `limit` (extended to keep events
    /// that tie on the final checkpoint together).
    ///
    /// The second return value is the cursor the caller must resume from:
    /// `None` when the whole `(from, to]` window was covered, otherwise the
    /// last checkpoint whose events are guaranteed complete. Any raw table
    /// page hitting `limit` bounds the window, whether or not its rows
    /// matched a filter.
    pub async fn get_events(
        &self,
        chain_id: u64,
        filters: &[Filter],
        children: &ChildAddresses,
        from: &Checkpoint,
        to: &Checkpoint,
        limit: usize,
    ) -> Result<(Vec<StoredEvent>, Option<Checkpoint>), StoreError> {
        let mut events: Vec<StoredEvent> = Vec::new();
        let mut scan_bound: Option<Checkpoint> = None;
        let mut bound_by = |last: Option<Checkpoint>, truncated: bool| {
            if truncated {
                if let Some(last) = last {
                    scan_bound = Some(scan_bound.map_or(last, |b| b.min(last)));
                }
            }
        };

        let needs_logs = filters.iter().any(|f| matches!(f, Filter::Log(_)));
        let needs_blocks = filters.iter().any(|f| matches!(f, Filter::Block(_)));
        let needs_transactions = filters.iter().any(|f| matches!(f, Filter::Transaction(_)));
        let needs_traces = filters.iter().any(|f| f.needs_traces());

        if needs_logs {
            let logs = self.read_logs(chain_id, from, to, limit).await?;
            let last = logs
                .last()
                .and_then(|l| l.block_timestamp.map(|ts| l.checkpoint(ts)));
            bound_by(last, logs.len() >= limit);
            for log in &logs {
                let Some(ts) = log.block_timestamp else { continue };
                for (index, filter) in filters.iter().enumerate() {
                    if let Filter::Log(f) = filter {
                        if f.matches(log, children) {
                            events.push(StoredEvent {
                                filter_index: index,
                                checkpoint: log.checkpoint(ts),
                                payload: EventPayload::Log(log.clone()),
                            });
                        }
                    }
                }
            }
        }
        if needs_blocks {
            let blocks = self.read_blocks(chain_id, from, to, limit).await?;
            bound_by(blocks.last().map(SyncBlock::checkpoint), blocks.len() >= limit);
            for block in &blocks {
                for (index, filter) in filters.iter().enumerate() {
                    if let Filter::Block(f) = filter {
                        if f.matches(block.number) {
                            events.push(StoredEvent {
                                filter_index: index,
                                checkpoint: block.checkpoint(),
                                payload: EventPayload::Block(block.clone()),
                            });
                        }
                    }
                }
            }
        }
        if needs_transactions {
            let transactions = self.read_transactions(chain_id, from, to, limit).await?;
            bound_by(
                transactions.last().map(SyncTransaction::checkpoint),
                transactions.len() >= limit,
            );
            for tx in &transactions {
                for (index, filter) in filters.iter().enumerate() {
                    if let Filter::Transaction(f) = filter {
                        if f.matches(tx, children) {
                            events.push(StoredEvent {
                                filter_index: index,
                                checkpoint: tx.checkpoint(),
                                payload: EventPayload::Transaction(tx.clone()),
                            });
                        }
                    }
                }
            }
        }
        if needs_traces {
            let traces = self.read_traces(chain_id, from, to, limit).await?;
            bound_by(traces.last().map(SyncTrace::checkpoint), traces.len() >= limit);
            for trace in &traces {
                for (index, filter) in filters.iter().enumerate() {
                    match filter {
                        Filter::Trace(f) if f.matches(trace, children) => {
                            events.push(StoredEvent {
                                filter_index: index,
                                checkpoint: trace.checkpoint(),
                                payload: EventPayload::Trace(trace.clone()),
                            });
                        }
                        Filter::Transfer(f) if f.matches(trace, children) => {
                            events.push(StoredEvent {
                                filter_index: index,
                                checkpoint: trace.transfer_checkpoint(),
                                payload: EventPayload::Transfer(trace.clone()),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Some(bound) = scan_bound {
            events.retain(|e| e.checkpoint <= bound);
        }
        events.sort_by(|a, b| {
            a.checkpoint
                .cmp(&b.checkpoint)
                .then(a.filter_index.cmp(&b.filter_index))
        });

        let mut resume = scan_bound;
        if events.len() > limit {
            // keep checkpoint tie groups intact so cursor resumption cannot
            // split events sharing a position
            let boundary = events[limit - 1].checkpoint;
            let end = events[limit..]
                .iter()
                .position(|e| e.checkpoint != boundary)
                .map_or(events.len(), |offset| limit + offset);
            events.truncate(end);
            resume = Some(boundary);
        }
        Ok((events, resume))
    }

    async fn read_blocks(
        &self,
        chain_id: u64,
        from: &Checkpoint,
        to: &Checkpoint,
        limit: usize,
    ) -> Result<Vec<SyncBlock>, StoreError> {
        let rows = self.read_event_rows("blocks", "*", chain_id, from, to, limit).await?;
        rows.iter()
            .map(|row| {
                Ok(SyncBlock {
                    chain_id,
                    number: row.try_get::<i64, _>("number")? as u64,
                    hash: decode_b256(&row.try_get::<Vec<u8>, _>("hash")?)?,
                    parent_hash: decode_b256(&row.try_get::<Vec<u8>, _>("parent_hash")?)?,
                    timestamp: row.try_get::<i64, _>("timestamp")? as u64,
                    miner: decode_address(&row.try_get::<Vec<u8>, _>("miner")?)?,
                    gas_used: row.try_get::<i64, _>("gas_used")? as u64,
                    gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
                    base_fee_per_gas: row
                        .try_get::<Option<i64>, _>("base_fee_per_gas")?
                        .map(|f| f as u64),
                    logs_bloom: Bloom::from_slice(&row.try_get::<Vec<u8>, _>("logs_bloom")?),
                    transaction_count: row.try_get::<i64, _>("transaction_count")? as u64,
                })
            })
            .collect()
    }

    async fn read_transactions(
        &self,
        chain_id: u64,
        from: &Checkpoint,
        to: &Checkpoint,
        limit: usize,
    ) -> Result<Vec<SyncTransaction>, StoreError> {
        let rows = self
            .read_event_rows("transactions", "*", chain_id, from, to, limit)
            .await?;
        rows.iter()
            .map(|row| decode_transaction_row(chain_id, row))
            .collect()
    }

    /// Persisted transactions by hash; hashes with no row are simply
    /// absent from the result.
    pub async fn get_transactions_by_hash(
        &self,
        chain_id: u64,
        hashes: &[B256],
    ) -> Result<Vec<SyncTransaction>, StoreError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM transactions WHERE chain_id = {} AND hash IN ({})",
            self.dialect.placeholder(1),
            self.dialect.placeholder_list(2, hashes.len())
        );
        let mut query = sqlx::query(&sql).bind(chain_id as i64);
        for hash in hashes {
            query = query.bind(encode_b256(*hash));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| decode_transaction_row(chain_id, row))
            .collect()
    }

    /// Persisted receipts by transaction hash; missing rows are absent.
    pub async fn get_receipts_by_hash(
        &self,
        chain_id: u64,
        hashes: &[B256],
    ) -> Result<Vec<SyncReceipt>, StoreError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM receipts WHERE chain_id = {} AND transaction_hash IN ({})",
            self.dialect.placeholder(1),
            self.dialect.placeholder_list(2, hashes.len())
        );
        let mut query = sqlx::query(&sql).bind(chain_id as i64);
        for hash in hashes {
            query = query.bind(encode_b256(*hash));
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| decode_receipt_row(chain_id, row))
            .collect()
    }

    async fn read_logs(
        &self,
        chain_id: u64,
        from: &Checkpoint,
        to: &Checkpoint,
        limit: usize,
    ) -> Result<Vec<SyncLog>, StoreError> {
        let rows = self.read_event_rows("logs", "*", chain_id, from, to, limit).await?;
        rows.iter()
            .map(|row| {
                let topics = [
                    row.try_get::<Option<Vec<u8>>, _>("topic0")?,
                    row.try_get::<Option<Vec<u8>>, _>("topic1")?,
                    row.try_get::<Option<Vec<u8>>, _>("topic2")?,
                    row.try_get::<Option<Vec<u8>>, _>("topic3")?,
                ]
                .into_iter()
                .flatten()
                .map(|b| decode_b256(&b))
                .collect::<Result<Vec<B256>, _>>()?;
                Ok(SyncLog {
                    chain_id,
                    block_hash: decode_b256(&row.try_get::<Vec<u8>, _>("block_hash")?)?,
                    block_number: row.try_get::<i64, _>("block_number")? as u64,
                    block_timestamp: row
                        .try_get::<Option<i64>, _>("block_timestamp")?
                        .map(|ts| ts as u64),
                    log_index: row.try_get::<i64, _>("log_index")? as u64,
                    transaction_hash: decode_b256(
                        &row.try_get::<Vec<u8>, _>("transaction_hash")?,
                    )?,
                    transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
                    address: decode_address(&row.try_get::<Vec<u8>, _>("address")?)?,
                    topics,
                    data: Bytes::from(row.try_get::<Vec<u8>, _>("data")?),
                })
            })
            .collect()
    }

    async fn read_traces(
        &self,
        chain_id: u64,
        from: &Checkpoint,
        to: &Checkpoint,
        limit: usize,
    ) -> Result<Vec<SyncTrace>, StoreError> {
        let rows = self.read_event_rows("traces", "*", chain_id, from, to, limit).await?;
        rows.iter()
            .map(|row| {
                let kind_text: String = row.try_get("kind")?;
                Ok(SyncTrace {
                    chain_id,
                    transaction_hash: decode_b256(
                        &row.try_get::<Vec<u8>, _>("transaction_hash")?,
                    )?,
                    block_hash: decode_b256(&row.try_get::<Vec<u8>, _>("block_hash")?)?,
                    block_number: row.try_get::<i64, _>("block_number")? as u64,
                    block_timestamp: row.try_get::<i64, _>("block_timestamp")? as u64,
                    transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
                    trace_address: decode_trace_address(
                        &row.try_get::<String, _>("trace_address")?,
                    )?,
                    trace_index: row.try_get::<i64, _>("trace_index")? as u64,
                    kind: crate::types::CallKind::parse(&kind_text).ok_or_else(|| {
                        StoreError::Decode(format!("unknown call kind '{kind_text}'"))
                    })?,
                    from: decode_address(&row.try_get::<Vec<u8>, _>("from_address")?)?,
                    to: row
                        .try_get::<Option<Vec<u8>>, _>("to_address")?
                        .map(|b| decode_address(&b))
                        .transpose()?,
                    value: decode_u256(&row.try_get::<String, _>("value")?)?,
                    input: Bytes::from(row.try_get::<Vec<u8>, _>("input")?),
                    output: row
                        .try_get::<Option<Vec<u8>>, _>("output")?
                        .map(Bytes::from),
                    gas_used: row.try_get::<i64, _>("gas_used")? as u64,
                    error: row.try_get::<Option<String>, _>("error")?,
                })
            })
            .collect()
    }

    async fn read_event_rows(
        &self,
        table: &str,
        columns: &str,
        chain_id: u64,
        from: &Checkpoint,
        to: &Checkpoint,
        limit: usize,
    ) -> Result<Vec<sqlx::any::AnyRow>, StoreError> {
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE chain_id = {} AND checkpoint > {} AND \
             checkpoint <= {} ORDER BY checkpoint ASC LIMIT {}",
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
            self.dialect.placeholder(3),
            self.dialect.placeholder(4)
        );
        let rows = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(from.encode())
            .bind(to.encode())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

async fn execute_block_chunk<'e, E>(
    executor: E,
    dialect: Dialect,
    chunk: &[SyncBlock],
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    if chunk.is_empty() {
        return Ok(());
    }
    let mut sql = String::from(
        "INSERT INTO blocks (chain_id, number, hash, parent_hash, timestamp, miner, \
         gas_used, gas_limit, base_fee_per_gas, logs_bloom, transaction_count, \
         checkpoint) VALUES ",
    );
    push_tuples(&mut sql, dialect, chunk.len(), BLOCK_COLUMNS);
    sql.push_str(" ON CONFLICT (chain_id, hash) DO NOTHING");

    let mut query = sqlx::query(&sql);
    for block in chunk {
        query = query
            .bind(block.chain_id as i64)
            .bind(block.number as i64)
            .bind(encode_b256(block.hash))
            .bind(encode_b256(block.parent_hash))
            .bind(block.timestamp as i64)
            .bind(encode_address(block.miner))
            .bind(block.gas_used as i64)
            .bind(block.gas_limit as i64)
            .bind(block.base_fee_per_gas.map(|f| f as i64))
            .bind(block.logs_bloom.as_slice().to_vec())
            .bind(block.transaction_count as i64)
            .bind(block.checkpoint().encode());
    }
    query.execute(executor).await?;
    Ok(())
}

async fn execute_transaction_chunk<'e, E>(
    executor: E,
    dialect: Dialect,
    chunk: &[SyncTransaction],
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    if chunk.is_empty() {
        return Ok(());
    }
    let mut sql = String::from(
        "INSERT INTO transactions (chain_id, hash, block_hash, block_number, \
         block_timestamp, transaction_index, from_address, to_address, value, input, \
         gas_limit, nonce, checkpoint) VALUES ",
    );
    push_tuples(&mut sql, dialect, chunk.len(), TRANSACTION_COLUMNS);
    sql.push_str(" ON CONFLICT (chain_id, hash) DO NOTHING");

    let mut query = sqlx::query(&sql);
    for tx in chunk {
        query = query
            .bind(tx.chain_id as i64)
            .bind(encode_b256(tx.hash))
            .bind(encode_b256(tx.block_hash))
            .bind(tx.block_number as i64)
            .bind(tx.block_timestamp as i64)
            .bind(tx.transaction_index as i64)
            .bind(encode_address(tx.from))
            .bind(tx.to.map(encode_address))
            .bind(encode_u256(tx.value))
            .bind(tx.input.to_vec())
            .bind(tx.gas_limit as i64)
            .bind(tx.nonce as i64)
            .bind(tx.checkpoint().encode());
    }
    query.execute(executor).await?;
    Ok(())
}

async fn execute_receipt_chunk<'e, E>(
    executor: E,
    dialect: Dialect,
    chunk: &[SyncReceipt],
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    if chunk.is_empty() {
        return Ok(());
    }
    let mut sql = String::from(
        "INSERT INTO receipts (chain_id, transaction_hash, block_hash, block_number, \
         transaction_index, status, gas_used, contract_address, from_address, \
         to_address) VALUES ",
    );
    push_tuples(&mut sql, dialect, chunk.len(), RECEIPT_COLUMNS);
    sql.push_str(" ON CONFLICT (chain_id, transaction_hash) DO NOTHING");

    let mut query = sqlx::query(&sql);
    for receipt in chunk {
        query = query
            .bind(receipt.chain_id as i64)
            .bind(encode_b256(receipt.transaction_hash))
            .bind(encode_b256(receipt.block_hash))
            .bind(receipt.block_number as i64)
            .bind(receipt.transaction_index as i64)
            .bind(receipt.status as i64)
            .bind(receipt.gas_used as i64)
            .bind(receipt.contract_address.map(encode_address))
            .bind(encode_address(receipt.from))
            .bind(receipt.to.map(encode_address));
    }
    query.execute(executor).await?;
    Ok(())
}

async fn execute_trace_chunk<'e, E>(
    executor: E,
    dialect: Dialect,
    chunk: &[SyncTrace],
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    if chunk.is_empty() {
        return Ok(());
    }
    let mut sql = String::from(
        "INSERT INTO traces (chain_id, transaction_hash, trace_address, block_hash, \
         block_number, block_timestamp, transaction_index, trace_index, kind, \
         from_address, to_address, value, input, output, gas_used, error, checkpoint) \
         VALUES ",
    );
    push_tuples(&mut sql, dialect, chunk.len(), TRACE_COLUMNS);
    sql.push_str(" ON CONFLICT (chain_id, transaction_hash, trace_address) DO NOTHING");

    let mut query = sqlx::query(&sql);
    for trace in chunk {
        query = query
            .bind(trace.chain_id as i64)
            .bind(encode_b256(trace.transaction_hash))
            .bind(encode_trace_address(&trace.trace_address))
            .bind(encode_b256(trace.block_hash))
            .bind(trace.block_number as i64)
            .bind(trace.block_timestamp as i64)
            .bind(trace.transaction_index as i64)
            .bind(trace.trace_index as i64)
            .bind(trace.kind.as_str())
            .bind(encode_address(trace.from))
            .bind(trace.to.map(encode_address))
            .bind(encode_u256(trace.value))
            .bind(trace.input.to_vec())
            .bind(trace.output.as_ref().map(|o| o.to_vec()))
            .bind(trace.gas_used as i64)
            .bind(trace.error.clone())
            .bind(trace.checkpoint().encode());
    }
    query.execute(executor).await?;
    Ok(())
}

async fn execute_log_chunk<'e, E>(
    executor: E,
    dialect: Dialect,
    chunk: &[SyncLog],
    confirm: bool,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    let mut sql = String::from(
        "INSERT INTO logs (chain_id, block_hash, log_index, block_number, \
         block_timestamp, transaction_hash, transaction_index, address, topic0, \
         topic1, topic2, topic3, data, checkpoint) VALUES ",
    );
    push_tuples(&mut sql, dialect, chunk.len(), LOG_COLUMNS);
    if confirm {
        sql.push_str(
            " ON CONFLICT (chain_id, block_hash, log_index) DO UPDATE SET \
             block_timestamp = excluded.block_timestamp, \
             checkpoint = excluded.checkpoint",
        );
    } else {
        sql.push_str(" ON CONFLICT (chain_id, block_hash, log_index) DO NOTHING");
    }

    let mut query = sqlx::query(&sql);
    for log in chunk {
        let checkpoint = log.block_timestamp.map(|ts| log.checkpoint(ts).encode());
        query = query
            .bind(log.chain_id as i64)
            .bind(encode_b256(log.block_hash))
            .bind(log.log_index as i64)
            .bind(log.block_number as i64)
            .bind(log.block_timestamp.map(|ts| ts as i64))
            .bind(encode_b256(log.transaction_hash))
            .bind(log.transaction_index as i64)
            .bind(encode_address(log.address))
            .bind(log.topic(0).map(encode_b256))
            .bind(log.topic(1).map(encode_b256))
            .bind(log.topic(2).map(encode_b256))
            .bind(log.topic(3).map(encode_b256))
            .bind(log.data.to_vec())
            .bind(checkpoint);
    }
    query.execute(executor).await?;
    Ok(())
}

async fn merge_interval_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    dialect: Dialect,
    fragment_id: &str,
    iv: Interval,
) -> Result<(), StoreError> {
    let select = format!(
        "SELECT lo, hi FROM intervals WHERE fragment_id = {}",
        dialect.placeholder(1)
    );
    let rows = sqlx::query(&select)
        .bind(fragment_id)
        .fetch_all(&mut **tx)
        .await?;
    let mut set: Vec<Interval> = rows
        .iter()
        .map(|row| {
            Ok::<_, StoreError>(Interval::new(
                row.try_get::<i64, _>("lo")? as u64,
                row.try_get::<i64, _>("hi")? as u64,
            ))
        })
        .collect::<Result<_, _>>()?;
    interval::insert(&mut set, iv);

    let delete = format!(
        "DELETE FROM intervals WHERE fragment_id = {}",
        dialect.placeholder(1)
    );
    sqlx::query(&delete)
        .bind(fragment_id)
        .execute(&mut **tx)
        .await?;

    let mut insert = String::from("INSERT INTO intervals (fragment_id, lo, hi) VALUES ");
    push_tuples(&mut insert, dialect, set.len(), 3);
    let mut query = sqlx::query(&insert);
    for member in &set {
        query = query
            .bind(fragment_id)
            .bind(member.lo as i64)
            .bind(member.hi as i64);
    }
    query.execute(&mut **tx).await?;
    Ok(())
}

/// Append `rows` comma-separated placeholder tuples of `columns` binds.
fn push_tuples(sql: &mut String, dialect: Dialect, rows: usize, columns: usize) {
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&dialect.values_tuple(row * columns + 1, columns));
    }
}

fn decode_transaction_row(
    chain_id: u64,
    row: &sqlx::any::AnyRow,
) -> Result<SyncTransaction, StoreError> {
    Ok(SyncTransaction {
        chain_id,
        hash: decode_b256(&row.try_get::<Vec<u8>, _>("hash")?)?,
        block_hash: decode_b256(&row.try_get::<Vec<u8>, _>("block_hash")?)?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_timestamp: row.try_get::<i64, _>("block_timestamp")? as u64,
        transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
        from: decode_address(&row.try_get::<Vec<u8>, _>("from_address")?)?,
        to: row
            .try_get::<Option<Vec<u8>>, _>("to_address")?
            .map(|b| decode_address(&b))
            .transpose()?,
        value: decode_u256(&row.try_get::<String, _>("value")?)?,
        input: Bytes::from(row.try_get::<Vec<u8>, _>("input")?),
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
    })
}

fn decode_receipt_row(chain_id: u64, row: &sqlx::any::AnyRow) -> Result<SyncReceipt, StoreError> {
    Ok(SyncReceipt {
        chain_id,
        transaction_hash: decode_b256(&row.try_get::<Vec<u8>, _>("transaction_hash")?)?,
        block_hash: decode_b256(&row.try_get::<Vec<u8>, _>("block_hash")?)?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
        status: row.try_get::<i64, _>("status")? != 0,
        gas_used: row.try_get::<i64, _>("gas_used")? as u64,
        contract_address: row
            .try_get::<Option<Vec<u8>>, _>("contract_address")?
            .map(|b| decode_address(&b))
            .transpose()?,
        from: decode_address(&row.try_get::<Vec<u8>, _>("from_address")?)?,
        to: row
            .try_get::<Option<Vec<u8>>, _>("to_address")?
            .map(|b| decode_address(&b))
            .transpose()?,
    })
}

fn decode_checkpoint_row(row: &sqlx::any::AnyRow) -> Result<ChainCheckpointRow, StoreError> {
    let decode = |text: String| {
        Checkpoint::decode(&text)
            .map_err(|e| StoreError::Decode(format!("bad checkpoint '{text}': {e}")))
    };
    Ok(ChainCheckpointRow {
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        chain_name: row.try_get("chain_name")?,
        latest: decode(row.try_get("latest")?)?,
        safe: decode(row.try_get("safe")?)?,
        finalized: decode(row.try_get("finalized")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_tuples_layout() {
        let mut sql = String::new();
        push_tuples(&mut sql, Dialect::Postgres, 2, 3);
        assert_eq!(sql, "($1, $2, $3), ($4, $5, $6)");

        let mut sql = String::new();
        push_tuples(&mut sql, Dialect::Sqlite, 2, 2);
        assert_eq!(sql, "(?, ?), (?, ?)");
    }

    #[test]
    fn test_chunk_sizing_respects_bind_budget() {
        let store_cols = TRACE_COLUMNS;
        for dialect in [Dialect::Postgres, Dialect::Sqlite] {
            let rows = MAX_ROWS_PER_INSERT.min(dialect.max_bind_params() / store_cols);
            assert!(rows * store_cols <= dialect.max_bind_params());
            assert!(rows > 0);
        }
    }
}
