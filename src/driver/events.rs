//! The event model handed to user handlers, the handler registration seam,
//! and the omnichain checkpoint arithmetic.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use sqlx::AnyConnection;

use crate::checkpoint::Checkpoint;
use crate::error::IndexingError;
use crate::filter::FilterId;
use crate::store::indexing::{
    Condition, FindMany, IndexingStore, PageResult, UserRow, Value,
};
use crate::store::sync::EventPayload;
use crate::types::{SyncReceipt, SyncTransaction};

/// One indexable occurrence, in global order.
#[derive(Debug, Clone)]
pub struct Event {
    pub chain_id: u64,
    pub chain_name: String,
    pub filter_id: FilterId,
    pub checkpoint: Checkpoint,
    pub payload: EventPayload,
    /// The enclosing transaction, when already fetched. Read through
    /// [`Event::transaction`].
    pub transaction: Option<SyncTransaction>,
    /// The transaction receipt, when the filter requested receipts or a
    /// refetch supplied it. Read through [`Event::receipt`].
    pub receipt: Option<SyncReceipt>,
}

impl Event {
    /// The transaction this event belongs to. When the association was not
    /// fetched, this raises `InvalidEventAccess`; the driver answers by
    /// refetching the batch with the field populated and retrying once.
    pub fn transaction(&self) -> Result<&SyncTransaction, IndexingError> {
        if let EventPayload::Transaction(tx) = &self.payload {
            return Ok(tx);
        }
        self.transaction.as_ref().ok_or_else(|| IndexingError::InvalidEventAccess {
            field: "transaction".to_string(),
        })
    }

    /// The receipt of the enclosing transaction; same refetch contract as
    /// [`Event::transaction`].
    pub fn receipt(&self) -> Result<&SyncReceipt, IndexingError> {
        self.receipt.as_ref().ok_or_else(|| IndexingError::InvalidEventAccess {
            field: "receipt".to_string(),
        })
    }

    /// Hash of the enclosing transaction; `None` for block events and for
    /// system logs emitted outside any transaction.
    pub fn transaction_hash(&self) -> Option<B256> {
        match &self.payload {
            EventPayload::Block(_) => None,
            EventPayload::Transaction(tx) => Some(tx.hash),
            EventPayload::Log(log) => {
                (log.transaction_hash != B256::ZERO).then_some(log.transaction_hash)
            }
            EventPayload::Trace(trace) | EventPayload::Transfer(trace) => {
                Some(trace.transaction_hash)
            }
        }
    }
}

/// The database view a handler writes through: every operation lands in the
/// enclosing dispatch transaction and is op-logged at the event's
/// checkpoint.
pub struct Db<'a> {
    pub(crate) conn: &'a mut AnyConnection,
    pub(crate) store: &'a IndexingStore,
    pub(crate) checkpoint: Checkpoint,
}

impl<'a> Db<'a> {
    pub fn new(
        conn: &'a mut AnyConnection,
        store: &'a IndexingStore,
        checkpoint: Checkpoint,
    ) -> Self {
        Db { conn, store, checkpoint }
    }

    pub async fn find_unique(
        &mut self,
        table: &str,
        id: &Value,
    ) -> Result<Option<UserRow>, IndexingError> {
        self.store.find_unique(self.conn, table, id).await
    }

    pub async fn find_many(
        &mut self,
        table: &str,
        query: FindMany,
    ) -> Result<PageResult, IndexingError> {
        self.store.find_many(self.conn, table, query).await
    }

    pub async fn create(&mut self, table: &str, row: UserRow) -> Result<UserRow, IndexingError> {
        self.store.create(self.conn, &self.checkpoint, table, row).await
    }

    pub async fn create_many(
        &mut self,
        table: &str,
        rows: Vec<UserRow>,
    ) -> Result<usize, IndexingError> {
        self.store
            .create_many(self.conn, &self.checkpoint, table, rows)
            .await
    }

    pub async fn update<F>(
        &mut self,
        table: &str,
        id: &Value,
        mutate: F,
    ) -> Result<UserRow, IndexingError>
    where
        F: FnOnce(&UserRow) -> UserRow,
    {
        self.store
            .update(self.conn, &self.checkpoint, table, id, mutate)
            .await
    }

    pub async fn update_many<F>(
        &mut self,
        table: &str,
        conditions: Vec<Condition>,
        mutate: F,
    ) -> Result<usize, IndexingError>
    where
        F: Fn(&UserRow) -> UserRow,
    {
        self.store
            .update_many(self.conn, &self.checkpoint, table, conditions, mutate)
            .await
    }

    pub async fn upsert<F>(
        &mut self,
        table: &str,
        id: &Value,
        create_row: UserRow,
        mutate: F,
    ) -> Result<UserRow, IndexingError>
    where
        F: FnOnce(&UserRow) -> UserRow,
    {
        self.store
            .upsert(self.conn, &self.checkpoint, table, id, create_row, mutate)
            .await
    }

    pub async fn delete(&mut self, table: &str, id: &Value) -> Result<bool, IndexingError> {
        self.store.delete(self.conn, &self.checkpoint, table, id).await
    }
}

/// User indexing logic for one `(chain, filter)` pair. Handlers must be
/// idempotent under replay from the last safe checkpoint.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &Event, db: &mut Db<'_>) -> Result<(), IndexingError>;
}

/// One-time initialization dispatched before any event when the database is
/// fresh.
#[async_trait]
pub trait SetupHandler: Send + Sync {
    async fn setup(&self, chain_id: u64, db: &mut Db<'_>) -> Result<(), IndexingError>;
}

/// Static dispatch table `(chain_id, filter_id) -> handler`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(u64, FilterId), Arc<dyn Handler>>,
    setup: Vec<(u64, Arc<dyn SetupHandler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chain_id: u64, filter_id: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert((chain_id, filter_id.to_string()), handler);
    }

    pub fn register_setup(&mut self, chain_id: u64, handler: Arc<dyn SetupHandler>) {
        self.setup.push((chain_id, handler));
    }

    pub fn get(&self, chain_id: u64, filter_id: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(&(chain_id, filter_id.to_string()))
    }

    pub fn setup_handlers(&self) -> &[(u64, Arc<dyn SetupHandler>)] {
        &self.setup
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A chain's position in the global order, as seen by the driver.
#[derive(Debug, Clone, Copy)]
pub struct ChainProgress {
    pub chain_id: u64,
    pub start: Checkpoint,
    pub current: Checkpoint,
    /// Upper bound of the chain's declared work; `None` for open-ended.
    pub end: Option<Checkpoint>,
    pub finalized: Checkpoint,
    /// The chain has produced everything up to `end`.
    pub done: bool,
}

/// Minimum start across chains.
pub fn omni_start(progress: &[ChainProgress]) -> Option<Checkpoint> {
    progress.iter().map(|p| p.start).min()
}

/// Minimum current among unfinished chains; once every chain is done, the
/// maximum (the stream has fully caught up).
pub fn omni_current(progress: &[ChainProgress]) -> Option<Checkpoint> {
    let unfinished: Vec<Checkpoint> = progress
        .iter()
        .filter(|p| !p.done)
        .map(|p| p.current)
        .collect();
    if unfinished.is_empty() {
        progress.iter().map(|p| p.current).max()
    } else {
        unfinished.into_iter().min()
    }
}

/// Maximum end across chains; undefined when any chain is open-ended.
pub fn omni_end(progress: &[ChainProgress]) -> Option<Checkpoint> {
    let mut out: Option<Checkpoint> = None;
    for p in progress {
        let end = p.end?;
        out = Some(out.map_or(end, |existing| existing.max(end)));
    }
    out
}

/// Minimum finalized across chains.
pub fn omni_finalized(progress: &[ChainProgress]) -> Option<Checkpoint> {
    progress.iter().map(|p| p.finalized).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes, U256};
    use crate::types::SyncLog;

    fn cp(block: u64, chain: u64) -> Checkpoint {
        Checkpoint::block_end(1_000 + block, chain, block)
    }

    fn test_transaction(hash: B256) -> SyncTransaction {
        SyncTransaction {
            chain_id: 1,
            hash,
            block_hash: B256::repeat_byte(2),
            block_number: 10,
            block_timestamp: 1_010,
            transaction_index: 0,
            from: Address::repeat_byte(1),
            to: Some(Address::repeat_byte(2)),
            value: U256::ZERO,
            input: Bytes::new(),
            gas_limit: 21_000,
            nonce: 0,
        }
    }

    fn log_event(transaction_hash: B256) -> Event {
        Event {
            chain_id: 1,
            chain_name: "testnet".to_string(),
            filter_id: "f".to_string(),
            checkpoint: cp(10, 1),
            payload: EventPayload::Log(SyncLog {
                chain_id: 1,
                block_hash: B256::repeat_byte(2),
                block_number: 10,
                block_timestamp: Some(1_010),
                log_index: 0,
                transaction_hash,
                transaction_index: 0,
                address: Address::repeat_byte(3),
                topics: vec![],
                data: Bytes::new(),
            }),
            transaction: None,
            receipt: None,
        }
    }

    #[test]
    fn test_unfetched_association_raises_invalid_event_access() {
        let event = log_event(B256::repeat_byte(7));
        assert!(matches!(
            event.transaction(),
            Err(IndexingError::InvalidEventAccess { ref field }) if field == "transaction"
        ));
        assert!(matches!(
            event.receipt(),
            Err(IndexingError::InvalidEventAccess { ref field }) if field == "receipt"
        ));
    }

    #[test]
    fn test_hydrated_association_is_returned() {
        let hash = B256::repeat_byte(7);
        let mut event = log_event(hash);
        event.transaction = Some(test_transaction(hash));
        assert_eq!(event.transaction().unwrap().hash, hash);
    }

    #[test]
    fn test_transaction_payload_is_its_own_transaction() {
        let hash = B256::repeat_byte(9);
        let event = Event {
            payload: EventPayload::Transaction(test_transaction(hash)),
            ..log_event(hash)
        };
        // no association needed: the payload carries the transaction
        assert_eq!(event.transaction().unwrap().hash, hash);
    }

    #[test]
    fn test_transaction_hash_skips_system_logs() {
        assert_eq!(log_event(B256::ZERO).transaction_hash(), None);
        let hash = B256::repeat_byte(7);
        assert_eq!(log_event(hash).transaction_hash(), Some(hash));
    }

    fn progress(chain_id: u64, current: Checkpoint, done: bool) -> ChainProgress {
        ChainProgress {
            chain_id,
            start: cp(0, chain_id),
            current,
            end: Some(cp(1_000, chain_id)),
            finalized: cp(0, chain_id),
            done,
        }
    }

    #[test]
    fn test_current_is_min_over_unfinished() {
        let a = progress(1, cp(120, 1), false);
        let b = progress(2, cp(90, 2), false);
        assert_eq!(omni_current(&[a, b]), Some(cp(90, 2)));
    }

    #[test]
    fn test_current_is_max_once_all_done() {
        let a = progress(1, cp(120, 1), true);
        let b = progress(2, cp(90, 2), true);
        assert_eq!(omni_current(&[a, b]), Some(cp(120, 1)));
    }

    #[test]
    fn test_done_chain_does_not_hold_back_current() {
        let a = progress(1, cp(50, 1), true);
        let b = progress(2, cp(90, 2), false);
        assert_eq!(omni_current(&[a, b]), Some(cp(90, 2)));
    }

    #[test]
    fn test_end_undefined_when_any_open_ended() {
        let mut a = progress(1, cp(10, 1), false);
        let b = progress(2, cp(10, 2), false);
        assert!(omni_end(&[a, b]).is_some());
        a.end = None;
        assert_eq!(omni_end(&[a, b]), None);
    }

    #[test]
    fn test_start_and_finalized_are_minima() {
        let mut a = progress(1, cp(10, 1), false);
        let mut b = progress(2, cp(10, 2), false);
        a.start = cp(5, 1);
        b.start = cp(3, 2);
        a.finalized = cp(40, 1);
        b.finalized = cp(60, 2);
        assert_eq!(omni_start(&[a, b]), Some(cp(3, 2)));
        assert_eq!(omni_finalized(&[a, b]), Some(cp(40, 1)));
    }

    #[test]
    fn test_empty_progress_has_no_checkpoints() {
        assert_eq!(omni_start(&[]), None);
        assert_eq!(omni_current(&[]), None);
        assert_eq!(omni_finalized(&[]), None);
    }
}
