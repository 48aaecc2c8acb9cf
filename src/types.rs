use alloy::consensus::Transaction as ConsensusTransaction;
use alloy::network::TransactionResponse;
use alloy::primitives::{Address, Bloom, Bytes, B256, U256};
use alloy::rpc::types::trace::geth::CallFrame;
use alloy::rpc::types::{Block, Header, Log, Transaction, TransactionReceipt};

use crate::checkpoint::{Checkpoint, EventKind, MAX_FIELD};

/// Canonical block row, keyed by `(chain_id, hash)`.
#[derive(Debug, Clone)]
pub struct SyncBlock {
    pub chain_id: u64,
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub miner: Address,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub base_fee_per_gas: Option<u64>,
    pub logs_bloom: Bloom,
    pub transaction_count: u64,
}

impl SyncBlock {
    pub fn from_rpc(chain_id: u64, block: &Block) -> Self {
        SyncBlock {
            chain_id,
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
            miner: block.header.beneficiary,
            gas_used: block.header.gas_used,
            gas_limit: block.header.gas_limit,
            base_fee_per_gas: block.header.base_fee_per_gas,
            logs_bloom: block.header.logs_bloom,
            transaction_count: block.transactions.len() as u64,
        }
    }

    /// Checkpoint of the block event itself: after every transaction-scoped
    /// event of the block.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            block_timestamp: self.timestamp,
            chain_id: self.chain_id,
            block_number: self.number,
            transaction_index: MAX_FIELD,
            event_kind: EventKind::Block,
            event_index: 0,
        }
    }
}

/// Canonical transaction row, keyed by `(chain_id, hash)`.
#[derive(Debug, Clone)]
pub struct SyncTransaction {
    pub chain_id: u64,
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_index: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub gas_limit: u64,
    pub nonce: u64,
}

impl SyncTransaction {
    pub fn from_rpc(chain_id: u64, block: &SyncBlock, tx: &Transaction) -> Self {
        SyncTransaction {
            chain_id,
            hash: TransactionResponse::tx_hash(tx),
            block_hash: tx.block_hash.unwrap_or(block.hash),
            block_number: tx.block_number.unwrap_or(block.number),
            block_timestamp: block.timestamp,
            transaction_index: tx.transaction_index.unwrap_or_default(),
            from: TransactionResponse::from(tx),
            to: ConsensusTransaction::to(tx),
            value: ConsensusTransaction::value(tx),
            input: ConsensusTransaction::input(tx).clone(),
            gas_limit: ConsensusTransaction::gas_limit(tx),
            nonce: ConsensusTransaction::nonce(tx),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            block_timestamp: self.block_timestamp,
            chain_id: self.chain_id,
            block_number: self.block_number,
            transaction_index: self.transaction_index,
            event_kind: EventKind::Transaction,
            event_index: 0,
        }
    }
}

/// Canonical receipt row, keyed by `(chain_id, transaction_hash)`.
#[derive(Debug, Clone)]
pub struct SyncReceipt {
    pub chain_id: u64,
    pub transaction_hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub status: bool,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
    pub from: Address,
    pub to: Option<Address>,
}

impl SyncReceipt {
    pub fn from_rpc(chain_id: u64, receipt: &TransactionReceipt) -> Self {
        SyncReceipt {
            chain_id,
            transaction_hash: receipt.transaction_hash,
            block_hash: receipt.block_hash.unwrap_or_default(),
            block_number: receipt.block_number.unwrap_or_default(),
            transaction_index: receipt.transaction_index.unwrap_or_default(),
            status: receipt.status(),
            gas_used: receipt.gas_used,
            contract_address: receipt.contract_address,
            from: receipt.from,
            to: receipt.to,
        }
    }
}

/// Canonical log row, keyed by `(chain_id, block_hash, log_index)`.
///
/// `block_timestamp` is unknown while only `eth_getLogs` has run; the block
/// fetch fills it in before the row becomes visible to event reads.
#[derive(Debug, Clone)]
pub struct SyncLog {
    pub chain_id: u64,
    pub block_hash: B256,
    pub block_number: u64,
    pub block_timestamp: Option<u64>,
    pub log_index: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

impl SyncLog {
    /// Returns `None` for pending logs that carry no block coordinates.
    pub fn from_rpc(chain_id: u64, log: &Log) -> Option<Self> {
        let block_hash = log.block_hash?;
        let block_number = log.block_number?;
        Some(SyncLog {
            chain_id,
            block_hash,
            block_number,
            block_timestamp: log.block_timestamp,
            log_index: log.log_index?,
            // A zero hash is permitted here; some chains emit system logs
            // outside any transaction.
            transaction_hash: log.transaction_hash.unwrap_or_default(),
            transaction_index: log.transaction_index.unwrap_or_default(),
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
        })
    }

    pub fn topic(&self, i: usize) -> Option<B256> {
        self.topics.get(i).copied()
    }

    pub fn checkpoint(&self, block_timestamp: u64) -> Checkpoint {
        Checkpoint {
            block_timestamp,
            chain_id: self.chain_id,
            block_number: self.block_number,
            transaction_index: self.transaction_index,
            event_kind: EventKind::Log,
            event_index: self.log_index,
        }
    }

    /// Drops payload bytes once only block/transaction coordinates are
    /// needed downstream.
    pub fn strip_data(mut self) -> Self {
        self.data = Bytes::new();
        self
    }
}

/// The shape of a call frame, parsed from the tracer's `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Call,
    StaticCall,
    DelegateCall,
    CallCode,
    Create,
    Create2,
    SelfDestruct,
}

impl CallKind {
    pub fn parse(typ: &str) -> Option<Self> {
        match typ.to_ascii_uppercase().as_str() {
            "CALL" => Some(Self::Call),
            "STATICCALL" => Some(Self::StaticCall),
            "DELEGATECALL" => Some(Self::DelegateCall),
            "CALLCODE" => Some(Self::CallCode),
            "CREATE" => Some(Self::Create),
            "CREATE2" => Some(Self::Create2),
            "SELFDESTRUCT" => Some(Self::SelfDestruct),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::StaticCall => "STATICCALL",
            Self::DelegateCall => "DELEGATECALL",
            Self::CallCode => "CALLCODE",
            Self::Create => "CREATE",
            Self::Create2 => "CREATE2",
            Self::SelfDestruct => "SELFDESTRUCT",
        }
    }
}

/// Canonical trace row, keyed by `(chain_id, transaction_hash, trace_address)`.
#[derive(Debug, Clone)]
pub struct SyncTrace {
    pub chain_id: u64,
    pub transaction_hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_index: u64,
    /// Path of call indices from the root frame.
    pub trace_address: Vec<u32>,
    /// Preorder position within the transaction; drives event ordering.
    pub trace_index: u64,
    pub kind: CallKind,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub output: Option<Bytes>,
    pub gas_used: u64,
    pub error: Option<String>,
}

impl SyncTrace {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            block_timestamp: self.block_timestamp,
            chain_id: self.chain_id,
            block_number: self.block_number,
            transaction_index: self.transaction_index,
            event_kind: EventKind::Trace,
            event_index: self.trace_index,
        }
    }

    /// A value-bearing successful CALL is the wire form of a native transfer.
    pub fn is_transfer(&self) -> bool {
        self.kind == CallKind::Call && !self.value.is_zero() && self.error.is_none()
    }

    pub fn transfer_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            event_kind: EventKind::Transfer,
            ..self.checkpoint()
        }
    }
}

/// Flatten one transaction's call frame tree in preorder.
pub fn flatten_call_frames(
    chain_id: u64,
    block: &SyncBlock,
    transaction_hash: B256,
    transaction_index: u64,
    root: &CallFrame,
) -> Vec<SyncTrace> {
    let mut out = Vec::new();
    let mut preorder = 0u64;
    push_frame(chain_id, block, transaction_hash, transaction_index, root, &mut Vec::new(), &mut preorder, &mut out);
    out
}

#[allow(clippy::too_many_arguments)]
fn push_frame(
    chain_id: u64,
    block: &SyncBlock,
    transaction_hash: B256,
    transaction_index: u64,
    frame: &CallFrame,
    path: &mut Vec<u32>,
    preorder: &mut u64,
    out: &mut Vec<SyncTrace>,
) {
    let kind = CallKind::parse(&frame.typ).unwrap_or(CallKind::Call);
    out.push(SyncTrace {
        chain_id,
        transaction_hash,
        block_hash: block.hash,
        block_number: block.number,
        block_timestamp: block.timestamp,
        transaction_index,
        trace_address: path.clone(),
        trace_index: *preorder,
        kind,
        from: frame.from,
        to: frame.to,
        value: frame.value.unwrap_or(U256::ZERO),
        input: frame.input.clone(),
        output: frame.output.clone(),
        gas_used: frame.gas_used.try_into().unwrap_or(u64::MAX),
        error: frame.error.clone(),
    });
    *preorder += 1;
    for (i, child) in frame.calls.iter().enumerate() {
        path.push(i as u32);
        push_frame(chain_id, block, transaction_hash, transaction_index, child, path, preorder, out);
        path.pop();
    }
}

/// Header-sized view of a block, enough for the unfinalized chain buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightBlock {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

impl From<&SyncBlock> for LightBlock {
    fn from(b: &SyncBlock) -> Self {
        LightBlock { number: b.number, hash: b.hash, parent_hash: b.parent_hash, timestamp: b.timestamp }
    }
}

impl From<&Header> for LightBlock {
    fn from(h: &Header) -> Self {
        LightBlock {
            number: h.number,
            hash: h.hash,
            parent_hash: h.parent_hash,
            timestamp: h.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(typ: &str, calls: Vec<CallFrame>) -> CallFrame {
        CallFrame {
            typ: typ.to_string(),
            calls,
            value: Some(U256::from(1)),
            ..Default::default()
        }
    }

    fn test_block() -> SyncBlock {
        SyncBlock {
            chain_id: 1,
            number: 100,
            hash: B256::repeat_byte(0xaa),
            parent_hash: B256::repeat_byte(0xab),
            timestamp: 1_700_000_000,
            miner: Address::ZERO,
            gas_used: 0,
            gas_limit: 30_000_000,
            base_fee_per_gas: None,
            logs_bloom: Bloom::ZERO,
            transaction_count: 1,
        }
    }

    #[test]
    fn test_flatten_is_preorder() {
        let root = frame(
            "CALL",
            vec![
                frame("STATICCALL", vec![frame("DELEGATECALL", vec![])]),
                frame("CREATE", vec![]),
            ],
        );
        let traces =
            flatten_call_frames(1, &test_block(), B256::repeat_byte(1), 0, &root);

        let paths: Vec<Vec<u32>> = traces.iter().map(|t| t.trace_address.clone()).collect();
        assert_eq!(paths, vec![vec![], vec![0], vec![0, 0], vec![1]]);
        let indices: Vec<u64> = traces.iter().map(|t| t.trace_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(traces[2].kind, CallKind::DelegateCall);
    }

    #[test]
    fn test_trace_checkpoints_follow_preorder() {
        let root = frame("CALL", vec![frame("CALL", vec![]), frame("CALL", vec![])]);
        let traces =
            flatten_call_frames(1, &test_block(), B256::repeat_byte(1), 3, &root);
        for pair in traces.windows(2) {
            assert!(pair[0].checkpoint() < pair[1].checkpoint());
        }
    }

    #[test]
    fn test_call_kind_parsing() {
        assert_eq!(CallKind::parse("CALL"), Some(CallKind::Call));
        assert_eq!(CallKind::parse("staticcall"), Some(CallKind::StaticCall));
        assert_eq!(CallKind::parse("CREATE2"), Some(CallKind::Create2));
        assert_eq!(CallKind::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_transfer_detection() {
        let block = test_block();
        let mut traces = flatten_call_frames(
            1,
            &block,
            B256::repeat_byte(1),
            0,
            &frame("CALL", vec![]),
        );
        assert!(traces[0].is_transfer());
        traces[0].value = U256::ZERO;
        assert!(!traces[0].is_transfer());
    }
}
