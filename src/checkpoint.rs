use serde::{Deserialize, Serialize};

// Field widths of the encoded form. Lexicographic order over the encoded
// string must equal the derived ordering on the struct, so every field is
// zero-padded decimal.
const TIMESTAMP_DIGITS: usize = 10;
const CHAIN_ID_DIGITS: usize = 16;
const BLOCK_DIGITS: usize = 16;
const TX_INDEX_DIGITS: usize = 16;
const EVENT_TYPE_DIGITS: usize = 1;
const EVENT_INDEX_DIGITS: usize = 16;

pub const ENCODED_LEN: usize = TIMESTAMP_DIGITS
    + CHAIN_ID_DIGITS
    + BLOCK_DIGITS
    + TX_INDEX_DIGITS
    + EVENT_TYPE_DIGITS
    + EVENT_INDEX_DIGITS;

/// Largest value representable in a 16-digit field. Block-scoped events
/// (with no transaction) carry this as their transaction index so they sort
/// after every transaction of the block.
pub const MAX_FIELD: u64 = 9_999_999_999_999_999;

/// Largest value representable in the 10-digit timestamp field.
const MAX_TIMESTAMP: u64 = 9_999_999_999;

/// Position of an event in the block-local order. Variant order is the
/// dispatch order within one transaction index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum EventKind {
    Transaction = 2,
    Trace = 3,
    Transfer = 4,
    Log = 5,
    Block = 6,
}

impl EventKind {
    fn from_digit(d: u8) -> Option<Self> {
        match d {
            2 => Some(Self::Transaction),
            3 => Some(Self::Trace),
            4 => Some(Self::Transfer),
            5 => Some(Self::Log),
            6 => Some(Self::Block),
            _ => None,
        }
    }
}

/// A position in the global, cross-chain event order.
///
/// The derived `Ord` agrees with lexicographic order on [`Checkpoint::encode`];
/// both are total across chains because the chain id is part of the key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_kind: EventKind,
    pub event_index: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("encoded checkpoint must be {ENCODED_LEN} chars, got {0}")]
    Length(usize),
    #[error("non-numeric field in encoded checkpoint")]
    Digits,
    #[error("unknown event kind digit {0}")]
    Kind(u8),
}

impl Checkpoint {
    /// The checkpoint before any event.
    pub const ZERO: Checkpoint = Checkpoint {
        block_timestamp: 0,
        chain_id: 0,
        block_number: 0,
        transaction_index: 0,
        event_kind: EventKind::Transaction,
        event_index: 0,
    };

    /// The checkpoint after any event.
    pub const MAX: Checkpoint = Checkpoint {
        block_timestamp: MAX_TIMESTAMP,
        chain_id: MAX_FIELD,
        block_number: MAX_FIELD,
        transaction_index: MAX_FIELD,
        event_kind: EventKind::Block,
        event_index: MAX_FIELD,
    };

    /// The smallest checkpoint inside the given block: everything from an
    /// earlier block sorts strictly before it.
    pub fn block_start(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Checkpoint {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: 0,
            event_kind: EventKind::Transaction,
            event_index: 0,
        }
    }

    /// The largest checkpoint inside the given block; used as the watermark
    /// after a block is fully applied.
    pub fn block_end(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Checkpoint {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: MAX_FIELD,
            event_kind: EventKind::Block,
            event_index: MAX_FIELD,
        }
    }

    pub fn encode(&self) -> String {
        debug_assert!(self.block_timestamp <= MAX_TIMESTAMP);
        debug_assert!(self.chain_id <= MAX_FIELD);
        debug_assert!(self.block_number <= MAX_FIELD);
        debug_assert!(self.transaction_index <= MAX_FIELD);
        debug_assert!(self.event_index <= MAX_FIELD);
        format!(
            "{:0tw$}{:0fw$}{:0fw$}{:0fw$}{:01}{:0fw$}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_kind as u8,
            self.event_index,
            tw = TIMESTAMP_DIGITS,
            fw = CHAIN_ID_DIGITS,
        )
    }

    pub fn decode(s: &str) -> Result<Self, CheckpointError> {
        if s.len() != ENCODED_LEN {
            return Err(CheckpointError::Length(s.len()));
        }
        if !s.is_ascii() {
            return Err(CheckpointError::Digits);
        }
        let field = |range: std::ops::Range<usize>| -> Result<u64, CheckpointError> {
            s[range].parse::<u64>().map_err(|_| CheckpointError::Digits)
        };
        let mut at = 0;
        let mut take = |width: usize| {
            let range = at..at + width;
            at += width;
            range
        };
        let block_timestamp = field(take(TIMESTAMP_DIGITS))?;
        let chain_id = field(take(CHAIN_ID_DIGITS))?;
        let block_number = field(take(BLOCK_DIGITS))?;
        let transaction_index = field(take(TX_INDEX_DIGITS))?;
        let kind_digit = field(take(EVENT_TYPE_DIGITS))? as u8;
        let event_kind =
            EventKind::from_digit(kind_digit).ok_or(CheckpointError::Kind(kind_digit))?;
        let event_index = field(take(EVENT_INDEX_DIGITS))?;
        Ok(Checkpoint {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index,
            event_kind,
            event_index,
        })
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ts={} chain={} block={} tx={} kind={:?} idx={}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_kind,
            self.event_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(ts: u64, chain: u64, block: u64, tx: u64, kind: EventKind, idx: u64) -> Checkpoint {
        Checkpoint {
            block_timestamp: ts,
            chain_id: chain,
            block_number: block,
            transaction_index: tx,
            event_kind: kind,
            event_index: idx,
        }
    }

    #[test]
    fn test_encode_width_is_fixed() {
        assert_eq!(Checkpoint::ZERO.encode().len(), ENCODED_LEN);
        assert_eq!(Checkpoint::MAX.encode().len(), ENCODED_LEN);
        assert_eq!(cp(1_700_000_000, 1, 19_000_000, 3, EventKind::Log, 7).encode().len(), ENCODED_LEN);
    }

    #[test]
    fn test_decode_encode_roundtrip() {
        let cases = [
            Checkpoint::ZERO,
            Checkpoint::MAX,
            cp(1_700_000_000, 1, 19_000_000, 3, EventKind::Log, 7),
            cp(0, 8453, 0, MAX_FIELD, EventKind::Block, MAX_FIELD),
        ];
        for c in cases {
            assert_eq!(Checkpoint::decode(&c.encode()).unwrap(), c);
        }
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(Checkpoint::decode("123"), Err(CheckpointError::Length(3)));
        let mut s = Checkpoint::ZERO.encode();
        s.replace_range(0..1, "x");
        assert_eq!(Checkpoint::decode(&s), Err(CheckpointError::Digits));
    }

    #[test]
    fn test_string_order_matches_struct_order() {
        let cases = vec![
            cp(100, 1, 10, 0, EventKind::Transaction, 0),
            cp(100, 1, 10, 0, EventKind::Trace, 0),
            cp(100, 1, 10, 0, EventKind::Log, 2),
            cp(100, 1, 10, 1, EventKind::Transaction, 0),
            cp(100, 1, 10, MAX_FIELD, EventKind::Block, 0),
            cp(100, 2, 9, 0, EventKind::Log, 0),
            cp(101, 1, 11, 0, EventKind::Log, 0),
        ];
        for a in &cases {
            for b in &cases {
                assert_eq!(a.cmp(b), a.encode().cmp(&b.encode()), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_block_events_sort_after_transactions() {
        let tx_log = cp(100, 1, 10, 500, EventKind::Log, 9);
        let block = Checkpoint {
            transaction_index: MAX_FIELD,
            event_kind: EventKind::Block,
            ..tx_log
        };
        assert!(tx_log < block);
        assert!(block <= Checkpoint::block_end(100, 1, 10));
        assert!(Checkpoint::block_start(100, 1, 10) < tx_log);
    }

    #[test]
    fn test_cross_chain_tiebreak_is_chain_id() {
        let a = cp(100, 1, 50, 0, EventKind::Log, 0);
        let b = cp(100, 10, 2, 0, EventKind::Log, 0);
        assert!(a < b);
    }
}
