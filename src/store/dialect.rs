//! The small set of engine differences the stores need to know about. One
//! code path serves PostgreSQL and SQLite; everything else is common SQL.

use alloy::primitives::{Address, B256, U256};

use crate::error::StoreError;

/// Width of a `U256` rendered as zero-padded decimal text. Padding makes
/// string comparison agree with numeric comparison.
pub const U256_TEXT_LEN: usize = 78;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> eyre::Result<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("sqlite://") || url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            Err(eyre::eyre!(
                "unsupported database url '{url}': expected postgres:// or sqlite://"
            ))
        }
    }

    /// Bind-parameter budget per statement; batch writes chunk to stay
    /// under it.
    pub fn max_bind_params(&self) -> usize {
        match self {
            Dialect::Postgres => 65_535,
            Dialect::Sqlite => 32_766,
        }
    }

    /// Page size for id-ordered bulk updates.
    pub fn max_row_limit(&self) -> usize {
        match self {
            Dialect::Postgres => 50_000,
            Dialect::Sqlite => 10_000,
        }
    }

    /// Two-argument minimum in this engine's SQL.
    pub fn least_fn(&self) -> &'static str {
        match self {
            Dialect::Postgres => "LEAST",
            Dialect::Sqlite => "MIN",
        }
    }

    /// Column type for raw byte strings (hashes, addresses, payloads).
    pub fn bytes_type(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BYTEA",
            Dialect::Sqlite => "BLOB",
        }
    }

    /// The `n`-th (1-based) bind placeholder in this engine's syntax.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    /// A `(…)` values tuple of `columns` placeholders starting at 1-based
    /// bind position `start`.
    pub fn values_tuple(&self, start: usize, columns: usize) -> String {
        let parts: Vec<String> = (start..start + columns)
            .map(|n| self.placeholder(n))
            .collect();
        format!("({})", parts.join(", "))
    }

    /// A comma-separated placeholder list for `IN (…)` clauses.
    pub fn placeholder_list(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn encode_u256(value: U256) -> String {
    format!("{value:0>width$}", width = U256_TEXT_LEN)
}

pub fn decode_u256(text: &str) -> Result<U256, StoreError> {
    U256::from_str_radix(text.trim_start_matches('0'), 10)
        .or_else(|e| {
            // all zeros trims to empty
            if text.chars().all(|c| c == '0') && !text.is_empty() {
                Ok(U256::ZERO)
            } else {
                Err(e)
            }
        })
        .map_err(|e| StoreError::Decode(format!("bad u256 text '{text}': {e}")))
}

pub fn encode_b256(value: B256) -> Vec<u8> {
    value.as_slice().to_vec()
}

pub fn decode_b256(bytes: &[u8]) -> Result<B256, StoreError> {
    if bytes.len() != 32 {
        return Err(StoreError::Decode(format!(
            "expected 32 hash bytes, got {}",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(bytes))
}

pub fn encode_address(value: Address) -> Vec<u8> {
    value.as_slice().to_vec()
}

pub fn decode_address(bytes: &[u8]) -> Result<Address, StoreError> {
    if bytes.len() != 20 {
        return Err(StoreError::Decode(format!(
            "expected 20 address bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(bytes))
}

/// Render a trace address path (`[0, 2, 1]`) as its stable key form
/// (`"0.2.1"`, root call `""`).
pub fn encode_trace_address(path: &[u32]) -> String {
    path.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

pub fn decode_trace_address(text: &str) -> Result<Vec<u32>, StoreError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split('.')
        .map(|part| {
            part.parse::<u32>()
                .map_err(|e| StoreError::Decode(format!("bad trace address '{text}': {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(
            Dialect::from_url("postgres://localhost/db").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("sqlite://indexer.db").unwrap(),
            Dialect::Sqlite
        );
        assert!(Dialect::from_url("mysql://localhost/db").is_err());
    }

    #[test]
    fn test_u256_text_roundtrip() {
        for value in [
            U256::ZERO,
            U256::from(1u64),
            U256::from(u64::MAX),
            U256::MAX,
        ] {
            let encoded = encode_u256(value);
            assert_eq!(encoded.len(), U256_TEXT_LEN);
            assert_eq!(decode_u256(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn test_u256_text_order_matches_numeric_order() {
        let values = [
            U256::ZERO,
            U256::from(9u64),
            U256::from(10u64),
            U256::from(u64::MAX),
            U256::from(u128::MAX),
            U256::MAX,
        ];
        for a in &values {
            for b in &values {
                assert_eq!(
                    a.cmp(b),
                    encode_u256(*a).cmp(&encode_u256(*b)),
                    "{a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn test_hash_and_address_roundtrip() {
        let hash = B256::repeat_byte(0x5a);
        assert_eq!(decode_b256(&encode_b256(hash)).unwrap(), hash);
        let address = Address::repeat_byte(0x11);
        assert_eq!(decode_address(&encode_address(address)).unwrap(), address);
        assert!(decode_b256(&[1, 2, 3]).is_err());
        assert!(decode_address(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_placeholder_syntax() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?");
        assert_eq!(Dialect::Postgres.values_tuple(4, 3), "($4, $5, $6)");
        assert_eq!(Dialect::Sqlite.values_tuple(4, 3), "(?, ?, ?)");
        assert_eq!(Dialect::Postgres.placeholder_list(1, 2), "$1, $2");
    }

    #[test]
    fn test_trace_address_roundtrip() {
        for path in [vec![], vec![0], vec![0, 2, 1]] {
            let encoded = encode_trace_address(&path);
            assert_eq!(decode_trace_address(&encoded).unwrap(), path);
        }
        assert_eq!(encode_trace_address(&[0, 2, 1]), "0.2.1");
        assert_eq!(encode_trace_address(&[]), "");
    }
}
