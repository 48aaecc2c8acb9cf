use std::time::Duration;

use crate::interval::Interval;

/// Classified outcome of a JSON-RPC request.
#[derive(Debug, thiserror::Error)]
pub enum RpcClientError {
    #[error("{method} failed with rpc error {code}: {message}")]
    Request {
        method: &'static str,
        code: i64,
        message: String,
    },

    #[error("{method} returned http {status} from {host}")]
    Http {
        method: &'static str,
        status: u16,
        host: String,
    },

    #[error("{method} timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },

    /// The provider rejected an `eth_getLogs` range and the error message
    /// yielded a smaller range to retry with. Propagated unchanged so the
    /// caller's range adapter can resplit.
    #[error("eth_getLogs range rejected; retry with {} sub-range(s)", suggested.len())]
    LogRange { suggested: Vec<Interval> },

    #[error("{method} transport error: {message}")]
    Transport {
        method: &'static str,
        message: String,
    },

    #[error("shutdown in progress")]
    Shutdown,
}

impl RpcClientError {
    /// Whether the generic retry schedule applies. Range errors are handled
    /// by the log-range adapter, not retried verbatim.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Parse, method-not-found, method-not-supported, JSON-RPC
            // version, and revert never succeed on retry.
            RpcClientError::Request { code, .. } => {
                !matches!(code, -32700 | -32601 | -32004 | -32006 | 3)
            }
            RpcClientError::Http { status, .. } => !matches!(status, 404 | 405 | 501 | 505),
            RpcClientError::Timeout { .. } | RpcClientError::Transport { .. } => true,
            RpcClientError::LogRange { .. } | RpcClientError::Shutdown => false,
        }
    }

    /// Whether the serving endpoint should be deactivated and its learned
    /// rate limit lowered.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            RpcClientError::Http { status, .. } => *status == 429,
            // -32005 is the conventional "limit exceeded" JSON-RPC code.
            RpcClientError::Request { code, .. } => *code == -32005,
            RpcClientError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn method_not_supported(&self) -> bool {
        matches!(
            self,
            RpcClientError::Request { code: -32601 | -32004, .. }
                | RpcClientError::Http { status: 404 | 405 | 501, .. }
        )
    }
}

/// Database failures, with constraint violations split out so callers can
/// classify user-write errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("not-null constraint violated: {0}")]
    NotNullViolation(String),

    #[error("check constraint violated: {0}")]
    CheckViolation(String),

    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error(transparent)]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            let detail = db
                .constraint()
                .map(str::to_owned)
                .unwrap_or_else(|| db.message().to_owned());
            return match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation => StoreError::UniqueViolation(detail),
                sqlx::error::ErrorKind::NotNullViolation => StoreError::NotNullViolation(detail),
                sqlx::error::ErrorKind::CheckViolation => StoreError::CheckViolation(detail),
                _ => StoreError::Database(err),
            };
        }
        StoreError::Database(err)
    }

    /// Connection-level failures worth a bounded retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Database(sqlx::Error::Io(_))
                | StoreError::Database(sqlx::Error::PoolTimedOut)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::from_sqlx(err)
    }
}

/// Failures raised by user handler code or by writes made on its behalf.
#[derive(Debug, thiserror::Error)]
pub enum IndexingError {
    /// The handler read an event field its filter did not fetch; the driver
    /// refetches with the field included and retries the batch once.
    #[error("event field `{field}` was not fetched for this filter")]
    InvalidEventAccess { field: String },

    #[error("record not found in `{table}` for id `{id}`")]
    NotFound { table: String, id: String },

    #[error("retryable: {0}")]
    Retryable(String),

    #[error("{0}")]
    NonRetryable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IndexingError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexingError::Retryable(_) => true,
            IndexingError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Chain-level sync failures.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The canonical chain's ancestor walk passed the finalized block.
    /// Fatal for the chain; operator intervention required.
    #[error("deep reorg on chain {chain_id}: no common ancestor above finalized block {finalized_block} (minimum depth {minimum_depth})")]
    DeepReorg {
        chain_id: u64,
        finalized_block: u64,
        minimum_depth: u64,
    },

    #[error("block validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Rpc(#[from] RpcClientError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_retryable_rpc_codes_short_circuit() {
        for code in [-32700, -32601, -32004, -32006, 3] {
            let err = RpcClientError::Request { method: "eth_call", code, message: String::new() };
            assert!(!err.is_retryable(), "code {code} must not retry");
        }
        let err = RpcClientError::Request { method: "eth_call", code: -32000, message: String::new() };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_non_retryable_http_statuses() {
        for status in [404, 405, 501, 505] {
            let err = RpcClientError::Http { method: "eth_getLogs", status, host: "rpc".into() };
            assert!(!err.is_retryable());
        }
        let err = RpcClientError::Http { method: "eth_getLogs", status: 429, host: "rpc".into() };
        assert!(err.is_retryable());
        assert!(err.is_rate_limit());
    }

    #[test]
    fn test_timeout_counts_as_rate_limit_signal() {
        let err = RpcClientError::Timeout {
            method: "eth_getBlockByNumber",
            timeout: Duration::from_secs(5),
        };
        assert!(err.is_retryable());
        assert!(err.is_rate_limit());
    }
}
