pub mod dialect;
pub mod indexing;
pub mod sync;

use std::time::Duration;

use crate::error::StoreError;

const DB_RETRY_BASE: Duration = Duration::from_millis(25);
const DB_MAX_RETRIES: u32 = 3;

/// Run a database operation, retrying transient connection failures with
/// exponential backoff. Constraint violations and other classified errors
/// surface immediately.
pub(crate) async fn with_db_retry<T, F, Fut>(operation: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < DB_MAX_RETRIES => {
                let delay = DB_RETRY_BASE * 2u32.pow(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient database error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
