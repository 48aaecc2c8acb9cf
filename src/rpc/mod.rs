mod bucket;
pub mod heads;
pub mod range;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::network::Ethereum;
use alloy::primitives::B256;
use alloy::providers::ext::DebugApi;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::trace::geth::{
    GethDebugBuiltInTracerType, GethDebugTracerType, GethDebugTracingOptions, TraceResult,
};
use alloy::rpc::types::{Block, Filter as WireFilter, Log, TransactionReceipt};
use alloy::transports::{TransportError, TransportErrorKind};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::error::RpcClientError;
use crate::interval::Interval;
use crate::metrics::Metrics;
use bucket::Bucket;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 9;
const RETRY_BASE: Duration = Duration::from_millis(125);
/// Sleep between scans when every bucket is saturated or penalized.
const SCAN_SLEEP: Duration = Duration::from_millis(10);
/// Probability of picking a random available bucket instead of the best one.
const EXPLORE_EPSILON: f64 = 0.1;
/// A challenger must beat the incumbent's latency by this fraction.
const LATENCY_HURDLE: f64 = 0.10;
/// Request-level concurrency per chain, across all buckets.
const CHAIN_CONCURRENCY: usize = 25;

/// Adaptive multi-endpoint JSON-RPC client for one chain. Every typed
/// method funnels through the same scheduled, retried, classified path.
pub struct RpcClient {
    pub chain_id: u64,
    pub chain_name: String,
    buckets: Vec<Arc<Bucket>>,
    /// Index of the bucket currently considered best.
    preferred: AtomicUsize,
    permits: Semaphore,
    shutdown: CancellationToken,
    metrics: Arc<Metrics>,
}

impl RpcClient {
    pub fn new(
        chain: &ChainConfig,
        shutdown: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> eyre::Result<Self> {
        let buckets = chain
            .rpc
            .iter()
            .map(|url| Bucket::new(url).map(Arc::new))
            .collect::<eyre::Result<Vec<_>>>()?;
        Ok(RpcClient {
            chain_id: chain.chain_id,
            chain_name: chain.name.clone(),
            buckets,
            preferred: AtomicUsize::new(0),
            permits: Semaphore::new(CHAIN_CONCURRENCY),
            shutdown,
            metrics,
        })
    }

    /// `eth_chainId` from whichever bucket serves it; used to verify the
    /// configured id against the endpoints.
    pub async fn remote_chain_id(&self) -> Result<u64, RpcClientError> {
        self.execute("eth_chainId", None, |p| async move { p.get_chain_id().await })
            .await
    }

    pub async fn block_number(&self) -> Result<u64, RpcClientError> {
        self.execute("eth_blockNumber", None, |p| async move {
            p.get_block_number().await
        })
        .await
    }

    pub async fn get_block_by_number(
        &self,
        number: u64,
        full: bool,
    ) -> Result<Option<Block>, RpcClientError> {
        self.execute("eth_getBlockByNumber", None, move |p| async move {
            let request = p.get_block_by_number(number.into());
            let request = if full { request.full() } else { request };
            request.await
        })
        .await
    }

    pub async fn get_block_by_hash(
        &self,
        hash: B256,
        full: bool,
    ) -> Result<Option<Block>, RpcClientError> {
        self.execute("eth_getBlockByHash", None, move |p| async move {
            let request = p.get_block_by_hash(hash);
            let request = if full { request.full() } else { request };
            request.await
        })
        .await
    }

    /// Fetch logs for `range`. A recognized provider range rejection is
    /// surfaced as [`RpcClientError::LogRange`] without local retry so the
    /// caller's range adapter can resplit.
    pub async fn get_logs(
        &self,
        filter: &WireFilter,
        range: Interval,
    ) -> Result<Vec<Log>, RpcClientError> {
        let filter = filter.clone().from_block(range.lo).to_block(range.hi);
        self.execute("eth_getLogs", Some(range), move |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await }
        })
        .await
    }

    /// Logs of a single block addressed by hash, so a concurrent reorg
    /// cannot swap the block out from under the query.
    pub async fn get_logs_by_block_hash(&self, hash: B256) -> Result<Vec<Log>, RpcClientError> {
        self.execute("eth_getLogs", None, move |p| async move {
            let filter = WireFilter::new().at_block_hash(hash);
            p.get_logs(&filter).await
        })
        .await
    }

    pub async fn get_block_receipts(
        &self,
        number: u64,
    ) -> Result<Option<Vec<TransactionReceipt>>, RpcClientError> {
        self.execute("eth_getBlockReceipts", None, move |p| async move {
            p.get_block_receipts(number.into()).await
        })
        .await
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcClientError> {
        self.execute("eth_getTransactionReceipt", None, move |p| async move {
            p.get_transaction_receipt(hash).await
        })
        .await
    }

    pub async fn trace_block(&self, number: u64) -> Result<Vec<TraceResult>, RpcClientError> {
        let options = GethDebugTracingOptions::default().with_tracer(
            GethDebugTracerType::BuiltInTracer(GethDebugBuiltInTracerType::CallTracer),
        );
        self.execute("debug_traceBlockByNumber", None, move |p| {
            let options = options.clone();
            async move { p.debug_trace_block_by_number(number.into(), options).await }
        })
        .await
    }

    /// Scheduled, retried execution of one request against the chosen
    /// bucket's provider.
    async fn execute<T, F, Fut>(
        &self,
        method: &'static str,
        log_range: Option<Interval>,
        call: F,
    ) -> Result<T, RpcClientError>
    where
        F: Fn(RootProvider<Ethereum>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RpcClientError::Shutdown)?;
        Metrics::incr(&self.metrics.rpc_requests);

        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(RpcClientError::Shutdown);
            }
            let index = self.pick_bucket().await?;
            let bucket = &self.buckets[index];

            let started = Instant::now();
            bucket.begin_request(started);
            let outcome = tokio::time::timeout(REQUEST_TIMEOUT, call(bucket.provider.clone())).await;
            let latency = started.elapsed();

            let error = match outcome {
                Ok(Ok(value)) => {
                    bucket.record_success(latency, Instant::now());
                    return Ok(value);
                }
                Ok(Err(transport)) => classify(method, &bucket.host, transport),
                Err(_) => RpcClientError::Timeout {
                    method,
                    timeout: REQUEST_TIMEOUT,
                },
            };

            let rate_limited = error.is_rate_limit();
            bucket.record_failure(latency, rate_limited, Instant::now());
            if rate_limited {
                Metrics::incr(&self.metrics.rpc_rate_limited);
            }

            // eth_getLogs: a recognized range complaint beats the generic
            // retry schedule.
            if let Some(requested) = log_range {
                if let Some(message) = error_text(&error) {
                    if let Some(suggested) = range::suggest_ranges(message, requested) {
                        tracing::debug!(
                            chain = %self.chain_name,
                            host = %bucket.host,
                            requested = %requested,
                            parts = suggested.len(),
                            "provider rejected log range, resplitting"
                        );
                        return Err(RpcClientError::LogRange { suggested });
                    }
                }
            }

            tracing::warn!(
                chain = %self.chain_name,
                host = %bucket.host,
                method,
                attempt = attempt + 1,
                duration_ms = latency.as_millis() as u64,
                error = %error,
                "rpc request failed"
            );

            if !error.is_retryable() || attempt >= MAX_RETRIES {
                Metrics::incr(&self.metrics.rpc_failures);
                return Err(error);
            }

            Metrics::incr(&self.metrics.rpc_retries);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=100));
            let delay = RETRY_BASE * 2u32.pow(attempt) + jitter;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Err(RpcClientError::Shutdown),
            }
            attempt += 1;
        }
    }

    /// Choose a bucket: ε-greedy over the available set, otherwise keep the
    /// incumbent unless a challenger clears the latency hurdle.
    async fn pick_bucket(&self) -> Result<usize, RpcClientError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(RpcClientError::Shutdown);
            }
            let now = Instant::now();
            let available: Vec<usize> = (0..self.buckets.len())
                .filter(|&i| self.buckets[i].is_available(now))
                .collect();

            if available.is_empty() {
                tokio::time::sleep(SCAN_SLEEP).await;
                continue;
            }
            if available.len() == 1 {
                return Ok(available[0]);
            }

            if rand::thread_rng().gen::<f64>() < EXPLORE_EPSILON {
                let pick = available[rand::thread_rng().gen_range(0..available.len())];
                return Ok(pick);
            }

            let challenger = *available
                .iter()
                .min_by(|&&a, &&b| {
                    let la = self.buckets[a].average_latency().unwrap_or(Duration::ZERO);
                    let lb = self.buckets[b].average_latency().unwrap_or(Duration::ZERO);
                    la.cmp(&lb).then_with(|| {
                        self.buckets[a]
                            .active_connections()
                            .cmp(&self.buckets[b].active_connections())
                    })
                })
                .unwrap_or(&available[0]);

            let incumbent = self.preferred.load(Ordering::Relaxed);
            if !available.contains(&incumbent) {
                self.preferred.store(challenger, Ordering::Relaxed);
                return Ok(challenger);
            }
            if challenger == incumbent {
                return Ok(incumbent);
            }

            let incumbent_latency = self.buckets[incumbent]
                .average_latency()
                .unwrap_or(Duration::ZERO);
            let challenger_latency = self.buckets[challenger]
                .average_latency()
                .unwrap_or(Duration::ZERO);
            if challenger_latency.as_secs_f64()
                < incumbent_latency.as_secs_f64() * (1.0 - LATENCY_HURDLE)
            {
                self.preferred.store(challenger, Ordering::Relaxed);
                return Ok(challenger);
            }
            return Ok(incumbent);
        }
    }
}

fn classify(method: &'static str, host: &str, err: TransportError) -> RpcClientError {
    match err {
        TransportError::ErrorResp(payload) => RpcClientError::Request {
            method,
            code: payload.code,
            message: payload.message.to_string(),
        },
        TransportError::Transport(TransportErrorKind::HttpError(http)) => RpcClientError::Http {
            method,
            status: http.status,
            host: host.to_string(),
        },
        other => RpcClientError::Transport {
            method,
            message: other.to_string(),
        },
    }
}

fn error_text(err: &RpcClientError) -> Option<&str> {
    match err {
        RpcClientError::Request { message, .. } => Some(message),
        RpcClientError::Transport { message, .. } => Some(message),
        _ => None,
    }
}
