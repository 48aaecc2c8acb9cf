//! Delivery of new head blocks: WebSocket `newHeads` subscription when the
//! chain has one configured, HTTP polling otherwise. Repeated WebSocket
//! failures demote the chain to polling for the rest of the run.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Block, Header};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::rpc::RpcClient;

const MAX_WS_FAILURES: u32 = 5;
const WS_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Spawn the head-delivery task. Blocks arrive on `sender` fully re-fetched
/// by hash (with transactions) so consumers always see a consistent object.
pub fn spawn(
    chain: ChainConfig,
    client: Arc<RpcClient>,
    sender: mpsc::Sender<Block>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(chain, client, sender, shutdown).await;
    })
}

async fn run(
    chain: ChainConfig,
    client: Arc<RpcClient>,
    sender: mpsc::Sender<Block>,
    shutdown: CancellationToken,
) {
    if let Some(ws_url) = chain.ws.clone() {
        let mut failures = 0u32;
        while failures < MAX_WS_FAILURES && !shutdown.is_cancelled() {
            match run_ws(&chain, &ws_url, &client, &sender, &shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        chain = %chain.name,
                        error = %e,
                        failures,
                        max_failures = MAX_WS_FAILURES,
                        "websocket subscription failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(WS_RETRY_DELAY) => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }
        if !shutdown.is_cancelled() {
            tracing::warn!(
                chain = %chain.name,
                "websocket exhausted retries, falling back to polling"
            );
        }
    }

    run_polling(&chain, &client, &sender, &shutdown).await;
}

/// Subscribe to `newHeads` and deliver each announced block after
/// re-fetching it by hash. Returns `Ok` only on shutdown or a closed
/// consumer; any stream or transport failure is an `Err` for the retry
/// counter.
async fn run_ws(
    chain: &ChainConfig,
    ws_url: &str,
    client: &Arc<RpcClient>,
    sender: &mpsc::Sender<Block>,
    shutdown: &CancellationToken,
) -> eyre::Result<()> {
    let ws = ProviderBuilder::new()
        .connect_ws(WsConnect::new(ws_url.to_string()))
        .await?;
    let provider = ws.root().clone();

    let subscription_id: B256 = provider
        .raw_request("eth_subscribe".into(), ("newHeads",))
        .await?;
    let subscription = provider
        .get_subscription::<Header>(subscription_id)
        .await?;
    let mut stream = subscription.into_stream();

    tracing::info!(chain = %chain.name, "newHeads subscription active");

    loop {
        tokio::select! {
            maybe_header = stream.next() => {
                let Some(header) = maybe_header else {
                    return Err(eyre::eyre!("newHeads stream ended"));
                };
                // The announcement is only a header; re-fetch by hash so the
                // consumer gets a consistent block with its transactions.
                match client.get_block_by_hash(header.hash, true).await {
                    Ok(Some(block)) => {
                        if sender.send(block).await.is_err() {
                            unsubscribe(&provider, subscription_id, &chain.name).await;
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(
                            chain = %chain.name,
                            block = header.number,
                            hash = %header.hash,
                            "announced block not yet retrievable, skipping"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            chain = %chain.name,
                            block = header.number,
                            error = %e,
                            "failed to refetch announced block"
                        );
                    }
                }
            }
            _ = shutdown.cancelled() => {
                unsubscribe(&provider, subscription_id, &chain.name).await;
                return Ok(());
            }
        }
    }
}

async fn unsubscribe<P: Provider>(provider: &P, id: B256, chain: &str) {
    if let Err(e) = provider
        .raw_request::<_, bool>("eth_unsubscribe".into(), (id,))
        .await
    {
        tracing::debug!(chain = %chain, error = %e, "eth_unsubscribe failed");
    }
}

/// Poll `eth_blockNumber` at the chain's interval and deliver new heads.
async fn run_polling(
    chain: &ChainConfig,
    client: &Arc<RpcClient>,
    sender: &mpsc::Sender<Block>,
    shutdown: &CancellationToken,
) {
    let poll_interval = Duration::from_millis(chain.poll_interval_ms);
    let mut last_seen: Option<u64> = None;

    tracing::info!(
        chain = %chain.name,
        poll_interval_ms = chain.poll_interval_ms,
        "polling for new heads"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.cancelled() => return,
        }

        let current = match client.block_number().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(chain = %chain.name, error = %e, "failed to poll block number");
                continue;
            }
        };
        if last_seen.is_some_and(|seen| current <= seen) {
            continue;
        }
        last_seen = Some(current);

        match client.get_block_by_number(current, true).await {
            Ok(Some(block)) => {
                if sender.send(block).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    chain = %chain.name,
                    block = current,
                    error = %e,
                    "failed to fetch polled head"
                );
            }
        }
    }
}
