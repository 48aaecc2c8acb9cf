//! Wiring: database, per-chain clients and sync tasks, and the omnichain
//! driver, joined under one cancellation token.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sqlx::any::AnyPoolOptions;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::config::{ChainConfig, Config};
use crate::driver::events::HandlerRegistry;
use crate::driver::{ChainRuntime, Driver, SyncProgress};
use crate::error::SyncError;
use crate::filter::fragment;
use crate::filter::{ChildAddresses, Filter};
use crate::interval::Interval;
use crate::metrics::Metrics;
use crate::rpc::{heads, RpcClient};
use crate::store::dialect::Dialect;
use crate::store::indexing::{IndexingStore, Table};
use crate::store::sync::SyncStore;
use crate::sync::historical::HistoricalSync;
use crate::sync::realtime::{initial_finalized, RealtimeEvent, RealtimeSync, RpcBlockSource};

const REALTIME_CHANNEL: usize = 1024;
const HEADS_CHANNEL: usize = 64;

/// Run the indexer until shutdown: schema, per-chain sync, historical
/// dispatch, then realtime dispatch.
pub async fn run(
    config: Config,
    registry: HandlerRegistry,
    tables: Vec<Table>,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let dialect = Dialect::from_url(&config.database.url)?;
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;
    tracing::info!(dialect = ?dialect, "Connected to database");

    let sync_store = Arc::new(SyncStore::new(pool.clone(), dialect));
    sync_store.create_schema().await?;
    let indexing_store = Arc::new(IndexingStore::new(pool.clone(), dialect, tables));
    indexing_store.create_schema().await?;
    sync_store
        .set_meta(
            "build",
            &serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
        )
        .await?;
    tracing::info!("Schema ready");

    let metrics = Arc::new(Metrics::default());
    let registry = Arc::new(registry);

    // Per-chain wiring: filters, clients, shared child-address maps.
    let mut runtimes = Vec::new();
    let mut chain_parts = Vec::new();
    for chain in &config.chains {
        let filters: Vec<Filter> = chain
            .filters
            .iter()
            .map(|f| Filter::from_config(chain.chain_id, f))
            .collect::<eyre::Result<_>>()?;
        let filters = Arc::new(filters);
        let client = Arc::new(RpcClient::new(chain, shutdown.clone(), Arc::clone(&metrics))?);

        let mut children = ChildAddresses::default();
        for filter in filters.iter() {
            if let Some(factory) = filter.factory() {
                for (address, block) in sync_store.get_child_addresses(&factory.id).await? {
                    children.insert(&factory.id, address, block);
                }
            }
        }
        let children = Arc::new(RwLock::new(children));

        runtimes.push(ChainRuntime {
            config: chain.clone(),
            filters: Arc::clone(&filters),
            children: Arc::clone(&children),
            client: Arc::clone(&client),
        });
        chain_parts.push((chain.clone(), client, filters, children));
    }

    let driver = Driver::new(
        Arc::clone(&sync_store),
        Arc::clone(&indexing_store),
        Arc::clone(&registry),
        runtimes,
        Arc::clone(&metrics),
        shutdown.clone(),
    );
    let rows = driver.ensure_setup().await?;

    // Spawn one sync task per chain: backfill to the finalized tip, then
    // live tail with reorg reconciliation.
    let (realtime_tx, realtime_rx) = mpsc::channel::<RealtimeEvent>(REALTIME_CHANNEL);
    let mut watermarks = HashMap::new();
    let mut handles = Vec::new();
    for (chain, client, filters, children) in chain_parts {
        let (progress_tx, progress_rx) = watch::channel(SyncProgress {
            through: rows[&chain.chain_id].safe,
            complete: false,
        });
        watermarks.insert(chain.chain_id, progress_rx);

        let sync_store = Arc::clone(&sync_store);
        let metrics = Arc::clone(&metrics);
        let shutdown = shutdown.clone();
        let realtime_tx = realtime_tx.clone();
        let chain_name = chain.name.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_chain(
                chain, client, sync_store, filters, children, progress_tx, realtime_tx,
                metrics, shutdown,
            )
            .await
            {
                tracing::error!(chain = %chain_name, error = %e, "Chain sync failed");
            }
        });
        handles.push(handle);
    }
    drop(realtime_tx);

    // Historical events first, strictly checkpoint-ordered across chains;
    // then the realtime stream in production order.
    driver.run_historical(&rows, watermarks).await?;
    if !shutdown.is_cancelled() {
        driver.run_realtime(&rows, realtime_rx).await?;
    }

    for handle in handles {
        let _ = handle.await;
    }
    metrics.log_summary();
    Ok(())
}

/// One chain's producer side: verify the endpoint, backfill to the
/// finalized tip, hand the tail to realtime sync.
#[allow(clippy::too_many_arguments)]
async fn run_chain(
    chain: ChainConfig,
    client: Arc<RpcClient>,
    sync_store: Arc<SyncStore>,
    filters: Arc<Vec<Filter>>,
    children: Arc<RwLock<ChildAddresses>>,
    progress_tx: watch::Sender<SyncProgress>,
    realtime_tx: mpsc::Sender<RealtimeEvent>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<(), SyncError> {
    let reported = client.remote_chain_id().await?;
    if reported != chain.chain_id {
        tracing::warn!(
            chain = %chain.name,
            configured = chain.chain_id,
            reported,
            "endpoint reports a different chain id"
        );
    }

    backfill(&chain, &client, &sync_store, &filters, &children, &progress_tx, &shutdown)
        .await?;
    if shutdown.is_cancelled() {
        return Ok(());
    }

    tracing::info!(chain = %chain.name, "Switching to live indexing");
    let source = Arc::new(RpcBlockSource::new(Arc::clone(&client)));
    let realtime = RealtimeSync::initialize(
        chain.clone(),
        source,
        sync_store,
        filters,
        children,
        realtime_tx,
        metrics,
        shutdown.clone(),
    )
    .await?;

    let (head_tx, head_rx) = mpsc::channel(HEADS_CHANNEL);
    let heads_task = heads::spawn(chain.clone(), client, head_tx, shutdown.clone());
    let result = realtime.run(head_rx).await;
    heads_task.abort();
    result
}

/// Backfill all filters to the moving finalized tip, publishing the
/// dispatchable watermark after each completed range. Exits `complete`
/// once no new finalized blocks appeared during the last pass.
async fn backfill(
    chain: &ChainConfig,
    client: &Arc<RpcClient>,
    sync_store: &Arc<SyncStore>,
    filters: &Arc<Vec<Filter>>,
    children: &Arc<RwLock<ChildAddresses>>,
    progress_tx: &watch::Sender<SyncProgress>,
    shutdown: &CancellationToken,
) -> Result<(), SyncError> {
    let historical = HistoricalSync::new(
        chain.clone(),
        Arc::clone(client),
        Arc::clone(sync_store),
        Arc::clone(filters),
        Arc::clone(children),
        shutdown.clone(),
    );

    let start = filters.iter().map(Filter::from_block).min().unwrap_or(0);

    // restart resume point: the closest-to-tip block every filter has fully
    // cached; everything at or below it is already synced
    let mut synced_through: Option<u64> = if chain.cache {
        let fragment_ids: Vec<String> = filters
            .iter()
            .flat_map(|f| fragment::fragments(f))
            .map(|f| f.id)
            .collect();
        let cached = sync_store.get_intervals(&fragment_ids).await?;
        let resume = fragment::cached_block(&filters, &cached);
        if let Some(block) = resume {
            tracing::info!(chain = %chain.name, resume_from = block + 1, "Resuming from cached progress");
        }
        resume
    } else {
        None
    };

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let latest = client.block_number().await?;
        let tip = initial_finalized(latest, chain.finality_depth);
        let from = synced_through.map_or(start, |t| t + 1);
        if from > tip {
            break;
        }

        tracing::info!(chain = %chain.name, from, to = tip, "Backfilling block range");
        historical.sync_range(Interval::new(from, tip)).await?;

        let tip_block = client
            .get_block_by_number(tip, false)
            .await?
            .ok_or_else(|| SyncError::Validation(format!("finalized block {tip} missing")))?;
        let through =
            Checkpoint::block_end(tip_block.header.timestamp, chain.chain_id, tip);
        let _ = progress_tx.send(SyncProgress { through, complete: false });
        synced_through = Some(tip);
    }

    let through = progress_tx.borrow().through;
    let _ = progress_tx.send(SyncProgress { through, complete: true });
    tracing::info!(chain = %chain.name, "Backfill complete");
    Ok(())
}
