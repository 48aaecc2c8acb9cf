use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chainmirror::config::Config;
use chainmirror::driver::events::{Db, Event, Handler, HandlerRegistry};
use chainmirror::error::IndexingError;
use chainmirror::filter::Filter;
use chainmirror::store::indexing::{Column, ColumnType, Table, UserRow, Value};
use chainmirror::store::sync::EventPayload;

/// The default handler: record every matched event into one generic table.
/// Real deployments register their own handlers through the library.
struct RecordEvent;

#[async_trait]
impl Handler for RecordEvent {
    async fn handle(&self, event: &Event, db: &mut Db<'_>) -> Result<(), IndexingError> {
        let (kind, block_number, address) = match &event.payload {
            EventPayload::Block(b) => ("block", b.number, None),
            EventPayload::Transaction(t) => {
                ("transaction", t.block_number, Some(t.from.as_slice().to_vec()))
            }
            EventPayload::Log(l) => {
                ("log", l.block_number, Some(l.address.as_slice().to_vec()))
            }
            EventPayload::Trace(t) => {
                ("trace", t.block_number, Some(t.from.as_slice().to_vec()))
            }
            EventPayload::Transfer(t) => {
                ("transfer", t.block_number, Some(t.from.as_slice().to_vec()))
            }
        };

        let mut row = UserRow::new();
        row.insert(
            "id".to_string(),
            Value::Text(format!("{}:{}", event.checkpoint.encode(), event.filter_id)),
        );
        row.insert("chain_id".to_string(), Value::Int(event.chain_id as i64));
        row.insert("kind".to_string(), Value::Text(kind.to_string()));
        row.insert("block_number".to_string(), Value::Int(block_number as i64));
        row.insert(
            "address".to_string(),
            address.map_or(Value::Null, Value::Bytes),
        );
        // replay-safe: the id is derived from the checkpoint
        let id = row["id"].clone();
        db.upsert("events", &id, row, |current| current.clone()).await?;
        Ok(())
    }
}

fn events_table() -> eyre::Result<Table> {
    Table::new(
        "events",
        vec![
            Column { name: "id".to_string(), ty: ColumnType::Text, nullable: false },
            Column { name: "chain_id".to_string(), ty: ColumnType::Int, nullable: false },
            Column { name: "kind".to_string(), ty: ColumnType::Text, nullable: false },
            Column { name: "block_number".to_string(), ty: ColumnType::Int, nullable: false },
            Column { name: "address".to_string(), ty: ColumnType::Bytes, nullable: true },
        ],
    )
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!("chainmirror starting");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    tracing::info!(
        chains = config.chains.len(),
        "Configuration loaded from {}",
        config_path
    );

    // Register the default recording handler for every declared filter.
    let mut registry = HandlerRegistry::new();
    let recorder: Arc<RecordEvent> = Arc::new(RecordEvent);
    for chain in &config.chains {
        for filter_config in &chain.filters {
            let filter = Filter::from_config(chain.chain_id, filter_config)?;
            registry.register(chain.chain_id, filter.id(), recorder.clone());
        }
    }

    // Create shutdown signal
    let shutdown = CancellationToken::new();
    let runner_shutdown = shutdown.clone();
    let mut runner = tokio::spawn(async move {
        chainmirror::run(config, registry, vec![events_table()?], runner_shutdown).await
    });

    tracing::info!("Indexer started. Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping...");
            shutdown.cancel();
        }
        result = &mut runner => {
            return result.map_err(|e| eyre::eyre!("indexer task panicked: {e}"))?;
        }
    }

    match runner.await {
        Ok(result) => result?,
        Err(e) if e.is_cancelled() => {}
        Err(e) => return Err(eyre::eyre!("indexer task panicked: {e}")),
    }

    tracing::info!("chainmirror stopped gracefully");
    Ok(())
}
