//! chainmirror: a multi-chain EVM indexer. It mirrors the on-chain data
//! matched by declared filters into a relational database, dispatches
//! events to handlers in one deterministic cross-chain order, and keeps the
//! database consistent across chain reorganizations.

pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod filter;
pub mod interval;
pub mod metrics;
pub mod rpc;
pub mod runner;
pub mod store;
pub mod sync;
pub mod types;

pub use checkpoint::{Checkpoint, EventKind};
pub use config::Config;
pub use driver::events::{Db, Event, Handler, HandlerRegistry, SetupHandler};
pub use error::{IndexingError, RpcClientError, StoreError, SyncError};
pub use interval::Interval;
pub use runner::run;
