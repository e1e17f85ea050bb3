#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! niebla-rescan: a compact-filter (BIP-157/158) rescan engine for wallets.
//!
//! ## What you implement
//! - [`ChainView`]: best-chain headers with filter headers, per-block filters,
//!   raw blocks, and a broadcast of connect/disconnect events.
//! - [`RescanHandlers`]: the notification slots you care about (all default to no-ops).
//! - Optionally a [`Store`] to persist the cursor ([`SqliteStore`] ships with
//!   the `store-sqlite` feature).
//!
//! ## What the engine does
//! - Resolves a start point (block, height, timestamp or genesis).
//! - Replays history: per block, verifies the **filter** against its committed
//!   filter header, tests it against a snapshot of your **watch-list**, and on a
//!   hit fetches the **block** and finds the exact transactions.
//! - Switches to following the tip once caught up.
//! - Rewinds on **reorgs**, notifying disconnects before replaying the new branch.
//! - Delivers [`RescanEvent`]s in order, one handler call at a time.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use niebla_rescan::prelude::*;
//! use std::sync::Arc;
//!
//! struct Printer;
//! #[async_trait::async_trait]
//! impl RescanHandlers for Printer {
//!     async fn on_block_connected(
//!         &self, hash: bitcoin::BlockHash, height: u32, _time: u32,
//!     ) -> anyhow::Result<()> {
//!         println!("{height} {hash}");
//!         Ok(())
//!     }
//! }
//!
//! async fn run(chain: Arc<impl ChainView + 'static>) -> anyhow::Result<()> {
//!     let config = RescanConfig::new(bitcoin::Network::Regtest).start_time(1_700_000_000);
//!     let rescan = Rescan::new(chain, config, Arc::new(Printer))?;
//!     rescan.start().await?;
//!     rescan.caught_up().await;
//!     rescan.watch_list().add_script(bitcoin::ScriptBuf::new());
//!     rescan.stop();
//!     rescan.wait().await?;
//!     Ok(())
//! }
//! ```
/// Chain collaborator interface and chain position types.
pub mod chain;

/// Rescan configuration and start points.
pub mod config;

/// Error taxonomy.
pub mod error;

/// Notification events and handler slots.
pub mod hooks;

/// Tracing subscriber setup.
pub mod logging;

/// Filter and block matching.
pub mod matcher;

/// The caller-facing rescan handle.
pub mod rescan;

/// Watched scripts and outpoints.
pub mod watchlist;

/// Persistence layer (traits and SQLite implementation).
pub mod store;

// Internal helpers:
mod cfheaders;
mod dispatcher;
mod engine;
mod retry;

// Public re-exports
pub use chain::{ChainEvent, ChainTip, ChainView, IndexedHeader};
pub use config::{RescanConfig, RetryPolicy, StartPoint};
pub use engine::RescanState;
pub use error::{RescanError, RescanResult};
pub use hooks::{NoopHandlers, RescanEvent, RescanHandlers};
pub use rescan::{Rescan, RescanUpdate};
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::Store;
pub use watchlist::{WatchList, WatchSnapshot};

/// Filter-header helpers, public so chain view implementations can build and
/// check BIP-157 filter header chains.
pub mod filter_header {
    pub use crate::cfheaders::{next_filter_header, verify_filter};
}

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        ChainEvent, ChainTip, ChainView, IndexedHeader, NoopHandlers, Rescan, RescanConfig,
        RescanError, RescanEvent, RescanHandlers, RescanState, RescanUpdate, RetryPolicy,
        StartPoint, Store, WatchList,
    };
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteStore;
}
