//! Persistence of rescan progress so a cancelled or crashed rescan can resume
//! exactly where it stopped.
use async_trait::async_trait;

use crate::chain::ChainTip;

/// Minimal persistence interface. No secrets — just the cursor.
#[async_trait]
pub trait Store: Send + Sync {
    /// Last block whose events were fully delivered, if any.
    async fn load_cursor(&self) -> anyhow::Result<Option<ChainTip>>;

    /// Record the cursor. Called after every delivered block and after rewinds.
    async fn save_cursor(&self, cursor: ChainTip) -> anyhow::Result<()>;
}

// submodules / concrete stores live here
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
