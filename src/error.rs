//! Error types for the rescan engine.

use bitcoin::BlockHash;
use thiserror::Error;

/// Everything a rescan can fail with.
///
/// Configuration variants are returned synchronously from [`crate::Rescan::start`];
/// `Callback` only ever travels over the error channel; the rest terminate the
/// scan task and are returned from [`crate::Rescan::wait`].
#[derive(Debug, Error)]
pub enum RescanError {
    /// `start` was called on a rescan that is already running.
    #[error("rescan already started")]
    AlreadyStarted,

    /// The configured start height is above the best tip.
    #[error("start height {height} is beyond the chain tip {tip}")]
    StartBeyondTip {
        /// Requested start height.
        height: u32,
        /// Best tip height at the time of the call.
        tip: u32,
    },

    /// The configured start block is not on the best chain.
    #[error("start block {hash} is not on the main chain at height {height}")]
    StartHashMismatch {
        /// Requested start height.
        height: u32,
        /// Hash that was expected at that height.
        hash: BlockHash,
    },

    /// A watched address belongs to another network.
    #[error("address not valid for this network: {0}")]
    Address(#[from] bitcoin::address::ParseError),

    /// A chain view call failed or returned undecodable data.
    #[error("chain view error: {0:#}")]
    Chain(#[source] anyhow::Error),

    /// A filter did not hash into the committed filter header chain.
    #[error("filter at height {height} does not commit to the expected filter header")]
    FilterHeaderMismatch {
        /// Height of the offending filter.
        height: u32,
    },

    /// A fetched block was not the one asked for.
    #[error("block at height {height} hashes to {got}, expected {expected}")]
    BlockMismatch {
        /// Height requested.
        height: u32,
        /// Hash requested.
        expected: BlockHash,
        /// Hash of what came back.
        got: BlockHash,
    },

    /// A reorg reached below everything the rescan can rewind to.
    #[error("reorg below height {height} exceeds the rewind horizon of {horizon} blocks; resync required")]
    ReorgTooDeep {
        /// Cursor height when the rewind ran out.
        height: u32,
        /// Configured rewind horizon.
        horizon: u32,
    },

    /// Persisting the cursor failed.
    #[error("store error: {0:#}")]
    Store(#[source] anyhow::Error),

    /// A notification handler returned an error or panicked.
    #[error("{event} handler failed at height {height}: {message}")]
    Callback {
        /// Event kind being delivered.
        event: &'static str,
        /// Height of the event.
        height: u32,
        /// Error or panic message.
        message: String,
    },

    /// The scan task could not be joined.
    #[error("rescan task failed: {0}")]
    TaskFailed(String),

    /// Stopped by `stop`, the quit token or dropping the handle.
    #[error("rescan cancelled")]
    Cancelled,
}

impl RescanError {
    /// Errors worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RescanError::Chain(_)
                | RescanError::FilterHeaderMismatch { .. }
                | RescanError::BlockMismatch { .. }
        )
    }

    /// Errors raised at call time, before any task is spawned.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RescanError::AlreadyStarted
                | RescanError::StartBeyondTip { .. }
                | RescanError::StartHashMismatch { .. }
                | RescanError::Address(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type RescanResult<T> = std::result::Result<T, RescanError>;
