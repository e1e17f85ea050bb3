//! Rescan configuration.
use std::{sync::Arc, time::Duration};

use bitcoin::{address::NetworkUnchecked, Address, BlockHash, Network, OutPoint, ScriptBuf};
use tokio_util::sync::CancellationToken;

use crate::store::Store;

/// Default number of blocks a rescan can rewind on a reorg.
pub const DEFAULT_REORG_HORIZON: u32 = 100;

/// Where a rescan starts. The resolved block is treated as already known:
/// the first block scanned is the one after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPoint {
    /// Start after the genesis block.
    #[default]
    Genesis,
    /// Start after the best-chain block at this height.
    Height(u32),
    /// Start after this exact block, which must be on the best chain.
    Block {
        /// Height of the block.
        height: u32,
        /// Hash the block must have.
        hash: BlockHash,
    },
    /// Start at the first block whose header time is at or after this unix timestamp.
    Time(u32),
}

/// Backoff for transient chain-view failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Give up after this many attempts; `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Immutable description of a rescan, built before [`crate::Rescan::new`].
#[derive(Clone)]
pub struct RescanConfig {
    pub(crate) network: Network,
    pub(crate) start: StartPoint,
    // Explicit start wins over a start time regardless of call order.
    pub(crate) start_time: Option<u32>,
    pub(crate) addresses: Vec<Address<NetworkUnchecked>>,
    pub(crate) scripts: Vec<ScriptBuf>,
    pub(crate) outpoints: Vec<(OutPoint, ScriptBuf)>,
    pub(crate) quit: Option<CancellationToken>,
    pub(crate) reorg_horizon: u32,
    pub(crate) retry: RetryPolicy,
    pub(crate) store: Option<Arc<dyn Store>>,
}

impl RescanConfig {
    /// Defaults for `network`: start after genesis, empty watch-list.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            start: StartPoint::Genesis,
            start_time: None,
            addresses: vec![],
            scripts: vec![],
            outpoints: vec![],
            quit: None,
            reorg_horizon: DEFAULT_REORG_HORIZON,
            retry: RetryPolicy::default(),
            store: None,
        }
    }

    /// Resolve the start from a wall-clock unix timestamp. Ignored if an
    /// explicit height or block is also given.
    pub fn start_time(mut self, unix_time: u32) -> Self {
        self.start_time = Some(unix_time);
        self
    }

    /// Resume after the best-chain block at `height`.
    pub fn start_height(mut self, height: u32) -> Self {
        self.start = StartPoint::Height(height);
        self
    }

    /// Resume after the exact block `hash` at `height`.
    pub fn start_block(mut self, height: u32, hash: BlockHash) -> Self {
        self.start = StartPoint::Block { height, hash };
        self
    }

    /// Initial watched addresses.
    pub fn watch_addresses(mut self, addrs: impl IntoIterator<Item = Address<NetworkUnchecked>>) -> Self {
        self.addresses.extend(addrs);
        self
    }

    /// Initial watched output scripts.
    pub fn watch_scripts(mut self, scripts: impl IntoIterator<Item = ScriptBuf>) -> Self {
        self.scripts.extend(scripts);
        self
    }

    /// Initial watched outpoints, each with the script it locks.
    pub fn watch_outpoints(mut self, outpoints: impl IntoIterator<Item = (OutPoint, ScriptBuf)>) -> Self {
        self.outpoints.extend(outpoints);
        self
    }

    /// External cancellation. Cancelling it stops the rescan like [`crate::Rescan::stop`].
    pub fn quit(mut self, token: CancellationToken) -> Self {
        self.quit = Some(token);
        self
    }

    /// Deepest reorg the rescan rewinds through before giving up.
    pub fn reorg_horizon(mut self, blocks: u32) -> Self {
        self.reorg_horizon = blocks;
        self
    }

    /// Backoff for transient failures.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Persist the cursor after every scanned block.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// The start point after precedence is applied.
    pub fn effective_start(&self) -> StartPoint {
        match (self.start, self.start_time) {
            (StartPoint::Genesis, Some(t)) => StartPoint::Time(t),
            (start, _) => start,
        }
    }
}
