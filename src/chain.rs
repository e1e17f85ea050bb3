//! The chain collaborator: best chain headers, committed filters, blocks and
//! connect/disconnect announcements. Backed by a P2P node, a header store or
//! (in tests) an in-memory chain.
use async_trait::async_trait;
use bitcoin::{bip158::FilterHeader, block::Header as BlockHeader, BlockHash};
use tokio::sync::broadcast;

/// Position of a block on a branch together with its committed filter header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainTip {
    /// Height of the block.
    pub height: u32,
    /// Hash of the block.
    pub block_hash: BlockHash,
    /// BIP-157 filter header committing to this block's basic filter.
    pub filter_header: FilterHeader,
}

/// A block header at a known height on the best chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedHeader {
    /// Height of the block.
    pub height: u32,
    /// The 80-byte header.
    pub header: BlockHeader,
    /// BIP-157 filter header for the block.
    pub filter_header: FilterHeader,
}

impl IndexedHeader {
    /// Hash of the header.
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// Header timestamp (unix seconds).
    pub fn time(&self) -> u32 {
        self.header.time
    }

    /// Project to a [`ChainTip`].
    pub fn tip(&self) -> ChainTip {
        ChainTip {
            height: self.height,
            block_hash: self.block_hash(),
            filter_header: self.filter_header,
        }
    }
}

/// Best-chain changes announced by the chain view.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was appended to the best chain.
    BlockConnected(IndexedHeader),
    /// A block left the best chain. `reorg_depth` counts the blocks being
    /// replaced by the reorg this disconnect belongs to.
    BlockDisconnected {
        /// The block that was disconnected.
        header: IndexedHeader,
        /// Number of blocks replaced by this reorg.
        reorg_depth: u32,
    },
}

/// Read access to the best chain, shared by every running rescan.
///
/// The view is authoritative: whatever branch it reports is the chain the
/// rescans follow. Filter and block lookups carry the expected hash so an
/// implementation can refuse to answer for a block that left the chain.
#[async_trait]
pub trait ChainView: Send + Sync {
    /// Current best tip.
    async fn current_tip(&self) -> anyhow::Result<ChainTip>;

    /// Header at an exact height of the best chain.
    async fn header_at(&self, height: u32) -> anyhow::Result<IndexedHeader>;

    /// Raw BIP-158 basic filter bytes for the block `hash` at `height`.
    async fn filter_at(&self, height: u32, hash: BlockHash) -> anyhow::Result<Vec<u8>>;

    /// Raw consensus-encoded block bytes for `hash` at `height` (used after a filter hit).
    async fn block_at(&self, height: u32, hash: BlockHash) -> anyhow::Result<Vec<u8>>;

    /// Subscribe to connect/disconnect announcements from now on.
    fn subscribe(&self) -> broadcast::Receiver<ChainEvent>;
}
