//! Caller glue: typed notification events and the handler slots they are delivered to.
use async_trait::async_trait;
use bitcoin::{block::Header as BlockHeader, BlockHash, Transaction};

/// One notification produced by a rescan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescanEvent {
    /// A block was scanned, whether or not it matched.
    BlockConnected {
        /// Block height.
        height: u32,
        /// Block hash.
        hash: BlockHash,
        /// Header timestamp.
        time: u32,
    },
    /// A scanned block contained relevant transactions.
    FilteredBlockConnected {
        /// Block height.
        height: u32,
        /// Block hash.
        hash: BlockHash,
        /// Header timestamp.
        time: u32,
        /// The block header.
        header: BlockHeader,
        /// Relevant transactions, in block order.
        txs: Vec<Transaction>,
    },
    /// A previously connected block left the followed chain.
    BlockDisconnected {
        /// Block height.
        height: u32,
        /// Block hash.
        hash: BlockHash,
        /// Header timestamp.
        time: u32,
    },
    /// A relevant transaction, delivered before its block's connect events.
    TransactionDetails {
        /// Height of the containing block.
        height: u32,
        /// Hash of the containing block.
        hash: BlockHash,
        /// Header timestamp.
        time: u32,
        /// The transaction.
        tx: Transaction,
    },
    /// Historical replay reached the tip; live following starts.
    RescanFinished {
        /// Tip height.
        height: u32,
        /// Tip hash.
        hash: BlockHash,
        /// Header timestamp of the tip.
        time: u32,
    },
}

impl RescanEvent {
    /// Height the event refers to.
    pub fn height(&self) -> u32 {
        match self {
            RescanEvent::BlockConnected { height, .. }
            | RescanEvent::FilteredBlockConnected { height, .. }
            | RescanEvent::BlockDisconnected { height, .. }
            | RescanEvent::TransactionDetails { height, .. }
            | RescanEvent::RescanFinished { height, .. } => *height,
        }
    }

    /// Hash of the block the event refers to.
    pub fn hash(&self) -> BlockHash {
        match self {
            RescanEvent::BlockConnected { hash, .. }
            | RescanEvent::FilteredBlockConnected { hash, .. }
            | RescanEvent::BlockDisconnected { hash, .. }
            | RescanEvent::TransactionDetails { hash, .. }
            | RescanEvent::RescanFinished { hash, .. } => *hash,
        }
    }

    /// Short name, used in logs and callback errors.
    pub fn kind(&self) -> &'static str {
        match self {
            RescanEvent::BlockConnected { .. } => "block_connected",
            RescanEvent::FilteredBlockConnected { .. } => "filtered_block_connected",
            RescanEvent::BlockDisconnected { .. } => "block_disconnected",
            RescanEvent::TransactionDetails { .. } => "transaction_details",
            RescanEvent::RescanFinished { .. } => "rescan_finished",
        }
    }
}

/// Notification handlers. Every slot defaults to a no-op, so implement only
/// what you need.
///
/// Calls are serialized per rescan: the next one starts only after the
/// previous returned. Slow handlers slow the scan down. Errors and panics are
/// reported on [`crate::Rescan::errors`] and never stop the scan.
#[async_trait]
pub trait RescanHandlers: Send + Sync {
    /// A block was scanned.
    async fn on_block_connected(
        &self,
        _hash: BlockHash,
        _height: u32,
        _time: u32,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A block with relevant transactions was scanned.
    async fn on_filtered_block_connected(
        &self,
        _height: u32,
        _header: &BlockHeader,
        _txs: &[Transaction],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A block was disconnected.
    async fn on_block_disconnected(
        &self,
        _hash: BlockHash,
        _height: u32,
        _time: u32,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A relevant transaction was found in the block at `height`.
    async fn on_transaction(
        &self,
        _height: u32,
        _hash: BlockHash,
        _tx: &Transaction,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The rescan caught up with the tip.
    async fn on_rescan_finished(
        &self,
        _hash: BlockHash,
        _height: u32,
        _time: u32,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handler set with every slot empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandlers;

impl RescanHandlers for NoopHandlers {}
