//! Filter and block matching against a watch snapshot. Everything here is pure.
use bitcoin::{bip158::BlockFilter, Block, BlockHash, OutPoint, ScriptBuf, Transaction};

use crate::watchlist::WatchSnapshot;

/// Probabilistic test of a BIP-158 filter against `scripts`.
///
/// Never a false negative; false positives are resolved by
/// [`relevant_transactions`] on the full block.
pub fn filter_matches_any<I>(
    block_hash: BlockHash,
    raw_filter: &[u8],
    scripts: I,
) -> Result<bool, bitcoin::bip158::Error>
where
    I: IntoIterator<Item = ScriptBuf>,
{
    let filter = BlockFilter::new(raw_filter);

    // Own the bytes, then iterate by &[…]
    let query_bytes: Vec<Vec<u8>> = scripts.into_iter().map(|s| s.into_bytes()).collect();
    if query_bytes.is_empty() {
        return Ok(false);
    }
    let mut it = query_bytes.iter().map(|v| v.as_slice());

    filter.match_any(&block_hash, &mut it)
}

/// Filter test for a whole snapshot.
pub fn filter_matches_snapshot(
    block_hash: BlockHash,
    raw_filter: &[u8],
    snapshot: &WatchSnapshot,
) -> Result<bool, bitcoin::bip158::Error> {
    filter_matches_any(block_hash, raw_filter, snapshot.filter_scripts())
}

/// Outcome of testing one block at one height.
#[derive(Debug, Clone)]
pub struct FilterQueryResult {
    /// Height of the block.
    pub height: u32,
    /// Hash of the block.
    pub block_hash: BlockHash,
    /// Whether the compact filter matched.
    pub matched: bool,
    /// The full block, fetched only on a filter match.
    pub block: Option<Block>,
}

/// Exact matches found in a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMatches {
    /// Relevant transactions, in block order.
    pub txs: Vec<Transaction>,
    /// Outputs paying watched scripts; spending them is relevant from now on.
    pub new_outpoints: Vec<(OutPoint, ScriptBuf)>,
}

impl BlockMatches {
    /// Whether nothing in the block was relevant (a filter false positive).
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

/// Scan a block for transactions paying a watched script or spending a
/// watched outpoint. Outputs found along the way are watched for the rest of
/// the block, so a spend later in the same block is caught too.
pub fn relevant_transactions(block: &Block, snapshot: &WatchSnapshot) -> BlockMatches {
    let mut watch = snapshot.clone();
    let mut found = BlockMatches::default();

    for tx in &block.txdata {
        let mut relevant = !tx.is_coinbase()
            && tx
                .input
                .iter()
                .any(|txin| watch.watches_outpoint(&txin.previous_output));

        let txid = tx.compute_txid();
        for (vout, txout) in tx.output.iter().enumerate() {
            if watch.watches_script(&txout.script_pubkey) {
                let outpoint = OutPoint::new(txid, vout as u32);
                watch.insert_outpoint(outpoint, txout.script_pubkey.clone());
                found.new_outpoints.push((outpoint, txout.script_pubkey.clone()));
                relevant = true;
            }
        }

        if relevant {
            found.txs.push(tx.clone());
        }
    }

    found
}
