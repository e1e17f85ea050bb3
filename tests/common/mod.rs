#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    bip158::{BlockFilter, Error as BfError, FilterHeader},
    block::{Header as BlockHeader, Version as BlockVersion},
    consensus,
    hash_types::TxMerkleNode,
    hashes::Hash,
    pow::CompactTarget,
    transaction, Amount, Block, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, WPubkeyHash, Witness,
};
use niebla_rescan::{filter_header::next_filter_header, prelude::*};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};

pub const BASE_TIME: u32 = 1_600_000_000;
pub const BLOCK_INTERVAL: u32 = 600;

/// Header time of the block at `height` on any branch.
pub fn time_at(height: u32) -> u32 {
    BASE_TIME + height * BLOCK_INTERVAL
}

/// P2WPKH script for a throwaway key hash.
pub fn p2wpkh(b: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([b; 20]))
}

/// Where mined coinbases pay.
pub fn miner_script() -> ScriptBuf {
    p2wpkh(0xAA)
}

/// A transaction spending `inputs` into one output per script.
pub fn tx(inputs: Vec<OutPoint>, outputs: Vec<ScriptBuf>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .into_iter()
            .map(|script_pubkey| TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey,
            })
            .collect(),
    }
}

/// A payment to `script` funded from an outpoint nobody watches.
pub fn payment_to(script: &ScriptBuf, nonce: u8) -> Transaction {
    tx(
        vec![OutPoint::new(Txid::from_byte_array([nonce; 32]), 0)],
        vec![p2wpkh(0x55), script.clone()],
    )
}

struct MemBlock {
    block: Block,
    indexed: IndexedHeader,
    filter: Vec<u8>,
}

struct Inner {
    blocks: Vec<MemBlock>,
    utxos: HashMap<OutPoint, ScriptBuf>,
    branch: u32,
}

/// In-memory best chain: mines blocks, builds real BIP-158 filters and
/// filter headers, announces connects/disconnects, and can reorg.
pub struct MemChain {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ChainEvent>,
    filter_failures: AtomicU32,
    filter_fetches: AtomicU32,
    block_fetches: AtomicU32,
}

impl MemChain {
    /// A chain holding only a genesis block.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let chain = Self {
            inner: Mutex::new(Inner {
                blocks: vec![],
                utxos: HashMap::new(),
                branch: 0,
            }),
            events,
            filter_failures: AtomicU32::new(0),
            filter_fetches: AtomicU32::new(0),
            block_fetches: AtomicU32::new(0),
        };
        chain.push_block(vec![]);
        Arc::new(chain)
    }

    /// Mine `n` blocks with only a coinbase.
    pub fn mine(&self, n: u32) -> Vec<IndexedHeader> {
        (0..n).map(|_| self.push_block(vec![])).collect()
    }

    /// Mine one block carrying `txs` after the coinbase.
    pub fn mine_with(&self, txs: Vec<Transaction>) -> IndexedHeader {
        self.push_block(txs)
    }

    /// Replace every block above `fork_height` with `new_blocks` fresh ones,
    /// announcing the disconnects (tip first) and then the connects.
    pub fn reorg(&self, fork_height: u32, new_blocks: u32) -> Vec<IndexedHeader> {
        let removed: Vec<IndexedHeader> = {
            let mut inner = self.inner.lock().unwrap();
            inner.branch += 1;
            let keep = fork_height as usize + 1;
            inner.blocks.drain(keep..).map(|b| b.indexed).rev().collect()
        };
        let depth = removed.len() as u32;
        for header in removed {
            let _ = self.events.send(ChainEvent::BlockDisconnected {
                header,
                reorg_depth: depth,
            });
        }
        self.mine(new_blocks)
    }

    /// Make the next `n` filter fetches fail like a timed-out peer.
    pub fn fail_next_filters(&self, n: u32) {
        self.filter_failures.store(n, Ordering::SeqCst);
    }

    pub fn filter_fetches(&self) -> u32 {
        self.filter_fetches.load(Ordering::SeqCst)
    }

    pub fn block_fetches(&self) -> u32 {
        self.block_fetches.load(Ordering::SeqCst)
    }

    pub fn tip_height(&self) -> u32 {
        self.inner.lock().unwrap().blocks.len() as u32 - 1
    }

    pub fn header(&self, height: u32) -> IndexedHeader {
        self.inner.lock().unwrap().blocks[height as usize].indexed
    }

    pub fn block(&self, height: u32) -> Block {
        self.inner.lock().unwrap().blocks[height as usize].block.clone()
    }

    fn push_block(&self, extra: Vec<Transaction>) -> IndexedHeader {
        let indexed = {
            let mut inner = self.inner.lock().unwrap();
            let height = inner.blocks.len() as u32;
            let (prev_hash, prev_filter_header) = match inner.blocks.last() {
                Some(b) => (b.indexed.block_hash(), b.indexed.filter_header),
                None => (BlockHash::all_zeros(), FilterHeader::all_zeros()),
            };

            let mut coinbase = tx(vec![OutPoint::null()], vec![miner_script()]);
            let mut tag = height.to_le_bytes().to_vec();
            tag.extend_from_slice(&inner.branch.to_le_bytes());
            coinbase.input[0].script_sig = ScriptBuf::from_bytes(tag);

            let mut txdata = vec![coinbase];
            txdata.extend(extra);

            let mut block = Block {
                header: BlockHeader {
                    version: BlockVersion::from_consensus(2),
                    prev_blockhash: prev_hash,
                    merkle_root: TxMerkleNode::all_zeros(),
                    time: time_at(height),
                    bits: CompactTarget::from_consensus(0x207fffff), // easy target (regtest-like)
                    nonce: inner.branch,
                },
                txdata,
            };
            if let Some(root) = block.compute_merkle_root() {
                block.header.merkle_root = root;
            }

            let utxos = &inner.utxos;
            let filter = BlockFilter::new_script_filter(&block, |op: &OutPoint| -> Result<ScriptBuf, BfError> {
                Ok(utxos.get(op).cloned().unwrap_or_default())
            })
            .expect("filter construction")
            .content;

            let indexed = IndexedHeader {
                height,
                header: block.header,
                filter_header: next_filter_header(&filter, &prev_filter_header),
            };

            for t in &block.txdata {
                let txid = t.compute_txid();
                for (vout, out) in t.output.iter().enumerate() {
                    inner
                        .utxos
                        .insert(OutPoint::new(txid, vout as u32), out.script_pubkey.clone());
                }
            }
            inner.blocks.push(MemBlock {
                block,
                indexed,
                filter,
            });
            indexed
        };
        let _ = self.events.send(ChainEvent::BlockConnected(indexed));
        indexed
    }
}

#[async_trait]
impl ChainView for MemChain {
    async fn current_tip(&self) -> anyhow::Result<ChainTip> {
        let inner = self.inner.lock().unwrap();
        match inner.blocks.last() {
            Some(b) => Ok(b.indexed.tip()),
            None => anyhow::bail!("empty chain"),
        }
    }

    async fn header_at(&self, height: u32) -> anyhow::Result<IndexedHeader> {
        let inner = self.inner.lock().unwrap();
        match inner.blocks.get(height as usize) {
            Some(b) => Ok(b.indexed),
            None => anyhow::bail!("no block at height {height}"),
        }
    }

    async fn filter_at(&self, height: u32, hash: BlockHash) -> anyhow::Result<Vec<u8>> {
        if self
            .filter_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("peer timeout");
        }
        self.filter_fetches.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        match inner.blocks.get(height as usize) {
            Some(b) if b.indexed.block_hash() == hash => Ok(b.filter.clone()),
            _ => anyhow::bail!("block {hash} is not at height {height}"),
        }
    }

    async fn block_at(&self, height: u32, hash: BlockHash) -> anyhow::Result<Vec<u8>> {
        self.block_fetches.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        match inner.blocks.get(height as usize) {
            Some(b) if b.indexed.block_hash() == hash => Ok(consensus::encode::serialize(&b.block)),
            _ => anyhow::bail!("block {hash} is not at height {height}"),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }
}

/// Minimal in-memory Store for tests.
#[derive(Default)]
pub struct MemStore {
    cursor: Mutex<Option<ChainTip>>,
}

#[async_trait]
impl Store for MemStore {
    async fn load_cursor(&self) -> anyhow::Result<Option<ChainTip>> {
        Ok(*self.cursor.lock().unwrap())
    }
    async fn save_cursor(&self, cursor: ChainTip) -> anyhow::Result<()> {
        *self.cursor.lock().unwrap() = Some(cursor);
        Ok(())
    }
}

/// Retry quickly so failure tests stay fast.
pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_attempts: None,
    }
}

/// Receive `n` events or fail after a generous timeout.
pub async fn take_events(rx: &mut mpsc::UnboundedReceiver<RescanEvent>, n: usize) -> Vec<RescanEvent> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(ev)) => out.push(ev),
            Ok(None) => panic!("event stream closed after {} of {n} events: {out:?}", out.len()),
            Err(_) => panic!("timed out after {} of {n} events: {out:?}", out.len()),
        }
    }
    out
}

/// Receive events up to and including the first one matching `done`.
pub async fn events_until(
    rx: &mut mpsc::UnboundedReceiver<RescanEvent>,
    done: impl Fn(&RescanEvent) -> bool,
) -> Vec<RescanEvent> {
    let mut out = vec![];
    loop {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(ev)) => {
                let stop = done(&ev);
                out.push(ev);
                if stop {
                    return out;
                }
            }
            Ok(None) => panic!("event stream closed: {out:?}"),
            Err(_) => panic!("timed out waiting for event: {out:?}"),
        }
    }
}

/// Events up to the next `RescanFinished`.
pub async fn until_finished(rx: &mut mpsc::UnboundedReceiver<RescanEvent>) -> Vec<RescanEvent> {
    events_until(rx, |e| matches!(e, RescanEvent::RescanFinished { .. })).await
}

/// Compact `(kind, height)` view of an event sequence.
pub fn outline(events: &[RescanEvent]) -> Vec<(&'static str, u32)> {
    events.iter().map(|e| (e.kind(), e.height())).collect()
}

pub fn connected_heights(events: &[RescanEvent]) -> Vec<u32> {
    events
        .iter()
        .filter(|e| matches!(e, RescanEvent::BlockConnected { .. }))
        .map(|e| e.height())
        .collect()
}

pub fn filtered_heights(events: &[RescanEvent]) -> Vec<u32> {
    events
        .iter()
        .filter(|e| matches!(e, RescanEvent::FilteredBlockConnected { .. }))
        .map(|e| e.height())
        .collect()
}
