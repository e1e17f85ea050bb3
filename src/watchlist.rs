//! The set of scripts and outpoints a rescan is looking for.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bitcoin::{address::NetworkUnchecked, Address, Network, OutPoint, ScriptBuf};

use crate::error::RescanResult;

#[derive(Debug, Default, Clone)]
struct Entries {
    scripts: HashSet<ScriptBuf>,
    // BIP-158 basic filters commit to the script an input spends, so every
    // watched outpoint carries the script it locks.
    outpoints: HashMap<OutPoint, ScriptBuf>,
}

/// Shared, mutable watch-list.
///
/// Cloning yields another handle onto the same set: the wallet keeps one to
/// add addresses while the scan task takes a [`WatchSnapshot`] per block.
/// Additions only affect snapshots taken after them.
#[derive(Debug, Clone)]
pub struct WatchList {
    network: Network,
    inner: Arc<RwLock<Entries>>,
}

impl WatchList {
    /// Empty watch-list for addresses of `network`.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            inner: Arc::new(RwLock::new(Entries::default())),
        }
    }

    /// Network addresses are validated against.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Watch the output script of `address`. Fails if the address belongs to another network.
    pub fn add_address(&self, address: Address<NetworkUnchecked>) -> RescanResult<()> {
        let address = address.require_network(self.network)?;
        self.add_script(address.script_pubkey());
        Ok(())
    }

    /// Watch a raw output script.
    pub fn add_script(&self, script: ScriptBuf) {
        self.write().scripts.insert(script);
    }

    /// Watch spends of `outpoint`, which locks `script`.
    pub fn add_outpoint(&self, outpoint: OutPoint, script: ScriptBuf) {
        self.write().outpoints.insert(outpoint, script);
    }

    /// Forget everything.
    pub fn clear(&self) {
        let mut entries = self.write();
        entries.scripts.clear();
        entries.outpoints.clear();
    }

    /// Number of watched items.
    pub fn len(&self) -> usize {
        let entries = self.read();
        entries.scripts.len() + entries.outpoints.len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Immutable copy used for one matching pass.
    pub fn snapshot(&self) -> WatchSnapshot {
        let entries = self.read();
        WatchSnapshot {
            scripts: entries.scripts.clone(),
            outpoints: entries.outpoints.clone(),
        }
    }

    // A panicking writer cannot leave the sets half-updated, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Point-in-time view of a [`WatchList`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSnapshot {
    scripts: HashSet<ScriptBuf>,
    outpoints: HashMap<OutPoint, ScriptBuf>,
}

impl WatchSnapshot {
    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty() && self.outpoints.is_empty()
    }

    /// Whether an output paying `script` is relevant.
    pub fn watches_script(&self, script: &ScriptBuf) -> bool {
        self.scripts.contains(script)
    }

    /// Whether spending `outpoint` is relevant.
    pub fn watches_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.outpoints.contains_key(outpoint)
    }

    /// Every script to query a compact filter with: watched scripts plus the
    /// scripts locked by watched outpoints.
    pub fn filter_scripts(&self) -> Vec<ScriptBuf> {
        let mut all: HashSet<&ScriptBuf> = self.scripts.iter().collect();
        all.extend(self.outpoints.values());
        all.into_iter().cloned().collect()
    }

    pub(crate) fn insert_outpoint(&mut self, outpoint: OutPoint, script: ScriptBuf) {
        self.outpoints.insert(outpoint, script);
    }
}
