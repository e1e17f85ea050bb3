//! The rescan state machine:
//! 1) replay history from the start point against the watch-list,
//! 2) follow the tip as blocks are announced,
//! 3) rewind with disconnect notifications whenever the chain view reorgs
//!    below the cursor.
use std::{collections::VecDeque, sync::Arc};

use anyhow::Context;
use bitcoin::{consensus, Block};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cfheaders::verify_filter,
    chain::{ChainEvent, ChainTip, ChainView, IndexedHeader},
    config::{RetryPolicy, StartPoint},
    dispatcher::Dispatcher,
    error::{RescanError, RescanResult},
    hooks::RescanEvent,
    matcher::{filter_matches_snapshot, relevant_transactions, BlockMatches, FilterQueryResult},
    retry::with_backoff,
    store::Store,
    watchlist::WatchList,
};

/// Where a rescan is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanState {
    /// Created, not started.
    Idle,
    /// Replaying blocks below the tip observed at the start of the pass.
    HistoricalScan,
    /// Caught up; scanning blocks as they are announced.
    Live,
    /// Disconnecting blocks that left the best chain.
    Rewinding,
    /// Stopped for good.
    Terminated,
}

/// Requests from the handle to the running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Rewind { height: u32, notify: bool },
}

/// A block the rescan has delivered (or its start point).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScannedBlock {
    tip: ChainTip,
    time: u32,
}

impl From<IndexedHeader> for ScannedBlock {
    fn from(h: IndexedHeader) -> Self {
        Self {
            tip: h.tip(),
            time: h.time(),
        }
    }
}

/// Everything the scan task owns.
pub(crate) struct RescanJob<C: ChainView + ?Sized> {
    pub(crate) chain: Arc<C>,
    pub(crate) watch: WatchList,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Sender<RescanState>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) retry: RetryPolicy,
    pub(crate) horizon: u32,
    pub(crate) store: Option<Arc<dyn Store>>,
    // Front is the oldest block we can rewind to; back is the cursor.
    history: VecDeque<ScannedBlock>,
    // Blocks above this height on the history have been delivered; the one
    // at it (the resolved start or its replacement) never was.
    anchor: u32,
    pending: VecDeque<Command>,
}

impl<C> RescanJob<C>
where
    C: ChainView + ?Sized + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        chain: Arc<C>,
        watch: WatchList,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
        state: watch::Sender<RescanState>,
        commands: mpsc::UnboundedReceiver<Command>,
        retry: RetryPolicy,
        horizon: u32,
        store: Option<Arc<dyn Store>>,
        start: IndexedHeader,
    ) -> Self {
        Self {
            chain,
            watch,
            dispatcher,
            cancel,
            state,
            commands,
            retry,
            horizon,
            store,
            anchor: start.height,
            history: VecDeque::from([ScannedBlock::from(start)]),
            pending: VecDeque::new(),
        }
    }

    /// Drive the rescan until cancelled, the chain view shuts down, or a fatal error.
    pub(crate) async fn run(mut self) -> RescanResult<()> {
        // Subscribe before the first pass so nothing announced during replay is missed.
        let mut chain_events = self.chain.subscribe();
        info!(start_height = self.cursor().tip.height, "rescan started");

        let outcome = self.drive(&mut chain_events).await;

        self.set_state(RescanState::Terminated);
        self.dispatcher.close();

        match outcome {
            Ok(()) | Err(RescanError::Cancelled) => {
                info!(height = self.cursor().tip.height, "rescan stopped");
                Ok(())
            }
            Err(e) => {
                error!(height = self.cursor().tip.height, error = %e, "rescan terminated");
                Err(e)
            }
        }
    }

    async fn drive(&mut self, chain_events: &mut broadcast::Receiver<ChainEvent>) -> RescanResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            self.apply_commands().await?;
            self.reconcile().await?;

            let tip = self.fetch_tip().await?;
            if tip.height > self.cursor().tip.height {
                if self.current_state() != RescanState::Live {
                    self.set_state(RescanState::HistoricalScan);
                }
                self.scan_to(tip.height).await?;
                continue;
            }

            if self.current_state() != RescanState::Live {
                self.set_state(RescanState::Live);
                let at = self.cursor();
                info!(height = at.tip.height, hash = %at.tip.block_hash, "rescan caught up, following the tip");
                self.dispatcher
                    .dispatch(RescanEvent::RescanFinished {
                        height: at.tip.height,
                        hash: at.tip.block_hash,
                        time: at.time,
                    })
                    .await;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                Some(cmd) = self.commands.recv() => self.pending.push_back(cmd),
                ev = chain_events.recv() => match ev {
                    Ok(ChainEvent::BlockConnected(h)) => {
                        debug!(height = h.height, hash = %h.block_hash(), "chain view connected block");
                    }
                    Ok(ChainEvent::BlockDisconnected { header, reorg_depth }) => {
                        debug!(height = header.height, reorg_depth, "chain view disconnected block");
                        if reorg_depth > self.horizon {
                            warn!(reorg_depth, horizon = self.horizon, "chain view reports a reorg deeper than the rewind horizon");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "chain events lagged, resyncing with the tip");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("chain view shut down");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Scan forward, one block at a time, up to `ceiling`. Returns early when a
    /// command is queued or the next header does not extend the cursor.
    async fn scan_to(&mut self, ceiling: u32) -> RescanResult<()> {
        while self.cursor().tip.height < ceiling {
            if self.cancel.is_cancelled() {
                return Err(RescanError::Cancelled);
            }
            while let Ok(cmd) = self.commands.try_recv() {
                self.pending.push_back(cmd);
            }
            if !self.pending.is_empty() {
                return Ok(());
            }

            let next = self.cursor().tip.height + 1;
            let header = self.fetch_header(next).await?;
            if header.header.prev_blockhash != self.cursor().tip.block_hash {
                debug!(height = next, "header does not extend the cursor, reconciling");
                return Ok(());
            }

            self.process_block(header).await?;
        }
        Ok(())
    }

    /// Match, deliver and commit one block. Once delivery starts the height is
    /// completed even if cancellation arrives meanwhile.
    async fn process_block(&mut self, header: IndexedHeader) -> RescanResult<()> {
        let height = header.height;
        let hash = header.block_hash();
        let time = header.time();

        let snapshot = self.watch.snapshot();
        let query = if snapshot.is_empty() {
            FilterQueryResult {
                height,
                block_hash: hash,
                matched: false,
                block: None,
            }
        } else {
            let prev_filter_header = self.cursor().tip.filter_header;
            let chain = self.chain.clone();
            let snapshot = &snapshot;
            let matched = with_backoff(&self.retry, &self.cancel, "filter", move || {
                let chain = chain.clone();
                async move {
                    let raw = chain
                        .filter_at(height, hash)
                        .await
                        .with_context(|| format!("filter_at({height}, {hash})"))
                        .map_err(RescanError::Chain)?;
                    if !verify_filter(&raw, &prev_filter_header, &header.filter_header) {
                        return Err(RescanError::FilterHeaderMismatch { height });
                    }
                    filter_matches_snapshot(hash, &raw, snapshot)
                        .with_context(|| format!("filter match @height {height}"))
                        .map_err(RescanError::Chain)
                }
            })
            .await?;

            let block = if matched {
                Some(self.fetch_block(&header).await?)
            } else {
                None
            };
            FilterQueryResult {
                height,
                block_hash: hash,
                matched,
                block,
            }
        };

        let matches = match &query.block {
            Some(block) => relevant_transactions(block, &snapshot),
            None => BlockMatches::default(),
        };
        if query.matched && matches.is_empty() {
            debug!(height, %hash, "filter false positive");
        }
        // Outputs we just learned about are watched from the next snapshot on.
        for (outpoint, script) in &matches.new_outpoints {
            self.watch.add_outpoint(*outpoint, script.clone());
        }

        for tx in &matches.txs {
            self.dispatcher
                .dispatch(RescanEvent::TransactionDetails {
                    height,
                    hash,
                    time,
                    tx: tx.clone(),
                })
                .await;
        }
        if !matches.is_empty() {
            info!(height, %hash, txs = matches.txs.len(), "relevant block");
            self.dispatcher
                .dispatch(RescanEvent::FilteredBlockConnected {
                    height,
                    hash,
                    time,
                    header: header.header,
                    txs: matches.txs,
                })
                .await;
        }
        self.dispatcher
            .dispatch(RescanEvent::BlockConnected { height, hash, time })
            .await;

        self.advance(ScannedBlock::from(header)).await
    }

    /// Rewind while the cursor is no longer on the chain view's best chain.
    async fn reconcile(&mut self) -> RescanResult<()> {
        let mut depth = 0u32;
        loop {
            let cursor = self.cursor().tip;
            let tip = self.fetch_tip().await?;
            if cursor.height <= tip.height {
                let main = self.fetch_header(cursor.height).await?;
                if main.block_hash() == cursor.block_hash {
                    return Ok(());
                }
            }

            if self.current_state() != RescanState::Rewinding {
                info!(height = cursor.height, hash = %cursor.block_hash, tip = tip.height, "cursor left the best chain, rewinding");
                self.set_state(RescanState::Rewinding);
            }
            depth += 1;
            self.step_back(depth).await?;
        }
    }

    /// Undo the cursor during a reorg. Delivered blocks come off the rewind
    /// history with a disconnect notification. The never-delivered anchor is
    /// replaced by its parent without one, as long as the reorg stays within
    /// the horizon.
    async fn step_back(&mut self, depth: u32) -> RescanResult<()> {
        if self.history.len() >= 2 {
            return self.disconnect_cursor(true).await;
        }

        let at = self.cursor().tip;
        if at.height > self.anchor || at.height == 0 || depth > self.horizon {
            return Err(RescanError::ReorgTooDeep {
                height: at.height,
                horizon: self.horizon,
            });
        }
        let parent = self.fetch_header(at.height - 1).await?;
        debug!(from = at.height, to = parent.height, "start block left the best chain, moving it back");
        self.history.clear();
        self.history.push_back(ScannedBlock::from(parent));
        self.anchor = parent.height;
        self.persist().await
    }

    /// Pop the cursor off the rewind history.
    async fn disconnect_cursor(&mut self, notify: bool) -> RescanResult<()> {
        if self.history.len() < 2 {
            return Err(RescanError::ReorgTooDeep {
                height: self.cursor().tip.height,
                horizon: self.horizon,
            });
        }
        let Some(gone) = self.history.pop_back() else {
            return Ok(());
        };

        if notify {
            self.dispatcher
                .dispatch(RescanEvent::BlockDisconnected {
                    height: gone.tip.height,
                    hash: gone.tip.block_hash,
                    time: gone.time,
                })
                .await;
        }
        self.persist().await
    }

    async fn apply_commands(&mut self) -> RescanResult<()> {
        while let Ok(cmd) = self.commands.try_recv() {
            self.pending.push_back(cmd);
        }
        while let Some(cmd) = self.pending.pop_front() {
            match cmd {
                Command::Rewind { height, notify } => self.rewind_to(height, notify).await?,
            }
        }
        Ok(())
    }

    /// Move the cursor back to `height` so the blocks above it are delivered again.
    async fn rewind_to(&mut self, height: u32, notify: bool) -> RescanResult<()> {
        // Bring the cursor onto the best chain first so the headers we fall
        // back on below describe blocks we actually delivered.
        self.reconcile().await?;
        if height < self.cursor().tip.height {
            info!(from = self.cursor().tip.height, to = height, "rewinding on request");
        }

        while self.cursor().tip.height > height {
            if self.history.len() >= 2 {
                self.disconnect_cursor(notify).await?;
                continue;
            }

            // Below the retained history: rebuild it from the chain view.
            let at = self.cursor();
            if notify && at.tip.height > self.anchor {
                self.dispatcher
                    .dispatch(RescanEvent::BlockDisconnected {
                        height: at.tip.height,
                        hash: at.tip.block_hash,
                        time: at.time,
                    })
                    .await;
            }
            let parent = self.fetch_header(at.tip.height - 1).await?;
            self.history.clear();
            self.history.push_back(ScannedBlock::from(parent));
            self.anchor = self.anchor.min(parent.height);
            self.persist().await?;
        }

        if self.current_state() == RescanState::Live {
            self.set_state(RescanState::HistoricalScan);
        }
        Ok(())
    }

    async fn advance(&mut self, block: ScannedBlock) -> RescanResult<()> {
        self.history.push_back(block);
        while self.history.len() > self.horizon as usize + 1 {
            self.history.pop_front();
        }
        debug!(height = block.tip.height, hash = %block.tip.block_hash, "cursor advanced");
        self.persist().await
    }

    async fn persist(&self) -> RescanResult<()> {
        if let Some(store) = &self.store {
            store
                .save_cursor(self.cursor().tip)
                .await
                .map_err(RescanError::Store)?;
        }
        Ok(())
    }

    async fn fetch_tip(&self) -> RescanResult<ChainTip> {
        let chain = self.chain.clone();
        with_backoff(&self.retry, &self.cancel, "tip", move || {
            let chain = chain.clone();
            async move { chain.current_tip().await.map_err(RescanError::Chain) }
        })
        .await
    }

    async fn fetch_header(&self, height: u32) -> RescanResult<IndexedHeader> {
        let chain = self.chain.clone();
        with_backoff(&self.retry, &self.cancel, "header", move || {
            let chain = chain.clone();
            async move {
                chain
                    .header_at(height)
                    .await
                    .with_context(|| format!("header_at({height})"))
                    .map_err(RescanError::Chain)
            }
        })
        .await
    }

    async fn fetch_block(&self, header: &IndexedHeader) -> RescanResult<Block> {
        let height = header.height;
        let expected = header.block_hash();
        let chain = self.chain.clone();
        with_backoff(&self.retry, &self.cancel, "block", move || {
            let chain = chain.clone();
            async move {
                let raw = chain
                    .block_at(height, expected)
                    .await
                    .with_context(|| format!("block_at({height}, {expected})"))
                    .map_err(RescanError::Chain)?;
                let block: Block = consensus::encode::deserialize(&raw)
                    .context("block deserialize")
                    .map_err(RescanError::Chain)?;
                let got = block.block_hash();
                if got != expected {
                    return Err(RescanError::BlockMismatch {
                        height,
                        expected,
                        got,
                    });
                }
                Ok(block)
            }
        })
        .await
    }

    fn cursor(&self) -> ScannedBlock {
        // The history is never empty: disconnect_cursor keeps the front entry.
        self.history[self.history.len() - 1]
    }

    fn current_state(&self) -> RescanState {
        *self.state.borrow()
    }

    fn set_state(&self, next: RescanState) {
        self.state.send_if_modified(|s| {
            if *s == next {
                return false;
            }
            debug!(from = ?*s, to = ?next, "rescan state");
            *s = next;
            true
        });
    }
}

/// Resolve a configured start point to the block the rescan treats as already known.
pub(crate) async fn resolve_start<C>(chain: &C, start: StartPoint) -> RescanResult<IndexedHeader>
where
    C: ChainView + ?Sized,
{
    let tip = chain.current_tip().await.map_err(RescanError::Chain)?;
    let header_at = |height: u32| async move {
        chain
            .header_at(height)
            .await
            .with_context(|| format!("header_at({height})"))
            .map_err(RescanError::Chain)
    };

    match start {
        StartPoint::Genesis => header_at(0).await,
        StartPoint::Height(height) => {
            if height > tip.height {
                return Err(RescanError::StartBeyondTip {
                    height,
                    tip: tip.height,
                });
            }
            header_at(height).await
        }
        StartPoint::Block { height, hash } => {
            if height > tip.height {
                return Err(RescanError::StartBeyondTip {
                    height,
                    tip: tip.height,
                });
            }
            let header = header_at(height).await?;
            if header.block_hash() != hash {
                return Err(RescanError::StartHashMismatch { height, hash });
            }
            Ok(header)
        }
        StartPoint::Time(unix_time) => {
            // First height in [1, tip] whose header time is >= unix_time, or tip + 1.
            let (mut lo, mut hi) = (1u32, tip.height + 1);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if header_at(mid).await?.time() >= unix_time {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            header_at(lo - 1).await
        }
    }
}
