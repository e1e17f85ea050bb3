//! Caller-facing control object for one rescan.
use std::sync::{Arc, Mutex};

use bitcoin::{address::NetworkUnchecked, Address, OutPoint, ScriptBuf};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::ChainView,
    config::RescanConfig,
    dispatcher::Dispatcher,
    engine::{resolve_start, Command, RescanJob, RescanState},
    error::{RescanError, RescanResult},
    hooks::{RescanEvent, RescanHandlers},
    watchlist::WatchList,
};

/// Changes applied to a running rescan with [`Rescan::update`].
#[derive(Debug, Clone, Default)]
pub struct RescanUpdate {
    addresses: Vec<Address<NetworkUnchecked>>,
    scripts: Vec<ScriptBuf>,
    outpoints: Vec<(OutPoint, ScriptBuf)>,
    rewind_to: Option<u32>,
    disable_disconnected: bool,
}

impl RescanUpdate {
    /// Empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch more addresses.
    pub fn add_addresses(mut self, addrs: impl IntoIterator<Item = Address<NetworkUnchecked>>) -> Self {
        self.addresses.extend(addrs);
        self
    }

    /// Watch more scripts.
    pub fn add_scripts(mut self, scripts: impl IntoIterator<Item = ScriptBuf>) -> Self {
        self.scripts.extend(scripts);
        self
    }

    /// Watch more outpoints.
    pub fn add_outpoints(mut self, outpoints: impl IntoIterator<Item = (OutPoint, ScriptBuf)>) -> Self {
        self.outpoints.extend(outpoints);
        self
    }

    /// Rewind the cursor to `height` so later blocks are scanned again with
    /// the updated watch-list.
    pub fn rewind_to(mut self, height: u32) -> Self {
        self.rewind_to = Some(height);
        self
    }

    /// Skip `BlockDisconnected` notifications for blocks undone by the rewind.
    pub fn disable_disconnected(mut self) -> Self {
        self.disable_disconnected = true;
        self
    }
}

// Resources handed to the scan task exactly once.
struct Launch {
    state: watch::Sender<RescanState>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// One rescan against a shared [`ChainView`].
///
/// `new` validates the configuration, `start` resolves the start point and
/// spawns the scan task, `stop` (or the configured quit token) ends it, and
/// `wait` returns how it ended. Dropping the handle stops the rescan.
pub struct Rescan<C: ChainView + ?Sized + 'static> {
    chain: Arc<C>,
    config: RescanConfig,
    watch: WatchList,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    state: watch::Receiver<RescanState>,
    commands: mpsc::UnboundedSender<Command>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<RescanError>>>,
    launch: Mutex<Option<Launch>>,
    task: Mutex<Option<JoinHandle<RescanResult<()>>>>,
}

impl<C: ChainView + ?Sized + 'static> Rescan<C> {
    /// Build an idle rescan. Fails if a watched address is for another network.
    pub fn new(
        chain: Arc<C>,
        config: RescanConfig,
        handlers: Arc<dyn RescanHandlers>,
    ) -> RescanResult<Self> {
        let watch = WatchList::new(config.network);
        for addr in &config.addresses {
            watch.add_address(addr.clone())?;
        }
        for script in &config.scripts {
            watch.add_script(script.clone());
        }
        for (outpoint, script) in &config.outpoints {
            watch.add_outpoint(*outpoint, script.clone());
        }

        let cancel = config
            .quit
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RescanState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        Ok(Self {
            chain,
            config,
            watch,
            dispatcher: Dispatcher::new(handlers, err_tx),
            cancel,
            state: state_rx,
            commands: cmd_tx,
            errors: Mutex::new(Some(err_rx)),
            launch: Mutex::new(Some(Launch {
                state: state_tx,
                commands: cmd_rx,
            })),
            task: Mutex::new(None),
        })
    }

    /// Resolve the start point and spawn the scan task.
    ///
    /// Configuration problems are returned here and leave the rescan idle, so
    /// `start` may be retried. Starting twice is [`RescanError::AlreadyStarted`].
    pub async fn start(&self) -> RescanResult<()> {
        let launch = lock(&self.launch).take().ok_or(RescanError::AlreadyStarted)?;

        let start = match resolve_start(self.chain.as_ref(), self.config.effective_start()).await {
            Ok(start) => start,
            Err(e) => {
                *lock(&self.launch) = Some(launch);
                return Err(e);
            }
        };
        tracing::info!(
            height = start.height,
            hash = %start.block_hash(),
            watched = self.watch.len(),
            "starting rescan"
        );

        let job = RescanJob::new(
            self.chain.clone(),
            self.watch.clone(),
            self.dispatcher.clone(),
            self.cancel.clone(),
            launch.state,
            launch.commands,
            self.config.retry,
            self.config.reorg_horizon,
            self.config.store.clone(),
            start,
        );
        *lock(&self.task) = Some(tokio::spawn(job.run()));
        Ok(())
    }

    /// Apply watch-list additions now and forward a rewind to the scan task.
    /// Additions affect blocks not yet scanned; use a rewind to cover older ones.
    pub fn update(&self, update: RescanUpdate) -> RescanResult<()> {
        for addr in update.addresses {
            self.watch.add_address(addr)?;
        }
        for script in update.scripts {
            self.watch.add_script(script);
        }
        for (outpoint, script) in update.outpoints {
            self.watch.add_outpoint(outpoint, script);
        }
        if let Some(height) = update.rewind_to {
            // A terminated task has nothing left to rewind.
            let _ = self.commands.send(Command::Rewind {
                height,
                notify: !update.disable_disconnected,
            });
        }
        Ok(())
    }

    /// Handle onto the watch-list; safe to mutate at any time.
    pub fn watch_list(&self) -> WatchList {
        self.watch.clone()
    }

    /// Events dispatched from now on. The stream ends when the rescan terminates.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RescanEvent> {
        self.dispatcher.subscribe()
    }

    /// Handler failures. Can be taken once.
    pub fn errors(&self) -> Option<mpsc::UnboundedReceiver<RescanError>> {
        lock(&self.errors).take()
    }

    /// Lifecycle state, updated as the rescan progresses.
    pub fn state(&self) -> watch::Receiver<RescanState> {
        self.state.clone()
    }

    /// Whether the rescan is following the tip.
    pub fn is_live(&self) -> bool {
        *self.state.borrow() == RescanState::Live
    }

    /// Wait until the rescan has caught up with the tip (or terminated).
    /// Returns the state observed. Returns the current state at once if no
    /// scan task is running, e.g. before `start` or after a failed one.
    pub async fn caught_up(&self) -> RescanState {
        if lock(&self.task).is_none() {
            return *self.state.borrow();
        }
        let mut state = self.state.clone();
        let observed = match state
            .wait_for(|s| matches!(s, RescanState::Live | RescanState::Terminated))
            .await
        {
            Ok(s) => *s,
            Err(_) => RescanState::Terminated,
        };
        observed
    }

    /// Request the scan task to stop. Delivery of the current height completes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the scan task to finish. `Ok` after a stop or chain view
    /// shutdown, the fatal error otherwise. Returns `Ok` if never started or
    /// already waited for.
    pub async fn wait(&self) -> RescanResult<()> {
        let Some(task) = lock(&self.task).take() else {
            return Ok(());
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RescanError::TaskFailed(e.to_string())),
        }
    }
}

impl<C: ChainView + ?Sized + 'static> Drop for Rescan<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
