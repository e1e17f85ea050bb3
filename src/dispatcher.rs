//! Serialized delivery of [`RescanEvent`]s to handlers and subscribers.
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::{
    error::RescanError,
    hooks::{RescanEvent, RescanHandlers},
};

#[derive(Default)]
struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<RescanEvent>>,
    closed: bool,
}

/// Delivers events one at a time.
///
/// Each handler call runs in its own task and is awaited before the next
/// event, so a panicking handler is contained and at most one call is in
/// flight. Cloning shares the subscriber list.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    handlers: Arc<dyn RescanHandlers>,
    subscribers: Arc<Mutex<Subscribers>>,
    errors: mpsc::UnboundedSender<RescanError>,
}

impl Dispatcher {
    pub(crate) fn new(
        handlers: Arc<dyn RescanHandlers>,
        errors: mpsc::UnboundedSender<RescanError>,
    ) -> Self {
        Self {
            handlers,
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            errors,
        }
    }

    /// New receiver for every event dispatched from now on. Already closed if
    /// the rescan has terminated.
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<RescanEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers();
        if !subs.closed {
            subs.senders.push(tx);
        }
        rx
    }

    /// Drop every subscriber so receivers observe the end of the stream.
    pub(crate) fn close(&self) {
        let mut subs = self.subscribers();
        subs.closed = true;
        subs.senders.clear();
    }

    pub(crate) async fn dispatch(&self, event: RescanEvent) {
        let kind = event.kind();
        let height = event.height();

        let handlers = self.handlers.clone();
        let delivered = event.clone();
        let outcome = tokio::spawn(async move { deliver(handlers.as_ref(), &delivered).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(join) if join.is_panic() => Some(panic_message(join.into_panic())),
            Err(join) => Some(join.to_string()),
        };
        if let Some(message) = failure {
            tracing::warn!(event = kind, height, %message, "rescan handler failed");
            let _ = self.errors.send(RescanError::Callback {
                event: kind,
                height,
                message,
            });
        }

        self.subscribers()
            .senders
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn deliver(handlers: &dyn RescanHandlers, event: &RescanEvent) -> anyhow::Result<()> {
    match event {
        RescanEvent::BlockConnected { height, hash, time } => {
            handlers.on_block_connected(*hash, *height, *time).await
        }
        RescanEvent::FilteredBlockConnected {
            height, header, txs, ..
        } => {
            handlers
                .on_filtered_block_connected(*height, header, txs)
                .await
        }
        RescanEvent::BlockDisconnected { height, hash, time } => {
            handlers.on_block_disconnected(*hash, *height, *time).await
        }
        RescanEvent::TransactionDetails {
            height, hash, tx, ..
        } => handlers.on_transaction(*height, *hash, tx).await,
        RescanEvent::RescanFinished { height, hash, time } => {
            handlers.on_rescan_finished(*hash, *height, *time).await
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
