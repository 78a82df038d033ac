use crate::registry::{IteratorRef, SnapshotRef, StoreRef};
use tokio::sync::mpsc;
use tracing::trace;

/// Opaque host value carried back to the host in a release notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostTerm(pub u64);

/// Lifecycle events posted to the host's own thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    StoreClosed {
        store: StoreRef,
    },
    IteratorClosed {
        iterator: IteratorRef,
    },
    SnapshotReleased {
        snapshot: SnapshotRef,
        reference: Option<HostTerm>,
    },
    PrefetchReady {
        iterator: IteratorRef,
    },
}

pub type HostEventReceiver = mpsc::UnboundedReceiver<HostEvent>;

/// Posts `HostEvent`s without blocking. A notifier whose receiver is gone, or
/// one built with `disabled`, drops events silently.
#[derive(Debug, Clone, Default)]
pub struct HostNotifier {
    tx: Option<mpsc::UnboundedSender<HostEvent>>,
}

impl HostNotifier {
    pub fn channel() -> (Self, HostEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn post(&self, event: HostEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(rejected) = tx.send(event) {
            trace!(event = ?rejected.0, "host event receiver gone; dropping event");
        }
    }
}
