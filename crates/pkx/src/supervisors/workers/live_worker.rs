//! 📥 The LiveWorker: drains a live subscription into the snapshot store.
//!
//! Records go through the store's one apply path, listing records outside the
//! current scope get dropped at the door, and the backlog marker is passed on to
//! observers. When the channel closes, the worker goes home.

use anyhow::Result;
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Worker;
use crate::live::LiveScope;
use crate::relays::SubscriptionEvent;
use crate::snapshot::{Change, SnapshotStore};

#[derive(Debug)]
pub(crate) struct LiveWorker {
    rx: Receiver<SubscriptionEvent>,
    store: SnapshotStore,
    scope: LiveScope,
}

impl LiveWorker {
    pub(crate) fn new(rx: Receiver<SubscriptionEvent>, store: SnapshotStore, scope: LiveScope) -> Self {
        Self { rx, store, scope }
    }
}

impl Worker for LiveWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 LiveWorker started draining the subscription");
            let mut applied = 0usize;
            while let Ok(event) = self.rx.recv().await {
                match event {
                    SubscriptionEvent::Record(record) => {
                        if !self.scope.admits(&record) {
                            trace!("🚪 {} is outside the live scope", record.id);
                            continue;
                        }
                        let changes = self.store.apply_records(std::slice::from_ref(&record)).await;
                        if !changes.is_empty() {
                            applied += 1;
                        }
                    }
                    SubscriptionEvent::BacklogComplete => {
                        debug!("🏁 live backlog complete after {} applied records", applied);
                        self.store.notify(Change::BacklogComplete);
                    }
                }
            }
            debug!("🏁 LiveWorker: channel closed after {} applied records. Shutting down.", applied);
            Ok(())
        })
    }
}
