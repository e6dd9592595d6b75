//! 🏊 The relay pool: every relay, asked at once, waited on with a stopwatch.
//!
//! A dead or slow relay degrades results, it never fails the caller. Queries are
//! fanned out in parallel, bounded by a per-relay timeout, and the results merged
//! and deduplicated by id. Publishes report per relay. Subscriptions merge every
//! relay's stream into one channel and announce, once, when the backlog is done.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_channel::{Receiver, Sender};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Relay, RelayMessage};
use crate::records::{Filter, Record, dedup_by_id};

/// ✅ or 💀, per relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub endpoint: String,
    pub accepted: bool,
    pub error: Option<String>,
}

/// 📬 Who took the record and who didn't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub record_id: String,
    pub outcomes: Vec<RelayOutcome>,
}

impl PublishReport {
    pub fn acknowledged(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.accepted).count()
    }

    pub fn any_acknowledged(&self) -> bool {
        self.acknowledged() > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &RelayOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.accepted)
    }
}

/// 📨 What a pool subscription delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Record(Record),
    /// Every relay finished its backlog, or the backlog timeout gave up waiting. Sent once.
    BacklogComplete,
}

/// 📡 A merged subscription over every relay in the pool.
#[derive(Debug)]
pub struct PoolSubscription {
    rx: Receiver<SubscriptionEvent>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl PoolSubscription {
    pub async fn next(&self) -> Option<SubscriptionEvent> {
        if self.closed {
            return None;
        }
        self.rx.recv().await.ok()
    }

    pub fn receiver(&self) -> Receiver<SubscriptionEvent> {
        self.rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 🛑 Idempotent. Aborting the forwarders drops every relay subscription with them.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.rx.close();
        debug!("🛑 pool subscription closed");
    }
}

impl Drop for PoolSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolTimeouts {
    pub query: Duration,
    pub publish: Duration,
    pub backlog: Duration,
}

impl Default for PoolTimeouts {
    fn default() -> Self {
        Self {
            query: Duration::from_secs(5),
            publish: Duration::from_secs(5),
            backlog: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayPool {
    relays: Vec<Arc<dyn Relay>>,
    timeouts: PoolTimeouts,
}

impl RelayPool {
    pub fn new(relays: Vec<Arc<dyn Relay>>, timeouts: PoolTimeouts) -> Self {
        Self { relays, timeouts }
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.relays.iter().map(|relay| relay.endpoint().to_string()).collect()
    }

    /// 🔎 One filter, every relay, merged. Relays that fail or time out just don't contribute.
    pub async fn query(&self, filter: &Filter) -> Vec<Record> {
        self.query_many(std::slice::from_ref(filter)).await
    }

    /// 🔎 Several filters, every relay, merged and deduplicated by id.
    pub async fn query_many(&self, filters: &[Filter]) -> Vec<Record> {
        let asks = self.relays.iter().flat_map(|relay| {
            filters.iter().map(move |filter| async move {
                let outcome = tokio::time::timeout(self.timeouts.query, relay.query(filter)).await;
                match outcome {
                    Ok(Ok(records)) => {
                        trace!("📥 {} answered with {} records", relay.endpoint(), records.len());
                        records
                    }
                    Ok(Err(err)) => {
                        warn!("⚠️ relay {} failed a query, carrying on without it: {:#}", relay.endpoint(), err);
                        Vec::new()
                    }
                    Err(_) => {
                        warn!(
                            "⏰ relay {} did not answer within {:?}, carrying on without it",
                            relay.endpoint(),
                            self.timeouts.query
                        );
                        Vec::new()
                    }
                }
            })
        });
        dedup_by_id(join_all(asks).await.into_iter().flatten())
    }

    /// 📤 Sends one record to every relay in parallel and reports who acknowledged it.
    pub async fn publish(&self, record: &Record) -> PublishReport {
        let sends = self.relays.iter().map(|relay| {
            let relay = Arc::clone(relay);
            let record = record.clone();
            let timeout = self.timeouts.publish;
            tokio::spawn(async move {
                let endpoint = relay.endpoint().to_string();
                let error = match tokio::time::timeout(timeout, relay.publish(&record)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("{err:#}")),
                    Err(_) => Some(format!("no acknowledgement within {timeout:?}")),
                };
                RelayOutcome {
                    endpoint,
                    accepted: error.is_none(),
                    error,
                }
            })
        });
        let outcomes: Vec<RelayOutcome> = join_all(sends)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|err| RelayOutcome {
                    endpoint: "unknown".to_string(),
                    accepted: false,
                    error: Some(format!("publish task died: {err}")),
                })
            })
            .collect();
        for failure in outcomes.iter().filter(|outcome| !outcome.accepted) {
            warn!(
                "📭 relay {} did not take {}: {}",
                failure.endpoint,
                record.id,
                failure.error.as_deref().unwrap_or("no reason given")
            );
        }
        PublishReport {
            record_id: record.id.clone(),
            outcomes,
        }
    }

    /// 🎧 Subscribes every relay to `filters` and merges their streams.
    ///
    /// Relays that fail to subscribe are logged and skipped. Fails only when no
    /// relay at all accepted the subscription.
    pub async fn subscribe(&self, filters: &[Filter]) -> Result<PoolSubscription> {
        let attempts = join_all(self.relays.iter().map(|relay| async move {
            let outcome = tokio::time::timeout(self.timeouts.query, relay.subscribe(filters)).await;
            match outcome {
                Ok(Ok(subscription)) => Some((relay.endpoint().to_string(), subscription)),
                Ok(Err(err)) => {
                    warn!("⚠️ relay {} refused the subscription: {:#}", relay.endpoint(), err);
                    None
                }
                Err(_) => {
                    warn!("⏰ relay {} never opened the subscription", relay.endpoint());
                    None
                }
            }
        }))
        .await;
        let subscriptions: Vec<_> = attempts.into_iter().flatten().collect();
        if subscriptions.is_empty() && !self.relays.is_empty() {
            return Err(anyhow!("💀 not a single relay accepted the subscription"));
        }

        let (tx, rx) = async_channel::unbounded();
        let (eose_tx, eose_rx) = async_channel::bounded::<()>(subscriptions.len().max(1));
        let mut tasks = Vec::with_capacity(subscriptions.len() + 1);
        let expected = subscriptions.len();

        for (endpoint, subscription) in subscriptions {
            tasks.push(tokio::spawn(forward(endpoint, subscription, tx.clone(), eose_tx.clone())));
        }
        drop(eose_tx);
        tasks.push(tokio::spawn(announce_backlog(expected, eose_rx, tx, self.timeouts.backlog)));

        Ok(PoolSubscription {
            rx,
            tasks,
            closed: false,
        })
    }
}

async fn forward(
    endpoint: String,
    subscription: super::RelaySubscription,
    tx: Sender<SubscriptionEvent>,
    eose: Sender<()>,
) {
    while let Some(message) = subscription.next().await {
        match message {
            RelayMessage::Record(record) => {
                if tx.send(SubscriptionEvent::Record(record)).await.is_err() {
                    return;
                }
            }
            RelayMessage::EndOfStoredRecords => {
                trace!("🏁 {} finished its backlog", endpoint);
                let _ = eose.send(()).await;
            }
        }
    }
    debug!("🔌 {} stopped talking", endpoint);
}

/// 🏁 Waits for every relay's end marker, or the deadline, then says so exactly once.
async fn announce_backlog(expected: usize, eose: Receiver<()>, tx: Sender<SubscriptionEvent>, deadline: Duration) {
    let waiting = async {
        let mut seen = 0;
        while seen < expected {
            if eose.recv().await.is_err() {
                break;
            }
            seen += 1;
        }
    };
    if tokio::time::timeout(deadline, waiting).await.is_err() {
        warn!("⏰ backlog still trickling in after {:?}; calling it complete", deadline);
    }
    let _ = tx.send(SubscriptionEvent::BacklogComplete).await;
}
