//! 🔌 Relays: where the records actually live.
//!
//! A relay stores signed records and answers equality filters. That's the whole
//! contract, and it's the one seam this crate puts in front of the network:
//! [`Relay`]. Anything that can publish, query and subscribe can play.
//!
//! Two come in the box:
//! - [`InMemoryRelay`]: a relay in RAM, with knobs for making it slow, flaky or
//!   grumpy. Tests live on it.
//! - [`FileRelay`]: a read-only NDJSON dump (optionally gzipped) posing as a relay.
//!
//! [`RelayPool`] fans every operation out to all configured relays and deals with
//! the ones that don't answer. 🦆

use std::fmt;

use anyhow::Result;
use async_channel::Receiver;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::records::{Filter, Record};

pub mod file_relay;
pub mod in_mem_relay;
pub mod pool;

pub use file_relay::{FileRelay, FileRelayConfig};
pub use in_mem_relay::{InMemoryRelay, InMemoryRelayConfig};
pub use pool::{PoolSubscription, PoolTimeouts, PublishReport, RelayOutcome, RelayPool, SubscriptionEvent};

/// 📨 What a subscription delivers, in order: stored records, one end marker, then live ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Record(Record),
    EndOfStoredRecords,
}

/// 📡 One relay's open subscription. Closing is idempotent, and dropping closes.
#[derive(Debug)]
pub struct RelaySubscription {
    rx: Receiver<RelayMessage>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl RelaySubscription {
    pub fn new(rx: Receiver<RelayMessage>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            rx,
            task,
            closed: false,
        }
    }

    /// `None` once the relay is done talking (or we stopped listening).
    pub async fn next(&self) -> Option<RelayMessage> {
        if self.closed {
            return None;
        }
        self.rx.recv().await.ok()
    }

    pub fn close(&mut self) {
        self.closed = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// 🌐 A relay endpoint. The only thing this crate knows about the network.
///
/// # Contract
/// - `query` returns every stored record matching the filter, at most `limit` of
///   them, newest first. Order is a courtesy; callers must not rely on it.
/// - `subscribe` streams stored matches, then [`RelayMessage::EndOfStoredRecords`],
///   then live matches until closed.
/// - Errors are per relay. The pool decides what a failure means.
#[async_trait]
pub trait Relay: fmt::Debug + Send + Sync {
    fn endpoint(&self) -> &str;
    async fn publish(&self, record: &Record) -> Result<()>;
    async fn query(&self, filter: &Filter) -> Result<Vec<Record>>;
    async fn subscribe(&self, filters: &[Filter]) -> Result<RelaySubscription>;
}

/// ⚙️ One configured relay.
#[derive(Debug, Deserialize, Clone)]
pub enum RelayConfig {
    InMemory(InMemoryRelayConfig),
    File(FileRelayConfig),
}

/// 🎭 Config-built relays, dispatched without a vtable.
#[derive(Debug)]
pub enum RelayBackend {
    InMemory(InMemoryRelay),
    File(FileRelay),
}

impl RelayBackend {
    pub async fn from_config(config: &RelayConfig) -> Result<Self> {
        Ok(match config {
            RelayConfig::InMemory(config) => RelayBackend::InMemory(InMemoryRelay::from_config(config).await?),
            RelayConfig::File(config) => RelayBackend::File(FileRelay::open(config.clone()).await?),
        })
    }
}

#[async_trait]
impl Relay for RelayBackend {
    fn endpoint(&self) -> &str {
        match self {
            RelayBackend::InMemory(relay) => relay.endpoint(),
            RelayBackend::File(relay) => relay.endpoint(),
        }
    }

    async fn publish(&self, record: &Record) -> Result<()> {
        match self {
            RelayBackend::InMemory(relay) => relay.publish(record).await,
            RelayBackend::File(relay) => relay.publish(record).await,
        }
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Record>> {
        match self {
            RelayBackend::InMemory(relay) => relay.query(filter).await,
            RelayBackend::File(relay) => relay.query(filter).await,
        }
    }

    async fn subscribe(&self, filters: &[Filter]) -> Result<RelaySubscription> {
        match self {
            RelayBackend::InMemory(relay) => relay.subscribe(filters).await,
            RelayBackend::File(relay) => relay.subscribe(filters).await,
        }
    }
}
