//! 🧪 A relay that lives in RAM and can be told to misbehave.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, trace};

use super::file_relay::load_records;
use super::{Relay, RelayMessage, RelaySubscription};
use crate::records::{Filter, Record, dedup_by_id};

#[derive(Debug, Deserialize, Clone)]
pub struct InMemoryRelayConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// NDJSON (or `.gz`) records to preload.
    #[serde(default)]
    pub seed_file: Option<String>,
}

fn default_endpoint() -> String {
    "memory://local".to_string()
}

impl Default for InMemoryRelayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            seed_file: None,
        }
    }
}

#[derive(Debug, Default)]
struct Vault {
    records: Vec<Record>,
    ids: HashSet<String>,
    down: bool,
    rejecting: bool,
    latency: Option<Duration>,
    failing_kinds: HashSet<u32>,
    filters_seen: Vec<Filter>,
}

/// 📦 Clones share the same vault, so tests can keep a handle after giving one away.
#[derive(Debug, Clone)]
pub struct InMemoryRelay {
    endpoint: String,
    vault: Arc<Mutex<Vault>>,
    live: broadcast::Sender<Record>,
}

impl InMemoryRelay {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            endpoint: endpoint.into(),
            vault: Arc::new(Mutex::new(Vault::default())),
            live,
        }
    }

    pub async fn from_config(config: &InMemoryRelayConfig) -> Result<Self> {
        let relay = Self::new(config.endpoint.clone());
        if let Some(seed_file) = &config.seed_file {
            relay.seed(load_records(seed_file).await?).await;
        }
        Ok(relay)
    }

    /// 🌱 Stores records without announcing them to live subscribers.
    pub async fn seed(&self, records: impl IntoIterator<Item = Record>) {
        let mut vault = self.vault.lock().await;
        for record in records {
            if vault.ids.insert(record.id.clone()) {
                vault.records.push(record);
            }
        }
    }

    pub async fn records(&self) -> Vec<Record> {
        self.vault.lock().await.records.clone()
    }

    /// 💀 A down relay fails everything.
    pub async fn set_down(&self, down: bool) {
        self.vault.lock().await.down = down;
    }

    /// 🙅 Queries still work, publishes get refused.
    pub async fn set_rejecting(&self, rejecting: bool) {
        self.vault.lock().await.rejecting = rejecting;
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.vault.lock().await.latency = latency;
    }

    /// Queries asking for any of these kinds fail.
    pub async fn fail_kinds(&self, kinds: impl IntoIterator<Item = u32>) {
        self.vault.lock().await.failing_kinds.extend(kinds);
    }

    /// 🕵️ Every filter this relay was queried with, in order.
    pub async fn filters_seen(&self) -> Vec<Filter> {
        self.vault.lock().await.filters_seen.clone()
    }

    async fn nap(&self) {
        let latency = self.vault.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Relay for InMemoryRelay {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn publish(&self, record: &Record) -> Result<()> {
        self.nap().await;
        {
            let mut vault = self.vault.lock().await;
            if vault.down {
                bail!("💀 relay {} is down", self.endpoint);
            }
            if vault.rejecting {
                bail!("🙅 relay {} refused record {}", self.endpoint, record.id);
            }
            if !vault.ids.insert(record.id.clone()) {
                trace!("♻️ relay {} already has {}", self.endpoint, record.id);
                return Ok(());
            }
            vault.records.push(record.clone());
        }
        // nobody listening is fine
        let _ = self.live.send(record.clone());
        Ok(())
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Record>> {
        self.nap().await;
        let mut vault = self.vault.lock().await;
        if vault.down {
            bail!("💀 relay {} is down", self.endpoint);
        }
        vault.filters_seen.push(filter.clone());
        if filter.kinds.iter().any(|kind| vault.failing_kinds.contains(kind)) {
            bail!("💀 relay {} chokes on kinds {:?}", self.endpoint, filter.kinds);
        }
        Ok(filter.select(&vault.records))
    }

    async fn subscribe(&self, filters: &[Filter]) -> Result<RelaySubscription> {
        // 🎧 tune in before reading the backlog so nothing slips through the gap
        let mut live = self.live.subscribe();
        let backlog = {
            let mut vault = self.vault.lock().await;
            if vault.down {
                bail!("💀 relay {} is down", self.endpoint);
            }
            vault.filters_seen.extend(filters.iter().cloned());
            dedup_by_id(filters.iter().flat_map(|filter| filter.select(&vault.records)))
        };
        let (tx, rx) = async_channel::unbounded();
        let filters = filters.to_vec();
        let endpoint = self.endpoint.clone();

        let task = tokio::spawn(async move {
            for record in backlog {
                if tx.send(RelayMessage::Record(record)).await.is_err() {
                    return;
                }
            }
            if tx.send(RelayMessage::EndOfStoredRecords).await.is_err() {
                return;
            }
            loop {
                match live.recv().await {
                    Ok(record) if filters.iter().any(|filter| filter.matches(&record)) => {
                        if tx.send(RelayMessage::Record(record)).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("🐌 subscriber on {} lagged by {} records", endpoint, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(RelaySubscription::new(rx, Some(task)))
    }
}
