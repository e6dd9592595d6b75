//! 🎬 *[camera pans across a parking garage at 7:58am]*
//! 🎬 "In a world where every relay tells a slightly different story..."
//! 🎬 "One supervisor dared to keep them all on one page." 🦆
//!
//! 📦 The Supervisor: the one object a front end holds. It builds the relay pool
//! from config, owns the snapshot store, runs refreshes, and keeps exactly one live
//! subscription pointed at whatever is on screen.
//!
//! ⚠️ Workers stay private. The supervisor hands them out; nobody else does.

pub(crate) mod workers;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{info, warn};

use crate::app_config::AppConfig;
use crate::entities::TombstonePolicy;
use crate::geohash::Coordinate;
use crate::live::{LiveMerge, LiveScope};
use crate::local_state::{LocalState, LocalStateFile};
use crate::orchestrator::{FetchPhase, FetchRequest, FetchSettings, Orchestrator, RefreshOutcome};
use crate::publisher::Publisher;
use crate::records::{Filter, RecordSigner, kinds};
use crate::relays::{Relay, RelayBackend, RelayPool};
use crate::snapshot::{Change, SnapshotStore};

pub struct Supervisor {
    user: Option<String>,
    pool: RelayPool,
    store: SnapshotStore,
    orchestrator: Orchestrator,
    live: Mutex<LiveMerge>,
    local: RwLock<LocalState>,
    local_file: Option<LocalStateFile>,
}

impl Supervisor {
    /// 🚀 Everything from config: relays opened, local state loaded, nothing fetched yet.
    pub async fn from_config(app_config: &AppConfig) -> Result<Self> {
        let mut relays: Vec<Arc<dyn Relay>> = Vec::with_capacity(app_config.relays.len());
        for relay_config in &app_config.relays {
            let backend = RelayBackend::from_config(relay_config)
                .await
                .context(format!("💀 could not open relay {relay_config:?}"))?;
            relays.push(Arc::new(backend));
        }
        if relays.is_empty() {
            warn!("🏜️ no relays configured; every query will come back empty");
        }
        let runtime = &app_config.runtime;
        let pool = RelayPool::new(relays, runtime.pool_timeouts());
        let store = SnapshotStore::new(app_config.policy.tombstone_policy(), runtime.change_channel_capacity);

        let local_file = app_config.local_state_file.clone().map(LocalStateFile::new);
        let local = match &local_file {
            Some(file) => file.load().await?,
            None => LocalState::default(),
        };

        let mut supervisor = Self::new(pool, store, runtime.fetch_settings(), app_config.user_key.clone());
        supervisor.local = RwLock::new(local);
        supervisor.local_file = local_file;
        info!(
            "🅿️ supervisor ready: {} relays, user {}",
            supervisor.pool.len(),
            supervisor.user.as_deref().unwrap_or("anonymous")
        );
        Ok(supervisor)
    }

    /// 🧪 Assemble from parts. No local state file; state lives in memory only.
    pub fn new(pool: RelayPool, store: SnapshotStore, settings: FetchSettings, user: Option<String>) -> Self {
        let orchestrator = Orchestrator::new(pool.clone(), store.clone(), settings);
        let live = Mutex::new(LiveMerge::new(pool.clone(), store.clone()));
        Self {
            user,
            pool,
            store,
            orchestrator,
            live,
            local: RwLock::new(LocalState::default()),
            local_file: None,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn changes(&self) -> broadcast::Receiver<Change> {
        self.store.subscribe()
    }

    pub fn phase(&self) -> FetchPhase {
        self.orchestrator.phase()
    }

    pub async fn tombstone_policy(&self) -> TombstonePolicy {
        self.store.policy().await
    }

    /// 🔄 One full refresh around `center`. Coalesced if one is already running.
    pub async fn refresh(&self, center: Option<Coordinate>) -> RefreshOutcome {
        let request = FetchRequest {
            user: self.user.clone(),
            center,
            local: self.local.read().await.clone(),
        };
        self.orchestrator.refresh(&request).await
    }

    /// 📡 Re-scopes the live subscription to exactly these listings.
    pub async fn follow_listings(&self, scope: LiveScope) -> Result<()> {
        self.live.lock().await.follow(scope).await
    }

    /// 📡 Follows every listing the snapshot currently holds, and each of their spots by name.
    pub async fn follow_current(&self) -> Result<usize> {
        let scope = {
            let snapshot = self.store.read().await;
            let listings = snapshot.listing_addresses();
            let spots: Vec<_> = listings
                .iter()
                .flat_map(|listing| snapshot.spots_of(listing))
                .map(|spot| spot.address())
                .collect();
            LiveScope::new(listings).with_spots(spots)
        };
        let followed = scope.len();
        self.follow_listings(scope).await?;
        Ok(followed)
    }

    pub async fn stop_following(&self) {
        self.live.lock().await.close();
    }

    pub async fn is_following(&self) -> bool {
        self.live.lock().await.is_following()
    }

    /// 📝 Notes aren't part of a refresh. Ask for them when someone opens a status log.
    pub async fn fetch_notes(&self, status_log_id: &str) -> usize {
        let filter = Filter::new().kinds([kinds::NOTE]).tag("e", [status_log_id]);
        let records = self.pool.query(&filter).await;
        self.store.apply_records(&records).await;
        self.store.read().await.notes_for(status_log_id).len()
    }

    /// ✍️ A publisher over the same relays, signing with `signer`.
    pub fn publisher<S: RecordSigner>(&self, signer: S) -> Publisher<S> {
        Publisher::new(self.pool.clone(), signer)
    }

    pub async fn local_state(&self) -> LocalState {
        self.local.read().await.clone()
    }

    /// 💾 Replaces the local state and writes it through to the file, if there is one.
    pub async fn set_local_state(&self, state: LocalState) -> Result<()> {
        if let Some(file) = &self.local_file {
            file.save(&state).await?;
        }
        *self.local.write().await = state;
        Ok(())
    }
}
