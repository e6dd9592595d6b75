//! 🎬 The fetch orchestrator: one refresh, four phases, zero excuses.
//!
//! ```text
//! Idle -> FetchOwned -> FetchSaved -> FetchPublic -> Merge -> FetchChildren -> Done
//! ```
//!
//! - **Owned**: listings the user authored or holds a capability on. Location
//!   independent, so the user's own garages show up even when search comes back empty.
//! - **Saved**: the bookmarks handed in by the caller, exact addresses only.
//! - **Public**: the geohash ladder around the search center, finest first, then one
//!   unscoped, limit-bounded global query when every rung came back empty.
//! - **Merge**: everything above into a fresh snapshot, superseded and tombstoned
//!   versions filtered out, swapped in as the new current state.
//! - **Children**: spots, status logs and tombstones for the merged listings, in
//!   fixed-size batches, each batch applied and announced as soon as it lands.
//!
//! A phase that fails contributes nothing and the next one runs anyway. A failed
//! child batch never takes back what the earlier phases already produced. 🦆

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::{StreamExt, stream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::entities::Address;
use crate::geohash::{Coordinate, MAX_PRECISION, search_ladder};
use crate::local_state::LocalState;
use crate::records::{Filter, Record, dedup_by_id, kinds};
use crate::relays::RelayPool;
use crate::snapshot::{Change, Snapshot, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchPhase {
    Idle,
    FetchOwned,
    FetchSaved,
    FetchPublic,
    Merge,
    FetchChildren,
    Done,
}

impl fmt::Display for FetchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchPhase::Idle => "idle",
            FetchPhase::FetchOwned => "owned",
            FetchPhase::FetchSaved => "saved",
            FetchPhase::FetchPublic => "public",
            FetchPhase::Merge => "merge",
            FetchPhase::FetchChildren => "children",
            FetchPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// 🔧 Knobs for one refresh.
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub child_batch_size: usize,
    pub child_parallelism: usize,
    pub global_fallback_limit: usize,
    pub search_max_precision: usize,
    pub search_min_precision: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            child_batch_size: 10,
            child_parallelism: 4,
            global_fallback_limit: 200,
            search_max_precision: MAX_PRECISION,
            search_min_precision: 3,
        }
    }
}

/// 📨 Everything one refresh needs from the caller. Nothing is read from ambient state.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub user: Option<String>,
    pub center: Option<Coordinate>,
    pub local: LocalState,
}

/// 🪜 How far down the search ladder the public phase had to go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublicReach {
    /// Hits at this geohash precision.
    Precision(usize),
    GlobalFallback,
    #[default]
    Nothing,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub owned: usize,
    pub saved: usize,
    pub public: usize,
    pub public_reach: PublicReach,
    pub listings: usize,
    pub child_batches: usize,
    pub child_records: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// Another refresh was already running; this trigger was folded into it.
    Coalesced,
}

/// Clears the in-flight flag however the refresh ends, cancellation included.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    pool: RelayPool,
    store: SnapshotStore,
    settings: FetchSettings,
    phase: Arc<watch::Sender<FetchPhase>>,
    in_flight: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(pool: RelayPool, store: SnapshotStore, settings: FetchSettings) -> Self {
        let (phase, _) = watch::channel(FetchPhase::Idle);
        Self {
            pool,
            store,
            settings,
            phase: Arc::new(phase),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> FetchPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<FetchPhase> {
        self.phase.subscribe()
    }

    /// 🔄 Runs one full refresh, unless one is already running.
    pub async fn refresh(&self, request: &FetchRequest) -> RefreshOutcome {
        // 🚦 one refresh at a time. The second one in line just gets the first one's results.
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("🛑 refresh already in flight; coalescing");
            return RefreshOutcome::Coalesced;
        }
        let _in_flight = InFlight(&self.in_flight);
        RefreshOutcome::Completed(self.run(request).await)
    }

    async fn run(&self, request: &FetchRequest) -> RefreshReport {
        let started = Instant::now();
        let mut report = RefreshReport::default();
        let policy = self.store.policy().await;

        self.enter(FetchPhase::FetchOwned);
        let owned = match request.user.as_deref() {
            Some(user) => self.fetch_owned(user).await,
            None => Vec::new(),
        };
        report.owned = owned.len();
        self.completed(FetchPhase::FetchOwned, owned.len());

        self.enter(FetchPhase::FetchSaved);
        let saved = self.fetch_saved(&request.local.bookmarks).await;
        report.saved = saved.len();
        self.completed(FetchPhase::FetchSaved, saved.len());

        self.enter(FetchPhase::FetchPublic);
        let (public, reach) = self.fetch_public(request.center, &request.local).await;
        report.public = public.len();
        report.public_reach = reach;
        self.completed(FetchPhase::FetchPublic, public.len());

        // 🧪 brand new snapshot, so nothing stale from the last refresh sneaks back in
        self.enter(FetchPhase::Merge);
        let mut fresh = Snapshot::new(policy);
        for record in owned.iter().chain(&saved).chain(&public) {
            fresh.apply(record);
        }
        // 🪦 ask about funerals before we swap it in, not after the mourners see the body
        for tombstone in self.fetch_listing_tombstones(&fresh).await {
            fresh.apply(&tombstone);
        }
        let parents: Vec<Address> = fresh.listing_addresses().into_iter().collect();
        report.listings = parents.len();
        self.store.install(fresh).await;
        self.completed(FetchPhase::Merge, parents.len());

        self.enter(FetchPhase::FetchChildren);
        let (batches, records) = self.fetch_children(&parents).await;
        report.child_batches = batches;
        report.child_records = records;
        self.completed(FetchPhase::FetchChildren, records);

        self.enter(FetchPhase::Done);
        report.elapsed = started.elapsed();
        info!(
            "✅ refresh done: {} listings ({} owned, {} saved, {} public via {:?}), {} child records in {} batches, {:?}",
            report.listings,
            report.owned,
            report.saved,
            report.public,
            report.public_reach,
            report.child_records,
            report.child_batches,
            report.elapsed
        );
        report
    }

    fn enter(&self, phase: FetchPhase) {
        debug!("🎬 fetch phase: {}", phase);
        self.phase.send_replace(phase);
    }

    fn completed(&self, phase: FetchPhase, records: usize) {
        self.store.notify(Change::PhaseCompleted { phase, records });
    }

    /// 🏠 Phase A: authored by the user, or naming them in a capability tag.
    async fn fetch_owned(&self, user: &str) -> Vec<Record> {
        let filters = [
            Filter::new().kinds([kinds::LISTING]).authors([user]),
            Filter::new().kinds([kinds::LISTING]).tag("p", [user]),
        ];
        self.pool.query_many(&filters).await
    }

    /// 🔖 Phase B: one filter per (kind, author), then trimmed to the exact bookmarks.
    async fn fetch_saved(&self, bookmarks: &[Address]) -> Vec<Record> {
        if bookmarks.is_empty() {
            return Vec::new();
        }
        // 🧺 relays only do equality, so bookmarks get grouped per (kind, author) and trimmed after
        let mut filters: Vec<Filter> = Vec::new();
        let mut grouped: Vec<(u32, &str, Vec<&str>)> = Vec::new();
        for address in bookmarks {
            match grouped
                .iter_mut()
                .find(|(kind, author, _)| *kind == address.kind && *author == address.author)
            {
                Some((_, _, d_tags)) => d_tags.push(address.d_tag.as_str()),
                None => grouped.push((address.kind, address.author.as_str(), vec![address.d_tag.as_str()])),
            }
        }
        for (kind, author, d_tags) in grouped {
            filters.push(Filter::new().kinds([kind]).authors([author]).tag("d", d_tags));
        }
        self.pool
            .query_many(&filters)
            .await
            .into_iter()
            .filter(|record| record_address(record).is_some_and(|address| bookmarks.contains(&address)))
            .collect()
    }

    /// 🌍 Phase C: walk the ladder, then fall back to the global query.
    async fn fetch_public(&self, center: Option<Coordinate>, local: &LocalState) -> (Vec<Record>, PublicReach) {
        if let Some(center) = center {
            let ladder = search_ladder(
                center,
                self.settings.search_max_precision,
                self.settings.search_min_precision,
            );
            // 🪜 finest cell first. Widen only when the neighborhood is a parking desert.
            for (precision, prefix) in ladder {
                let hits = self
                    .pool
                    .query(&Filter::new().kinds([kinds::LISTING]).tag("g", [prefix]))
                    .await;
                let visible = without_hidden(hits, local);
                if !visible.is_empty() {
                    debug!("🗺️ {} public listings at precision {}", visible.len(), precision);
                    return (visible, PublicReach::Precision(precision));
                }
            }
            debug!("🪜 every rung came back empty; trying the global query");
        }
        // 🌍 last resort: ask everyone about everything, politely capped
        let hits = self
            .pool
            .query(
                &Filter::new()
                    .kinds([kinds::LISTING])
                    .limit(self.settings.global_fallback_limit),
            )
            .await;
        let visible = without_hidden(hits, local);
        if visible.is_empty() {
            (visible, PublicReach::Nothing)
        } else {
            (visible, PublicReach::GlobalFallback)
        }
    }

    /// 🪦 Tombstones that name merged listings by address or by id.
    async fn fetch_listing_tombstones(&self, snapshot: &Snapshot) -> Vec<Record> {
        let listings: Vec<_> = snapshot.visible_listings().collect();
        // 🔍 by address and by id, because tombstone authors never agree on which one to use
        let filters: Vec<Filter> = listings
            .chunks(self.settings.child_batch_size.max(1))
            .flat_map(|chunk| {
                [
                    Filter::new()
                        .kinds([kinds::TOMBSTONE])
                        .tag("a", chunk.iter().map(|listing| listing.address().to_string())),
                    Filter::new()
                        .kinds([kinds::TOMBSTONE])
                        .tag("e", chunk.iter().map(|listing| listing.meta.id.clone())),
                ]
            })
            .collect();
        if filters.is_empty() {
            return Vec::new();
        }
        self.pool.query_many(&filters).await
    }

    /// 🧒 Phase D: children in batches, each applied the moment it arrives.
    ///
    /// A batch is two round trips: everything that names the batch's listings, then
    /// status logs and tombstones that only name a spot that round trip turned up.
    async fn fetch_children(&self, parents: &[Address]) -> (usize, usize) {
        let batch_size = self.settings.child_batch_size.max(1);
        let batches: Vec<Vec<String>> = parents
            .chunks(batch_size)
            .map(|chunk| chunk.iter().map(ToString::to_string).collect())
            .collect();
        let of = batches.len();

        let mut arrivals = stream::iter(batches.into_iter().map(|batch| async move {
            let rooted = Filter::new()
                .kinds([kinds::SPOT, kinds::STATUS_LOG, kinds::TOMBSTONE])
                .tag("a", batch);
            let mut children = self.pool.query(&rooted).await;

            // 👶 the kids who never mention their parents
            let mut spots: Vec<String> = children
                .iter()
                .filter(|record| record.kind == kinds::SPOT)
                .filter_map(record_address)
                .map(|address| address.to_string())
                .collect();
            spots.sort();
            spots.dedup();
            if spots.is_empty() {
                return children;
            }
            let by_spot: Vec<Filter> = spots
                .chunks(batch_size)
                .map(|chunk| {
                    Filter::new()
                        .kinds([kinds::STATUS_LOG, kinds::TOMBSTONE])
                        .tag("a", chunk.iter().cloned())
                })
                .collect();
            children.extend(self.pool.query_many(&by_spot).await);
            dedup_by_id(children)
        }))
        .buffer_unordered(self.settings.child_parallelism.max(1));

        let mut applied = 0;
        let mut records = 0;
        // 🎁 unwrap each batch as it lands; whoever is fastest gets drawn first
        while let Some(children) = arrivals.next().await {
            applied += 1;
            records += children.len();
            if children.is_empty() {
                warn!("🫥 child batch {}/{} came back empty", applied, of);
            }
            self.store.apply_records(&children).await;
            self.store.notify(Change::ChildBatchApplied { batch: applied, of });
        }
        (of, records)
    }
}

fn record_address(record: &Record) -> Option<Address> {
    record
        .tag_value("d")
        .map(|d_tag| Address::new(record.kind, record.author.clone(), d_tag))
}

fn without_hidden(records: Vec<Record>, local: &LocalState) -> Vec<Record> {
    if local.hidden_ids.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| match record_address(record) {
            Some(address) => !local.is_hidden(&record.id, &address),
            None => !local.hidden_ids.contains(&record.id),
        })
        .collect()
}
