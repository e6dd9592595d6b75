//! 🧠 Snapshot: the merged, deduplicated, always-converging view of the world.
//!
//! Records arrive from everywhere, in any order, some of them twice. This module
//! is where they become state. The rules, all of them order-independent:
//!
//! - addressable entities: keep the version that wins [`RecordMeta::is_newer_than`];
//! - status logs: keep the whole history; the current status of a spot is the
//!   winning, non-tombstoned log (or `open` when there is none);
//! - tombstones and the legacy sentinel hide, they never physically remove.
//!
//! Aggregates are maintained incrementally (one bucket shift per status change)
//! and fully recomputed whenever the set of spots behind a listing changes.
//!
//! [`SnapshotStore`] wraps all this in the one serialized "apply" path every
//! writer (fetch phases, live subscription) funnels through, and broadcasts a
//! [`Change`] for each thing that moved. 🦆

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, broadcast};
use tracing::{debug, trace};

use crate::aggregation::{self, CountBasis, ListingAggregate, SpotObservation};
use crate::entities::{
    self, Access, Address, Entity, Listing, Note, RecordMeta, Spot, SpotStatus, StatusLog, Tombstone,
    TombstoneIndex, TombstonePolicy, VehicleType, is_tombstoned,
};
use crate::local_state::LocalState;
use crate::orchestrator::FetchPhase;
use crate::records::{Record, kinds};

/// 📣 Something observers may want to redraw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    ListingUpdated(Address),
    SpotUpdated(Address),
    StatusChanged {
        spot: Address,
        from: SpotStatus,
        to: SpotStatus,
    },
    AggregateUpdated(Address),
    NoteAdded { status_log_id: String },
    TombstoneApplied { id: String },
    /// A refresh swapped in a freshly merged snapshot.
    SnapshotReplaced { listings: usize },
    PhaseCompleted { phase: FetchPhase, records: usize },
    ChildBatchApplied { batch: usize, of: usize },
    BacklogComplete,
}

/// 👀 Which slice of listings a caller wants to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingView {
    /// Authored by the user or naming them in a capability tag. Never hidden.
    Own,
    Public,
    Private,
}

/// Ascending history order: the last element is the winner.
fn history_order(a: &RecordMeta, b: &RecordMeta) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    policy: TombstonePolicy,
    listings: HashMap<Address, Listing>,
    spots: HashMap<Address, Spot>,
    spots_by_listing: HashMap<Address, BTreeSet<Address>>,
    history: HashMap<Address, Vec<StatusLog>>,
    status_log_spot: HashMap<String, Address>,
    /// Spots named by status logs rooted at each listing (the status-only fallback).
    status_roots: HashMap<Address, BTreeSet<Address>>,
    notes: HashMap<String, Vec<Note>>,
    note_ids: HashSet<String>,
    tombstones: TombstoneIndex,
    aggregates: HashMap<Address, ListingAggregate>,
}

impl Snapshot {
    pub fn new(policy: TombstonePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> TombstonePolicy {
        self.policy
    }

    // ===== Writes =====

    /// 📥 Decode and merge one record. Skips are logged and produce no change.
    pub fn apply(&mut self, record: &Record) -> Vec<Change> {
        match entities::decode(record) {
            Ok(entity) => self.apply_entity(entity),
            Err(reason) => {
                debug!("🙅 skipping record {}: {}", record.id, reason);
                Vec::new()
            }
        }
    }

    pub fn apply_entity(&mut self, entity: Entity) -> Vec<Change> {
        match entity {
            Entity::Listing(listing) => self.apply_listing(listing),
            Entity::Spot(spot) => self.apply_spot(spot),
            Entity::StatusLog(log) => self.apply_status_log(log),
            Entity::Note(note) => self.apply_note(note),
            Entity::Tombstone(tombstone) => self.apply_tombstone(tombstone),
        }
    }

    fn apply_listing(&mut self, listing: Listing) -> Vec<Change> {
        let address = listing.address();
        // 🥊 one address, one champion. The challenger has to actually be newer.
        if let Some(held) = self.listings.get(&address) {
            if !listing.meta.is_newer_than(&held.meta) {
                trace!("🥱 listing {} at {} is old news", address, listing.meta.created_at);
                return Vec::new();
            }
        }
        self.listings.insert(address.clone(), listing);
        let mut changes = vec![Change::ListingUpdated(address.clone())];
        changes.extend(self.refresh_aggregate(&address));
        changes
    }

    fn apply_spot(&mut self, spot: Spot) -> Vec<Change> {
        let address = spot.address();
        // 🏠 remember where it used to live; a spot that moves out leaves a hole in two counts
        let previous_parent = match self.spots.get(&address) {
            Some(held) if !spot.meta.is_newer_than(&held.meta) => return Vec::new(),
            Some(held) => held.listing.clone(),
            None => None,
        };
        let parent = spot.listing.clone();

        // 📦 moving day: off the old listing's roster, onto the new one
        if let Some(old) = &previous_parent {
            if parent.as_ref() != Some(old) {
                if let Some(siblings) = self.spots_by_listing.get_mut(old) {
                    siblings.remove(&address);
                }
            }
        }
        if let Some(new) = &parent {
            self.spots_by_listing
                .entry(new.clone())
                .or_default()
                .insert(address.clone());
        }
        self.spots.insert(address.clone(), spot);

        // 🧮 the spot set changed: full recompute for every listing that noticed.
        // That includes roots that were counting it status-only, whatever its `a` tag says.
        let status_roots = self
            .history
            .get(&address)
            .into_iter()
            .flatten()
            .filter_map(|log| log.listing.clone());
        let touched: BTreeSet<Address> = previous_parent.into_iter().chain(parent).chain(status_roots).collect();
        let mut changes = vec![Change::SpotUpdated(address)];
        for listing in &touched {
            changes.extend(self.refresh_aggregate(listing));
        }
        changes
    }

    fn apply_status_log(&mut self, log: StatusLog) -> Vec<Change> {
        // 🔁 seen it. Relays love telling the same story twice.
        if self.status_log_spot.contains_key(&log.meta.id) {
            return Vec::new();
        }
        let spot = log.spot.clone();
        let root = log.listing.clone();
        let before = self.status_of(&spot);

        self.status_log_spot.insert(log.meta.id.clone(), spot.clone());
        let newly_rooted = root.as_ref().is_some_and(|root| {
            self.status_roots
                .entry(root.clone())
                .or_default()
                .insert(spot.clone())
        });
        // 📜 history stays sorted, so the winner is always the last one standing
        let history = self.history.entry(spot.clone()).or_default();
        let position = history.partition_point(|held| history_order(&held.meta, &log.meta) == Ordering::Less);
        history.insert(position, log);

        let after = self.status_of(&spot);
        let mut changes = Vec::new();
        if before != after {
            changes.push(Change::StatusChanged {
                spot: spot.clone(),
                from: before,
                to: after,
            });
        }

        if newly_rooted {
            // a new spot may have joined the status-only count
            if let Some(root) = &root {
                changes.extend(self.refresh_aggregate(root));
            }
            let parent = self.visible_spot(&spot).and_then(|s| s.listing.clone());
            if let Some(parent) = parent.filter(|parent| Some(parent) != root.as_ref()) {
                if before != after {
                    changes.extend(self.shift_or_refresh(&spot, &parent, before, after));
                }
            }
        } else if before != after {
            changes.extend(self.propagate_status(&spot, root.as_ref(), before, after));
        }
        changes
    }

    /// ⚡ The incremental path: one status change, one bucket shift.
    fn propagate_status(
        &mut self,
        spot: &Address,
        root: Option<&Address>,
        from: SpotStatus,
        to: SpotStatus,
    ) -> Vec<Change> {
        if let Some(parent) = self.visible_spot(spot).and_then(|s| s.listing.clone()) {
            return self.shift_or_refresh(spot, &parent, from, to);
        }
        // 👻 undiscovered spot: only the status-only fallback can care
        match root {
            Some(root) if self.spots.contains_key(spot) => {
                trace!("🪦 status for hidden spot {} under {}", spot, root);
                Vec::new()
            }
            Some(root) if self.counts_discovered(root) => Vec::new(),
            Some(root) => self.refresh_aggregate(root).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn counts_discovered(&self, listing: &Address) -> bool {
        self.aggregates
            .get(listing)
            .is_some_and(|aggregate| aggregate.basis == CountBasis::Discovered)
    }

    fn shift_or_refresh(&mut self, spot: &Address, parent: &Address, from: SpotStatus, to: SpotStatus) -> Vec<Change> {
        if !self.counts_discovered(parent) {
            return self.refresh_aggregate(parent).into_iter().collect();
        }
        // 🚗 no vehicle on record means car. Most parking is, statistically, cars.
        let vehicle = self.spots.get(spot).map(|s| s.vehicle).unwrap_or(VehicleType::Car);
        if let Some(aggregate) = self.aggregates.get_mut(parent) {
            aggregate.shift(vehicle, from, to);
        }
        vec![Change::AggregateUpdated(parent.clone())]
    }

    fn apply_note(&mut self, note: Note) -> Vec<Change> {
        if !self.note_ids.insert(note.meta.id.clone()) {
            return Vec::new();
        }
        let status_log_id = note.status_log_id.clone();
        let notes = self.notes.entry(status_log_id.clone()).or_default();
        let position = notes.partition_point(|held| history_order(&held.meta, &note.meta) == Ordering::Less);
        notes.insert(position, note);
        vec![Change::NoteAdded { status_log_id }]
    }

    fn apply_tombstone(&mut self, tombstone: Tombstone) -> Vec<Change> {
        // 🕵️ first figure out who this tombstone is about, before it changes anyone's answer
        let mut listings: BTreeSet<Address> = BTreeSet::new();
        let mut spots: BTreeSet<Address> = BTreeSet::new();
        let mut status_spots: BTreeSet<Address> = BTreeSet::new();

        for address in &tombstone.target_addresses {
            match address.kind {
                kinds::LISTING => {
                    listings.insert(address.clone());
                }
                kinds::SPOT => {
                    spots.insert(address.clone());
                }
                _ => {}
            }
        }
        for id in &tombstone.target_ids {
            if let Some(spot) = self.status_log_spot.get(id) {
                status_spots.insert(spot.clone());
            }
            if let Some(listing) = self.listings.values().find(|l| &l.meta.id == id) {
                listings.insert(listing.address());
            }
            if let Some(spot) = self.spots.values().find(|s| &s.meta.id == id) {
                spots.insert(spot.address());
            }
        }
        status_spots.extend(spots.iter().cloned());

        // 📸 a before picture, so we can tell observers what actually moved
        let before: Vec<(Address, SpotStatus)> = status_spots
            .iter()
            .map(|spot| (spot.clone(), self.status_of(spot)))
            .collect();

        // 🪦 the same funeral twice is still one funeral
        if !self.tombstones.insert(&tombstone) {
            return Vec::new();
        }

        let mut changes = vec![Change::TombstoneApplied {
            id: tombstone.meta.id.clone(),
        }];
        let mut recompute: BTreeSet<Address> = listings.clone();
        changes.extend(listings.into_iter().map(Change::ListingUpdated));
        for spot in &spots {
            changes.push(Change::SpotUpdated(spot.clone()));
        }
        for (spot, from) in before {
            let to = self.status_of(&spot);
            if from != to {
                changes.push(Change::StatusChanged {
                    spot: spot.clone(),
                    from,
                    to,
                });
            }
            if let Some(parent) = self.spots.get(&spot).and_then(|s| s.listing.clone()) {
                recompute.insert(parent);
            }
            for log in self.history.get(&spot).into_iter().flatten() {
                if let Some(root) = &log.listing {
                    recompute.insert(root.clone());
                }
            }
        }
        for listing in &recompute {
            changes.extend(self.refresh_aggregate(listing));
        }
        changes
    }

    /// 🔁 Full recompute for one listing; returns a change only when something moved.
    fn refresh_aggregate(&mut self, listing: &Address) -> Option<Change> {
        let fresh = self.recompute(listing);
        // 🤫 same numbers, no announcement. Nobody wants a redraw for nothing.
        if self.aggregates.get(listing) == Some(&fresh) {
            return None;
        }
        self.aggregates.insert(listing.clone(), fresh);
        Some(Change::AggregateUpdated(listing.clone()))
    }

    // ===== Reads =====

    fn hidden(&self, meta: &RecordMeta, address: &Address) -> bool {
        is_tombstoned(meta, Some(address), &self.tombstones, self.policy)
    }

    /// The held listing, unless a tombstone or the sentinel says otherwise.
    pub fn listing(&self, address: &Address) -> Option<&Listing> {
        self.listings
            .get(address)
            .filter(|listing| !self.hidden(&listing.meta, address))
    }

    pub fn visible_listings(&self) -> impl Iterator<Item = &Listing> {
        self.listings
            .iter()
            .filter(|(address, listing)| !self.hidden(&listing.meta, address))
            .map(|(_, listing)| listing)
    }

    pub fn listing_addresses(&self) -> BTreeSet<Address> {
        self.visible_listings().map(Listing::address).collect()
    }

    /// 👀 One view of the listings, sorted by name. Hidden ids only suppress public/private.
    pub fn listings(&self, view: ListingView, user: Option<&str>, local: &LocalState) -> Vec<&Listing> {
        let mut picked: Vec<&Listing> = self
            .visible_listings()
            .filter(|listing| match view {
                ListingView::Own => user.is_some_and(|key| listing.involves(key)),
                ListingView::Public => {
                    listing.access == Access::Public && !local.is_hidden(&listing.meta.id, &listing.address())
                }
                ListingView::Private => {
                    listing.access == Access::Private && !local.is_hidden(&listing.meta.id, &listing.address())
                }
            })
            .collect();
        picked.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.d_tag.cmp(&b.d_tag)));
        picked
    }

    pub fn visible_spot(&self, address: &Address) -> Option<&Spot> {
        self.spots
            .get(address)
            .filter(|spot| !self.hidden(&spot.meta, address))
    }

    /// 🚗 Visible spots under a listing, in spot-number order.
    pub fn spots_of(&self, listing: &Address) -> Vec<&Spot> {
        let mut spots: Vec<&Spot> = self
            .spots_by_listing
            .get(listing)
            .into_iter()
            .flatten()
            .filter_map(|address| self.visible_spot(address))
            .collect();
        spots.sort_by(|a, b| a.number.cmp(&b.number).then_with(|| a.d_tag.cmp(&b.d_tag)));
        spots
    }

    /// The winning, non-deleted status log for a spot.
    pub fn current_status_log(&self, spot: &Address) -> Option<&StatusLog> {
        self.history.get(spot)?.iter().rev().find(|log| {
            !is_tombstoned(&log.meta, None, &self.tombstones, self.policy)
        })
    }

    /// 🚦 No status log at all means `open`.
    pub fn status_of(&self, spot: &Address) -> SpotStatus {
        self.current_status_log(spot)
            .map(|log| log.status)
            .unwrap_or(SpotStatus::Open)
    }

    /// 📜 Every status log ever seen for a spot, oldest first.
    pub fn status_history(&self, spot: &Address) -> &[StatusLog] {
        self.history.get(spot).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn notes_for(&self, status_log_id: &str) -> &[Note] {
        self.notes.get(status_log_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn aggregate(&self, listing: &Address) -> Option<&ListingAggregate> {
        self.aggregates.get(listing)
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &ListingAggregate> {
        self.aggregates.values()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// 🧮 Ground-up recompute from the current spots and statuses. Never touches state.
    pub fn recompute(&self, listing: &Address) -> ListingAggregate {
        let discovered: Vec<SpotObservation> = self
            .spots_of(listing)
            .into_iter()
            .map(|spot| SpotObservation {
                vehicle: spot.vehicle,
                status: self.status_of(&spot.address()),
            })
            .collect();

        // 👻 spots we only know from their status logs; a held spot record always outranks them
        let status_only: Vec<SpotObservation> = self
            .status_roots
            .get(listing)
            .into_iter()
            .flatten()
            .filter(|spot| !self.spots.contains_key(*spot))
            .filter_map(|spot| {
                let log = self.current_status_log(spot)?;
                Some(SpotObservation {
                    vehicle: log.vehicle.unwrap_or(VehicleType::Car),
                    status: log.status,
                })
            })
            .collect();

        aggregation::aggregate(listing, self.listing(listing), discovered, status_only)
    }
}

/// 🔒 The single-writer gate around a [`Snapshot`], plus the change feed.
///
/// Every write takes the write lock, applies, and broadcasts its changes before
/// letting go, so observers see changes in the same order state moved.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    inner: Arc<RwLock<Snapshot>>,
    changes: broadcast::Sender<Change>,
}

impl SnapshotStore {
    pub fn new(policy: TombstonePolicy, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            inner: Arc::new(RwLock::new(Snapshot::new(policy))),
            changes,
        }
    }

    pub async fn policy(&self) -> TombstonePolicy {
        self.inner.read().await.policy()
    }

    /// 📥 The apply path. Every writer comes through here.
    pub async fn apply_records(&self, records: &[Record]) -> Vec<Change> {
        self.apply_with(|snapshot| records.iter().flat_map(|record| snapshot.apply(record)).collect())
            .await
    }

    /// 📥 Same path, for writers that need to decide per record while holding the lock.
    pub async fn apply_with<F>(&self, apply: F) -> Vec<Change>
    where
        F: FnOnce(&mut Snapshot) -> Vec<Change>,
    {
        let mut snapshot = self.inner.write().await;
        let changes = apply(&mut snapshot);
        for change in &changes {
            // no receivers is fine; nobody is watching yet
            let _ = self.changes.send(change.clone());
        }
        changes
    }

    /// 🔄 Swaps in a freshly merged snapshot.
    pub async fn install(&self, fresh: Snapshot) {
        let listings = fresh.listing_addresses().len();
        let mut snapshot = self.inner.write().await;
        *snapshot = fresh;
        let _ = self.changes.send(Change::SnapshotReplaced { listings });
    }

    pub fn notify(&self, change: Change) {
        let _ = self.changes.send(change);
    }

    /// 👀 Pull-based read access.
    pub async fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.inner.read().await
    }

    /// 🔔 Push-based change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::records::test_support::record;

    pub(crate) const OWNER: &str = "keyA";

    pub(crate) fn garage_address() -> Address {
        Address::new(kinds::LISTING, OWNER, "garage-1")
    }

    pub(crate) fn listing_record(id: &str, created_at: u64, name: &str, extra: &[&[&str]]) -> Record {
        let name_tag = ["name", name];
        let mut tags: Vec<&[&str]> = Vec::new();
        tags.push(&["d", "garage-1"]);
        tags.push(&["location", "48.8584,2.2945"]);
        tags.push(&name_tag);
        tags.extend_from_slice(extra);
        record(id, kinds::LISTING, OWNER, created_at, &tags)
    }

    pub(crate) fn spot_record(id: &str, d_tag: &str, created_at: u64, vehicle: &str) -> Record {
        record(
            id,
            kinds::SPOT,
            OWNER,
            created_at,
            &[
                &["d", d_tag],
                &["a", "31147:keyA:garage-1", "", "root"],
                &["vehicle", vehicle],
            ],
        )
    }

    pub(crate) fn status_record(id: &str, spot_d_tag: &str, created_at: u64, status: &str) -> Record {
        let spot = format!("37141:keyA:{spot_d_tag}");
        record(
            id,
            kinds::STATUS_LOG,
            "ephemeral",
            created_at,
            &[
                &["a", spot.as_str()],
                &["a", "31147:keyA:garage-1", "", "root"],
                &["status", status],
            ],
        )
    }

    fn spot_address(d_tag: &str) -> Address {
        Address::new(kinds::SPOT, OWNER, d_tag)
    }

    /// 🧾 Everything observable about a snapshot, in a comparable shape.
    pub(crate) fn fingerprint(snapshot: &Snapshot) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for listing in snapshot.visible_listings() {
            lines.push(format!("L {} {} {}", listing.address(), listing.meta.id, listing.name));
        }
        for (address, spot) in &snapshot.spots {
            if snapshot.visible_spot(address).is_some() {
                lines.push(format!("S {} {} {:?}", address, spot.meta.id, spot.listing));
            }
        }
        for spot in snapshot.history.keys() {
            lines.push(format!("T {} {}", spot, snapshot.status_of(spot)));
        }
        for aggregate in snapshot.aggregates() {
            lines.push(format!("A {} {:?} {:?}", aggregate.listing, aggregate.by_vehicle, aggregate.basis));
        }
        lines.sort();
        lines
    }

    fn apply_all(records: &[Record]) -> Snapshot {
        let mut snapshot = Snapshot::new(TombstonePolicy::default());
        for record in records {
            snapshot.apply(record);
        }
        snapshot
    }

    fn assert_ground_up(snapshot: &Snapshot) {
        for aggregate in snapshot.aggregates() {
            assert_eq!(
                aggregate,
                &snapshot.recompute(&aggregate.listing),
                "💀 incremental aggregate drifted from the ground-up recompute for {}",
                aggregate.listing
            );
        }
    }

    /// 🎲 Tiny deterministic shuffle. No rand crate was harmed.
    fn shuffled(records: &[Record], seed: u64) -> Vec<Record> {
        let mut out = records.to_vec();
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        for i in (1..out.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            out.swap(i, j);
        }
        out
    }

    pub(crate) fn busy_day() -> Vec<Record> {
        vec![
            listing_record("l-old", 40, "Old Name", &[&["total_spots", "5"]]),
            listing_record("l-new", 100, "Garage One", &[&["total_spots", "5"]]),
            spot_record("s1", "g1/1", 10, "car"),
            spot_record("s2", "g1/2", 10, "car"),
            spot_record("s3", "g1/3", 10, "motorcycle"),
            spot_record("s3-v2", "g1/3", 20, "car"),
            status_record("st1", "g1/1", 50, "occupied"),
            status_record("st2", "g1/1", 80, "open"),
            status_record("st3", "g1/2", 60, "occupied"),
            status_record("st4", "g1/3", 70, "closed"),
            status_record("st5", "g1/2", 90, "closed"),
            status_record("st6", "g1/9", 95, "occupied"),
            record(
                "t1",
                kinds::TOMBSTONE,
                "ephemeral",
                100,
                &[&["e", "st5"], &["a", "31147:keyA:garage-1", "", "root"]],
            ),
        ]
    }

    #[test]
    fn the_one_where_the_newest_listing_wins_no_matter_who_shows_up_first() {
        let older = listing_record("l-old", 40, "Old Name", &[]);
        let newer = listing_record("l-new", 100, "Garage One", &[]);
        for order in [vec![older.clone(), newer.clone()], vec![newer.clone(), older.clone()]] {
            let snapshot = apply_all(&order);
            let views: Vec<_> = snapshot.visible_listings().collect();
            assert_eq!(views.len(), 1, "one identity, one entry");
            assert_eq!(views[0].name, "Garage One");
            assert_eq!(views[0].meta.created_at, 100);
        }
    }

    #[test]
    fn the_one_where_applying_twice_is_applying_once() {
        let mut snapshot = Snapshot::new(TombstonePolicy::default());
        let mut first_changes = 0;
        for record in busy_day() {
            first_changes += snapshot.apply(&record).len();
        }
        let once = fingerprint(&snapshot);
        for record in busy_day() {
            assert!(snapshot.apply(&record).is_empty(), "replay of {} changed something", record.id);
        }
        assert!(first_changes > 0);
        assert_eq!(fingerprint(&snapshot), once);
    }

    #[test]
    fn the_one_where_every_permutation_lands_in_the_same_place() {
        let mut sorted = busy_day();
        sorted.sort_by_key(|r| r.created_at);
        let the_truth = fingerprint(&apply_all(&sorted));
        for seed in 0..64 {
            let snapshot = apply_all(&shuffled(&busy_day(), seed));
            assert_eq!(fingerprint(&snapshot), the_truth, "seed {seed} wandered off");
            assert_ground_up(&snapshot);
        }
    }

    #[test]
    fn the_one_where_a_late_old_status_does_not_undo_a_newer_one() {
        let mut snapshot = apply_all(&[
            listing_record("l", 100, "Garage One", &[]),
            spot_record("s1", "g1/1", 10, "car"),
            status_record("st-open", "g1/1", 80, "open"),
        ]);
        let changes = snapshot.apply(&status_record("st-occupied", "g1/1", 50, "occupied"));
        assert!(!changes.iter().any(|c| matches!(c, Change::StatusChanged { .. })));
        assert_eq!(snapshot.status_of(&spot_address("g1/1")), SpotStatus::Open);
        assert_eq!(snapshot.status_history(&spot_address("g1/1")).len(), 2, "history keeps both");
    }

    #[test]
    fn the_one_where_a_status_change_is_one_bucket_shift() {
        let mut snapshot = apply_all(&[
            listing_record("l", 100, "Garage One", &[]),
            spot_record("s1", "g1/1", 10, "car"),
            spot_record("s2", "g1/2", 10, "car"),
        ]);
        let garage = garage_address();
        assert_eq!(snapshot.aggregate(&garage).map(|a| a.totals().open), Some(2));

        let changes = snapshot.apply(&status_record("st1", "g1/1", 60, "occupied"));
        assert!(changes.contains(&Change::StatusChanged {
            spot: spot_address("g1/1"),
            from: SpotStatus::Open,
            to: SpotStatus::Occupied,
        }));
        assert!(changes.contains(&Change::AggregateUpdated(garage.clone())));
        let totals = snapshot.aggregate(&garage).map(|a| a.totals()).unwrap_or_default();
        assert_eq!((totals.open, totals.occupied, totals.total), (1, 1, 2));
        assert_ground_up(&snapshot);
    }

    #[test]
    fn the_one_where_the_advisory_total_is_just_a_rumor() {
        let snapshot = apply_all(&[
            listing_record("l", 100, "Garage One", &[&["total_spots", "5"]]),
            spot_record("s1", "g1/1", 10, "car"),
            spot_record("s2", "g1/2", 10, "car"),
            spot_record("s3", "g1/3", 10, "car"),
        ]);
        let aggregate = snapshot.aggregate(&garage_address()).expect("💀 aggregate exists");
        assert_eq!(aggregate.totals().total, 3);
        assert_eq!(aggregate.advisory_total, Some(5));
        assert_eq!(aggregate.basis, CountBasis::Discovered);
    }

    #[test]
    fn the_one_where_tombstoning_the_winning_status_brings_back_the_runner_up() {
        let mut snapshot = apply_all(&[
            listing_record("l", 100, "Garage One", &[]),
            spot_record("s1", "g1/1", 10, "car"),
            status_record("st1", "g1/1", 50, "occupied"),
            status_record("st2", "g1/1", 60, "closed"),
        ]);
        assert_eq!(snapshot.status_of(&spot_address("g1/1")), SpotStatus::Closed);
        let changes = snapshot.apply(&record("t", kinds::TOMBSTONE, "ephemeral", 70, &[&["e", "st2"]]));
        assert!(changes.contains(&Change::StatusChanged {
            spot: spot_address("g1/1"),
            from: SpotStatus::Closed,
            to: SpotStatus::Occupied,
        }));
        assert_ground_up(&snapshot);
    }

    #[test]
    fn the_one_where_a_deleted_spot_stops_counting() {
        let mut snapshot = apply_all(&[
            listing_record("l", 100, "Garage One", &[]),
            spot_record("s1", "g1/1", 10, "car"),
            spot_record("s2", "g1/2", 10, "car"),
        ]);
        snapshot.apply(&record(
            "t",
            kinds::TOMBSTONE,
            OWNER,
            30,
            &[&["a", "37141:keyA:g1/2"], &["a", "31147:keyA:garage-1", "", "root"]],
        ));
        assert!(snapshot.visible_spot(&spot_address("g1/2")).is_none());
        assert_eq!(snapshot.aggregate(&garage_address()).map(|a| a.totals().total), Some(1));
        assert_ground_up(&snapshot);
    }

    #[test]
    fn the_one_where_status_logs_fill_in_for_missing_spot_records() {
        let snapshot = apply_all(&[
            listing_record("l", 100, "Garage One", &[&["total_spots", "9"]]),
            status_record("st1", "g1/1", 50, "occupied"),
            status_record("st2", "g1/2", 50, "open"),
        ]);
        let aggregate = snapshot.aggregate(&garage_address()).expect("💀 aggregate exists");
        assert_eq!(aggregate.basis, CountBasis::StatusOnly);
        assert_eq!(aggregate.totals().total, 2);
        assert_ground_up(&snapshot);
    }

    #[test]
    fn the_one_where_a_stray_spot_record_shows_up_after_its_status_logs() {
        // 🧳 one spot with no parent at all, one that swears it belongs to another garage
        let drifter = record("s-drifter", kinds::SPOT, OWNER, 10, &[&["d", "g1/1"], &["vehicle", "car"]]);
        let defector = record(
            "s-defector",
            kinds::SPOT,
            OWNER,
            10,
            &[&["d", "g1/2"], &["a", "31147:keyA:garage-2", "", "root"], &["vehicle", "car"]],
        );
        let day = vec![
            listing_record("l", 100, "Garage One", &[]),
            status_record("st1", "g1/1", 50, "occupied"),
            status_record("st2", "g1/2", 60, "closed"),
            drifter.clone(),
            defector.clone(),
        ];

        let mut snapshot = apply_all(&day[..3]);
        assert_eq!(snapshot.aggregate(&garage_address()).map(|a| a.basis), Some(CountBasis::StatusOnly));

        let changes = snapshot.apply(&drifter);
        assert!(changes.contains(&Change::AggregateUpdated(garage_address())));
        assert_ground_up(&snapshot);

        snapshot.apply(&defector);
        assert_ground_up(&snapshot);
        let aggregate = snapshot.aggregate(&garage_address()).expect("💀 aggregate exists");
        assert_eq!(aggregate.basis, CountBasis::Nothing, "both spots are accounted for elsewhere now");
        assert_eq!(aggregate.totals().total, 0);

        let the_truth = fingerprint(&snapshot);
        let mut backwards = day.clone();
        backwards.reverse();
        assert_eq!(fingerprint(&apply_all(&backwards)), the_truth);
        for seed in 0..32 {
            let shuffled_day = apply_all(&shuffled(&day, seed));
            assert_eq!(fingerprint(&shuffled_day), the_truth, "seed {seed} kept a stale status-only count");
            assert_ground_up(&shuffled_day);
        }
    }

    #[test]
    fn the_one_where_a_bare_deleted_marker_takes_the_listing_down_in_any_order() {
        let mut husk = record("l-husk", kinds::LISTING, OWNER, 200, &[&["d", "garage-1"]]);
        husk.content = entities::DELETED_SENTINEL.to_string();
        let original = listing_record("l-orig", 100, "Garage One", &[]);

        for order in [vec![original.clone(), husk.clone()], vec![husk.clone(), original.clone()]] {
            let mut snapshot = apply_all(&order);
            assert!(snapshot.listing(&garage_address()).is_none(), "💀 the deleted garage is still parked on screen");
            assert_eq!(snapshot.visible_listings().count(), 0);

            // 🧟 the owner changes their mind later
            snapshot.apply(&listing_record("l-back", 300, "Garage One Reopened", &[]));
            assert_eq!(
                snapshot.listing(&garage_address()).map(|l| l.name.as_str()),
                Some("Garage One Reopened")
            );
        }

        // 🕵️ a stranger's bare marker deletes the stranger's own address, not ours
        let mut imposter = record("l-imposter", kinds::LISTING, "keyZ", 500, &[&["d", "garage-1"]]);
        imposter.content = entities::DELETED_SENTINEL.to_string();
        let snapshot = apply_all(&[original, imposter]);
        assert!(snapshot.listing(&garage_address()).is_some());
    }

    #[test]
    fn the_one_where_hidden_ids_hide_from_strangers_but_not_from_owners() {
        let snapshot = apply_all(&[listing_record("l-hidden", 100, "Garage One", &[])]);
        let local = LocalState {
            hidden_ids: ["l-hidden".to_string()].into_iter().collect(),
            ..LocalState::default()
        };
        assert!(snapshot.listings(ListingView::Public, Some("stranger"), &local).is_empty());
        assert_eq!(snapshot.listings(ListingView::Own, Some(OWNER), &local).len(), 1);
        assert_eq!(snapshot.listings(ListingView::Public, None, &LocalState::default()).len(), 1);
    }

    #[tokio::test]
    async fn the_one_where_the_store_broadcasts_what_it_applied() {
        let store = SnapshotStore::new(TombstonePolicy::default(), 64);
        let mut feed = store.subscribe();
        let changes = store
            .apply_records(&[listing_record("l", 100, "Garage One", &[]), spot_record("s", "g1/1", 5, "car")])
            .await;
        assert!(!changes.is_empty());
        for expected in &changes {
            let got = feed.recv().await.expect("💀 the feed went quiet");
            assert_eq!(&got, expected);
        }
        assert_eq!(store.read().await.spots_of(&garage_address()).len(), 1);
    }
}
