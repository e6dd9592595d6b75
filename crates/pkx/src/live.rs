//! 📡 Live merge: keep the snapshot current while the user is looking at it.
//!
//! One subscription at a time, scoped to the listings on screen: the listings
//! themselves (by author and `d`) and everything that points at them with an `a`
//! tag (spots, status logs, tombstones). Known spots are followed by address too,
//! since a status log may name its spot and nothing else. Every record that comes in goes through
//! the same apply path the fetch phases use, so duplicates, replays and
//! out-of-order delivery all land in the same place.
//!
//! Re-scoping closes the old subscription before the new one opens. Closing is
//! idempotent, and dropping a [`LiveMerge`] closes whatever it was holding.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::entities::Address;
use crate::records::{Filter, Record, kinds};
use crate::relays::{PoolSubscription, RelayPool};
use crate::snapshot::SnapshotStore;
use crate::supervisors::workers::{LiveWorker, Worker};

/// 🔭 The set of listings (and their known spots) a live subscription is about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveScope {
    listings: BTreeSet<Address>,
    spots: BTreeSet<Address>,
}

impl LiveScope {
    pub fn new(listings: impl IntoIterator<Item = Address>) -> Self {
        Self {
            listings: listings
                .into_iter()
                .filter(|address| address.kind == kinds::LISTING)
                .collect(),
            spots: BTreeSet::new(),
        }
    }

    /// 🚗 Also follow status logs and tombstones that name one of these spots directly.
    pub fn with_spots(mut self, spots: impl IntoIterator<Item = Address>) -> Self {
        self.spots
            .extend(spots.into_iter().filter(|address| address.kind == kinds::SPOT));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn listings(&self) -> impl Iterator<Item = &Address> {
        self.listings.iter()
    }

    pub fn spots(&self) -> impl Iterator<Item = &Address> {
        self.spots.iter()
    }

    /// 🔎 One listing filter per author, plus one filter for everything tagged with a scoped address.
    pub fn filters(&self) -> Vec<Filter> {
        let mut by_author: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for address in &self.listings {
            by_author
                .entry(address.author.as_str())
                .or_default()
                .push(address.d_tag.as_str());
        }
        let mut filters: Vec<Filter> = by_author
            .into_iter()
            .map(|(author, d_tags)| {
                Filter::new()
                    .kinds([kinds::LISTING])
                    .authors([author])
                    .tag("d", d_tags)
            })
            .collect();
        if !self.listings.is_empty() {
            filters.push(
                Filter::new()
                    .kinds([kinds::SPOT, kinds::STATUS_LOG, kinds::TOMBSTONE])
                    .tag("a", self.listings.iter().map(ToString::to_string)),
            );
        }
        if !self.spots.is_empty() {
            filters.push(
                Filter::new()
                    .kinds([kinds::STATUS_LOG, kinds::TOMBSTONE])
                    .tag("a", self.spots.iter().map(ToString::to_string)),
            );
        }
        filters
    }

    /// ✅ Listings must be in scope by exact address. Children were scoped by the relay filter.
    pub fn admits(&self, record: &Record) -> bool {
        if record.kind != kinds::LISTING {
            return true;
        }
        record
            .tag_value("d")
            .is_some_and(|d_tag| self.listings.contains(&Address::new(kinds::LISTING, record.author.clone(), d_tag)))
    }
}

#[derive(Debug)]
struct Following {
    scope: LiveScope,
    subscription: PoolSubscription,
    worker: JoinHandle<Result<()>>,
}

/// 🔁 Owns the one live subscription and the worker draining it into the store.
#[derive(Debug)]
pub struct LiveMerge {
    pool: RelayPool,
    store: SnapshotStore,
    current: Option<Following>,
}

impl LiveMerge {
    pub fn new(pool: RelayPool, store: SnapshotStore) -> Self {
        Self {
            pool,
            store,
            current: None,
        }
    }

    pub fn scope(&self) -> Option<&LiveScope> {
        self.current.as_ref().map(|following| &following.scope)
    }

    pub fn is_following(&self) -> bool {
        self.current.is_some()
    }

    /// 🎧 Closes whatever was open, then subscribes to `scope`. An empty scope just closes.
    pub async fn follow(&mut self, scope: LiveScope) -> Result<()> {
        self.close();
        if scope.is_empty() {
            debug!("🔭 empty live scope; nothing to follow");
            return Ok(());
        }
        let subscription = self
            .pool
            .subscribe(&scope.filters())
            .await
            .context("💀 could not open the live subscription on any relay")?;
        let worker = LiveWorker::new(subscription.receiver(), self.store.clone(), scope.clone()).start();
        info!("📡 following {} listings live", scope.len());
        self.current = Some(Following {
            scope,
            subscription,
            worker,
        });
        Ok(())
    }

    /// 🛑 Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut following) = self.current.take() {
            following.subscription.close();
            following.worker.abort();
            debug!("🛑 stopped following {} listings", following.scope.len());
        }
    }
}

impl Drop for LiveMerge {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::entities::{SpotStatus, TombstonePolicy};
    use crate::orchestrator::tests::{child, listing_at};
    use crate::relays::{InMemoryRelay, Relay};
    use crate::relays::pool::tests::pool_of;
    use crate::snapshot::Change;

    fn garage() -> Address {
        Address::new(kinds::LISTING, "keyA", "garage-1")
    }

    fn status(id: &str, created_at: u64, status: &str) -> Record {
        child(
            id,
            kinds::STATUS_LOG,
            "ephemeral",
            created_at,
            vec![
                vec!["a".to_string(), "37141:keyA:garage-1/1".to_string()],
                vec!["a".to_string(), garage().to_string(), String::new(), "root".to_string()],
                vec!["status".to_string(), status.to_string()],
            ],
        )
    }

    async fn wait_for(changes: &mut tokio::sync::broadcast::Receiver<Change>, wanted: impl Fn(&Change) -> bool) {
        let found = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match changes.recv().await {
                    Ok(change) if wanted(&change) => return,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => panic!("💀 change feed closed"),
                }
            }
        })
        .await;
        assert!(found.is_ok(), "💀 the change never showed up");
    }

    #[test]
    fn the_one_where_the_scope_knows_what_belongs() {
        let scope = LiveScope::new([garage(), Address::new(kinds::SPOT, "keyA", "not-a-listing")]);
        assert_eq!(scope.len(), 1);
        assert_eq!(scope.filters().len(), 2);
        assert!(scope.admits(&listing_at("in", "keyA", "garage-1", 1, None)));
        assert!(!scope.admits(&listing_at("out", "keyA", "garage-2", 1, None)));
        assert!(LiveScope::default().filters().is_empty());

        let with_spots = scope.with_spots([
            Address::new(kinds::SPOT, "keyA", "garage-1/1"),
            garage(),
        ]);
        assert_eq!(with_spots.spots().count(), 1, "a listing is not a spot");
        assert_eq!(with_spots.filters().len(), 3);
    }

    #[tokio::test]
    async fn the_one_where_a_rootless_status_still_finds_its_way_in() -> Result<()> {
        let relay = InMemoryRelay::new("memory://rootless");
        let spot = Address::new(kinds::SPOT, "keyA", "garage-1/1");
        relay
            .seed([
                listing_at("l", "keyA", "garage-1", 10, None),
                child(
                    "s1",
                    kinds::SPOT,
                    "keyA",
                    11,
                    vec![
                        vec!["d".to_string(), "garage-1/1".to_string()],
                        vec!["a".to_string(), garage().to_string(), String::new(), "root".to_string()],
                    ],
                ),
            ])
            .await;
        let store = SnapshotStore::new(TombstonePolicy::default(), 1024);
        let mut changes = store.subscribe();
        let mut live = LiveMerge::new(pool_of(&[&relay]), store.clone());

        live.follow(LiveScope::new([garage()]).with_spots([spot.clone()])).await?;
        wait_for(&mut changes, |change| *change == Change::BacklogComplete).await;

        // 🤐 names the spot, says nothing about the garage
        let rootless = child(
            "st-rootless",
            kinds::STATUS_LOG,
            "ephemeral",
            40,
            vec![
                vec!["a".to_string(), spot.to_string()],
                vec!["status".to_string(), "occupied".to_string()],
            ],
        );
        relay.publish(&rootless).await?;
        wait_for(&mut changes, |change| matches!(change, Change::StatusChanged { to: SpotStatus::Occupied, .. })).await;
        assert_eq!(store.read().await.status_of(&spot), SpotStatus::Occupied);
        assert_eq!(store.read().await.aggregate(&garage()).map(|a| a.totals().occupied), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_live_statuses_flow_into_the_snapshot() -> Result<()> {
        let relay = InMemoryRelay::new("memory://live");
        relay.seed([listing_at("l", "keyA", "garage-1", 10, None)]).await;
        let store = SnapshotStore::new(TombstonePolicy::default(), 1024);
        let mut changes = store.subscribe();
        let mut live = LiveMerge::new(pool_of(&[&relay]), store.clone());

        live.follow(LiveScope::new([garage()])).await?;
        wait_for(&mut changes, |change| *change == Change::BacklogComplete).await;
        assert_eq!(store.read().await.listing_addresses().len(), 1);

        relay.publish(&status("st-first", 30, "closed")).await?;
        relay.publish(&status("st-late", 80, "open")).await?;
        relay.publish(&status("st-early", 50, "occupied")).await?;
        wait_for(&mut changes, |change| matches!(change, Change::StatusChanged { .. })).await;

        let spot = Address::new(kinds::SPOT, "keyA", "garage-1/1");
        let settled = tokio::time::timeout(Duration::from_secs(2), async {
            while store.read().await.status_history(&spot).len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok(), "💀 live statuses never landed");
        assert_eq!(store.read().await.status_of(&spot), SpotStatus::Open, "t=80 beats the late t=50");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_rescoping_drops_the_old_listing_stream() -> Result<()> {
        let relay = InMemoryRelay::new("memory://rescope");
        let store = SnapshotStore::new(TombstonePolicy::default(), 1024);
        let mut changes = store.subscribe();
        let mut live = LiveMerge::new(pool_of(&[&relay]), store.clone());

        live.follow(LiveScope::new([garage()])).await?;
        let elsewhere = Address::new(kinds::LISTING, "keyB", "lot-7");
        live.follow(LiveScope::new([elsewhere.clone()])).await?;
        assert_eq!(live.scope().map(LiveScope::len), Some(1));
        wait_for(&mut changes, |change| *change == Change::BacklogComplete).await;

        relay.publish(&listing_at("old-scope", "keyA", "garage-1", 20, None)).await?;
        relay.publish(&listing_at("new-scope", "keyB", "lot-7", 20, None)).await?;
        wait_for(&mut changes, |change| *change == Change::ListingUpdated(elsewhere.clone())).await;
        assert!(store.read().await.listing(&garage()).is_none(), "the old scope is gone");

        live.close();
        live.close();
        assert!(!live.is_following());
        Ok(())
    }
}
