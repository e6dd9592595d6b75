//! 📊 Aggregation: how many spots are actually free, counted from the ground up.
//!
//! The listing says it has 5 spots. The listing is a liar, or at least an optimist.
//! Counts here come only from Spot records we actually discovered (plus their
//! current status). A vehicle type nobody has published a spot for is "not
//! available", no matter what the advisory total claims.
//!
//! The last-resort chain, in order:
//! 1. `Discovered`: real Spot records.
//! 2. `StatusOnly`: no Spot records, but status logs rooted at the listing name
//!    their spots, so we count those.
//! 3. `Advisory`: nothing at all; the advisory total is exposed for display and
//!    every vehicle type stays "not available".

use std::collections::BTreeMap;

use crate::entities::{Address, Listing, Rate, SpotStatus, VehicleType};

/// 🔢 One vehicle type's buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccupancyCounts {
    pub open: u32,
    pub occupied: u32,
    pub closed: u32,
    pub total: u32,
}

impl OccupancyCounts {
    fn bucket(&mut self, status: SpotStatus) -> &mut u32 {
        match status {
            SpotStatus::Open => &mut self.open,
            SpotStatus::Occupied => &mut self.occupied,
            SpotStatus::Closed => &mut self.closed,
        }
    }

    pub fn add(&mut self, status: SpotStatus) {
        *self.bucket(status) += 1;
        self.total += 1;
    }

    /// Moves one spot between buckets. O(1), no rescan.
    pub fn shift(&mut self, from: SpotStatus, to: SpotStatus) {
        if from == to {
            return;
        }
        let source = self.bucket(from);
        *source = source.saturating_sub(1);
        *self.bucket(to) += 1;
    }

    fn absorb(&mut self, other: &OccupancyCounts) {
        self.open += other.open;
        self.occupied += other.occupied;
        self.closed += other.closed;
        self.total += other.total;
    }
}

/// 🚦 What a vehicle type looks like from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    NotAvailable,
    Counted(OccupancyCounts),
}

/// 🧱 Where the counts came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountBasis {
    Discovered,
    StatusOnly,
    Advisory,
    Nothing,
}

/// 📋 Per-listing, per-vehicle-type occupancy plus advisory rates.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingAggregate {
    pub listing: Address,
    pub by_vehicle: BTreeMap<VehicleType, OccupancyCounts>,
    pub rates: BTreeMap<VehicleType, Rate>,
    pub basis: CountBasis,
    pub advisory_total: Option<u32>,
}

impl ListingAggregate {
    pub fn availability(&self, vehicle: VehicleType) -> Availability {
        match self.by_vehicle.get(&vehicle) {
            Some(counts) if counts.total > 0 => Availability::Counted(*counts),
            _ => Availability::NotAvailable,
        }
    }

    pub fn totals(&self) -> OccupancyCounts {
        let mut sum = OccupancyCounts::default();
        for counts in self.by_vehicle.values() {
            sum.absorb(counts);
        }
        sum
    }

    /// 🔒 At least one counted spot, and nothing open or occupied anywhere.
    pub fn is_closed(&self) -> bool {
        let totals = self.totals();
        totals.total > 0 && totals.open + totals.occupied == 0
    }

    /// Incremental path: one spot moved from `from` to `to`.
    pub(crate) fn shift(&mut self, vehicle: VehicleType, from: SpotStatus, to: SpotStatus) {
        if let Some(counts) = self.by_vehicle.get_mut(&vehicle) {
            counts.shift(from, to);
        }
    }
}

/// 🧮 One spot as the aggregator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotObservation {
    pub vehicle: VehicleType,
    pub status: SpotStatus,
}

/// 🧮 Full recompute. The consistency backstop for every incremental update.
///
/// `discovered` are visible Spot records under the listing; `status_only` are spots
/// inferred from status logs, used only when `discovered` is empty.
pub fn aggregate(
    listing_address: &Address,
    listing: Option<&Listing>,
    discovered: impl IntoIterator<Item = SpotObservation>,
    status_only: impl IntoIterator<Item = SpotObservation>,
) -> ListingAggregate {
    let mut by_vehicle: BTreeMap<VehicleType, OccupancyCounts> = BTreeMap::new();
    for spot in discovered {
        by_vehicle.entry(spot.vehicle).or_default().add(spot.status);
    }
    let mut basis = CountBasis::Discovered;

    if by_vehicle.is_empty() {
        for spot in status_only {
            by_vehicle.entry(spot.vehicle).or_default().add(spot.status);
        }
        basis = CountBasis::StatusOnly;
    }

    let advisory_total = listing.and_then(|l| l.advisory_total_spots);
    if by_vehicle.is_empty() {
        basis = if advisory_total.is_some() {
            CountBasis::Advisory
        } else {
            CountBasis::Nothing
        };
    }

    ListingAggregate {
        listing: listing_address.clone(),
        by_vehicle,
        rates: listing.map(|l| l.rates.clone()).unwrap_or_default(),
        basis,
        advisory_total,
    }
}
