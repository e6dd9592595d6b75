//! 🎭 Entities: generic records, decoded into things with names.
//!
//! One strict decode step turns a [`Record`] into an [`Entity`] or a [`SkipReason`].
//! All the defaulting and validation policy lives here, once, so nobody downstream
//! ever writes `tags.get(1).and_then(...).unwrap_or(...)` again. A malformed record
//! is a skip, logged and forgotten. It never takes its batch down with it.
//!
//! 🧠 Knowledge graph:
//! - Addressable (`Listing`, `Spot`): identity is `(kind, author, dTag)`, latest wins.
//! - Append-only (`StatusLog`, `Note`): no identity; keyed by what they point at.
//! - `Tombstone`: deletes by id and/or address. The legacy `"deleted"` content
//!   sentinel counts too.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::records::{Record, kinds};

pub mod address;
pub mod listing;
pub mod note;
pub mod spot;
pub mod status_log;
pub mod tombstone;

pub use address::{Address, AddressError};
pub use listing::{Access, Capabilities, Listing, Role};
pub use note::Note;
pub use spot::Spot;
pub use status_log::StatusLog;
pub use tombstone::Tombstone;

/// 🗑️ Content string that marks a soft-deleted record (the pre-tombstone convention).
pub const DELETED_SENTINEL: &str = "deleted";

/// 🙅 Why a record didn't make it past the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("kind {0} is not ours")]
    UnknownKind(u32),
    #[error("kind {kind} record is missing its '{tag}' tag")]
    MissingTag { kind: u32, tag: &'static str },
    #[error("tag '{tag}' has an unusable value '{value}'")]
    MalformedTag { tag: &'static str, value: String },
    #[error("tombstone targets nothing")]
    EmptyTombstone,
}

impl SkipReason {
    pub(crate) fn malformed(tag: &'static str, value: impl fmt::Display) -> Self {
        SkipReason::MalformedTag {
            tag,
            value: value.to_string(),
        }
    }
}

/// 🧾 The envelope fields every entity keeps from its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub id: String,
    pub author: String,
    pub created_at: u64,
    pub content: String,
}

impl RecordMeta {
    pub fn of(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            author: record.author.clone(),
            created_at: record.created_at,
            content: record.content.clone(),
        }
    }

    /// ⚖️ Later `created_at` wins; on an exact tie the lexicographically smaller id wins.
    ///
    /// Total and antisymmetric, so any arrival order converges on the same winner.
    /// A record is never newer than itself.
    pub fn is_newer_than(&self, other: &RecordMeta) -> bool {
        match self.created_at.cmp(&other.created_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.id < other.id,
        }
    }

    pub fn carries_sentinel(&self) -> bool {
        self.content == DELETED_SENTINEL
    }
}

/// 🚗 What kind of vehicle a spot (or rate) is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VehicleType {
    Car,
    Motorcycle,
    Bicycle,
    Truck,
}

impl VehicleType {
    pub const ALL: [VehicleType; 4] = [
        VehicleType::Car,
        VehicleType::Motorcycle,
        VehicleType::Bicycle,
        VehicleType::Truck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Bicycle => "bicycle",
            VehicleType::Truck => "truck",
        }
    }
}

impl FromStr for VehicleType {
    type Err = SkipReason;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "car" => Ok(VehicleType::Car),
            "motorcycle" => Ok(VehicleType::Motorcycle),
            "bicycle" => Ok(VehicleType::Bicycle),
            "truck" => Ok(VehicleType::Truck),
            other => Err(SkipReason::malformed("vehicle", other)),
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 🚦 The three moods of a parking spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpotStatus {
    Open,
    Occupied,
    Closed,
}

impl SpotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpotStatus::Open => "open",
            SpotStatus::Occupied => "occupied",
            SpotStatus::Closed => "closed",
        }
    }
}

impl FromStr for SpotStatus {
    type Err = SkipReason;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "open" => Ok(SpotStatus::Open),
            "occupied" => Ok(SpotStatus::Occupied),
            "closed" => Ok(SpotStatus::Closed),
            other => Err(SkipReason::malformed("status", other)),
        }
    }
}

impl fmt::Display for SpotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 💸 An hourly rate. Formatting it nicely is somebody else's job.
#[derive(Debug, Clone, PartialEq)]
pub struct Rate {
    pub hourly: f64,
    pub currency: String,
}

impl Rate {
    pub(crate) fn parse(hourly: &str, currency: Option<&String>) -> Result<Self, SkipReason> {
        let hourly: f64 = hourly
            .parse()
            .map_err(|_| SkipReason::malformed("rate", hourly))?;
        if !hourly.is_finite() || hourly < 0.0 {
            return Err(SkipReason::malformed("rate", hourly));
        }
        let currency = currency
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SkipReason::malformed("rate", "missing currency"))?;
        Ok(Rate {
            hourly,
            currency: currency.clone(),
        })
    }
}

/// 🎭 Everything the codec knows how to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Listing(Listing),
    Spot(Spot),
    StatusLog(StatusLog),
    Note(Note),
    Tombstone(Tombstone),
}

impl Entity {
    pub fn meta(&self) -> &RecordMeta {
        match self {
            Entity::Listing(listing) => &listing.meta,
            Entity::Spot(spot) => &spot.meta,
            Entity::StatusLog(log) => &log.meta,
            Entity::Note(note) => &note.meta,
            Entity::Tombstone(tombstone) => &tombstone.meta,
        }
    }
}

/// 🔍 Strict decode. `Err` is a skip with a reason, never an abort.
pub fn decode(record: &Record) -> Result<Entity, SkipReason> {
    match record.kind {
        kinds::LISTING => Listing::decode(record)
            .map(Entity::Listing)
            .or_else(|reason| soft_deleted(record, reason)),
        kinds::SPOT => Spot::decode(record)
            .map(Entity::Spot)
            .or_else(|reason| soft_deleted(record, reason)),
        kinds::STATUS_LOG => StatusLog::decode(record).map(Entity::StatusLog),
        kinds::NOTE => Note::decode(record).map(Entity::Note),
        kinds::TOMBSTONE => Tombstone::decode(record).map(Entity::Tombstone),
        other => Err(SkipReason::UnknownKind(other)),
    }
}

/// 🗑️ A sentinel version too bare to decode still deletes its address.
///
/// It is read as an address tombstone from the same author at the same
/// `created_at`, so it hides every version up to its own and a later republish
/// comes back, whichever order the relays deliver them in.
fn soft_deleted(record: &Record, reason: SkipReason) -> Result<Entity, SkipReason> {
    let d_tag = match record.tag_value("d") {
        Some(d_tag) if record.content == DELETED_SENTINEL && !d_tag.is_empty() => d_tag,
        _ => return Err(reason),
    };
    debug!("🗑️ {} is a bare sentinel for {}; reading it as a tombstone", record.id, d_tag);
    Ok(Entity::Tombstone(Tombstone {
        meta: RecordMeta::of(record),
        target_ids: Vec::new(),
        target_addresses: vec![Address::new(record.kind, record.author.clone(), d_tag)],
        scope: Vec::new(),
    }))
}

/// 📦 Decodes a whole batch, logging and dropping the skips.
pub fn decode_batch<'a>(records: impl IntoIterator<Item = &'a Record>) -> Vec<Entity> {
    records
        .into_iter()
        .filter_map(|record| match decode(record) {
            Ok(entity) => Some(entity),
            Err(reason) => {
                debug!("🙅 skipping record {}: {}", record.id, reason);
                None
            }
        })
        .collect()
}

/// 🪪 The map key for addressable entities. Append-only kinds have none.
pub fn identity(entity: &Entity) -> Option<Address> {
    match entity {
        Entity::Listing(listing) => Some(listing.address()),
        Entity::Spot(spot) => Some(spot.address()),
        Entity::StatusLog(_) | Entity::Note(_) | Entity::Tombstone(_) => None,
    }
}

/// ⚖️ True iff `a` and `b` share an identity and `a` wins the created-at contest.
pub fn supersedes(a: &Entity, b: &Entity) -> bool {
    match (identity(a), identity(b)) {
        (Some(left), Some(right)) if left == right => a.meta().is_newer_than(b.meta()),
        _ => false,
    }
}

/// 🔒 Whether a tombstone must come from the target's own author to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TombstonePolicy {
    pub require_author_match: bool,
}

impl Default for TombstonePolicy {
    fn default() -> Self {
        Self {
            require_author_match: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TombstoneMark {
    author: String,
    created_at: u64,
}

/// 🪦 Every tombstone seen so far, indexed by what it points at.
#[derive(Debug, Clone, Default)]
pub struct TombstoneIndex {
    by_id: HashMap<String, Vec<TombstoneMark>>,
    by_address: HashMap<Address, Vec<TombstoneMark>>,
    seen: HashSet<String>,
}

impl TombstoneIndex {
    /// Returns false when this exact tombstone was already indexed.
    pub fn insert(&mut self, tombstone: &Tombstone) -> bool {
        if !self.seen.insert(tombstone.meta.id.clone()) {
            return false;
        }
        let mark = TombstoneMark {
            author: tombstone.meta.author.clone(),
            created_at: tombstone.meta.created_at,
        };
        for id in &tombstone.target_ids {
            self.by_id.entry(id.clone()).or_default().push(mark.clone());
        }
        for address in &tombstone.target_addresses {
            self.by_address
                .entry(address.clone())
                .or_default()
                .push(mark.clone());
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn covers_id(&self, meta: &RecordMeta, policy: TombstonePolicy) -> bool {
        self.by_id.get(&meta.id).is_some_and(|marks| {
            marks
                .iter()
                .any(|mark| !policy.require_author_match || mark.author == meta.author)
        })
    }

    /// Address tombstones only reach versions at or before their own `created_at`.
    fn covers_address(&self, address: &Address, created_at: u64, policy: TombstonePolicy) -> bool {
        self.by_address.get(address).is_some_and(|marks| {
            marks.iter().any(|mark| {
                mark.created_at >= created_at
                    && (!policy.require_author_match || mark.author == address.author)
            })
        })
    }
}

/// 🪦 Deleted by tombstone (id or address) or by the legacy content sentinel.
pub fn is_tombstoned(
    meta: &RecordMeta,
    address: Option<&Address>,
    tombstones: &TombstoneIndex,
    policy: TombstonePolicy,
) -> bool {
    meta.carries_sentinel()
        || tombstones.covers_id(meta, policy)
        || address.is_some_and(|address| tombstones.covers_address(address, meta.created_at, policy))
}

/// 🧰 Tag helpers shared by the per-kind codecs.
pub(crate) mod tag_parsing {
    use super::*;
    use crate::geohash::Coordinate;

    pub(crate) fn required<'a>(record: &'a Record, tag: &'static str) -> Result<&'a str, SkipReason> {
        match record.tag_value(tag) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(SkipReason::MissingTag {
                kind: record.kind,
                tag,
            }),
        }
    }

    pub(crate) fn optional<'a>(record: &'a Record, tag: &str) -> Option<&'a str> {
        record.tag_value(tag).filter(|value| !value.is_empty())
    }

    pub(crate) fn coordinate(raw: &str) -> Result<Coordinate, SkipReason> {
        raw.parse()
            .map_err(|_| SkipReason::malformed("location", raw))
    }

    pub(crate) fn address(raw: &str, expected_kind: u32) -> Result<Address, SkipReason> {
        let address: Address = raw.parse().map_err(|_| SkipReason::malformed("a", raw))?;
        if address.kind != expected_kind {
            return Err(SkipReason::malformed("a", raw));
        }
        Ok(address)
    }

    /// `["a", address, relayHint, "root"]` carries the root marker in slot 3.
    pub(crate) fn is_root(tag: &[String]) -> bool {
        tag.get(3).is_some_and(|marker| marker == "root")
    }

    pub(crate) fn geohashes(record: &Record) -> Vec<String> {
        let mut hashes: Vec<String> = record
            .tags_named("g")
            .filter_map(|tag| tag.get(1))
            .filter(|hash| !hash.is_empty())
            .cloned()
            .collect();
        hashes.sort_by_key(|hash| hash.len());
        hashes.dedup();
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::test_support::record;

    fn listing_record(id: &str, created_at: u64) -> Record {
        record(
            id,
            kinds::LISTING,
            "keyA",
            created_at,
            &[&["d", "garage-1"], &["name", "Garage One"], &["location", "48.85,2.29"]],
        )
    }

    #[test]
    fn the_one_where_later_beats_earlier_and_ties_go_to_the_smaller_id() {
        let old = decode(&listing_record("bbb", 40)).expect("💀 decode");
        let new = decode(&listing_record("ccc", 100)).expect("💀 decode");
        assert!(supersedes(&new, &old));
        assert!(!supersedes(&old, &new));

        let tie_small = decode(&listing_record("aaa", 100)).expect("💀 decode");
        assert!(supersedes(&tie_small, &new));
        assert!(!supersedes(&new, &tie_small));
        assert!(!supersedes(&new, &new), "nobody supersedes themselves");
    }

    #[test]
    fn the_one_where_different_identities_never_supersede() {
        let garage = decode(&listing_record("x", 100)).expect("💀 decode");
        let other = decode(&record(
            "y",
            kinds::LISTING,
            "keyA",
            500,
            &[&["d", "garage-2"], &["name", "Two"], &["location", "1,1"]],
        ))
        .expect("💀 decode");
        assert!(!supersedes(&other, &garage));
    }

    #[test]
    fn the_one_where_junk_is_skipped_not_thrown() {
        let the_stranger = record("z", 42, "k", 1, &[]);
        assert_eq!(decode(&the_stranger), Err(SkipReason::UnknownKind(42)));

        let the_batch = vec![the_stranger, listing_record("ok", 1)];
        assert_eq!(decode_batch(&the_batch).len(), 1);
    }

    #[test]
    fn the_one_where_tombstones_respect_authorship_and_time() {
        let the_listing = match decode(&listing_record("victim", 100)).expect("💀 decode") {
            Entity::Listing(listing) => listing,
            _ => unreachable!(),
        };
        let address = the_listing.address();
        let policy = TombstonePolicy::default();

        let mut index = TombstoneIndex::default();
        let imposter = Tombstone::decode(&record(
            "t1",
            kinds::TOMBSTONE,
            "mallory",
            200,
            &[&["a", "31147:keyA:garage-1"]],
        ))
        .expect("💀 decode");
        index.insert(&imposter);
        assert!(!is_tombstoned(&the_listing.meta, Some(&address), &index, policy));
        let trusting = TombstonePolicy {
            require_author_match: false,
        };
        assert!(is_tombstoned(&the_listing.meta, Some(&address), &index, trusting));

        let the_owner_says_bye = Tombstone::decode(&record(
            "t2",
            kinds::TOMBSTONE,
            "keyA",
            150,
            &[&["a", "31147:keyA:garage-1"]],
        ))
        .expect("💀 decode");
        assert!(index.insert(&the_owner_says_bye));
        assert!(!index.insert(&the_owner_says_bye), "same tombstone twice is a no-op");
        assert!(is_tombstoned(&the_listing.meta, Some(&address), &index, policy));

        // 🧟 a republish after the tombstone walks again
        let mut the_comeback = the_listing.meta.clone();
        the_comeback.created_at = 300;
        assert!(!is_tombstoned(&the_comeback, Some(&address), &index, policy));
    }

    #[test]
    fn the_one_where_a_bare_sentinel_becomes_an_address_tombstone() {
        let mut the_husk = record("husk", kinds::LISTING, "keyA", 200, &[&["d", "garage-1"]]);
        the_husk.content = DELETED_SENTINEL.to_string();
        let Entity::Tombstone(tombstone) = decode(&the_husk).expect("💀 a bare sentinel should not be skipped") else {
            panic!("💀 a bare sentinel should read as a tombstone");
        };
        assert_eq!(tombstone.target_addresses, vec![Address::new(kinds::LISTING, "keyA", "garage-1")]);
        assert!(tombstone.target_ids.is_empty());
        assert_eq!(tombstone.meta.created_at, 200);

        // 🤷 no sentinel, no mercy: still a plain skip
        let the_stub = record("stub", kinds::LISTING, "keyA", 200, &[&["d", "garage-1"]]);
        assert!(matches!(decode(&the_stub), Err(SkipReason::MissingTag { .. })));
    }

    #[test]
    fn the_one_where_the_legacy_sentinel_still_means_deleted() {
        let mut the_ghost = listing_record("g", 10);
        the_ghost.content = DELETED_SENTINEL.to_string();
        let entity = decode(&the_ghost).expect("💀 a deleted listing still decodes");
        assert!(is_tombstoned(
            entity.meta(),
            identity(&entity).as_ref(),
            &TombstoneIndex::default(),
            TombstonePolicy::default()
        ));
    }
}
