//! 🅿️ Listing: the garage, the lot, the curb block with delusions of grandeur.

use std::collections::BTreeMap;

use crate::entities::tag_parsing::{coordinate, geohashes, optional, required};
use crate::entities::{Address, Rate, RecordMeta, SkipReason, VehicleType};
use crate::geohash::{self, Coordinate};
use crate::records::{Record, RecordDraft, kinds};

/// 🔒 Who gets to see it in the public view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    Public,
    Private,
}

/// 👑 Capability roles, as listed in `["p", key, role]` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Manager,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub owners: Vec<String>,
    pub managers: Vec<String>,
    pub members: Vec<String>,
}

impl Capabilities {
    pub fn mentions(&self, key: &str) -> bool {
        self.owners
            .iter()
            .chain(&self.managers)
            .chain(&self.members)
            .any(|k| k == key)
    }

    fn push(&mut self, role: Role, key: String) {
        let bucket = match role {
            Role::Owner => &mut self.owners,
            Role::Manager => &mut self.managers,
            Role::Member => &mut self.members,
        };
        if !bucket.contains(&key) {
            bucket.push(key);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub meta: RecordMeta,
    pub d_tag: String,
    pub name: String,
    pub location: Coordinate,
    /// Finest geohash known for the listing (longest `g` tag, else computed).
    pub geohash: String,
    pub floor_plan: Option<String>,
    pub rates: BTreeMap<VehicleType, Rate>,
    /// ⚠️ Advisory only. Real counts come from discovered spots.
    pub advisory_total_spots: Option<u32>,
    pub capabilities: Capabilities,
    pub relay_hints: Vec<String>,
    pub access: Access,
    pub open: bool,
}

impl Listing {
    pub fn address(&self) -> Address {
        Address::new(kinds::LISTING, self.meta.author.clone(), self.d_tag.clone())
    }

    /// 👀 Authored by `key`, or `key` holds any capability on it.
    pub fn involves(&self, key: &str) -> bool {
        self.meta.author == key || self.capabilities.mentions(key)
    }

    pub fn decode(record: &Record) -> Result<Self, SkipReason> {
        let d_tag = required(record, "d")?.to_string();
        let name = required(record, "name")?.to_string();
        let location = coordinate(required(record, "location")?)?;
        let geohash = geohashes(record)
            .pop()
            .unwrap_or_else(|| location.geohash());

        let mut rates = BTreeMap::new();
        for tag in record.tags_named("rate") {
            let (Some(vehicle), Some(hourly)) = (tag.get(1), tag.get(2)) else {
                return Err(SkipReason::malformed("rate", tag.join(",")));
            };
            rates.insert(vehicle.parse()?, Rate::parse(hourly, tag.get(3))?);
        }

        let advisory_total_spots = optional(record, "total_spots")
            .map(|raw| raw.parse().map_err(|_| SkipReason::malformed("total_spots", raw)))
            .transpose()?;

        let mut capabilities = Capabilities::default();
        for tag in record.tags_named("p") {
            let Some(key) = tag.get(1).filter(|key| !key.is_empty()) else {
                continue;
            };
            let role = match tag.get(2).map(String::as_str) {
                Some("owner") => Role::Owner,
                Some("manager") => Role::Manager,
                Some("member") | None => Role::Member,
                Some(other) => return Err(SkipReason::malformed("p", other)),
            };
            capabilities.push(role, key.clone());
        }

        let access = match optional(record, "access") {
            None | Some("public") => Access::Public,
            Some("private") => Access::Private,
            Some(other) => return Err(SkipReason::malformed("access", other)),
        };
        let open = match optional(record, "status") {
            None | Some("open") => true,
            Some("closed") => false,
            Some(other) => return Err(SkipReason::malformed("status", other)),
        };

        Ok(Listing {
            meta: RecordMeta::of(record),
            d_tag,
            name,
            location,
            geohash,
            floor_plan: optional(record, "floor_plan").map(str::to_string),
            rates,
            advisory_total_spots,
            capabilities,
            relay_hints: record
                .tags_named("relay")
                .filter_map(|tag| tag.get(1).cloned())
                .collect(),
            access,
            open,
        })
    }

    /// ✍️ Full replacement record. There is no partial update; every field goes out every time.
    pub fn to_draft(&self, created_at: u64) -> RecordDraft {
        let mut draft = RecordDraft::new(kinds::LISTING, self.meta.author.clone(), created_at)
            .tag(["d", self.d_tag.as_str()])
            .tag(["name", self.name.as_str()])
            .tag(["location".to_string(), self.location.to_string()])
            .tags(geohash::fanout_tags(self.location))
            .content(self.meta.content.clone());
        if let Some(plan) = &self.floor_plan {
            draft = draft.tag(["floor_plan", plan.as_str()]);
        }
        for (vehicle, rate) in &self.rates {
            draft = draft.tag([
                "rate".to_string(),
                vehicle.to_string(),
                rate.hourly.to_string(),
                rate.currency.clone(),
            ]);
        }
        if let Some(total) = self.advisory_total_spots {
            draft = draft.tag(["total_spots".to_string(), total.to_string()]);
        }
        let roles = [
            ("owner", &self.capabilities.owners),
            ("manager", &self.capabilities.managers),
            ("member", &self.capabilities.members),
        ];
        for (role, keys) in roles {
            for key in keys {
                draft = draft.tag(["p", key.as_str(), role]);
            }
        }
        for relay in &self.relay_hints {
            draft = draft.tag(["relay", relay.as_str()]);
        }
        let access = match self.access {
            Access::Public => "public",
            Access::Private => "private",
        };
        draft
            .tag(["access", access])
            .tag(["status", if self.open { "open" } else { "closed" }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::test_support::record;

    #[test]
    fn the_one_where_a_listing_decodes_with_all_its_baggage() {
        let the_record = record(
            "l1",
            kinds::LISTING,
            "keyA",
            100,
            &[
                &["d", "garage-1"],
                &["name", "Garage One"],
                &["location", "48.8584,2.2945"],
                &["g", "u"],
                &["g", "u09tunquc"],
                &["rate", "car", "2.5", "EUR"],
                &["rate", "motorcycle", "1", "EUR"],
                &["total_spots", "5"],
                &["p", "keyM", "manager"],
                &["p", "keyZ"],
                &["relay", "wss://relay.example"],
                &["access", "private"],
                &["status", "closed"],
            ],
        );
        let the_listing = Listing::decode(&the_record).expect("💀 decode");
        assert_eq!(the_listing.address().to_string(), "31147:keyA:garage-1");
        assert_eq!(the_listing.geohash, "u09tunquc");
        assert_eq!(the_listing.rates[&VehicleType::Car].hourly, 2.5);
        assert_eq!(the_listing.advisory_total_spots, Some(5));
        assert_eq!(the_listing.capabilities.managers, vec!["keyM"]);
        assert_eq!(the_listing.capabilities.members, vec!["keyZ"]);
        assert_eq!(the_listing.access, Access::Private);
        assert!(!the_listing.open);
        assert!(the_listing.involves("keyA"));
        assert!(the_listing.involves("keyM"));
        assert!(!the_listing.involves("keyQ"));
    }

    #[test]
    fn the_one_where_missing_essentials_mean_skip() {
        let no_name = record("l2", kinds::LISTING, "k", 1, &[&["d", "x"], &["location", "1,1"]]);
        assert_eq!(
            Listing::decode(&no_name),
            Err(SkipReason::MissingTag {
                kind: kinds::LISTING,
                tag: "name"
            })
        );
        let bad_rate = record(
            "l3",
            kinds::LISTING,
            "k",
            1,
            &[&["d", "x"], &["name", "n"], &["location", "1,1"], &["rate", "car", "free", "EUR"]],
        );
        assert!(matches!(Listing::decode(&bad_rate), Err(SkipReason::MalformedTag { tag: "rate", .. })));
    }

    #[test]
    fn the_one_where_encode_then_decode_keeps_the_fields() {
        let the_record = record(
            "l4",
            kinds::LISTING,
            "keyA",
            100,
            &[
                &["d", "lot-9"],
                &["name", "Lot Nine"],
                &["location", "10,20"],
                &["rate", "truck", "7", "USD"],
                &["p", "keyO", "owner"],
            ],
        );
        let the_listing = Listing::decode(&the_record).expect("💀 decode");
        let the_rerun = Listing::decode(&the_listing.to_draft(200).into_record("")).expect("💀 re-decode");
        assert_eq!(the_rerun.address(), the_listing.address());
        assert_eq!(the_rerun.rates, the_listing.rates);
        assert_eq!(the_rerun.capabilities, the_listing.capabilities);
        assert_eq!(the_rerun.meta.created_at, 200);
        assert_eq!(the_rerun.geohash.len(), geohash::MAX_PRECISION);
    }
}
