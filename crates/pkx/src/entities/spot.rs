//! 🚗 Spot: one rectangle of asphalt with an identity.

use crate::entities::tag_parsing::{address, coordinate, is_root, optional, required};
use crate::entities::{Address, RecordMeta, SkipReason, VehicleType};
use crate::geohash::{self, Coordinate};
use crate::records::{Record, RecordDraft, kinds};

#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    pub meta: RecordMeta,
    pub d_tag: String,
    /// Parent listing. A reference, not a promise; it may never resolve.
    pub listing: Option<Address>,
    pub number: Option<u32>,
    pub floor: Option<String>,
    pub short_name: Option<String>,
    pub vehicle: VehicleType,
    pub location: Option<Coordinate>,
}

impl Spot {
    pub fn address(&self) -> Address {
        Address::new(kinds::SPOT, self.meta.author.clone(), self.d_tag.clone())
    }

    pub fn decode(record: &Record) -> Result<Self, SkipReason> {
        let d_tag = required(record, "d")?.to_string();

        // 🌳 prefer the root-marked `a`; fall back to the first listing-kind `a`
        let a_tags: Vec<&[String]> = record.tags_named("a").collect();
        let parent = a_tags
            .iter()
            .find(|tag| is_root(tag))
            .or_else(|| a_tags.first())
            .and_then(|tag| tag.get(1));
        let listing = parent
            .map(|raw| address(raw, kinds::LISTING))
            .transpose()?;

        let number = optional(record, "number")
            .map(|raw| raw.parse().map_err(|_| SkipReason::malformed("number", raw)))
            .transpose()?;
        let vehicle = optional(record, "vehicle")
            .map(str::parse)
            .transpose()?
            .unwrap_or(VehicleType::Car);
        let location = optional(record, "location").map(coordinate).transpose()?;

        Ok(Spot {
            meta: RecordMeta::of(record),
            d_tag,
            listing,
            number,
            floor: optional(record, "floor").map(str::to_string),
            short_name: optional(record, "name").map(str::to_string),
            vehicle,
            location,
        })
    }

    pub fn to_draft(&self, created_at: u64) -> RecordDraft {
        let mut draft = RecordDraft::new(kinds::SPOT, self.meta.author.clone(), created_at)
            .tag(["d", self.d_tag.as_str()])
            .tag(["vehicle", self.vehicle.as_str()])
            .content(self.meta.content.clone());
        if let Some(listing) = &self.listing {
            draft = draft.tag(["a".to_string(), listing.to_string(), String::new(), "root".to_string()]);
        }
        if let Some(number) = self.number {
            draft = draft.tag(["number".to_string(), number.to_string()]);
        }
        if let Some(floor) = &self.floor {
            draft = draft.tag(["floor", floor.as_str()]);
        }
        if let Some(name) = &self.short_name {
            draft = draft.tag(["name", name.as_str()]);
        }
        if let Some(location) = self.location {
            draft = draft
                .tag(["location".to_string(), location.to_string()])
                .tags(geohash::fanout_tags(location));
        }
        draft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::test_support::record;

    #[test]
    fn the_one_where_a_spot_knows_its_parent_but_does_not_need_it() {
        let the_spot = Spot::decode(&record(
            "s1",
            kinds::SPOT,
            "keyA",
            10,
            &[
                &["d", "garage-1/12"],
                &["a", "31147:keyA:garage-1", "", "root"],
                &["number", "12"],
                &["floor", "B2"],
                &["vehicle", "motorcycle"],
            ],
        ))
        .expect("💀 decode");
        assert_eq!(the_spot.listing, Some(Address::new(kinds::LISTING, "keyA", "garage-1")));
        assert_eq!(the_spot.number, Some(12));
        assert_eq!(the_spot.vehicle, VehicleType::Motorcycle);

        let the_orphan = Spot::decode(&record("s2", kinds::SPOT, "keyA", 10, &[&["d", "lonely"]])).expect("💀 decode");
        assert_eq!(the_orphan.listing, None);
        assert_eq!(the_orphan.vehicle, VehicleType::Car, "car is the default vehicle");
    }

    #[test]
    fn the_one_where_a_spot_pointing_at_a_spot_is_rejected() {
        let confused = record("s3", kinds::SPOT, "k", 1, &[&["d", "x"], &["a", "37141:k:other"]]);
        assert!(matches!(Spot::decode(&confused), Err(SkipReason::MalformedTag { tag: "a", .. })));
        let hovercraft = record("s4", kinds::SPOT, "k", 1, &[&["d", "x"], &["vehicle", "hovercraft"]]);
        assert!(Spot::decode(&hovercraft).is_err());
    }
}
