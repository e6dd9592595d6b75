//! 🔄 StatusLog: one spot changed its mood. Never edited, only outlived.

use crate::entities::tag_parsing::{address, geohashes, is_root, optional, required};
use crate::entities::{Address, Rate, RecordMeta, SkipReason, SpotStatus, VehicleType};
use crate::records::{Record, RecordDraft, kinds};

#[derive(Debug, Clone, PartialEq)]
pub struct StatusLog {
    pub meta: RecordMeta,
    pub spot: Address,
    /// Root reference to the listing, for ancestor-scoped queries.
    pub listing: Option<Address>,
    pub status: SpotStatus,
    pub authorizer: Option<String>,
    pub vehicle: Option<VehicleType>,
    pub rate: Option<Rate>,
    pub geohashes: Vec<String>,
}

impl StatusLog {
    /// Usually an ephemeral per-session key.
    pub fn updater(&self) -> &str {
        &self.meta.author
    }

    pub fn decode(record: &Record) -> Result<Self, SkipReason> {
        let mut spot = None;
        let mut listing = None;
        for tag in record.tags_named("a") {
            let Some(raw) = tag.get(1) else { continue };
            if is_root(tag) {
                listing = Some(address(raw, kinds::LISTING)?);
            } else if spot.is_none() {
                spot = Some(address(raw, kinds::SPOT)?);
            }
        }
        let spot = spot.ok_or(SkipReason::MissingTag {
            kind: record.kind,
            tag: "a",
        })?;
        let status = required(record, "status")?.parse()?;

        let authorizer = record
            .tags_named("p")
            .find(|tag| tag.get(2).is_some_and(|role| role == "authorizer"))
            .and_then(|tag| tag.get(1).cloned());
        let vehicle = optional(record, "vehicle").map(str::parse).transpose()?;
        let rate = record
            .tags_named("rate")
            .next()
            .map(|tag| match tag.get(1) {
                Some(hourly) => Rate::parse(hourly, tag.get(2)),
                None => Err(SkipReason::malformed("rate", tag.join(","))),
            })
            .transpose()?;

        Ok(StatusLog {
            meta: RecordMeta::of(record),
            spot,
            listing,
            status,
            authorizer,
            vehicle,
            rate,
            geohashes: geohashes(record),
        })
    }

    pub fn to_draft(&self) -> RecordDraft {
        let mut draft = RecordDraft::new(kinds::STATUS_LOG, self.meta.author.clone(), self.meta.created_at)
            .tag(["a".to_string(), self.spot.to_string()])
            .tag(["status", self.status.as_str()])
            .content(self.meta.content.clone());
        if let Some(listing) = &self.listing {
            draft = draft.tag(["a".to_string(), listing.to_string(), String::new(), "root".to_string()]);
        }
        if let Some(authorizer) = &self.authorizer {
            draft = draft.tag(["p", authorizer.as_str(), "authorizer"]);
        }
        if let Some(vehicle) = self.vehicle {
            draft = draft.tag(["vehicle", vehicle.as_str()]);
        }
        if let Some(rate) = &self.rate {
            draft = draft.tag(["rate".to_string(), rate.hourly.to_string(), rate.currency.clone()]);
        }
        draft.tags(
            self.geohashes
                .iter()
                .map(|hash| vec!["g".to_string(), hash.clone()]),
        )
    }
}
