//! 🪦 Tombstone: "please pretend that never happened."

use crate::entities::tag_parsing::is_root;
use crate::entities::{Address, RecordMeta, SkipReason};
use crate::records::{Record, RecordDraft, kinds};

#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub meta: RecordMeta,
    pub target_ids: Vec<String>,
    pub target_addresses: Vec<Address>,
    /// Root-marked `a` tags. They let ancestor-scoped queries find the tombstone;
    /// they are never deletion targets.
    pub scope: Vec<Address>,
}

impl Tombstone {
    pub fn decode(record: &Record) -> Result<Self, SkipReason> {
        let target_ids: Vec<String> = record
            .tags_named("e")
            .filter_map(|tag| tag.get(1))
            .filter(|id| !id.is_empty())
            .cloned()
            .collect();

        let mut target_addresses = Vec::new();
        let mut scope = Vec::new();
        for tag in record.tags_named("a") {
            let Some(raw) = tag.get(1) else { continue };
            let address: Address = raw.parse().map_err(|_| SkipReason::malformed("a", raw))?;
            if is_root(tag) {
                scope.push(address);
            } else {
                target_addresses.push(address);
            }
        }

        if target_ids.is_empty() && target_addresses.is_empty() {
            return Err(SkipReason::EmptyTombstone);
        }
        Ok(Tombstone {
            meta: RecordMeta::of(record),
            target_ids,
            target_addresses,
            scope,
        })
    }

    pub fn draft(
        author: &str,
        created_at: u64,
        ids: &[String],
        addresses: &[Address],
        scope: &[Address],
    ) -> RecordDraft {
        let mut draft = RecordDraft::new(kinds::TOMBSTONE, author, created_at);
        for id in ids {
            draft = draft.tag(["e", id.as_str()]);
        }
        for address in addresses {
            draft = draft.tag(["a".to_string(), address.to_string()]);
        }
        for root in scope {
            draft = draft.tag(["a".to_string(), root.to_string(), String::new(), "root".to_string()]);
        }
        draft
    }
}
