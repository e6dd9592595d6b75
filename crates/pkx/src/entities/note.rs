//! 📝 Note: a sticky note on one status log. Written once, never touched again.

use crate::entities::tag_parsing::required;
use crate::entities::{RecordMeta, SkipReason};
use crate::records::{Record, RecordDraft, kinds};

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub meta: RecordMeta,
    pub status_log_id: String,
}

impl Note {
    pub fn text(&self) -> &str {
        &self.meta.content
    }

    pub fn decode(record: &Record) -> Result<Self, SkipReason> {
        Ok(Note {
            meta: RecordMeta::of(record),
            status_log_id: required(record, "e")?.to_string(),
        })
    }

    pub fn draft(author: &str, created_at: u64, status_log_id: &str, text: &str) -> RecordDraft {
        RecordDraft::new(kinds::NOTE, author, created_at)
            .tag(["e", status_log_id])
            .content(text)
    }
}
