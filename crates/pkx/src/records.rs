//! 📦 Records: the one shape every relay speaks.
//!
//! Every listing, spot, status log, note and tombstone travels the network as the
//! same generic, signed, tagged record. Relays don't know what a parking spot is.
//! They know `kind`, `pubkey`, `created_at`, `tags`, and that's about it. The
//! codec in [`crate::entities`] is where these records learn who they really are. 🦆
//!
//! This module also owns [`Filter`], the only query language relays understand:
//! exact-match kinds, authors and `tag=value`, plus a `limit`. No joins. No ranges.
//! No mercy.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 🏷️ Record kinds this engine reads and writes.
pub mod kinds {
    /// 🅿️ An addressable parking listing (garage, lot, curb block).
    pub const LISTING: u32 = 31147;
    /// 🚗 An addressable parking spot inside a listing.
    pub const SPOT: u32 = 37141;
    /// 🔄 An append-only status transition for one spot.
    pub const STATUS_LOG: u32 = 1147;
    /// 📝 A free-text annotation on one status log.
    pub const NOTE: u32 = 1;
    /// 🗑️ An explicit deletion request.
    pub const TOMBSTONE: u32 = 5;
}

/// 📡 A signed record, exactly as relays store and serve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(rename = "pubkey")]
    pub author: String,
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    /// 🔒 Signature validity is the relay's problem, not ours. We just carry it.
    #[serde(default)]
    pub sig: String,
}

impl Record {
    /// 🔍 Every tag whose first element is `name`.
    pub fn tags_named<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a [String]> {
        self.tags
            .iter()
            .filter(move |tag| tag.first().is_some_and(|first| first == name))
            .map(|tag| tag.as_slice())
    }

    /// 🎯 The value (second element) of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags_named(name)
            .find_map(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Parses a single relay-wire JSON object.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("💀 That line claimed to be a record. serde disagreed.")
    }
}

/// ✍️ A record minus the parts only a key holder can produce (`id` is derivable, `sig` is not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub author: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl RecordDraft {
    pub fn new(kind: u32, author: impl Into<String>, created_at: u64) -> Self {
        Self {
            author: author.into(),
            created_at,
            kind,
            tags: Vec::new(),
            content: String::new(),
        }
    }

    /// 🏷️ Appends one tag. Chainable, because building tag lists by hand is sad enough already.
    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(parts.into_iter().map(Into::into).collect());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = Vec<String>>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// 🔐 sha256 over `[0, author, created_at, kind, tags, content]`, lower-case hex.
    pub fn compute_id(&self) -> String {
        let canonical = serde_json::json!([
            0,
            self.author,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    /// 📦 Seals the draft with a signature produced elsewhere.
    pub fn into_record(self, sig: impl Into<String>) -> Record {
        let id = self.compute_id();
        Record {
            id,
            author: self.author,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.into(),
        }
    }
}

/// 🔑 Whoever holds the keys. Key management lives outside this crate; we only ask it to sign.
#[async_trait]
pub trait RecordSigner: Send + Sync {
    /// The public key every draft will be authored as.
    fn author(&self) -> &str;
    async fn sign(&self, draft: RecordDraft) -> Result<Record>;
}

/// 🔎 The relay query language, in its entirety.
///
/// Kinds, authors and distinct tag keys are AND-ed. Values inside one tag key are OR-ed.
/// Empty `kinds`/`authors` means "don't care". `limit` keeps the newest N matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors.extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// ✅ Exact-match evaluation, the same way a relay would do it.
    pub fn matches(&self, record: &Record) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| a == &record.author) {
            return false;
        }
        self.tags.iter().all(|(name, wanted)| {
            record
                .tags_named(name)
                .filter_map(|tag| tag.get(1))
                .any(|value| wanted.contains(value))
        })
    }

    /// 📚 Runs this filter over a pile of records: matches only, newest first, `limit` applied.
    pub fn select<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Vec<Record> {
        let mut hits: Vec<Record> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            hits.truncate(limit);
        }
        hits
    }
}

/// 🧹 Drops repeated ids, keeping the first occurrence. Relays love sending the same thing twice.
pub fn dedup_by_id(records: impl IntoIterator<Item = Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.id.clone()))
        .collect()
}
