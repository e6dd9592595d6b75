//! 📤 The publisher: drafts in, signed records out, relays asked to keep them.
//!
//! Every write goes to every relay at once. One acknowledgement is enough to call it
//! accepted; zero is a [`PublishError::NotAcknowledged`] the caller may retry. Nothing
//! here touches the snapshot. If the write lands, the live merge brings it back like
//! any other record.
//!
//! There are no multi-record transactions. A status change and a listing republish
//! are two independent publishes, and a crash between them is just partial state.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::entities::{
    Address, Listing, Note, Rate, RecordMeta, Spot, SpotStatus, StatusLog, Tombstone,
};
use crate::geohash;
use crate::records::{Record, RecordDraft, RecordSigner};
use crate::relays::{PublishReport, RelayPool};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Retryable. No relay took the record.
    #[error("💀 record {record_id} was acknowledged by none of {} relays", .report.outcomes.len())]
    NotAcknowledged { record_id: String, report: PublishReport },
    /// Republishing needs the same author, or it becomes a different entity.
    #[error("🙅 {address} belongs to its author; {signer} cannot republish it")]
    NotTheAuthor { address: Address, signer: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// ✅ A record at least one relay accepted, with the full per-relay tally.
#[derive(Debug, Clone)]
pub struct Published {
    pub record: Record,
    pub report: PublishReport,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct Publisher<S: RecordSigner> {
    pool: RelayPool,
    signer: S,
    clock: fn() -> u64,
}

impl<S: RecordSigner> Publisher<S> {
    pub fn new(pool: RelayPool, signer: S) -> Self {
        Self {
            pool,
            signer,
            clock: unix_now,
        }
    }

    /// ⏱️ Swap the wall clock, mostly so tests can pin `created_at`.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn author(&self) -> &str {
        self.signer.author()
    }

    /// 🖊️ Signs `draft` and sends it everywhere.
    pub async fn publish_draft(&self, draft: RecordDraft) -> Result<Published, PublishError> {
        let record = self
            .signer
            .sign(draft)
            .await
            .context("💀 the signer refused to sign")?;
        let report = self.pool.publish(&record).await;
        if !report.any_acknowledged() {
            warn!("📭 nobody took {} (kind {})", record.id, record.kind);
            return Err(PublishError::NotAcknowledged {
                record_id: record.id.clone(),
                report,
            });
        }
        debug!(
            "📬 {} accepted by {}/{} relays",
            record.id,
            report.acknowledged(),
            report.outcomes.len()
        );
        Ok(Published { record, report })
    }

    /// 🔄 A fresh status log for `spot`, rooted at its listing when it has one.
    pub async fn publish_status_change(
        &self,
        spot: &Spot,
        status: SpotStatus,
        authorizer: Option<&str>,
        rate: Option<Rate>,
    ) -> Result<Published, PublishError> {
        let log = StatusLog {
            meta: RecordMeta {
                id: String::new(),
                author: self.signer.author().to_string(),
                created_at: (self.clock)(),
                content: String::new(),
            },
            spot: spot.address(),
            listing: spot.listing.clone(),
            status,
            authorizer: authorizer.map(str::to_string),
            vehicle: Some(spot.vehicle),
            rate,
            geohashes: spot
                .location
                .map(|location| geohash::fanout(location, geohash::MAX_PRECISION))
                .unwrap_or_default(),
        };
        let published = self.publish_draft(log.to_draft()).await?;
        info!("🚦 {} is now {}", log.spot, status);
        Ok(published)
    }

    pub async fn publish_note(&self, status_log_id: &str, text: &str) -> Result<Published, PublishError> {
        let draft = Note::draft(self.signer.author(), (self.clock)(), status_log_id, text);
        self.publish_draft(draft).await
    }

    /// 🪦 Deletes by id and/or address. `scope` lets ancestor-scoped queries find it.
    pub async fn publish_tombstone(
        &self,
        ids: &[String],
        addresses: &[Address],
        scope: &[Address],
    ) -> Result<Published, PublishError> {
        let draft = Tombstone::draft(self.signer.author(), (self.clock)(), ids, addresses, scope);
        self.publish_draft(draft).await
    }

    /// ✍️ Whole-record replace of a listing, strictly newer than the version it replaces.
    pub async fn republish_listing(&self, listing: &Listing) -> Result<Published, PublishError> {
        self.ensure_author(listing.address())?;
        let created_at = self.next_version_after(listing.meta.created_at);
        self.publish_draft(listing.to_draft(created_at)).await
    }

    pub async fn republish_spot(&self, spot: &Spot) -> Result<Published, PublishError> {
        self.ensure_author(spot.address())?;
        let created_at = self.next_version_after(spot.meta.created_at);
        self.publish_draft(spot.to_draft(created_at)).await
    }

    fn ensure_author(&self, address: Address) -> Result<(), PublishError> {
        if address.author != self.signer.author() {
            return Err(PublishError::NotTheAuthor {
                address,
                signer: self.signer.author().to_string(),
            });
        }
        Ok(())
    }

    // clocks drift; a replacement that doesn't outrank the original is no replacement
    fn next_version_after(&self, previous: u64) -> u64 {
        (self.clock)().max(previous.saturating_add(1))
    }
}
