//! 📂 A relay dump on disk: one JSON record per line, optionally gzipped.
//!
//! Read-only. Publishing to a file relay is refused, loudly.

use std::io::Read;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::{info, warn};

use super::{Relay, RelayMessage, RelaySubscription};
use crate::records::{Filter, Record, dedup_by_id};

#[derive(Debug, Deserialize, Clone)]
pub struct FileRelayConfig {
    pub file_name: String,
}

#[derive(Debug)]
pub struct FileRelay {
    config: FileRelayConfig,
    records: Vec<Record>,
}

impl FileRelay {
    pub async fn open(config: FileRelayConfig) -> Result<Self> {
        let records = load_records(&config.file_name).await?;
        info!("📂 {} records loaded from {}", records.len(), config.file_name);
        Ok(Self { config, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 📖 Reads an NDJSON dump. Lines that aren't records are skipped with a warning.
///
/// Inflating and parsing are CPU work, so they run on the blocking pool instead of
/// parking a runtime worker for the length of a large dump.
pub(crate) async fn load_records(file_name: &str) -> Result<Vec<Record>> {
    let raw = tokio::fs::read(file_name).await.context(format!(
        "💀 relay dump '{file_name}' would not open. Missing, or the permissions say no."
    ))?;
    let gzipped = file_name.ends_with(".gz");
    let owned_name = file_name.to_string();
    tokio::task::spawn_blocking(move || -> Result<Vec<Record>> {
        let bytes = if gzipped {
            let mut inflated = Vec::new();
            GzDecoder::new(raw.as_slice())
                .read_to_end(&mut inflated)
                .context(format!("💀 relay dump '{owned_name}' claims to be gzip. It is not."))?;
            inflated
        } else {
            raw
        };
        Ok(parse_lines(&bytes))
    })
    .await
    .context(format!("💀 the task decoding relay dump '{file_name}' died"))?
}

fn parse_lines(bytes: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut start = 0;
    let ends = memchr::memchr_iter(b'\n', bytes).chain(std::iter::once(bytes.len()));
    for (number, end) in ends.enumerate() {
        let line = String::from_utf8_lossy(&bytes[start..end]);
        start = end + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Record::from_json(line) {
            Ok(record) => records.push(record),
            Err(err) => warn!("🙅 line {} is not a record: {:#}", number + 1, err),
        }
    }
    records
}

#[async_trait]
impl Relay for FileRelay {
    fn endpoint(&self) -> &str {
        &self.config.file_name
    }

    async fn publish(&self, record: &Record) -> Result<()> {
        bail!(
            "🙅 file relay {} is read-only; record {} stays unpublished",
            self.config.file_name,
            record.id
        )
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Record>> {
        Ok(filter.select(&self.records))
    }

    /// Stored matches, the end marker, and then silence. Files don't do live.
    async fn subscribe(&self, filters: &[Filter]) -> Result<RelaySubscription> {
        let backlog = dedup_by_id(filters.iter().flat_map(|filter| filter.select(&self.records)));
        let (tx, rx) = async_channel::unbounded();
        for record in backlog {
            tx.send(RelayMessage::Record(record))
                .await
                .context("💀 subscription hung up before it started")?;
        }
        tx.send(RelayMessage::EndOfStoredRecords)
            .await
            .context("💀 subscription hung up before it started")?;
        Ok(RelaySubscription::new(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;
    use crate::records::kinds;

    const DUMP: &str = concat!(
        r#"{"id":"a","pubkey":"k","created_at":1,"kind":31147,"tags":[["d","x"]],"content":"","sig":""}"#,
        "\n",
        "\n",
        "this is not json\n",
        r#"{"id":"b","pubkey":"k","created_at":2,"kind":1,"tags":[],"content":"hi","sig":""}"#,
    );

    #[tokio::test]
    async fn the_one_where_a_file_pretends_to_be_a_relay() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.ndjson");
        tokio::fs::write(&path, DUMP).await?;

        let relay = FileRelay::open(FileRelayConfig {
            file_name: path.display().to_string(),
        })
        .await?;
        assert_eq!(relay.len(), 2, "the junk line got skipped");
        let listings = relay.query(&Filter::new().kinds([kinds::LISTING])).await?;
        assert_eq!(listings.len(), 1);
        assert!(relay.publish(&listings[0]).await.is_err());

        let subscription = relay.subscribe(&[Filter::new()]).await?;
        let mut seen = 0;
        while let Some(message) = subscription.next().await {
            match message {
                RelayMessage::Record(_) => seen += 1,
                RelayMessage::EndOfStoredRecords => break,
            }
        }
        assert_eq!(seen, 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_dump_was_gzipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.ndjson.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(DUMP.as_bytes())?;
        std::fs::write(&path, encoder.finish()?)?;

        let records = load_records(&path.display().to_string()).await?;
        assert_eq!(records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn the_one_where_a_fake_gzip_is_caught_off_the_runtime_thread() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("liar.ndjson.gz");
        tokio::fs::write(&path, DUMP).await?;

        let err = match load_records(&path.display().to_string()).await {
            Ok(records) => panic!("💀 plain text inflated into {} records", records.len()),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("claims to be gzip"));
        Ok(())
    }
}
