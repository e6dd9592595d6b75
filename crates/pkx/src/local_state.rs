//! 🔖 Local state: the user's bookmarks and the listings they never want to see again.
//!
//! Neither lives on a relay. Both steer what gets fetched (bookmarks feed the saved
//! phase) and what gets shown (hidden ids drop out of the public and private views,
//! never out of the user's own).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::entities::Address;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default)]
    pub bookmarks: Vec<Address>,
    /// Record ids or address strings.
    #[serde(default)]
    pub hidden_ids: BTreeSet<String>,
}

impl LocalState {
    /// 🙈 Hidden by its current record id or by its address.
    pub fn is_hidden(&self, record_id: &str, address: &Address) -> bool {
        self.hidden_ids.contains(record_id) || self.hidden_ids.contains(&address.to_string())
    }

    pub fn bookmark(&mut self, address: Address) {
        if !self.bookmarks.contains(&address) {
            self.bookmarks.push(address);
        }
    }

    pub fn hide(&mut self, id: impl Into<String>) {
        self.hidden_ids.insert(id.into());
    }
}

/// 💾 A JSON file holding a [`LocalState`]. Missing file means empty state.
#[derive(Debug, Clone)]
pub struct LocalStateFile {
    path: PathBuf,
}

impl LocalStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<LocalState> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("📭 no local state at {}, starting empty", self.path.display());
                return Ok(LocalState::default());
            }
            Err(err) => {
                return Err(err).context(format!(
                    "💀 local state file '{}' exists but would not open",
                    self.path.display()
                ));
            }
        };
        serde_json::from_str(&raw).context(format!(
            "💀 local state file '{}' is not the JSON we wrote",
            self.path.display()
        ))
    }

    pub async fn save(&self, state: &LocalState) -> Result<()> {
        let raw = serde_json::to_string_pretty(state).context("💀 local state refused to serialize")?;
        tokio::fs::write(&self.path, raw)
            .await
            .context(format!("💀 could not write local state to '{}'", self.path.display()))?;
        info!(
            "💾 saved {} bookmarks and {} hidden ids",
            state.bookmarks.len(),
            state.hidden_ids.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::kinds;

    #[test]
    fn the_one_where_hiding_works_by_id_or_by_address() {
        let garage = Address::new(kinds::LISTING, "keyA", "garage-1");
        let mut state = LocalState::default();
        assert!(!state.is_hidden("abc", &garage));
        state.hide("abc");
        assert!(state.is_hidden("abc", &garage));
        assert!(!state.is_hidden("def", &garage));
        state.hide(garage.to_string());
        assert!(state.is_hidden("def", &garage), "a new version stays hidden by address");
    }

    #[tokio::test]
    async fn the_one_where_local_state_survives_a_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = LocalStateFile::new(dir.path().join("local.json"));
        assert_eq!(file.load().await?, LocalState::default());

        let mut state = LocalState::default();
        state.bookmark(Address::new(kinds::LISTING, "keyB", "lot-7"));
        state.bookmark(Address::new(kinds::LISTING, "keyB", "lot-7"));
        state.hide("nope");
        file.save(&state).await?;

        let reloaded = file.load().await?;
        assert_eq!(reloaded.bookmarks.len(), 1);
        assert_eq!(reloaded, state);
        Ok(())
    }
}
