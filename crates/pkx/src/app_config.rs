//! 🔧 App configuration: TOML plus `PKX_*` env vars, poured into one struct.
//!
//! 📡 "Config not found: we looked under the couch, behind the fridge, and in
//! the glovebox of every parked car. Nothing." 🦆
//!
//! Figment does the merging. Env vars form the base layer, an optional TOML file
//! is layered on top and wins on conflicts. Nested keys in env vars use a double
//! underscore: `PKX_RUNTIME__CHILD_BATCH_SIZE=5`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::entities::TombstonePolicy;
use crate::orchestrator::FetchSettings;
use crate::relays::{PoolTimeouts, RelayConfig};

/// 📦 Everything the engine needs to know about itself.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// 🔑 The key refreshes run as. No key, no "own" phase.
    #[serde(default, alias = "user")]
    pub user_key: Option<String>,
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// 📂 Bookmarks and hidden ids. Absent means an empty local state.
    #[serde(default)]
    pub local_state_file: Option<PathBuf>,
}

/// ⏱️ Timeouts, batch sizes and search depth.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_backlog_timeout_ms")]
    pub backlog_timeout_ms: u64,
    #[serde(default = "default_child_batch_size", alias = "batch_size")]
    pub child_batch_size: usize,
    #[serde(default = "default_child_parallelism")]
    pub child_parallelism: usize,
    #[serde(default = "default_global_fallback_limit", alias = "fallback_limit")]
    pub global_fallback_limit: usize,
    #[serde(default = "default_search_max_precision")]
    pub search_max_precision: usize,
    #[serde(default = "default_search_min_precision")]
    pub search_min_precision: usize,
    #[serde(default = "default_change_channel_capacity", alias = "channel_size")]
    pub change_channel_capacity: usize,
}

fn default_query_timeout_ms() -> u64 {
    5000
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

// 🐌 longer than a query: a backlog is many queries wearing a trench coat
fn default_backlog_timeout_ms() -> u64 {
    8000
}

// 🧮 ten parents per child query keeps the `a` tag list short enough for picky relays
fn default_child_batch_size() -> usize {
    10
}

fn default_child_parallelism() -> usize {
    4
}

fn default_global_fallback_limit() -> usize {
    200
}

fn default_search_max_precision() -> usize {
    crate::geohash::MAX_PRECISION
}

// 🌍 precision 3 is roughly a metro area. Coarser than that and "nearby" stops meaning anything.
fn default_search_min_precision() -> usize {
    3
}

fn default_change_channel_capacity() -> usize {
    256
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            backlog_timeout_ms: default_backlog_timeout_ms(),
            child_batch_size: default_child_batch_size(),
            child_parallelism: default_child_parallelism(),
            global_fallback_limit: default_global_fallback_limit(),
            search_max_precision: default_search_max_precision(),
            search_min_precision: default_search_min_precision(),
            change_channel_capacity: default_change_channel_capacity(),
        }
    }
}

impl RuntimeConfig {
    /// Zero batch sizes and inverted ladders are clamped rather than rejected.
    pub fn fetch_settings(&self) -> FetchSettings {
        let max = self.search_max_precision.clamp(1, crate::geohash::MAX_PRECISION);
        FetchSettings {
            child_batch_size: self.child_batch_size.max(1),
            child_parallelism: self.child_parallelism.max(1),
            global_fallback_limit: self.global_fallback_limit.max(1),
            search_max_precision: max,
            search_min_precision: self.search_min_precision.clamp(1, max),
        }
    }

    pub fn pool_timeouts(&self) -> PoolTimeouts {
        PoolTimeouts {
            query: Duration::from_millis(self.query_timeout_ms),
            publish: Duration::from_millis(self.publish_timeout_ms),
            backlog: Duration::from_millis(self.backlog_timeout_ms),
        }
    }
}

/// 🪦 Who gets to delete what.
#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_require_tombstone_author_match")]
    pub require_tombstone_author_match: bool,
}

fn default_require_tombstone_author_match() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            require_tombstone_author_match: default_require_tombstone_author_match(),
        }
    }
}

impl PolicyConfig {
    pub fn tombstone_policy(&self) -> TombstonePolicy {
        TombstonePolicy {
            require_author_match: self.require_tombstone_author_match,
        }
    }
}

/// 🚀 Load the config from env vars, and from a TOML file when one is named.
///
/// - `None`: `PKX_*` env vars only.
/// - `Some(path)`: env vars, then the file on top. The file wins.
///
/// 💀 Errors carry the file name and the env prefix, so the 3am reader knows where to look.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("PKX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (PKX_*). \
             Check the relay list first; it's always the relay list.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (PKX_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_test_config(contents: &str) -> anyhow::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        file.write_all(contents.as_bytes())?;
        Ok(file)
    }

    #[test]
    fn the_one_where_the_relays_and_knobs_all_show_up() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            user_key = "keyA"
            local_state_file = "local.json"
            relays = [
                { InMemory = { endpoint = "memory://one" } },
                { File = { file_name = "dump.ndjson.gz" } },
            ]

            [runtime]
            child_batch_size = 5
            query_timeout_ms = 250

            [policy]
            require_tombstone_author_match = false
            "#,
        )?;

        let app_config = load_config(Some(file.path()))?;

        assert_eq!(app_config.user_key.as_deref(), Some("keyA"));
        assert_eq!(app_config.relays.len(), 2);
        match &app_config.relays[1] {
            RelayConfig::File(file_config) => assert_eq!(file_config.file_name, "dump.ndjson.gz"),
            honestly_who_knows => panic!("💀 expected a file relay, serde handed us {honestly_who_knows:?}"),
        }
        assert_eq!(app_config.runtime.fetch_settings().child_batch_size, 5);
        assert_eq!(app_config.runtime.pool_timeouts().query, Duration::from_millis(250));
        assert_eq!(app_config.runtime.publish_timeout_ms, 5000, "untouched knobs keep their defaults");
        assert!(!app_config.policy.tombstone_policy().require_author_match);
        assert_eq!(app_config.local_state_file, Some(PathBuf::from("local.json")));
        Ok(())
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() -> anyhow::Result<()> {
        let app_config: AppConfig = toml::from_str("")?;

        assert!(app_config.relays.is_empty());
        assert!(app_config.policy.require_tombstone_author_match);
        let settings = app_config.runtime.fetch_settings();
        assert_eq!(settings.child_batch_size, 10);
        assert_eq!(settings.global_fallback_limit, 200);
        assert_eq!((settings.search_max_precision, settings.search_min_precision), (10, 3));
        assert_eq!(app_config.runtime.change_channel_capacity, 256);
        Ok(())
    }

    #[test]
    fn the_one_where_old_names_still_answer_the_door() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            user = "keyB"

            [runtime]
            batch_size = 3
            channel_size = 16
            "#,
        )?;

        let app_config = load_config(Some(file.path()))?;

        assert_eq!(app_config.user_key.as_deref(), Some("keyB"));
        assert_eq!(app_config.runtime.child_batch_size, 3);
        assert_eq!(app_config.runtime.change_channel_capacity, 16);
        Ok(())
    }

    #[test]
    fn the_one_where_silly_knobs_get_clamped() {
        let runtime = RuntimeConfig {
            child_batch_size: 0,
            search_max_precision: 40,
            search_min_precision: 0,
            ..RuntimeConfig::default()
        };
        let settings = runtime.fetch_settings();
        assert_eq!(settings.child_batch_size, 1);
        assert_eq!(settings.search_max_precision, crate::geohash::MAX_PRECISION);
        assert_eq!(settings.search_min_precision, 1);
    }
}
