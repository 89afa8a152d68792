// Configuration
// Layered configuration for the daemon: built-in defaults, an optional
// `sari.toml`, environment overrides, and per-workspace override sections.
// The indexing and ranking sections are hashed into `config_hash` so search
// snapshots are invalidated when behavior-relevant settings change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Top-level configuration for one daemon process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SariConfig {
    pub indexing: IndexingConfig,
    pub watcher: WatcherConfig,
    pub store: StoreConfig,
    pub text_index: TextIndexConfig,
    pub search: SearchConfig,
    pub daemon: DaemonConfig,
    pub budget: BudgetConfig,
}

/// File selection and parse policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Explicit allow-list; overrides every other rule when non-empty.
    pub include_files: Vec<String>,
    /// Extension allow-list; empty means all extensions are allowed.
    pub include_ext: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub exclude_globs: Vec<String>,
    /// Hard size cap; 0 disables size-based rejection.
    pub max_file_bytes: u64,
    /// Above this size the loader keeps a head+tail sample.
    pub parse_limit_bytes: u64,
    pub allow_metadata_only_ok: bool,
    pub decode_policy: DecodePolicy,
    pub follow_symlinks: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            include_files: Vec::new(),
            include_ext: Vec::new(),
            exclude_dirs: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "target".to_string(),
                "__pycache__".to_string(),
                ".venv".to_string(),
            ],
            exclude_globs: Vec::new(),
            max_file_bytes: 16 * 1024 * 1024,
            parse_limit_bytes: 4 * 1024 * 1024,
            allow_metadata_only_ok: false,
            decode_policy: DecodePolicy::Ignore,
            follow_symlinks: false,
        }
    }
}

/// How the loader treats undecodable byte sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Reject the file on invalid UTF-8.
    Strong,
    /// Replace invalid sequences and continue.
    Ignore,
}

/// Event bus and debounce tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub event_bus_capacity: usize,
    pub debounce_min_ms: u64,
    pub debounce_max_ms: u64,
    pub git_checkout_debounce_ms: u64,
    pub coalesce_shards: usize,
    pub queue_high_water: usize,
    pub queue_low_water: usize,
    pub token_bucket_capacity: u32,
    pub token_refill_per_sec: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            event_bus_capacity: 4096,
            debounce_min_ms: 50,
            debounce_max_ms: 2000,
            git_checkout_debounce_ms: 3000,
            coalesce_shards: 16,
            queue_high_water: 10_000,
            queue_low_water: 2_000,
            token_bucket_capacity: 256,
            token_refill_per_sec: 128,
        }
    }
}

/// Store durability and GC tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub commit_batch_size: usize,
    pub gc_grace_secs: i64,
    pub idle_checkpoint_secs: u64,
    pub max_read_bytes: usize,
    /// Content blocks above this size are lz4-compressed at rest.
    pub compress_threshold_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            commit_batch_size: 128,
            gc_grace_secs: 24 * 3600,
            idle_checkpoint_secs: 30,
            max_read_bytes: 1024 * 1024,
            compress_threshold_bytes: 8 * 1024,
        }
    }
}

/// Text index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextIndexConfig {
    pub max_doc_bytes: usize,
    pub reader_reload_ms: u64,
    /// Degrade to substring-over-store when the engine is unavailable.
    pub enable_fallback: bool,
}

impl Default for TextIndexConfig {
    fn default() -> Self {
        Self {
            max_doc_bytes: 4 * 1024 * 1024,
            reader_reload_ms: 1000,
            enable_fallback: true,
        }
    }
}

/// Search and ranking parameters. All of these feed `config_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_offset_depth: usize,
    pub default_snippet_lines: usize,
    pub ranking: RankingConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_offset_depth: 1000,
            default_snippet_lines: 5,
            ranking: RankingConfig::default(),
        }
    }
}

/// Multipliers applied on top of the bm25-like base score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Recency bucket boundaries in seconds, most recent first.
    pub recency_buckets_secs: Vec<i64>,
    /// Multiplier per bucket; one longer than the boundary list.
    pub recency_factors: Vec<f64>,
    pub boost_function: f64,
    pub boost_method: f64,
    pub boost_class: f64,
    pub boost_module: f64,
    pub exact_token_bonus: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            recency_buckets_secs: vec![3600, 86_400, 604_800, 2_592_000],
            recency_factors: vec![1.3, 1.2, 1.1, 1.05, 1.0],
            boost_function: 1.25,
            boost_method: 1.25,
            boost_class: 1.25,
            boost_module: 1.1,
            exact_token_bonus: 1.15,
        }
    }
}

/// Daemon lifecycle and endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub idle_sec: u64,
    pub session_grace_secs: u64,
    pub drain_timeout_secs: u64,
    pub heartbeat_secs: u64,
    pub health_fail_threshold: u32,
    pub registry_ttl_secs: i64,
    pub strict_ssot: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 47615,
            idle_sec: 600,
            session_grace_secs: 30,
            drain_timeout_secs: 45,
            heartbeat_secs: 5,
            health_fail_threshold: 3,
            registry_ttl_secs: 60,
            strict_ssot: true,
        }
    }
}

/// Read-gate budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_single_read_lines: usize,
    pub max_reads_per_session: usize,
    pub max_total_read_lines: usize,
    /// Precision reads may span at most this many lines.
    pub max_range_lines: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_single_read_lines: 300,
            max_reads_per_session: 25,
            max_total_read_lines: 2500,
            max_range_lines: 200,
        }
    }
}

/// Per-workspace overrides. A field present here replaces the global value
/// wholesale; list fields are replaced, never merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceOverrides {
    pub include_files: Option<Vec<String>>,
    pub include_ext: Option<Vec<String>>,
    pub exclude_dirs: Option<Vec<String>>,
    pub exclude_globs: Option<Vec<String>>,
    pub max_file_bytes: Option<u64>,
    pub follow_symlinks: Option<bool>,
}

impl SariConfig {
    /// Load configuration from `<data_dir>/sari.toml` when present,
    /// otherwise defaults; then apply environment overrides.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("sari.toml");
        let mut config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", config_path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for endpoint and SSOT mode.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("SARI_HTTP_HOST") {
            if !host.is_empty() {
                self.daemon.host = host;
            }
        }
        if let Ok(port) = std::env::var("SARI_HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.daemon.port = port;
            }
        }
        if let Ok(strict) = std::env::var("SARI_STRICT_SSOT") {
            self.daemon.strict_ssot = strict != "0" && !strict.eq_ignore_ascii_case("false");
        }
    }

    /// Apply per-workspace overrides, replace-per-field.
    pub fn with_workspace_overrides(&self, overrides: &WorkspaceOverrides) -> Self {
        let mut merged = self.clone();
        if let Some(v) = &overrides.include_files {
            merged.indexing.include_files = v.clone();
        }
        if let Some(v) = &overrides.include_ext {
            merged.indexing.include_ext = v.clone();
        }
        if let Some(v) = &overrides.exclude_dirs {
            merged.indexing.exclude_dirs = v.clone();
        }
        if let Some(v) = &overrides.exclude_globs {
            merged.indexing.exclude_globs = v.clone();
        }
        if let Some(v) = overrides.max_file_bytes {
            merged.indexing.max_file_bytes = v;
        }
        if let Some(v) = overrides.follow_symlinks {
            merged.indexing.follow_symlinks = v;
        }
        merged
    }

    /// Hash of the behavior-relevant sections. Folded into `index_version`
    /// so ranking or tokenizer changes invalidate old snapshots.
    pub fn config_hash(&self) -> String {
        #[derive(Serialize)]
        struct HashedSections<'a> {
            indexing: &'a IndexingConfig,
            ranking: &'a RankingConfig,
            max_doc_bytes: usize,
            tokenizer: &'static str,
        }
        let sections = HashedSections {
            indexing: &self.indexing,
            ranking: &self.search.ranking,
            max_doc_bytes: self.text_index.max_doc_bytes,
            tokenizer: "fold-nfkc.word-boundary.bigram-cjk",
        };
        let canonical =
            serde_json::to_vec(&sections).expect("config sections serialize to JSON");
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Resolve the per-host data root.
///
/// `SARI_DATA_DIR` wins; otherwise `~/.local/share/sari` (or the platform's
/// closest equivalent via HOME/USERPROFILE).
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("SARI_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".local").join("share").join("sari")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_loadable_without_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = SariConfig::load(dir.path()).expect("load defaults");
        assert_eq!(config.budget.max_single_read_lines, 300);
        assert_eq!(config.daemon.idle_sec, 600);
        assert!(config.indexing.include_ext.is_empty());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = SariConfig::default();
        config.indexing.exclude_globs = vec!["node_modules/**".to_string()];
        config.daemon.port = 50000;
        let raw = toml::to_string(&config).expect("serialize");
        std::fs::write(dir.path().join("sari.toml"), raw).expect("write config");

        let loaded = SariConfig::load(dir.path()).expect("load");
        assert_eq!(loaded.daemon.port, 50000);
        assert_eq!(loaded.indexing.exclude_globs, config.indexing.exclude_globs);
    }

    #[test]
    fn test_workspace_overrides_replace_per_field() {
        let global = SariConfig::default();
        let overrides = WorkspaceOverrides {
            exclude_globs: Some(vec!["vendor/**".to_string()]),
            max_file_bytes: Some(0),
            ..Default::default()
        };
        let merged = global.with_workspace_overrides(&overrides);
        // Replaced wholesale, not unioned with the global list.
        assert_eq!(merged.indexing.exclude_globs, vec!["vendor/**".to_string()]);
        assert_eq!(merged.indexing.max_file_bytes, 0);
        // Untouched fields keep the global values.
        assert_eq!(merged.indexing.exclude_dirs, global.indexing.exclude_dirs);
    }

    #[test]
    fn test_config_hash_tracks_ranking_changes() {
        let base = SariConfig::default();
        let mut changed = SariConfig::default();
        changed.search.ranking.exact_token_bonus = 2.0;
        assert_ne!(base.config_hash(), changed.config_hash());

        let mut unrelated = SariConfig::default();
        unrelated.daemon.port = 1;
        assert_eq!(base.config_hash(), unrelated.config_hash());
    }
}
