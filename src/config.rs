//! Shared config utilities for loading/saving JSON config files,
//! plus the engine-level configuration tree with its defaults.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Generic load for any Serde config type with a `Default` implementation.
/// Falls back to `T::default()` if the file is missing or unparsable.
pub fn load_json_config<T: DeserializeOwned + Default>(path: &Path, label: &str) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<T>(&content) {
            Ok(config) => {
                info!("[{}] Loaded config from {}", label, path.display());
                config
            }
            Err(e) => {
                warn!(
                    "[{}] Failed to parse config {}: {} — using defaults",
                    label,
                    path.display(),
                    e
                );
                T::default()
            }
        },
        Err(_) => {
            info!(
                "[{}] No config file at {} — using defaults",
                label,
                path.display()
            );
            T::default()
        }
    }
}

/// Generic save for any Serde config type.
pub fn save_json_config<T: Serialize>(path: &Path, config: &T, label: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {}", e))?;
    info!("[{}] Saved config to {}", label, path.display());
    Ok(())
}

/// Resolve an API key: check the direct `api_key` field first,
/// then fall back to reading the environment variable named in `api_key_env`.
pub fn resolve_api_key(api_key: &Option<String>, api_key_env: &Option<String>) -> Option<String> {
    if let Some(ref key) = api_key {
        if !key.is_empty() {
            return Some(key.clone());
        }
    }
    if let Some(ref env_var) = api_key_env {
        if let Ok(key) = std::env::var(env_var) {
            if !key.is_empty() {
                return Some(key);
            }
        }
    }
    None
}

// ── Engine configuration ───────────────────────────────────

/// Dreaming scheduler thresholds. One constant per phase: the extractor gates
/// on `extraction_threshold` but fetches `batch_size` logs; the consolidator
/// gates on `consolidation_threshold` but processes `consolidation_top_n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamingConfig {
    pub extraction_threshold: i64,
    pub consolidation_threshold: i64,
    pub batch_size: i64,
    pub consolidation_top_n: i64,
    pub evolution_min_interval_minutes: i64,
    pub evolution_min_memories: usize,
    pub evolution_min_text_length: usize,
    /// Seconds between dreaming passes on the ticker.
    pub dream_interval_secs: u64,
    /// Extraction retry cap; logs past it are skipped until manual reset.
    pub max_retry_count: i64,
}

impl Default for DreamingConfig {
    fn default() -> Self {
        Self {
            extraction_threshold: 20,
            consolidation_threshold: 20,
            batch_size: 10,
            consolidation_top_n: 10,
            evolution_min_interval_minutes: 15,
            evolution_min_memories: 20,
            evolution_min_text_length: 500,
            dream_interval_secs: 300,
            max_retry_count: 5,
        }
    }
}

/// Retrieval-side tuning: time-decay reranking and graph enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Score lost per hour of memory age during reranking.
    pub decay_rate_per_hour: f64,
    /// Decay never reduces a score below `original × decay_floor`.
    pub decay_floor: f64,
    pub vector_weight: f64,
    /// Extra `graph_context` entries appended past `limit`.
    pub enrichment_budget: usize,
    /// A hybrid pass that returns at least this many memories registers them
    /// as a consolidation batch for the dreaming scheduler.
    pub batch_min_cluster: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            decay_rate_per_hour: 0.0005,
            decay_floor: 0.8,
            vector_weight: 0.7,
            enrichment_budget: 3,
            batch_min_cluster: 5,
        }
    }
}

/// Knowledge-graph maintenance knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub edge_daily_decay_factor: f64,
    /// Edges whose effective strength falls below this are pruned.
    pub edge_survival_threshold: f64,
    /// The decay pass never lowers base_strength below this floor.
    pub decay_strength_floor: f64,
    pub curator_interval_secs: u64,
    /// LLM conflict arbitration. Disabled by default; natural decay is
    /// usually enough.
    pub conflict_arbitration_enabled: bool,
    pub arbitration_cluster_threshold: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            edge_daily_decay_factor: 0.99,
            edge_survival_threshold: 0.05,
            decay_strength_floor: 0.1,
            curator_interval_secs: 3600,
            conflict_arbitration_enabled: false,
            arbitration_cluster_threshold: 0.85,
        }
    }
}

/// What to do when session history crosses the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowStrategy {
    /// FIFO truncate to the last N messages.
    Slide,
    /// Clear and start fresh (preserves prompt-cache prefixes).
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub history_limit: usize,
    pub history_overflow: OverflowStrategy,
    pub free_tier_history_limit: usize,
    /// Hybrid-search results injected as the `## Related Memories` block.
    pub rag_limit: usize,
    /// Messages kept verbatim when background summarization fires.
    pub summarize_keep_last: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            history_overflow: OverflowStrategy::Slide,
            free_tier_history_limit: 5,
            rag_limit: 3,
            summarize_keep_last: 10,
        }
    }
}

/// Top-level engine configuration, persisted as `engine_config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dreaming: DreamingConfig,
    pub retrieval: RetrievalConfig,
    pub graph: GraphConfig,
    pub chat: ChatConfig,
}

pub fn load_engine_config(path: &Path) -> EngineConfig {
    load_json_config(path, "Engine")
}

pub fn save_engine_config(path: &Path, config: &EngineConfig) -> Result<(), String> {
    save_json_config(path, config, "Engine")
}
