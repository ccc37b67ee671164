//! Entity resolution: raw surface names to canonical graph node ids.
//!
//! Resolution order (first match wins): manual alias map, case-insensitive
//! name match, embedding-space dedup, fresh id. Ids are deterministic across
//! runs: `entity:Name`, with `⟨…⟩` brackets when the name needs quoting.

use crate::config;
use crate::embedding::{cosine_similarity, Embedder};
use crate::error::MemoryError;
use crate::storage::StorageDriver;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Cosine similarity above which two entity names are considered the same
/// real-world entity.
const SEMANTIC_DEDUP_THRESHOLD: f32 = 0.92;

/// Wrap names containing spaces or symbols in brackets so the id stays a
/// single opaque token.
pub fn sanitize_id(raw: &str) -> String {
    if !raw.is_empty() && raw.chars().all(|c| c.is_alphanumeric() || c == '_') {
        raw.to_string()
    } else {
        format!("⟨{}⟩", raw)
    }
}

pub fn entity_id(name: &str) -> String {
    format!("entity:{}", sanitize_id(name))
}

pub fn character_node_id(character_id: &str) -> String {
    format!("character:{}", sanitize_id(character_id))
}

pub fn insight_id(label: &str) -> String {
    format!("insight:{}", sanitize_id(label))
}

/// Static alias configuration (raw name → canonical name), read-mostly with
/// explicit reload.
pub struct AliasMap {
    path: Option<PathBuf>,
    map: RwLock<HashMap<String, String>>,
}

impl AliasMap {
    pub fn load(path: PathBuf) -> Self {
        let map: HashMap<String, String> = config::load_json_config(&path, "Aliases");
        Self {
            path: Some(path),
            map: RwLock::new(map),
        }
    }

    pub fn empty() -> Self {
        Self {
            path: None,
            map: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let map = pairs
            .iter()
            .map(|(a, c)| (a.to_string(), c.to_string()))
            .collect();
        Self {
            path: None,
            map: RwLock::new(map),
        }
    }

    pub fn reload(&self) {
        if let Some(ref path) = self.path {
            let fresh: HashMap<String, String> = config::load_json_config(path, "Aliases");
            info!("[Aliases] Reloaded {} entries", fresh.len());
            *self.map.write().expect("alias map lock") = fresh;
        }
    }

    pub fn canonical(&self, raw: &str) -> Option<String> {
        self.map.read().expect("alias map lock").get(raw).cloned()
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        self.map
            .read()
            .expect("alias map lock")
            .iter()
            .map(|(a, c)| (a.clone(), c.clone()))
            .collect()
    }
}

pub struct EntityResolver {
    driver: Arc<StorageDriver>,
    aliases: Arc<AliasMap>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl EntityResolver {
    pub fn new(
        driver: Arc<StorageDriver>,
        aliases: Arc<AliasMap>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            driver,
            aliases,
            embedder,
        }
    }

    /// Resolve a raw name to a canonical entity id. A fresh embedding is
    /// returned only when the entity is new, for the caller to upsert.
    pub async fn resolve(&self, raw_name: &str) -> Result<(String, Option<Vec<f32>>), MemoryError> {
        let raw_name = raw_name.trim();

        // 1. Alias check (manual override)
        if let Some(canonical) = self.aliases.canonical(raw_name) {
            return Ok((entity_id(&canonical), None));
        }

        // 2. Case-insensitive name match
        if let Some(id) = self.driver.find_entity_by_name_ci(raw_name).await? {
            return Ok((id, None));
        }

        let default_id = entity_id(raw_name);

        // 3. Semantic dedup, only when an embedder is available
        let embedder = match self.embedder {
            Some(ref e) => e,
            None => return Ok((default_id, None)),
        };

        let vec = match embedder.embed(raw_name).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[Resolver] Entity embedding failed for '{}': {}", raw_name, e);
                return Ok((default_id, None));
            }
        };

        let mut best: Option<(String, f32)> = None;
        for (id, existing) in self.driver.entity_embeddings().await? {
            let score = cosine_similarity(&vec, &existing);
            if score > SEMANTIC_DEDUP_THRESHOLD
                && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true)
            {
                best = Some((id, score));
            }
        }

        if let Some((matched_id, score)) = best {
            if matched_id != default_id {
                info!(
                    "[Resolver] Entity resolution: '{}' -> '{}' (score: {:.3})",
                    raw_name, matched_id, score
                );
            }
            return Ok((matched_id, None));
        }

        // 4. New entity: caller upserts with the returned embedding
        Ok((default_id, Some(vec)))
    }
}
