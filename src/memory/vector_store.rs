//! Episodic memory lifecycle and hybrid retrieval.
//!
//! Retrieval layers on the storage driver: RRF fusion of vector + lexical
//! results, direct entity-name matches expanded one hop into the knowledge
//! graph, time-decay reranking, importance boosting, and hit marking for the
//! consolidation pipeline.

use crate::config::RetrievalConfig;
use crate::embedding::EMBEDDING_DIM;
use crate::error::MemoryError;
use crate::storage::{
    rrf_fuse, MemoryKind, MemoryStatus, SearchItem, StorageDriver, VectorTable,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Adaptive retry tiers for client-facing vector search.
const ADAPTIVE_THRESHOLDS: [f32; 4] = [0.60, 0.45, 0.30, 0.15];

/// Default similarity gate inside hybrid retrieval.
const HYBRID_VECTOR_THRESHOLD: f32 = 0.3;

/// Effective-strength gate for 1-hop edge expansion.
const EDGE_EXPANSION_MIN_STRENGTH: f64 = 0.1;

/// RRF weight awarded to direct entity-name matches.
const ENTITY_MATCH_WEIGHT: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievedKind {
    Memory,
    Entity,
    GraphContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedMemory {
    pub id: String,
    pub content: String,
    pub score: f64,
    pub kind: RetrievedKind,
}

/// A cluster of semantically related memories surfaced by one retrieval
/// pass, queued for the dreaming consolidator.
#[derive(Debug, Clone)]
pub struct ConsolidationBatch {
    pub batch_id: String,
    pub memory_ids: Vec<String>,
}

#[derive(Default)]
pub struct BatchManager {
    pending: Mutex<VecDeque<ConsolidationBatch>>,
}

impl BatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, memory_ids: Vec<String>) {
        if memory_ids.is_empty() {
            return;
        }
        let batch = ConsolidationBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            memory_ids,
        };
        debug!(
            "[Batch] Registered consolidation batch {} ({} memories)",
            batch.batch_id,
            batch.memory_ids.len()
        );
        self.pending.lock().expect("batch lock").push_back(batch);
    }

    pub fn drain(&self) -> Vec<ConsolidationBatch> {
        self.pending.lock().expect("batch lock").drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("batch lock").len()
    }
}

pub struct VectorStore {
    driver: Arc<StorageDriver>,
    config: RetrievalConfig,
    batches: Arc<BatchManager>,
}

fn display_name(entity_id: &str) -> String {
    let name = entity_id.split_once(':').map(|(_, n)| n).unwrap_or(entity_id);
    name.trim_start_matches('⟨').trim_end_matches('⟩').to_string()
}

impl VectorStore {
    pub fn new(
        driver: Arc<StorageDriver>,
        config: RetrievalConfig,
        batches: Arc<BatchManager>,
    ) -> Self {
        Self {
            driver,
            config,
            batches,
        }
    }

    pub fn batches(&self) -> Arc<BatchManager> {
        self.batches.clone()
    }

    /// Insert an episodic memory after validating content and embedding.
    /// character_id is normalized to lowercase on write.
    pub async fn add_episodic_memory(
        &self,
        character_id: &str,
        content: &str,
        embedding: &[f32],
        status: MemoryStatus,
        hit_count: i64,
        kind: MemoryKind,
        now: i64,
    ) -> Result<String, MemoryError> {
        if content.trim().is_empty() {
            return Err(MemoryError::Validation("empty memory content".to_string()));
        }
        if embedding.len() != EMBEDDING_DIM {
            return Err(MemoryError::Validation(format!(
                "embedding dimension {} != {}",
                embedding.len(),
                EMBEDDING_DIM
            )));
        }
        if embedding.iter().all(|x| *x == 0.0) {
            return Err(MemoryError::Validation("zero embedding vector".to_string()));
        }

        self.driver
            .insert_episodic_memory(
                &character_id.to_lowercase(),
                content,
                embedding,
                status,
                hit_count,
                kind,
                now,
            )
            .await
    }

    /// Plain vector search over active memories at a fixed threshold.
    pub async fn search(
        &self,
        query_vector: &[f32],
        character_id: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SearchItem>, MemoryError> {
        self.driver
            .search_vector(
                VectorTable::EpisodicMemory,
                query_vector,
                limit,
                threshold,
                &character_id.to_lowercase(),
                true,
            )
            .await
    }

    /// Client-facing search with gradient degradation: retry down the
    /// threshold tiers until a tier yields enough results, else keep the
    /// lowest tier's result set.
    pub async fn search_adaptive(
        &self,
        query_vector: &[f32],
        character_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchItem>, MemoryError> {
        let mut results = Vec::new();
        for threshold in ADAPTIVE_THRESHOLDS {
            results = self
                .search(query_vector, character_id, limit, threshold)
                .await?;
            debug!(
                "[VectorStore] Adaptive tier {:.2}: {} results",
                threshold,
                results.len()
            );
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    pub async fn search_hybrid(
        &self,
        query: &str,
        query_vector: &[f32],
        character_id: &str,
        limit: usize,
        vector_weight: f64,
    ) -> Result<Vec<RetrievedMemory>, MemoryError> {
        self.search_hybrid_at(
            query,
            query_vector,
            character_id,
            limit,
            vector_weight,
            chrono::Utc::now().timestamp(),
        )
        .await
    }

    /// Hybrid retrieval with an injectable clock (`now` in unix seconds).
    pub async fn search_hybrid_at(
        &self,
        query: &str,
        query_vector: &[f32],
        character_id: &str,
        limit: usize,
        vector_weight: f64,
        now: i64,
    ) -> Result<Vec<RetrievedMemory>, MemoryError> {
        let character_id = character_id.to_lowercase();

        // 1. Vector + lexical candidates, each over-fetching 2 × limit
        let vec_results = self
            .driver
            .search_vector(
                VectorTable::EpisodicMemory,
                query_vector,
                limit * 2,
                HYBRID_VECTOR_THRESHOLD,
                &character_id,
                true,
            )
            .await?;
        let text_results = self
            .driver
            .search_fulltext(query, limit * 2, &character_id, true)
            .await?;

        // 2. Direct entity matches with 1-hop graph expansion
        let entity_results = self.entity_matches(query, now).await?;

        // 3. RRF fusion
        let fused = rrf_fuse(vec![
            (vec_results, vector_weight),
            (text_results, 1.0 - vector_weight),
            (entity_results, ENTITY_MATCH_WEIGHT),
        ]);

        // 4./5. Time-decay rerank + importance boost
        let mut reranked: Vec<SearchItem> = fused
            .into_iter()
            .map(|mut item| {
                let hours = (now - item.created_at).max(0) as f64 / 3600.0;
                let decay = (1.0 - self.config.decay_rate_per_hour * hours)
                    .max(self.config.decay_floor);
                let boost = 1.0 + item.importance.min(10.0) / 20.0;
                item.score = item.score * decay * boost;
                item
            })
            .collect();
        reranked
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        reranked.truncate(limit);

        // 6. Hit marking, exactly once per returned memory id
        let memory_ids: Vec<String> = reranked
            .iter()
            .filter(|item| item.id.starts_with("episodic_memory:"))
            .map(|item| item.id.clone())
            .collect();
        if !memory_ids.is_empty() {
            self.driver.mark_memories_hit(&memory_ids, now).await?;
        }

        // A dense cluster of related memories becomes consolidator input
        if memory_ids.len() >= self.config.batch_min_cluster {
            self.batches.register(memory_ids.clone());
        }

        let mut results: Vec<RetrievedMemory> = reranked
            .into_iter()
            .map(|item| RetrievedMemory {
                kind: if item.id.starts_with("entity:") {
                    RetrievedKind::Entity
                } else {
                    RetrievedKind::Memory
                },
                id: item.id,
                content: item.text,
                score: item.score,
            })
            .collect();

        // 7. Optional graph-context tail
        self.enrich_with_graph_context(&mut results, limit, now)
            .await?;

        Ok(results)
    }

    /// Entity-name matches on the lexical query, expanded one hop. Edge
    /// descriptions are merged into the entity's text; matches carry
    /// importance 2.0 into the boost stage.
    async fn entity_matches(&self, query: &str, now: i64) -> Result<Vec<SearchItem>, MemoryError> {
        let entities = match self.driver.search_entities_by_name(query, 3).await {
            Ok(list) => list,
            Err(e) => {
                warn!("[VectorStore] Entity search failed: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut items = Vec::with_capacity(entities.len());
        for entity in entities {
            let edges = self.driver.edges_for_entity(&entity.id).await?;
            let relations: Vec<String> = edges
                .iter()
                .filter(|e| {
                    e.effective_strength(now, 0.99) > EDGE_EXPANSION_MIN_STRENGTH
                })
                .map(|e| {
                    let line = format!(
                        "{} {} {}",
                        display_name(&e.in_id),
                        e.relation_type,
                        display_name(&e.out_id)
                    );
                    if e.context.is_empty() {
                        line
                    } else {
                        format!("{} ({})", line, e.context)
                    }
                })
                .collect();

            let text = if relations.is_empty() {
                format!("Entity: {}", entity.name)
            } else {
                format!("Entity: {}\nRelations:\n{}", entity.name, relations.join("\n"))
            };

            items.push(SearchItem {
                id: entity.id,
                text,
                score: 1.0,
                created_at: entity.last_updated,
                importance: 2.0,
            });
        }
        Ok(items)
    }

    /// Append 1-hop neighbours of returned entities as `graph_context`
    /// entries, floored below the weakest real result and capped at
    /// `limit + enrichment_budget`.
    async fn enrich_with_graph_context(
        &self,
        results: &mut Vec<RetrievedMemory>,
        limit: usize,
        now: i64,
    ) -> Result<(), MemoryError> {
        if self.config.enrichment_budget == 0 || results.is_empty() {
            return Ok(());
        }
        let cap = limit + self.config.enrichment_budget;
        let floor_score = results.last().map(|r| r.score * 0.5).unwrap_or(0.0);

        let entity_ids: Vec<String> = results
            .iter()
            .filter(|r| r.kind == RetrievedKind::Entity)
            .map(|r| r.id.clone())
            .collect();

        'outer: for entity_id in entity_ids {
            // Insight evidence first, then direct edges
            let mut related: Vec<String> = self
                .driver
                .derived_edges_for_insight(&entity_id)
                .await?;
            for edge in self.driver.edges_for_entity(&entity_id).await? {
                if edge.effective_strength(now, 0.99) > EDGE_EXPANSION_MIN_STRENGTH {
                    let other = if edge.in_id == entity_id {
                        edge.out_id.clone()
                    } else {
                        edge.in_id.clone()
                    };
                    related.push(other);
                }
            }

            for related_id in related {
                if results.len() >= cap {
                    break 'outer;
                }
                if results.iter().any(|r| r.id == related_id) {
                    continue;
                }
                let content = match self.driver.get_entity(&related_id).await? {
                    Some(e) => format!("Related entity: {}", e.name),
                    None => continue,
                };
                results.push(RetrievedMemory {
                    id: related_id,
                    content,
                    score: floor_score,
                    kind: RetrievedKind::GraphContext,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::memory_driver;

    fn emb(dims: &[(usize, f32)]) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for &(i, x) in dims {
            v[i] = x;
        }
        v
    }

    async fn store() -> (Arc<StorageDriver>, VectorStore) {
        let driver = Arc::new(memory_driver().await);
        let store = VectorStore::new(
            driver.clone(),
            RetrievalConfig::default(),
            Arc::new(BatchManager::new()),
        );
        (driver, store)
    }

    #[tokio::test]
    async fn add_memory_validates_content_and_dimension() {
        let (_, store) = store().await;

        let err = store
            .add_episodic_memory("Alice", "  ", &emb(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let err = store
            .add_episodic_memory("Alice", "short vec", &[1.0, 2.0], MemoryStatus::Active, 0, MemoryKind::Fact, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let err = store
            .add_episodic_memory(
                "Alice",
                "zero vec",
                &vec![0.0; EMBEDDING_DIM],
                MemoryStatus::Active,
                0,
                MemoryKind::Fact,
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[tokio::test]
    async fn character_id_is_lowercased_on_write() {
        let (driver, store) = store().await;
        store
            .add_episodic_memory("ALICE", "hello", &emb(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, 1)
            .await
            .unwrap();
        assert_eq!(driver.count_memories("alice").await.unwrap(), 1);
        assert_eq!(driver.count_memories("ALICE").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn adaptive_search_degrades_to_lower_tier() {
        let (_, store) = store().await;
        // Similarity to the query ends up ≈ 0.55: below the 0.60 tier,
        // above 0.45
        store
            .add_episodic_memory(
                "alice",
                "borderline",
                &emb(&[(0, 0.55), (1, 0.835)]),
                MemoryStatus::Active,
                0,
                MemoryKind::Fact,
                1,
            )
            .await
            .unwrap();

        let results = store
            .search_adaptive(&emb(&[(0, 1.0)]), "alice", 1)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "borderline");
    }

    #[tokio::test]
    async fn adaptive_search_returns_lowest_tier_when_never_enough() {
        let (_, store) = store().await;
        // Only one memory at ≈0.2 similarity; asking for 3 results never
        // fills, so the 0.15-tier set is returned.
        store
            .add_episodic_memory(
                "alice",
                "faint",
                &emb(&[(0, 0.2), (1, 0.98)]),
                MemoryStatus::Active,
                0,
                MemoryKind::Fact,
                1,
            )
            .await
            .unwrap();

        let results = store
            .search_adaptive(&emb(&[(0, 1.0)]), "alice", 3)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "faint");
    }

    #[tokio::test]
    async fn hybrid_time_decay_prefers_fresh_memories() {
        let (_, store) = store().await;
        let now = 1_000_000_000i64;
        let one_hour_ago = now - 3600;
        let old = now - 800 * 3600;

        store
            .add_episodic_memory("alice", "likes cats (new)", &emb(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, one_hour_ago)
            .await
            .unwrap();
        store
            .add_episodic_memory("alice", "likes cats (old)", &emb(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, old)
            .await
            .unwrap();

        let results = store
            .search_hybrid_at("cat preferences", &emb(&[(0, 1.0)]), "alice", 2, 0.7, now)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].content.contains("(new)"));
        assert!(results[1].content.contains("(old)"));
        // Both match only the vector list (ranks 0 and 1); the fresh memory
        // keeps ≈ its fused score while the old one sits on the 0.8 floor.
        let expected_new = (0.7 / 61.0) * (1.0 - 0.0005) * 1.05;
        let expected_old = (0.7 / 62.0) * 0.8 * 1.05;
        assert!((results[0].score - expected_new).abs() < 1e-9);
        assert!((results[1].score - expected_old).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hybrid_marks_hits_exactly_once_per_returned_memory() {
        let (driver, store) = store().await;
        let id = store
            .add_episodic_memory("alice", "likes tea", &emb(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, 1)
            .await
            .unwrap();

        store
            .search_hybrid_at("tea", &emb(&[(0, 1.0)]), "alice", 5, 0.7, 100)
            .await
            .unwrap();

        let mem = driver.get_memory(&id).await.unwrap().unwrap();
        assert_eq!(mem.hit_count, 1);
        assert_eq!(mem.last_hit_at, Some(100));
    }

    #[tokio::test]
    async fn hybrid_boosts_entity_matches_with_live_edges() {
        let (driver, store) = store().await;
        let now = 1_000_000i64;
        driver.upsert_entity("entity:Tea", "Tea", None, "general", now).await.unwrap();
        driver.upsert_entity("entity:Alice", "Alice", None, "general", now).await.unwrap();
        driver
            .insert_edge("entity:Alice", "entity:Tea", "LIKES", "green preferred", None, 0.5, now)
            .await
            .unwrap();

        store
            .add_episodic_memory("alice", "tea was discussed", &emb(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, now)
            .await
            .unwrap();

        let results = store
            .search_hybrid_at("Tea", &emb(&[(0, 1.0)]), "alice", 5, 0.7, now)
            .await
            .unwrap();

        let entity_hit = results
            .iter()
            .find(|r| r.kind == RetrievedKind::Entity)
            .expect("entity match should be included");
        assert!(entity_hit.content.contains("Alice LIKES Tea"));
        assert!(entity_hit.content.contains("green preferred"));
        // Weight 2.0 + importance boost puts the entity above the memory
        assert_eq!(results[0].kind, RetrievedKind::Entity);
    }

    #[tokio::test]
    async fn hybrid_excludes_fully_decayed_edges() {
        let (driver, store) = store().await;
        let now = 1_000 * 86_400i64;
        driver.upsert_entity("entity:Tea", "Tea", None, "general", now).await.unwrap();
        driver.upsert_entity("entity:Alice", "Alice", None, "general", now).await.unwrap();
        // Mentioned 500 days ago: effective strength ≈ 0.0044 < 0.1
        driver
            .insert_edge("entity:Alice", "entity:Tea", "LIKES", "", None, 0.5, now - 500 * 86_400)
            .await
            .unwrap();

        let results = store
            .search_hybrid_at("Tea", &emb(&[(0, 1.0)]), "alice", 5, 0.7, now)
            .await
            .unwrap();

        let entity_hit = results.iter().find(|r| r.kind == RetrievedKind::Entity).unwrap();
        assert!(!entity_hit.content.contains("Relations"));
    }

    #[tokio::test]
    async fn graph_enrichment_respects_budget_cap() {
        let (driver, store) = store().await;
        let now = 1_000i64;
        driver.upsert_entity("entity:Tea", "Tea", None, "general", now).await.unwrap();
        for i in 0..6 {
            let id = format!("entity:Thing{}", i);
            driver.upsert_entity(&id, &format!("Thing{}", i), None, "general", now).await.unwrap();
            driver
                .insert_edge("entity:Tea", &id, "RELATES_TO", "", None, 0.5, now)
                .await
                .unwrap();
        }

        let limit = 2;
        let results = store
            .search_hybrid_at("Tea", &emb(&[(0, 1.0)]), "alice", limit, 0.7, now)
            .await
            .unwrap();

        let budget = RetrievalConfig::default().enrichment_budget;
        assert!(results.len() <= limit + budget);
        let context_count = results
            .iter()
            .filter(|r| r.kind == RetrievedKind::GraphContext)
            .count();
        assert!(context_count <= budget + limit - 1);
        assert!(context_count >= 1, "expected some graph context entries");
    }

    #[tokio::test]
    async fn dense_memory_cluster_registers_consolidation_batch() {
        let (_, store) = store().await;
        for i in 0..6 {
            store
                .add_episodic_memory(
                    "alice",
                    &format!("tea note {}", i),
                    &emb(&[(0, 1.0), (1, i as f32 * 0.01)]),
                    MemoryStatus::Active,
                    0,
                    MemoryKind::Fact,
                    1,
                )
                .await
                .unwrap();
        }

        store
            .search_hybrid_at("tea", &emb(&[(0, 1.0)]), "alice", 6, 0.7, 100)
            .await
            .unwrap();

        let batches = store.batches().drain();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].memory_ids.len() >= 5);
    }
}
