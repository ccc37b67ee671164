//! Storage driver over SQLite.
//!
//! Persistence pattern: plain tables with TEXT record ids (`table:uuid`,
//! `entity:⟨name⟩`), embeddings stored as bincode BLOBs with cosine similarity
//! computed at query time, and an FTS5 virtual table kept in sync by triggers
//! for BM25 lexical search. Schema initialization is idempotent; failed
//! definitions are warnings only.

use crate::embedding::cosine_similarity;
use crate::error::MemoryError;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{error, warn};

/// RRF rank constant.
const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Active,
    Archived,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Fact,
    Summary,
    Insight,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Fact => "fact",
            MemoryKind::Summary => "summary",
            MemoryKind::Insight => "insight",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "summary" => MemoryKind::Summary,
            "insight" => MemoryKind::Insight,
            _ => MemoryKind::Fact,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationLog {
    pub id: String,
    pub character_id: String,
    pub narrative: String,
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
    pub is_processed: bool,
    pub retry_count: i64,
}

#[derive(Debug, Clone)]
pub struct EpisodicMemory {
    pub id: String,
    pub character_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: i64,
    pub status: MemoryStatus,
    pub hit_count: i64,
    pub last_hit_at: Option<i64>,
    pub kind: MemoryKind,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub embedding: Option<Vec<f32>>,
    pub kind: String,
    pub last_updated: i64,
}

#[derive(Debug, Clone)]
pub struct RelationEdge {
    pub id: String,
    pub in_id: String,
    pub out_id: String,
    pub relation_type: String,
    pub context: String,
    pub embedding: Option<Vec<f32>>,
    pub base_strength: f64,
    pub count: i64,
    pub weight: f64,
    pub created_at: i64,
    pub last_mentioned: i64,
}

impl RelationEdge {
    /// Time-decayed strength used for retrieval filtering and pruning.
    pub fn effective_strength(&self, now: i64, daily_factor: f64) -> f64 {
        let days = (now - self.last_mentioned).max(0) as f64 / 86_400.0;
        self.base_strength * daily_factor.powf(days)
    }
}

/// Unified result row from the search paths; `score` is cosine similarity for
/// vector hits, negated bm25 for lexical hits, and the fused value after RRF.
#[derive(Debug, Clone, Serialize)]
pub struct SearchItem {
    pub id: String,
    pub text: String,
    pub score: f64,
    pub created_at: i64,
    pub importance: f64,
}

#[derive(Debug, Clone, Copy)]
pub enum VectorTable {
    ConversationLog,
    EpisodicMemory,
}

pub struct StorageDriver {
    pool: SqlitePool,
}

fn encode_embedding(v: &[f32]) -> Result<Vec<u8>, MemoryError> {
    bincode::serialize(v).map_err(|e| MemoryError::Serialization(e.to_string()))
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, MemoryError> {
    bincode::deserialize(blob).map_err(|e| MemoryError::Serialization(e.to_string()))
}

/// Escape user input for FTS5 MATCH syntax.
/// Wraps each word in double quotes and joins with OR.
pub(crate) fn escape_fts5_query(query: &str) -> String {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| w.replace('"', ""))
        .filter(|w| !w.is_empty())
        .map(|clean| format!("\"{}\"", clean))
        .collect();
    words.join(" OR ")
}

/// Reciprocal Rank Fusion over weighted, rank-ordered result lists.
/// Returns the fused set sorted by score descending, without truncation.
pub fn rrf_fuse(lists: Vec<(Vec<SearchItem>, f64)>) -> Vec<SearchItem> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut items: HashMap<String, SearchItem> = HashMap::new();

    for (list, weight) in lists {
        for (rank, item) in list.into_iter().enumerate() {
            let entry = scores.entry(item.id.clone()).or_insert(0.0);
            *entry += weight / (RRF_K + rank as f64 + 1.0);
            items.entry(item.id.clone()).or_insert(item);
        }
    }

    let mut fused: Vec<SearchItem> = items
        .into_values()
        .map(|mut item| {
            item.score = scores[&item.id];
            item
        })
        .collect();
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

impl StorageDriver {
    pub async fn connect(db_url: &str) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(MemoryError::Storage)?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Trusted internal callers only: raw query pass-through.
    pub async fn query(&self, sql: &str) -> Result<Vec<SqliteRow>, MemoryError> {
        sqlx::query(sql).fetch_all(&self.pool).await.map_err(|e| {
            error!("[Storage] Query error: {}", e);
            MemoryError::Storage(e)
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema setup. Individual statement failures are logged as
    /// warnings so repeated runs against an existing database stay quiet.
    pub async fn initialize_schema(&self) {
        let statements = [
            "CREATE TABLE IF NOT EXISTS conversation_log (
                id TEXT PRIMARY KEY,
                character_id TEXT NOT NULL,
                narrative TEXT NOT NULL,
                embedding BLOB,
                created_at INTEGER NOT NULL,
                is_processed INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0
            );",
            "CREATE INDEX IF NOT EXISTS log_character ON conversation_log(character_id);",
            "CREATE INDEX IF NOT EXISTS log_time ON conversation_log(created_at);",
            "CREATE TABLE IF NOT EXISTS episodic_memory (
                id TEXT PRIMARY KEY,
                character_id TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_hit_at INTEGER,
                kind TEXT NOT NULL DEFAULT 'fact'
            );",
            "CREATE INDEX IF NOT EXISTS mem_character ON episodic_memory(character_id);",
            "CREATE INDEX IF NOT EXISTS mem_status ON episodic_memory(status);",
            "CREATE INDEX IF NOT EXISTS mem_time ON episodic_memory(created_at);",
            "CREATE VIRTUAL TABLE IF NOT EXISTS episodic_memory_fts USING fts5(
                content, content='episodic_memory', content_rowid='rowid'
            );",
            "CREATE TRIGGER IF NOT EXISTS episodic_memory_ai AFTER INSERT ON episodic_memory BEGIN
                INSERT INTO episodic_memory_fts(rowid, content) VALUES (new.rowid, new.content);
            END;",
            "CREATE TRIGGER IF NOT EXISTS episodic_memory_ad AFTER DELETE ON episodic_memory BEGIN
                INSERT INTO episodic_memory_fts(episodic_memory_fts, rowid, content)
                VALUES('delete', old.rowid, old.content);
            END;",
            "CREATE TRIGGER IF NOT EXISTS episodic_memory_au AFTER UPDATE ON episodic_memory BEGIN
                INSERT INTO episodic_memory_fts(episodic_memory_fts, rowid, content)
                VALUES('delete', old.rowid, old.content);
                INSERT INTO episodic_memory_fts(rowid, content) VALUES (new.rowid, new.content);
            END;",
            "INSERT INTO episodic_memory_fts(episodic_memory_fts) VALUES('rebuild');",
            "CREATE TABLE IF NOT EXISTS entity (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                embedding BLOB,
                kind TEXT NOT NULL DEFAULT 'general',
                description TEXT NOT NULL DEFAULT '',
                confidence REAL,
                weight REAL,
                last_updated INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS relation_edge (
                id TEXT PRIMARY KEY,
                in_id TEXT NOT NULL,
                out_id TEXT NOT NULL,
                relation_type TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '',
                embedding BLOB,
                base_strength REAL NOT NULL DEFAULT 0.8,
                count INTEGER NOT NULL DEFAULT 1,
                weight REAL NOT NULL DEFAULT 0.5,
                created_at INTEGER NOT NULL,
                last_mentioned INTEGER NOT NULL,
                UNIQUE(in_id, relation_type, out_id)
            );",
            "CREATE INDEX IF NOT EXISTS edge_in ON relation_edge(in_id);",
            "CREATE INDEX IF NOT EXISTS edge_out ON relation_edge(out_id);",
            "CREATE TABLE IF NOT EXISTS observes (
                observer_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                last_observed INTEGER NOT NULL,
                PRIMARY KEY (observer_id, target_id)
            );",
            "CREATE TABLE IF NOT EXISTS derived_from (
                insight_id TEXT NOT NULL,
                edge_id TEXT NOT NULL,
                PRIMARY KEY (insight_id, edge_id)
            );",
        ];

        for stmt in statements {
            if let Err(e) = sqlx::query(stmt).execute(&self.pool).await {
                warn!("[Storage] Schema note: {}", e);
            }
        }
    }

    // ── conversation_log ───────────────────────────────────

    pub async fn insert_conversation_log(
        &self,
        character_id: &str,
        narrative: &str,
        embedding: Option<&[f32]>,
        created_at: i64,
    ) -> Result<String, MemoryError> {
        let id = format!("conversation_log:{}", uuid::Uuid::new_v4());
        let blob = match embedding {
            Some(v) => Some(encode_embedding(v)?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO conversation_log (id, character_id, narrative, embedding, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(character_id)
        .bind(narrative)
        .bind(blob)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn count_unprocessed_logs(
        &self,
        character_id: &str,
        max_retry: i64,
    ) -> Result<i64, MemoryError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM conversation_log \
             WHERE character_id = ? AND is_processed = 0 AND retry_count < ?",
        )
        .bind(character_id)
        .bind(max_retry)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn fetch_unprocessed_logs(
        &self,
        character_id: &str,
        max_retry: i64,
        limit: i64,
    ) -> Result<Vec<ConversationLog>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, character_id, narrative, embedding, created_at, is_processed, retry_count \
             FROM conversation_log \
             WHERE character_id = ? AND is_processed = 0 AND retry_count < ? \
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(character_id)
        .bind(max_retry)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log).collect()
    }

    pub async fn mark_logs_processed(&self, ids: &[String]) -> Result<(), MemoryError> {
        for id in ids {
            sqlx::query(
                "UPDATE conversation_log SET is_processed = 1, retry_count = 0 WHERE id = ?",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn increment_log_retries(&self, ids: &[String]) -> Result<(), MemoryError> {
        for id in ids {
            sqlx::query("UPDATE conversation_log SET retry_count = retry_count + 1 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Manual reset for logs that hit the retry cap.
    pub async fn reset_log_retries(&self, character_id: &str) -> Result<u64, MemoryError> {
        let result = sqlx::query(
            "UPDATE conversation_log SET retry_count = 0 \
             WHERE character_id = ? AND is_processed = 0",
        )
        .bind(character_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn recent_conversations(
        &self,
        character_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationLog>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, character_id, narrative, embedding, created_at, is_processed, retry_count \
             FROM conversation_log WHERE character_id = ? \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(character_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log).collect()
    }

    pub async fn count_logs(&self, character_id: &str) -> Result<i64, MemoryError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM conversation_log WHERE character_id = ?")
                .bind(character_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    // ── episodic_memory ────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_episodic_memory(
        &self,
        character_id: &str,
        content: &str,
        embedding: &[f32],
        status: MemoryStatus,
        hit_count: i64,
        kind: MemoryKind,
        created_at: i64,
    ) -> Result<String, MemoryError> {
        let id = format!("episodic_memory:{}", uuid::Uuid::new_v4());
        let blob = encode_embedding(embedding)?;
        sqlx::query(
            "INSERT INTO episodic_memory \
             (id, character_id, content, embedding, created_at, status, hit_count, kind) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(character_id)
        .bind(content)
        .bind(blob)
        .bind(created_at)
        .bind(status.as_str())
        .bind(hit_count)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomic per-id increment of hit_count with last_hit_at refresh.
    pub async fn mark_memories_hit(&self, ids: &[String], now: i64) -> Result<(), MemoryError> {
        for id in ids {
            sqlx::query(
                "UPDATE episodic_memory SET hit_count = hit_count + 1, last_hit_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn get_memory(&self, id: &str) -> Result<Option<EpisodicMemory>, MemoryError> {
        let row = sqlx::query(
            "SELECT id, character_id, content, embedding, created_at, status, hit_count, last_hit_at, kind \
             FROM episodic_memory WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_memory).transpose()
    }

    pub async fn fetch_memories_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<EpisodicMemory>, MemoryError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mem) = self.get_memory(id).await? {
                out.push(mem);
            }
        }
        Ok(out)
    }

    pub async fn count_high_hit_active(
        &self,
        character_id: &str,
        min_hits: i64,
    ) -> Result<i64, MemoryError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM episodic_memory \
             WHERE character_id = ? AND status = 'active' AND hit_count > ?",
        )
        .bind(character_id)
        .bind(min_hits)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn fetch_top_hit_memories(
        &self,
        character_id: &str,
        min_hits: i64,
        limit: i64,
    ) -> Result<Vec<EpisodicMemory>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, character_id, content, embedding, created_at, status, hit_count, last_hit_at, kind \
             FROM episodic_memory \
             WHERE character_id = ? AND status = 'active' AND hit_count > ? \
             ORDER BY hit_count DESC LIMIT ?",
        )
        .bind(character_id)
        .bind(min_hits)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_memory).collect()
    }

    pub async fn archive_memories(&self, ids: &[String]) -> Result<(), MemoryError> {
        for id in ids {
            sqlx::query("UPDATE episodic_memory SET status = 'archived' WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn random_active_memories(
        &self,
        character_id: &str,
        limit: i64,
    ) -> Result<Vec<EpisodicMemory>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, character_id, content, embedding, created_at, status, hit_count, last_hit_at, kind \
             FROM episodic_memory WHERE character_id = ? AND status = 'active' \
             ORDER BY RANDOM() LIMIT ?",
        )
        .bind(character_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_memory).collect()
    }

    /// Recent active memories used as the inspiration sampling pool.
    pub async fn fetch_active_pool(
        &self,
        character_id: &str,
        limit: i64,
    ) -> Result<Vec<EpisodicMemory>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, character_id, content, embedding, created_at, status, hit_count, last_hit_at, kind \
             FROM episodic_memory WHERE character_id = ? AND status = 'active' \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(character_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_memory).collect()
    }

    pub async fn count_memories(&self, character_id: &str) -> Result<i64, MemoryError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM episodic_memory WHERE character_id = ?")
                .bind(character_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    // ── search ─────────────────────────────────────────────

    /// Brute-force cosine search over a table's embedding BLOBs,
    /// ordered descending, gated by `threshold`.
    pub async fn search_vector(
        &self,
        table: VectorTable,
        vector: &[f32],
        limit: usize,
        threshold: f32,
        character_id: &str,
        active_only: bool,
    ) -> Result<Vec<SearchItem>, MemoryError> {
        let sql = match (table, active_only) {
            (VectorTable::EpisodicMemory, true) => {
                "SELECT id, content AS text, embedding, created_at FROM episodic_memory \
                 WHERE character_id = ? AND status = 'active'"
            }
            (VectorTable::EpisodicMemory, false) => {
                "SELECT id, content AS text, embedding, created_at FROM episodic_memory \
                 WHERE character_id = ?"
            }
            (VectorTable::ConversationLog, _) => {
                "SELECT id, narrative AS text, embedding, created_at FROM conversation_log \
                 WHERE character_id = ? AND embedding IS NOT NULL"
            }
        };

        let rows = sqlx::query(sql)
            .bind(character_id)
            .fetch_all(&self.pool)
            .await?;

        let mut scored: Vec<SearchItem> = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let embedding = decode_embedding(&blob)?;
            let score = cosine_similarity(vector, &embedding) as f64;
            if score > threshold as f64 {
                scored.push(SearchItem {
                    id: row.get("id"),
                    text: row.get("text"),
                    score,
                    created_at: row.get("created_at"),
                    importance: 1.0,
                });
            }
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// BM25 keyword search over episodic memory content via FTS5.
    pub async fn search_fulltext(
        &self,
        query: &str,
        limit: usize,
        character_id: &str,
        active_only: bool,
    ) -> Result<Vec<SearchItem>, MemoryError> {
        let fts_query = escape_fts5_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let sql = if active_only {
            "SELECT m.id, m.content, m.created_at, bm25(episodic_memory_fts) AS rank \
             FROM episodic_memory_fts f \
             JOIN episodic_memory m ON m.rowid = f.rowid \
             WHERE episodic_memory_fts MATCH ? AND m.character_id = ? AND m.status = 'active' \
             ORDER BY rank LIMIT ?"
        } else {
            "SELECT m.id, m.content, m.created_at, bm25(episodic_memory_fts) AS rank \
             FROM episodic_memory_fts f \
             JOIN episodic_memory m ON m.rowid = f.rowid \
             WHERE episodic_memory_fts MATCH ? AND m.character_id = ? \
             ORDER BY rank LIMIT ?"
        };

        let rows = sqlx::query(sql)
            .bind(&fts_query)
            .bind(character_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SearchItem {
                    id: row.get("id"),
                    text: row.get("content"),
                    // bm25 is lower-is-better; negate so higher wins
                    score: -rank,
                    created_at: row.get("created_at"),
                    importance: 1.0,
                }
            })
            .collect())
    }

    /// Driver-level hybrid: vector + lexical (each fetching 2 × limit),
    /// fused via Reciprocal Rank Fusion with k = 60.
    #[allow(clippy::too_many_arguments)]
    pub async fn search_hybrid(
        &self,
        query: &str,
        vector: &[f32],
        limit: usize,
        threshold: f32,
        vector_weight: f64,
        character_id: &str,
        active_only: bool,
    ) -> Result<Vec<SearchItem>, MemoryError> {
        let vec_results = self
            .search_vector(
                VectorTable::EpisodicMemory,
                vector,
                limit * 2,
                threshold,
                character_id,
                active_only,
            )
            .await?;
        let text_results = self
            .search_fulltext(query, limit * 2, character_id, active_only)
            .await?;

        let mut fused = rrf_fuse(vec![
            (vec_results, vector_weight),
            (text_results, 1.0 - vector_weight),
        ]);
        fused.truncate(limit);
        Ok(fused)
    }

    // ── entity ─────────────────────────────────────────────

    /// Insert-or-update an entity node. The embedding is only written when a
    /// fresh one is supplied; identity and existing vectors survive rewrites.
    pub async fn upsert_entity(
        &self,
        id: &str,
        name: &str,
        embedding: Option<&[f32]>,
        kind: &str,
        now: i64,
    ) -> Result<(), MemoryError> {
        let blob = match embedding {
            Some(v) => Some(encode_embedding(v)?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO entity (id, name, embedding, kind, last_updated) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                name = excluded.name, \
                kind = excluded.kind, \
                last_updated = excluded.last_updated, \
                embedding = COALESCE(excluded.embedding, entity.embedding)",
        )
        .bind(id)
        .bind(name)
        .bind(blob)
        .bind(kind)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insight nodes carry description/confidence/weight on top of the base
    /// entity shape.
    pub async fn upsert_insight(
        &self,
        id: &str,
        label: &str,
        description: &str,
        confidence: f64,
        weight: f64,
        now: i64,
    ) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO entity (id, name, kind, description, confidence, weight, last_updated) \
             VALUES (?, ?, 'insight', ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                name = excluded.name, \
                kind = 'insight', \
                description = excluded.description, \
                confidence = excluded.confidence, \
                weight = excluded.weight, \
                last_updated = excluded.last_updated",
        )
        .bind(id)
        .bind(label)
        .bind(description)
        .bind(confidence)
        .bind(weight)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_entity_by_name_ci(&self, name: &str) -> Result<Option<String>, MemoryError> {
        let row = sqlx::query("SELECT id FROM entity WHERE LOWER(name) = LOWER(?) LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("id")))
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>, MemoryError> {
        let row = sqlx::query("SELECT id, name, embedding, kind, last_updated FROM entity WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entity).transpose()
    }

    /// All stored (id, embedding) pairs, for semantic dedup in the resolver.
    pub async fn entity_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>, MemoryError> {
        let rows = sqlx::query("SELECT id, embedding FROM entity WHERE embedding IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            out.push((row.get("id"), decode_embedding(&blob)?));
        }
        Ok(out)
    }

    pub async fn search_entities_by_name(
        &self,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Entity>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, name, embedding, kind, last_updated FROM entity \
             WHERE name LIKE '%' || ? || '%' LIMIT ?",
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entity).collect()
    }

    pub async fn delete_entity(&self, id: &str) -> Result<bool, MemoryError> {
        let result = sqlx::query("DELETE FROM entity WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── relation_edge ──────────────────────────────────────

    pub async fn find_edge(
        &self,
        in_id: &str,
        relation_type: &str,
        out_id: &str,
    ) -> Result<Option<RelationEdge>, MemoryError> {
        let row = sqlx::query(
            "SELECT id, in_id, out_id, relation_type, context, embedding, base_strength, count, \
                    weight, created_at, last_mentioned \
             FROM relation_edge WHERE in_id = ? AND relation_type = ? AND out_id = ? LIMIT 1",
        )
        .bind(in_id)
        .bind(relation_type)
        .bind(out_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_edge).transpose()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_edge(
        &self,
        in_id: &str,
        out_id: &str,
        relation_type: &str,
        context: &str,
        embedding: Option<&[f32]>,
        weight: f64,
        now: i64,
    ) -> Result<String, MemoryError> {
        let id = format!("relation_edge:{}", uuid::Uuid::new_v4());
        let blob = match embedding {
            Some(v) => Some(encode_embedding(v)?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO relation_edge \
             (id, in_id, out_id, relation_type, context, embedding, base_strength, count, weight, \
              created_at, last_mentioned) \
             VALUES (?, ?, ?, ?, ?, ?, 0.8, 1, ?, ?, ?)",
        )
        .bind(&id)
        .bind(in_id)
        .bind(out_id)
        .bind(relation_type)
        .bind(context)
        .bind(blob)
        .bind(weight)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Muscle model: repeated mention strengthens the edge.
    pub async fn reinforce_edge(&self, id: &str, now: i64) -> Result<(), MemoryError> {
        sqlx::query(
            "UPDATE relation_edge SET \
                count = count + 1, \
                base_strength = MIN(1.0, base_strength + 0.05), \
                last_mentioned = ? \
             WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 1-hop edges touching an entity, in either direction.
    pub async fn edges_for_entity(&self, entity_id: &str) -> Result<Vec<RelationEdge>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, in_id, out_id, relation_type, context, embedding, base_strength, count, \
                    weight, created_at, last_mentioned \
             FROM relation_edge WHERE in_id = ? OR out_id = ?",
        )
        .bind(entity_id)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_edge).collect()
    }

    pub async fn edges_for_subject(&self, in_id: &str) -> Result<Vec<RelationEdge>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, in_id, out_id, relation_type, context, embedding, base_strength, count, \
                    weight, created_at, last_mentioned \
             FROM relation_edge WHERE in_id = ?",
        )
        .bind(in_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_edge).collect()
    }

    pub async fn all_edges(&self) -> Result<Vec<RelationEdge>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, in_id, out_id, relation_type, context, embedding, base_strength, count, \
                    weight, created_at, last_mentioned \
             FROM relation_edge",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_edge).collect()
    }

    /// Global decay pass, floored so mentioned-once edges keep a trace.
    pub async fn decay_all_edges(&self, factor: f64, floor: f64) -> Result<u64, MemoryError> {
        let result = sqlx::query("UPDATE relation_edge SET base_strength = MAX(?, base_strength * ?)")
            .bind(floor)
            .bind(factor)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_edges(&self, ids: &[String]) -> Result<u64, MemoryError> {
        let mut deleted = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM relation_edge WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            deleted += result.rows_affected();
            sqlx::query("DELETE FROM observes WHERE target_id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM derived_from WHERE edge_id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(deleted)
    }

    /// Repoint every reference to `old_id` (edge endpoints, observer links,
    /// insight evidence) at `new_id`. Used by alias merging.
    pub async fn repoint_entity_refs(&self, old_id: &str, new_id: &str) -> Result<(), MemoryError> {
        sqlx::query("UPDATE OR REPLACE relation_edge SET in_id = ? WHERE in_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE OR REPLACE relation_edge SET out_id = ? WHERE out_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE OR REPLACE observes SET target_id = ? WHERE target_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE OR REPLACE derived_from SET insight_id = ? WHERE insight_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Edges pointing at entities that no longer exist. The curator deletes
    /// these on its next pass; writers self-heal by re-upserting endpoints.
    pub async fn orphan_edge_ids(&self) -> Result<Vec<String>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id FROM relation_edge \
             WHERE in_id NOT IN (SELECT id FROM entity) \
                OR out_id NOT IN (SELECT id FROM entity)",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // ── links ──────────────────────────────────────────────

    pub async fn link_observes(
        &self,
        observer_id: &str,
        target_id: &str,
        now: i64,
    ) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO observes (observer_id, target_id, last_observed) VALUES (?, ?, ?) \
             ON CONFLICT(observer_id, target_id) DO UPDATE SET last_observed = excluded.last_observed",
        )
        .bind(observer_id)
        .bind(target_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn link_derived_from(
        &self,
        insight_id: &str,
        edge_id: &str,
    ) -> Result<(), MemoryError> {
        sqlx::query("INSERT OR IGNORE INTO derived_from (insight_id, edge_id) VALUES (?, ?)")
            .bind(insight_id)
            .bind(edge_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn derived_edges_for_insight(
        &self,
        insight_id: &str,
    ) -> Result<Vec<String>, MemoryError> {
        let rows = sqlx::query("SELECT edge_id FROM derived_from WHERE insight_id = ?")
            .bind(insight_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("edge_id")).collect())
    }
}

fn row_to_log(row: &SqliteRow) -> Result<ConversationLog, MemoryError> {
    let blob: Option<Vec<u8>> = row.get("embedding");
    let embedding = blob.as_deref().map(decode_embedding).transpose()?;
    Ok(ConversationLog {
        id: row.get("id"),
        character_id: row.get("character_id"),
        narrative: row.get("narrative"),
        embedding,
        created_at: row.get("created_at"),
        is_processed: row.get::<i64, _>("is_processed") != 0,
        retry_count: row.get("retry_count"),
    })
}

fn row_to_memory(row: &SqliteRow) -> Result<EpisodicMemory, MemoryError> {
    let blob: Vec<u8> = row.get("embedding");
    let status: String = row.get("status");
    let kind: String = row.get("kind");
    Ok(EpisodicMemory {
        id: row.get("id"),
        character_id: row.get("character_id"),
        content: row.get("content"),
        embedding: decode_embedding(&blob)?,
        created_at: row.get("created_at"),
        status: if status == "archived" {
            MemoryStatus::Archived
        } else {
            MemoryStatus::Active
        },
        hit_count: row.get("hit_count"),
        last_hit_at: row.get("last_hit_at"),
        kind: MemoryKind::from_str(&kind),
    })
}

fn row_to_entity(row: &SqliteRow) -> Result<Entity, MemoryError> {
    let blob: Option<Vec<u8>> = row.get("embedding");
    let embedding = blob.as_deref().map(decode_embedding).transpose()?;
    Ok(Entity {
        id: row.get("id"),
        name: row.get("name"),
        embedding,
        kind: row.get("kind"),
        last_updated: row.get("last_updated"),
    })
}

fn row_to_edge(row: &SqliteRow) -> Result<RelationEdge, MemoryError> {
    let blob: Option<Vec<u8>> = row.get("embedding");
    let embedding = blob.as_deref().map(decode_embedding).transpose()?;
    Ok(RelationEdge {
        id: row.get("id"),
        in_id: row.get("in_id"),
        out_id: row.get("out_id"),
        relation_type: row.get("relation_type"),
        context: row.get("context"),
        embedding,
        base_strength: row.get("base_strength"),
        count: row.get("count"),
        weight: row.get("weight"),
        created_at: row.get("created_at"),
        last_mentioned: row.get("last_mentioned"),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn memory_driver() -> StorageDriver {
        let driver = StorageDriver::connect("sqlite::memory:").await.unwrap();
        driver.initialize_schema().await;
        driver
    }

    fn unit(dims: &[(usize, f32)]) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        for &(i, x) in dims {
            v[i] = x;
        }
        v
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let driver = memory_driver().await;
        // A second pass must not fail or spam errors
        driver.initialize_schema().await;
        let count = driver.count_logs("alice").await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn conversation_log_roundtrip_and_retry_flow() {
        let driver = memory_driver().await;
        let id = driver
            .insert_conversation_log("alice", "User: hi\nAI: hello", Some(&unit(&[(0, 1.0)])), 100)
            .await
            .unwrap();
        assert!(id.starts_with("conversation_log:"));

        assert_eq!(driver.count_unprocessed_logs("alice", 5).await.unwrap(), 1);

        driver.increment_log_retries(&[id.clone()]).await.unwrap();
        let logs = driver.fetch_unprocessed_logs("alice", 5, 10).await.unwrap();
        assert_eq!(logs[0].retry_count, 1);

        // Over the cap the log disappears from the unprocessed view
        for _ in 0..4 {
            driver.increment_log_retries(&[id.clone()]).await.unwrap();
        }
        assert_eq!(driver.count_unprocessed_logs("alice", 5).await.unwrap(), 0);

        // Manual reset brings it back
        driver.reset_log_retries("alice").await.unwrap();
        assert_eq!(driver.count_unprocessed_logs("alice", 5).await.unwrap(), 1);

        driver.mark_logs_processed(&[id]).await.unwrap();
        assert_eq!(driver.count_unprocessed_logs("alice", 5).await.unwrap(), 0);
        let logs = driver.recent_conversations("alice", 10).await.unwrap();
        assert!(logs[0].is_processed);
        assert_eq!(logs[0].retry_count, 0);
    }

    #[tokio::test]
    async fn vector_search_orders_by_cosine_and_applies_threshold() {
        let driver = memory_driver().await;
        driver
            .insert_episodic_memory("alice", "exact", &unit(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, 1)
            .await
            .unwrap();
        driver
            .insert_episodic_memory(
                "alice",
                "close",
                &unit(&[(0, 1.0), (1, 0.5)]),
                MemoryStatus::Active,
                0,
                MemoryKind::Fact,
                2,
            )
            .await
            .unwrap();
        driver
            .insert_episodic_memory("alice", "orthogonal", &unit(&[(2, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, 3)
            .await
            .unwrap();

        let results = driver
            .search_vector(VectorTable::EpisodicMemory, &unit(&[(0, 1.0)]), 10, 0.3, "alice", true)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "exact");
        assert_eq!(results[1].text, "close");
    }

    #[tokio::test]
    async fn vector_search_excludes_archived_and_other_characters() {
        let driver = memory_driver().await;
        driver
            .insert_episodic_memory("alice", "mine", &unit(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, 1)
            .await
            .unwrap();
        driver
            .insert_episodic_memory("alice", "archived", &unit(&[(0, 1.0)]), MemoryStatus::Archived, 0, MemoryKind::Fact, 1)
            .await
            .unwrap();
        driver
            .insert_episodic_memory("bob", "other", &unit(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, 1)
            .await
            .unwrap();

        let results = driver
            .search_vector(VectorTable::EpisodicMemory, &unit(&[(0, 1.0)]), 10, 0.1, "alice", true)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "mine");
    }

    #[tokio::test]
    async fn fulltext_search_finds_by_keyword() {
        let driver = memory_driver().await;
        driver
            .insert_episodic_memory(
                "alice",
                "likes green tea in the morning",
                &unit(&[(0, 1.0)]),
                MemoryStatus::Active,
                0,
                MemoryKind::Fact,
                1,
            )
            .await
            .unwrap();
        driver
            .insert_episodic_memory(
                "alice",
                "works as a carpenter",
                &unit(&[(1, 1.0)]),
                MemoryStatus::Active,
                0,
                MemoryKind::Fact,
                2,
            )
            .await
            .unwrap();

        let results = driver.search_fulltext("tea", 10, "alice", true).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].text.contains("green tea"));

        // Quote injection is neutralized
        let results = driver
            .search_fulltext("\"tea OR carpenter", 10, "alice", true)
            .await
            .unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn hybrid_search_fuses_both_sources() {
        let driver = memory_driver().await;
        // Strong lexical match, weak vector
        driver
            .insert_episodic_memory(
                "alice",
                "tea ceremony enthusiast",
                &unit(&[(3, 1.0)]),
                MemoryStatus::Active,
                0,
                MemoryKind::Fact,
                1,
            )
            .await
            .unwrap();
        // Strong vector match, no lexical overlap
        driver
            .insert_episodic_memory(
                "alice",
                "enjoys warm drinks",
                &unit(&[(0, 1.0)]),
                MemoryStatus::Active,
                0,
                MemoryKind::Fact,
                2,
            )
            .await
            .unwrap();

        let results = driver
            .search_hybrid("tea", &unit(&[(0, 1.0)]), 5, 0.1, 0.7, "alice", true)
            .await
            .unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.text.as_str()).collect();
        assert!(texts.contains(&"tea ceremony enthusiast"));
        assert!(texts.contains(&"enjoys warm drinks"));
    }

    #[tokio::test]
    async fn mark_memories_hit_increments_each_id_once() {
        let driver = memory_driver().await;
        let id = driver
            .insert_episodic_memory("alice", "m", &unit(&[(0, 1.0)]), MemoryStatus::Active, 0, MemoryKind::Fact, 1)
            .await
            .unwrap();

        driver.mark_memories_hit(&[id.clone()], 50).await.unwrap();
        driver.mark_memories_hit(&[id.clone()], 60).await.unwrap();

        let mem = driver.get_memory(&id).await.unwrap().unwrap();
        assert_eq!(mem.hit_count, 2);
        assert_eq!(mem.last_hit_at, Some(60));
    }

    #[tokio::test]
    async fn edge_reinforcement_caps_strength_at_one() {
        let driver = memory_driver().await;
        driver.upsert_entity("entity:Alice", "Alice", None, "general", 1).await.unwrap();
        driver.upsert_entity("entity:Tea", "Tea", None, "general", 1).await.unwrap();
        let edge_id = driver
            .insert_edge("entity:Alice", "entity:Tea", "LIKES", "", None, 0.5, 1)
            .await
            .unwrap();

        // 0.8 + 0.05 × 6 would exceed 1.0; must clamp
        for i in 0..6 {
            driver.reinforce_edge(&edge_id, 10 + i).await.unwrap();
        }
        let edge = driver.find_edge("entity:Alice", "LIKES", "entity:Tea").await.unwrap().unwrap();
        assert_eq!(edge.count, 7);
        assert!(edge.base_strength <= 1.0);
        assert!((edge.base_strength - 1.0).abs() < 1e-9);
        assert_eq!(edge.last_mentioned, 15);
    }

    #[tokio::test]
    async fn entity_upsert_preserves_existing_embedding() {
        let driver = memory_driver().await;
        let emb = unit(&[(0, 1.0)]);
        driver.upsert_entity("entity:Tea", "Tea", Some(&emb), "general", 1).await.unwrap();
        // Rewrite without embedding must not erase the stored one
        driver.upsert_entity("entity:Tea", "Tea", None, "general", 2).await.unwrap();

        let entity = driver.get_entity("entity:Tea").await.unwrap().unwrap();
        assert_eq!(entity.last_updated, 2);
        assert!(entity.embedding.is_some());
    }

    #[tokio::test]
    async fn repoint_entity_refs_moves_edges() {
        let driver = memory_driver().await;
        driver.upsert_entity("entity:Bob", "Bob", None, "general", 1).await.unwrap();
        driver.upsert_entity("entity:Robert", "Robert", None, "general", 1).await.unwrap();
        driver.upsert_entity("entity:Paris", "Paris", None, "general", 1).await.unwrap();
        driver
            .insert_edge("entity:Bob", "entity:Paris", "KNOWS", "", None, 0.5, 1)
            .await
            .unwrap();

        driver.repoint_entity_refs("entity:Bob", "entity:Robert").await.unwrap();
        let edge = driver.find_edge("entity:Robert", "KNOWS", "entity:Paris").await.unwrap();
        assert!(edge.is_some());
        assert!(driver
            .find_edge("entity:Bob", "KNOWS", "entity:Paris")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn orphan_edges_are_detected() {
        let driver = memory_driver().await;
        driver.upsert_entity("entity:A", "A", None, "general", 1).await.unwrap();
        driver.upsert_entity("entity:B", "B", None, "general", 1).await.unwrap();
        let edge_id = driver
            .insert_edge("entity:A", "entity:B", "KNOWS", "", None, 0.5, 1)
            .await
            .unwrap();

        assert!(driver.orphan_edge_ids().await.unwrap().is_empty());
        driver.delete_entity("entity:B").await.unwrap();
        let orphans = driver.orphan_edge_ids().await.unwrap();
        assert_eq!(orphans, vec![edge_id]);
    }

    #[test]
    fn rrf_scores_follow_the_formula() {
        let a = SearchItem {
            id: "x".into(),
            text: "x".into(),
            score: 0.9,
            created_at: 0,
            importance: 1.0,
        };
        let b = SearchItem {
            id: "y".into(),
            text: "y".into(),
            score: 0.8,
            created_at: 0,
            importance: 1.0,
        };
        // x is rank 0 in list 1 (weight 0.7); y is rank 1 in list 1 and rank 0
        // in list 2 (weight 0.3)
        let fused = rrf_fuse(vec![
            (vec![a.clone(), b.clone()], 0.7),
            (vec![b.clone()], 0.3),
        ]);
        let x = fused.iter().find(|i| i.id == "x").unwrap();
        let y = fused.iter().find(|i| i.id == "y").unwrap();
        assert!((x.score - 0.7 / 61.0).abs() < 1e-9);
        assert!((y.score - (0.7 / 62.0 + 0.3 / 61.0)).abs() < 1e-9);
        // Dual-source presence outranks a single first-place hit here
        assert_eq!(fused[0].id, "y");
    }

    #[test]
    fn effective_strength_decays_daily() {
        let edge = RelationEdge {
            id: "e".into(),
            in_id: "a".into(),
            out_id: "b".into(),
            relation_type: "LIKES".into(),
            context: String::new(),
            embedding: None,
            base_strength: 0.8,
            count: 1,
            weight: 0.5,
            created_at: 0,
            last_mentioned: 0,
        };
        let ten_days = 10 * 86_400;
        let strength = edge.effective_strength(ten_days, 0.99);
        assert!((strength - 0.8 * 0.99f64.powf(10.0)).abs() < 1e-9);

        // 500 days out, an un-reinforced edge is far below the survival line
        let far = edge.effective_strength(500 * 86_400, 0.99);
        assert!(far < 0.005);
    }

    #[test]
    fn fts5_escaping_quotes_words() {
        assert_eq!(escape_fts5_query("green tea"), "\"green\" OR \"tea\"");
        assert_eq!(escape_fts5_query("say \"hi\""), "\"say\" OR \"hi\"");
        assert_eq!(escape_fts5_query("  "), "");
    }
}
