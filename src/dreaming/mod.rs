//! The dreaming scheduler: the background pipeline that turns raw
//! conversation logs into episodic memories, compresses frequently recalled
//! memories into insights, and periodically lets the character's personality
//! drift based on what it lived through.
//!
//! One instance per character; a digest lock keeps runs serialized. All LM
//! and parse failures log and return without touching data. Extraction
//! failures additionally bump retry counts so the batch comes back next
//! cycle.

pub mod prompts;

use crate::character::{CharacterStore, EvolutionUpdate, Mood};
use crate::config::DreamingConfig;
use crate::embedding::Embedder;
use crate::error::LlmError;
use crate::llm::provider::{LlmParams, LlmProvider, Message};
use crate::llm::strip_code_fences;
use crate::memory::vector_store::BatchManager;
use crate::memory::MemoryCore;
use crate::storage::{MemoryKind, MemoryStatus};
use crate::ticker::Ticker;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// hit_count must exceed this for a memory to be a consolidation candidate.
const CONSOLIDATION_MIN_HITS: i64 = 1;

/// Random active memories fed to the evolution prompt as long-term context.
const EVOLUTION_CONTEXT_MEMORIES: i64 = 10;

/// The evolution prompt only sees the tail of the accumulated text.
const EVOLUTION_TEXT_WINDOW: usize = 2000;

struct EvolutionTracker {
    last_run: Option<DateTime<Utc>>,
    processed: usize,
    accumulated: String,
}

pub struct DreamingScheduler {
    memory: Arc<MemoryCore>,
    character: Arc<CharacterStore>,
    llm: Arc<dyn LlmProvider>,
    embedder: Option<Arc<dyn Embedder>>,
    batches: Arc<BatchManager>,
    config: DreamingConfig,
    digest_lock: tokio::sync::Mutex<()>,
    evolution: Mutex<EvolutionTracker>,
}

impl DreamingScheduler {
    pub fn new(
        memory: Arc<MemoryCore>,
        character: Arc<CharacterStore>,
        llm: Arc<dyn LlmProvider>,
        embedder: Option<Arc<dyn Embedder>>,
        batches: Arc<BatchManager>,
        config: DreamingConfig,
    ) -> Self {
        Self {
            memory,
            character,
            llm,
            embedder,
            batches,
            config,
            digest_lock: tokio::sync::Mutex::new(()),
            evolution: Mutex::new(EvolutionTracker {
                last_run: None,
                processed: 0,
                accumulated: String::new(),
            }),
        }
    }

    /// Subscribe to the global ticker and run a dreaming pass every
    /// `dream_interval_secs`. The tick handler only spawns; it never blocks
    /// the ticker.
    pub fn spawn(self: Arc<Self>, ticker: &Ticker) -> JoinHandle<()> {
        let mut rx = ticker.subscribe();
        let interval = self.config.dream_interval_secs as i64;
        let batch_size = self.config.batch_size;
        tokio::spawn(async move {
            let mut last_run: Option<DateTime<Utc>> = None;
            loop {
                let now = match rx.recv().await {
                    Ok(now) => now,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let due = last_run
                    .map(|t| (now - t).num_seconds() >= interval)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                last_run = Some(now);
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.process_memories(batch_size).await;
                });
            }
        })
    }

    /// One full reverie cycle: extract, consolidate (threshold + batch),
    /// evolve. Phases are independent; each skips on its own gate.
    pub async fn process_memories(&self, batch_size: i64) {
        let _guard = match self.digest_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("[Dreaming] Digest already in progress, skipping");
                return;
            }
        };

        debug!(
            "[Dreaming] Starting reverie cycle for '{}'",
            self.character.character_id()
        );

        if let Err(e) = self.run_extractor(batch_size).await {
            error!("[Dreaming] Extractor failed: {}", e);
        }
        if let Err(e) = self.run_consolidator().await {
            error!("[Dreaming] Consolidator failed: {}", e);
        }
        self.run_batch_consolidations().await;
        self.check_and_trigger_evolution(Utc::now()).await;
    }

    /// Feed text into the evolution accumulator. Called by the extractor;
    /// external callers may add their own signal.
    pub fn accumulate_for_evolution(&self, text: &str, count: usize) {
        let mut tracker = self.evolution.lock().expect("evolution lock");
        tracker.accumulated.push_str(text);
        tracker.accumulated.push('\n');
        tracker.processed += count;
    }

    #[cfg(test)]
    fn set_last_evolution(&self, at: DateTime<Utc>) {
        self.evolution.lock().expect("evolution lock").last_run = Some(at);
    }

    // ── Phase 1: extractor ─────────────────────────────────

    async fn run_extractor(&self, batch_size: i64) -> anyhow::Result<()> {
        let character_id = self.character.character_id();
        let embedder = match self.embedder {
            Some(ref e) => e.clone(),
            None => {
                debug!("[Dreaming] No embedder configured, extraction skipped");
                return Ok(());
            }
        };

        let total = self
            .memory
            .count_unprocessed_conversations(character_id)
            .await?;
        if total < self.config.extraction_threshold {
            debug!(
                "[Dreaming] Accumulating logs for {} ({}/{})",
                character_id, total, self.config.extraction_threshold
            );
            return Ok(());
        }

        let logs = self
            .memory
            .get_unprocessed_conversations(batch_size, character_id)
            .await?;
        if logs.is_empty() {
            return Ok(());
        }
        let log_ids: Vec<String> = logs.iter().map(|l| l.id.clone()).collect();

        let mut log_text = String::new();
        for log in &logs {
            let ts = DateTime::from_timestamp(log.created_at, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            log_text.push_str(&format!("[{}] {}\n", ts, log.narrative));
        }

        let messages = vec![
            Message::system(prompts::EXTRACTOR_SYSTEM_PROMPT),
            Message::user(prompts::extraction_prompt(&log_text)),
        ];
        let params = LlmParams {
            temperature: Some(0.3),
            json_mode: true,
            ..LlmParams::default()
        };

        let fragments = match self.llm.chat(messages, Some(params)).await {
            Ok(response) => match parse_memory_list(&response) {
                Ok(fragments) => fragments,
                Err(e) => {
                    warn!("[Dreaming] Extraction parse failed: {}", e);
                    self.memory.increment_conversation_retries(&log_ids).await?;
                    return Ok(());
                }
            },
            Err(e) => {
                warn!("[Dreaming] Extraction LM call failed: {}", e);
                self.memory.increment_conversation_retries(&log_ids).await?;
                return Ok(());
            }
        };

        let now = Utc::now().timestamp();
        let store = self.memory.vector_store();
        for fragment in &fragments {
            let vector = match embedder.embed(fragment).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("[Dreaming] Failed to encode memory: {}", e);
                    continue;
                }
            };
            if let Err(e) = store
                .add_episodic_memory(
                    character_id,
                    fragment,
                    &vector,
                    MemoryStatus::Active,
                    0,
                    MemoryKind::Fact,
                    now,
                )
                .await
            {
                warn!("[Dreaming] Failed to store fragment: {}", e);
            }
        }

        self.memory.mark_conversations_processed(&log_ids).await?;
        self.accumulate_for_evolution(&log_text, fragments.len());

        info!(
            "[Dreaming] Extracted {} fragments from {} logs for '{}'",
            fragments.len(),
            logs.len(),
            character_id
        );
        Ok(())
    }

    // ── Phase 2: hit-count consolidator ────────────────────

    async fn run_consolidator(&self) -> anyhow::Result<()> {
        let character_id = self.character.character_id();
        let driver = self.memory.driver();

        let candidates = driver
            .count_high_hit_active(character_id, CONSOLIDATION_MIN_HITS)
            .await?;
        if candidates < self.config.consolidation_threshold {
            debug!(
                "[Dreaming] Consolidator skipped: {}/{} candidates",
                candidates, self.config.consolidation_threshold
            );
            return Ok(());
        }

        info!(
            "[Dreaming] Consolidator triggered: {} candidates, processing top {}",
            candidates, self.config.consolidation_top_n
        );

        let pending = driver
            .fetch_top_hit_memories(
                character_id,
                CONSOLIDATION_MIN_HITS,
                self.config.consolidation_top_n,
            )
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let input: Vec<Value> = pending
            .iter()
            .enumerate()
            .map(|(i, mem)| {
                let date = DateTime::from_timestamp(mem.created_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                json!({
                    "id": (i + 1).to_string(),
                    "memory": mem.content,
                    "hits": mem.hit_count,
                    "date": date,
                })
            })
            .collect();
        let input_json = serde_json::to_string_pretty(&input)?;

        let consolidated = self
            .consolidate_via_llm(&prompts::consolidation_prompt(&input_json))
            .await?;

        let now = Utc::now().timestamp();
        let store = self.memory.vector_store();
        for fragment in &consolidated {
            self.insert_consolidated(&store, character_id, fragment, now)
                .await;
        }

        let old_ids: Vec<String> = pending.iter().map(|m| m.id.clone()).collect();
        driver.archive_memories(&old_ids).await?;

        info!(
            "[Dreaming] Consolidated {} high-hit memories -> {} new insights",
            pending.len(),
            consolidated.len()
        );
        Ok(())
    }

    // ── Phase 2b: retrieval-driven batch consolidator ──────

    async fn run_batch_consolidations(&self) {
        let character_id = self.character.character_id();
        for batch in self.batches.drain() {
            let driver = self.memory.driver();
            let pending = match driver.fetch_memories_by_ids(&batch.memory_ids).await {
                Ok(mems) if !mems.is_empty() => mems,
                Ok(_) => {
                    debug!("[Dreaming] Batch {} has no memories", batch.batch_id);
                    continue;
                }
                Err(e) => {
                    error!("[Dreaming] Batch {} fetch failed: {}", batch.batch_id, e);
                    continue;
                }
            };

            let input: Vec<Value> = pending
                .iter()
                .enumerate()
                .map(|(i, mem)| json!({"id": (i + 1).to_string(), "memory": mem.content}))
                .collect();
            let input_json = match serde_json::to_string_pretty(&input) {
                Ok(s) => s,
                Err(e) => {
                    error!("[Dreaming] Batch {} encode failed: {}", batch.batch_id, e);
                    continue;
                }
            };

            let consolidated = match self
                .consolidate_via_llm(&prompts::batch_consolidation_prompt(&input_json))
                .await
            {
                Ok(fragments) => fragments,
                Err(e) => {
                    error!("[Dreaming] Batch {} consolidation failed: {}", batch.batch_id, e);
                    continue;
                }
            };

            let old_ids: Vec<String> = pending.iter().map(|m| m.id.clone()).collect();
            if let Err(e) = driver.archive_memories(&old_ids).await {
                error!("[Dreaming] Batch {} archive failed: {}", batch.batch_id, e);
                continue;
            }

            let now = Utc::now().timestamp();
            let store = self.memory.vector_store();
            for fragment in &consolidated {
                self.insert_consolidated(&store, character_id, fragment, now)
                    .await;
            }

            info!(
                "[Dreaming] Batch {}: {} -> {} memories",
                batch.batch_id,
                pending.len(),
                consolidated.len()
            );
        }
    }

    async fn consolidate_via_llm(&self, prompt: &str) -> Result<Vec<String>, LlmError> {
        let messages = vec![
            Message::system(prompts::CONSOLIDATOR_SYSTEM_PROMPT),
            Message::user(prompt.to_string()),
        ];
        let params = LlmParams {
            temperature: Some(0.5),
            json_mode: true,
            ..LlmParams::default()
        };
        let response = self.llm.chat(messages, Some(params)).await?;
        parse_memory_list(&response)
    }

    async fn insert_consolidated(
        &self,
        store: &crate::memory::vector_store::VectorStore,
        character_id: &str,
        fragment: &str,
        now: i64,
    ) {
        let embedder = match self.embedder {
            Some(ref e) => e,
            None => return,
        };
        let vector = match embedder.embed(fragment).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[Dreaming] Failed to encode consolidated memory: {}", e);
                return;
            }
        };
        // Consolidated memories start fresh: active, zero hits
        if let Err(e) = store
            .add_episodic_memory(
                character_id,
                fragment,
                &vector,
                MemoryStatus::Active,
                0,
                MemoryKind::Insight,
                now,
            )
            .await
        {
            warn!("[Dreaming] Failed to store consolidated memory: {}", e);
        }
    }

    // ── Phase 3: personality evolution ─────────────────────

    async fn check_and_trigger_evolution(&self, now: DateTime<Utc>) {
        if !self.character.config().soul_evolution_enabled {
            return;
        }

        let text_batch = {
            let tracker = self.evolution.lock().expect("evolution lock");

            if let Some(last) = tracker.last_run {
                let elapsed_minutes = (now - last).num_minutes();
                if elapsed_minutes < self.config.evolution_min_interval_minutes {
                    debug!(
                        "[Evolution] Skipped: only {}/{} minutes since last run",
                        elapsed_minutes, self.config.evolution_min_interval_minutes
                    );
                    return;
                }
            }
            if tracker.processed < self.config.evolution_min_memories {
                debug!(
                    "[Evolution] Skipped: only {}/{} memories processed",
                    tracker.processed, self.config.evolution_min_memories
                );
                return;
            }
            if tracker.accumulated.len() < self.config.evolution_min_text_length {
                debug!(
                    "[Evolution] Skipped: only {}/{} chars accumulated",
                    tracker.accumulated.len(),
                    self.config.evolution_min_text_length
                );
                return;
            }
            tracker.accumulated.clone()
        };

        info!("[Evolution] All gates passed, triggering evolution");
        match self.analyze_evolution(&text_batch).await {
            Ok(()) => {
                let mut tracker = self.evolution.lock().expect("evolution lock");
                tracker.last_run = Some(now);
                tracker.processed = 0;
                tracker.accumulated.clear();
            }
            Err(e) => error!("[Evolution] Analysis failed: {}", e),
        }
    }

    async fn analyze_evolution(&self, text_batch: &str) -> anyhow::Result<()> {
        let character_id = self.character.character_id();
        let profile = self.character.profile();

        let random_memories = self
            .memory
            .driver()
            .random_active_memories(character_id, EVOLUTION_CONTEXT_MEMORIES)
            .await?;
        let memory_context = random_memories
            .iter()
            .map(|m| format!("- {}", m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let window: String = text_batch
            .chars()
            .take(EVOLUTION_TEXT_WINDOW)
            .collect();

        let user_prompt = prompts::evolution_user_prompt(
            &profile.personality.traits,
            &serde_json::to_string(&profile.personality.big_five)?,
            &serde_json::to_string(&profile.personality.pad)?,
            &profile.current_mood.to_string(),
            &memory_context,
            &window,
        );

        let messages = vec![
            Message::system(prompts::EVOLUTION_SYSTEM_PROMPT),
            Message::user(user_prompt),
        ];
        let params = LlmParams {
            // Slightly higher temperature to encourage actual change
            temperature: Some(0.4),
            json_mode: true,
            ..LlmParams::default()
        };

        let response = self.llm.chat(messages, Some(params)).await?;
        let (update, mood) = parse_evolution(&response)?;
        self.character.apply_evolution(&update, mood);

        info!(
            "[Evolution] Evolution complete. Traits: {:?}, Mood: {}",
            update.new_traits, mood
        );
        Ok(())
    }
}

/// Parse a JSON list of `{"memory": "..."}` items. A `{"memories": [...]}`
/// wrapper and bare string lists are tolerated; anything else is a parse
/// failure that drives the retry policy.
pub(crate) fn parse_memory_list(response: &str) -> Result<Vec<String>, LlmError> {
    let cleaned = strip_code_fences(response);
    let value: Value =
        serde_json::from_str(cleaned).map_err(|e| LlmError::ParseFailed(e.to_string()))?;

    let items = match value {
        Value::Array(arr) => arr,
        Value::Object(mut map) => match map.remove("memories") {
            Some(Value::Array(arr)) => arr,
            _ => {
                return Err(LlmError::ParseFailed(
                    "expected a JSON list of memories".to_string(),
                ))
            }
        },
        _ => {
            return Err(LlmError::ParseFailed(
                "expected a JSON list of memories".to_string(),
            ))
        }
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s),
            Value::Object(map) => map
                .get("memory")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .filter(|s| !s.trim().is_empty())
        .collect())
}

/// Parse the evolution verdict. All five Big Five dimensions and a mood from
/// the closed set are required; a prompt drift that drops neuroticism is a
/// parse failure, not a partial update.
pub(crate) fn parse_evolution(response: &str) -> Result<(EvolutionUpdate, Mood), LlmError> {
    let cleaned = strip_code_fences(response);
    let raw: Value =
        serde_json::from_str(cleaned).map_err(|e| LlmError::ParseFailed(e.to_string()))?;

    let big_five = raw
        .get("new_big_five")
        .and_then(Value::as_object)
        .ok_or_else(|| LlmError::ParseFailed("missing new_big_five".to_string()))?;
    for dimension in [
        "openness",
        "conscientiousness",
        "extraversion",
        "agreeableness",
        "neuroticism",
    ] {
        if !big_five.contains_key(dimension) {
            return Err(LlmError::ParseFailed(format!(
                "new_big_five missing '{}'",
                dimension
            )));
        }
    }

    let update: EvolutionUpdate =
        serde_json::from_value(raw).map_err(|e| LlmError::ParseFailed(e.to_string()))?;
    let mood: Mood = update
        .current_mood
        .parse()
        .map_err(|_| LlmError::ParseFailed(format!("unknown mood '{}'", update.current_mood)))?;
    Ok((update, mood))
}
