//! Memory system façade.
//!
//! `MemoryCore` is the single entry point callers see: conversation logging,
//! search delegation, and a single background worker that turns enqueued
//! interaction tasks into durable conversation logs without blocking the
//! caller on embedding or storage.

pub mod curator;
pub mod graph;
pub mod resolver;
pub mod vector_store;

use crate::embedding::Embedder;
use crate::error::MemoryError;
use crate::storage::{ConversationLog, EpisodicMemory, SearchItem, StorageDriver};
use rand::seq::SliceRandom;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vector_store::{RetrievedMemory, VectorStore};

/// How long shutdown waits for the worker to drain its queue.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Size of the recent-memory pool that inspiration is sampled from.
const INSPIRATION_POOL: i64 = 50;

#[derive(Debug, Clone)]
pub enum MemoryTask {
    LogInteraction {
        character_id: String,
        user_input: String,
        ai_response: String,
        user_name: String,
        char_name: String,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryStats {
    pub memories: i64,
    pub conversations: i64,
}

struct WorkerState {
    tx: mpsc::UnboundedSender<MemoryTask>,
    handle: JoinHandle<()>,
}

pub struct MemoryCore {
    driver: Arc<StorageDriver>,
    store: Arc<VectorStore>,
    embedder: Option<Arc<dyn Embedder>>,
    max_retry: i64,
    worker: Mutex<Option<WorkerState>>,
}

impl MemoryCore {
    pub fn new(
        driver: Arc<StorageDriver>,
        store: Arc<VectorStore>,
        embedder: Option<Arc<dyn Embedder>>,
        max_retry: i64,
    ) -> Self {
        Self {
            driver,
            store,
            embedder,
            max_retry,
            worker: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> Arc<StorageDriver> {
        self.driver.clone()
    }

    pub fn vector_store(&self) -> Arc<VectorStore> {
        self.store.clone()
    }

    /// Initialize schema and start the background worker.
    pub async fn connect(&self) {
        self.driver.initialize_schema().await;

        let mut worker = self.worker.lock().expect("worker lock");
        if worker.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<MemoryTask>();
        let driver = self.driver.clone();
        let embedder = self.embedder.clone();
        let handle = tokio::spawn(async move {
            info!("[Memory] Worker started");
            while let Some(task) = rx.recv().await {
                if let Err(e) = process_task(&driver, embedder.as_deref(), task).await {
                    error!("[Memory] Worker task failed: {}", e);
                }
            }
            info!("[Memory] Worker stopped");
        });

        *worker = Some(WorkerState { tx, handle });
    }

    /// Drop the queue sender and give the worker a bounded window to drain.
    pub async fn close(&self) {
        let state = self.worker.lock().expect("worker lock").take();
        if let Some(WorkerState { tx, handle }) = state {
            drop(tx);
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("[Memory] Worker did not drain in time; abandoning queue");
            }
        }
    }

    /// Fire-and-forget: enqueue an interaction for the background worker.
    pub fn add_memory_async(&self, task: MemoryTask) {
        let worker = self.worker.lock().expect("worker lock");
        match worker.as_ref() {
            Some(state) => {
                if state.tx.send(task).is_err() {
                    warn!("[Memory] Worker queue closed; task dropped");
                }
            }
            None => warn!("[Memory] add_memory_async before connect(); task dropped"),
        }
    }

    /// Write a raw conversation log. Synchronous from the caller's view; the
    /// only suspension points are the embedder and the insert, never the LM.
    /// Embedder failure degrades to storing the log without a vector.
    pub async fn log_conversation(
        &self,
        character_id: &str,
        narrative: &str,
    ) -> Result<String, MemoryError> {
        write_log(&self.driver, self.embedder.as_deref(), character_id, narrative).await
    }

    // ── search delegation ──────────────────────────────────

    pub async fn search(
        &self,
        query_vector: &[f32],
        character_id: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SearchItem>, MemoryError> {
        self.store
            .search(query_vector, character_id, limit, threshold)
            .await
    }

    pub async fn search_adaptive(
        &self,
        query_vector: &[f32],
        character_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchItem>, MemoryError> {
        self.store
            .search_adaptive(query_vector, character_id, limit)
            .await
    }

    pub async fn search_hybrid(
        &self,
        query: &str,
        query_vector: &[f32],
        character_id: &str,
        limit: usize,
        vector_weight: f64,
    ) -> Result<Vec<RetrievedMemory>, MemoryError> {
        self.store
            .search_hybrid(query, query_vector, character_id, limit, vector_weight)
            .await
    }

    // ── dreaming support ───────────────────────────────────

    pub async fn get_unprocessed_conversations(
        &self,
        limit: i64,
        character_id: &str,
    ) -> Result<Vec<ConversationLog>, MemoryError> {
        self.driver
            .fetch_unprocessed_logs(&character_id.to_lowercase(), self.max_retry, limit)
            .await
    }

    pub async fn count_unprocessed_conversations(
        &self,
        character_id: &str,
    ) -> Result<i64, MemoryError> {
        self.driver
            .count_unprocessed_logs(&character_id.to_lowercase(), self.max_retry)
            .await
    }

    pub async fn mark_conversations_processed(
        &self,
        conversation_ids: &[String],
    ) -> Result<(), MemoryError> {
        self.driver.mark_logs_processed(conversation_ids).await
    }

    /// Transient-failure path: bump retry counts so the batch is retried on
    /// the next cycle (up to the cap).
    pub async fn increment_conversation_retries(
        &self,
        conversation_ids: &[String],
    ) -> Result<(), MemoryError> {
        self.driver.increment_log_retries(conversation_ids).await
    }

    // ── utilities ──────────────────────────────────────────

    /// Random active memories to seed proactive conversation.
    pub async fn get_inspiration(
        &self,
        character_id: &str,
        limit: usize,
    ) -> Result<Vec<EpisodicMemory>, MemoryError> {
        let mut pool = self
            .driver
            .fetch_active_pool(&character_id.to_lowercase(), INSPIRATION_POOL)
            .await?;
        pool.shuffle(&mut rand::thread_rng());
        pool.truncate(limit);
        Ok(pool)
    }

    pub async fn get_recent_conversations(
        &self,
        character_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationLog>, MemoryError> {
        self.driver
            .recent_conversations(&character_id.to_lowercase(), limit)
            .await
    }

    pub async fn get_stats(&self, character_id: &str) -> Result<MemoryStats, MemoryError> {
        let character_id = character_id.to_lowercase();
        Ok(MemoryStats {
            memories: self.driver.count_memories(&character_id).await?,
            conversations: self.driver.count_logs(&character_id).await?,
        })
    }
}

async fn process_task(
    driver: &StorageDriver,
    embedder: Option<&dyn Embedder>,
    task: MemoryTask,
) -> Result<(), MemoryError> {
    match task {
        MemoryTask::LogInteraction {
            character_id,
            user_input,
            ai_response,
            user_name,
            char_name,
        } => {
            let narrative =
                format!("{}: {}\n{}: {}", user_name, user_input, char_name, ai_response);
            write_log(driver, embedder, &character_id, &narrative).await?;
            Ok(())
        }
    }
}

async fn write_log(
    driver: &StorageDriver,
    embedder: Option<&dyn Embedder>,
    character_id: &str,
    narrative: &str,
) -> Result<String, MemoryError> {
    let embedding = match embedder {
        Some(embedder) => match embedder.embed(narrative).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("[Memory] Failed to embed log: {}", e);
                None
            }
        },
        None => None,
    };

    driver
        .insert_conversation_log(
            &character_id.to_lowercase(),
            narrative,
            embedding.as_deref(),
            chrono::Utc::now().timestamp(),
        )
        .await
}
