//! reverie-engine: a long-term memory engine for conversational agents.
//!
//! Raw conversation turns flow into a time-indexed, vector-indexed,
//! graph-linked store; hybrid retrieval (vector + BM25 + 1-hop graph
//! expansion) feeds generation; a background "dreaming" pipeline extracts
//! episodic memories, consolidates the frequently recalled ones into
//! insights, and slowly evolves the character's personality.

pub mod character;
pub mod chat;
pub mod config;
pub mod dreaming;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod memory;
pub mod proactive;
pub mod storage;
pub mod ticker;

use character::CharacterRegistry;
use chat::{ChatOrchestrator, SessionStore};
use config::EngineConfig;
use dreaming::DreamingScheduler;
use embedding::{Embedder, FastEmbedder};
use error::MemoryError;
use llm::service::LlmService;
use memory::curator::GraphCurator;
use memory::resolver::{AliasMap, EntityResolver};
use memory::vector_store::{BatchManager, VectorStore};
use memory::{graph::GraphWriter, MemoryCore};
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use storage::StorageDriver;
use ticker::Ticker;
use tokio::task::JoinHandle;
use tracing::info;

/// Install a stdout tracing subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub struct EngineOptions {
    /// SQLite url, e.g. `sqlite://reverie.db` or `sqlite::memory:`.
    pub db_url: String,
    /// Root for config files, character folders and the embedding cache.
    pub data_dir: PathBuf,
    /// Disable to run without an embedding model (lexical-only retrieval,
    /// no extraction).
    pub enable_embedder: bool,
}

/// The services container: constructed once at startup, then handed into
/// subsystems. No ambient globals.
pub struct Engine {
    pub config: EngineConfig,
    pub driver: Arc<StorageDriver>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub llm: LlmService,
    pub aliases: Arc<AliasMap>,
    pub batches: Arc<BatchManager>,
    pub memory: Arc<MemoryCore>,
    pub graph: Arc<GraphWriter>,
    pub curator: Arc<GraphCurator>,
    pub characters: Arc<CharacterRegistry>,
    pub sessions: Arc<SessionStore>,
    pub chat: Arc<ChatOrchestrator>,
    /// Connected external clients; gates the proactive loop.
    pub active_clients: Arc<AtomicUsize>,
    ticker: Ticker,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Wire up every subsystem and start the memory worker. Background
    /// loops per character are started separately via `start_character`.
    pub async fn start(options: EngineOptions) -> Result<Arc<Self>, MemoryError> {
        let config = config::load_engine_config(&options.data_dir.join("engine_config.json"));

        let driver = Arc::new(StorageDriver::connect(&options.db_url).await?);

        let embedder: Option<Arc<dyn Embedder>> = if options.enable_embedder {
            Some(Arc::new(FastEmbedder::new(options.data_dir.join("models"))))
        } else {
            None
        };

        let llm_config = llm::service::load_config(&options.data_dir.join("llm_config.json"));
        let llm = LlmService::from_config(llm_config, options.data_dir.join("llm_config.json"));

        let aliases = Arc::new(AliasMap::load(options.data_dir.join("entity_aliases.json")));
        let batches = Arc::new(BatchManager::new());
        let store = Arc::new(VectorStore::new(
            driver.clone(),
            config.retrieval.clone(),
            batches.clone(),
        ));
        let memory = Arc::new(MemoryCore::new(
            driver.clone(),
            store,
            embedder.clone(),
            config.dreaming.max_retry_count,
        ));
        memory.connect().await;

        let resolver = EntityResolver::new(driver.clone(), aliases.clone(), embedder.clone());
        let graph = Arc::new(GraphWriter::new(driver.clone(), resolver, embedder.clone()));

        let curator = Arc::new(GraphCurator::new(
            driver.clone(),
            aliases.clone(),
            Some(llm.system_provider().await),
            config.graph.clone(),
        ));

        let characters = Arc::new(CharacterRegistry::new(options.data_dir.join("characters")));
        let sessions = Arc::new(SessionStore::new());
        let chat = Arc::new(ChatOrchestrator::new(
            llm.clone(),
            memory.clone(),
            characters.clone(),
            sessions.clone(),
            embedder.clone(),
            config.chat.clone(),
        ));

        let ticker = Ticker::spawn(Duration::from_secs(1));
        let active_clients = Arc::new(AtomicUsize::new(0));

        let engine = Arc::new(Self {
            config,
            driver,
            embedder,
            llm,
            aliases,
            batches,
            memory,
            graph,
            curator: curator.clone(),
            characters,
            sessions,
            chat,
            active_clients,
            ticker,
            background: std::sync::Mutex::new(Vec::new()),
        });

        // Graph maintenance is global, not per character
        let handle = curator.spawn(&engine.ticker);
        engine.background.lock().expect("background lock").push(handle);

        info!("[Engine] Started");
        Ok(engine)
    }

    /// Start the per-character background loops: dreaming and proactivity.
    pub async fn start_character(&self, character_id: &str) {
        let character = self.characters.get_or_load(character_id);

        let dreaming = Arc::new(DreamingScheduler::new(
            self.memory.clone(),
            character.clone(),
            self.llm.system_provider().await,
            self.embedder.clone(),
            self.batches.clone(),
            self.config.dreaming.clone(),
        ));
        let dream_handle = dreaming.spawn(&self.ticker);

        let proactive = Arc::new(proactive::ProactiveLoop::new(
            character,
            self.chat.clone(),
            self.memory.clone(),
            self.active_clients.clone(),
        ));
        let proactive_handle = proactive.spawn(&self.ticker);

        let mut background = self.background.lock().expect("background lock");
        background.push(dream_handle);
        background.push(proactive_handle);
        info!("[Engine] Background loops started for '{}'", character_id);
    }

    /// Stop the ticker, abort background loops, and drain the memory worker.
    pub async fn shutdown(&self) {
        self.ticker.stop();
        for handle in self.background.lock().expect("background lock").drain(..) {
            handle.abort();
        }
        self.memory.close().await;
        info!("[Engine] Shut down");
    }
}
