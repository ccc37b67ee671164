//! Chat orchestration: prompt assembly (system + RAG + history), streaming
//! generation with character-modulated decoding parameters, session history
//! limits, and background summarization.

use crate::character::modulation::{calculate_generation_params, GenerationParams};
use crate::character::{CharacterRegistry, CharacterStore};
use crate::config::{ChatConfig, OverflowStrategy};
use crate::embedding::Embedder;
use crate::llm::provider::{LlmParams, Message};
use crate::llm::service::LlmService;
use crate::memory::{MemoryCore, MemoryTask};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};

/// Session id used when the engine itself starts the conversation.
pub const DEFAULT_USER_ID: &str = "default_user";

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_input: String,
    pub user_name: String,
    pub user_id: String,
    pub character_id: String,
}

/// In-memory per-(user, character) session history.
#[derive(Default)]
pub struct SessionStore {
    sessions: std::sync::Mutex<HashMap<(String, String), Vec<Message>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(user_id: &str, character_id: &str) -> (String, String) {
        (user_id.to_string(), character_id.to_lowercase())
    }

    pub fn history(&self, user_id: &str, character_id: &str) -> Vec<Message> {
        self.sessions
            .lock()
            .expect("session lock")
            .get(&Self::key(user_id, character_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn append(&self, user_id: &str, character_id: &str, message: Message) {
        self.sessions
            .lock()
            .expect("session lock")
            .entry(Self::key(user_id, character_id))
            .or_default()
            .push(message);
    }

    pub fn add_turn(&self, user_id: &str, character_id: &str, user_input: &str, response: &str) {
        let mut sessions = self.sessions.lock().expect("session lock");
        let history = sessions.entry(Self::key(user_id, character_id)).or_default();
        history.push(Message::user(user_input));
        history.push(Message::assistant(response));
    }

    pub fn clear(&self, user_id: &str, character_id: &str) {
        self.sessions
            .lock()
            .expect("session lock")
            .remove(&Self::key(user_id, character_id));
    }

    pub fn replace(&self, user_id: &str, character_id: &str, history: Vec<Message>) {
        self.sessions
            .lock()
            .expect("session lock")
            .insert(Self::key(user_id, character_id), history);
    }
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    llm: LlmService,
    memory: Arc<MemoryCore>,
    characters: Arc<CharacterRegistry>,
    sessions: Arc<SessionStore>,
    embedder: Option<Arc<dyn Embedder>>,
    config: ChatConfig,
}

impl ChatOrchestrator {
    pub fn new(
        llm: LlmService,
        memory: Arc<MemoryCore>,
        characters: Arc<CharacterRegistry>,
        sessions: Arc<SessionStore>,
        embedder: Option<Arc<dyn Embedder>>,
        config: ChatConfig,
    ) -> Self {
        Self {
            llm,
            memory,
            characters,
            sessions,
            embedder,
            config,
        }
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    /// Stream a response to a user message. The returned stream always
    /// produces output: an upstream failure mid-flight yields a final
    /// `[Error: …]` token and the turn still finalizes.
    pub async fn stream(&self, request: ChatRequest) -> UnboundedReceiverStream<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_stream(request, tx).await;
        });
        UnboundedReceiverStream::new(rx)
    }

    async fn run_stream(&self, request: ChatRequest, tx: mpsc::UnboundedSender<String>) {
        let character = self.characters.get_or_load(&request.character_id);
        let character_id = character.character_id().to_string();

        // 1. RAG block from hybrid retrieval (lexical-only on embedder failure)
        let rag_context = self.retrieve_context(&request.user_input, &character_id).await;

        // 2. Prompt assembly: system + memories + bounded history + user turn
        let mut messages = Vec::new();
        messages.push(Message::system(character.render_system_prompt("")));
        if !rag_context.is_empty() {
            messages.push(Message::system(format!(
                "## Related Memories\n{}",
                rag_context
            )));
        }
        let history = self
            .bounded_history(&request.user_id, &character_id)
            .await;
        messages.extend(history);
        messages.push(Message::user(request.user_input.clone()));

        // 3. Character-modulated decoding parameters
        let params = self.generation_params(&character);

        info!(
            "[Chat] Streaming for '{}' (temp: {:?})",
            character_id,
            params.as_ref().and_then(|p| p.temperature)
        );

        // 4. Stream, accumulating a copy for history
        let provider = self.llm.provider().await;
        let mut full_response = String::new();
        match provider.chat_stream(messages, params).await {
            Ok(mut stream) => {
                while let Some(result) = stream.next().await {
                    match result {
                        Ok(token) => {
                            full_response.push_str(&token);
                            if tx.send(token).is_err() {
                                // Caller cancelled: stop forwarding, keep
                                // whatever accumulated
                                break;
                            }
                        }
                        Err(e) => {
                            error!("[Chat] Streaming error: {}", e);
                            let error_token = format!("[Error: {}]", e);
                            full_response.push_str(&error_token);
                            let _ = tx.send(error_token);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!("[Chat] Failed to open stream: {}", e);
                let error_token = format!("[Error: {}]", e);
                full_response.push_str(&error_token);
                let _ = tx.send(error_token);
            }
        }

        // 5. Finalize: history, interaction bookkeeping, durable log
        self.sessions
            .add_turn(&request.user_id, &character_id, &request.user_input, &full_response);
        character.record_interaction(Utc::now());
        self.memory.add_memory_async(MemoryTask::LogInteraction {
            character_id: character_id.clone(),
            user_input: request.user_input.clone(),
            ai_response: full_response,
            user_name: request.user_name.clone(),
            char_name: character.config().name,
        });

        // 6. Background summarization past the history limit
        let post_len = self.sessions.history(&request.user_id, &character_id).len();
        if post_len > self.config.history_limit {
            let orchestrator = OrchestratorSummarizer {
                llm: self.llm.clone(),
                sessions: self.sessions.clone(),
                keep_last: self.config.summarize_keep_last,
                trigger_len: self.config.history_limit,
            };
            let user_id = request.user_id.clone();
            tokio::spawn(async move {
                orchestrator.summarize_session(&user_id, &character_id).await;
            });
        }
    }

    /// Proactive path: the character speaks first. No user message is added;
    /// the assistant output lands in the default session's history.
    pub async fn generate_proactive(
        &self,
        character: &Arc<CharacterStore>,
        instruction: &str,
    ) -> Result<String, crate::error::LlmError> {
        let messages = vec![
            Message::system(character.render_system_prompt("")),
            Message::system(instruction.to_string()),
        ];
        let params = self.generation_params(character);

        let provider = self.llm.provider().await;
        let mut stream = provider.chat_stream(messages, params).await?;
        let mut full_response = String::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(token) => full_response.push_str(&token),
                Err(e) => {
                    warn!("[Chat] Proactive stream error: {}", e);
                    break;
                }
            }
        }

        if !full_response.is_empty() {
            self.sessions.append(
                DEFAULT_USER_ID,
                character.character_id(),
                Message::assistant(full_response.clone()),
            );
        }
        Ok(full_response)
    }

    fn generation_params(&self, character: &Arc<CharacterStore>) -> Option<LlmParams> {
        let profile = character.profile();
        if !profile.config.soul_evolution_enabled {
            return None;
        }
        let params = calculate_generation_params(
            GenerationParams::default(),
            &profile.personality.big_five,
            &profile.personality.pad,
            profile.energy_level,
            profile.relationship.level,
        );
        Some(LlmParams {
            temperature: Some(params.temperature as f32),
            top_p: Some(params.top_p as f32),
            presence_penalty: Some(params.presence_penalty as f32),
            frequency_penalty: Some(params.frequency_penalty as f32),
            ..LlmParams::default()
        })
    }

    /// Top hybrid-search hits joined for the `## Related Memories` block.
    /// Falls back to lexical-only search when no embedding is available.
    async fn retrieve_context(&self, query: &str, character_id: &str) -> String {
        let vector = match self.embedder {
            Some(ref embedder) => match embedder.embed(query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("[Chat] Query embedding failed, lexical fallback: {}", e);
                    None
                }
            },
            None => None,
        };

        let contents: Vec<String> = match vector {
            Some(vector) => match self
                .memory
                .search_hybrid(query, &vector, character_id, self.config.rag_limit, 0.7)
                .await
            {
                Ok(results) => results.into_iter().map(|r| r.content).collect(),
                Err(e) => {
                    warn!("[Chat] RAG search failed: {}", e);
                    Vec::new()
                }
            },
            None => match self
                .memory
                .driver()
                .search_fulltext(query, self.config.rag_limit, character_id, true)
                .await
            {
                Ok(results) => results.into_iter().map(|r| r.text).collect(),
                Err(e) => {
                    warn!("[Chat] Lexical fallback failed: {}", e);
                    Vec::new()
                }
            },
        };

        contents.join("\n")
    }

    /// History after limit enforcement. Free-tier routes get the stricter
    /// limit; `reset` empties the session on the request that crosses it.
    async fn bounded_history(&self, user_id: &str, character_id: &str) -> Vec<Message> {
        let mut limit = self.config.history_limit;
        if self.llm.active_is_free_tier().await {
            limit = self.config.free_tier_history_limit;
            info!("[Chat] Free tier detected: enforcing history limit = {}", limit);
        }

        let mut history = self.sessions.history(user_id, character_id);
        if history.len() >= limit {
            match self.config.history_overflow {
                OverflowStrategy::Reset => {
                    info!(
                        "[Chat] Overflow reset triggered (limit {}). Clearing session history.",
                        limit
                    );
                    self.sessions.clear(user_id, character_id);
                    history = Vec::new();
                }
                OverflowStrategy::Slide => {
                    history = history.split_off(history.len() - limit);
                }
            }
        }
        history
    }
}

/// The detached summarization task's slice of the orchestrator.
struct OrchestratorSummarizer {
    llm: LlmService,
    sessions: Arc<SessionStore>,
    keep_last: usize,
    trigger_len: usize,
}

impl OrchestratorSummarizer {
    /// Compress everything but the newest messages into one
    /// `## Previous Summary` system message.
    async fn summarize_session(&self, user_id: &str, character_id: &str) {
        let history = self.sessions.history(user_id, character_id);
        if history.len() <= self.trigger_len || history.len() <= self.keep_last {
            return;
        }

        let split = history.len() - self.keep_last;
        let to_summarize = &history[..split];
        let keep = history[split..].to_vec();

        let context_text = to_summarize
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = vec![
            Message::system(
                "You are a memory compressor. Summarize the following conversation segment \
                 into a single concise paragraph. Keep key facts.",
            ),
            Message::user(context_text),
        ];

        let provider = self.llm.provider().await;
        match provider.chat(prompt, None).await {
            Ok(summary) if !summary.trim().is_empty() => {
                info!(
                    "[Chat] Compressed {} messages into a summary",
                    to_summarize.len()
                );
                let mut new_history = vec![Message::system(format!(
                    "## Previous Summary\n{}",
                    summary.trim()
                ))];
                new_history.extend(keep);
                self.sessions.replace(user_id, character_id, new_history);
            }
            Ok(_) => warn!("[Chat] Summarizer returned empty output; history kept"),
            Err(e) => error!("[Chat] Session summarization failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::embedding::testing::StubEmbedder;
    use crate::llm::service::{LlmConfig, LlmProviderConfig};
    use crate::memory::vector_store::{BatchManager, VectorStore};
    use crate::storage::tests::memory_driver;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(tokens: &[&str]) -> String {
        let mut body = String::new();
        for token in tokens {
            body.push_str(&format!(
                "data: {}\n\n",
                serde_json::json!({"choices": [{"delta": {"content": token}, "finish_reason": null}]})
            ));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn service_for(server: &MockServer, free_tier: bool) -> LlmService {
        let config = LlmConfig {
            active_provider: "mock".to_string(),
            system_provider: None,
            system_model: None,
            providers: vec![LlmProviderConfig {
                id: "mock".to_string(),
                enabled: true,
                api_key: Some("k".to_string()),
                api_key_env: None,
                base_url: Some(server.uri()),
                model: Some("m".to_string()),
                free_tier,
                extra: HashMap::new(),
            }],
        };
        LlmService::from_config(config, PathBuf::from("/tmp/unused.json"))
    }

    struct Fixture {
        _dir: TempDir,
        orchestrator: Arc<ChatOrchestrator>,
        memory: Arc<MemoryCore>,
        characters: Arc<CharacterRegistry>,
    }

    async fn fixture(server: &MockServer, config: ChatConfig, free_tier: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let driver = Arc::new(memory_driver().await);
        let store = Arc::new(VectorStore::new(
            driver.clone(),
            RetrievalConfig::default(),
            Arc::new(BatchManager::new()),
        ));
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder);
        let memory = Arc::new(MemoryCore::new(driver, store, Some(embedder.clone()), 5));
        memory.connect().await;
        let characters = Arc::new(CharacterRegistry::new(dir.path().to_path_buf()));
        let orchestrator = Arc::new(ChatOrchestrator::new(
            service_for(server, free_tier),
            memory.clone(),
            characters.clone(),
            Arc::new(SessionStore::new()),
            Some(embedder),
            config,
        ));
        Fixture {
            _dir: dir,
            orchestrator,
            memory,
            characters,
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            user_input: "hello there".to_string(),
            user_name: "User".to_string(),
            user_id: "u1".to_string(),
            character_id: "hiyori".to_string(),
        }
    }

    async fn collect(stream: UnboundedReceiverStream<String>) -> String {
        stream.collect::<Vec<_>>().await.join("")
    }

    #[tokio::test]
    async fn stream_forwards_tokens_and_appends_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&["Hi", " there", "!"]))
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let fx = fixture(&server, ChatConfig::default(), false).await;
        let output = collect(fx.orchestrator.stream(request()).await).await;
        assert_eq!(output, "Hi there!");

        let history = fx.orchestrator.sessions().history("u1", "hiyori");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].content, "Hi there!");

        // Interaction bookkeeping ran
        let profile = fx.characters.get_or_load("hiyori").profile();
        assert!(profile.last_interaction.is_some());
        assert!(profile.energy_level < 100.0);

        // The turn was enqueued for durable logging
        fx.memory.close().await;
        assert_eq!(fx.memory.get_stats("hiyori").await.unwrap().conversations, 1);
    }

    #[tokio::test]
    async fn upstream_failure_yields_error_token_and_still_finalizes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let fx = fixture(&server, ChatConfig::default(), false).await;
        let output = collect(fx.orchestrator.stream(request()).await).await;
        assert!(output.starts_with("[Error:"), "got: {}", output);

        let history = fx.orchestrator.sessions().history("u1", "hiyori");
        assert_eq!(history.len(), 2);
        assert!(history[1].content.starts_with("[Error:"));
    }

    #[tokio::test]
    async fn slide_overflow_truncates_history_sent_to_the_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&["ok"]))
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut config = ChatConfig::default();
        config.history_limit = 4;
        let fx = fixture(&server, config, false).await;

        let sessions = fx.orchestrator.sessions();
        for i in 0..6 {
            sessions.add_turn("u1", "hiyori", &format!("q{}", i), &format!("a{}", i));
        }

        collect(fx.orchestrator.stream(request()).await).await;

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let messages = body["messages"].as_array().unwrap();
        // 1 system + 4 history + 1 user (no RAG block: memory store is empty)
        assert_eq!(messages.len(), 6);
        // Oldest surviving history entry is q4 (12 total, last 4 kept)
        assert_eq!(messages[1]["content"], "q4");
    }

    #[tokio::test]
    async fn reset_overflow_clears_session_before_the_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&["fresh"]))
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut config = ChatConfig::default();
        config.history_limit = 4;
        config.history_overflow = OverflowStrategy::Reset;
        let fx = fixture(&server, config, false).await;

        let sessions = fx.orchestrator.sessions();
        for i in 0..3 {
            sessions.add_turn("u1", "hiyori", &format!("q{}", i), &format!("a{}", i));
        }

        collect(fx.orchestrator.stream(request()).await).await;

        // Only the new turn survives the reset
        let history = sessions.history("u1", "hiyori");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello there");

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let messages = body["messages"].as_array().unwrap();
        // 1 system + 1 user: prior history was dropped before the turn
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn free_tier_enforces_stricter_history_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&["ok"]))
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let fx = fixture(&server, ChatConfig::default(), true).await;
        let sessions = fx.orchestrator.sessions();
        for i in 0..5 {
            sessions.add_turn("u1", "hiyori", &format!("q{}", i), &format!("a{}", i));
        }

        collect(fx.orchestrator.stream(request()).await).await;

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let messages = body["messages"].as_array().unwrap();
        // 1 system + 5 history (free-tier limit) + 1 user
        assert_eq!(messages.len(), 7);
    }

    #[tokio::test]
    async fn rag_block_is_injected_when_memories_match() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&["ok"]))
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let fx = fixture(&server, ChatConfig::default(), false).await;
        let embedder = StubEmbedder;
        let emb = embedder.embed("hello there greetings").await.unwrap();
        fx.memory
            .vector_store()
            .add_episodic_memory(
                "hiyori",
                "User greets warmly every morning",
                &emb,
                crate::storage::MemoryStatus::Active,
                0,
                crate::storage::MemoryKind::Fact,
                Utc::now().timestamp(),
            )
            .await
            .unwrap();

        collect(fx.orchestrator.stream(request()).await).await;

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let messages = body["messages"].as_array().unwrap();
        let rag = messages
            .iter()
            .find(|m| m["content"].as_str().unwrap_or("").starts_with("## Related Memories"));
        assert!(rag.is_some(), "expected a Related Memories block");
        assert!(rag.unwrap()["content"]
            .as_str()
            .unwrap()
            .contains("greets warmly"));
    }

    #[tokio::test]
    async fn summarizer_replaces_old_messages_with_summary_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "They talked about tea."}}]
            })))
            .mount(&server)
            .await;

        let sessions = Arc::new(SessionStore::new());
        for i in 0..13 {
            sessions.add_turn("u1", "hiyori", &format!("q{}", i), &format!("a{}", i));
        }

        let summarizer = OrchestratorSummarizer {
            llm: service_for(&server, false),
            sessions: sessions.clone(),
            keep_last: 10,
            trigger_len: 20,
        };
        summarizer.summarize_session("u1", "hiyori").await;

        let history = sessions.history("u1", "hiyori");
        assert_eq!(history.len(), 11);
        assert_eq!(history[0].role, "system");
        assert!(history[0].content.starts_with("## Previous Summary"));
        assert!(history[0].content.contains("They talked about tea."));
        // The newest messages survive verbatim
        assert_eq!(history[10].content, "a12");
    }

    #[tokio::test]
    async fn proactive_generation_appends_assistant_message_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&["Miss me?"]))
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let fx = fixture(&server, ChatConfig::default(), false).await;
        let character = fx.characters.get_or_load("hiyori");
        let output = fx
            .orchestrator
            .generate_proactive(&character, "The user has been idle. Say something inviting.")
            .await
            .unwrap();
        assert_eq!(output, "Miss me?");

        let history = fx.orchestrator.sessions().history(DEFAULT_USER_ID, "hiyori");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "assistant");
    }
}
