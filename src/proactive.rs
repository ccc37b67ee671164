//! Proactive conversation: a ticker-driven loop that notices the user has
//! gone quiet and lets the character speak first.
//!
//! The idle threshold follows the relationship: close friends get pinged
//! within minutes, strangers after hours, and an indifferent character never
//! reaches out. `pending_interaction` doubles as the re-entry lock and is
//! always cleared, even when the push generation fails.

use crate::character::CharacterStore;
use crate::chat::ChatOrchestrator;
use crate::memory::MemoryCore;
use crate::ticker::Ticker;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Default idle threshold for levels outside the table (seconds).
const DEFAULT_THRESHOLD_SECS: f64 = 300.0;

/// Idle seconds before a push chat, by relationship level. `None` means the
/// character never initiates (indifference is silence).
pub fn threshold_for_level(level: i32, override_minutes: Option<f64>) -> Option<f64> {
    if let Some(minutes) = override_minutes {
        return Some(minutes * 60.0);
    }
    match level {
        -1 => None,
        0 => Some(7200.0),
        1 => Some(3600.0),
        2 => Some(900.0),
        3 => Some(600.0),
        _ => Some(DEFAULT_THRESHOLD_SECS),
    }
}

/// Pure tick decision, separated from I/O for testability.
pub fn should_initiate(
    enabled: bool,
    listeners: usize,
    last_interaction: Option<DateTime<Utc>>,
    pending: bool,
    level: i32,
    override_minutes: Option<f64>,
    now: DateTime<Utc>,
) -> bool {
    if !enabled || listeners == 0 || pending {
        return false;
    }
    let last = match last_interaction {
        Some(t) => t,
        None => return false,
    };
    let threshold = match threshold_for_level(level, override_minutes) {
        Some(t) => t,
        None => return false,
    };
    (now - last).num_seconds() as f64 > threshold
}

pub struct ProactiveLoop {
    character: Arc<CharacterStore>,
    orchestrator: Arc<ChatOrchestrator>,
    memory: Arc<MemoryCore>,
    /// Connected external clients. No listeners, no reason to talk.
    active_clients: Arc<AtomicUsize>,
}

impl ProactiveLoop {
    pub fn new(
        character: Arc<CharacterStore>,
        orchestrator: Arc<ChatOrchestrator>,
        memory: Arc<MemoryCore>,
        active_clients: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            character,
            orchestrator,
            memory,
            active_clients,
        }
    }

    pub fn spawn(self: Arc<Self>, ticker: &Ticker) -> JoinHandle<()> {
        let mut rx = ticker.subscribe();
        tokio::spawn(async move {
            loop {
                let now = match rx.recv().await {
                    Ok(now) => now,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let this = self.clone();
                tokio::spawn(async move {
                    this.check_and_execute(now).await;
                });
            }
        })
    }

    pub async fn check_and_execute(&self, now: DateTime<Utc>) {
        let config = self.character.config();
        let profile = self.character.profile();

        if !should_initiate(
            config.proactive_enabled,
            self.active_clients.load(Ordering::SeqCst),
            profile.last_interaction,
            profile.pending_interaction.is_some(),
            profile.relationship.level,
            config.proactive_threshold_minutes,
            now,
        ) {
            return;
        }

        let idle_secs = profile
            .last_interaction
            .map(|t| (now - t).num_seconds())
            .unwrap_or(0);
        info!(
            "[Proactive] Idle triggered ({}s). Initiating push chat.",
            idle_secs
        );

        // The pending flag is the mutex; losing the race means someone else
        // is already talking.
        if !self.character.set_pending_interaction("idle_timeout", now) {
            return;
        }

        let result = self.perform_push_chat(idle_secs).await;
        // Always release the lock and reset the idle timer, success or not
        self.character.clear_pending_interaction(Utc::now());

        match result {
            Ok(response) => info!(
                "[Proactive] Push chat completed ({} chars)",
                response.len()
            ),
            Err(e) => error!("[Proactive] Push chat failed: {}", e),
        }
    }

    async fn perform_push_chat(&self, idle_secs: i64) -> Result<String, crate::error::LlmError> {
        let profile = self.character.profile();
        let stage_label = profile.relationship.current_stage_label.clone();

        let inspiration = self
            .memory
            .get_inspiration(self.character.character_id(), 3)
            .await
            .unwrap_or_default();
        let inspiration_text = if inspiration.is_empty() {
            String::new()
        } else {
            let lines = inspiration
                .iter()
                .map(|m| format!("- {}", m.content))
                .collect::<Vec<_>>()
                .join("\n");
            format!("\nThings you remember and could bring up:\n{}", lines)
        };

        let instruction = format!(
            "The user has been quiet for {:.0} minutes. You decide to speak first.\n\
             Your relationship: {}. Current time: {}.\n\
             Open the conversation naturally — a greeting, an observation, or a question \
             that fits your relationship. Do not mention being prompted or the silence \
             timer.{}",
            idle_secs as f64 / 60.0,
            stage_label,
            Utc::now().format("%Y-%m-%d %H:%M"),
            inspiration_text
        );

        self.orchestrator
            .generate_proactive(&self.character, &instruction)
            .await
    }
}
