//! LLM Service — holds the active provider and the provider registry config.
//!
//! Two lanes: the `chat` provider drives user-facing generation; the `system`
//! provider handles internal calls (extraction, consolidation, evolution,
//! arbitration) and may point at a cheaper model.

use crate::config;
use crate::llm::openai::OpenAIClient;
use crate::llm::provider::LlmProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,

    /// Free-tier routes get a stricter chat history limit.
    #[serde(default)]
    pub free_tier: bool,

    /// Catch-all for provider-specific config.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl LlmProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        config::resolve_api_key(&self.api_key, &self.api_key_env)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// ID of the active provider (must match one of `providers[].id`).
    #[serde(default = "default_active_provider")]
    pub active_provider: String,

    /// Optional: separate provider for system tasks (extraction,
    /// consolidation, evolution). If None, uses `active_provider`.
    pub system_provider: Option<String>,

    /// Optional: override model for system tasks.
    pub system_model: Option<String>,

    #[serde(default = "default_providers")]
    pub providers: Vec<LlmProviderConfig>,
}

fn default_active_provider() -> String {
    "openai".to_string()
}

fn default_providers() -> Vec<LlmProviderConfig> {
    vec![LlmProviderConfig {
        id: "openai".to_string(),
        enabled: true,
        api_key: None,
        api_key_env: Some("OPENAI_API_KEY".to_string()),
        base_url: Some("https://api.openai.com/v1".to_string()),
        model: Some("gpt-4".to_string()),
        free_tier: false,
        extra: HashMap::new(),
    }]
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            active_provider: default_active_provider(),
            system_provider: None,
            system_model: None,
            providers: default_providers(),
        }
    }
}

pub fn load_config(path: &Path) -> LlmConfig {
    config::load_json_config(path, "LLM")
}

pub fn save_config(path: &Path, config: &LlmConfig) -> Result<(), String> {
    config::save_json_config(path, config, "LLM")
}

/// Holds the active provider + config; providers are hot-swappable.
#[derive(Clone)]
pub struct LlmService {
    provider: Arc<RwLock<Arc<dyn LlmProvider>>>,
    config: Arc<RwLock<LlmConfig>>,
    config_path: PathBuf,
}

impl LlmService {
    /// Create a new LlmService from a persisted config.
    pub fn from_config(config: LlmConfig, config_path: PathBuf) -> Self {
        let provider: Arc<dyn LlmProvider> = Arc::from(build_provider(&config));
        Self {
            provider: Arc::new(RwLock::new(provider)),
            config: Arc::new(RwLock::new(config)),
            config_path,
        }
    }

    /// Get a clone of the active chat provider (Arc'd for async use).
    pub async fn provider(&self) -> Arc<dyn LlmProvider> {
        self.provider.read().await.clone()
    }

    pub async fn config(&self) -> LlmConfig {
        self.config.read().await.clone()
    }

    /// Whether the active chat route is a free-tier provider.
    pub async fn active_is_free_tier(&self) -> bool {
        let config = self.config.read().await;
        config
            .providers
            .iter()
            .find(|p| p.id == config.active_provider)
            .map(|p| p.free_tier)
            .unwrap_or(false)
    }

    /// Update config, persist to disk, and hot-swap the active provider.
    pub async fn update_config(&self, new_config: LlmConfig) -> Result<(), String> {
        save_config(&self.config_path, &new_config)?;
        let new_provider: Arc<dyn LlmProvider> = Arc::from(build_provider(&new_config));
        *self.provider.write().await = new_provider;
        *self.config.write().await = new_config;
        Ok(())
    }

    /// Get the system provider (or fall back to the active one). Built on
    /// demand: client construction is just struct creation.
    pub async fn system_provider(&self) -> Arc<dyn LlmProvider> {
        let config = self.config.read().await;
        let system_id = config
            .system_provider
            .as_ref()
            .unwrap_or(&config.active_provider);

        let provider_cfg = config
            .providers
            .iter()
            .find(|p| p.id == *system_id)
            .or_else(|| config.providers.iter().find(|p| p.enabled))
            .or_else(|| config.providers.first());

        if let Some(cfg) = provider_cfg {
            if let Some(ref model_override) = config.system_model {
                let mut overlaid_cfg = cfg.clone();
                overlaid_cfg.model = Some(model_override.clone());
                return Arc::from(build_from_provider_config(&overlaid_cfg));
            }
            return Arc::from(build_from_provider_config(cfg));
        }

        self.provider.read().await.clone()
    }
}

/// Factory: build the active provider from config.
fn build_provider(config: &LlmConfig) -> Box<dyn LlmProvider> {
    let active_id = &config.active_provider;

    let provider_cfg = config
        .providers
        .iter()
        .find(|p| p.id == *active_id)
        .or_else(|| config.providers.iter().find(|p| p.enabled))
        .or_else(|| config.providers.first());

    match provider_cfg {
        Some(cfg) => build_from_provider_config(cfg),
        None => {
            warn!("[LLM] No provider configured, falling back to OpenAI defaults");
            Box::new(OpenAIClient::new(
                String::new(),
                Some("https://api.openai.com/v1".to_string()),
                Some("gpt-4".to_string()),
            ))
        }
    }
}

fn build_from_provider_config(cfg: &LlmProviderConfig) -> Box<dyn LlmProvider> {
    let api_key = cfg.resolve_api_key().unwrap_or_default();
    let model = cfg.model.clone().unwrap_or_else(|| "gpt-4".to_string());
    info!(
        "[LLM] Initializing provider '{}': base_url={}, model={}",
        cfg.id,
        cfg.base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1"),
        model
    );
    Box::new(OpenAIClient::new(api_key, cfg.base_url.clone(), Some(model)).with_id(cfg.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(providers: Vec<LlmProviderConfig>, active: &str) -> LlmConfig {
        LlmConfig {
            active_provider: active.to_string(),
            system_provider: None,
            system_model: None,
            providers,
        }
    }

    fn provider_cfg(id: &str, free_tier: bool) -> LlmProviderConfig {
        LlmProviderConfig {
            id: id.to_string(),
            enabled: true,
            api_key: Some("k".to_string()),
            api_key_env: None,
            base_url: Some("http://localhost:9".to_string()),
            model: Some("m".to_string()),
            free_tier,
            extra: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn active_provider_is_selected_by_id() {
        let cfg = config_with(vec![provider_cfg("a", false), provider_cfg("b", false)], "b");
        let service = LlmService::from_config(cfg, PathBuf::from("/tmp/none.json"));
        assert_eq!(service.provider().await.id(), "b");
    }

    #[tokio::test]
    async fn free_tier_flag_tracks_active_route() {
        let cfg = config_with(vec![provider_cfg("free", true)], "free");
        let service = LlmService::from_config(cfg, PathBuf::from("/tmp/none.json"));
        assert!(service.active_is_free_tier().await);
    }

    #[tokio::test]
    async fn system_provider_falls_back_to_active() {
        let cfg = config_with(vec![provider_cfg("a", false)], "a");
        let service = LlmService::from_config(cfg, PathBuf::from("/tmp/none.json"));
        assert_eq!(service.system_provider().await.id(), "a");
    }
}
