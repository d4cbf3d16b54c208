use std::path::PathBuf;
use std::sync::Arc;

use bevy::prelude::Resource;
use llm::builder::LLMBackend;

use crate::exchange::{GenerationConfig, LlmExchangeFactory, SafetyConfig};
use crate::persona::DirPersonaStore;
use crate::session::ConversationSession;

pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_PROMPTS_DIR: &str = "Character_Prompts";
pub const DEFAULT_HISTORY_WINDOW: usize = 256;

/// everything needed to build persona stores and exchanges.
#[derive(Resource, Clone)]
pub struct ChatConfig {
    pub backend: LLMBackend,
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub prompts_dir: PathBuf,
    pub history_window: usize,
    pub generation: GenerationConfig,
    pub safety: SafetyConfig,
}

impl std::fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatConfig")
            .field("backend", &self.backend)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("prompts_dir", &self.prompts_dir)
            .field("history_window", &self.history_window)
            .field("generation", &self.generation)
            .field("safety", &self.safety)
            .finish()
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            backend: LLMBackend::Google,
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            base_url: None,
            prompts_dir: PathBuf::from(DEFAULT_PROMPTS_DIR),
            history_window: DEFAULT_HISTORY_WINDOW,
            generation: GenerationConfig::default(),
            safety: SafetyConfig::permit_all(),
        }
    }
}

impl ChatConfig {
    /// seeds from the environment:
    /// - `GEMINI_API_KEY` (falls back to `API_KEY`)
    /// - `LLM_MODEL`, `LLM_BASE_URL`
    /// - `PERSONA_PROMPTS_DIR`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            api_key: var("GEMINI_API_KEY").or_else(|| var("API_KEY")).unwrap_or_default(),
            model: var("LLM_MODEL").unwrap_or(defaults.model),
            base_url: var("LLM_BASE_URL"),
            prompts_dir: var("PERSONA_PROMPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.prompts_dir),
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: LLMBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_prompts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompts_dir = dir.into();
        self
    }

    pub fn with_history_window(mut self, messages: usize) -> Self {
        self.history_window = messages;
        self
    }

    pub fn persona_store(&self) -> DirPersonaStore {
        DirPersonaStore::new(self.prompts_dir.clone())
    }

    pub fn exchange_factory(&self) -> LlmExchangeFactory {
        LlmExchangeFactory {
            backend: self.backend.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            history_window: self.history_window,
        }
    }

    /// a fresh session wired to this config's store and provider.
    pub fn conversation(&self) -> ConversationSession {
        ConversationSession::new(
            Arc::new(self.persona_store()),
            Arc::new(self.exchange_factory()),
        )
        .with_generation(self.generation)
        .with_safety(self.safety.clone())
    }
}
