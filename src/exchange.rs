//! remote exchanges: one ongoing conversation with a model provider.
//!
//! - `ExchangeFactory` starts an exchange bound to a system instruction.
//! - `Exchange::send` forwards one user message and returns the raw reply.
//! - history lives inside the exchange; callers only send the *new* message.
//!
//! `LlmExchangeFactory` is the production implementation on top of the `llm`
//! crate: every exchange is its own provider plus a windowed history that only
//! grows when a call succeeds.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bevy::log::{debug, info};
use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::{ChatMessage, ChatProvider};
use llm::LLMProvider;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ChatError;

/// sampling parameters, fixed for the life of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 1,
            max_output_tokens: 10192,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarmCategory {
    Harassment,
    HateSpeech,
    SexuallyExplicit,
    DangerousContent,
}

impl HarmCategory {
    pub const ALL: [HarmCategory; 4] = [
        HarmCategory::Harassment,
        HarmCategory::HateSpeech,
        HarmCategory::SexuallyExplicit,
        HarmCategory::DangerousContent,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockThreshold {
    BlockNone,
    BlockOnlyHigh,
    BlockMediumAndAbove,
    BlockLowAndAbove,
}

/// safety policy handed to a new exchange.
///
/// `blanket` is the threshold that is applied. `per_category` is carried
/// alongside but not consulted by any current provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub per_category: BTreeMap<HarmCategory, BlockThreshold>,
    pub blanket: BlockThreshold,
}

impl SafetyConfig {
    /// permit every category.
    pub fn permit_all() -> Self {
        Self {
            per_category: HarmCategory::ALL
                .into_iter()
                .map(|c| (c, BlockThreshold::BlockNone))
                .collect(),
            blanket: BlockThreshold::BlockNone,
        }
    }

    /// the threshold in effect for `category`.
    pub fn effective(&self, _category: HarmCategory) -> BlockThreshold {
        self.blanket
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self::permit_all()
    }
}

/// an ongoing, stateful conversation with a remote model.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// sends one user message; returns the raw reply text.
    async fn send(&self, text: &str) -> Result<String, ChatError>;
}

/// starts exchanges bound to a system instruction.
pub trait ExchangeFactory: Send + Sync {
    fn start_exchange(
        &self,
        system_instruction: &str,
        generation: &GenerationConfig,
        safety: &SafetyConfig,
    ) -> Result<Arc<dyn Exchange>, ChatError>;
}

/// builds one `llm` provider per exchange.
///
/// the `llm` builder has no safety settings: the `SafetyConfig` is only logged
/// and the backend's default thresholds apply.
#[derive(Clone)]
pub struct LlmExchangeFactory {
    pub backend: LLMBackend,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    /// messages of history resent with each call (user + assistant).
    pub history_window: usize,
}

impl std::fmt::Debug for LlmExchangeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmExchangeFactory")
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("history_window", &self.history_window)
            .finish()
    }
}

impl ExchangeFactory for LlmExchangeFactory {
    fn start_exchange(
        &self,
        system_instruction: &str,
        generation: &GenerationConfig,
        safety: &SafetyConfig,
    ) -> Result<Arc<dyn Exchange>, ChatError> {
        info!(target: "bevy_persona_chat",
            "start_exchange: backend={:?} model='{}' key_present={} instruction_len={}",
            self.backend, self.model, !self.api_key.is_empty(), system_instruction.len()
        );
        debug!(target: "bevy_persona_chat", "start_exchange: generation={:?} safety={:?}", generation, safety.blanket);

        let mut b = LLMBuilder::new()
            .backend(self.backend.clone())
            .model(self.model.clone())
            .system(system_instruction)
            .temperature(generation.temperature)
            .top_p(generation.top_p)
            .top_k(generation.top_k)
            .max_tokens(generation.max_output_tokens);
        if !self.api_key.is_empty() {
            b = b.api_key(self.api_key.clone());
        }
        if let Some(url) = &self.base_url {
            b = b.base_url(url.clone());
        }

        let provider = b.build().map_err(|e| ChatError::Provider(e.to_string()))?;
        Ok(Arc::new(LlmExchange {
            provider: provider.into(),
            history: Mutex::new(ChatHistory::new(self.history_window)),
        }))
    }
}

/// committed user/assistant messages, capped at `window` messages.
struct ChatHistory {
    messages: Vec<ChatMessage>,
    window: usize,
}

impl ChatHistory {
    fn new(window: usize) -> Self {
        Self { messages: Vec::new(), window }
    }

    fn commit(&mut self, user: ChatMessage, reply: &str) {
        self.messages.push(user);
        self.messages
            .push(ChatMessage::assistant().content(reply.to_string()).build());
        // drop whole pairs so the history never starts on an assistant turn
        while self.messages.len() > self.window && self.messages.len() >= 2 {
            self.messages.drain(..2);
        }
    }
}

/// sends `history + [user]` through `call`; the pair is committed only when
/// the call succeeds. the lock also serializes concurrent sends.
async fn exchange_turn<F, Fut>(
    history: &Mutex<ChatHistory>,
    text: &str,
    call: F,
) -> Result<String, ChatError>
where
    F: FnOnce(Vec<ChatMessage>) -> Fut,
    Fut: Future<Output = Result<String, ChatError>>,
{
    let mut history = history.lock().await;
    let user = ChatMessage::user().content(text.to_string()).build();
    let mut request = history.messages.clone();
    request.push(user.clone());

    let reply = call(request).await?;
    history.commit(user, &reply);
    Ok(reply)
}

/// an exchange backed by a stateless `llm` provider and local history.
pub struct LlmExchange {
    provider: Arc<dyn LLMProvider>,
    history: Mutex<ChatHistory>,
}

#[async_trait]
impl Exchange for LlmExchange {
    async fn send(&self, text: &str) -> Result<String, ChatError> {
        let provider = &self.provider;
        exchange_turn(&self.history, text, |messages| async move {
            let resp = provider.chat(&messages).await?;
            Ok(resp.text().unwrap_or_default())
        })
        .await
    }
}
