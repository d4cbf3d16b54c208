//! conversation state for one user: persona selection, transcript, exchange.
//!
//! a session owns its transcript and at most one active exchange. switching
//! persona throws both away. a turn is committed only once the provider has
//! replied, so a failed call leaves the transcript exactly as it was.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bevy::log::{debug, info, warn};
use serde::Serialize;

use crate::decode::{decode, DecodedResponse};
use crate::error::ChatError;
use crate::exchange::{Exchange, ExchangeFactory, GenerationConfig, SafetyConfig};
use crate::persona::PersonaSource;

/// speaker label for user turns.
pub const USER_SPEAKER: &str = "user";

/// one transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "speaker", rename_all = "snake_case")]
pub enum Turn {
    User { text: String },
    Persona { name: String, response: DecodedResponse },
}

impl Turn {
    pub fn speaker(&self) -> &str {
        match self {
            Turn::User { .. } => USER_SPEAKER,
            Turn::Persona { name, .. } => name,
        }
    }
}

/// the exchange plus the persona it was started for.
struct ActiveExchange {
    persona: String,
    handle: Arc<dyn Exchange>,
}

pub struct ConversationSession {
    personas: Arc<dyn PersonaSource>,
    factory: Arc<dyn ExchangeFactory>,
    generation: GenerationConfig,
    safety: SafetyConfig,

    current_persona: Option<String>,
    transcript: Vec<Turn>,
    active_exchange: Option<ActiveExchange>,
    last_latency: Duration,
    epoch: u64,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("current_persona", &self.current_persona)
            .field("turns", &self.transcript.len())
            .field("has_exchange", &self.active_exchange.is_some())
            .field("last_latency", &self.last_latency)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl ConversationSession {
    pub fn new(personas: Arc<dyn PersonaSource>, factory: Arc<dyn ExchangeFactory>) -> Self {
        Self {
            personas,
            factory,
            generation: GenerationConfig::default(),
            safety: SafetyConfig::default(),
            current_persona: None,
            transcript: Vec::new(),
            active_exchange: None,
            last_latency: Duration::ZERO,
            epoch: 0,
        }
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_safety(mut self, safety: SafetyConfig) -> Self {
        self.safety = safety;
        self
    }

    pub fn personas(&self) -> &Arc<dyn PersonaSource> {
        &self.personas
    }

    pub fn current_persona(&self) -> Option<&str> {
        self.current_persona.as_deref()
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    pub fn has_exchange(&self) -> bool {
        self.active_exchange.is_some()
    }

    pub fn last_latency(&self) -> Duration {
        self.last_latency
    }

    pub fn last_latency_millis(&self) -> u64 {
        self.last_latency.as_millis() as u64
    }

    /// bumped on every persona switch; replies tagged with an older epoch
    /// belong to a discarded exchange.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// switches persona. returns `false` (and changes nothing) when `name` is
    /// already selected.
    pub fn select_persona(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.current_persona.as_deref() == Some(name.as_str()) {
            return false;
        }
        info!(target: "bevy_persona_chat",
            "select_persona: {:?} -> '{}' (dropping {} turns, exchange={})",
            self.current_persona, name, self.transcript.len(), self.active_exchange.is_some()
        );
        self.active_exchange = None;
        self.transcript.clear();
        self.current_persona = Some(name);
        self.last_latency = Duration::ZERO;
        self.epoch += 1;
        true
    }

    /// returns the exchange for the current persona, starting one if needed.
    pub fn ensure_exchange(&mut self) -> Result<Arc<dyn Exchange>, ChatError> {
        let persona_name = self
            .current_persona
            .clone()
            .ok_or(ChatError::NoPersonaSelected)?;

        if let Some(active) = &self.active_exchange {
            if active.persona == persona_name {
                return Ok(active.handle.clone());
            }
            // stale binding; rebuild for the current persona
            warn!(target: "bevy_persona_chat", "exchange bound to '{}' but persona is '{}'", active.persona, persona_name);
        }

        let persona = self.personas.load_persona(&persona_name)?;
        let handle = self.factory.start_exchange(
            &persona.system_instruction(),
            &self.generation,
            &self.safety,
        )?;
        debug!(target: "bevy_persona_chat", "ensure_exchange: started for '{}'", persona_name);

        self.active_exchange = Some(ActiveExchange {
            persona: persona_name,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// sends one user message and commits the resulting pair of turns.
    pub async fn send_turn(&mut self, text: &str) -> Result<DecodedResponse, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let exchange = self.ensure_exchange()?;

        info!(target: "bevy_persona_chat", "send_turn: persona={:?} len={}", self.current_persona, text.len());
        let started = Instant::now();
        let raw = exchange.send(text).await.inspect_err(|err| {
            warn!(target: "bevy_persona_chat", "send_turn failed: {}", err);
        })?;
        self.record_turn(text, &raw, started.elapsed())
    }

    /// commits a user message and its raw reply. used directly when the remote
    /// call ran elsewhere (the bevy plugin runs it on a tokio runtime).
    pub fn record_turn(
        &mut self,
        user_text: impl Into<String>,
        raw_reply: &str,
        latency: Duration,
    ) -> Result<DecodedResponse, ChatError> {
        let name = self
            .current_persona
            .clone()
            .ok_or(ChatError::NoPersonaSelected)?;
        let response = decode(raw_reply);

        info!(target: "bevy_persona_chat",
            "record_turn: persona='{}' latency_ms={} raw_len={} sections={:?}",
            name, latency.as_millis(), raw_reply.len(), response.present()
        );

        self.last_latency = latency;
        self.transcript.push(Turn::User { text: user_text.into() });
        self.transcript.push(Turn::Persona {
            name,
            response: response.clone(),
        });
        Ok(response)
    }
}
