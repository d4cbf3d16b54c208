//! bevy_persona_chat: chat with a character persona from bevy.
//!
//! - personas are plain `.txt` prompts in a directory (`persona`).
//! - each persona selection opens one exchange with an `llm` provider; the
//!   exchange keeps the history, we only send the *new* message (`exchange`).
//! - replies come back tagged (`<answer>..</answer>` etc.) and are decoded
//!   best-effort into four sections (`decode`).
//! - `ConversationSession` owns the transcript and the persona/exchange state
//!   machine (`session`); it works without bevy too.
//! - the plugin never blocks the main thread: on native we hand remote calls to
//!   a tiny tokio runtime and drain results back in `Update`.
//!
//! api docs for the provider side: https://docs.rs/llm

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use flume::{Receiver, Sender, TryRecvError};

pub mod config;
pub mod decode;
pub mod error;
pub mod exchange;
pub mod persona;
pub mod session;

pub use config::ChatConfig;
pub use decode::{decode, DecodedResponse, Section};
pub use error::ChatError;
pub use exchange::{
    BlockThreshold, Exchange, ExchangeFactory, GenerationConfig, HarmCategory, LlmExchangeFactory,
    SafetyConfig,
};
pub use persona::{DirPersonaStore, Persona, PersonaSource};
pub use session::{ConversationSession, Turn};

/// re-export the llm types used to configure a provider.
pub use llm::{
    builder::LLMBackend,
    error::LLMError,
};

/// on native we keep a tiny tokio runtime to drive `llm` futures.
/// we spawn onto this rt from compute tasks so neither the main thread
/// nor bevy's compute pools block.
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_persona_chat", "PersonaChat: initializing Tokio multi-thread runtime");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum PersonaChatSet {
    /// completed/error events are emitted here (in `Update`)
    Drain,
}

/// attach this to an entity that chats as a persona.
#[derive(Component, Debug)]
pub struct ChatSession {
    pub conversation: ConversationSession,
    pending: bool,
}

impl ChatSession {
    pub fn new(conversation: ConversationSession) -> Self {
        Self { conversation, pending: false }
    }

    /// a request is in flight; new requests are rejected until it resolves.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// switches persona (no-op for the current one). a reply still in flight
    /// for the old persona is dropped when it lands.
    pub fn select_persona(&mut self, name: impl Into<String>) -> bool {
        self.conversation.select_persona(name)
    }
}

/// insert this component to send one user message for the session entity.
#[derive(Component, Clone, Debug)]
pub struct ChatRequest {
    pub text: String,
}

/// helper to enqueue a user message on a session entity.
pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_persona_chat", "send_user_text -> '{}' (len={})", text, text.len());
    commands.entity(target).insert(ChatRequest { text });
}

/// events emitted by the plugin during/after a turn.
#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    /// the decoded reply, already appended to the session transcript.
    pub response: DecodedResponse,
    pub latency: Duration,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: ChatError,
}

/// cross-thread inbox; producers send, main thread drains.
#[derive(Resource, Clone)]
struct ChatInbox {
    tx: Sender<ChatMsg>,
    rx: Receiver<ChatMsg>,
}

impl Default for ChatInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(256);
        Self { tx, rx }
    }
}

#[derive(Debug)]
enum ChatMsg {
    Done {
        entity: Entity,
        epoch: u64,
        user_text: String,
        raw: String,
        latency: Duration,
    },
    Err {
        entity: Entity,
        epoch: u64,
        error: ChatError,
    },
}

/// send to inbox (ignore disconnected)
fn push_inbox(tx: &Sender<ChatMsg>, msg: ChatMsg) {
    let _ = tx.send(msg);
}

/// bevy plugin: wires systems, events, resources.
/// spawn entities with a `ChatSession` and insert `ChatRequest`s on them.
pub struct PersonaChatPlugin;

impl Plugin for PersonaChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_persona_chat", "PersonaChatPlugin: build()");
        app.init_resource::<ChatInbox>()
            .add_event::<ChatStarted>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            .configure_sets(Update, PersonaChatSet::Drain)
            .add_systems(Update, drain_chat_inbox.in_set(PersonaChatSet::Drain))
            .add_systems(Update, spawn_chat_requests.before(PersonaChatSet::Drain));

        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// spawns async tasks to fulfill pending requests.
fn spawn_chat_requests(
    mut commands: Commands,
    inbox: Res<ChatInbox>,
    rt: Res<TokioRt>,
    mut q: Query<(Entity, &mut ChatSession, &ChatRequest)>,
    mut ev_start: EventWriter<ChatStarted>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    for (e, mut session, req) in q.iter_mut() {
        // one-shot marker removal
        commands.entity(e).remove::<ChatRequest>();

        if session.pending {
            warn!(target: "bevy_persona_chat", "spawn_chat_requests: entity={:?} busy, dropping request", e);
            ev_err.write(ChatErrorEvt { entity: e, error: ChatError::Busy });
            continue;
        }
        if req.text.trim().is_empty() {
            ev_err.write(ChatErrorEvt { entity: e, error: ChatError::EmptyMessage });
            continue;
        }

        let exchange = match session.conversation.ensure_exchange() {
            Ok(exchange) => exchange,
            Err(error) => {
                error!(target: "bevy_persona_chat", "spawn_chat_requests: entity={:?} {}", e, error);
                ev_err.write(ChatErrorEvt { entity: e, error });
                continue;
            }
        };

        let epoch = session.conversation.epoch();
        info!(target: "bevy_persona_chat",
            "spawn_chat_requests: entity={:?} persona={:?} epoch={} len={} turns={}",
            e, session.conversation.current_persona(), epoch, req.text.len(),
            session.conversation.transcript().len()
        );

        session.pending = true;
        ev_start.write(ChatStarted { entity: e });

        let inbox_tx = inbox.tx.clone();
        let join_tx = inbox.tx.clone();
        let user_text = req.text.clone();
        let rt = rt.0.clone();

        // spawn an async compute task; internally we hand off to tokio.
        AsyncComputeTaskPool::get()
            .spawn(async move {
                let run = async move {
                    let started = Instant::now();
                    match exchange.send(&user_text).await {
                        Ok(raw) => {
                            let latency = started.elapsed();
                            push_inbox(&inbox_tx, ChatMsg::Done { entity: e, epoch, user_text, raw, latency });
                        }
                        Err(error) => {
                            push_inbox(&inbox_tx, ChatMsg::Err { entity: e, epoch, error });
                        }
                    }
                };
                // a panicked or cancelled call still has to clear `pending`
                if let Err(join_err) = rt.spawn(run).await {
                    error!(target: "bevy_persona_chat", "chat task failed (entity={:?}): {}", e, join_err);
                    push_inbox(&join_tx, ChatMsg::Err {
                        entity: e,
                        epoch,
                        error: ChatError::RemoteCall(join_err.to_string()),
                    });
                }
            })
            .detach();
    }
}

/// drains the inbox, commits turns, and emits user-facing events.
fn drain_chat_inbox(
    inbox: Res<ChatInbox>,
    mut q: Query<&mut ChatSession>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    loop {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        };

        let (entity, epoch) = match &msg {
            ChatMsg::Done { entity, epoch, .. } | ChatMsg::Err { entity, epoch, .. } => (*entity, *epoch),
        };
        let Ok(mut session) = q.get_mut(entity) else {
            debug!(target: "bevy_persona_chat", "drain_chat_inbox: entity={:?} gone, dropping reply", entity);
            continue;
        };
        session.pending = false;

        if session.conversation.epoch() != epoch {
            debug!(target: "bevy_persona_chat",
                "drain_chat_inbox: entity={:?} persona switched (epoch {} -> {}), dropping reply",
                entity, epoch, session.conversation.epoch()
            );
            continue;
        }

        match msg {
            ChatMsg::Done { user_text, raw, latency, .. } => {
                match session.conversation.record_turn(user_text, &raw, latency) {
                    Ok(response) => {
                        ev_done.write(ChatCompletedEvt { entity, response, latency });
                    }
                    Err(error) => {
                        ev_err.write(ChatErrorEvt { entity, error });
                    }
                }
            }
            ChatMsg::Err { error, .. } => {
                error!(target: "bevy_persona_chat", "chat error (entity={:?}): {}", entity, error);
                ev_err.write(ChatErrorEvt { entity, error });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{ScriptedFactory, StaticPersonas};
    use bevy::app::AppExit;

    fn conversation() -> ConversationSession {
        let personas = StaticPersonas::of(&[("Allende", "You are Allende."), ("Neruda", "You are Neruda.")]);
        ConversationSession::new(personas, ScriptedFactory::replying(vec![]))
    }

    fn drain_app() -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<ChatCompletedEvt>();
        app.add_event::<ChatErrorEvt>();
        app.insert_resource(ChatInbox::default());
        app.add_systems(Update, super::drain_chat_inbox);
        app
    }

    fn push(app: &App, msg: ChatMsg) {
        app.world().resource::<ChatInbox>().tx.send(msg).unwrap();
    }

    struct PanickingExchange;

    #[async_trait::async_trait]
    impl Exchange for PanickingExchange {
        async fn send(&self, _text: &str) -> Result<String, ChatError> {
            panic!("provider blew up");
        }
    }

    struct PanickingFactory;

    impl ExchangeFactory for PanickingFactory {
        fn start_exchange(
            &self,
            _system_instruction: &str,
            _generation: &GenerationConfig,
            _safety: &SafetyConfig,
        ) -> Result<Arc<dyn Exchange>, ChatError> {
            Ok(Arc::new(PanickingExchange))
        }
    }

    /// full plugin app with one session entity that already has a request queued.
    fn plugin_app(factory: Arc<dyn ExchangeFactory>, text: &str) -> (App, Entity) {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(PersonaChatPlugin);

        let personas = StaticPersonas::of(&[("Allende", "You are Allende.")]);
        let mut session = ChatSession::new(ConversationSession::new(personas, factory));
        session.select_persona("Allende");
        let e = app
            .world_mut()
            .spawn((session, ChatRequest { text: text.into() }))
            .id();
        (app, e)
    }

    /// runs frames until the session is idle again; collects emitted events.
    fn run_until_idle(
        app: &mut App,
        e: Entity,
    ) -> (Vec<ChatStarted>, Vec<ChatCompletedEvt>, Vec<ChatErrorEvt>) {
        let mut started = Vec::new();
        let mut done = Vec::new();
        let mut errs = Vec::new();
        for _ in 0..500 {
            app.update();
            started.extend(app.world_mut().resource_mut::<Events<ChatStarted>>().drain());
            done.extend(app.world_mut().resource_mut::<Events<ChatCompletedEvt>>().drain());
            errs.extend(app.world_mut().resource_mut::<Events<ChatErrorEvt>>().drain());

            let session = app.world().entity(e).get::<ChatSession>().unwrap();
            if !started.is_empty() && !session.is_pending() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        (started, done, errs)
    }

    #[test]
    fn attach_request_via_send_user_text() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<AppExit>();

        let e = app.world_mut().spawn(ChatSession::new(conversation())).id();

        {
            let mut commands = app.world_mut().commands();
            super::send_user_text(&mut commands, e, "hello world");
        }
        app.world_mut().flush();

        let req = app.world().entity(e).get::<ChatRequest>().expect("ChatRequest exists");
        assert_eq!(req.text, "hello world");
    }

    #[test]
    fn drain_commits_turn_and_emits_completed() {
        let mut app = drain_app();

        let mut session = ChatSession::new(conversation());
        session.select_persona("Allende");
        session.pending = true;
        let epoch = session.conversation.epoch();
        let e = app.world_mut().spawn(session).id();

        push(&app, ChatMsg::Done {
            entity: e,
            epoch,
            user_text: "hello".into(),
            raw: "<answer>Hola</answer>".into(),
            latency: Duration::from_millis(1200),
        });
        app.update();

        {
            let mut ev = app.world_mut().resource_mut::<Events<ChatCompletedEvt>>();
            let done: Vec<_> = ev.drain().collect();
            assert_eq!(done.len(), 1);
            assert_eq!(done[0].response.answer, "Hola");
            assert_eq!(done[0].latency, Duration::from_millis(1200));
        }

        let session = app.world().entity(e).get::<ChatSession>().unwrap();
        assert!(!session.is_pending());
        let t = session.conversation.transcript();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0], Turn::User { text: "hello".into() });
        assert_eq!(t[1].speaker(), "Allende");
        assert_eq!(session.conversation.last_latency_millis(), 1200);
    }

    #[test]
    fn drain_drops_reply_after_persona_switch() {
        let mut app = drain_app();

        let mut session = ChatSession::new(conversation());
        session.select_persona("Allende");
        session.pending = true;
        let stale = session.conversation.epoch();
        session.select_persona("Neruda");
        let e = app.world_mut().spawn(session).id();

        push(&app, ChatMsg::Done {
            entity: e,
            epoch: stale,
            user_text: "hello".into(),
            raw: "<answer>Hola</answer>".into(),
            latency: Duration::from_millis(5),
        });
        app.update();

        let ev = app.world().resource::<Events<ChatCompletedEvt>>();
        assert!(ev.is_empty());
        let session = app.world().entity(e).get::<ChatSession>().unwrap();
        assert!(!session.is_pending());
        assert!(session.conversation.transcript().is_empty());
    }

    #[test]
    fn drain_surfaces_remote_errors_without_partial_turns() {
        let mut app = drain_app();

        let mut session = ChatSession::new(conversation());
        session.select_persona("Allende");
        session.pending = true;
        let epoch = session.conversation.epoch();
        let e = app.world_mut().spawn(session).id();

        push(&app, ChatMsg::Err {
            entity: e,
            epoch,
            error: ChatError::RemoteCall("quota exceeded".into()),
        });
        app.update();

        {
            let mut ev = app.world_mut().resource_mut::<Events<ChatErrorEvt>>();
            let errs: Vec<_> = ev.drain().collect();
            assert_eq!(errs.len(), 1);
            assert_eq!(errs[0].error, ChatError::RemoteCall("quota exceeded".into()));
        }
        let session = app.world().entity(e).get::<ChatSession>().unwrap();
        assert!(session.conversation.transcript().is_empty());
    }

    #[test]
    fn busy_session_rejects_second_request() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<ChatStarted>();
        app.add_event::<ChatErrorEvt>();
        app.insert_resource(ChatInbox::default());
        app.insert_resource(TokioRt::default());
        app.add_systems(Update, super::spawn_chat_requests);

        let mut session = ChatSession::new(conversation());
        session.select_persona("Allende");
        session.pending = true;
        let e = app
            .world_mut()
            .spawn((session, ChatRequest { text: "again".into() }))
            .id();

        app.update();

        assert!(app.world().entity(e).get::<ChatRequest>().is_none());
        let mut ev = app.world_mut().resource_mut::<Events<ChatErrorEvt>>();
        let errs: Vec<_> = ev.drain().collect();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].error, ChatError::Busy);
    }

    #[test]
    fn request_without_persona_reports_error() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<ChatStarted>();
        app.add_event::<ChatErrorEvt>();
        app.insert_resource(ChatInbox::default());
        app.insert_resource(TokioRt::default());
        app.add_systems(Update, super::spawn_chat_requests);

        let e = app
            .world_mut()
            .spawn((ChatSession::new(conversation()), ChatRequest { text: "hi".into() }))
            .id();
        app.update();

        let session = app.world().entity(e).get::<ChatSession>().unwrap();
        assert!(!session.is_pending());
        let mut ev = app.world_mut().resource_mut::<Events<ChatErrorEvt>>();
        let errs: Vec<_> = ev.drain().collect();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].error, ChatError::NoPersonaSelected);
    }

    #[test]
    fn request_round_trips_through_tokio_and_commits_turn() {
        let factory = ScriptedFactory::replying(vec![Ok("<answer>Hola</answer>".into())]);
        let (mut app, e) = plugin_app(factory.clone(), "hello");

        let (started, done, errs) = run_until_idle(&mut app, e);

        assert_eq!(started.len(), 1);
        assert!(errs.is_empty(), "unexpected errors: {errs:?}");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].entity, e);
        assert_eq!(done[0].response.answer, "Hola");

        let session = app.world().entity(e).get::<ChatSession>().unwrap();
        assert!(!session.is_pending());
        assert!(app.world().entity(e).get::<ChatRequest>().is_none());
        let t = session.conversation.transcript();
        assert_eq!(t.len(), 2);
        assert_eq!(t[0], Turn::User { text: "hello".into() });
        assert_eq!(t[1].speaker(), "Allende");

        let exchanges = factory.exchanges.lock().unwrap();
        assert_eq!(*exchanges[0].sent.lock().unwrap(), vec!["hello"]);
    }

    #[test]
    fn panicking_exchange_clears_pending() {
        let (mut app, e) = plugin_app(Arc::new(PanickingFactory), "hello");

        let (started, done, errs) = run_until_idle(&mut app, e);

        assert_eq!(started.len(), 1);
        assert!(done.is_empty());
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0].error, ChatError::RemoteCall(_)));

        let session = app.world().entity(e).get::<ChatSession>().unwrap();
        assert!(!session.is_pending());
        assert!(session.conversation.transcript().is_empty());
    }
}
