//! persona chat example: pick a character, talk to it.
//! - personas are `.txt` prompts in `PERSONA_PROMPTS_DIR` (default `Character_Prompts`,
//!   try `PERSONA_PROMPTS_DIR=personas`).
//! - `<` / `>` cycle personas; switching clears the conversation.
//! - enter sends, tab toggles question analysis / documents / citations.
//!
//! env:
//!   GEMINI_API_KEY   (key)
//!   LLM_MODEL        (default gemini-1.5-pro)
//!   LLM_BASE_URL     (optional)

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_persona_chat::{
    ChatCompletedEvt, ChatConfig, ChatErrorEvt, ChatSession, ChatStarted, PersonaChatPlugin,
    PersonaChatSet, Turn, send_user_text,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct PersonaText;
#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct StatusText;

#[derive(Component)]
struct BtnPrevPersona;
#[derive(Component)]
struct BtnNextPersona;

#[derive(Component, Copy, Clone)]
struct TargetSession(Entity);

// ---------------------- app state ----------------------

#[derive(Resource, Default)]
struct PromptBuf(String);

#[derive(Resource, Default)]
struct PersonaList {
    names: Vec<String>,
    selected: usize,
    error: Option<String>,
}

#[derive(Resource, Default)]
struct ShowDetails(bool);

#[derive(Resource, Default)]
enum Status {
    #[default]
    Idle,
    Generating,
    Failed(String),
}

// ---------------------- main ----------------------

fn main() {
    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(ChatConfig::from_env())
        .insert_resource(PromptBuf::default())
        .insert_resource(PersonaList::default())
        .insert_resource(ShowDetails::default())
        .insert_resource(Status::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(PersonaChatPlugin)
        .add_systems(Startup, setup)
        .add_systems(
            Update,
            (
                handle_text_input,
                btn_prev_persona,
                btn_next_persona,
                refresh_persona_text,
                refresh_history_text,
                refresh_prompt_text,
                refresh_status_text,
            ),
        )
        // event readers should run after the plugin emits events
        .add_systems(
            Update,
            (on_started, on_done, on_error).after(PersonaChatSet::Drain),
        )
        .run();
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands, cfg: Res<ChatConfig>, mut personas: ResMut<PersonaList>) {
    info!(target: "persona_chat", "config: {:?}", *cfg);
    commands.spawn(Camera2d::default());

    let mut session = ChatSession::new(cfg.conversation());
    match session.conversation.personas().list_persona_names() {
        Ok(names) => {
            info!(target: "persona_chat", "personas: {:?}", names);
            if let Some(first) = names.first() {
                session.select_persona(first.clone());
            }
            personas.names = names;
        }
        Err(e) => {
            warn!(target: "persona_chat", "persona listing failed: {}", e);
            personas.error = Some(e.to_string());
        }
    }
    let session = commands.spawn(session).id();

    let style_22 = TextFont { font_size: 22.0, ..default() };
    let style_16 = TextFont { font_size: 16.0, ..default() };
    let style_12 = TextFont { font_size: 12.0, ..default() };

    let button = |width: f32| {
        (
            Button,
            Node {
                width: Val::Px(width),
                height: Val::Px(28.0),
                align_items: AlignItems::Center,
                justify_content: JustifyContent::Center,
                ..default()
            },
            BackgroundColor(Color::srgb(0.2, 0.2, 0.25)),
        )
    };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            p.spawn((Text::new("Allende Archives AI Assistant"), style_22.clone(), TextColor(Color::WHITE)));

            // row: [<] persona [>]
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    height: Val::Auto,
                    column_gap: Val::Px(8.0),
                    flex_direction: FlexDirection::Row,
                    padding: UiRect::all(Val::Px(8.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
            ))
            .with_children(|row| {
                row.spawn((button(28.0), BtnPrevPersona, TargetSession(session)))
                    .with_children(|b| {
                        b.spawn((Text::new("<"), style_16.clone(), TextColor(Color::WHITE)));
                    });
                row.spawn((
                    Text::new("character: "),
                    style_16.clone(),
                    TextColor(Color::WHITE),
                    PersonaText,
                ));
                row.spawn((button(28.0), BtnNextPersona, TargetSession(session)))
                    .with_children(|b| {
                        b.spawn((Text::new(">"), style_16.clone(), TextColor(Color::WHITE)));
                    });
            });

            // conversation
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(8.0),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    overflow: Overflow::clip(),
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|c| {
                c.spawn((
                    Text::new(""),
                    style_16.clone(),
                    TextColor(Color::WHITE),
                    HistoryText,
                    TargetSession(session),
                ));
            });

            p.spawn((Text::new("> "), style_16.clone(), TextColor(Color::WHITE), PromptText, TargetSession(session)));
            p.spawn((
                Text::new(""),
                style_16.clone(),
                TextColor(Color::srgb_u8(200, 200, 200)),
                StatusText,
                TargetSession(session),
            ));
            p.spawn((Text::new("Powered by Gemini AI"), style_12, TextColor(Color::srgb_u8(140, 140, 140))));
        });
}

// ---------------------- input & buttons ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    mut details: ResMut<ShowDetails>,
    q_prompt_target: Query<&TargetSession, With<PromptText>>,
) {
    if keys.just_pressed(KeyCode::Tab) {
        details.0 = !details.0;
    }

    for ev in ev_kbd.read() {
        if ev.state.is_pressed() {
            if let Some(txt) = &ev.text {
                let s = txt.replace(['\r', '\n', '\t'], "");
                prompt.0.push_str(&s);
            }
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    if keys.just_pressed(KeyCode::Enter) && !prompt.0.is_empty() {
        if let Ok(TargetSession(e)) = q_prompt_target.single() {
            let msg = std::mem::take(&mut prompt.0);
            send_user_text(&mut commands, *e, msg);
        }
    }
}

fn cycle_persona(
    personas: &mut PersonaList,
    sessions: &mut Query<&mut ChatSession>,
    target: Entity,
    step: isize,
) {
    if personas.names.is_empty() {
        return;
    }
    let len = personas.names.len() as isize;
    personas.selected = ((personas.selected as isize + step).rem_euclid(len)) as usize;
    let name = personas.names[personas.selected].clone();
    if let Ok(mut session) = sessions.get_mut(target) {
        info!(target: "persona_chat", "persona -> '{}'", name);
        session.select_persona(name);
    }
}

fn btn_prev_persona(
    mut q: Query<(&Interaction, &TargetSession, &mut BackgroundColor), (Changed<Interaction>, With<BtnPrevPersona>)>,
    mut sessions: Query<&mut ChatSession>,
    mut personas: ResMut<PersonaList>,
    mut status: ResMut<Status>,
) {
    for (i, TargetSession(t), mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.3, 0.3, 0.35);
                cycle_persona(&mut personas, &mut sessions, *t, -1);
                *status = Status::Idle;
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.25, 0.25, 0.3),
            Interaction::None => bg.0 = Color::srgb(0.2, 0.2, 0.25),
        }
    }
}

fn btn_next_persona(
    mut q: Query<(&Interaction, &TargetSession, &mut BackgroundColor), (Changed<Interaction>, With<BtnNextPersona>)>,
    mut sessions: Query<&mut ChatSession>,
    mut personas: ResMut<PersonaList>,
    mut status: ResMut<Status>,
) {
    for (i, TargetSession(t), mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.3, 0.3, 0.35);
                cycle_persona(&mut personas, &mut sessions, *t, 1);
                *status = Status::Idle;
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.25, 0.25, 0.3),
            Interaction::None => bg.0 = Color::srgb(0.2, 0.2, 0.25),
        }
    }
}

// ---------------------- text refresh ----------------------

fn refresh_persona_text(personas: Res<PersonaList>, mut q: Query<&mut Text, With<PersonaText>>) {
    if !personas.is_changed() {
        return;
    }
    if let Ok(mut t) = q.single_mut() {
        t.0 = if let Some(err) = &personas.error {
            format!("character: [error: {err}]")
        } else if let Some(name) = personas.names.get(personas.selected) {
            format!("character: {name}")
        } else {
            "character: <none>".to_string()
        };
    }
}

fn render_transcript(turns: &[Turn], details: bool) -> String {
    let mut out = String::new();
    for turn in turns {
        match turn {
            Turn::User { text } => {
                out.push_str("You: ");
                out.push_str(text);
                out.push('\n');
            }
            Turn::Persona { name, response } => {
                out.push_str(&format!("{name}: {}\n", response.answer));
                if details {
                    out.push_str(&format!(
                        "  [question analysis] {}\n  [suggested documents] {}\n  [citations] {}\n",
                        response.question_analysis, response.suggested_documents, response.citations
                    ));
                }
            }
        }
    }
    out
}

fn refresh_history_text(
    details: Res<ShowDetails>,
    sessions: Query<Ref<ChatSession>>,
    mut q_hist: Query<(&TargetSession, &mut Text), With<HistoryText>>,
) {
    for (TargetSession(t), mut h) in q_hist.iter_mut() {
        if let Ok(session) = sessions.get(*t) {
            if session.is_changed() || details.is_changed() {
                h.0 = render_transcript(session.conversation.transcript(), details.0);
            }
        }
    }
}

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q_prompt: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed() {
        if let Ok(mut t) = q_prompt.single_mut() {
            t.0 = format!("> {} |", prompt.0);
        }
    }
}

fn refresh_status_text(
    status: Res<Status>,
    sessions: Query<Ref<ChatSession>>,
    mut q: Query<(&TargetSession, &mut Text), With<StatusText>>,
) {
    for (TargetSession(t), mut s) in q.iter_mut() {
        let Ok(session) = sessions.get(*t) else { continue };
        if !status.is_changed() && !session.is_changed() {
            continue;
        }
        let latency = session.conversation.last_latency();
        s.0 = match &*status {
            Status::Generating => "Generating response...".to_string(),
            Status::Failed(err) => format!("ERROR: {err}"),
            Status::Idle if !latency.is_zero() => {
                format!("Response time: {:.2} seconds", latency.as_secs_f64())
            }
            Status::Idle => String::new(),
        };
    }
}

// ---------------------- chat events ----------------------

fn on_started(mut ev: EventReader<ChatStarted>, mut status: ResMut<Status>) {
    for ChatStarted { entity } in ev.read() {
        debug!(target: "persona_chat", "started (entity={:?})", entity);
        *status = Status::Generating;
    }
}

fn on_done(mut ev: EventReader<ChatCompletedEvt>, mut status: ResMut<Status>) {
    for ChatCompletedEvt { entity, response, latency } in ev.read() {
        info!(target: "persona_chat",
            "reply (entity={:?}) in {:?}: answer_len={}",
            entity, latency, response.answer.len()
        );
        *status = Status::Idle;
    }
}

fn on_error(mut ev: EventReader<ChatErrorEvt>, mut status: ResMut<Status>) {
    for ChatErrorEvt { entity, error } in ev.read() {
        error!(target: "persona_chat", "chat error (entity={:?}): {}", entity, error);
        *status = Status::Failed(error.to_string());
    }
}
