//! chat view: transcript bubbles, source links, prompt box, status line.
//!
//! the view follows the [`Transcript`] snapshot: when it changes, bubbles from
//! the first changed entry onward are rebuilt. nothing here mutates the
//! transcript. input only produces questions.

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;

use crate::config::RagConfig;
use crate::markdown::{RunStyle, render_runs};
use crate::present::{SourceLink, prepare_question};
use crate::session::{StreamStatus, send_question};
use crate::transcript::{ChatEntry, Transcript};

/// static copy shown around the conversation.
#[derive(Resource, Clone, Debug)]
pub struct ChatUiText {
    pub title: String,
    pub placeholder: String,
    pub disclaimer: String,
}

impl Default for ChatUiText {
    fn default() -> Self {
        Self {
            title: "rag assistant".into(),
            placeholder: "ask your question here...".into(),
            disclaimer: "AI agents can make mistakes. Consider checking important information."
                .into(),
        }
    }
}

// ---------------------- ui tags ----------------------

/// scrollable column holding one child per transcript entry.
#[derive(Component)]
pub struct TranscriptView;

#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatBubble {
    pub index: usize,
    pub from_user: bool,
}

/// clickable citation; opens the static download url.
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct SourceLinkButton(pub String);

#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct BtnSend;

#[derive(Resource, Default)]
pub struct PromptBuf(pub String);

// ---------------------- palette ----------------------

const USER_BG: Color = Color::srgb(0.22, 0.25, 0.30);
const ASSISTANT_BG: Color = Color::srgb(0.07, 0.09, 0.13);
const PANEL_BG: Color = Color::srgb(0.12, 0.14, 0.18);
const ACCENT: Color = Color::srgb(0.05, 0.46, 0.43);
const LINK: Color = Color::srgb(0.45, 0.80, 0.78);
const MUTED: Color = Color::srgb_u8(160, 160, 160);

const BODY_SIZE: f32 = 16.0;
const SMALL_SIZE: f32 = 12.0;

pub struct RagChatUiPlugin;

impl Plugin for RagChatUiPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_rag", "RagChatUiPlugin: build()");
        app.init_resource::<PromptBuf>()
            .init_resource::<ChatUiText>()
            .add_systems(Startup, setup_chat_ui)
            .add_systems(
                Update,
                (
                    handle_text_input,
                    btn_send,
                    btn_source_links,
                    refresh_prompt_text,
                    refresh_status_text,
                ),
            )
            .add_systems(Update, render_transcript.after(crate::RagSet::Drain));
    }
}

// ---------------------- setup ----------------------

fn setup_chat_ui(mut commands: Commands, text: Res<ChatUiText>) {
    let body = TextFont { font_size: BODY_SIZE, ..default() };
    let small = TextFont { font_size: SMALL_SIZE, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                ..default()
            },
            BackgroundColor(Color::srgb_u8(17, 24, 39)),
        ))
        .with_children(|root| {
            // header
            root.spawn((
                Node {
                    width: Val::Percent(100.0),
                    padding: UiRect::all(Val::Px(16.0)),
                    justify_content: JustifyContent::Center,
                    ..default()
                },
                BackgroundColor(ACCENT),
            ))
            .with_children(|h| {
                h.spawn((
                    Text::new(text.title.clone()),
                    TextFont { font_size: 26.0, ..default() },
                    TextColor(Color::WHITE),
                ));
            });

            // conversation
            root.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(12.0),
                    padding: UiRect::all(Val::Px(16.0)),
                    overflow: Overflow::scroll_y(),
                    ..default()
                },
                BackgroundColor(PANEL_BG),
                ScrollPosition::default(),
                TranscriptView,
            ));

            // input panel
            root.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(8.0),
                    padding: UiRect::all(Val::Px(16.0)),
                    ..default()
                },
                BackgroundColor(PANEL_BG),
            ))
            .with_children(|p| {
                p.spawn((
                    Node {
                        width: Val::Percent(100.0),
                        min_height: Val::Px(48.0),
                        padding: UiRect::all(Val::Px(10.0)),
                        ..default()
                    },
                    BackgroundColor(ASSISTANT_BG),
                ))
                .with_children(|b| {
                    b.spawn((
                        Text::new(format!("{} |", text.placeholder)),
                        body.clone(),
                        TextColor(MUTED),
                        PromptText,
                    ));
                });

                p.spawn((
                    Node { column_gap: Val::Px(12.0), align_items: AlignItems::Center, ..default() },
                    BackgroundColor(Color::NONE),
                ))
                .with_children(|row| {
                    row.spawn((
                        Button,
                        Node {
                            width: Val::Px(110.0),
                            height: Val::Px(34.0),
                            align_items: AlignItems::Center,
                            justify_content: JustifyContent::Center,
                            ..default()
                        },
                        BackgroundColor(ACCENT),
                        BorderRadius::all(Val::Px(6.0)),
                        BtnSend,
                    ))
                    .with_children(|b| {
                        b.spawn((Text::new("send"), body.clone(), TextColor(Color::WHITE)));
                    });
                    row.spawn((Text::new(""), small.clone(), TextColor(MUTED), StatusText));
                });
            });

            // footer
            root.spawn((
                Node {
                    width: Val::Percent(100.0),
                    padding: UiRect::all(Val::Px(10.0)),
                    justify_content: JustifyContent::Center,
                    ..default()
                },
                BackgroundColor(ACCENT),
            ))
            .with_children(|f| {
                f.spawn((Text::new(text.disclaimer.clone()), small, TextColor(Color::WHITE)));
            });
        });
}

// ---------------------- input ----------------------

fn submit_prompt(commands: &mut Commands, prompt: &mut PromptBuf) {
    // the box clears on send, independent of how the stream goes
    let raw = std::mem::take(&mut prompt.0);
    if prepare_question(&raw).is_some() {
        send_question(commands, raw);
    } else {
        debug!(target: "bevy_rag", "blank prompt, nothing sent");
    }
}

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
) {
    for ev in ev_kbd.read() {
        if ev.state.is_pressed() {
            if let Some(txt) = &ev.text {
                // enter and backspace arrive as control text on some platforms
                prompt.0.extend(txt.chars().filter(|c| !c.is_control()));
            }
        }
    }

    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    // enter sends; shift+enter keeps typing on a new line
    if keys.just_pressed(KeyCode::Enter) {
        if keys.any_pressed([KeyCode::ShiftLeft, KeyCode::ShiftRight]) {
            prompt.0.push('\n');
        } else {
            submit_prompt(&mut commands, &mut prompt);
        }
    }
}

fn btn_send(
    mut commands: Commands,
    mut q: Query<(&Interaction, &mut BackgroundColor), (Changed<Interaction>, With<BtnSend>)>,
    mut prompt: ResMut<PromptBuf>,
) {
    for (i, mut bg) in &mut q {
        match *i {
            Interaction::Pressed => {
                bg.0 = Color::srgb(0.04, 0.36, 0.34);
                submit_prompt(&mut commands, &mut prompt);
            }
            Interaction::Hovered => bg.0 = Color::srgb(0.06, 0.52, 0.49),
            Interaction::None => bg.0 = ACCENT,
        }
    }
}

fn btn_source_links(
    q: Query<(&Interaction, &SourceLinkButton), Changed<Interaction>>,
) {
    for (i, SourceLinkButton(url)) in &q {
        if *i == Interaction::Pressed {
            open_link(url);
        }
    }
}

#[cfg(target_arch = "wasm32")]
fn open_link(url: &str) {
    info!(target: "bevy_rag", "open source -> {}", url);
    let opened = web_sys::window().and_then(|w| w.open_with_url_and_target(url, "_blank").ok());
    if opened.is_none() {
        warn!(target: "bevy_rag", "browser refused to open {}", url);
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn open_link(url: &str) {
    // no browser to hand off to; surface the download url
    info!(target: "bevy_rag", "source download: {}", url);
}

// ---------------------- text refresh ----------------------

fn refresh_prompt_text(
    prompt: Res<PromptBuf>,
    text: Res<ChatUiText>,
    mut q_prompt: Query<(&mut Text, &mut TextColor), With<PromptText>>,
) {
    if prompt.is_changed() {
        if let Ok((mut t, mut color)) = q_prompt.single_mut() {
            if prompt.0.is_empty() {
                t.0 = format!("{} |", text.placeholder);
                color.0 = MUTED;
            } else {
                t.0 = format!("{} |", prompt.0);
                color.0 = Color::WHITE;
            }
        }
    }
}

/// the line next to the send button.
pub fn status_line(status: &StreamStatus) -> String {
    match status {
        StreamStatus::Idle => String::new(),
        StreamStatus::Streaming => "answering...".into(),
        StreamStatus::Failed(err) => format!("connection failed: {err}"),
    }
}

fn refresh_status_text(
    status: Res<StreamStatus>,
    mut q: Query<(&mut Text, &mut TextColor), With<StatusText>>,
) {
    if status.is_changed() {
        if let Ok((mut t, mut color)) = q.single_mut() {
            t.0 = status_line(&status);
            color.0 = match *status {
                StreamStatus::Failed(_) => Color::srgb(0.95, 0.45, 0.45),
                _ => MUTED,
            };
        }
    }
}

// ---------------------- transcript ----------------------

fn run_style(style: RunStyle) -> (TextFont, TextColor) {
    let size = if style.heading { BODY_SIZE + 6.0 } else { BODY_SIZE };
    let color = if style.code {
        LINK
    } else if style.strong {
        Color::WHITE
    } else if style.emphasis {
        Color::srgb_u8(210, 210, 230)
    } else {
        Color::srgb_u8(225, 225, 225)
    };
    (TextFont { font_size: size, ..default() }, TextColor(color))
}

fn spawn_bubble(
    parent: &mut ChildSpawnerCommands,
    index: usize,
    entry: &ChatEntry,
    config: &RagConfig,
) -> Entity {
    let from_user = entry.is_from_user();
    parent
        .spawn((
            Node {
                width: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(6.0),
                padding: UiRect::all(Val::Px(14.0)),
                ..default()
            },
            BackgroundColor(if from_user { USER_BG } else { ASSISTANT_BG }),
            BorderRadius::all(Val::Px(8.0)),
            ChatBubble { index, from_user },
        ))
        .with_children(|b| {
            b.spawn((Text::default(), TextFont { font_size: BODY_SIZE, ..default() }))
                .with_children(|t| {
                    for run in render_runs(&entry.text) {
                        let (font, color) = run_style(run.style);
                        t.spawn((TextSpan::new(run.text), font, color));
                    }
                });

            if from_user {
                return;
            }
            b.spawn((
                Node { width: Val::Percent(100.0), height: Val::Px(1.0), ..default() },
                BackgroundColor(Color::srgb(0.3, 0.3, 0.35)),
            ));
            for source in &entry.sources {
                let link = SourceLink::new(config, source);
                b.spawn((
                    Button,
                    Node { align_self: AlignSelf::FlexStart, ..default() },
                    BackgroundColor(Color::NONE),
                    SourceLinkButton(link.url),
                ))
                .with_children(|l| {
                    l.spawn((
                        Text::new(link.label),
                        TextFont { font_size: SMALL_SIZE, ..default() },
                        TextColor(LINK),
                    ));
                });
            }
        })
        .id()
}

/// bubbles currently on screen, with the entry size each was built from.
#[derive(Default)]
pub struct RenderedBubbles {
    view: Option<Entity>,
    shown: Vec<(Entity, usize, usize)>,
}

impl RenderedBubbles {
    /// entries only ever grow, so a size mismatch marks the first stale bubble.
    fn first_stale(&self, entries: &[ChatEntry]) -> usize {
        self.shown
            .iter()
            .zip(entries)
            .position(|(&(_, text, sources), e)| text != e.text.len() || sources != e.sources.len())
            .unwrap_or_else(|| self.shown.len().min(entries.len()))
    }
}

/// sync bubbles with the transcript snapshot and keep the newest in view.
///
/// while a stream runs only the trailing bubble changes, so that is all that
/// gets rebuilt.
pub fn render_transcript(
    mut commands: Commands,
    transcript: Res<Transcript>,
    config: Res<RagConfig>,
    mut rendered: Local<RenderedBubbles>,
    mut q_view: Query<(Entity, &mut ScrollPosition), With<TranscriptView>>,
) {
    if !transcript.is_changed() {
        return;
    }
    let Ok((view, mut scroll)) = q_view.single_mut() else {
        return;
    };
    if rendered.view != Some(view) {
        commands.entity(view).despawn_related::<Children>();
        *rendered = RenderedBubbles { view: Some(view), shown: Vec::new() };
    }

    let entries = transcript.entries();
    let keep = rendered.first_stale(entries);
    for (bubble, ..) in rendered.shown.drain(keep..) {
        commands.entity(bubble).despawn();
    }
    commands.entity(view).with_children(|c| {
        for (index, entry) in entries.iter().enumerate().skip(keep) {
            let bubble = spawn_bubble(c, index, entry, &config);
            rendered.shown.push((bubble, entry.text.len(), entry.sources.len()));
        }
    });
    // layout clamps this to the real bottom
    scroll.offset_y = f32::MAX;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamEvent;
    use crate::session::AskQuestion;
    use bevy::input::ButtonState;
    use bevy::input::keyboard::Key;
    use pretty_assertions::assert_eq;

    fn view_app(transcript: Transcript) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.insert_resource(transcript);
        app.insert_resource(RagConfig::new("http://rag:8000"));
        app.world_mut().spawn((Node::default(), ScrollPosition::default(), TranscriptView));
        app.add_systems(Update, render_transcript);
        app
    }

    fn bubbles(app: &mut App) -> Vec<ChatBubble> {
        let mut q = app.world_mut().query::<&ChatBubble>();
        let mut out: Vec<_> = q.iter(app.world()).copied().collect();
        out.sort_by_key(|b| b.index);
        out
    }

    #[test]
    fn one_bubble_per_entry_with_source_links() {
        let mut t = Transcript::new();
        t.append_user("Hi");
        t.apply(StreamEvent::sources(["/a/b/doc1.pdf", "/c/doc 2.pdf"]));
        t.apply(StreamEvent::answer("**Answer**"));

        let mut app = view_app(t);
        app.update();

        assert_eq!(
            bubbles(&mut app),
            vec![
                ChatBubble { index: 0, from_user: true },
                ChatBubble { index: 1, from_user: false },
            ]
        );
        let mut q = app.world_mut().query::<&SourceLinkButton>();
        let mut urls: Vec<_> = q.iter(app.world()).map(|l| l.0.clone()).collect();
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "http://rag:8000/rag/static/doc%202.pdf".to_string(),
                "http://rag:8000/rag/static/doc1.pdf".to_string(),
            ]
        );
    }

    #[test]
    fn rerender_replaces_old_bubbles() {
        let mut t = Transcript::new();
        t.append_user("first");
        let mut app = view_app(t);
        app.update();
        assert_eq!(bubbles(&mut app).len(), 1);

        {
            let mut t = app.world_mut().resource_mut::<Transcript>();
            t.apply(StreamEvent::answer("reply"));
            t.append_user("second");
        }
        app.update();
        let b = bubbles(&mut app);
        assert_eq!(b.len(), 3);
        assert!(b[2].from_user);
    }

    #[test]
    fn streaming_rebuilds_only_the_trailing_bubble() {
        let mut t = Transcript::new();
        t.append_user("Hi");
        t.apply(StreamEvent::answer("Ans"));
        let mut app = view_app(t);
        app.update();

        let entity_of = |app: &mut App, index: usize| {
            let mut q = app.world_mut().query::<(Entity, &ChatBubble)>();
            q.iter(app.world()).find(|(_, b)| b.index == index).map(|(e, _)| e)
        };
        let user = entity_of(&mut app, 0);
        let first_reply = entity_of(&mut app, 1);

        app.world_mut().resource_mut::<Transcript>().apply(StreamEvent::answer("wer"));
        app.update();

        assert_eq!(bubbles(&mut app).len(), 2);
        assert_eq!(entity_of(&mut app, 0), user);
        assert_ne!(entity_of(&mut app, 1), first_reply);

        // an unchanged transcript touches nothing
        app.world_mut().resource_mut::<Transcript>().set_changed();
        let reply = entity_of(&mut app, 1);
        app.update();
        assert_eq!(entity_of(&mut app, 1), reply);
    }

    fn input_app(prompt: &str) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.init_resource::<ButtonInput<KeyCode>>();
        app.insert_resource(PromptBuf(prompt.to_string()));
        app.add_event::<KeyboardInput>();
        app.add_event::<AskQuestion>();
        app.add_systems(Update, (handle_text_input, btn_send));
        app
    }

    fn press(app: &mut App, keys: &[KeyCode]) {
        {
            let mut input = app.world_mut().resource_mut::<ButtonInput<KeyCode>>();
            for key in keys {
                input.press(*key);
            }
        }
        app.update();
        app.world_mut().resource_mut::<ButtonInput<KeyCode>>().reset_all();
    }

    fn asked(app: &mut App) -> Vec<String> {
        let mut ev = app.world_mut().resource_mut::<Events<AskQuestion>>();
        ev.drain().map(|q| q.question).collect()
    }

    fn prompt(app: &App) -> &str {
        &app.world().resource::<PromptBuf>().0
    }

    #[test]
    fn enter_sends_and_clears_the_prompt() {
        let mut app = input_app("  What is X?  ");
        press(&mut app, &[KeyCode::Enter]);
        assert_eq!(asked(&mut app), vec!["  What is X?  ".to_string()]);
        assert_eq!(prompt(&app), "");
    }

    #[test]
    fn shift_enter_adds_a_line_without_sending() {
        let mut app = input_app("line one");
        press(&mut app, &[KeyCode::ShiftLeft, KeyCode::Enter]);
        assert!(asked(&mut app).is_empty());
        assert_eq!(prompt(&app), "line one\n");
    }

    #[test]
    fn blank_prompt_is_cleared_but_not_sent() {
        let mut app = input_app("   ");
        press(&mut app, &[KeyCode::Enter]);
        assert!(asked(&mut app).is_empty());
        assert_eq!(prompt(&app), "");
    }

    #[test]
    fn send_button_submits_like_enter() {
        let mut app = input_app("from the button");
        app.world_mut()
            .spawn((Interaction::Pressed, BackgroundColor(ACCENT), BtnSend));
        app.update();
        assert_eq!(asked(&mut app), vec!["from the button".to_string()]);
        assert_eq!(prompt(&app), "");
    }

    #[test]
    fn control_text_is_not_typed() {
        let mut app = input_app("ab");
        let window = Entity::PLACEHOLDER;
        for (key_code, logical_key, text) in [
            (KeyCode::KeyC, Key::Character("c".into()), "c"),
            (KeyCode::Backspace, Key::Backspace, "\u{8}"),
        ] {
            app.world_mut().send_event(KeyboardInput {
                key_code,
                logical_key,
                state: ButtonState::Pressed,
                text: Some(text.into()),
                repeat: false,
                window,
            });
        }
        press(&mut app, &[KeyCode::Backspace]);
        assert_eq!(prompt(&app), "ab");
    }

    #[test]
    fn status_line_reports_failures() {
        assert_eq!(status_line(&StreamStatus::Idle), "");
        assert_eq!(status_line(&StreamStatus::Streaming), "answering...");
        assert_eq!(
            status_line(&StreamStatus::Failed("backend returned http status 502".into())),
            "connection failed: backend returned http status 502"
        );
    }
}
