//! bevy + bevy_rag chat window against a streaming rag backend.
//!
//! env:
//!   RAG_BACKEND_URL   (default http://localhost:8000; baked in at build time on wasm)
//!
//! type a question and press enter (shift+enter for a new line). answers stream
//! into the last bubble; cited documents show up underneath as download links.

use bevy::prelude::*;
use bevy_rag::{
    RagChatPlugin, RagChatUiPlugin, RagConfig, RagStreamFailed, RagStreamFinished,
    RagStreamStarted, ui::ChatUiText,
};

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let text = ChatUiText::default();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(17, 24, 39)))
        .insert_resource(RagConfig::from_env())
        .insert_resource(text.clone())
        .add_plugins(DefaultPlugins.set(WindowPlugin {
            primary_window: Some(Window {
                title: text.title,
                fit_canvas_to_parent: true,
                ..default()
            }),
            ..default()
        }))
        .add_plugins((RagChatPlugin, RagChatUiPlugin))
        .add_systems(Startup, setup_camera)
        .add_systems(
            Update,
            log_stream_lifecycle.after(bevy_rag::RagSet::Drain),
        )
        .run();
}

fn setup_camera(mut commands: Commands) {
    commands.spawn(Camera2d);
}

fn log_stream_lifecycle(
    mut ev_start: EventReader<RagStreamStarted>,
    mut ev_done: EventReader<RagStreamFinished>,
    mut ev_err: EventReader<RagStreamFailed>,
) {
    for RagStreamStarted { ticket } in ev_start.read() {
        info!(target: "rag_chat", "stream {:?} started", ticket);
    }
    for RagStreamFinished { ticket, chunks, sources } in ev_done.read() {
        info!(
            target: "rag_chat",
            "stream {:?} finished: chunks={}, sources={}",
            ticket, chunks, sources
        );
    }
    for RagStreamFailed { ticket, error } in ev_err.read() {
        warn!(target: "rag_chat", "stream {:?} failed: {}", ticket, error);
    }
}
