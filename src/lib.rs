//! bevy_rag: a bevy chat client for a streaming rag backend.
//!
//! - one conversation, held in the [`Transcript`] resource.
//! - each question opens a server-sent-event stream; answer fragments and
//!   source lists are folded into the trailing assistant bubble in arrival order.
//! - never blocks the main thread: on native the stream runs on a tiny tokio
//!   runtime (blocking reads on its blocking pool); on wasm we use bevy's async
//!   pool, which yields to the browser event loop.
//!
//! wire format (backend side):
//!   - request:   `POST {base}/rag/stream` with `{"input":{"question":...}}`
//!   - events:    `event: data` frames carrying `{"answer":{"content":...}}`
//!                (or `anwser`) and `{"docs":[{"metadata":{"source":...}}]}`
//!   - downloads: `GET {base}/rag/static/{file name}`

use bevy::prelude::*;
#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod event;
pub mod markdown;
pub mod present;
pub mod session;
pub mod sse;
pub mod transcript;
pub mod transport;
pub mod ui;

pub use config::RagConfig;
pub use error::RagError;
pub use event::{StreamEvent, decode_payload};
pub use present::{SourceLink, prepare_question, source_label};
pub use session::{
    AskQuestion, RagStreamFailed, RagStreamFinished, RagStreamStarted, RagTransport,
    StreamGeneration, StreamStatus, StreamTicket, run_stream, send_question,
};
pub use sse::SseFrame;
pub use transcript::{ChatEntry, Speaker, Transcript};
pub use transport::{EventStream, HttpTransport, StreamRequest, StreamTransport};
pub use ui::RagChatUiPlugin;

/// on native we keep a tiny tokio runtime to drive stream tasks.
/// we spawn onto this rt from compute tasks so neither the main thread
/// nor bevy's compute pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_rag", "RagChatPlugin: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we touch the transcript
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum RagSet {
    /// questions become user entries + stream tasks here
    Spawn,
    /// stream messages are folded into the transcript here (in `Update`)
    Drain,
}

/// bevy plugin: wires systems, events, resources.
/// uses `RagConfig::from_env()` and the http transport unless the app inserted
/// its own `RagConfig` / `RagTransport` first.
pub struct RagChatPlugin;

impl Plugin for RagChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_rag", "RagChatPlugin: build()");
        if app.world().get_resource::<RagConfig>().is_none() {
            app.insert_resource(RagConfig::from_env());
        }
        if app.world().get_resource::<RagTransport>().is_none() {
            app.insert_resource(RagTransport::new(HttpTransport));
        }

        app.init_resource::<Transcript>()
            .init_resource::<StreamStatus>()
            .init_resource::<StreamGeneration>()
            .init_resource::<session::StreamInbox>()
            .add_event::<AskQuestion>()
            .add_event::<RagStreamStarted>()
            .add_event::<RagStreamFinished>()
            .add_event::<RagStreamFailed>()
            .configure_sets(Update, (RagSet::Spawn, RagSet::Drain).chain())
            .add_systems(Update, session::spawn_stream_requests.in_set(RagSet::Spawn))
            .add_systems(Update, session::drain_stream_inbox.in_set(RagSet::Drain));

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}
