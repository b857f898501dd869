//! stream session controller: one request + stream per question.
//!
//! questions arrive as [`AskQuestion`] events. for each one the user entry is
//! appended right away, then a task opens the stream and forwards decoded
//! events through a bounded inbox. the inbox is drained on the main thread,
//! which is the only place the reducer touches the [`Transcript`].
//!
//! a newer question supersedes the stream in flight: every send advances the
//! shared [`StreamGeneration`], stale tasks stop at their next frame and
//! anything they already queued is dropped by the drain.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use flume::{Receiver, Sender, TryRecvError};
use futures_lite::StreamExt;

use crate::config::RagConfig;
use crate::error::RagError;
use crate::event::{StreamEvent, decode_payload, describe_server_error};
use crate::present::prepare_question;
use crate::transcript::Transcript;
use crate::transport::{StreamRequest, StreamTransport};

/// sse event kinds the backend emits.
pub mod kind {
    pub const DATA: &str = "data";
    pub const END: &str = "end";
    pub const ERROR: &str = "error";
    pub const METADATA: &str = "metadata";
}

/// the transport used for new streams. swap it to point at a fake in tests.
#[derive(Resource, Clone)]
pub struct RagTransport(pub Arc<dyn StreamTransport>);

impl RagTransport {
    pub fn new(transport: impl StreamTransport) -> Self {
        Self(Arc::new(transport))
    }
}

/// identifies one stream. `0` means no stream was ever opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StreamTicket(pub u64);

/// monotonically increasing stream counter shared with the stream tasks.
#[derive(Resource, Clone, Debug, Default)]
pub struct StreamGeneration(Arc<AtomicU64>);

impl StreamGeneration {
    pub fn current(&self) -> StreamTicket {
        StreamTicket(self.0.load(Ordering::Acquire))
    }

    /// issue the ticket for a new stream; every older ticket becomes stale.
    pub fn advance(&self) -> StreamTicket {
        StreamTicket(self.0.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn is_current(&self, ticket: StreamTicket) -> bool {
        self.current() == ticket
    }
}

/// what the ui shows outside the transcript.
#[derive(Resource, Clone, Debug, Default, PartialEq, Eq)]
pub enum StreamStatus {
    #[default]
    Idle,
    Streaming,
    /// the last stream ended on a transport or server error.
    Failed(String),
}

/// request a new question. prefer [`send_question`] from systems.
#[derive(Event, Clone, Debug)]
pub struct AskQuestion {
    pub question: String,
}

#[derive(Event, Clone, Copy, Debug)]
pub struct RagStreamStarted {
    pub ticket: StreamTicket,
}

#[derive(Event, Clone, Debug)]
pub struct RagStreamFinished {
    pub ticket: StreamTicket,
    /// answer chunks applied (including empty ones).
    pub chunks: usize,
    /// sources received across all source lists.
    pub sources: usize,
}

#[derive(Event, Clone, Debug)]
pub struct RagStreamFailed {
    pub ticket: StreamTicket,
    pub error: String,
}

/// helper to enqueue a question from any system.
pub fn send_question(commands: &mut Commands, text: impl Into<String>) {
    let question = text.into();
    info!(target: "bevy_rag", "send_question -> '{}' (len={})", question, question.len());
    commands.send_event(AskQuestion { question });
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub chunks: usize,
    pub sources: usize,
}

impl StreamStats {
    fn count(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::AnswerChunk { .. } => self.chunks += 1,
            StreamEvent::SourceList { sources } => self.sources += sources.len(),
        }
    }
}

/// task -> main thread messages.
#[derive(Debug)]
pub enum StreamMsg {
    Event { ticket: StreamTicket, event: StreamEvent },
    Done { ticket: StreamTicket, stats: StreamStats },
    Err { ticket: StreamTicket, error: String },
}

impl StreamMsg {
    fn ticket(&self) -> StreamTicket {
        match self {
            StreamMsg::Event { ticket, .. }
            | StreamMsg::Done { ticket, .. }
            | StreamMsg::Err { ticket, .. } => *ticket,
        }
    }
}

/// cross-thread inbox for streaming; producers send, main thread drains.
/// bounded so a stalled frame applies backpressure to the wire instead of
/// growing without limit.
#[derive(Resource, Clone)]
pub(crate) struct StreamInbox {
    pub(crate) tx: Sender<StreamMsg>,
    pub(crate) rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

/// send to inbox (ignore disconnected)
async fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send_async(msg).await;
}

/// drive one stream to completion, forwarding decoded events in arrival order.
///
/// only `data` frames reach the reducer. errors that are not
/// [`RagError::is_terminal`] (a payload that fails to decode) are logged and
/// dropped; everything else ends the stream. there is no retry.
pub async fn run_stream(
    transport: Arc<dyn StreamTransport>,
    request: StreamRequest,
    ticket: StreamTicket,
    generation: StreamGeneration,
    tx: Sender<StreamMsg>,
) {
    info!(target: "bevy_rag", "stream {:?}: opening {}", ticket, request.url);
    let mut frames = transport.open(request);
    let mut stats = StreamStats::default();

    while let Some(item) = frames.next().await {
        if !generation.is_current(ticket) {
            debug!(target: "bevy_rag", "stream {:?}: superseded, closing", ticket);
            return;
        }
        let events = item.and_then(|frame| match frame.event.as_str() {
            kind::DATA => decode_payload(&frame.data).map(Some),
            kind::END => Ok(None),
            kind::ERROR => Err(RagError::Server(describe_server_error(&frame.data))),
            kind::METADATA => {
                debug!(target: "bevy_rag", "stream {:?}: metadata {}", ticket, frame.data);
                Ok(Some(Vec::new()))
            }
            other => {
                debug!(target: "bevy_rag", "stream {:?}: ignoring '{}' event", ticket, other);
                Ok(Some(Vec::new()))
            }
        });

        match events {
            Ok(Some(events)) => {
                for event in events {
                    stats.count(&event);
                    push_inbox(&tx, StreamMsg::Event { ticket, event }).await;
                }
            }
            Ok(None) => break,
            Err(err) if !err.is_terminal() => {
                warn!(target: "bevy_rag", "stream {:?}: dropping event: {}", ticket, err);
            }
            Err(err) => {
                error!(target: "bevy_rag", "stream {:?}: {}", ticket, err);
                push_inbox(&tx, StreamMsg::Err { ticket, error: err.to_string() }).await;
                return;
            }
        }
    }

    info!(
        target: "bevy_rag",
        "stream {:?}: completed (chunks={}, sources={})",
        ticket, stats.chunks, stats.sources
    );
    push_inbox(&tx, StreamMsg::Done { ticket, stats }).await;
}

/// appends user entries and spawns a stream task per question.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_stream_requests(
    mut ev_ask: EventReader<AskQuestion>,
    transport: Res<RagTransport>,
    config: Res<RagConfig>,
    inbox: Res<StreamInbox>,
    generation: Res<StreamGeneration>,
    mut transcript: ResMut<Transcript>,
    mut status: ResMut<StreamStatus>,
    mut ev_start: EventWriter<RagStreamStarted>,

    // native-only: small runtime to drive the stream tasks
    #[cfg(not(target_arch = "wasm32"))] rt: Res<crate::TokioRt>,
) {
    for AskQuestion { question } in ev_ask.read() {
        let Some(question) = prepare_question(question) else {
            debug!(target: "bevy_rag", "ignoring empty question");
            continue;
        };

        if *status == StreamStatus::Streaming {
            info!(target: "bevy_rag", "new question supersedes stream {:?}", generation.current());
        }
        transcript.append_user(question.clone());
        let ticket = generation.advance();
        *status = StreamStatus::Streaming;
        ev_start.write(RagStreamStarted { ticket });

        let request = StreamRequest::new(config.stream_url(), question);
        let run = run_stream(
            transport.0.clone(),
            request,
            ticket,
            generation.clone(),
            inbox.tx.clone(),
        );

        let pool = AsyncComputeTaskPool::get();
        #[cfg(not(target_arch = "wasm32"))]
        let rt = rt.0.clone();
        #[cfg(not(target_arch = "wasm32"))]
        let tx = inbox.tx.clone();

        pool.spawn(async move {
            #[cfg(target_arch = "wasm32")]
            {
                // wasm path: just await directly (no tokio).
                run.await;
            }
            #[cfg(not(target_arch = "wasm32"))]
            {
                // native: hand off to tokio so bevy pools stay free.
                if let Err(join) = rt.spawn(run).await {
                    // a dead task never reports back itself; end the stream here
                    error!(target: "bevy_rag", "stream {:?}: task died: {}", ticket, join);
                    push_inbox(&tx, StreamMsg::Err { ticket, error: join.to_string() }).await;
                }
            }
        })
        .detach();
    }
}

/// drains the inbox in arrival order and folds it into the transcript.
pub(crate) fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    generation: Res<StreamGeneration>,
    mut transcript: ResMut<Transcript>,
    mut status: ResMut<StreamStatus>,
    mut ev_done: EventWriter<RagStreamFinished>,
    mut ev_err: EventWriter<RagStreamFailed>,
) {
    // cap per frame to avoid long frames on bursty streams; order is preserved
    // because the remainder simply waits for the next frame
    const MAX_PER_FRAME: usize = 512;
    for _ in 0..MAX_PER_FRAME {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        };
        if !generation.is_current(msg.ticket()) {
            debug!(target: "bevy_rag", "dropping message from stale stream {:?}", msg.ticket());
            continue;
        }
        match msg {
            StreamMsg::Event { event, .. } => transcript.apply(event),
            StreamMsg::Done { ticket, stats } => {
                *status = StreamStatus::Idle;
                ev_done.write(RagStreamFinished {
                    ticket,
                    chunks: stats.chunks,
                    sources: stats.sources,
                });
            }
            StreamMsg::Err { ticket, error } => {
                // the partial entry stays as it is
                *status = StreamStatus::Failed(error.clone());
                ev_err.write(RagStreamFailed { ticket, error });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sse::SseFrame;
    use crate::transcript::ChatEntry;
    use crate::transport::EventStream;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// replays a fixed frame script for every request and records what was asked.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub frames: Vec<SseFrame>,
        pub fail_with: Option<u16>,
        pub requests: Arc<Mutex<Vec<StreamRequest>>>,
    }

    impl StreamTransport for ScriptedTransport {
        fn open(&self, request: StreamRequest) -> EventStream {
            self.requests.lock().unwrap().push(request);
            let (tx, stream) = EventStream::channel();
            for frame in &self.frames {
                tx.send(Ok(frame.clone())).unwrap();
            }
            if let Some(code) = self.fail_with {
                tx.send(Err(RagError::Status(code))).unwrap();
            }
            stream
        }
    }

    pub(crate) fn data(json: &str) -> SseFrame {
        SseFrame::new(kind::DATA, json)
    }

    fn run(transport: ScriptedTransport) -> Vec<StreamMsg> {
        let generation = StreamGeneration::default();
        let ticket = generation.advance();
        let (tx, rx) = flume::unbounded();
        pollster::block_on(run_stream(
            Arc::new(transport),
            StreamRequest::new("http://h/rag/stream", "q"),
            ticket,
            generation,
            tx,
        ));
        rx.try_iter().collect()
    }

    #[test]
    fn only_data_frames_reach_the_reducer() {
        let msgs = run(ScriptedTransport {
            frames: vec![
                SseFrame::new(kind::METADATA, r#"{"run_id":"r1"}"#),
                data(r#"{"anwser":{"content":"Hel"}}"#),
                SseFrame::new("keepalive", r#"{"answer":{"content":"nope"}}"#),
                data(r#"{"answer":{"content":"lo"}}"#),
                SseFrame::new(kind::END, ""),
                data(r#"{"answer":{"content":"after end"}}"#),
            ],
            ..default()
        });

        let events: Vec<_> = msgs
            .iter()
            .filter_map(|m| match m {
                StreamMsg::Event { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(events, vec![StreamEvent::answer("Hel"), StreamEvent::answer("lo")]);
        assert!(matches!(
            msgs.last(),
            Some(StreamMsg::Done { stats: StreamStats { chunks: 2, sources: 0 }, .. })
        ));
    }

    #[test]
    fn malformed_payload_is_dropped_and_stream_continues() {
        let msgs = run(ScriptedTransport {
            frames: vec![
                data("{not json"),
                data(r#"{"docs":[{"metadata":{"source":"/x/y.pdf"}}]}"#),
            ],
            ..default()
        });
        assert_eq!(msgs.len(), 2);
        assert!(matches!(&msgs[0], StreamMsg::Event { event: StreamEvent::SourceList { .. }, .. }));
        assert!(matches!(
            &msgs[1],
            StreamMsg::Done { stats: StreamStats { chunks: 0, sources: 1 }, .. }
        ));
    }

    #[test]
    fn transport_error_ends_the_stream_without_done() {
        let msgs = run(ScriptedTransport {
            frames: vec![data(r#"{"answer":{"content":"part"}}"#)],
            fail_with: Some(502),
            ..default()
        });
        assert_eq!(msgs.len(), 2);
        match &msgs[1] {
            StreamMsg::Err { error, .. } => assert!(error.contains("502")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    /// hands out one prepared stream.
    struct Prepared(Mutex<Option<EventStream>>);

    impl StreamTransport for Prepared {
        fn open(&self, _request: StreamRequest) -> EventStream {
            self.0.lock().unwrap().take().unwrap()
        }
    }

    #[test]
    fn only_terminal_errors_end_the_stream() {
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let (tx, stream) = EventStream::channel();
        tx.send(Err(RagError::Decode(decode))).unwrap();
        tx.send(Ok(data(r#"{"answer":{"content":"kept"}}"#))).unwrap();
        tx.send(Err(RagError::Protocol("bad utf-8".into()))).unwrap();
        tx.send(Ok(data(r#"{"answer":{"content":"lost"}}"#))).unwrap();
        drop(tx);

        let generation = StreamGeneration::default();
        let ticket = generation.advance();
        let (inbox, rx) = flume::unbounded();
        pollster::block_on(run_stream(
            Arc::new(Prepared(Mutex::new(Some(stream)))),
            StreamRequest::new("u", "q"),
            ticket,
            generation,
            inbox,
        ));

        let msgs: Vec<_> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(
            &msgs[0],
            StreamMsg::Event { event: StreamEvent::AnswerChunk { content }, .. } if content == "kept"
        ));
        assert!(matches!(&msgs[1], StreamMsg::Err { error, .. } if error.contains("bad utf-8")));
    }

    #[test]
    fn server_error_event_ends_the_stream() {
        let msgs = run(ScriptedTransport {
            frames: vec![
                SseFrame::new(kind::ERROR, r#"{"status_code":500,"message":"boom"}"#),
                data(r#"{"answer":{"content":"never"}}"#),
            ],
            ..default()
        });
        assert_eq!(msgs.len(), 1);
        assert!(matches!(&msgs[0], StreamMsg::Err { error, .. } if error.contains("500: boom")));
    }

    #[test]
    fn superseded_stream_stops_forwarding() {
        let generation = StreamGeneration::default();
        let stale = generation.advance();
        let _newer = generation.advance();
        let (tx, rx) = flume::unbounded();
        pollster::block_on(run_stream(
            Arc::new(ScriptedTransport {
                frames: vec![data(r#"{"answer":{"content":"x"}}"#)],
                ..default()
            }),
            StreamRequest::new("u", "q"),
            stale,
            generation,
            tx,
        ));
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn drain_applies_current_and_drops_stale_messages() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.init_resource::<Transcript>();
        app.init_resource::<StreamStatus>();
        app.init_resource::<StreamGeneration>();
        app.insert_resource(StreamInbox::default());
        app.add_event::<RagStreamFinished>();
        app.add_event::<RagStreamFailed>();
        app.add_systems(Update, drain_stream_inbox);

        let generation = app.world().resource::<StreamGeneration>().clone();
        let old = generation.advance();
        let cur = generation.advance();
        app.world_mut().resource_mut::<Transcript>().append_user("Hi");

        {
            let tx = app.world().resource::<StreamInbox>().tx.clone();
            tx.send(StreamMsg::Event { ticket: old, event: StreamEvent::answer("stale") })
                .unwrap();
            tx.send(StreamMsg::Event {
                ticket: cur,
                event: StreamEvent::sources(["/a/b/doc1.pdf"]),
            })
            .unwrap();
            tx.send(StreamMsg::Event { ticket: cur, event: StreamEvent::answer("Answer") })
                .unwrap();
            tx.send(StreamMsg::Err { ticket: old, error: "old failure".into() }).unwrap();
            tx.send(StreamMsg::Done { ticket: cur, stats: StreamStats { chunks: 1, sources: 1 } })
                .unwrap();
        }
        app.update();

        assert_eq!(
            app.world().resource::<Transcript>().entries(),
            &[
                ChatEntry::user("Hi"),
                ChatEntry::assistant("Answer", vec!["/a/b/doc1.pdf".to_string()]),
            ]
        );
        assert_eq!(*app.world().resource::<StreamStatus>(), StreamStatus::Idle);

        let mut done = app.world_mut().resource_mut::<Events<RagStreamFinished>>();
        let done: Vec<_> = done.drain().collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].ticket, cur);
        let mut errs = app.world_mut().resource_mut::<Events<RagStreamFailed>>();
        assert_eq!(errs.drain().count(), 0);
    }

    #[test]
    fn drain_surfaces_failures_and_keeps_partial_text() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.init_resource::<Transcript>();
        app.init_resource::<StreamStatus>();
        app.init_resource::<StreamGeneration>();
        app.insert_resource(StreamInbox::default());
        app.add_event::<RagStreamFinished>();
        app.add_event::<RagStreamFailed>();
        app.add_systems(Update, drain_stream_inbox);

        let ticket = app.world().resource::<StreamGeneration>().advance();
        {
            let tx = app.world().resource::<StreamInbox>().tx.clone();
            tx.send(StreamMsg::Event { ticket, event: StreamEvent::answer("half an ans") })
                .unwrap();
            tx.send(StreamMsg::Err { ticket, error: "connection reset".into() }).unwrap();
        }
        app.update();

        assert_eq!(
            app.world().resource::<Transcript>().last(),
            Some(&ChatEntry::assistant("half an ans", vec![]))
        );
        assert_eq!(
            *app.world().resource::<StreamStatus>(),
            StreamStatus::Failed("connection reset".into())
        );
        let mut errs = app.world_mut().resource_mut::<Events<RagStreamFailed>>();
        let errs: Vec<_> = errs.drain().collect();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].error, "connection reset");
    }
}
