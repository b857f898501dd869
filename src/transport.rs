//! the http/sse transport, used as a black box by the session controller.
//!
//! - native: blocking `ureq` read loop on a tokio blocking thread.
//! - wasm: `gloo-net` fetch, then the body's `ReadableStream` pumped on the
//!   browser event loop.
//!
//! both pumps push whole lines of body bytes into a channel; the sse parser
//! runs on the consuming side. either way the controller only sees an
//! [`EventStream`]: frames in arrival order, ending when the body ends.

use std::pin::Pin;
use std::task::{Context, Poll};

use bevy::prelude::*;
use futures_lite::Stream;

use crate::error::RagError;
use crate::sse::{self, SseFrame};

/// chunks buffered between the wire and the controller before the pump waits.
const FRAME_BUFFER: usize = 256;

pub type FrameResult = Result<SseFrame, RagError>;

/// producer half for already-framed events.
pub type FrameSender = flume::Sender<FrameResult>;

/// producer half handed to a pump: raw body bytes, whole lines only.
pub type BodySender = flume::Sender<Result<Vec<u8>, RagError>>;

/// one outbound question.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub url: String,
    pub question: String,
}

impl StreamRequest {
    pub fn new(url: impl Into<String>, question: impl Into<String>) -> Self {
        Self { url: url.into(), question: question.into() }
    }

    /// `{ "input": { "question": ... } }`
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({ "input": { "question": self.question } })
    }
}

/// lazy, non-restartable sequence of sse frames for one request.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = FrameResult> + Send>>,
}

impl EventStream {
    /// a bounded frame channel; the stream ends once every sender is dropped.
    pub fn channel() -> (FrameSender, EventStream) {
        let (tx, rx) = flume::bounded(FRAME_BUFFER);
        (tx, EventStream { inner: Box::pin(rx.into_stream()) })
    }

    /// a bounded body channel, decoded as sse on the consuming side.
    pub fn body() -> (BodySender, EventStream) {
        let (tx, rx) = flume::bounded(FRAME_BUFFER);
        (tx, EventStream { inner: Box::pin(sse::decode(rx.into_stream())) })
    }

    /// a stream that yields a single error.
    pub fn failed(err: RagError) -> EventStream {
        let (tx, stream) = Self::channel();
        let _ = tx.send(Err(err));
        stream
    }
}

impl Stream for EventStream {
    type Item = FrameResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// opens one streaming request. implementations must not block the caller.
pub trait StreamTransport: Send + Sync + 'static {
    fn open(&self, request: StreamRequest) -> EventStream;
}

/// the real transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpTransport;

#[cfg(not(target_arch = "wasm32"))]
impl StreamTransport for HttpTransport {
    /// fails the stream when called outside a tokio runtime.
    fn open(&self, request: StreamRequest) -> EventStream {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return EventStream::failed(RagError::Transport("no tokio runtime".into()));
        };
        let (tx, stream) = EventStream::body();
        // ureq is blocking; keep it off the async workers
        handle.spawn_blocking(move || native::pump(request, tx));
        stream
    }
}

#[cfg(target_arch = "wasm32")]
impl StreamTransport for HttpTransport {
    fn open(&self, request: StreamRequest) -> EventStream {
        let (tx, stream) = EventStream::body();
        wasm_bindgen_futures::spawn_local(wasm::pump(request, tx));
        stream
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::io::Read;

    use super::*;

    pub(super) fn pump(request: StreamRequest, tx: BodySender) {
        if let Err(err) = read_stream(&request, &tx) {
            let _ = tx.send(Err(err));
        }
    }

    fn read_stream(request: &StreamRequest, tx: &BodySender) -> Result<(), RagError> {
        debug!(target: "bevy_rag", "ureq: POST {}", request.url);
        let agent = ureq::Agent::new_with_defaults();
        let res = agent
            .post(&request.url)
            .header("accept", "text/event-stream")
            .send_json(request.body())
            .map_err(|e| match e {
                ureq::Error::StatusCode(code) => RagError::Status(code),
                other => RagError::Transport(other.to_string()),
            })?;

        let mut reader = res.into_body().into_reader();
        let mut buf = [0u8; 8192];
        let mut pending = Vec::new();
        loop {
            let n = reader.read(&mut buf).map_err(|e| RagError::Transport(e.to_string()))?;
            if n == 0 {
                if !pending.is_empty() {
                    let _ = tx.send(Ok(pending));
                }
                return Ok(());
            }
            pending.extend_from_slice(&buf[..n]);
            if let Some(lines) = sse::take_complete_lines(&mut pending) {
                if tx.send(Ok(lines)).is_err() {
                    // controller went away (stream superseded); stop reading
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
mod wasm {
    use gloo_net::http::Request;
    use js_sys::{Reflect, Uint8Array};
    use wasm_bindgen::{JsCast, JsValue};
    use wasm_bindgen_futures::JsFuture;
    use web_sys::ReadableStreamDefaultReader;

    use super::*;

    fn js_err(v: JsValue) -> RagError {
        RagError::Transport(format!("{v:?}"))
    }

    pub(super) async fn pump(request: StreamRequest, tx: BodySender) {
        if let Err(err) = read_stream(&request, &tx).await {
            let _ = tx.send_async(Err(err)).await;
        }
    }

    async fn read_stream(request: &StreamRequest, tx: &BodySender) -> Result<(), RagError> {
        debug!(target: "bevy_rag", "fetch: POST {}", request.url);
        let resp = Request::post(&request.url)
            .header("accept", "text/event-stream")
            .json(&request.body())
            .map_err(|e| RagError::Transport(e.to_string()))?
            .send()
            .await
            .map_err(|e| RagError::Transport(e.to_string()))?;
        if !resp.ok() {
            return Err(RagError::Status(resp.status()));
        }

        let body = resp.body().ok_or(RagError::MissingBody)?;
        let reader: ReadableStreamDefaultReader = body.get_reader().unchecked_into();
        let mut pending = Vec::new();
        loop {
            let chunk = JsFuture::from(reader.read()).await.map_err(js_err)?;
            let done = Reflect::get(&chunk, &JsValue::from_str("done"))
                .map_err(js_err)?
                .as_bool()
                .unwrap_or(true);
            if done {
                if !pending.is_empty() {
                    let _ = tx.send_async(Ok(pending)).await;
                }
                return Ok(());
            }
            let value = Reflect::get(&chunk, &JsValue::from_str("value")).map_err(js_err)?;
            pending.extend_from_slice(&Uint8Array::new(&value).to_vec());
            let Some(lines) = sse::take_complete_lines(&mut pending) else {
                continue;
            };
            // single-threaded: a blocking send on a full channel would never drain
            if tx.send_async(Ok(lines)).await.is_err() {
                let _ = reader.cancel();
                return Ok(());
            }
        }
    }
}
