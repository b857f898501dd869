//! decoding of `data` payloads into an explicit tagged union.
//!
//! the backend streams json objects whose *shape* says what they are: an
//! `answer` object (or the historical `anwser` spelling, same meaning) carries a
//! text fragment, a `docs` array carries citations. decoding happens once here
//! so nothing downstream branches on key presence.

use serde::Deserialize;

use crate::error::RagError;

/// one partial update of the answer being streamed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    AnswerChunk { content: String },
    SourceList { sources: Vec<String> },
}

impl StreamEvent {
    pub fn answer(content: impl Into<String>) -> Self {
        Self::AnswerChunk { content: content.into() }
    }

    pub fn sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::SourceList { sources: sources.into_iter().map(Into::into).collect() }
    }

    /// `(text_delta, sources_delta)`; the side an event doesn't carry is empty.
    pub fn into_delta(self) -> (String, Vec<String>) {
        match self {
            StreamEvent::AnswerChunk { content } => (content, Vec::new()),
            StreamEvent::SourceList { sources } => (String::new(), sources),
        }
    }
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    answer: Option<Chunk>,
    #[serde(default)]
    anwser: Option<Chunk>,
    #[serde(default)]
    docs: Option<Vec<Doc>>,
}

// extra message fields (type, id, additional_kwargs, ...) are ignored
#[derive(Deserialize)]
struct Chunk {
    content: String,
}

#[derive(Deserialize)]
struct Doc {
    metadata: DocMetadata,
}

#[derive(Deserialize)]
struct DocMetadata {
    source: String,
}

/// decode one `data` payload.
///
/// a payload may carry an answer fragment and docs at once; the fragment comes
/// first. an object with neither yields no events.
pub fn decode_payload(data: &str) -> Result<Vec<StreamEvent>, RagError> {
    let payload: Payload = serde_json::from_str(data)?;

    let mut out = Vec::with_capacity(2);
    if let Some(Chunk { content }) = payload.answer.or(payload.anwser) {
        out.push(StreamEvent::AnswerChunk { content });
    }
    if let Some(docs) = payload.docs {
        out.push(StreamEvent::SourceList {
            sources: docs.into_iter().map(|d| d.metadata.source).collect(),
        });
    }
    Ok(out)
}

#[derive(Deserialize)]
struct ServerErrorBody {
    #[serde(default)]
    status_code: Option<u16>,
    message: String,
}

/// human readable text of an `error` event; falls back to the raw data.
pub fn describe_server_error(data: &str) -> String {
    match serde_json::from_str::<ServerErrorBody>(data) {
        Ok(ServerErrorBody { status_code: Some(code), message }) => format!("{code}: {message}"),
        Ok(ServerErrorBody { status_code: None, message }) => message,
        Err(_) if data.trim().is_empty() => "unknown error".to_string(),
        Err(_) => data.trim().to_string(),
    }
}
