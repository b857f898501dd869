use eventsource_stream::EventStreamError;
use thiserror::Error;

/// everything that can end (or spoil one event of) a rag stream.
#[derive(Debug, Error)]
pub enum RagError {
    /// the `data` payload of an event did not decode. only that event is dropped.
    #[error("malformed event payload: {0}")]
    Decode(#[from] serde_json::Error),
    /// the backend answered with a non-2xx status.
    #[error("backend returned http status {0}")]
    Status(u16),
    /// connection-level failure (dns, tls, reset, body read).
    #[error("transport error: {0}")]
    Transport(String),
    /// the backend pushed an `error` event.
    #[error("backend reported an error: {0}")]
    Server(String),
    #[error("response has no readable body")]
    MissingBody,
    /// the body is not a well-formed event stream.
    #[error("malformed event stream: {0}")]
    Protocol(String),
}

impl From<EventStreamError<RagError>> for RagError {
    fn from(err: EventStreamError<RagError>) -> Self {
        match err {
            EventStreamError::Transport(err) => err,
            other => RagError::Protocol(other.to_string()),
        }
    }
}

impl RagError {
    /// decode errors are scoped to a single event; everything else ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RagError::Decode(_))
    }
}
