//! server-sent-event framing on top of `eventsource-stream`.
//!
//! transports hand over raw body bytes; [`decode`] turns them into
//! [`SseFrame`]s. the parser expects every chunk to be valid utf-8 on its own,
//! so pumps forward whole lines only (see [`take_complete_lines`]).

use eventsource_stream::{Event, Eventsource};
use futures_lite::{Stream, StreamExt};

use crate::error::RagError;

/// event kind used when a frame carries no `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// one dispatched sse message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self { event: event.into(), data: data.into(), id: None }
    }
}

impl From<Event> for SseFrame {
    fn from(ev: Event) -> Self {
        Self {
            event: if ev.event.is_empty() { DEFAULT_EVENT.to_string() } else { ev.event },
            data: ev.data,
            id: (!ev.id.is_empty()).then_some(ev.id),
        }
    }
}

/// utf-8 byte order mark.
const BOM: &[u8] = b"\xEF\xBB\xBF";

/// decode a body byte stream into frames, in arrival order.
pub fn decode<S>(bytes: S) -> impl Stream<Item = Result<SseFrame, RagError>> + Send + 'static
where
    S: Stream<Item = Result<Vec<u8>, RagError>> + Send + 'static,
{
    strip_bom(bytes)
        .eventsource()
        .map(|item| item.map(SseFrame::from).map_err(RagError::from))
}

/// drop a leading byte order mark, even when it is split across chunks.
///
/// the parser cuts a mark off by char index, not byte length, and panics on
/// it; it must never see one.
fn strip_bom<S>(bytes: S) -> impl Stream<Item = Result<Vec<u8>, RagError>> + Send + 'static
where
    S: Stream<Item = Result<Vec<u8>, RagError>> + Send + 'static,
{
    // bytes held back while they could still be the start of a mark
    let mut head = Some(Vec::new());
    bytes.filter_map(move |chunk| {
        let Some(mut held) = head.take() else {
            return Some(chunk);
        };
        let mut chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return Some(Err(err)),
        };
        held.append(&mut chunk);
        if held.len() < BOM.len() && BOM.starts_with(&held) {
            head = Some(held);
            return None;
        }
        if held.starts_with(BOM) {
            held.drain(..BOM.len());
        }
        Some(Ok(held))
    })
}

/// split off everything up to and including the last `\n` in `pending`.
///
/// line breaks are ascii, so the returned bytes never end mid code point.
pub fn take_complete_lines(pending: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = pending.iter().rposition(|&b| b == b'\n')?;
    let rest = pending.split_off(end + 1);
    Some(std::mem::replace(pending, rest))
}
