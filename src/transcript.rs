//! the conversation transcript and the reducer that folds stream events into it.
//!
//! the transcript is append-only. the only in-place mutation allowed is
//! extending the *last* assistant entry while its answer is still streaming.

use bevy::prelude::*;

use crate::event::StreamEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Speaker {
    User,
    Assistant,
}

/// one chat bubble.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatEntry {
    pub text: String,
    pub speaker: Speaker,
    /// cited sources in arrival order; always empty for user entries.
    pub sources: Vec<String>,
}

impl ChatEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self { text: text.into(), speaker: Speaker::User, sources: Vec::new() }
    }

    pub fn assistant(text: impl Into<String>, sources: Vec<String>) -> Self {
        Self { text: text.into(), speaker: Speaker::Assistant, sources }
    }

    pub fn is_from_user(&self) -> bool {
        self.speaker == Speaker::User
    }
}

/// single source of truth for what is rendered. process-wide, one conversation.
#[derive(Resource, Clone, Debug, Default, PartialEq, Eq)]
pub struct Transcript {
    entries: Vec<ChatEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// immutable snapshot in conversation order.
    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ChatEntry> {
        self.entries.last()
    }

    /// a user entry always opens a new bubble.
    pub fn append_user(&mut self, text: impl Into<String>) {
        self.entries.push(ChatEntry::user(text));
    }

    /// the merge rule: extend the trailing assistant entry, or start one when the
    /// transcript is empty or ends with the user. empty deltas contribute nothing
    /// but still open an entry if none is active.
    pub fn apply_assistant_chunk(&mut self, text_delta: &str, sources_delta: Vec<String>) {
        match self.entries.last_mut() {
            Some(last) if !last.is_from_user() => {
                last.text.push_str(text_delta);
                last.sources.extend(sources_delta);
            }
            _ => self.entries.push(ChatEntry::assistant(text_delta, sources_delta)),
        }
    }

    /// reducer entry point: fold one decoded event into the transcript.
    pub fn apply(&mut self, event: StreamEvent) {
        let (text, sources) = event.into_delta();
        self.apply_assistant_chunk(&text, sources);
    }
}
