//! small pure rules behind the chat view.

use crate::config::RagConfig;

/// trimmed question, or `None` when nothing is left to send.
pub fn prepare_question(input: &str) -> Option<String> {
    let trimmed = input.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// display name of a cited source: its last `/` segment.
/// a path ending in `/` has an empty label.
pub fn source_label(source: &str) -> &str {
    source.rsplit('/').next().unwrap_or_default()
}

/// a rendered citation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLink {
    pub label: String,
    pub url: String,
}

impl SourceLink {
    pub fn new(config: &RagConfig, source: &str) -> Self {
        let label = source_label(source);
        Self { label: label.to_string(), url: config.static_url(label) }
    }
}
