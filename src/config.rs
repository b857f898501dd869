use bevy::prelude::*;

/// env var naming the rag backend base url.
pub const BACKEND_URL_ENV: &str = "RAG_BACKEND_URL";

/// used when the env var is absent (langserve's default port).
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// where the rag backend lives. the only externally configurable value.
#[derive(Resource, Clone, Debug, PartialEq, Eq)]
pub struct RagConfig {
    backend_url: String,
}

impl RagConfig {
    pub fn new(backend_url: impl Into<String>) -> Self {
        let backend_url = backend_url.into();
        let trimmed = backend_url.trim().trim_end_matches('/');
        let backend_url = if trimmed.is_empty() {
            DEFAULT_BACKEND_URL.to_string()
        } else {
            trimmed.to_string()
        };
        Self { backend_url }
    }

    /// native reads the env at runtime; wasm has no process env, so the value
    /// is baked in at build time.
    pub fn from_env() -> Self {
        #[cfg(not(target_arch = "wasm32"))]
        let url = std::env::var(BACKEND_URL_ENV).ok();
        #[cfg(target_arch = "wasm32")]
        let url = option_env!("RAG_BACKEND_URL").map(str::to_string);

        let cfg = Self::new(url.unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()));
        info!(target: "bevy_rag", "RagConfig: backend_url='{}'", cfg.backend_url);
        cfg
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// `POST` target for the streaming endpoint.
    pub fn stream_url(&self) -> String {
        format!("{}/rag/stream", self.backend_url)
    }

    /// download link for a cited file. `filename` must already be a bare file name.
    pub fn static_url(&self, filename: &str) -> String {
        format!("{}/rag/static/{}", self.backend_url, urlencoding::encode(filename))
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BACKEND_URL)
    }
}
