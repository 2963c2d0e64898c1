//! Text-completion collaborators: one client per backing assistant.
//!
//! The engine and the chat task processor only see `CompletionClient`.
//! Provider selection and wire framing live behind it.

mod http;

pub use http::HttpCompletionClient;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RoomflowConfig;
use crate::models::task::AssistantKind;

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("assistant did not finish its reply")]
    Incomplete,
    #[error("failed to decode response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation key; flowchart steps use the instance id.
    pub session_id: String,
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    pub timeout: Duration,
    pub user_id: String,
    pub user_name: String,
}

impl CompletionRequest {
    pub fn new(session_id: impl Into<String>, user_prompt: impl Into<String>, timeout: Duration) -> Self {
        let session_id = session_id.into();
        Self {
            user_id: format!("flowchart-{}", session_id),
            user_name: "Flowchart".to_string(),
            session_id,
            system_prompt: None,
            user_prompt: user_prompt.into(),
            timeout,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt.filter(|s| !s.trim().is_empty());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: String,
    pub completed: bool,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError>;
}

/// Clients keyed by the assistant they reach.
#[derive(Clone, Default)]
pub struct CompletionClients {
    clients: HashMap<AssistantKind, Arc<dyn CompletionClient>>,
}

impl CompletionClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP clients for every assistant listed in the configuration.
    pub fn from_config(config: &RoomflowConfig) -> Self {
        let mut clients = Self::new();
        for (kind, assistant) in &config.assistants {
            tracing::info!(
                "[CompletionClient] Configured {} via {} ({})",
                kind,
                assistant.adapter,
                assistant.model
            );
            clients.insert(*kind, Arc::new(HttpCompletionClient::new(assistant.clone())));
        }
        clients
    }

    pub fn with(mut self, kind: AssistantKind, client: Arc<dyn CompletionClient>) -> Self {
        self.insert(kind, client);
        self
    }

    pub fn insert(&mut self, kind: AssistantKind, client: Arc<dyn CompletionClient>) {
        self.clients.insert(kind, client);
    }

    pub fn get(&self, kind: AssistantKind) -> Option<Arc<dyn CompletionClient>> {
        self.clients.get(&kind).cloned()
    }

    /// Send `request` to the `kind` client, bounded by `request.timeout`.
    pub async fn complete(
        &self,
        kind: AssistantKind,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let client = self.get(kind).ok_or_else(|| {
            CompletionError::Transport(format!("no completion client configured for {}", kind))
        })?;
        let timeout = request.timeout;
        match tokio::time::timeout(timeout, client.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(timeout)),
        }
    }
}
