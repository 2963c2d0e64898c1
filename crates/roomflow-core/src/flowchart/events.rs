//! Flowchart lifecycle events.
//!
//! Two delivery paths:
//! - `EventBus`: long-lived named subscribers (room notifier, UI bridge).
//! - `RunListener`: a channel handed to one run at start and dropped when
//!   the run ends, so nothing global tracks per-instance callbacks.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowchartEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        instance_id: String,
        template_id: String,
    },
    #[serde(rename_all = "camelCase")]
    NodeStarted {
        instance_id: String,
        node_id: String,
        node_type: String,
        label: String,
    },
    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        instance_id: String,
        node_id: String,
        node_type: String,
        success: bool,
        output: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        instance_id: String,
        final_output: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        instance_id: String,
        node_id: Option<String>,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled { instance_id: String },
    #[serde(rename_all = "camelCase")]
    Paused { instance_id: String, node_id: String },
}

impl FlowchartEvent {
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Started { instance_id, .. }
            | Self::NodeStarted { instance_id, .. }
            | Self::NodeCompleted { instance_id, .. }
            | Self::Completed { instance_id, .. }
            | Self::Failed { instance_id, .. }
            | Self::Cancelled { instance_id }
            | Self::Paused { instance_id, .. } => instance_id,
        }
    }

    /// Whether the run that emitted this event has stopped executing.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. } | Self::Paused { .. }
        )
    }
}

pub type RunListener = mpsc::UnboundedSender<FlowchartEvent>;

/// Per-run options passed to `start_execution` / `resume_execution`.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub listener: Option<RunListener>,
    pub breakpoints: Vec<String>,
}

impl RunOptions {
    pub fn with_listener(listener: RunListener) -> Self {
        Self {
            listener: Some(listener),
            breakpoints: Vec::new(),
        }
    }
}

type Subscriber = Arc<dyn Fn(&FlowchartEvent) + Send + Sync>;

/// Named subscribers, invoked in no particular order for every event.
/// Subscribers run inline on the emitting task and must not block.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<String, Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the subscriber under `key`.
    pub async fn on<F>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(&FlowchartEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().await.insert(key.into(), Arc::new(f));
    }

    pub async fn off(&self, key: &str) -> bool {
        self.subscribers.write().await.remove(key).is_some()
    }

    pub async fn emit(&self, event: FlowchartEvent) {
        let subscribers: Vec<Subscriber> = self.subscribers.read().await.values().cloned().collect();
        for subscriber in subscribers {
            subscriber(&event);
        }
    }
}
