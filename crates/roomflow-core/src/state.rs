//! Shared application state wiring stores, engine and queue together.

use std::sync::Arc;

use crate::bridge::FlowchartQueueBridge;
use crate::completion::CompletionClients;
use crate::config::RoomflowConfig;
use crate::db::Database;
use crate::error::EngineError;
use crate::flowchart::{EventBus, FlowchartEngine, HandlerRegistry};
use crate::queue::{ChatTaskProcessor, TaskQueue};
use crate::store::{InstanceStore, TaskStore, TemplateStore};

pub struct AppStateInner {
    pub db: Database,
    pub config: RoomflowConfig,
    pub template_store: TemplateStore,
    pub instance_store: InstanceStore,
    pub task_store: TaskStore,
    pub registry: Arc<HandlerRegistry>,
    pub event_bus: EventBus,
    pub engine: FlowchartEngine,
    pub queue: TaskQueue,
    pub bridge: FlowchartQueueBridge,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Wire everything on top of `db`. Chat and flowchart processors are
    /// registered on the queue; call `queue.recover()` before enqueueing.
    pub fn new(db: Database, config: RoomflowConfig, clients: CompletionClients) -> Self {
        let settings = config.handler_settings();
        let registry = Arc::new(HandlerRegistry::with_builtins(clients.clone(), settings));
        let template_store = TemplateStore::new(db.clone()).with_validation(registry.clone());
        let instance_store = InstanceStore::new(db.clone());
        let task_store = TaskStore::new(db.clone());
        let event_bus = EventBus::new();
        let engine = FlowchartEngine::with_max_steps(
            template_store.clone(),
            instance_store.clone(),
            registry.clone(),
            event_bus.clone(),
            config.engine.max_steps,
        );
        let queue = TaskQueue::new(task_store.clone(), config.settle_delay());
        queue.register_processor(Arc::new(ChatTaskProcessor::new(clients, settings.llm_timeout)));
        let bridge = FlowchartQueueBridge::new(engine.clone(), queue.clone(), instance_store.clone());

        Self {
            db,
            config,
            template_store,
            instance_store,
            task_store,
            registry,
            event_bus,
            engine,
            queue,
            bridge,
        }
    }

    /// Open the configured database and build HTTP completion clients
    /// from the configuration.
    pub fn open(config: RoomflowConfig) -> Result<Self, EngineError> {
        let path = config.database_path();
        let db = Database::open(&path.to_string_lossy())?;
        let clients = CompletionClients::from_config(&config);
        Ok(Self::new(db, config, clients))
    }
}
