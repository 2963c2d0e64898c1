//! Flowchart automation: execution context, node handlers and the engine
//! that walks a template graph one node at a time.

pub mod context;
pub mod engine;
pub mod events;
pub mod expr;
pub mod handlers;
pub mod registry;
pub mod render;
pub mod result;
pub mod validate;

pub use context::ExecutionContext;
pub use engine::FlowchartEngine;
pub use events::{EventBus, FlowchartEvent, RunListener, RunOptions};
pub use handlers::HandlerSettings;
pub use registry::{HandlerInfo, HandlerRegistry, NodeHandler};
pub use result::{NodeResult, ValidationResult};
pub use validate::validate_definition;
