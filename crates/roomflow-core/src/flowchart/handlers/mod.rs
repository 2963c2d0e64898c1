//! Built-in node handlers.

use std::sync::Arc;
use std::time::Duration;

use super::registry::NodeHandler;
use crate::completion::CompletionClients;

mod code;
mod completion_check;
mod condition;
mod end;
mod llm;
mod openclaw;
mod start;
mod variable;
mod wait;

pub use code::CodeNodeHandler;
pub use completion_check::CompletionCheckNodeHandler;
pub use condition::ConditionNodeHandler;
pub use end::EndNodeHandler;
pub use llm::LlmNodeHandler;
pub use openclaw::OpenClawNodeHandler;
pub use start::StartNodeHandler;
pub use variable::VariableNodeHandler;
pub use wait::WaitNodeHandler;

/// Timeouts applied by the assistant-calling handlers.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    pub llm_timeout: Duration,
    pub check_timeout: Duration,
    pub code_timeout: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_secs(300),
            check_timeout: Duration::from_secs(60),
            code_timeout: Duration::from_secs(30),
        }
    }
}

pub fn builtin_handlers(clients: CompletionClients, settings: HandlerSettings) -> Vec<Arc<dyn NodeHandler>> {
    vec![
        Arc::new(StartNodeHandler),
        Arc::new(EndNodeHandler),
        Arc::new(VariableNodeHandler),
        Arc::new(ConditionNodeHandler),
        Arc::new(WaitNodeHandler),
        Arc::new(CodeNodeHandler::new(settings.code_timeout)),
        Arc::new(LlmNodeHandler::new(clients.clone(), settings.llm_timeout)),
        Arc::new(OpenClawNodeHandler::new(clients.clone(), settings.llm_timeout)),
        Arc::new(CompletionCheckNodeHandler::new(clients, settings.check_timeout)),
    ]
}
