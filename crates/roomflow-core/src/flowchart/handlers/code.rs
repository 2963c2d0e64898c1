use async_trait::async_trait;
use mlua::{HookTriggers, Lua, LuaSerdeExt, VmState};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::flowchart::context::ExecutionContext;
use crate::flowchart::registry::NodeHandler;
use crate::flowchart::result::{NodeResult, ValidationResult};
use crate::models::template::{non_empty, NodeData};

/// Runs a Lua chunk with every variable bound as a global plus
/// `__instanceId`. The chunk's return value is the node output.
pub struct CodeNodeHandler {
    timeout: Duration,
}

impl CodeNodeHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Instructions between checks of the stop flag and deadline.
const HOOK_INTERVAL: u32 = 1000;

fn check_language(language: Option<&str>) -> Result<(), String> {
    match non_empty(language) {
        None => Ok(()),
        Some(l) if l.eq_ignore_ascii_case("lua") => Ok(()),
        Some(l) => Err(format!("Unsupported language '{}', only lua is supported", l)),
    }
}

struct Limits {
    interrupt: Arc<AtomicBool>,
    timeout: Duration,
}

fn run_lua(
    code: &str,
    variables: &HashMap<String, Value>,
    instance_id: &str,
    limits: Limits,
) -> mlua::Result<Value> {
    let lua = Lua::new();
    let deadline = Instant::now() + limits.timeout;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_, _| {
            if limits.interrupt.load(Ordering::SeqCst) {
                return Err(mlua::Error::runtime("stopped"));
            }
            if Instant::now() >= deadline {
                return Err(mlua::Error::runtime(format!("timed out after {:?}", limits.timeout)));
            }
            Ok(VmState::Continue)
        },
    );
    let globals = lua.globals();
    for (name, value) in variables {
        globals.set(name.as_str(), lua.to_value(value)?)?;
    }
    globals.set("__instanceId", instance_id)?;
    let result: mlua::Value = lua.load(code).set_name("code node").eval()?;
    lua.from_value(result)
}

#[async_trait]
impl NodeHandler for CodeNodeHandler {
    fn node_type(&self) -> &'static str {
        "code"
    }

    async fn execute(&self, data: &NodeData, ctx: &mut ExecutionContext) -> NodeResult {
        let Some(code) = non_empty(data.code.as_deref()) else {
            return NodeResult::failure("Code must not be empty");
        };
        if let Err(e) = check_language(data.language.as_deref()) {
            return NodeResult::failure(e);
        }

        let code = code.to_string();
        let variables = ctx.variables().clone();
        let instance_id = ctx.instance_id().to_string();
        let limits = Limits {
            interrupt: ctx.interrupt_flag(),
            timeout: self.timeout,
        };
        let outcome = tokio::task::spawn_blocking(move || {
            run_lua(&code, &variables, &instance_id, limits).map_err(|e| e.to_string())
        })
        .await
        .unwrap_or_else(|e| Err(format!("script worker failed: {}", e)));

        match outcome {
            Ok(value) => {
                tracing::info!(
                    "[Flowchart:{}] Code node executed successfully, result: {}",
                    ctx.instance_id(),
                    value
                );
                if let Some(var) = data.output_var() {
                    ctx.set(var, value.clone());
                }
                NodeResult::success(value)
            }
            Err(e) => {
                tracing::error!("[Flowchart:{}] Code execution failed: {}", ctx.instance_id(), e);
                NodeResult::failure(format!("Code execution failed: {}", e))
            }
        }
    }

    fn validate(&self, data: &NodeData) -> ValidationResult {
        let Some(code) = non_empty(data.code.as_deref()) else {
            return ValidationResult::invalid("code must not be empty");
        };
        if let Err(e) = check_language(data.language.as_deref()) {
            return ValidationResult::invalid(e);
        }
        let lua = Lua::new();
        match lua.load(code).into_function() {
            Ok(_) => ValidationResult::valid(),
            Err(e) => ValidationResult::invalid(format!("syntax error: {}", e)),
        }
    }

    fn description(&self) -> &'static str {
        "Run a Lua snippet with access to the flow variables"
    }
}
