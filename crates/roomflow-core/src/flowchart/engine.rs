//! Flowchart execution engine.
//!
//! Each run is a spawned task that owns its `ExecutionContext` and walks the
//! graph one node at a time, persisting the instance after every step.
//! Callers observe progress through the `EventBus`, an optional per-run
//! listener channel, or the persisted instance. Nothing blocks on a run.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::events::{EventBus, FlowchartEvent, RunListener, RunOptions};
use super::registry::{NodeHandler, HandlerRegistry};
use super::render::value_to_string;
use super::result::NodeResult;
use crate::error::EngineError;
use crate::models::instance::{CreateInstanceInput, ExecutionStatus, FlowchartInstance, NodeExecution};
use crate::models::template::{ErrorPolicy, FlowchartTemplate, Node};
use crate::store::{InstanceStore, TemplateStore};

const DEFAULT_MAX_STEPS: usize = 1000;

/// Signals shared between a live run and the engine handle. An entry in
/// `runs` is the claim on an instance: it exists from the moment a start,
/// resume or orphan stop begins until that operation has fully finished.
struct RunControl {
    cancel: watch::Sender<bool>,
    interrupt: Arc<AtomicBool>,
    pause: AtomicBool,
    done: watch::Sender<bool>,
}

impl RunControl {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            cancel,
            interrupt: Arc::new(AtomicBool::new(false)),
            pause: AtomicBool::new(false),
            done,
        }
    }

    fn request_stop(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.cancel.send_replace(true);
    }
}

/// How a run left the loop.
enum Outcome {
    Completed(Value),
    Failed { node_id: String, error: String },
    Cancelled,
    Paused(String),
}

enum Step {
    Finished(NodeResult),
    Interrupted,
}

struct EngineInner {
    templates: TemplateStore,
    instances: InstanceStore,
    registry: Arc<HandlerRegistry>,
    events: EventBus,
    runs: Mutex<HashMap<String, Arc<RunControl>>>,
    max_steps: usize,
}

#[derive(Clone)]
pub struct FlowchartEngine {
    inner: Arc<EngineInner>,
}

impl FlowchartEngine {
    pub fn new(
        templates: TemplateStore,
        instances: InstanceStore,
        registry: Arc<HandlerRegistry>,
        events: EventBus,
    ) -> Self {
        Self::with_max_steps(templates, instances, registry, events, DEFAULT_MAX_STEPS)
    }

    /// `max_steps` bounds node visits per run so a cyclic graph fails
    /// instead of spinning forever.
    pub fn with_max_steps(
        templates: TemplateStore,
        instances: InstanceStore,
        registry: Arc<HandlerRegistry>,
        events: EventBus,
        max_steps: usize,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                templates,
                instances,
                registry,
                events,
                runs: Mutex::new(HashMap::new()),
                max_steps,
            }),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<FlowchartInstance>, EngineError> {
        self.inner.instances.get(instance_id).await
    }

    /// Whether a run for this instance is live in this process.
    pub fn is_running(&self, instance_id: &str) -> bool {
        self.runs().contains_key(instance_id)
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RunControl>>> {
        self.inner.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve the instance for this caller. `None` if someone else holds it.
    fn claim(&self, instance_id: &str) -> Option<Arc<RunControl>> {
        let mut runs = self.runs();
        if runs.contains_key(instance_id) {
            return None;
        }
        let control = Arc::new(RunControl::new());
        runs.insert(instance_id.to_string(), control.clone());
        Some(control)
    }

    fn release(&self, instance_id: &str, control: &RunControl) {
        self.runs().remove(instance_id);
        control.done.send_replace(true);
    }

    fn already_running(instance_id: &str) -> EngineError {
        EngineError::IllegalState(format!("Instance {} is already running", instance_id))
    }

    // ── Lifecycle operations ────────────────────────────────────────────

    /// Create a PENDING instance of the latest version of a template.
    pub async fn create_instance(&self, input: CreateInstanceInput) -> Result<FlowchartInstance, EngineError> {
        let template = self
            .inner
            .templates
            .get_latest(&input.template_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Template not found: {}", input.template_id)))?;

        if let Some(room) = &input.room_id {
            if !template.is_visible_in(room) {
                return Err(EngineError::Validation(format!(
                    "Template {} is not available in room {}",
                    template.template_id, room
                )));
            }
        }

        let missing: Vec<&str> = template
            .variables
            .iter()
            .filter(|def| def.required && def.default_value.as_ref().map_or(true, Value::is_null))
            .filter(|def| input.variables.get(&def.name).map_or(true, Value::is_null))
            .map(|def| def.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "Missing required variables: {}",
                missing.join(", ")
            )));
        }

        let now = Utc::now();
        let instance = FlowchartInstance {
            instance_id: Uuid::new_v4().to_string(),
            template_id: template.template_id.clone(),
            template_version: template.version,
            template_name: template.name.clone(),
            room_id: input.room_id,
            status: ExecutionStatus::Pending,
            current_node_id: None,
            variables: input.variables,
            node_executions: Vec::new(),
            outputs: HashMap::new(),
            final_output: None,
            error_message: None,
            error_node_id: None,
            task_queue_id: None,
            triggered_by: input.triggered_by,
            triggered_by_message_id: input.triggered_by_message_id,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.instances.save(&instance).await?;
        tracing::info!(
            "[Flowchart:{}] Created instance of {} v{}",
            instance.instance_id,
            instance.template_id,
            instance.template_version
        );
        Ok(instance)
    }

    /// Move a PENDING instance to RUNNING and run it in the background.
    pub async fn start_execution(&self, instance_id: &str, options: RunOptions) -> Result<(), EngineError> {
        let control = self.claim(instance_id).ok_or_else(|| Self::already_running(instance_id))?;
        match self.prepare_start(instance_id, &options).await {
            Ok((instance, template)) => {
                self.spawn_run(instance, template, options, None, control);
                Ok(())
            }
            Err(e) => {
                self.release(instance_id, &control);
                Err(e)
            }
        }
    }

    async fn prepare_start(
        &self,
        instance_id: &str,
        options: &RunOptions,
    ) -> Result<(FlowchartInstance, Arc<FlowchartTemplate>), EngineError> {
        let mut instance = self.load(instance_id).await?;
        if instance.status != ExecutionStatus::Pending {
            return Err(EngineError::IllegalState(format!(
                "Instance {} is {}, expected PENDING",
                instance_id,
                instance.status.as_str()
            )));
        }
        let template = self.template_for(&instance).await?;

        instance.status = ExecutionStatus::Running;
        instance.started_at = Some(Utc::now());
        self.inner.instances.save(&instance).await?;
        tracing::info!("[Flowchart:{}] Execution started", instance_id);
        self.emit(
            options.listener.as_ref(),
            FlowchartEvent::Started {
                instance_id: instance.instance_id.clone(),
                template_id: instance.template_id.clone(),
            },
        )
        .await;
        Ok((instance, template))
    }

    /// Continue a PAUSED instance, or one left RUNNING by a previous
    /// process, from its current node.
    pub async fn resume_execution(&self, instance_id: &str, options: RunOptions) -> Result<(), EngineError> {
        let control = self.claim(instance_id).ok_or_else(|| Self::already_running(instance_id))?;
        match self.prepare_resume(instance_id).await {
            Ok((instance, template)) => {
                let resume_at = instance.current_node_id.clone();
                self.spawn_run(instance, template, options, resume_at, control);
                Ok(())
            }
            Err(e) => {
                self.release(instance_id, &control);
                Err(e)
            }
        }
    }

    /// Only called with the claim held, so a RUNNING status here has no
    /// live run behind it.
    async fn prepare_resume(
        &self,
        instance_id: &str,
    ) -> Result<(FlowchartInstance, Arc<FlowchartTemplate>), EngineError> {
        let mut instance = self.load(instance_id).await?;
        let orphaned = instance.status == ExecutionStatus::Running;
        if instance.status != ExecutionStatus::Paused && !orphaned {
            return Err(EngineError::IllegalState(format!(
                "Instance {} is {}, expected PAUSED",
                instance_id,
                instance.status.as_str()
            )));
        }
        let template = self.template_for(&instance).await?;

        close_open_execution(&mut instance, "Interrupted before completion");
        instance.status = ExecutionStatus::Running;
        if instance.started_at.is_none() {
            instance.started_at = Some(Utc::now());
        }
        self.inner.instances.save(&instance).await?;
        tracing::info!(
            "[Flowchart:{}] Execution resumed at {:?}",
            instance_id,
            instance.current_node_id
        );
        Ok((instance, template))
    }

    /// Stop a RUNNING instance. Idempotent: any other status is left alone.
    /// Returns once the instance is persisted as CANCELLED (or finished on
    /// its own).
    pub async fn stop_execution(&self, instance_id: &str) -> Result<(), EngineError> {
        loop {
            let live = self.runs().get(instance_id).cloned();
            if let Some(control) = live {
                let mut done = control.done.subscribe();
                control.request_stop();
                tracing::info!("[Flowchart:{}] Stop requested", instance_id);
                while !*done.borrow_and_update() {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
                return Ok(());
            }

            // Lost a race with a start or resume; signal that one instead.
            let Some(control) = self.claim(instance_id) else {
                tokio::task::yield_now().await;
                continue;
            };
            let result = self.cancel_orphan(instance_id).await;
            self.release(instance_id, &control);
            return result;
        }
    }

    /// Cancel an instance persisted as RUNNING with no live run. Called
    /// with the claim held.
    async fn cancel_orphan(&self, instance_id: &str) -> Result<(), EngineError> {
        let mut instance = self.load(instance_id).await?;
        if instance.status != ExecutionStatus::Running {
            return Ok(());
        }
        // RUNNING with no live run: left over from a previous process.
        close_open_execution(&mut instance, "Cancelled");
        instance.status = ExecutionStatus::Cancelled;
        instance.stamp_completion();
        self.inner.instances.save(&instance).await?;
        tracing::info!("[Flowchart:{}] Execution cancelled", instance_id);
        self.emit(
            None,
            FlowchartEvent::Cancelled {
                instance_id: instance_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Ask a live run to pause before its next node. Returns false when the
    /// instance has no live run.
    pub fn pause_execution(&self, instance_id: &str) -> bool {
        match self.runs().get(instance_id) {
            Some(control) => {
                control.pause.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    async fn load(&self, instance_id: &str) -> Result<FlowchartInstance, EngineError> {
        self.inner
            .instances
            .get(instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Instance not found: {}", instance_id)))
    }

    async fn template_for(&self, instance: &FlowchartInstance) -> Result<Arc<FlowchartTemplate>, EngineError> {
        self.inner
            .templates
            .get_version(&instance.template_id, instance.template_version)
            .await?
            .map(Arc::new)
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "Template {} v{} not found",
                    instance.template_id, instance.template_version
                ))
            })
    }

    async fn emit(&self, listener: Option<&RunListener>, event: FlowchartEvent) {
        if let Some(listener) = listener {
            let _ = listener.send(event.clone());
        }
        self.inner.events.emit(event).await;
    }

    // ── Run task ────────────────────────────────────────────────────────

    fn spawn_run(
        &self,
        instance: FlowchartInstance,
        template: Arc<FlowchartTemplate>,
        options: RunOptions,
        resume_at: Option<String>,
        control: Arc<RunControl>,
    ) {
        let instance_id = instance.instance_id.clone();
        let cancel_rx = control.cancel.subscribe();

        let mut ctx = ExecutionContext::from_instance(instance, template);
        ctx.set_interrupt(control.interrupt.clone());
        for node_id in &options.breakpoints {
            ctx.add_breakpoint(node_id.clone());
        }
        let listener = options.listener;

        let engine = self.clone();
        let run_control = control.clone();
        let run_listener = listener.clone();
        let run = tokio::spawn(async move {
            engine
                .run(ctx, cancel_rx, &run_control, run_listener.as_ref(), resume_at)
                .await;
        });

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(join_error) = run.await {
                tracing::error!(
                    "[Flowchart:{}] Run task aborted: {}",
                    instance_id,
                    join_error
                );
                engine
                    .fail_aborted(&instance_id, join_error.to_string(), listener.as_ref())
                    .await;
            }
            engine.release(&instance_id, &control);
        });
    }

    async fn run(
        &self,
        mut ctx: ExecutionContext,
        mut cancel: watch::Receiver<bool>,
        control: &RunControl,
        listener: Option<&RunListener>,
        resume_at: Option<String>,
    ) {
        let outcome = self
            .drive(&mut ctx, &mut cancel, control, listener, resume_at)
            .await;
        self.finish(ctx, outcome, listener).await;
    }

    async fn drive(
        &self,
        ctx: &mut ExecutionContext,
        cancel: &mut watch::Receiver<bool>,
        control: &RunControl,
        listener: Option<&RunListener>,
        resume_at: Option<String>,
    ) -> Result<Outcome, EngineError> {
        let mut current = match resume_at {
            Some(node_id) => node_id,
            None => ctx
                .find_start_node()
                .map(|n| n.id.clone())
                .ok_or_else(|| EngineError::IllegalState("Template has no start node".to_string()))?,
        };

        let mut steps = 0usize;
        loop {
            if *cancel.borrow() {
                return Ok(Outcome::Cancelled);
            }
            if control.pause.swap(false, Ordering::SeqCst) {
                ctx.pause();
            }
            // Breakpoints never fire on the node a run starts or resumes at.
            if steps > 0 && ctx.has_breakpoint(&current) {
                ctx.pause();
            }
            if ctx.is_paused() {
                return Ok(Outcome::Paused(current));
            }

            steps += 1;
            if steps > self.inner.max_steps {
                return Err(EngineError::IllegalState(format!(
                    "Exceeded {} steps; the graph may contain a cycle",
                    self.inner.max_steps
                )));
            }

            let node = ctx
                .find_node(&current)
                .cloned()
                .ok_or_else(|| EngineError::IllegalState(format!("Node not found: {}", current)))?;
            ctx.current_node_id = Some(node.id.clone());
            ctx.instance_mut().current_node_id = Some(node.id.clone());
            let handler = self.inner.registry.get(&node.node_type)?;
            let policy = node.data.error_policy();

            let mut attempt = 0u32;
            let result = loop {
                match self
                    .execute_node(ctx, &node, handler.as_ref(), attempt, cancel, listener)
                    .await?
                {
                    Step::Interrupted => return Ok(Outcome::Cancelled),
                    Step::Finished(r) => match policy {
                        ErrorPolicy::Retry(max) if !r.success && attempt < max => {
                            attempt += 1;
                            tracing::warn!(
                                "[Flowchart:{}] Node {} failed, retry {}/{}",
                                ctx.instance_id(),
                                node.id,
                                attempt,
                                max
                            );
                        }
                        _ => break r,
                    },
                }
            };

            if !result.success {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "Node execution failed".to_string());
                if policy != ErrorPolicy::Continue {
                    return Ok(Outcome::Failed {
                        node_id: node.id.clone(),
                        error,
                    });
                }
                tracing::warn!(
                    "[Flowchart:{}] Node {} failed, continuing: {}",
                    ctx.instance_id(),
                    node.id,
                    error
                );
            }

            if let Some(next) = result.next_node_id {
                current = next;
                continue;
            }
            if node.node_type == "end" || (result.success && !result.should_continue) {
                return Ok(Outcome::Completed(result.output));
            }
            match ctx.find_default_edge(&node.id)? {
                Some(edge) => current = edge.target.clone(),
                None => return Ok(Outcome::Completed(result.output)),
            }
        }
    }

    async fn execute_node(
        &self,
        ctx: &mut ExecutionContext,
        node: &Node,
        handler: &dyn NodeHandler,
        attempt: u32,
        cancel: &mut watch::Receiver<bool>,
        listener: Option<&RunListener>,
    ) -> Result<Step, EngineError> {
        let input_snapshot = serde_json::to_string(ctx.variables())?;
        let mut execution = NodeExecution::open(&node.id, &node.node_type, node.label(), input_snapshot);
        execution.retry_count = attempt;
        ctx.instance_mut().node_executions.push(execution);
        self.inner.instances.save(ctx.instance()).await?;
        self.emit(
            listener,
            FlowchartEvent::NodeStarted {
                instance_id: ctx.instance_id().to_string(),
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                label: node.label().to_string(),
            },
        )
        .await;

        tracing::info!(
            "[Flowchart:{}] Executing node {} ({})",
            ctx.instance_id(),
            node.id,
            node.node_type
        );
        ctx.push_call(node.id.clone());
        let outcome = tokio::select! {
            result = handler.execute(&node.data, ctx) => Some(result),
            _ = cancelled(cancel) => None,
        };
        ctx.pop_call();
        ctx.commit_variables();
        let output_snapshot = serde_json::to_string(ctx.variables())?;

        let Some(result) = outcome else {
            if let Some(exec) = ctx.instance_mut().node_executions.last_mut() {
                exec.output_snapshot = Some(output_snapshot);
                exec.error = Some("Interrupted by stop request".to_string());
                exec.close(ExecutionStatus::Failed);
            }
            self.inner.instances.save(ctx.instance()).await?;
            return Ok(Step::Interrupted);
        };

        if let Some(exec) = ctx.instance_mut().node_executions.last_mut() {
            exec.output_snapshot = Some(output_snapshot);
            exec.result = Some(value_to_string(&result.output));
            exec.logs = result.logs.clone();
            exec.error = result.error.clone();
            exec.close(if result.success {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            });
        }
        self.inner.instances.save(ctx.instance()).await?;

        if result.success {
            self.emit(
                listener,
                FlowchartEvent::NodeCompleted {
                    instance_id: ctx.instance_id().to_string(),
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    success: true,
                    output: result.output.clone(),
                    error: None,
                },
            )
            .await;
        } else {
            tracing::warn!(
                "[Flowchart:{}] Node {} failed: {}",
                ctx.instance_id(),
                node.id,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(Step::Finished(result))
    }

    /// Persist the terminal (or paused) state of a run and announce it.
    async fn finish(
        &self,
        mut ctx: ExecutionContext,
        outcome: Result<Outcome, EngineError>,
        listener: Option<&RunListener>,
    ) {
        ctx.commit_variables();
        let instance_id = ctx.instance_id().to_string();
        let current_node = ctx.current_node_id.clone();
        let outputs = ctx.variables().clone();
        let instance = ctx.instance_mut();

        let event = match outcome {
            Ok(Outcome::Completed(output)) => {
                let final_output = Some(value_to_string(&output)).filter(|s| !s.is_empty());
                instance.status = ExecutionStatus::Completed;
                instance.final_output = final_output.clone();
                instance.outputs = outputs;
                instance.stamp_completion();
                tracing::info!(
                    "[Flowchart:{}] Execution completed in {}ms",
                    instance_id,
                    instance.duration_ms.unwrap_or(0)
                );
                FlowchartEvent::Completed {
                    instance_id: instance_id.clone(),
                    final_output,
                }
            }
            Ok(Outcome::Failed { node_id, error }) => {
                instance.status = ExecutionStatus::Failed;
                instance.error_message = Some(error.clone());
                instance.error_node_id = Some(node_id.clone());
                instance.stamp_completion();
                tracing::warn!("[Flowchart:{}] Execution failed at {}: {}", instance_id, node_id, error);
                FlowchartEvent::Failed {
                    instance_id: instance_id.clone(),
                    node_id: Some(node_id),
                    error,
                }
            }
            Ok(Outcome::Cancelled) => {
                instance.status = ExecutionStatus::Cancelled;
                instance.stamp_completion();
                tracing::info!("[Flowchart:{}] Execution cancelled", instance_id);
                FlowchartEvent::Cancelled {
                    instance_id: instance_id.clone(),
                }
            }
            Ok(Outcome::Paused(node_id)) => {
                instance.status = ExecutionStatus::Paused;
                instance.current_node_id = Some(node_id.clone());
                tracing::info!("[Flowchart:{}] Execution paused before {}", instance_id, node_id);
                FlowchartEvent::Paused {
                    instance_id: instance_id.clone(),
                    node_id,
                }
            }
            Err(e) => {
                let error = e.to_string();
                close_open_execution(instance, &error);
                instance.status = ExecutionStatus::Failed;
                instance.error_message = Some(error.clone());
                instance.error_node_id = current_node.clone();
                instance.stamp_completion();
                tracing::error!("[Flowchart:{}] Execution error: {}", instance_id, error);
                FlowchartEvent::Failed {
                    instance_id: instance_id.clone(),
                    node_id: current_node,
                    error,
                }
            }
        };

        if let Err(e) = self.inner.instances.save(ctx.instance()).await {
            tracing::error!("[Flowchart:{}] Failed to persist final state: {}", instance_id, e);
        }
        self.emit(listener, event).await;
    }

    /// The run task panicked; record it from the last persisted state.
    async fn fail_aborted(&self, instance_id: &str, error: String, listener: Option<&RunListener>) {
        let mut instance = match self.inner.instances.get(instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("[Flowchart:{}] Failed to load after abort: {}", instance_id, e);
                return;
            }
        };
        if instance.status.is_terminal() {
            return;
        }
        let error = format!("Execution aborted: {}", error);
        close_open_execution(&mut instance, &error);
        instance.status = ExecutionStatus::Failed;
        instance.error_message = Some(error.clone());
        instance.error_node_id = instance.current_node_id.clone();
        instance.stamp_completion();
        if let Err(e) = self.inner.instances.save(&instance).await {
            tracing::error!("[Flowchart:{}] Failed to persist abort: {}", instance_id, e);
        }
        self.emit(
            listener,
            FlowchartEvent::Failed {
                instance_id: instance_id.to_string(),
                node_id: instance.current_node_id.clone(),
                error,
            },
        )
        .await;
    }
}

/// Close the trailing node execution if a crash or stop left it open.
fn close_open_execution(instance: &mut FlowchartInstance, error: &str) {
    if let Some(exec) = instance.node_executions.last_mut() {
        if !exec.is_closed() {
            exec.error = Some(error.to_string());
            exec.close(ExecutionStatus::Failed);
        }
    }
}

/// Resolves once the cancel flag is raised. Never resolves if the sender
/// is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionClients;
    use crate::db::Database;
    use crate::flowchart::handlers::HandlerSettings;
    use crate::models::template::CreateTemplateInput;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn setup() -> (FlowchartEngine, TemplateStore, InstanceStore) {
        let db = Database::open_in_memory().unwrap();
        let registry = Arc::new(HandlerRegistry::with_builtins(
            CompletionClients::new(),
            HandlerSettings::default(),
        ));
        let templates = TemplateStore::new(db.clone()).with_validation(registry.clone());
        let instances = InstanceStore::new(db);
        let engine = FlowchartEngine::new(templates.clone(), instances.clone(), registry, EventBus::new());
        (engine, templates, instances)
    }

    async fn publish(templates: &TemplateStore, definition: Value, variables: Value) -> String {
        let input: CreateTemplateInput = serde_json::from_value(json!({
            "name": "t",
            "definition": definition,
            "variables": variables,
        }))
        .unwrap();
        templates.create(input).await.unwrap().template_id
    }

    async fn run_to_end(engine: &FlowchartEngine, instance_id: &str) -> Vec<FlowchartEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .start_execution(instance_id, RunOptions::with_listener(tx))
            .await
            .unwrap();
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
        {
            let ends = event.ends_run();
            events.push(event);
            if ends {
                break;
            }
        }
        events
    }

    fn linear(middle: Value) -> Value {
        json!({
            "nodes": [
                { "id": "s", "type": "start" },
                middle,
                { "id": "e", "type": "end", "data": { "outputVar": "out" } }
            ],
            "edges": [
                { "id": "1", "source": "s", "target": "m" },
                { "id": "2", "source": "m", "target": "e" }
            ]
        })
    }

    #[tokio::test]
    async fn test_run_completes_and_records_history() {
        let (engine, templates, instances) = setup().await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "variable", "data": { "varName": "out", "varValue": "{{who}}!" } })),
            json!([{ "name": "who", "defaultValue": "world" }]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                ..Default::default()
            })
            .await
            .unwrap();

        let events = run_to_end(&engine, &inst.instance_id).await;
        assert!(matches!(events.first(), Some(FlowchartEvent::Started { .. })));
        assert!(matches!(
            events.last(),
            Some(FlowchartEvent::Completed { final_output: Some(out), .. }) if out == "world!"
        ));

        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.node_executions.len(), 3);
        assert!(stored.node_executions.iter().all(|e| e.is_closed()));
        assert_eq!(stored.outputs.get("out"), Some(&json!("world!")));
        assert!(stored.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_failed_step_marks_instance_failed() {
        let (engine, templates, instances) = setup().await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "code", "data": { "code": "error('nope')" } })),
            json!([]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                ..Default::default()
            })
            .await
            .unwrap();

        let events = run_to_end(&engine, &inst.instance_id).await;
        assert!(matches!(events.last(), Some(FlowchartEvent::Failed { .. })));
        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert_eq!(stored.error_node_id.as_deref(), Some("m"));
        assert!(stored.error_message.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_continue_policy_moves_past_failure() {
        let (engine, templates, instances) = setup().await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "code", "data": { "code": "error('x')", "onError": "retry", "retryCount": 2 } })),
            json!([]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        run_to_end(&engine, &inst.instance_id).await;
        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        let attempts: Vec<u32> = stored
            .node_executions
            .iter()
            .filter(|e| e.node_id == "m")
            .map(|e| e.retry_count)
            .collect();
        assert_eq!(attempts, vec![0, 1, 2]);
        assert_eq!(stored.status, ExecutionStatus::Failed);

        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "code", "data": { "code": "error('x')", "stopOnError": false } })),
            json!([]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                ..Default::default()
            })
            .await
            .unwrap();
        run_to_end(&engine, &inst.instance_id).await;
        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_requires_pending_and_required_vars() {
        let (engine, templates, _) = setup().await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "variable", "data": { "varName": "out", "varValue": "{{x}}" } })),
            json!([{ "name": "x", "required": true }]),
        )
        .await;
        let err = engine
            .create_instance(CreateInstanceInput {
                template_id: tid.clone(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                variables: HashMap::from([("x".to_string(), json!(1))]),
                ..Default::default()
            })
            .await
            .unwrap();
        run_to_end(&engine, &inst.instance_id).await;
        let again = engine
            .start_execution(&inst.instance_id, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(again, EngineError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_stop_during_wait_cancels() {
        let (engine, templates, instances) = setup().await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "wait", "data": { "waitSeconds": 30 } })),
            json!([]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                ..Default::default()
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .start_execution(&inst.instance_id, RunOptions::with_listener(tx))
            .await
            .unwrap();
        loop {
            match rx.recv().await {
                Some(FlowchartEvent::NodeStarted { node_id, .. }) if node_id == "m" => break,
                Some(_) => continue,
                None => panic!("run ended early"),
            }
        }
        engine.stop_execution(&inst.instance_id).await.unwrap();

        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        let wait = stored.node_execution("m").unwrap();
        assert_eq!(wait.status, ExecutionStatus::Failed);
        assert!(!engine.is_running(&inst.instance_id));

        // Stopping again is a no-op.
        engine.stop_execution(&inst.instance_id).await.unwrap();
        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_run_the_instance_once() {
        let (engine, templates, instances) = setup().await;
        let started = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = started.clone();
        engine
            .events()
            .on("count-starts", move |e| {
                if matches!(e, FlowchartEvent::Started { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "variable", "data": { "varName": "out", "varValue": "x" } })),
            json!([]),
        )
        .await;

        for _ in 0..10 {
            let inst = engine
                .create_instance(CreateInstanceInput {
                    template_id: tid.clone(),
                    ..Default::default()
                })
                .await
                .unwrap();
            let (a, b) = tokio::join!(
                engine.start_execution(&inst.instance_id, RunOptions::default()),
                engine.start_execution(&inst.instance_id, RunOptions::default())
            );
            assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
            assert!(matches!(a.err().or(b.err()), Some(EngineError::IllegalState(_))));

            while engine.is_running(&inst.instance_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
            assert_eq!(stored.status, ExecutionStatus::Completed);
            assert_eq!(stored.node_executions.len(), 3);
        }
        assert_eq!(started.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_while_start_is_announced_stays_cancelled() {
        let (engine, templates, instances) = setup().await;
        let announcing = Arc::new(tokio::sync::Notify::new());
        let signal = announcing.clone();
        engine
            .events()
            .on("slow-subscriber", move |e| {
                if matches!(e, FlowchartEvent::Started { .. }) {
                    signal.notify_one();
                    std::thread::sleep(Duration::from_millis(300));
                }
            })
            .await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "variable", "data": { "varName": "out", "varValue": "x" } })),
            json!([]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                ..Default::default()
            })
            .await
            .unwrap();

        let starter = {
            let engine = engine.clone();
            let id = inst.instance_id.clone();
            tokio::spawn(async move { engine.start_execution(&id, RunOptions::default()).await })
        };
        announcing.notified().await;
        engine.stop_execution(&inst.instance_id).await.unwrap();
        starter.await.unwrap().unwrap();

        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert!(stored.final_output.is_none());
        assert!(!engine.is_running(&inst.instance_id));
    }

    #[tokio::test]
    async fn test_stop_interrupts_running_script() {
        let (engine, templates, instances) = setup().await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "code", "data": { "code": "while true do end" } })),
            json!([]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                ..Default::default()
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .start_execution(&inst.instance_id, RunOptions::with_listener(tx))
            .await
            .unwrap();
        loop {
            match rx.recv().await {
                Some(FlowchartEvent::NodeStarted { node_id, .. }) if node_id == "m" => break,
                Some(_) => continue,
                None => panic!("run ended early"),
            }
        }
        engine.stop_execution(&inst.instance_id).await.unwrap();
        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_breakpoint_pauses_and_resume_finishes() {
        let (engine, templates, instances) = setup().await;
        let tid = publish(
            &templates,
            linear(json!({ "id": "m", "type": "variable", "data": { "varName": "out", "varValue": "done" } })),
            json!([]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                ..Default::default()
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .start_execution(
                &inst.instance_id,
                RunOptions {
                    listener: Some(tx),
                    breakpoints: vec!["m".to_string()],
                },
            )
            .await
            .unwrap();
        let mut paused_at = None;
        while let Some(event) = rx.recv().await {
            if let FlowchartEvent::Paused { node_id, .. } = event {
                paused_at = Some(node_id);
                break;
            }
        }
        assert_eq!(paused_at.as_deref(), Some("m"));
        // Wait for the run task to release its slot.
        while engine.is_running(&inst.instance_id) {
            tokio::task::yield_now().await;
        }
        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Paused);

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .resume_execution(&inst.instance_id, RunOptions::with_listener(tx))
            .await
            .unwrap();
        let mut last = None;
        while let Some(event) = rx.recv().await {
            let ends = event.ends_run();
            last = Some(event);
            if ends {
                break;
            }
        }
        assert!(matches!(last, Some(FlowchartEvent::Completed { .. })));
        let stored = instances.get(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(stored.final_output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_cycle_hits_step_limit() {
        let db = Database::open_in_memory().unwrap();
        let registry = Arc::new(HandlerRegistry::with_builtins(
            CompletionClients::new(),
            HandlerSettings::default(),
        ));
        let templates = TemplateStore::new(db.clone()).with_validation(registry.clone());
        let instances = InstanceStore::new(db);
        let engine = FlowchartEngine::with_max_steps(
            templates.clone(),
            instances.clone(),
            registry,
            EventBus::new(),
            20,
        );
        let tid = publish(
            &templates,
            json!({
                "nodes": [
                    { "id": "s", "type": "start" },
                    { "id": "m", "type": "variable", "data": { "varName": "n", "varValue": "1" } }
                ],
                "edges": [
                    { "id": "1", "source": "s", "target": "m" },
                    { "id": "2", "source": "m", "target": "s" }
                ]
            }),
            json!([]),
        )
        .await;
        let inst = engine
            .create_instance(CreateInstanceInput {
                template_id: tid,
                ..Default::default()
            })
            .await
            .unwrap();
        let events = run_to_end(&engine, &inst.instance_id).await;
        assert!(matches!(
            events.last(),
            Some(FlowchartEvent::Failed { error, .. }) if error.contains("Exceeded 20 steps")
        ));
    }
}
