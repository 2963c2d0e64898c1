//! `roomflow instance` — Run and inspect flowchart instances.

use roomflow_core::flowchart::{FlowchartEvent, RunOptions};
use roomflow_core::models::{CreateInstanceInput, ExecutionStatus, FlowchartInstance};
use roomflow_core::state::AppState;
use serde_json::json;
use tokio::sync::mpsc;

use super::{parse_vars, print_json};

/// Print events as they arrive until the run stops executing.
async fn follow(mut events: mpsc::UnboundedReceiver<FlowchartEvent>, verbose: bool) {
    while let Some(event) = events.recv().await {
        match &event {
            FlowchartEvent::NodeStarted { node_id, label, .. } => {
                println!("▶ {} ({})", label, node_id);
            }
            FlowchartEvent::NodeCompleted {
                node_id, success, error, ..
            } => {
                if *success {
                    println!("  ✓ {}", node_id);
                } else {
                    println!("  ✗ {}: {}", node_id, error.as_deref().unwrap_or("failed"));
                }
            }
            FlowchartEvent::Paused { node_id, .. } => println!("⏸ Paused before {}", node_id),
            _ => {}
        }
        if verbose {
            if let Ok(raw) = serde_json::to_string(&event) {
                println!("  {}", raw);
            }
        }
        if event.ends_run() {
            break;
        }
    }
}

async fn load(state: &AppState, instance_id: &str) -> Result<FlowchartInstance, String> {
    state
        .engine
        .get_instance(instance_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Instance not found: {}", instance_id))
}

fn summary(instance: &FlowchartInstance) -> serde_json::Value {
    json!({
        "instanceId": instance.instance_id,
        "templateId": instance.template_id,
        "templateVersion": instance.template_version,
        "status": instance.status.as_str(),
        "currentNodeId": instance.current_node_id,
        "finalOutput": instance.final_output,
        "errorMessage": instance.error_message,
        "errorNodeId": instance.error_node_id,
        "durationMs": instance.duration_ms,
    })
}

/// Create an instance of the latest template version and run it in the
/// foreground. Returns the instance id.
pub async fn run(
    state: &AppState,
    template_id: &str,
    room_id: Option<&str>,
    vars: &[String],
    breakpoints: Vec<String>,
    verbose: bool,
) -> Result<String, String> {
    let variables = parse_vars(vars)?;
    let instance = state
        .engine
        .create_instance(CreateInstanceInput {
            template_id: template_id.to_string(),
            room_id: room_id.map(str::to_string),
            triggered_by: Some("cli".to_string()),
            triggered_by_message_id: None,
            variables,
        })
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "🚀 Running '{}' v{} as {}",
        instance.template_name, instance.template_version, instance.instance_id
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let options = RunOptions {
        listener: Some(tx),
        breakpoints,
    };
    state
        .engine
        .start_execution(&instance.instance_id, options)
        .await
        .map_err(|e| e.to_string())?;
    follow(rx, verbose).await;

    let finished = load(state, &instance.instance_id).await?;
    print_json(&summary(&finished));
    if finished.status == ExecutionStatus::Failed {
        return Err(finished
            .error_message
            .unwrap_or_else(|| "Flowchart failed".to_string()));
    }
    Ok(finished.instance_id)
}

/// Resume a paused (or orphaned running) instance and follow it.
pub async fn resume(state: &AppState, instance_id: &str, breakpoints: Vec<String>, verbose: bool) -> Result<(), String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = RunOptions {
        listener: Some(tx),
        breakpoints,
    };
    state
        .engine
        .resume_execution(instance_id, options)
        .await
        .map_err(|e| e.to_string())?;
    follow(rx, verbose).await;

    let finished = load(state, instance_id).await?;
    print_json(&summary(&finished));
    Ok(())
}

pub async fn stop(state: &AppState, instance_id: &str) -> Result<(), String> {
    load(state, instance_id).await?;
    state
        .engine
        .stop_execution(instance_id)
        .await
        .map_err(|e| e.to_string())?;
    let instance = load(state, instance_id).await?;
    println!("Instance {} is {}", instance_id, instance.status.as_str());
    Ok(())
}

/// Full instance record plus completion progress against its template version.
pub async fn show(state: &AppState, instance_id: &str) -> Result<(), String> {
    let instance = load(state, instance_id).await?;
    let progress = state
        .template_store
        .get_version(&instance.template_id, instance.template_version)
        .await
        .map_err(|e| e.to_string())?
        .map(|t| instance.progress(&t));

    let mut value = serde_json::to_value(&instance).map_err(|e| e.to_string())?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("progress".to_string(), json!(progress));
    }
    print_json(&value);
    Ok(())
}

pub async fn list(state: &AppState, room_id: Option<&str>, status: Option<&str>) -> Result<(), String> {
    let status = match status {
        Some(raw) => Some(
            ExecutionStatus::from_str(&raw.to_uppercase()).ok_or_else(|| format!("Unknown status: {}", raw))?,
        ),
        None => None,
    };
    let instances = match (room_id, status) {
        (Some(room), _) => state.instance_store.list_by_room(room).await,
        (None, Some(status)) => state.instance_store.list_by_status(status).await,
        (None, None) => return Err("Pass --room or --status".to_string()),
    }
    .map_err(|e| e.to_string())?;

    let rows: Vec<_> = instances
        .iter()
        .filter(|i| status.map_or(true, |s| i.status == s))
        .map(summary)
        .collect();
    print_json(&json!({ "instances": rows }));
    Ok(())
}
