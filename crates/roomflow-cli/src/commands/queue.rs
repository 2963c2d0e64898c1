//! `roomflow queue` — Per-room assistant task queues.

use std::time::Duration;

use roomflow_core::models::{AssistantKind, EnqueueTaskInput, PartitionKey, QueuedTask, TaskStatus, UserInfo};
use roomflow_core::state::AppState;
use serde_json::json;

use super::{parse_vars, print_json};

fn parse_assistant(raw: &str) -> Result<AssistantKind, String> {
    AssistantKind::from_str(raw).ok_or_else(|| {
        format!(
            "Unknown assistant '{}'. Expected one of: openclaw, kimi, claude",
            raw
        )
    })
}

fn task_row(task: &QueuedTask) -> serde_json::Value {
    json!({
        "taskId": task.task_id,
        "taskType": task.task_type.as_str(),
        "status": task.status.as_str(),
        "position": task.position,
        "content": task.content,
        "flowchartInstanceId": task.flowchart_instance_id,
    })
}

/// Poll a task until it leaves PENDING/PROCESSING.
async fn wait_for(state: &AppState, task_id: &str) -> Result<QueuedTask, String> {
    loop {
        let task = state
            .queue
            .get_task(task_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Task not found: {}", task_id))?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Processing) {
            return Ok(task);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn cli_user(user: Option<&str>) -> Option<UserInfo> {
    user.map(|name| UserInfo {
        user_id: name.to_string(),
        user_name: name.to_string(),
        room_id: None,
        avatar: None,
    })
}

/// Queue a chat message for an assistant, optionally waiting for it.
pub async fn enqueue_chat(
    state: &AppState,
    room_id: &str,
    assistant: &str,
    content: &str,
    user: Option<&str>,
    wait: bool,
) -> Result<String, String> {
    let assistant = parse_assistant(assistant)?;
    let mut input = EnqueueTaskInput::chat(room_id, assistant, content);
    input.user_info = cli_user(user);

    let task = state.queue.enqueue(input).await.map_err(|e| e.to_string())?;
    println!("📥 Queued task {} at position {}", task.task_id, task.position);
    state
        .queue
        .try_process_next(&task.partition())
        .await
        .map_err(|e| e.to_string())?;

    if wait {
        let finished = wait_for(state, &task.task_id).await?;
        print_json(&task_row(&finished));
    }
    Ok(task.task_id)
}

/// Queue a flowchart run on the room's OPENCLAW partition.
pub async fn enqueue_flowchart(
    state: &AppState,
    room_id: &str,
    template_id: &str,
    vars: &[String],
    user: Option<&str>,
    wait: bool,
) -> Result<String, String> {
    let variables = parse_vars(vars)?;
    let (task_id, instance_id) = state
        .bridge
        .enqueue_flowchart(room_id, template_id, variables, cli_user(user), None)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({ "taskId": task_id, "instanceId": instance_id }));

    if wait {
        let finished = wait_for(state, &task_id).await?;
        let instance = state
            .engine
            .get_instance(&instance_id)
            .await
            .map_err(|e| e.to_string())?;
        print_json(&json!({
            "task": task_row(&finished),
            "instanceStatus": instance.as_ref().map(|i| i.status.as_str()),
            "finalOutput": instance.and_then(|i| i.final_output),
        }));
    }
    Ok(task_id)
}

pub async fn list(state: &AppState, room_id: &str) -> Result<(), String> {
    let queues = state.queue.room_task_queues(room_id).await;
    let rows: serde_json::Map<String, serde_json::Value> = queues
        .iter()
        .map(|(assistant, tasks)| {
            (
                assistant.as_str().to_string(),
                json!(tasks.iter().map(task_row).collect::<Vec<_>>()),
            )
        })
        .collect();
    print_json(&json!({ "roomId": room_id, "queues": rows }));
    Ok(())
}

pub async fn cancel(state: &AppState, task_id: &str) -> Result<(), String> {
    let cancelled = state.queue.cancel_task(task_id).await.map_err(|e| e.to_string())?;
    if !cancelled {
        return Err(format!("Task {} is not pending", task_id));
    }
    println!("Cancelled task {}", task_id);
    Ok(())
}

pub async fn reorder(state: &AppState, room_id: &str, assistant: &str, task_ids: &[String]) -> Result<(), String> {
    let partition = PartitionKey::new(room_id, parse_assistant(assistant)?);
    let tasks = state
        .queue
        .reorder_queue(&partition, task_ids)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({ "tasks": tasks.iter().map(task_row).collect::<Vec<_>>() }));
    Ok(())
}

/// Process whatever the previous run left queued, then exit once every
/// partition is idle.
pub async fn recover(state: &AppState) -> Result<(), String> {
    let started = state.queue.drain_all().await.map_err(|e| e.to_string())?;
    println!("▶ Started {} partition(s)", started);

    let pending = state
        .task_store
        .list_unfinished()
        .await
        .map_err(|e| e.to_string())?;
    for task in pending {
        let finished = wait_for(state, &task.task_id).await?;
        println!("  {} {}", finished.task_id, finished.status.as_str());
    }
    Ok(())
}
