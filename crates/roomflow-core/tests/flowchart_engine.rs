//! End-to-end tests for templates and flowchart runs, driven through the
//! public API with an in-memory SQLite database and a scripted assistant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use roomflow_core::completion::{
    CompletionClient, CompletionClients, CompletionError, CompletionRequest, CompletionResponse,
};
use roomflow_core::config::RoomflowConfig;
use roomflow_core::flowchart::{FlowchartEvent, RunOptions};
use roomflow_core::models::{
    AssistantKind, CreateInstanceInput, CreateTemplateInput, ExecutionStatus, FlowchartInstance,
    UpdateTemplateInput,
};
use roomflow_core::{AppStateInner, Database};

/// Replies with canned answers in order and remembers the prompts.
struct FakeAssistant {
    replies: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeAssistant {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CompletionClient for FakeAssistant {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CompletionError> {
        self.prompts.lock().unwrap().push(request.user_prompt);
        match self.replies.lock().unwrap().pop() {
            Some(content) => Ok(CompletionResponse {
                content,
                completed: true,
            }),
            None => Err(CompletionError::Transport("no more replies".to_string())),
        }
    }
}

fn state_with(clients: CompletionClients) -> AppStateInner {
    let db = Database::open_in_memory().expect("in-memory database");
    AppStateInner::new(db, RoomflowConfig::default(), clients)
}

async fn publish(state: &AppStateInner, template: Value) -> String {
    let input: CreateTemplateInput = serde_json::from_value(template).expect("template input");
    state
        .template_store
        .create(input)
        .await
        .expect("template is valid")
        .template_id
}

/// Start an instance and wait for the event that ends its run.
async fn run(state: &AppStateInner, template_id: &str, variables: Value) -> FlowchartInstance {
    let variables: HashMap<String, Value> = serde_json::from_value(variables).unwrap();
    let instance = state
        .engine
        .create_instance(CreateInstanceInput {
            template_id: template_id.to_string(),
            room_id: Some("room-1".to_string()),
            variables,
            ..Default::default()
        })
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    state
        .engine
        .start_execution(&instance.instance_id, RunOptions::with_listener(tx))
        .await
        .unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("run finished in time")
            .expect("listener open until the run ends");
        if event.ends_run() {
            break;
        }
    }
    state
        .engine
        .get_instance(&instance.instance_id)
        .await
        .unwrap()
        .unwrap()
}

fn score_template() -> Value {
    json!({
        "name": "Grade",
        "variables": [{ "name": "score", "type": "number", "required": true }],
        "definition": {
            "nodes": [
                { "id": "start", "type": "start" },
                { "id": "check", "type": "condition", "data": { "conditionExpr": "score >= 60" } },
                { "id": "pass", "type": "end", "data": { "label": "pass" } },
                { "id": "fail", "type": "end", "data": { "label": "fail" } }
            ],
            "edges": [
                { "id": "e1", "source": "start", "target": "check" },
                { "id": "e2", "source": "check", "target": "pass", "sourceHandle": "true" },
                { "id": "e3", "source": "check", "target": "fail", "sourceHandle": "false" }
            ]
        }
    })
}

#[tokio::test]
async fn test_updates_append_versions_with_one_latest() {
    let state = state_with(CompletionClients::new());
    let template_id = publish(&state, score_template()).await;

    for name in ["Grade v2", "Grade v3"] {
        state
            .template_store
            .update(
                &template_id,
                UpdateTemplateInput {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let history = state.template_store.version_history(&template_id).await.unwrap();
    let versions: Vec<i64> = history.iter().map(|t| t.version).collect();
    assert_eq!(versions, vec![3, 2, 1]);
    assert_eq!(history.iter().filter(|t| t.is_latest).count(), 1);
    assert_eq!(history[0].parent_version_id, Some(history[1].id));
    // Omitted fields are inherited.
    assert_eq!(history[0].definition.nodes.len(), 4);

    let latest = state.template_store.get_latest(&template_id).await.unwrap().unwrap();
    assert_eq!(latest.name, "Grade v3");
}

#[tokio::test]
async fn test_condition_selects_true_and_false_edges() {
    let state = state_with(CompletionClients::new());
    let template_id = publish(&state, score_template()).await;

    let high = run(&state, &template_id, json!({ "score": 80 })).await;
    assert_eq!(high.status, ExecutionStatus::Completed);
    assert_eq!(high.final_output.as_deref(), Some("pass"));
    assert!(high.node_execution("pass").is_some());
    assert!(high.node_execution("fail").is_none());

    let low = run(&state, &template_id, json!({ "score": 40 })).await;
    assert_eq!(low.final_output.as_deref(), Some("fail"));
}

#[tokio::test]
async fn test_big_small_scenario() {
    let state = state_with(CompletionClients::new());
    let template_id = publish(
        &state,
        json!({
            "name": "Size",
            "definition": {
                "nodes": [
                    { "id": "start", "type": "start" },
                    { "id": "assign", "type": "variable", "data": { "varName": "x", "varValue": "5" } },
                    { "id": "cond", "type": "condition", "data": { "conditionExpr": "x > 3" } },
                    { "id": "a", "type": "end", "data": { "label": "big" } },
                    { "id": "b", "type": "end", "data": { "label": "small" } }
                ],
                "edges": [
                    { "id": "e1", "source": "start", "target": "assign" },
                    { "id": "e2", "source": "assign", "target": "cond" },
                    { "id": "e3", "source": "cond", "target": "a", "sourceHandle": "true" },
                    { "id": "e4", "source": "cond", "target": "b", "sourceHandle": "false" }
                ]
            }
        }),
    )
    .await;

    let instance = run(&state, &template_id, json!({})).await;
    assert_eq!(instance.status, ExecutionStatus::Completed);
    assert_eq!(instance.final_output.as_deref(), Some("big"));
    assert_eq!(instance.outputs.get("x"), Some(&json!(5)));
    assert_eq!(instance.node_executions.len(), 4);

    let template = state.template_store.get_latest(&template_id).await.unwrap().unwrap();
    assert_eq!(instance.progress(&template), 80);
}

#[tokio::test]
async fn test_instance_runs_the_version_it_was_created_from() {
    let state = state_with(CompletionClients::new());
    let template_id = publish(
        &state,
        json!({
            "name": "Echo",
            "definition": {
                "nodes": [
                    { "id": "s", "type": "start" },
                    { "id": "e", "type": "end", "data": { "label": "v1" } }
                ],
                "edges": [{ "id": "1", "source": "s", "target": "e" }]
            }
        }),
    )
    .await;

    let instance = state
        .engine
        .create_instance(CreateInstanceInput {
            template_id: template_id.clone(),
            ..Default::default()
        })
        .await
        .unwrap();

    let v2 = serde_json::from_value(json!({
        "nodes": [
            { "id": "s", "type": "start" },
            { "id": "e", "type": "end", "data": { "label": "v2" } }
        ],
        "edges": [{ "id": "1", "source": "s", "target": "e" }]
    }))
    .unwrap();
    state
        .template_store
        .update(
            &template_id,
            UpdateTemplateInput {
                definition: Some(v2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    state
        .engine
        .start_execution(&instance.instance_id, RunOptions::with_listener(tx))
        .await
        .unwrap();
    let mut final_output = None;
    while let Some(event) = rx.recv().await {
        if let FlowchartEvent::Completed { final_output: out, .. } = event {
            final_output = out;
            break;
        }
    }
    assert_eq!(final_output.as_deref(), Some("v1"));
    assert_eq!(instance.template_version, 1);
}

#[tokio::test]
async fn test_assistant_pipeline_with_completion_check() {
    let openclaw = FakeAssistant::new(&["Deployment finished.", "COMPLETED"]);
    let clients = CompletionClients::new().with(AssistantKind::OpenClaw, openclaw.clone());
    let state = state_with(clients);

    let template_id = publish(
        &state,
        json!({
            "name": "Deploy report",
            "variables": [{ "name": "service", "defaultValue": "billing" }],
            "definition": {
                "nodes": [
                    { "id": "s", "type": "start" },
                    { "id": "ask", "type": "llm", "data": {
                        "userPrompt": "Report the deploy status of {{service}}",
                        "outputVar": "report"
                    } },
                    { "id": "check", "type": "completion_check", "data": {
                        "checkVar": "report",
                        "outputVar": "verdict"
                    } },
                    { "id": "ok", "type": "end", "data": { "outputVar": "report" } },
                    { "id": "retry", "type": "end", "data": { "label": "not yet" } }
                ],
                "edges": [
                    { "id": "1", "source": "s", "target": "ask" },
                    { "id": "2", "source": "ask", "target": "check" },
                    { "id": "3", "source": "check", "target": "ok", "sourceHandle": "completed" },
                    { "id": "4", "source": "check", "target": "retry", "sourceHandle": "incomplete" }
                ]
            }
        }),
    )
    .await;

    let instance = run(&state, &template_id, json!({})).await;
    assert_eq!(instance.status, ExecutionStatus::Completed);
    assert_eq!(instance.final_output.as_deref(), Some("Deployment finished."));
    assert_eq!(instance.outputs.get("verdict"), Some(&json!("COMPLETED")));
    assert_eq!(instance.outputs.get("report_check_result"), Some(&json!("COMPLETED")));

    let prompts = openclaw.prompts.lock().unwrap().clone();
    assert_eq!(prompts[0], "Report the deploy status of billing");
    assert!(prompts[1].contains("Deployment finished."));
}

#[tokio::test]
async fn test_assistant_error_fails_instance_with_node_id() {
    let state = state_with(CompletionClients::new());
    let template_id = publish(
        &state,
        json!({
            "name": "No assistant",
            "definition": {
                "nodes": [
                    { "id": "s", "type": "start" },
                    { "id": "ask", "type": "openclaw", "data": { "userPrompt": "hello" } },
                    { "id": "e", "type": "end" }
                ],
                "edges": [
                    { "id": "1", "source": "s", "target": "ask" },
                    { "id": "2", "source": "ask", "target": "e" }
                ]
            }
        }),
    )
    .await;

    let instance = run(&state, &template_id, json!({})).await;
    assert_eq!(instance.status, ExecutionStatus::Failed);
    assert_eq!(instance.error_node_id.as_deref(), Some("ask"));
    assert!(instance.error_message.is_some());
    assert!(instance.completed_at.is_some());
}

#[tokio::test]
async fn test_invalid_definitions_are_rejected_at_save_time() {
    let state = state_with(CompletionClients::new());
    let input: CreateTemplateInput = serde_json::from_value(json!({
        "name": "Broken",
        "definition": {
            "nodes": [
                { "id": "s", "type": "start" },
                { "id": "x", "type": "teleport" },
                { "id": "a", "type": "end" },
                { "id": "b", "type": "end" }
            ],
            "edges": [
                { "id": "1", "source": "s", "target": "a" },
                { "id": "2", "source": "s", "target": "b" }
            ]
        }
    }))
    .unwrap();
    let err = state.template_store.create(input).await.unwrap_err().to_string();
    assert!(err.contains("teleport"), "{}", err);
    assert!(err.contains("unlabeled"), "{}", err);
}

#[tokio::test]
async fn test_delete_refused_while_running() {
    let state = state_with(CompletionClients::new());
    let template_id = publish(
        &state,
        json!({
            "name": "Slow",
            "definition": {
                "nodes": [
                    { "id": "s", "type": "start" },
                    { "id": "w", "type": "wait", "data": { "waitSeconds": 30 } },
                    { "id": "e", "type": "end" }
                ],
                "edges": [
                    { "id": "1", "source": "s", "target": "w" },
                    { "id": "2", "source": "w", "target": "e" }
                ]
            }
        }),
    )
    .await;
    let instance = state
        .engine
        .create_instance(CreateInstanceInput {
            template_id: template_id.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    state
        .engine
        .start_execution(&instance.instance_id, RunOptions::default())
        .await
        .unwrap();

    let err = state.template_store.delete(&template_id).await.unwrap_err();
    assert!(err.to_string().contains("running"));

    state.engine.stop_execution(&instance.instance_id).await.unwrap();
    let stopped = state.engine.get_instance(&instance.instance_id).await.unwrap().unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Cancelled);
    assert!(state.template_store.delete(&template_id).await.unwrap());
}
