//! `roomflow template` — Template authoring commands.

use std::path::Path;

use roomflow_core::models::{CreateTemplateInput, UpdateTemplateInput};
use roomflow_core::state::AppState;
use serde_json::json;

use super::print_json;

/// Read a YAML (`.yaml`/`.yml`) or JSON file into `T`.
fn read_document<T: serde::de::DeserializeOwned>(file: &str) -> Result<T, String> {
    let raw = std::fs::read_to_string(file).map_err(|e| format!("Failed to read '{}': {}", file, e))?;
    let is_yaml = matches!(
        Path::new(file).extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(&raw).map_err(|e| format!("Invalid YAML in '{}': {}", file, e))
    } else {
        serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in '{}': {}", file, e))
    }
}

/// Create a template (version 1) from a definition file.
pub async fn import(state: &AppState, file: &str) -> Result<String, String> {
    let input: CreateTemplateInput = read_document(file)?;
    let template = state
        .template_store
        .create(input)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({
        "templateId": template.template_id,
        "version": template.version,
        "name": template.name,
    }));
    Ok(template.template_id)
}

/// Publish a new version; fields missing from the file are inherited.
pub async fn update(state: &AppState, template_id: &str, file: &str) -> Result<(), String> {
    let input: UpdateTemplateInput = read_document(file)?;
    let template = state
        .template_store
        .update(template_id, input)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({
        "templateId": template.template_id,
        "version": template.version,
        "parentVersionId": template.parent_version_id,
    }));
    Ok(())
}

pub async fn list(state: &AppState, room_id: Option<&str>, category: Option<&str>) -> Result<(), String> {
    let templates = match (room_id, category) {
        (Some(room), _) => state.template_store.list_for_room(room).await,
        (None, Some(category)) => state.template_store.list_by_category(category).await,
        (None, None) => state.template_store.list_latest().await,
    }
    .map_err(|e| e.to_string())?;

    let rows: Vec<_> = templates
        .iter()
        .filter(|t| category.map_or(true, |c| t.category.as_deref() == Some(c)))
        .map(|t| {
            json!({
                "templateId": t.template_id,
                "name": t.name,
                "version": t.version,
                "category": t.category,
                "isPublic": t.is_public,
                "nodes": t.definition.nodes.len(),
            })
        })
        .collect();
    print_json(&json!({ "templates": rows }));
    Ok(())
}

pub async fn show(state: &AppState, template_id: &str, version: Option<i64>) -> Result<(), String> {
    let template = match version {
        Some(v) => state.template_store.get_version(template_id, v).await,
        None => state.template_store.get_latest(template_id).await,
    }
    .map_err(|e| e.to_string())?
    .ok_or_else(|| format!("Template not found: {}", template_id))?;
    print_json(&serde_json::to_value(&template).map_err(|e| e.to_string())?);
    Ok(())
}

pub async fn history(state: &AppState, template_id: &str) -> Result<(), String> {
    let versions = state
        .template_store
        .version_history(template_id)
        .await
        .map_err(|e| e.to_string())?;
    let rows: Vec<_> = versions
        .iter()
        .map(|t| {
            json!({
                "version": t.version,
                "isLatest": t.is_latest,
                "parentVersionId": t.parent_version_id,
                "updatedBy": t.updated_by,
                "createdAt": t.created_at,
            })
        })
        .collect();
    print_json(&json!({ "templateId": template_id, "versions": rows }));
    Ok(())
}

pub async fn delete(state: &AppState, template_id: &str) -> Result<(), String> {
    let removed = state
        .template_store
        .delete(template_id)
        .await
        .map_err(|e| e.to_string())?;
    if !removed {
        return Err(format!("Template not found: {}", template_id));
    }
    println!("Deleted template {}", template_id);
    Ok(())
}

/// List the registered node types.
pub async fn node_types(state: &AppState) -> Result<(), String> {
    let handlers = state.registry.describe();
    print_json(&json!({ "nodeTypes": handlers }));
    Ok(())
}
