//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and reuses
//! the roomflow-core domain logic through `AppState`.

pub mod instance;
pub mod queue;
pub mod template;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use roomflow_core::config::RoomflowConfig;
use roomflow_core::state::AppState;
use serde_json::Value;

/// Build the shared `AppState`: load the config file (if any), let `--db`
/// override its database path, open the database and replay the task
/// queue left over from a previous run.
pub async fn init_state(db_path: Option<&str>, config_path: Option<&str>) -> AppState {
    let mut config = RoomflowConfig::load_or_default(config_path.map(Path::new)).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {}", e);
        std::process::exit(1);
    });
    if let Some(path) = db_path {
        config.database_path = Some(path.to_string());
    }

    let state: AppState = Arc::new(roomflow_core::AppStateInner::open(config).unwrap_or_else(|e| {
        eprintln!("Failed to open database: {}", e);
        std::process::exit(1);
    }));

    if let Err(e) = state.queue.recover().await {
        eprintln!("Failed to recover task queue: {}", e);
        std::process::exit(1);
    }

    state
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Parse repeated `key=value` flags. Values that parse as JSON keep their
/// type (`n=3` is a number); anything else is a string.
pub fn parse_vars(pairs: &[String]) -> Result<HashMap<String, Value>, String> {
    pairs
        .iter()
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| format!("Expected key=value, got '{}'", pair))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(format!("Empty variable name in '{}'", pair));
            }
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}
