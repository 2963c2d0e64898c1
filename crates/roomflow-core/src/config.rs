//! Runtime configuration, loaded from a YAML file.
//!
//! ```yaml
//! database_path: ~/.roomflow/roomflow.db
//! queue:
//!   settle_delay_ms: 300
//! engine:
//!   llm_timeout_secs: 300
//!   check_timeout_secs: 60
//!   code_timeout_secs: 30
//! assistants:
//!   OPENCLAW:
//!     adapter: anthropic
//!     base_url: https://api.anthropic.com
//!     api_key: ${ANTHROPIC_API_KEY}
//!     model: claude-sonnet-4-5
//! ```
//!
//! String values may reference environment variables as `${VAR}` or
//! `${VAR:-default}`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::EngineError;
use crate::flowchart::handlers::HandlerSettings;
use crate::models::task::AssistantKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomflowConfig {
    pub database_path: Option<String>,
    pub queue: QueueConfig,
    pub engine: EngineConfig,
    pub assistants: BTreeMap<AssistantKind, AssistantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pause between finishing one task and starting the next in a partition.
    pub settle_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { settle_delay_ms: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub llm_timeout_secs: u64,
    pub check_timeout_secs: u64,
    /// Wall-clock limit for one Lua code step.
    pub code_timeout_secs: u64,
    /// Upper bound on node visits per run; guards against cyclic graphs.
    pub max_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_timeout_secs: 300,
            check_timeout_secs: 60,
            code_timeout_secs: 30,
            max_steps: 1000,
        }
    }
}

/// Connection settings for one backing assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// `anthropic` (Messages API) or `openai` (chat completions).
    pub adapter: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            adapter: "anthropic".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key: String::new(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 8192,
        }
    }
}

impl RoomflowConfig {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Validation(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let mut config: RoomflowConfig = serde_yaml::from_str(&raw).map_err(|e| {
            EngineError::Validation(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.resolve_env();
        tracing::info!("[Config] Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` when given and present, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, EngineError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                tracing::warn!("[Config] {} not found, using defaults", p.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    fn resolve_env(&mut self) {
        if let Some(path) = self.database_path.as_mut() {
            *path = resolve_env_vars(path);
        }
        for assistant in self.assistants.values_mut() {
            assistant.adapter = resolve_env_vars(&assistant.adapter);
            assistant.base_url = resolve_env_vars(&assistant.base_url);
            assistant.api_key = resolve_env_vars(&assistant.api_key);
            assistant.model = resolve_env_vars(&assistant.model);
        }
    }

    /// Configured path, or `<data dir>/roomflow/roomflow.db`.
    pub fn database_path(&self) -> PathBuf {
        if let Some(p) = &self.database_path {
            return expand_home(p);
        }
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("roomflow")
            .join("roomflow.db")
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.queue.settle_delay_ms)
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            llm_timeout: Duration::from_secs(self.engine.llm_timeout_secs),
            check_timeout: Duration::from_secs(self.engine.check_timeout_secs),
            code_timeout: Duration::from_secs(self.engine.code_timeout_secs),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Resolve environment variable references in a string.
/// Supports `${ENV_VAR}` and `${ENV_VAR:-default}` syntax. Unset variables
/// without a default are left as written.
pub fn resolve_env_vars(input: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("env pattern is valid"));
    re.replace_all(input, |caps: &regex::Captures| {
        let var_expr = &caps[1];
        if let Some(idx) = var_expr.find(":-") {
            let var_name = &var_expr[..idx];
            let default_val = &var_expr[idx + 2..];
            std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
        } else {
            std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
        }
    })
    .to_string()
}
