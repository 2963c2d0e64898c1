//! `{{name}}` template rendering over the instance variable scope.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

pub(crate) fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").expect("token pattern is valid"))
}

/// Substitute every `{{name}}` with the current value of `name`.
///
/// Single pass: substituted values are not scanned again. Undefined and
/// null variables render as the empty string.
pub fn render(template: &str, variables: &HashMap<String, Value>) -> String {
    token_pattern()
        .replace_all(template, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .map(value_to_string)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Plain-text form of a variable value. Strings are not quoted.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Coerce rendered text to an integer, then a float, then keep it as text.
pub fn coerce_scalar(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(text.to_string())
}
