//! Boolean expressions for condition nodes, evaluated with JEXL.
//!
//! Before evaluation the source is rewritten into plain JEXL: `{{name}}`
//! tokens and `#name` references become bare identifiers, and the `and` /
//! `or` keywords become `&&` / `||`. Quoted strings are left untouched.
//! Variables are the evaluation context, so a missing name reads as null.
//! Substring tests use JEXL's `in` (`'done' in status`).

use jexl_eval::error::EvaluationError;
use jexl_eval::Evaluator;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::render::token_pattern;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("{0}")]
    Eval(String),
}

impl From<EvaluationError<'_>> for ExprError {
    fn from(e: EvaluationError<'_>) -> Self {
        match e {
            EvaluationError::ParseError(_) => ExprError::Syntax(e.to_string()),
            other => ExprError::Eval(other.to_string()),
        }
    }
}

/// Rewrite `{{name}}` tokens into direct variable references.
pub fn expand_tokens(expr: &str) -> String {
    token_pattern().replace_all(expr, "$1").into_owned()
}

fn string_literal() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#).expect("string literal pattern is valid")
    })
}

fn rewrite_code(segment: &str) -> String {
    static HASH_REF: OnceLock<Regex> = OnceLock::new();
    static AND: OnceLock<Regex> = OnceLock::new();
    static OR: OnceLock<Regex> = OnceLock::new();
    let hash_ref = HASH_REF.get_or_init(|| Regex::new(r"#([A-Za-z_]\w*)").expect("hash pattern is valid"));
    let and = AND.get_or_init(|| Regex::new(r"\band\b").expect("and pattern is valid"));
    let or = OR.get_or_init(|| Regex::new(r"\bor\b").expect("or pattern is valid"));

    let out = hash_ref.replace_all(segment, "$1");
    let out = and.replace_all(&out, "&&");
    or.replace_all(&out, "||").into_owned()
}

/// Translate the condition dialect into JEXL source.
pub fn to_jexl(source: &str) -> String {
    let expanded = expand_tokens(source);
    let mut out = String::with_capacity(expanded.len());
    let mut last = 0;
    for literal in string_literal().find_iter(&expanded) {
        out.push_str(&rewrite_code(&expanded[last..literal.start()]));
        out.push_str(literal.as_str());
        last = literal.end();
    }
    out.push_str(&rewrite_code(&expanded[last..]));
    out
}

/// Evaluate `source` against `vars` and return the raw JEXL value.
pub fn evaluate(source: &str, vars: &HashMap<String, Value>) -> Result<Value, ExprError> {
    let jexl = to_jexl(source);
    let value = Evaluator::new().eval_in_context(&jexl, vars)?;
    Ok(value)
}

/// Evaluate `source` to a boolean.
pub fn evaluate_condition(source: &str, vars: &HashMap<String, Value>) -> Result<bool, ExprError> {
    truthy(&evaluate(source, vars)?)
}

/// Reject sources that do not parse. Evaluation errors against an empty
/// scope are expected and ignored.
pub fn check_syntax(source: &str) -> Result<(), ExprError> {
    match evaluate(source, &HashMap::new()) {
        Err(e @ ExprError::Syntax(_)) => Err(e),
        _ => Ok(()),
    }
}

fn truthy(v: &Value) -> Result<bool, ExprError> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        other => Err(ExprError::Eval(format!("{} is not a boolean", other))),
    }
}
