//! Command template rendering.
//!
//! Stage commands in definition files reference parameters as `{key}` or
//! `${key}`. Keys beginning with `_` are internal and never substituted.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::resources::ResourceAllocation;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$?\{([A-Za-z][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Plain-text form of a parameter value as it appears in a command line.
pub fn value_to_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute every non-internal parameter into `template`.
///
/// `${key}` is replaced before `{key}` so the dollar form never leaves a
/// stray `$` behind.
pub fn render(template: &str, params: &BTreeMap<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        if key.starts_with('_') {
            continue;
        }
        let arg = value_to_arg(value);
        out = out.replace(&format!("${{{key}}}"), &arg);
        out = out.replace(&format!("{{{key}}}"), &arg);
    }
    out
}

/// Placeholders still present after rendering, in order of appearance.
pub fn unresolved_placeholders(rendered: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in PLACEHOLDER_RE.captures_iter(rendered) {
        let name = cap[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Parameters derived from the allocation, always available to templates.
pub fn allocation_params(alloc: &ResourceAllocation) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    params.insert("cpus".to_string(), Value::from(alloc.cpus));
    params.insert("threads".to_string(), Value::from(alloc.threads));
    params.insert("omp_threads".to_string(), Value::from(alloc.omp_threads));
    params.insert("memory_gb".to_string(), Value::from(alloc.memory_gb));
    params.insert("input_dir".to_string(), Value::from("/data/inputs"));
    params.insert("output_dir".to_string(), Value::from("/data/outputs"));
    params
}

/// Quote `s` for a POSIX shell using single quotes.
pub fn sh_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    out.push_str(&s.replace('\'', r"'\''"));
    out.push('\'');
    out
}
