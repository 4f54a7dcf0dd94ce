//! `{{path.to.value}}` substitution over JSON values (§4.2).
//!
//! Rendering is pure: it never performs I/O and only ever sees the
//! `{input, context, run}` envelope a caller builds for it.

use serde_json::Value;

/// Matches the innards of a `{{...}}` token: a dotted path of identifier
/// segments. Leading/trailing whitespace inside the braces is tolerated,
/// matching common templating conventions across the pack.
fn token_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").unwrap())
}

/// Resolve a dotted path (`"input.orderId"`) against a JSON value. A missing
/// segment, or a segment that does not index into a map, yields `None` — the
/// caller substitutes the empty string.
fn resolve_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Render the value returned by resolving a path into the string a
/// `{{path}}` token expands to. Strings pass through unquoted; other JSON
/// scalars/containers use their JSON text form, matching `JSON.stringify`
/// semantics for non-string leaves.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Substitute every `{{path}}` token found in `s`, using `data` as the
/// lookup root.
fn render_string(s: &str, data: &Value) -> String {
    token_re()
        .replace_all(s, |caps: &regex::Captures| {
            let path = &caps[1];
            resolve_path(data, path)
                .map(stringify)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Recursively render every string found inside `value`, preserving its
/// shape: objects keep their keys, arrays keep their length and order,
/// non-string scalars pass through unchanged. A value with no `{{...}}`
/// tokens anywhere renders as a structurally equal copy.
pub fn render_value(value: &Value, data: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(render_string(s, data)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, data)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a map of header strings (e.g. a [`crate::model::HttpRequestSpec`]'s
/// `headers`) against the envelope.
pub fn render_headers(
    headers: &std::collections::HashMap<String, String>,
    data: &Value,
) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), render_string(v, data)))
        .collect()
}
