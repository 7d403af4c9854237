use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn adjacent_objects() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\}\s*\{").unwrap_or_else(|e| unreachable!("adjacent object pattern is static: {e}")))
}

/// Parse streamed tool-call arguments, repairing common model mistakes
///
/// Two objects emitted back to back are merged into one, and a body missing
/// its outer braces is wrapped. Anything still unparseable, or valid JSON
/// that is not an object, becomes an empty object so the tool runs
/// regardless.
pub fn parse_arguments(tool_name: &str, raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }

    let first_error = match serde_json::from_str::<Map<String, Value>>(trimmed) {
        Ok(object) => return Value::Object(object),
        Err(e) => e,
    };

    let repaired = repair(trimmed);
    match serde_json::from_str::<Map<String, Value>>(&repaired) {
        Ok(object) => {
            tracing::warn!(tool = %tool_name, error = %first_error, "repaired malformed tool arguments");
            Value::Object(object)
        }
        Err(e) => {
            tracing::warn!(
                tool = %tool_name,
                error = %e,
                arguments = %trimmed,
                "unparseable tool arguments, running with an empty object"
            );
            Value::Object(Map::new())
        }
    }
}

fn repair(raw: &str) -> String {
    let mut repaired = adjacent_objects().replace_all(raw, ",").into_owned();

    if !repaired.starts_with('{') {
        repaired.insert(0, '{');
    }
    if !repaired.ends_with('}') {
        repaired.push('}');
    }
    repaired
}
