use serde_json::{Map, Value};
use tracing::warn;

/// Nesting deeper than this is dropped rather than persisted. Payloads from
/// the remote are flat business objects; anything this deep is malformed.
const MAX_DEPTH: usize = 32;
/// Upper bound on entries per object or array.
const MAX_WIDTH: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedLeaf {
    pub path: String,
    pub reason: &'static str,
}

#[derive(Debug, Default, Clone)]
pub struct SanitizeReport {
    pub dropped: Vec<DroppedLeaf>,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty()
    }

    fn drop_leaf(&mut self, path: &str, reason: &'static str) {
        warn!(
            target: "ledgerline",
            event = "sanitize_drop",
            path = %path,
            reason = %reason
        );
        self.dropped.push(DroppedLeaf {
            path: path.to_string(),
            reason,
        });
    }
}

/// Reduce a value to plain structured data fit for the local store.
///
/// The fast path is a round-trip probe over the whole value; only when that
/// fails (or bounds are exceeded) does the walk prune subtrees. Idempotent:
/// sanitizing an already-sanitized value changes nothing.
pub fn sanitize(value: &Value) -> (Value, SanitizeReport) {
    let mut report = SanitizeReport::default();
    if within_bounds(value, 0) && copy_probe(value) {
        return (value.clone(), report);
    }
    let out = sanitize_inner(value, 0, "$", &mut report).unwrap_or(Value::Null);
    (out, report)
}

/// A value survives only if serde can write it out and read it back
/// unchanged.
fn copy_probe(value: &Value) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => matches!(serde_json::from_str::<Value>(&text), Ok(parsed) if &parsed == value),
        Err(_) => false,
    }
}

fn within_bounds(value: &Value, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    match value {
        Value::Array(items) => {
            items.len() <= MAX_WIDTH && items.iter().all(|v| within_bounds(v, depth + 1))
        }
        Value::Object(map) => {
            map.len() <= MAX_WIDTH && map.values().all(|v| within_bounds(v, depth + 1))
        }
        _ => true,
    }
}

fn sanitize_inner(
    value: &Value,
    depth: usize,
    path: &str,
    report: &mut SanitizeReport,
) -> Option<Value> {
    if depth > MAX_DEPTH {
        report.drop_leaf(path, "max_depth_exceeded");
        return None;
    }
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Some(value.clone()),
        Value::Number(n) => {
            // serde_json numbers are finite by construction, but a Number
            // built from an arbitrary-precision source can still fail the
            // probe; re-check the leaf on its own.
            if copy_probe(value) {
                Some(Value::Number(n.clone()))
            } else {
                report.drop_leaf(path, "copy_probe_failed");
                None
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len().min(MAX_WIDTH));
            for (idx, item) in items.iter().enumerate() {
                if idx >= MAX_WIDTH {
                    report.drop_leaf(&format!("{path}[{idx}…]"), "max_width_exceeded");
                    break;
                }
                let child_path = format!("{path}[{idx}]");
                if let Some(v) = sanitize_inner(item, depth + 1, &child_path, report) {
                    out.push(v);
                }
            }
            Some(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (idx, (key, item)) in map.iter().enumerate() {
                if idx >= MAX_WIDTH {
                    report.drop_leaf(&format!("{path}.{key}…"), "max_width_exceeded");
                    break;
                }
                let child_path = format!("{path}.{key}");
                if let Some(v) = sanitize_inner(item, depth + 1, &child_path, report) {
                    out.insert(key.clone(), v);
                }
            }
            Some(Value::Object(out))
        }
    }
}
