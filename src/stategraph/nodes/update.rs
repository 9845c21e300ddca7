//! Constant-update node with `{{path}}` templates

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::engine::error::NodeError;
use crate::engine::node::Node;
use crate::engine::state::{StateUpdate, WorkflowState};

/// Emits the same partial update every time, after substituting templates.
///
/// A string that is exactly `{{path}}` is replaced by the raw value at that
/// path; templates embedded in longer strings are replaced by the value's text.
#[derive(Debug, Clone)]
pub struct UpdateNode {
    values: Map<String, Value>,
}

impl UpdateNode {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl Node for UpdateNode {
    async fn run(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError> {
        let mut update = StateUpdate::new();
        for (key, value) in &self.values {
            update.insert(key.clone(), render(value, state)?);
        }
        Ok(update)
    }
}

fn render(value: &Value, state: &WorkflowState) -> Result<Value, NodeError> {
    match value {
        Value::String(s) => render_str(s, state),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, state))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render(v, state)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_str(template: &str, state: &WorkflowState) -> Result<Value, NodeError> {
    let trimmed = template.trim();
    if let Some(path) = whole_template(trimmed) {
        return lookup(path, state).cloned();
    }

    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated template in '{}'", template))?;
        match lookup(after[..end].trim(), state)? {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// `{{path}}` with nothing around it
fn whole_template(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        None
    } else {
        Some(inner.trim())
    }
}

fn lookup<'a>(path: &str, state: &'a WorkflowState) -> Result<&'a Value, NodeError> {
    state
        .get_path(path)
        .ok_or_else(|| format!("template references missing state path '{}'", path).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> WorkflowState {
        let mut state = WorkflowState::empty();
        state.update("input", json!("hello"));
        state.update("documents", json!(["d1", "d2"]));
        state.update("meta", json!({"retries": 2}));
        state
    }

    fn values(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_constant_update() {
        let node = UpdateNode::new(values(json!({"aggregate": ["A"], "done": true})));
        let update = node.run(&state()).await.unwrap();
        assert_eq!(update.to_value(), json!({"aggregate": ["A"], "done": true}));
    }

    #[tokio::test]
    async fn test_templates() {
        let node = UpdateNode::new(values(json!({
            "copy": "{{ documents }}",
            "text": "{{input}} world ({{meta.retries}} retries)",
            "nested": {"first": "{{documents.0}}"}
        })));
        let update = node.run(&state()).await.unwrap();
        assert_eq!(update.get("copy"), Some(&json!(["d1", "d2"])));
        assert_eq!(update.get("text"), Some(&json!("hello world (2 retries)")));
        assert_eq!(update.get("nested"), Some(&json!({"first": "d1"})));
    }

    #[tokio::test]
    async fn test_missing_path_fails() {
        let node = UpdateNode::new(values(json!({"x": "{{nope}}"})));
        let err = node.run(&state()).await.unwrap_err();
        assert!(err.to_string().contains("nope"));

        let node = UpdateNode::new(values(json!({"x": "{{input"})));
        assert!(node.run(&state()).await.is_err());
    }
}
