//! Built-in data-shaping nodes.
//!
//! These are the pure, dependency-free node types the engine ships with:
//! emitting constants, extracting fields, flattening fan-in, and delaying.
//! Integrations with external systems are provided by embedders through the
//! registry.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::registry::NodeRegistry;
use super::types::{Node, NodeError, NodeMetadata, NodeOutput, UpstreamResults};
use crate::error::Result;

/// Register the built-in node types on a registry.
pub fn register_builtin_nodes(registry: &NodeRegistry) -> Result<()> {
    registry.register(
        NodeMetadata::new("value", "Emit a constant configured value")
            .with_inputs(0)
            .with_config_schema(serde_json::json!({
                "type": "object",
                "properties": { "value": {} },
                "required": ["value"]
            })),
        Box::new(|config| {
            let config: ValueConfig = parse_config(config)?;
            Ok(Arc::new(ValueNode { value: config.value }) as Arc<dyn Node>)
        }),
    )?;

    registry.register(
        NodeMetadata::new("pick", "Extract a dotted path from the input"),
        Box::new(|config| {
            let config: PickConfig = parse_config(config)?;
            Ok(Arc::new(PickNode { path: config.path }) as Arc<dyn Node>)
        }),
    )?;

    registry.register(
        NodeMetadata::new("merge", "Flatten fan-in predecessor objects into one").with_inputs(2),
        Box::new(|_config| Ok(Arc::new(MergeNode) as Arc<dyn Node>)),
    )?;

    registry.register(
        NodeMetadata::new("wait", "Pause for a duration, then pass input through"),
        Box::new(|config| {
            let config: WaitConfig = parse_config(config)?;
            Ok(Arc::new(WaitNode {
                milliseconds: config.milliseconds,
            }) as Arc<dyn Node>)
        }),
    )?;

    Ok(())
}

fn parse_config<'de, T: Deserialize<'de>>(config: &'de Value) -> std::result::Result<T, String> {
    T::deserialize(config).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// value
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ValueConfig {
    value: Value,
}

/// Emits the configured constant, ignoring its input.
struct ValueNode {
    value: Value,
}

#[async_trait]
impl Node for ValueNode {
    async fn execute(&self, _input: &Value, _upstream: &UpstreamResults) -> NodeOutput {
        Ok(self.value.clone())
    }
}

// ---------------------------------------------------------------------------
// pick
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PickConfig {
    path: String,
}

/// Extracts a value from the input using a dotted path expression.
struct PickNode {
    path: String,
}

#[async_trait]
impl Node for PickNode {
    async fn execute(&self, input: &Value, _upstream: &UpstreamResults) -> NodeOutput {
        Ok(extract_path(input, &self.path))
    }
}

/// Walk a dotted path through objects and array indices; missing segments
/// resolve to null.
fn extract_path(value: &Value, path: &str) -> Value {
    let mut current = value;

    for part in path.split('.') {
        match current {
            Value::Object(obj) => match obj.get(part) {
                Some(v) => current = v,
                None => return Value::Null,
            },
            Value::Array(arr) => match part.parse::<usize>().ok().and_then(|i| arr.get(i)) {
                Some(v) => current = v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }

    current.clone()
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// Flattens the fan-in input `{pred_id: result}` by merging all object
/// results into one object. Non-object results stay nested under their
/// predecessor's id.
struct MergeNode;

#[async_trait]
impl Node for MergeNode {
    async fn execute(&self, input: &Value, _upstream: &UpstreamResults) -> NodeOutput {
        let Some(preds) = input.as_object() else {
            return Err(NodeError::terminal(
                "merge expects an object input (fan-in of predecessor results)",
            ));
        };

        let mut merged = Map::new();
        let mut keys: Vec<&String> = preds.keys().collect();
        keys.sort();

        for key in keys {
            match &preds[key] {
                Value::Object(obj) => {
                    for (k, v) in obj {
                        merged.insert(k.clone(), v.clone());
                    }
                }
                other => {
                    merged.insert(key.clone(), other.clone());
                }
            }
        }

        Ok(Value::Object(merged))
    }
}

// ---------------------------------------------------------------------------
// wait
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WaitConfig {
    #[serde(default)]
    milliseconds: u64,
}

/// Pauses for the configured duration, then passes its input through.
struct WaitNode {
    milliseconds: u64,
}

#[async_trait]
impl Node for WaitNode {
    async fn execute(&self, input: &Value, _upstream: &UpstreamResults) -> NodeOutput {
        if self.milliseconds > 0 {
            debug!("wait node pausing for {}ms", self.milliseconds);
            tokio::time::sleep(std::time::Duration::from_millis(self.milliseconds)).await;
        }
        Ok(input.clone())
    }
}
