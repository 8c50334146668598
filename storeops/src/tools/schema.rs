//! Adapts tool parameter schemas to the model's function-call surface.
//!
//! Contract: required fields stay required; optional fields become nullable
//! with a `null` default; arrays must declare element schemas all the way
//! down; union-with-null property types collapse to nullable scalars. Schemas
//! the walker cannot adapt safely (`$ref` indirection, unbounded unions,
//! excessive depth, empty objects) are rejected with a typed error so the
//! tool is excluded rather than silently miswired.

use serde_json::{json, Map, Value};

use crate::error::OrchestratorError;

const MAX_DEPTH: usize = 16;

pub fn adapt_schema(tool: &str, schema: &Value) -> Result<Value, OrchestratorError> {
    let adapted = adapt_object(tool, schema, 0)?;
    Ok(adapted)
}

fn reject(tool: &str, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::SchemaAdapt {
        tool: tool.to_string(),
        reason: reason.into(),
    }
}

fn adapt_object(tool: &str, schema: &Value, depth: usize) -> Result<Value, OrchestratorError> {
    if depth > MAX_DEPTH {
        return Err(reject(tool, format!("schema exceeds depth limit {MAX_DEPTH}")));
    }
    let obj = schema
        .as_object()
        .ok_or_else(|| reject(tool, "parameters must be a JSON object schema"))?;
    if obj.contains_key("$ref") {
        return Err(reject(tool, "$ref indirection is not supported"));
    }
    if obj.contains_key("anyOf") || obj.contains_key("oneOf") || obj.contains_key("allOf") {
        return Err(reject(tool, "unbounded union schemas are not supported"));
    }

    let declared_type = obj.get("type");
    if let Some(t) = declared_type.and_then(|t| t.as_str()) {
        if t != "object" {
            return Err(reject(tool, format!("top-level type must be object, got {t}")));
        }
    }

    let properties = obj
        .get("properties")
        .and_then(|p| p.as_object())
        .ok_or_else(|| reject(tool, "empty-schema objects are forbidden"))?;
    if properties.is_empty() {
        return Err(reject(tool, "empty-schema objects are forbidden"));
    }

    let required: Vec<String> = obj
        .get("required")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut adapted_props = Map::new();
    for (name, prop) in properties {
        let mut adapted = adapt_property(tool, name, prop, depth + 1)?;
        if !required.contains(name) {
            // Optional fields are emitted nullable with a null default; some
            // providers reject optional-without-default function arguments.
            if let Some(map) = adapted.as_object_mut() {
                map.insert("nullable".to_string(), Value::Bool(true));
                map.entry("default").or_insert(Value::Null);
            }
        }
        adapted_props.insert(name.clone(), adapted);
    }

    Ok(json!({
        "type": "object",
        "properties": Value::Object(adapted_props),
        "required": required,
    }))
}

fn adapt_property(
    tool: &str,
    name: &str,
    prop: &Value,
    depth: usize,
) -> Result<Value, OrchestratorError> {
    if depth > MAX_DEPTH {
        return Err(reject(tool, format!("property '{name}' exceeds depth limit")));
    }
    let obj = prop
        .as_object()
        .ok_or_else(|| reject(tool, format!("property '{name}' must be an object schema")))?;
    if obj.contains_key("$ref") {
        return Err(reject(tool, format!("property '{name}' uses $ref indirection")));
    }

    let mut out = obj.clone();

    // ["string","null"] unions collapse to a nullable scalar.
    if let Some(Value::Array(types)) = obj.get("type") {
        let non_null: Vec<&str> = types
            .iter()
            .filter_map(|t| t.as_str())
            .filter(|t| *t != "null")
            .collect();
        match non_null.as_slice() {
            [single] => {
                out.insert("type".to_string(), Value::String(single.to_string()));
                out.insert("nullable".to_string(), Value::Bool(true));
            }
            _ => {
                return Err(reject(
                    tool,
                    format!("property '{name}' has an unbounded union type"),
                ))
            }
        }
    }

    let prop_type = out
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string());
    match prop_type.as_deref() {
        Some("array") => {
            let items = obj.get("items").ok_or_else(|| {
                reject(tool, format!("array property '{name}' must declare element schema"))
            })?;
            let adapted_items = match items.get("type").and_then(|t| t.as_str()) {
                Some("object") => adapt_object(tool, items, depth + 1)?,
                Some(_) | None => adapt_property(tool, &format!("{name}[]"), items, depth + 1)?,
            };
            out.insert("items".to_string(), adapted_items);
        }
        Some("object") => {
            return adapt_object(tool, prop, depth + 1);
        }
        _ => {}
    }

    Ok(Value::Object(out))
}
