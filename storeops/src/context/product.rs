//! Product payload stripping for context embedding.
//!
//! Product reads return large administrative payloads; only the keys an
//! agent can act on are kept. Timestamps, legacy ids, publication scopes,
//! selling-plan data, tax metadata, presentment prices, and storefront ids
//! are all dropped. Stripping is idempotent.

use serde_json::{Map, Value};

const KEEP_KEYS: &[&str] = &[
    "id",
    "title",
    "handle",
    "sku",
    "vendor",
    "productType",
    "status",
    "price",
    "compareAtPrice",
    "tags",
    "descriptionHtml",
    "inventoryQuantity",
    "inventoryPolicy",
    "totalInventory",
    "variants",
    "metafields",
    "images",
];

const METAFIELD_KEYS: &[&str] = &["namespace", "key", "value", "type"];

pub fn strip_product_keys(product: &Value) -> Value {
    let obj = match product.as_object() {
        Some(obj) => obj,
        None => return product.clone(),
    };
    let mut out = Map::new();
    for key in KEEP_KEYS {
        let Some(value) = obj.get(*key) else { continue };
        let stripped = match *key {
            "variants" => strip_array(value, strip_product_keys),
            "metafields" => strip_array(value, strip_metafield),
            "images" => strip_array(value, strip_image),
            _ => value.clone(),
        };
        out.insert(key.to_string(), stripped);
    }
    Value::Object(out)
}

fn strip_array(value: &Value, f: fn(&Value) -> Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(f).collect()),
        // Connection-style wrappers ({"nodes": [...]}) flatten to the list.
        Value::Object(obj) => match obj.get("nodes").or_else(|| obj.get("edges")) {
            Some(Value::Array(items)) => Value::Array(items.iter().map(f).collect()),
            _ => f(value),
        },
        other => other.clone(),
    }
}

fn strip_metafield(value: &Value) -> Value {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return value.clone(),
    };
    let mut out = Map::new();
    for key in METAFIELD_KEYS {
        if let Some(v) = obj.get(*key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    Value::Object(out)
}

fn strip_image(value: &Value) -> Value {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return value.clone(),
    };
    let mut out = Map::new();
    for key in ["url", "altText"] {
        if let Some(v) = obj.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    Value::Object(out)
}
