//! Provider object → flat property map.
//!
//! Graph entities only hold scalars (and lists of scalars), so every provider
//! response object is flattened before it is upserted. Tags are lifted into
//! individual `tag_<key>` properties so they can be matched directly.

use serde_json::Value;

use crate::types::Properties;

/// Prefix applied to properties extracted from a `tags` list.
pub const TAG_PREFIX: &str = "tag_";

/// Maps provider objects to flat, immutable property maps.
#[derive(Debug, Clone, Default)]
pub struct PropertyMapper {
    prefix: String,
    flatten_nested: bool,
}

impl PropertyMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every top-level property name.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Flatten nested objects into `parent_child` properties instead of
    /// dropping them.
    pub fn with_flatten_nested(mut self, flatten_nested: bool) -> Self {
        self.flatten_nested = flatten_nested;
        self
    }

    /// Flatten a provider object. Non-object input yields an empty map.
    pub fn to_properties(&self, object: &Value) -> Properties {
        let mut out = Properties::new();
        if let Value::Object(map) = object {
            self.flatten_into(&mut out, &self.prefix, map);
            extract_tags(&mut out, object);
        }
        out
    }

    fn flatten_into(&self, out: &mut Properties, prefix: &str, src: &serde_json::Map<String, Value>) {
        for (name, value) in src {
            let key = format!("{prefix}{}", property_name(name));
            match value {
                Value::Null => {}
                Value::Object(nested) => {
                    if self.flatten_nested {
                        self.flatten_into(out, &format!("{key}_"), nested);
                    }
                }
                Value::Array(items) => {
                    if !items.is_empty() && items.iter().all(is_scalar) {
                        out.insert(key, value.clone());
                    }
                }
                scalar => {
                    out.insert(key, scalar.clone());
                }
            }
        }
    }
}

/// Flatten with the default mapper (no prefix, nested objects dropped).
pub fn flatten(object: &Value) -> Properties {
    PropertyMapper::default().to_properties(object)
}

/// Lower-case a leading capital so `VpcId` and `vpcId` map to the same name.
fn property_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => first.to_lowercase().chain(chars).collect(),
        _ => name.to_string(),
    }
}

fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn extract_tags(out: &mut Properties, object: &Value) {
    let tags = object
        .get("tags")
        .or_else(|| object.get("Tags"))
        .and_then(Value::as_array);

    for tag in tags.into_iter().flatten() {
        let key = tag.get("key").or_else(|| tag.get("Key")).and_then(Value::as_str);
        let value = tag.get("value").or_else(|| tag.get("Value"));
        if let (Some(key), Some(value)) = (key, value) {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.insert(format!("{TAG_PREFIX}{key}"), Value::String(value));
        }
    }
}
