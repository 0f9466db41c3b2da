//! JSON-schema lowering for providers with strict protobuf schema types
//! (Gemini and its Antigravity dialect).
//!
//! The provider accepts a narrow schema subset: no `$ref`, no `const`, no
//! composition keywords, and SCREAMING type names. Everything the subset
//! cannot express is folded into `description` hints so the model still
//! sees the constraint.

use serde_json::{Map, Value};

const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$schema",
    "$defs",
    "definitions",
    "const",
    "$ref",
    "additionalProperties",
    "propertyNames",
    "title",
    "$id",
    "$comment",
];

const HINTED_KEYWORDS: &[&str] = &[
    "minLength",
    "maxLength",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "pattern",
    "minItems",
    "maxItems",
    "format",
    "default",
    "examples",
];

/// Lower a schema fragment into the provider-accepted subset and uppercase
/// all `type` values.
pub fn sanitize(schema: &Value) -> Value {
    let mut out = schema.clone();
    sanitize_node(&mut out);
    uppercase_types(&mut out);
    out
}

fn sanitize_node(node: &mut Value) {
    let Some(obj) = node.as_object_mut() else {
        return;
    };

    replace_ref(obj);
    merge_all_of(obj);
    flatten_any_of(obj);
    flatten_nullable_type(obj);

    if let Some(constant) = obj.remove("const") {
        obj.insert("enum".to_string(), Value::Array(vec![constant]));
    }
    hint_enum(obj);

    if obj.get("additionalProperties") == Some(&Value::Bool(false)) {
        append_description(obj, "No extra properties allowed");
    }
    hint_constraints(obj);

    for keyword in UNSUPPORTED_KEYWORDS {
        obj.remove(*keyword);
    }

    recurse_children(obj);
    prune_required(obj);
    synthesize_placeholder(obj);
}

/// Step 1: a `$ref` becomes an opaque object pointing the model at the
/// referenced definition by name.
fn replace_ref(obj: &mut Map<String, Value>) {
    let Some(reference) = obj.get("$ref").and_then(Value::as_str) else {
        return;
    };
    let name = reference.rsplit('/').next().unwrap_or(reference).to_string();
    obj.clear();
    obj.insert("type".to_string(), Value::String("object".to_string()));
    obj.insert("description".to_string(), Value::String(format!("See: {name}")));
}

/// Step 6: fold `allOf` branches into the parent. Properties union with
/// first-wins, `required` unions in order, other fields first-wins.
fn merge_all_of(obj: &mut Map<String, Value>) {
    let Some(Value::Array(branches)) = obj.remove("allOf") else {
        return;
    };
    let mut properties = obj
        .remove("properties")
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    let mut required: Vec<Value> = obj
        .remove("required")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    for branch in branches {
        let Some(branch) = branch.as_object() else {
            continue;
        };
        if let Some(branch_props) = branch.get("properties").and_then(Value::as_object) {
            for (key, value) in branch_props {
                properties.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if let Some(branch_required) = branch.get("required").and_then(Value::as_array) {
            for entry in branch_required {
                if !required.contains(entry) {
                    required.push(entry.clone());
                }
            }
        }
        for (key, value) in branch {
            if key == "properties" || key == "required" {
                continue;
            }
            obj.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    if !properties.is_empty() {
        obj.insert("properties".to_string(), Value::Object(properties));
    }
    if !required.is_empty() {
        obj.insert("required".to_string(), Value::Array(required));
    }
}

/// Step 7: flatten `anyOf`/`oneOf` to a single branch the provider can take.
fn flatten_any_of(obj: &mut Map<String, Value>) {
    let branches = match (obj.remove("anyOf"), obj.remove("oneOf")) {
        (Some(Value::Array(a)), _) => a,
        (_, Some(Value::Array(o))) => o,
        _ => return,
    };
    if branches.is_empty() {
        return;
    }

    if let Some(merged) = merge_primitive_branches(&branches) {
        obj.insert("type".to_string(), Value::String("string".to_string()));
        obj.insert("enum".to_string(), Value::Array(merged));
        return;
    }

    let accepts = branches
        .iter()
        .map(branch_type_name)
        .collect::<Vec<_>>()
        .join(" | ");
    let best = branches
        .iter()
        .max_by_key(|branch| branch_score(branch))
        .cloned()
        .unwrap_or(Value::Null);

    let parent_description = obj.get("description").and_then(Value::as_str).map(str::to_string);
    if let Some(best) = best.as_object() {
        for (key, value) in best {
            if key == "description" {
                continue;
            }
            obj.insert(key.clone(), value.clone());
        }
        let child_description = best.get("description").and_then(Value::as_str);
        match (parent_description, child_description) {
            (Some(parent), Some(child)) => {
                obj.insert(
                    "description".to_string(),
                    Value::String(format!("{parent} ({child})")),
                );
            }
            (None, Some(child)) => {
                obj.insert("description".to_string(), Value::String(child.to_string()));
            }
            _ => {}
        }
    }
    append_description(obj, &format!("Accepts: {accepts}"));
}

/// Every branch carries only `const` or an `enum` of primitives: merge them
/// into one string enum.
fn merge_primitive_branches(branches: &[Value]) -> Option<Vec<Value>> {
    let mut merged = Vec::new();
    for branch in branches {
        let branch = branch.as_object()?;
        if let Some(constant) = branch.get("const") {
            if !is_primitive(constant) {
                return None;
            }
            if !merged.contains(constant) {
                merged.push(constant.clone());
            }
        } else if let Some(Value::Array(values)) = branch.get("enum") {
            for value in values {
                if !is_primitive(value) {
                    return None;
                }
                if !merged.contains(value) {
                    merged.push(value.clone());
                }
            }
        } else {
            return None;
        }
    }
    Some(merged)
}

fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn branch_type_name(branch: &Value) -> String {
    branch
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

fn branch_score(branch: &Value) -> u8 {
    match branch.get("type").and_then(Value::as_str) {
        Some("object") => 3,
        Some("array") => 2,
        Some("null") | None => 0,
        Some(_) => 1,
    }
}

/// Step 8: `type: ["T","null"]` collapses to `T` with a `nullable` hint.
fn flatten_nullable_type(obj: &mut Map<String, Value>) {
    let Some(Value::Array(types)) = obj.get("type") else {
        return;
    };
    let non_null: Vec<String> = types
        .iter()
        .filter_map(Value::as_str)
        .filter(|t| *t != "null")
        .map(str::to_string)
        .collect();
    let had_null = types.iter().filter_map(Value::as_str).any(|t| t == "null");
    if let Some(first) = non_null.first() {
        obj.insert("type".to_string(), Value::String(first.clone()));
        if had_null {
            append_description(obj, "nullable");
        }
    }
}

fn is_nullable_type(value: &Value) -> bool {
    value
        .get("type")
        .and_then(Value::as_array)
        .is_some_and(|types| types.iter().filter_map(Value::as_str).any(|t| t == "null"))
}

/// Step 3: small primitive enums get an inline `Allowed:` reminder.
fn hint_enum(obj: &mut Map<String, Value>) {
    let Some(Value::Array(values)) = obj.get("enum") else {
        return;
    };
    if !(2..=10).contains(&values.len()) || !values.iter().all(is_primitive) {
        return;
    }
    let listed = values
        .iter()
        .map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ");
    append_description(obj, &format!("Allowed: {listed}"));
}

/// Step 5: validation keywords the provider drops become description hints.
fn hint_constraints(obj: &mut Map<String, Value>) {
    for keyword in HINTED_KEYWORDS {
        let Some(value) = obj.remove(*keyword) else {
            continue;
        };
        let rendered = match &value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        append_description(obj, &format!("{keyword}: {rendered}"));
    }
}

fn recurse_children(obj: &mut Map<String, Value>) {
    let mut nullable_props: Vec<String> = Vec::new();
    if let Some(Value::Object(properties)) = obj.get_mut("properties") {
        for (name, child) in properties.iter_mut() {
            if is_nullable_type(child) {
                nullable_props.push(name.clone());
            }
            sanitize_node(child);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        sanitize_node(items);
    }
    // Step 8 tail: nullable fields may no longer be required.
    if !nullable_props.is_empty()
        && let Some(Value::Array(required)) = obj.get_mut("required")
    {
        required.retain(|entry| {
            entry
                .as_str()
                .map(|name| !nullable_props.iter().any(|p| p == name))
                .unwrap_or(true)
        });
    }
}

/// Step 10: `required` may only name declared properties.
fn prune_required(obj: &mut Map<String, Value>) {
    let property_names: Vec<String> = obj
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default();
    if let Some(Value::Array(required)) = obj.get_mut("required") {
        required.retain(|entry| {
            entry
                .as_str()
                .map(|name| property_names.iter().any(|p| p == name))
                .unwrap_or(false)
        });
        if required.is_empty() {
            obj.remove("required");
        }
    }
}

/// Step 11: the provider rejects objects without properties; give them one.
fn synthesize_placeholder(obj: &mut Map<String, Value>) {
    if obj.get("type").and_then(Value::as_str) != Some("object") {
        return;
    }
    let empty = obj
        .get("properties")
        .and_then(Value::as_object)
        .map(Map::is_empty)
        .unwrap_or(true);
    if !empty {
        return;
    }
    obj.insert(
        "properties".to_string(),
        serde_json::json!({
            "_placeholder": {
                "type": "boolean",
                "description": "Placeholder. Always pass true."
            }
        }),
    );
    obj.insert("required".to_string(), serde_json::json!(["_placeholder"]));
}

fn append_description(obj: &mut Map<String, Value>, text: &str) {
    let current = obj.get("description").and_then(Value::as_str).unwrap_or("");
    let merged = if current.is_empty() {
        text.to_string()
    } else {
        format!("{current}. {text}")
    };
    obj.insert("description".to_string(), Value::String(merged));
}

/// Step 12: `object` -> `OBJECT` and friends, recursively.
pub fn uppercase_types(node: &mut Value) {
    match node {
        Value::Object(obj) => {
            if let Some(Value::String(type_name)) = obj.get_mut("type") {
                *type_name = type_name.to_ascii_uppercase();
            }
            for (key, child) in obj.iter_mut() {
                match key.as_str() {
                    "properties" => {
                        if let Value::Object(props) = child {
                            for value in props.values_mut() {
                                uppercase_types(value);
                            }
                        }
                    }
                    "items" | "anyOf" | "oneOf" | "allOf" => uppercase_types(child),
                    _ => {}
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                uppercase_types(item);
            }
        }
        _ => {}
    }
}
