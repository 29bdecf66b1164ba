//! JSONSchema fragments, policy schema assembly and document validation.
//!
//! Validation never binds sessions: it resolves plugin names through registries and checks
//! each fragment against the schema its plugin declared.

use std::collections::BTreeMap;

use jsonschema::JSONSchema;
use schemars::{JsonSchema, r#gen::SchemaSettings};
use serde_json::{Map, Value, json};

use crate::{
    actions::ActionFactory,
    error::{CustodianError, Result, internal_error, policy_validation},
    filters::{BooleanOp, FilterFactory, boolean, shorthand},
    modes::ModeFactory,
    registry::Registry,
    resources::manager::ResourceResolver,
};

pub const POLICY_NAME_PATTERN: &str = "^[A-Za-z][A-Za-z0-9]*(-*[A-Za-z0-9]+)*$";

/// Object schema with a `type` discriminator fixed to `name`.
pub fn type_schema(name: &str, properties: Value, required: &[&str]) -> Value {
    let mut props = Map::new();
    props.insert("type".to_string(), json!({"enum": [name]}));
    if let Value::Object(extra) = properties {
        props.extend(extra);
    }
    let mut required_keys = vec![Value::from("type")];
    required_keys.extend(required.iter().map(|key| Value::from(*key)));
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": required_keys,
        "properties": props,
    })
}

/// Inline draft-07 schema derived from a Rust type.
pub fn typed_schema<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|settings| settings.inline_subschemas = true)
        .into_generator();
    let root = generator.into_root_schema_for::<T>();
    let mut value = serde_json::to_value(root).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
        map.remove("definitions");
    }
    value
}

/// Checks `instance` against `schema`, reporting the first violation with its document path.
pub fn check_instance(schema: &Value, instance: &Value, path: &str) -> Result<()> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|err| internal_error(format!("invalid plugin schema: {err}")))?;
    let outcome = compiled.validate(instance);
    let Err(mut errors) = outcome else {
        return Ok(());
    };
    match errors.next() {
        Some(error) => Err(policy_validation(error.to_string())
            .with_path(format!("{path}{}", error.instance_path))),
        None => Ok(()),
    }
}

/// Envelope of one policy; filters and actions are checked per plugin afterwards.
pub fn policy_envelope_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["name", "resource"],
        "properties": {
            "name": {"type": "string", "pattern": POLICY_NAME_PATTERN},
            "resource": {"type": "string"},
            "description": {"type": "string"},
            "comment": {"type": "string"},
            "comments": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "metadata": {"type": "object"},
            "mode": {
                "type": "object",
                "required": ["type"],
                "properties": {"type": {"type": "string"}}
            },
            "conditions": {"type": "array"},
            "filters": {"type": "array"},
            "actions": {"type": "array"},
            "max-resources": {"type": "integer", "minimum": 0},
            "max-resources-percent": {"type": "number", "minimum": 0, "maximum": 100}
        }
    })
}

/// Collects every violation in a `{policies: [...]}` document. Empty means valid.
pub fn document_errors(
    document: &Value,
    resolver: &dyn ResourceResolver,
    defaults: &Registry<FilterFactory>,
    modes: &Registry<ModeFactory>,
) -> Vec<CustodianError> {
    let Value::Object(root) = document else {
        return vec![policy_validation("policy document must be a mapping").with_path("")];
    };
    let mut errors = Vec::new();
    for key in root.keys().filter(|key| key.as_str() != "policies") {
        errors.push(
            policy_validation(format!("unexpected top-level key '{key}'"))
                .with_path(format!("/{key}")),
        );
    }
    let Some(Value::Array(policies)) = root.get("policies") else {
        errors.push(policy_validation("'policies' must be a list").with_path("/policies"));
        return errors;
    };

    let mut names: BTreeMap<&str, usize> = BTreeMap::new();
    for (index, policy) in policies.iter().enumerate() {
        let path = format!("/policies/{index}");
        if let Err(err) = validate_policy(policy, &path, resolver, defaults, modes) {
            errors.push(err);
            continue;
        }
        if let Some(name) = policy.get("name").and_then(Value::as_str)
            && let Some(first) = names.insert(name, index)
        {
            errors.push(
                policy_validation(format!(
                    "duplicate policy name '{name}' (first defined at /policies/{first})"
                ))
                .with_path(format!("{path}/name")),
            );
        }
    }
    errors
}

/// Validates one policy fragment located at `path`.
pub fn validate_policy(
    policy: &Value,
    path: &str,
    resolver: &dyn ResourceResolver,
    defaults: &Registry<FilterFactory>,
    modes: &Registry<ModeFactory>,
) -> Result<()> {
    check_instance(&policy_envelope_schema(), policy, path)?;
    let resource = policy
        .get("resource")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let resource_type = resolver
        .resource_type(resource)
        .map_err(|err| err.with_path(format!("{path}/resource")))?;

    if let Some(mode) = policy.get("mode") {
        validate_mode(mode, &format!("{path}/mode"), modes)?;
    }
    for (index, item) in list(policy, "conditions").iter().enumerate() {
        validate_filter(item, &format!("{path}/conditions/{index}"), defaults)?;
    }
    for (index, item) in list(policy, "filters").iter().enumerate() {
        validate_filter(item, &format!("{path}/filters/{index}"), &resource_type.filters)?;
    }
    for (index, item) in list(policy, "actions").iter().enumerate() {
        validate_action(item, &format!("{path}/actions/{index}"), &resource_type.actions)?;
    }
    Ok(())
}

fn list<'a>(policy: &'a Value, key: &str) -> &'a [Value] {
    policy
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn validate_filter(
    filter: &Value,
    path: &str,
    registry: &Registry<FilterFactory>,
) -> Result<()> {
    let Value::Object(map) = filter else {
        return Err(policy_validation("filter must be a mapping").with_path(path));
    };
    if let Some(op) = BooleanOp::from_mapping(map) {
        let key = if map.contains_key(op.as_str()) {
            op.as_str()
        } else {
            "filters"
        };
        let children = boolean::children(op, map).ok_or_else(|| {
            policy_validation(format!("'{}' requires a list of filters", op.as_str()))
                .with_path(path)
        })?;
        for (index, child) in children.iter().enumerate() {
            validate_filter(child, &format!("{path}/{key}/{index}"), registry)?;
        }
        return Ok(());
    }
    match map.get("type") {
        Some(Value::String(name)) => {
            let schema = registry
                .schema_for(name)
                .ok_or_else(|| registry.unknown(name).with_path(format!("{path}/type")))?;
            check_instance(&schema, filter, path)
        }
        Some(_) => Err(policy_validation("filter type must be a string").with_path(path)),
        None => {
            let expanded = shorthand(map).ok_or_else(|| {
                policy_validation("filter is missing 'type'").with_path(path)
            })?;
            let schema = registry.schema_for("value").ok_or_else(|| registry.unknown("value"))?;
            check_instance(&schema, &Value::Object(expanded), path)
        }
    }
}

pub fn validate_action(
    action: &Value,
    path: &str,
    registry: &Registry<ActionFactory>,
) -> Result<()> {
    let (name, instance) = match action {
        Value::String(name) => (name.as_str(), json!({"type": name})),
        Value::Object(map) => match map.get("type") {
            Some(Value::String(name)) => (name.as_str(), action.clone()),
            _ => {
                return Err(policy_validation("action is missing 'type'").with_path(path));
            }
        },
        _ => {
            return Err(policy_validation("action must be a mapping or a type name").with_path(path));
        }
    };
    let schema = registry
        .schema_for(name)
        .ok_or_else(|| registry.unknown(name).with_path(format!("{path}/type")))?;
    check_instance(&schema, &instance, path)
}

pub fn validate_mode(mode: &Value, path: &str, modes: &Registry<ModeFactory>) -> Result<()> {
    let name = mode.get("type").and_then(Value::as_str).unwrap_or_default();
    let schema = modes
        .schema_for(name)
        .ok_or_else(|| modes.unknown(name).with_path(format!("{path}/type")))?;
    check_instance(&schema, mode, path)
}

fn union(kind: &str, type_name: &str, names: impl IntoIterator<Item = String>) -> Value {
    let refs: Vec<Value> = names
        .into_iter()
        .map(|name| json!({"$ref": format!("#/definitions/resources/{type_name}/{kind}/{name}")}))
        .collect();
    json!({"type": "array", "items": {"anyOf": refs}})
}

/// One resource type's section of the assembled schema.
pub fn resource_definition(
    type_name: &str,
    filters: &Registry<FilterFactory>,
    actions: &Registry<ActionFactory>,
) -> Value {
    let filter_schemas = filters.schemas();
    let action_schemas = actions.schemas();
    let policy = json!({
        "allOf": [
            {"$ref": "#/definitions/policy"},
            {
                "properties": {
                    "resource": {"enum": [type_name]},
                    "filters": union("filters", type_name, filter_schemas.keys().cloned()),
                    "actions": union("actions", type_name, action_schemas.keys().cloned())
                }
            }
        ]
    });
    json!({
        "policy": policy,
        "filters": filter_schemas,
        "actions": action_schemas,
    })
}

/// Assembled top-level schema: a document of policies, each bound to one resource type.
pub fn assemble(resources: &BTreeMap<String, Value>, modes: &Registry<ModeFactory>) -> Value {
    let policy_refs: Vec<Value> = resources
        .keys()
        .map(|name| json!({"$ref": format!("#/definitions/resources/{name}/policy")}))
        .collect();
    let mut envelope = policy_envelope_schema();
    if let Some(mode) = envelope.pointer_mut("/properties/mode") {
        let mode_refs: Vec<Value> = modes
            .keys()
            .into_iter()
            .map(|name| json!({"$ref": format!("#/definitions/modes/{name}")}))
            .collect();
        *mode = json!({"anyOf": mode_refs});
    }
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "additionalProperties": false,
        "required": ["policies"],
        "properties": {
            "policies": {"type": "array", "items": {"anyOf": policy_refs}}
        },
        "definitions": {
            "policy": envelope,
            "modes": modes.schemas(),
            "resources": resources,
        }
    })
}
