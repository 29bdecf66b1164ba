pub mod adapter;
pub mod cache;
pub mod manager;
pub mod pipeline;
pub mod tags;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::{Result, policy_validation}, filters::related::RelatedSpec};

pub use adapter::{DeclarativeAdapter, Page, ResourceAdapter};
pub use cache::{CacheKey, FileCache, MemoryCache, NullCache, ResourceCache};
pub use manager::{ManagerOptions, ResourceManager};
pub use tags::{Tag, TagAdapter};

/// One cloud object as a loosely typed attribute bag.
pub type Resource = Map<String, Value>;

pub const ANNOTATION_PREFIX: &str = "c7n:";
pub const ACTIONS_ANNOTATION: &str = "c7n:Actions";
pub const MATCHED_FILTERS_ANNOTATION: &str = "c7n:MatchedFilters";
pub const PARENT_ID_ANNOTATION: &str = "c7n:parent-id";

/// Borrowed resource paired with its run identity.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRef<'a> {
    pub id: &'a str,
    pub resource: &'a Resource,
}

/// Appends `values` to the list annotation `key`, skipping entries already present.
/// Existing entries are never removed or rewritten.
pub fn annotate_append(resource: &mut Resource, key: &str, values: impl IntoIterator<Item = Value>) {
    let slot = resource
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        let previous = std::mem::take(slot);
        *slot = Value::Array(vec![previous]);
    }
    if let Value::Array(items) = slot {
        for value in values {
            if !items.contains(&value) {
                items.push(value);
            }
        }
    }
}

pub fn annotation<'a>(resource: &'a Resource, key: &str) -> &'a [Value] {
    resource
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn default_result_path() -> String {
    "@".to_string()
}

/// Declarative enumeration: one list operation, a result key path, and optional paging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumSpec {
    pub operation: String,
    #[serde(default = "default_result_path")]
    pub result_path: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub continuation: Option<Continuation>,
    /// Request parameter accepting a list of identities; enables fetch-by-id.
    #[serde(default)]
    pub ids_param: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    /// Key path of the next-page token in a response.
    pub response_token: String,
    /// Request parameter receiving the token.
    pub request_param: String,
}

fn default_detail_batch() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailSpec {
    pub operation: String,
    /// Request parameter receiving the identity (or list of identities when batched).
    pub param: String,
    /// Resource key supplying the identity; defaults to the descriptor id.
    #[serde(default)]
    pub id_key: Option<String>,
    #[serde(default)]
    pub result_path: Option<String>,
    #[serde(default = "default_detail_batch")]
    pub batch_size: usize,
    /// Key under which the detail is stored; merged into the resource when absent.
    #[serde(default)]
    pub annotate_key: Option<String>,
    #[serde(default)]
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentSpec {
    /// Full type name of the parent, e.g. `aws.ecs`.
    pub parent_type: String,
    /// Request parameter of the child list operation receiving the parent value.
    pub param: String,
    /// Parent key supplying that value; defaults to the parent identity.
    #[serde(default)]
    pub parent_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSpec {
    pub add_operation: String,
    pub remove_operation: String,
    #[serde(default = "default_ids_param")]
    pub ids_param: String,
    #[serde(default = "default_tag_batch")]
    pub batch_size: usize,
}

fn default_ids_param() -> String {
    "ResourceIds".to_string()
}

fn default_tag_batch() -> usize {
    20
}

fn default_tags_key() -> String {
    tags::TAGS_KEY.to_string()
}

/// Immutable metadata for one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeDescriptor {
    pub provider: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub service: Option<String>,
    /// Identity key.
    pub id: String,
    /// Display name key.
    #[serde(default)]
    pub name: Option<String>,
    /// Creation timestamp key.
    #[serde(default)]
    pub date: Option<String>,
    pub enum_spec: EnumSpec,
    #[serde(default)]
    pub detail_spec: Option<DetailSpec>,
    #[serde(default)]
    pub parent_spec: Option<ParentSpec>,
    #[serde(default)]
    pub tag_spec: Option<TagSpec>,
    /// Key of the native tag collection, normalised to `Tags` during augment.
    #[serde(default = "default_tags_key")]
    pub tags_key: String,
    /// Key path extracting resource identities from an event payload.
    #[serde(default)]
    pub event_ids: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub arn_type: Option<String>,
    #[serde(default)]
    pub related: Vec<RelatedSpec>,
}

impl ResourceTypeDescriptor {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.provider, self.type_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider.is_empty() || self.type_name.is_empty() || self.id.is_empty() {
            return Err(policy_validation(format!(
                "resource type '{}' must declare provider, type and id",
                self.full_name()
            )));
        }
        if self.enum_spec.operation.is_empty() {
            return Err(policy_validation(format!(
                "resource type '{}' has no list operation",
                self.full_name()
            )));
        }
        if let Some(detail) = &self.detail_spec
            && detail.batch_size == 0
        {
            return Err(policy_validation(format!(
                "resource type '{}' detail batch_size must be positive",
                self.full_name()
            )));
        }
        Ok(())
    }

    /// Native identity value of `resource` as a string.
    pub fn native_id(&self, resource: &Resource) -> Option<String> {
        resource.get(&self.id).and_then(scalar_string)
    }
}

pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{Resource, ResourceTypeDescriptor, annotate_append, annotation};

    #[test]
    fn annotations_only_grow() {
        let mut resource = Resource::new();
        annotate_append(&mut resource, "c7n:MatchedFilters", [json!("State.Name")]);
        annotate_append(
            &mut resource,
            "c7n:MatchedFilters",
            [json!("State.Name"), json!("tag:Env")],
        );
        assert_eq!(
            annotation(&resource, "c7n:MatchedFilters"),
            &[json!("State.Name"), json!("tag:Env")]
        );

        resource.insert("c7n:legacy".to_string(), json!("scalar"));
        annotate_append(&mut resource, "c7n:legacy", [json!("next")]);
        assert_eq!(resource["c7n:legacy"], json!(["scalar", "next"]));
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let descriptor: ResourceTypeDescriptor = serde_json::from_value(json!({
            "provider": "aws",
            "type": "ec2",
            "id": "InstanceId",
            "enum_spec": {"operation": "DescribeInstances", "result_path": "Reservations[].Instances[]"}
        }))
        .expect("descriptor should parse");

        assert_eq!(descriptor.full_name(), "aws.ec2");
        assert_eq!(descriptor.tags_key, "Tags");
        assert!(descriptor.enum_spec.continuation.is_none());
        descriptor.validate().expect("descriptor should validate");

        let mut resource = Resource::new();
        resource.insert("InstanceId".to_string(), Value::from(42));
        assert_eq!(descriptor.native_id(&resource).as_deref(), Some("42"));
    }
}
