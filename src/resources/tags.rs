use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    actions::ResourceFailure,
    error::{Result, action_error},
    provider::Session,
    resources::{Resource, ResourceRef, TagSpec},
};

pub const TAGS_KEY: &str = "Tags";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Canonical `{Key, Value}` tags of a resource.
pub fn tags_of(resource: &Resource) -> Vec<Tag> {
    resource
        .get(TAGS_KEY)
        .map(tags_from_value)
        .unwrap_or_default()
}

pub fn tag_value(resource: &Resource, key: &str) -> Option<String> {
    tags_of(resource)
        .into_iter()
        .find(|tag| tag.key == key)
        .map(|tag| tag.value)
}

/// Accepts the canonical list, lowercase `{key, value}` items, or a plain `{k: v}` map.
pub fn tags_from_value(value: &Value) -> Vec<Tag> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let key = item.get("Key").or_else(|| item.get("key"))?.as_str()?;
                let value = item
                    .get("Value")
                    .or_else(|| item.get("value"))
                    .map(render_tag_value)
                    .unwrap_or_default();
                Some(Tag::new(key, value))
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| Tag::new(key.clone(), render_tag_value(value)))
            .collect(),
        _ => Vec::new(),
    }
}

fn render_tag_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn tags_to_value(tags: &[Tag]) -> Value {
    Value::Array(
        tags.iter()
            .map(|tag| json!({"Key": tag.key, "Value": tag.value}))
            .collect(),
    )
}

/// Rewrites the native tag collection at `source_key` into the canonical `Tags` list.
pub fn normalize_tags(resource: &mut Resource, source_key: &str) {
    let Some(native) = resource.get(source_key) else {
        return;
    };
    let canonical = tags_to_value(&tags_from_value(native));
    if source_key != TAGS_KEY {
        resource.remove(source_key);
    }
    resource.insert(TAGS_KEY.to_string(), canonical);
}

/// Upserts `tags` into the local canonical list, keeping existing order.
pub fn set_local_tags(resource: &mut Resource, tags: &[Tag]) {
    let mut current = tags_of(resource);
    for tag in tags {
        match current.iter_mut().find(|existing| existing.key == tag.key) {
            Some(existing) => existing.value = tag.value.clone(),
            None => current.push(tag.clone()),
        }
    }
    resource.insert(TAGS_KEY.to_string(), tags_to_value(&current));
}

pub fn remove_local_tags(resource: &mut Resource, keys: &[String]) {
    if !resource.contains_key(TAGS_KEY) {
        return;
    }
    let current: Vec<Tag> = tags_of(resource)
        .into_iter()
        .filter(|tag| !keys.contains(&tag.key))
        .collect();
    resource.insert(TAGS_KEY.to_string(), tags_to_value(&current));
}

/// Tag mutation primitives supplied per resource type.
///
/// Implementations return per-resource failures for partial success and `Err` when the
/// whole chunk failed.
#[async_trait]
pub trait TagAdapter: Send + Sync {
    fn chunk_size(&self) -> usize {
        20
    }

    async fn add_tags(
        &self,
        session: &dyn Session,
        targets: &[ResourceRef<'_>],
        tags: &[Tag],
    ) -> Result<Vec<ResourceFailure>>;

    async fn remove_tags(
        &self,
        session: &dyn Session,
        targets: &[ResourceRef<'_>],
        keys: &[String],
    ) -> Result<Vec<ResourceFailure>>;
}

/// Tag adapter driven by a descriptor's `tag_spec`.
pub struct DeclarativeTagAdapter {
    spec: Option<TagSpec>,
    id_key: String,
}

impl DeclarativeTagAdapter {
    pub fn new(spec: Option<TagSpec>, id_key: impl Into<String>) -> Self {
        Self {
            spec,
            id_key: id_key.into(),
        }
    }

    fn spec(&self) -> Result<&TagSpec> {
        self.spec
            .as_ref()
            .ok_or_else(|| action_error("resource type does not support tagging"))
    }

    fn native_ids(&self, targets: &[ResourceRef<'_>]) -> Vec<Value> {
        targets
            .iter()
            .map(|target| {
                target
                    .resource
                    .get(&self.id_key)
                    .cloned()
                    .unwrap_or_else(|| Value::from(target.id))
            })
            .collect()
    }
}

#[async_trait]
impl TagAdapter for DeclarativeTagAdapter {
    fn chunk_size(&self) -> usize {
        self.spec.as_ref().map(|spec| spec.batch_size.max(1)).unwrap_or(20)
    }

    async fn add_tags(
        &self,
        session: &dyn Session,
        targets: &[ResourceRef<'_>],
        tags: &[Tag],
    ) -> Result<Vec<ResourceFailure>> {
        let spec = self.spec()?;
        let mut params = serde_json::Map::new();
        params.insert(spec.ids_param.clone(), Value::Array(self.native_ids(targets)));
        params.insert("Tags".to_string(), tags_to_value(tags));
        session
            .call(&spec.add_operation, &Value::Object(params))
            .await?;
        Ok(Vec::new())
    }

    async fn remove_tags(
        &self,
        session: &dyn Session,
        targets: &[ResourceRef<'_>],
        keys: &[String],
    ) -> Result<Vec<ResourceFailure>> {
        let spec = self.spec()?;
        let mut params = serde_json::Map::new();
        params.insert(spec.ids_param.clone(), Value::Array(self.native_ids(targets)));
        params.insert("TagKeys".to_string(), json!(keys));
        session
            .call(&spec.remove_operation, &Value::Object(params))
            .await?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Tag, normalize_tags, remove_local_tags, set_local_tags, tag_value, tags_of};
    use crate::resources::Resource;

    fn resource(value: serde_json::Value) -> Resource {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn normalizes_map_and_lowercase_shapes() {
        let mut labels = resource(json!({"labels": {"env": "prod", "team": "core"}}));
        normalize_tags(&mut labels, "labels");
        assert!(labels.get("labels").is_none());
        assert_eq!(tag_value(&labels, "env").as_deref(), Some("prod"));

        let mut lower = resource(json!({"Tags": [{"key": "Owner", "value": "ops"}]}));
        normalize_tags(&mut lower, "Tags");
        assert_eq!(lower["Tags"], json!([{"Key": "Owner", "Value": "ops"}]));
    }

    #[test]
    fn tag_then_remove_restores_prior_tags() {
        let mut r = resource(json!({"Tags": [{"Key": "Env", "Value": "prod"}]}));
        let before = tags_of(&r);

        set_local_tags(&mut r, &[Tag::new("Owner", "ops"), Tag::new("Cost", "42")]);
        assert_eq!(tags_of(&r).len(), 3);

        remove_local_tags(&mut r, &["Owner".to_string(), "Cost".to_string()]);
        assert_eq!(tags_of(&r), before);
    }

    #[test]
    fn upsert_keeps_position() {
        let mut r = resource(json!({"Tags": [{"Key": "A", "Value": "1"}, {"Key": "B", "Value": "2"}]}));
        set_local_tags(&mut r, &[Tag::new("A", "9")]);
        assert_eq!(
            tags_of(&r),
            vec![Tag::new("A", "9"), Tag::new("B", "2")]
        );
    }
}
