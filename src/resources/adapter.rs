use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    actions::ResourceFailure,
    error::{Result, enumeration_error},
    keypath::KeyPath,
    provider::Session,
    resources::{
        Resource, ResourceTypeDescriptor, scalar_string,
        tags::{TAGS_KEY, normalize_tags},
    },
};

/// One page of a list operation.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Resource>,
    /// Continuation token for the next request, when more pages exist.
    pub next: Option<Value>,
}

/// Result of augmenting one chunk: enriched resources plus the ones that failed.
#[derive(Debug, Default)]
pub struct AugmentBatch {
    pub resources: Vec<Resource>,
    pub dropped: Vec<ResourceFailure>,
}

/// Provider-side list/detail primitives for one resource type.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    async fn list_page(
        &self,
        session: &dyn Session,
        descriptor: &ResourceTypeDescriptor,
        params: &Map<String, Value>,
        token: Option<&Value>,
    ) -> Result<Page>;

    /// Whether `list_page` accepts a list of identities (fetch-by-id).
    fn supports_ids(&self, descriptor: &ResourceTypeDescriptor) -> bool {
        descriptor.enum_spec.ids_param.is_some()
    }

    /// Request parameters restricting a listing to `ids`.
    fn ids_params(&self, descriptor: &ResourceTypeDescriptor, ids: &[String]) -> Map<String, Value> {
        let mut params = descriptor.enum_spec.params.clone();
        if let Some(param) = &descriptor.enum_spec.ids_param {
            params.insert(
                param.clone(),
                Value::Array(ids.iter().map(|id| Value::from(id.as_str())).collect()),
            );
        }
        params
    }

    async fn augment(
        &self,
        session: &dyn Session,
        descriptor: &ResourceTypeDescriptor,
        chunk: Vec<Resource>,
    ) -> Result<AugmentBatch>;

    /// Brings a raw item into canonical shape (tags as a `{Key, Value}` list).
    fn normalize(&self, descriptor: &ResourceTypeDescriptor, resource: &mut Resource) {
        normalize_tags(resource, &descriptor.tags_key);
    }
}

/// Adapter driven entirely by the descriptor's `enum_spec` and `detail_spec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclarativeAdapter;

fn compile(expression: &str, descriptor: &ResourceTypeDescriptor) -> Result<KeyPath> {
    KeyPath::parse(expression).map_err(|err| {
        enumeration_error(format!(
            "resource type '{}' has an invalid key path '{expression}': {err}",
            descriptor.full_name()
        ))
    })
}

/// Objects found at `path`, flattening one level of nesting. Scalars become
/// `{<id key>: scalar}`.
fn extract_items(response: &Value, path: &KeyPath, id_key: &str) -> Vec<Resource> {
    let found = path.search(response);
    let mut items = Vec::new();
    let mut push = |value: Value| match value {
        Value::Object(map) => items.push(map),
        Value::Null => {}
        scalar => {
            let mut map = Map::new();
            map.insert(id_key.to_string(), scalar);
            items.push(map);
        }
    };
    match found {
        Value::Array(values) => values.into_iter().for_each(&mut push),
        other => push(other),
    }
    items
}

fn merge_detail(resource: &mut Resource, detail: Value, annotate_key: Option<&str>) {
    match (annotate_key, detail) {
        (Some(key), detail) => {
            resource.insert(key.to_string(), detail);
        }
        (None, Value::Object(fields)) => {
            for (key, value) in fields {
                resource.entry(key).or_insert(value);
            }
        }
        (None, _) => {}
    }
}

#[async_trait]
impl ResourceAdapter for DeclarativeAdapter {
    async fn list_page(
        &self,
        session: &dyn Session,
        descriptor: &ResourceTypeDescriptor,
        params: &Map<String, Value>,
        token: Option<&Value>,
    ) -> Result<Page> {
        let spec = &descriptor.enum_spec;
        let mut request = params.clone();
        if let (Some(continuation), Some(token)) = (&spec.continuation, token) {
            request.insert(continuation.request_param.clone(), token.clone());
        }
        let response = session
            .call(&spec.operation, &Value::Object(request))
            .await
            .map_err(|err| {
                enumeration_error(format!(
                    "{} {} failed: {}",
                    descriptor.full_name(),
                    spec.operation,
                    err.message
                ))
            })?;

        let path = compile(&spec.result_path, descriptor)?;
        let mut items = extract_items(&response, &path, &descriptor.id);
        for item in &mut items {
            self.normalize(descriptor, item);
        }

        let next = match &spec.continuation {
            Some(continuation) => {
                let token = compile(&continuation.response_token, descriptor)?.search(&response);
                match token {
                    Value::Null => None,
                    Value::String(text) if text.is_empty() => None,
                    token => Some(token),
                }
            }
            None => None,
        };
        Ok(Page { items, next })
    }

    async fn augment(
        &self,
        session: &dyn Session,
        descriptor: &ResourceTypeDescriptor,
        chunk: Vec<Resource>,
    ) -> Result<AugmentBatch> {
        let Some(spec) = &descriptor.detail_spec else {
            return Ok(AugmentBatch {
                resources: chunk,
                dropped: Vec::new(),
            });
        };
        let id_key = spec.id_key.as_deref().unwrap_or(&descriptor.id);
        let result_path = spec
            .result_path
            .as_deref()
            .map(|path| compile(path, descriptor))
            .transpose()?;
        let ids: Vec<Option<Value>> = chunk.iter().map(|r| r.get(id_key).cloned()).collect();

        let mut request = Map::new();
        if spec.batch_size > 1 {
            request.insert(
                spec.param.clone(),
                Value::Array(ids.iter().flatten().cloned().collect()),
            );
        } else if let Some(Some(id)) = ids.first() {
            request.insert(spec.param.clone(), id.clone());
        }
        let response = session.call(&spec.operation, &Value::Object(request)).await?;
        let detail = match &result_path {
            Some(path) => path.search(&response),
            None => response,
        };

        let mut batch = AugmentBatch::default();
        if spec.batch_size > 1 {
            let mut by_id: HashMap<String, Value> = HashMap::new();
            if let Value::Array(details) = detail {
                for item in details {
                    if let Some(id) = item.get(id_key).and_then(scalar_string) {
                        by_id.entry(id).or_insert(item);
                    }
                }
            }
            for (mut resource, id) in chunk.into_iter().zip(ids) {
                let id = id.as_ref().and_then(scalar_string).unwrap_or_default();
                match by_id.remove(&id) {
                    Some(item) => {
                        merge_detail(&mut resource, item, spec.annotate_key.as_deref());
                        self.normalize(descriptor, &mut resource);
                        batch.resources.push(resource);
                    }
                    None => batch
                        .dropped
                        .push(ResourceFailure::new(id, "detail missing from response")),
                }
            }
        } else {
            let detail = match detail {
                Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
                other => other,
            };
            for mut resource in chunk {
                if detail.is_null() {
                    let id = resource.get(id_key).and_then(scalar_string).unwrap_or_default();
                    batch
                        .dropped
                        .push(ResourceFailure::new(id, "detail missing from response"));
                    continue;
                }
                merge_detail(&mut resource, detail.clone(), spec.annotate_key.as_deref());
                if resource.contains_key(&descriptor.tags_key) || resource.contains_key(TAGS_KEY) {
                    self.normalize(descriptor, &mut resource);
                }
                batch.resources.push(resource);
            }
        }
        Ok(batch)
    }
}
