//! In-memory provider and session for tests and offline dry runs.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::{
    error::{Result, action_error, configuration_error, dry_run_indication, throttling_error},
    provider::{Provider, ResourceType, Session, SessionOptions},
    resources::{
        Continuation, EnumSpec, Resource, ResourceTypeDescriptor, TagSpec, scalar_string,
        tags::{Tag, remove_local_tags, set_local_tags, tags_from_value},
    },
};

pub const FIXTURE_PROVIDER: &str = "test";
pub const FIXTURE_IDS_PARAM: &str = "Ids";
pub const FIXTURE_TAG_OPERATION: &str = "TagResources";
pub const FIXTURE_UNTAG_OPERATION: &str = "UntagResources";

const RESERVED_PARAMS: [&str; 4] = ["NextToken", FIXTURE_IDS_PARAM, "DryRun", "MaxResults"];

/// `ListTask` for `task`, `ListKmsKey` for `kms-key`.
pub fn list_operation(type_name: &str) -> String {
    let pascal: String = type_name
        .split(['-', '_'])
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    format!("List{pascal}")
}

/// Descriptor served by [`FixtureSession`] collections: paged `List<Type>` results under
/// `Items`, fetch-by-id through `Ids`, and one-resource tag batches.
pub fn fixture_descriptor(type_name: &str, id_key: &str) -> ResourceTypeDescriptor {
    ResourceTypeDescriptor {
        provider: FIXTURE_PROVIDER.to_string(),
        type_name: type_name.to_string(),
        service: None,
        id: id_key.to_string(),
        name: None,
        date: None,
        enum_spec: EnumSpec {
            operation: list_operation(type_name),
            result_path: "Items".to_string(),
            params: Map::new(),
            continuation: Some(Continuation {
                response_token: "NextToken".to_string(),
                request_param: "NextToken".to_string(),
            }),
            ids_param: Some(FIXTURE_IDS_PARAM.to_string()),
        },
        detail_spec: None,
        parent_spec: None,
        tag_spec: Some(TagSpec {
            add_operation: FIXTURE_TAG_OPERATION.to_string(),
            remove_operation: FIXTURE_UNTAG_OPERATION.to_string(),
            ids_param: "ResourceIds".to_string(),
            batch_size: 1,
        }),
        tags_key: crate::resources::tags::TAGS_KEY.to_string(),
        event_ids: None,
        permissions: Vec::new(),
        arn_type: None,
        related: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixtureCall {
    pub operation: String,
    pub params: Value,
}

impl FixtureCall {
    pub fn is_dry_run(&self) -> bool {
        self.params.get("DryRun") == Some(&Value::Bool(true))
    }
}

#[derive(Debug, Clone)]
struct Collection {
    id_key: String,
    items: Vec<Resource>,
}

impl Collection {
    fn id_of(&self, item: &Resource) -> Option<String> {
        item.get(&self.id_key).and_then(scalar_string)
    }
}

#[derive(Debug, Clone)]
struct ScriptedFailure {
    operation: String,
    resource_id: String,
    message: String,
}

#[derive(Debug, Default)]
struct FixtureState {
    responses: HashMap<String, Value>,
    collections: BTreeMap<String, Collection>,
    failures: Vec<ScriptedFailure>,
    throttles: HashMap<String, u32>,
    calls: Vec<FixtureCall>,
}

/// Scripted session: static responses, in-memory collections, failures and throttling.
///
/// Operations with nothing scripted answer `{}`. Any request flagged `DryRun: true` that is
/// not a collection listing answers with a dry-run indication and mutates nothing.
#[derive(Debug)]
pub struct FixtureSession {
    page_size: usize,
    state: Mutex<FixtureState>,
}

impl Default for FixtureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureSession {
    pub fn new() -> Self {
        Self {
            page_size: 50,
            state: Mutex::new(FixtureState::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_response(self, operation: &str, response: Value) -> Self {
        self.state()
            .responses
            .insert(operation.to_string(), response);
        self
    }

    /// Serves `items` from the list `operation`, keyed by `id_key`.
    pub fn with_collection(self, operation: &str, id_key: &str, items: Value) -> Self {
        let items = items
            .as_array()
            .map(|items| items.iter().filter_map(|item| item.as_object().cloned()).collect())
            .unwrap_or_default();
        self.state().collections.insert(
            operation.to_string(),
            Collection {
                id_key: id_key.to_string(),
                items,
            },
        );
        self
    }

    /// Fails `operation` whenever its request names `resource_id`.
    pub fn with_failure(self, operation: &str, resource_id: &str, message: &str) -> Self {
        self.state().failures.push(ScriptedFailure {
            operation: operation.to_string(),
            resource_id: resource_id.to_string(),
            message: message.to_string(),
        });
        self
    }

    /// Throttles the first `times` calls of `operation`.
    pub fn with_throttling(self, operation: &str, times: u32) -> Self {
        self.state()
            .throttles
            .insert(operation.to_string(), times);
        self
    }

    pub fn calls(&self) -> Vec<FixtureCall> {
        self.state().calls.clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<FixtureCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.operation == operation)
            .collect()
    }

    /// Calls that were not flagged as dry runs, excluding listings.
    pub fn mutations(&self) -> Vec<FixtureCall> {
        let state = self.state();
        state
            .calls
            .iter()
            .filter(|call| !call.is_dry_run() && !state.collections.contains_key(&call.operation))
            .cloned()
            .collect()
    }

    /// Current contents of a collection, including tag changes applied through the session.
    pub fn items(&self, operation: &str) -> Vec<Resource> {
        self.state()
            .collections
            .get(operation)
            .map(|collection| collection.items.clone())
            .unwrap_or_default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        self.state.lock().expect("lock poisoned")
    }

    fn list(&self, collection: &Collection, params: &Value) -> Value {
        let wanted: Option<Vec<String>> = params
            .get(FIXTURE_IDS_PARAM)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(scalar_string).collect());
        let selectors: Vec<(&String, &Value)> = params
            .as_object()
            .map(|map| {
                map.iter()
                    .filter(|(key, _)| !RESERVED_PARAMS.contains(&key.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let matching: Vec<&Resource> = collection
            .items
            .iter()
            .filter(|item| match &wanted {
                Some(ids) => collection.id_of(item).is_some_and(|id| ids.contains(&id)),
                None => true,
            })
            .filter(|item| {
                selectors
                    .iter()
                    .all(|(key, value)| item.get(*key).is_none_or(|found| found == *value))
            })
            .collect();

        let offset = params
            .get("NextToken")
            .and_then(Value::as_str)
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + self.page_size).min(matching.len());
        let page: Vec<Value> = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|item| Value::Object((*item).clone()))
            .collect();
        let mut response = json!({"Items": page});
        if end < matching.len() {
            response["NextToken"] = Value::from(end.to_string());
        }
        response
    }

    fn apply_tags(state: &mut FixtureState, operation: &str, params: &Value) {
        let ids: Vec<String> = params
            .get("ResourceIds")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(scalar_string).collect())
            .unwrap_or_default();
        let add: Vec<Tag> = params.get("Tags").map(tags_from_value).unwrap_or_default();
        let remove: Vec<String> = params
            .get("TagKeys")
            .and_then(Value::as_array)
            .map(|keys| keys.iter().filter_map(scalar_string).collect())
            .unwrap_or_default();

        for collection in state.collections.values_mut() {
            let id_key = collection.id_key.clone();
            for item in &mut collection.items {
                let Some(id) = item.get(&id_key).and_then(scalar_string) else {
                    continue;
                };
                if !ids.contains(&id) {
                    continue;
                }
                if operation == FIXTURE_TAG_OPERATION {
                    set_local_tags(item, &add);
                } else {
                    remove_local_tags(item, &remove);
                }
            }
        }
    }
}

fn names_resource(params: &Value, resource_id: &str) -> bool {
    match params {
        Value::String(text) => text == resource_id,
        Value::Array(items) => items.iter().any(|item| names_resource(item, resource_id)),
        Value::Object(map) => map.values().any(|value| names_resource(value, resource_id)),
        _ => false,
    }
}

#[async_trait]
impl Session for FixtureSession {
    async fn call(&self, operation: &str, params: &Value) -> Result<Value> {
        let mut state = self.state();
        state.calls.push(FixtureCall {
            operation: operation.to_string(),
            params: params.clone(),
        });

        if let Some(remaining) = state.throttles.get_mut(operation)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(throttling_error(format!("{operation}: rate exceeded")));
        }
        if let Some(failure) = state
            .failures
            .iter()
            .find(|f| f.operation == operation && names_resource(params, &f.resource_id))
        {
            return Err(action_error(failure.message.clone()).with_resource_id(&failure.resource_id));
        }
        if let Some(collection) = state.collections.get(operation) {
            return Ok(self.list(collection, params));
        }
        if params.get("DryRun") == Some(&Value::Bool(true)) {
            return Err(dry_run_indication(
                "Request would have succeeded, but DryRun flag is set.",
            ));
        }
        if operation == FIXTURE_TAG_OPERATION || operation == FIXTURE_UNTAG_OPERATION {
            Self::apply_tags(&mut state, operation, params);
            return Ok(json!({}));
        }
        Ok(state
            .responses
            .get(operation)
            .cloned()
            .unwrap_or_else(|| json!({})))
    }
}

/// Provider serving fixture resource types over one shared [`FixtureSession`].
pub struct FixtureProvider {
    name: String,
    types: BTreeMap<String, ResourceType>,
    session: Arc<FixtureSession>,
}

impl FixtureProvider {
    pub fn new(session: Arc<FixtureSession>) -> Self {
        Self {
            name: FIXTURE_PROVIDER.to_string(),
            types: BTreeMap::new(),
            session,
        }
    }

    pub fn with_type(mut self, resource_type: ResourceType) -> Result<Self> {
        if resource_type.descriptor.provider != self.name {
            return Err(configuration_error(format!(
                "resource type '{}' does not belong to provider '{}'",
                resource_type.full_name(),
                self.name
            )));
        }
        self.types
            .insert(resource_type.descriptor.type_name.clone(), resource_type);
        Ok(self)
    }

    pub fn with_descriptor(self, descriptor: ResourceTypeDescriptor) -> Result<Self> {
        self.with_type(ResourceType::declarative(descriptor)?)
    }

    pub fn session(&self) -> &Arc<FixtureSession> {
        &self.session
    }
}

impl Provider for FixtureProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_types(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    fn resource_type(&self, name: &str) -> Result<Option<ResourceType>> {
        Ok(self.types.get(name).cloned())
    }

    fn session(&self, _options: &SessionOptions) -> Result<Arc<dyn Session>> {
        Ok(self.session.clone())
    }

    fn format_identity(
        &self,
        descriptor: &ResourceTypeDescriptor,
        resource: &Resource,
        options: &SessionOptions,
    ) -> Option<String> {
        let id = descriptor.native_id(resource)?;
        Some(format!(
            "arn:test:{}:{}:{}:{}/{id}",
            descriptor.service.as_deref().unwrap_or(&descriptor.type_name),
            options.region,
            options.account_id,
            descriptor.type_name
        ))
    }
}
