//! Filters that evaluate a value match against a companion resource type.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    context::{RunWarning, WarningKind},
    error::{Result, policy_validation},
    filters::{Filter, FilterContext, FilterFactory, value::value_schema_properties},
    keypath::KeyPath,
    matcher::ValueMatcher,
    registry::Registry,
    resources::{Resource, ResourceManager, annotate_append, scalar_string},
    schema::type_schema,
};

fn default_fetch_threshold() -> usize {
    10
}

/// Declares a related-resource filter on a resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedSpec {
    /// Filter type name, e.g. `kms-key`.
    pub name: String,
    /// Full name of the related resource type.
    pub resource: String,
    /// Key path extracting related identities from a primary resource.
    pub ids: String,
    #[serde(default = "default_fetch_threshold")]
    pub fetch_threshold: usize,
    #[serde(default)]
    pub annotation_key: Option<String>,
    /// Primaries outside this state are dropped with an implicit-filter warning.
    #[serde(default)]
    pub required_state: Option<StateRequirement>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRequirement {
    pub key: String,
    pub values: Vec<Value>,
}

impl RelatedSpec {
    pub fn annotation_key(&self) -> String {
        self.annotation_key
            .clone()
            .unwrap_or_else(|| format!("c7n:matched-{}", self.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combine {
    And,
    Or,
}

#[derive(Debug)]
pub struct RelatedResourceFilter {
    spec: Arc<RelatedSpec>,
    ids: KeyPath,
    state_key: Option<KeyPath>,
    operator: Combine,
    matcher: ValueMatcher,
}

/// Related resources known so far in this run, keyed by native identity.
struct RelatedIndex {
    complete: bool,
    items: Map<String, Value>,
}

impl RelatedIndex {
    fn from_cache(value: Option<Value>) -> Self {
        let complete = value
            .as_ref()
            .and_then(|v| v.get("complete"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let items = value
            .and_then(|mut v| v.get_mut("items").map(Value::take))
            .and_then(|v| match v {
                Value::Object(items) => Some(items),
                _ => None,
            })
            .unwrap_or_default();
        Self { complete, items }
    }

    fn to_value(&self) -> Value {
        json!({"complete": self.complete, "items": self.items})
    }
}

impl RelatedResourceFilter {
    pub fn new(spec: Arc<RelatedSpec>, data: &Map<String, Value>) -> Result<Self> {
        let ids = KeyPath::parse(&spec.ids).map_err(|err| {
            policy_validation(format!("related filter '{}' ids path: {err}", spec.name))
        })?;
        let state_key = spec
            .required_state
            .as_ref()
            .map(|state| {
                KeyPath::parse(&state.key).map_err(|err| {
                    policy_validation(format!("related filter '{}' state key: {err}", spec.name))
                })
            })
            .transpose()?;
        let operator = match data.get("operator").and_then(Value::as_str) {
            None | Some("or") => Combine::Or,
            Some("and") => Combine::And,
            Some(other) => {
                return Err(policy_validation(format!(
                    "operator must be 'and' or 'or', got '{other}'"
                )));
            }
        };
        Ok(Self {
            matcher: ValueMatcher::from_data(data)?,
            spec,
            ids,
            state_key,
            operator,
        })
    }

    fn related_ids(&self, resource: &Resource) -> Vec<String> {
        let found = self.ids.search(&Value::Object(resource.clone()));
        let mut ids = Vec::new();
        collect_ids(&found, &mut ids);
        ids
    }

    /// Resolves `ids` to related resources, fetching whatever this run has not seen yet.
    async fn lookup(
        &self,
        ids: &BTreeSet<String>,
        ctx: &FilterContext<'_>,
    ) -> Result<Map<String, Value>> {
        let cache_key = format!("related:{}", self.spec.resource);
        let mut index = RelatedIndex::from_cache(ctx.execution.cached_value(&cache_key));

        let missing: Vec<String> = ids
            .iter()
            .filter(|id| !index.items.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() && !index.complete {
            let related = ctx.manager()?.related_manager(&self.spec.resource)?;
            let fetched = if missing.len() < self.spec.fetch_threshold {
                related.get_resources(&missing, ctx.execution).await?
            } else {
                index.complete = true;
                related.resources(ctx.execution).await?
            };
            tracing::debug!(
                target: "filters",
                filter = %self.spec.name,
                related = %self.spec.resource,
                requested = missing.len(),
                fetched = fetched.len(),
                "related_resources_fetched"
            );
            index_related(&related, fetched, &mut index.items);
            ctx.execution.store_value(cache_key, index.to_value());
        }

        let unresolved: Vec<String> = ids
            .iter()
            .filter(|id| !index.items.contains_key(*id))
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            tracing::warn!(
                target: "filters",
                filter = %self.spec.name,
                related = %self.spec.resource,
                ids = ?unresolved,
                "related_resource_missing"
            );
            ctx.execution.warn(
                RunWarning::new(
                    WarningKind::RelatedResourceMissing,
                    &self.spec.name,
                    format!(
                        "{} related {} resource(s) not found: {}",
                        unresolved.len(),
                        self.spec.resource,
                        unresolved.join(", ")
                    ),
                )
                .with_count(unresolved.len())
                .with_ids(unresolved),
            );
        }

        Ok(ids
            .iter()
            .filter_map(|id| index.items.get(id).map(|item| (id.clone(), item.clone())))
            .collect())
    }
}

fn collect_ids(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_ids(item, out)),
        Value::Null => {}
        other => {
            if let Some(id) = scalar_string(other)
                && !out.contains(&id)
            {
                out.push(id);
            }
        }
    }
}

fn index_related(manager: &ResourceManager, fetched: Vec<Resource>, items: &mut Map<String, Value>) {
    for resource in fetched {
        let id = manager
            .descriptor()
            .native_id(&resource)
            .unwrap_or_else(|| manager.resource_id(&resource));
        items.entry(id).or_insert(Value::Object(resource));
    }
}

#[async_trait]
impl Filter for RelatedResourceFilter {
    fn type_name(&self) -> &str {
        &self.spec.name
    }

    fn permissions(&self) -> Vec<String> {
        self.spec.permissions.clone()
    }

    async fn process(
        &self,
        resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        let resources = match (&self.spec.required_state, &self.state_key) {
            (Some(state), Some(path)) => {
                ctx.implicit_filter(&self.spec.name, &state.key, resources, |resource| {
                    let current = path.search(&Value::Object(resource.clone()));
                    state.values.contains(&current)
                })
            }
            _ => resources,
        };

        let per_resource: Vec<Vec<String>> = resources.iter().map(|r| self.related_ids(r)).collect();
        let wanted: BTreeSet<String> = per_resource.iter().flatten().cloned().collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let related = self.lookup(&wanted, ctx).await?;
        let right = self.matcher.resolve_right(ctx.execution).await?;
        let verdicts: BTreeMap<&String, bool> = related
            .iter()
            .map(|(id, item)| (id, self.matcher.matches(item, &right, ctx.now)))
            .collect();

        let annotation_key = self.spec.annotation_key();
        let mut matched = Vec::new();
        for (mut resource, ids) in resources.into_iter().zip(per_resource) {
            if ids.is_empty() {
                continue;
            }
            let hits: Vec<&String> = ids
                .iter()
                .filter(|id| verdicts.get(id).copied().unwrap_or(false))
                .collect();
            let keep = match self.operator {
                Combine::Or => !hits.is_empty(),
                Combine::And => hits.len() == ids.len(),
            };
            if keep {
                annotate_append(
                    &mut resource,
                    &annotation_key,
                    hits.into_iter().map(|id| Value::from(id.as_str())),
                );
                matched.push(resource);
            }
        }
        Ok(matched)
    }
}

/// Registers `spec` as a filter type on a resource type's registry.
pub fn register(registry: &mut Registry<FilterFactory>, spec: RelatedSpec) -> Result<()> {
    let mut properties = value_schema_properties();
    if let Some(props) = properties.as_object_mut() {
        props.insert("operator".to_string(), json!({"enum": ["and", "or"]}));
    }
    let schema = type_schema(&spec.name, properties, &[]);
    let name = spec.name.clone();
    let spec = Arc::new(spec);
    let factory: FilterFactory = Arc::new(move |data, _builder| {
        Ok(Box::new(RelatedResourceFilter::new(spec.clone(), data)?))
    });
    registry.register(&name, schema, factory)
}
