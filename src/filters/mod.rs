pub mod boolean;
pub mod event;
pub mod related;
pub mod tags;
pub mod value;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{
    context::{ExecutionContext, RunWarning, WarningKind},
    error::{CustodianError, Result, filter_error, policy_validation},
    registry::Registry,
    resources::{Resource, ResourceManager, ResourceTypeDescriptor, manager::content_identity},
};

pub use boolean::{BooleanFilter, BooleanOp};
pub use event::EventFilter;
pub use related::{RelatedResourceFilter, RelatedSpec};
pub use tags::{MarkedForOpFilter, TagCountFilter};
pub use value::ValueFilter;

/// Constructs a filter from its policy fragment.
pub type FilterFactory =
    Arc<dyn Fn(&Map<String, Value>, &FilterBuilder<'_>) -> Result<Box<dyn Filter>> + Send + Sync>;

#[async_trait]
pub trait Filter: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &str;

    fn permissions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Returns the matching subset in input order, possibly annotated.
    async fn process(
        &self,
        resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>>;

    async fn matches(&self, resource: &Resource, ctx: &FilterContext<'_>) -> Result<bool> {
        Ok(!self.process(vec![resource.clone()], ctx).await?.is_empty())
    }
}

pub struct FilterContext<'a> {
    pub execution: &'a ExecutionContext,
    pub manager: Option<&'a ResourceManager>,
    pub event: Option<&'a Value>,
    pub now: OffsetDateTime,
}

impl<'a> FilterContext<'a> {
    pub fn new(
        execution: &'a ExecutionContext,
        manager: Option<&'a ResourceManager>,
        event: Option<&'a Value>,
    ) -> Self {
        Self {
            execution,
            manager,
            event,
            now: OffsetDateTime::now_utc(),
        }
    }

    pub fn manager(&self) -> Result<&'a ResourceManager> {
        self.manager
            .ok_or_else(|| filter_error("filter requires a resource manager"))
    }

    /// Run identity; outside a manager, the resource content minus annotations.
    pub fn identity(&self, resource: &Resource) -> String {
        match self.manager {
            Some(manager) => manager.resource_id(resource),
            None => content_identity(resource),
        }
    }

    /// Silently drops resources not in the state a filter requires, recording the count.
    pub fn implicit_filter(
        &self,
        source: &str,
        key: &str,
        resources: Vec<Resource>,
        keep: impl Fn(&Resource) -> bool,
    ) -> Vec<Resource> {
        let before = resources.len();
        let kept: Vec<Resource> = resources.into_iter().filter(|r| keep(r)).collect();
        let removed = before - kept.len();
        if removed > 0 {
            tracing::warn!(
                target: "filters",
                filter = source,
                key = key,
                removed = removed,
                "implicit_filter_applied"
            );
            self.execution.warn(
                RunWarning::new(
                    WarningKind::ImplicitFilter,
                    source,
                    format!("{source} implicitly filtered {removed} of {before} resources"),
                )
                .with_key(key)
                .with_count(removed),
            );
        }
        kept
    }
}

/// Builds filter trees against one registry.
pub struct FilterBuilder<'a> {
    pub registry: &'a Registry<FilterFactory>,
    pub descriptor: Option<&'a ResourceTypeDescriptor>,
}

impl<'a> FilterBuilder<'a> {
    pub fn new(
        registry: &'a Registry<FilterFactory>,
        descriptor: Option<&'a ResourceTypeDescriptor>,
    ) -> Self {
        Self {
            registry,
            descriptor,
        }
    }

    pub fn build_all(&self, data: &[Value]) -> Result<Vec<Box<dyn Filter>>> {
        data.iter()
            .enumerate()
            .map(|(index, item)| {
                self.build(item)
                    .map_err(|err| prefix_path(err, &format!("/{index}")))
            })
            .collect()
    }

    pub fn build(&self, data: &Value) -> Result<Box<dyn Filter>> {
        let Value::Object(map) = data else {
            return Err(policy_validation("filter must be a mapping"));
        };
        if let Some(op) = BooleanOp::from_mapping(map) {
            return boolean::build(op, map, self);
        }
        match map.get("type") {
            Some(Value::String(name)) => {
                let entry = self.registry.get(name)?;
                (entry.plugin)(map, self)
            }
            Some(_) => Err(policy_validation("filter type must be a string")),
            None => match shorthand(map) {
                Some(expanded) => {
                    let filter = ValueFilter::from_data(&expanded)?;
                    Ok(Box::new(filter))
                }
                None => Err(policy_validation("filter is missing 'type'")),
            },
        }
    }
}

/// `{"tag:Env": "prod"}` expands to `{"type": "value", "key": "tag:Env", "value": "prod"}`.
pub fn shorthand(map: &Map<String, Value>) -> Option<Map<String, Value>> {
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    let mut expanded = Map::new();
    expanded.insert("type".to_string(), Value::from("value"));
    expanded.insert("key".to_string(), Value::from(key.as_str()));
    expanded.insert("value".to_string(), value.clone());
    Some(expanded)
}

pub(crate) fn prefix_path(err: CustodianError, prefix: &str) -> CustodianError {
    let path = match &err.path {
        Some(path) => format!("{prefix}{path}"),
        None => prefix.to_string(),
    };
    err.with_path(path)
}

/// Registers the generic filters every resource type inherits.
pub fn register_defaults(registry: &mut Registry<FilterFactory>) -> Result<()> {
    boolean::register(registry)?;
    value::register(registry)?;
    event::register(registry)?;
    tags::register(registry)?;
    Ok(())
}

/// Runs filters in sequence (implicit `and`).
pub async fn apply_all(
    filters: &[Box<dyn Filter>],
    mut resources: Vec<Resource>,
    ctx: &FilterContext<'_>,
) -> Result<Vec<Resource>> {
    for filter in filters {
        if resources.is_empty() {
            break;
        }
        resources = filter.process(resources, ctx).await?;
    }
    Ok(resources)
}
