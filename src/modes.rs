//! Execution modes: how and when a policy's pipeline is driven.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::{
    context::ExecutionContext,
    error::{Result, configuration_error, policy_validation},
    keypath::KeyPath,
    policy::Policy,
    registry::Registry,
    resources::pipeline::{PipelineOutcome, Source, event_ids},
    schema::type_schema,
};

pub const DEFAULT_MODE: &str = "pull";

/// Constructs a mode from the policy's `mode` block.
pub type ModeFactory = Arc<dyn Fn(&Map<String, Value>) -> Result<Box<dyn ExecutionMode>> + Send + Sync>;

#[async_trait]
pub trait ExecutionMode: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &str;

    /// Checks the mode against the bound policy; runs at load, before any I/O.
    fn validate(&self, _policy: &Policy) -> Result<()> {
        Ok(())
    }

    async fn run(
        &self,
        policy: &Policy,
        event: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> Result<PipelineOutcome>;

    /// Deployment descriptor consumed by serverless packagers.
    fn provision(&self, policy: &Policy) -> Value {
        provision_base(self.type_name(), policy)
    }
}

fn provision_base(mode: &str, policy: &Policy) -> Value {
    json!({
        "mode": mode,
        "policy": policy.name(),
        "resource": policy.resource_name(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct PullMode;

#[async_trait]
impl ExecutionMode for PullMode {
    fn type_name(&self) -> &str {
        "pull"
    }

    async fn run(
        &self,
        policy: &Policy,
        event: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> Result<PipelineOutcome> {
        policy.execute(Source::All, event, ctx).await
    }
}

/// Pull on a scheduler beat.
#[derive(Debug, Clone)]
pub struct PeriodicMode {
    schedule: String,
    timezone: Option<String>,
}

impl PeriodicMode {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let schedule = data
            .get("schedule")
            .and_then(Value::as_str)
            .filter(|schedule| !schedule.trim().is_empty())
            .ok_or_else(|| policy_validation("periodic mode requires a 'schedule'"))?;
        Ok(Self {
            schedule: schedule.to_string(),
            timezone: data.get("timezone").and_then(Value::as_str).map(str::to_string),
        })
    }
}

#[async_trait]
impl ExecutionMode for PeriodicMode {
    fn type_name(&self) -> &str {
        "periodic"
    }

    async fn run(
        &self,
        policy: &Policy,
        event: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> Result<PipelineOutcome> {
        policy.execute(Source::All, event, ctx).await
    }

    fn provision(&self, policy: &Policy) -> Value {
        let mut descriptor = provision_base(self.type_name(), policy);
        descriptor["schedule"] = Value::from(self.schedule.as_str());
        if let Some(timezone) = &self.timezone {
            descriptor["timezone"] = Value::from(timezone.as_str());
        }
        descriptor
    }
}

/// Runs on a change notification, fetching only the resources the event names.
#[derive(Debug, Clone)]
pub struct EventMode {
    events: Vec<String>,
    ids: Option<String>,
}

impl EventMode {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let events = match data.get("events") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| policy_validation("event names must be strings"))
                })
                .collect::<Result<_>>()?,
            Some(_) => return Err(policy_validation("'events' must be a list")),
        };
        let ids = data.get("ids").and_then(Value::as_str).map(str::to_string);
        if let Some(ids) = &ids {
            KeyPath::parse(ids).map_err(|err| {
                policy_validation(format!("invalid event ids expression '{ids}': {err}"))
            })?;
        }
        Ok(Self { events, ids })
    }

    fn ids_expression<'a>(&'a self, policy: &'a Policy) -> Option<&'a str> {
        self.ids
            .as_deref()
            .or(policy.resource_type().descriptor.event_ids.as_deref())
    }
}

#[async_trait]
impl ExecutionMode for EventMode {
    fn type_name(&self) -> &str {
        "event"
    }

    fn validate(&self, policy: &Policy) -> Result<()> {
        if self.ids_expression(policy).is_none() {
            return Err(policy_validation(format!(
                "event mode on '{}' needs 'ids': the resource type declares no event ids",
                policy.resource_name()
            )));
        }
        Ok(())
    }

    async fn run(
        &self,
        policy: &Policy,
        event: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> Result<PipelineOutcome> {
        let event = event
            .ok_or_else(|| configuration_error("event mode requires an event payload"))?;
        let expression = self.ids_expression(policy).ok_or_else(|| {
            policy_validation(format!("event mode on '{}' has no ids expression", policy.name()))
        })?;
        let ids = event_ids(expression, event)?;
        if ids.is_empty() {
            tracing::info!(
                target: "policy",
                policy = policy.name(),
                expression = expression,
                "event_without_resources"
            );
            return Ok(PipelineOutcome::default());
        }
        policy.execute(Source::Ids(&ids), Some(event), ctx).await
    }

    fn provision(&self, policy: &Policy) -> Value {
        let mut descriptor = provision_base(self.type_name(), policy);
        descriptor["events"] = json!(self.events);
        if let Some(ids) = self.ids_expression(policy) {
            descriptor["ids"] = Value::from(ids);
        }
        descriptor
    }
}

pub fn register_defaults(registry: &mut Registry<ModeFactory>) -> Result<()> {
    let pull: ModeFactory = Arc::new(|_data| Ok(Box::new(PullMode)));
    registry.register("pull", type_schema("pull", json!({}), &[]), pull)?;

    let periodic: ModeFactory = Arc::new(|data| Ok(Box::new(PeriodicMode::from_data(data)?)));
    registry.register(
        "periodic",
        type_schema(
            "periodic",
            json!({
                "schedule": {"type": "string"},
                "timezone": {"type": "string"}
            }),
            &["schedule"],
        ),
        periodic,
    )?;

    let event: ModeFactory = Arc::new(|data| Ok(Box::new(EventMode::from_data(data)?)));
    registry.register(
        "event",
        type_schema(
            "event",
            json!({
                "events": {"type": "array", "items": {"type": "string"}},
                "ids": {"type": "string"}
            }),
            &[],
        ),
        event,
    )
}
