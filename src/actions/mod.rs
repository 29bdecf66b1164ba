pub mod engine;
pub mod notify;
pub mod tags;

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    context::ExecutionContext,
    error::{CustodianError, ErrorKind, Result, policy_validation},
    filters::prefix_path,
    provider::{DryRunSession, Session},
    registry::Registry,
    resources::{Resource, ResourceManager},
};

pub use notify::{
    Collaborators, FunctionInvoker, HttpWebhookTransport, Notifier, NotifyMessage,
    WebhookRequest, WebhookTransport,
};

/// Constructs an action from its policy fragment.
pub type ActionFactory =
    Arc<dyn Fn(&Map<String, Value>, &ActionBuilder<'_>) -> Result<Box<dyn Action>> + Send + Sync>;

/// Per-resource failure reported by an action or adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceFailure {
    pub resource_id: String,
    pub reason: String,
    pub kind: ErrorKind,
}

impl ResourceFailure {
    pub fn new(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            reason: reason.into(),
            kind: ErrorKind::Action,
        }
    }

    pub fn from_error(resource_id: impl Into<String>, err: &CustodianError) -> Self {
        Self {
            resource_id: resource_id.into(),
            reason: err.message.clone(),
            kind: err.kind,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.kind == ErrorKind::DryRun
    }
}

/// What an action reports back beyond "everything else succeeded".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionResult {
    pub failures: Vec<ResourceFailure>,
    /// Resources the action chose not to touch, with the reason.
    pub skipped: Vec<ResourceFailure>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_failures(failures: Vec<ResourceFailure>) -> Self {
        Self {
            failures,
            skipped: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Action: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &str;

    fn permissions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Configuration as declared, used to recognise repeated identical actions.
    fn config(&self) -> &Map<String, Value>;

    /// Applies the action to `resources`, which it may update locally (for example tags).
    async fn process(
        &self,
        resources: &mut [Resource],
        ctx: &ActionContext<'_>,
    ) -> Result<ActionResult>;
}

pub struct ActionContext<'a> {
    pub execution: &'a ExecutionContext,
    pub manager: &'a ResourceManager,
    pub event: Option<&'a Value>,
    pub collaborators: &'a Collaborators,
}

impl<'a> ActionContext<'a> {
    pub fn new(
        execution: &'a ExecutionContext,
        manager: &'a ResourceManager,
        event: Option<&'a Value>,
        collaborators: &'a Collaborators,
    ) -> Self {
        Self {
            execution,
            manager,
            event,
            collaborators,
        }
    }

    /// Session for mutating calls; flags every request as a dry run when the run is one.
    pub fn session(&self) -> Arc<dyn Session> {
        let session = self.manager.session().clone();
        if self.execution.dry_run() {
            Arc::new(DryRunSession::new(session))
        } else {
            session
        }
    }

    pub fn resource_id(&self, resource: &Resource) -> String {
        self.manager.resource_id(resource)
    }

    pub fn workers(&self) -> usize {
        self.manager.options().workers
    }
}

/// Builds action lists against one registry.
pub struct ActionBuilder<'a> {
    pub registry: &'a Registry<ActionFactory>,
}

impl<'a> ActionBuilder<'a> {
    pub fn new(registry: &'a Registry<ActionFactory>) -> Self {
        Self { registry }
    }

    pub fn build_all(&self, data: &[Value]) -> Result<Vec<Box<dyn Action>>> {
        data.iter()
            .enumerate()
            .map(|(index, item)| {
                self.build(item)
                    .map_err(|err| prefix_path(err, &format!("/{index}")))
            })
            .collect()
    }

    pub fn build(&self, data: &Value) -> Result<Box<dyn Action>> {
        let map = match data {
            Value::Object(map) => map.clone(),
            // `- notify-ops` is shorthand for `{type: notify-ops}`.
            Value::String(name) => {
                let mut map = Map::new();
                map.insert("type".to_string(), Value::from(name.as_str()));
                map
            }
            _ => return Err(policy_validation("action must be a mapping or a type name")),
        };
        let name = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| policy_validation("action is missing 'type'"))?;
        let entry = self.registry.get(name)?;
        (entry.plugin)(&map, self)
    }
}

/// Registers the generic actions every resource type inherits.
pub fn register_defaults(registry: &mut Registry<ActionFactory>) -> Result<()> {
    tags::register(registry)?;
    notify::register(registry)?;
    Ok(())
}

/// Groups failures by reason, for compact log lines.
pub(crate) fn summarize(failures: &[ResourceFailure]) -> BTreeMap<&str, usize> {
    let mut summary = BTreeMap::new();
    for failure in failures {
        *summary.entry(failure.reason.as_str()).or_insert(0) += 1;
    }
    summary
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ActionBuilder, ActionFactory, register_defaults};
    use crate::{error::ErrorKind, registry::Registry};

    fn registry() -> Registry<ActionFactory> {
        let mut registry = Registry::new("action");
        register_defaults(&mut registry).expect("defaults should register");
        registry
    }

    #[test]
    fn defaults_cover_generic_actions() {
        let registry = registry();
        for name in [
            "tag",
            "remove-tag",
            "mark-for-op",
            "unmark",
            "untag",
            "notify",
            "webhook",
            "invoke-lambda",
        ] {
            assert!(registry.contains(name), "missing {name}");
        }
    }

    #[test]
    fn unknown_action_reports_index() {
        let registry = registry();
        let err = ActionBuilder::new(&registry)
            .build_all(&[json!({"type": "tag", "key": "a", "value": "b"}), json!({"type": "nuke"})])
            .expect_err("unknown action should fail");
        assert_eq!(err.kind, ErrorKind::PolicyValidation);
        assert_eq!(err.path.as_deref(), Some("/1"));
    }
}
