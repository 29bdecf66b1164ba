use std::{path::Path, sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    actions::{Action, ActionBuilder},
    context::{ExecutionContext, RunWarning},
    error::{Result, configuration_error, policy_validation},
    filters::{Filter, FilterBuilder, FilterContext, apply_all},
    ledger::ResultLedger,
    modes::{DEFAULT_MODE, ExecutionMode},
    provider::ResourceType,
    resources::{
        Resource, ResourceManager,
        pipeline::{Pipeline, PipelineOutcome, ResourceLimits, Source},
    },
    runtime::Core,
};

/// A policy as written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyData {
    pub name: String,
    pub resource: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mode: Option<Map<String, Value>>,
    #[serde(default)]
    pub conditions: Vec<Value>,
    #[serde(default)]
    pub filters: Vec<Value>,
    #[serde(default)]
    pub actions: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default, rename = "max-resources")]
    pub max_resources: Option<u64>,
    #[serde(default, rename = "max-resources-percent")]
    pub max_resources_percent: Option<f64>,
}

impl PolicyData {
    pub fn mode_type(&self) -> &str {
        self.mode
            .as_ref()
            .and_then(|mode| mode.get("type"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MODE)
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_resources: self.max_resources,
            max_percent: self.max_resources_percent,
        }
    }
}

/// Values substituted into `{name}` placeholders of filter and action strings.
#[derive(Debug, Clone)]
pub struct PolicyVariables {
    pub account_id: String,
    pub region: String,
    pub policy: String,
    pub now: OffsetDateTime,
}

impl PolicyVariables {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "account_id" => Some(self.account_id.clone()),
            "region" => Some(self.region.clone()),
            "policy" => Some(self.policy.clone()),
            "now" => self.now.format(&Rfc3339).ok(),
            _ => None,
        }
    }

    /// Replaces known placeholders; unknown ones (`{op}`, `{action_date}`) are left for
    /// the plugins that render them.
    pub fn expand_str(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let replaced = tail.find('}').and_then(|end| {
                self.lookup(&tail[1..end]).map(|value| (value, end))
            });
            match replaced {
                Some((value, end)) => {
                    out.push_str(&value);
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn expand(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.expand_str(text)),
            Value::Array(items) => Value::Array(items.iter().map(|item| self.expand(item)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), self.expand(value)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyRunReport {
    pub policy: String,
    pub resource: String,
    pub run_id: String,
    pub mode: String,
    pub start_time: String,
    pub skipped: bool,
    pub enumerated: usize,
    pub matched: usize,
    pub resources: Vec<Resource>,
    pub ledger: ResultLedger,
    pub warnings: Vec<RunWarning>,
    pub duration_ms: u64,
}

/// A policy bound to its resource type, with filters, actions and mode built.
pub struct Policy {
    data: PolicyData,
    resource_type: Arc<ResourceType>,
    conditions: Vec<Box<dyn Filter>>,
    filters: Vec<Box<dyn Filter>>,
    actions: Vec<Box<dyn Action>>,
    mode: Box<dyn ExecutionMode>,
    core: Arc<Core>,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.data.name)
            .field("resource", &self.resource_type.full_name())
            .field("mode", &self.mode.type_name())
            .field("filters", &self.filters.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl Policy {
    /// Validates `raw` and binds it. No session is created until the policy runs.
    pub fn from_value(raw: &Value, core: &Arc<Core>) -> Result<Self> {
        crate::schema::validate_policy(
            raw,
            "",
            core.catalog().as_ref(),
            core.catalog().filters(),
            core.modes(),
        )?;
        let data: PolicyData = serde_json::from_value(raw.clone())
            .map_err(|err| policy_validation(format!("invalid policy: {err}")))?;
        Self::new(data, core)
    }

    /// Binds already validated policy data.
    pub fn new(data: PolicyData, core: &Arc<Core>) -> Result<Self> {
        let resource_type = core.resource_type(&data.resource)?;
        let options = core.options();
        let variables = PolicyVariables {
            account_id: options.account_id.clone(),
            region: options.region.clone(),
            policy: data.name.clone(),
            now: OffsetDateTime::now_utc(),
        };
        let expand = |items: &[Value]| -> Vec<Value> {
            items.iter().map(|item| variables.expand(item)).collect()
        };

        let conditions = FilterBuilder::new(core.catalog().filters(), None)
            .build_all(&expand(&data.conditions))
            .map_err(|err| crate::filters::prefix_path(err, "/conditions"))?;
        let descriptor = resource_type.descriptor.as_ref();
        let filters = FilterBuilder::new(&resource_type.filters, Some(descriptor))
            .build_all(&expand(&data.filters))
            .map_err(|err| crate::filters::prefix_path(err, "/filters"))?;
        let actions = ActionBuilder::new(&resource_type.actions)
            .build_all(&expand(&data.actions))
            .map_err(|err| crate::filters::prefix_path(err, "/actions"))?;

        let mode_data = data.mode.clone().unwrap_or_else(|| {
            let mut map = Map::new();
            map.insert("type".to_string(), Value::from(DEFAULT_MODE));
            map
        });
        let mode_entry = core
            .modes()
            .get(data.mode_type())
            .map_err(|err| err.with_path("/mode/type"))?;
        let mode = (mode_entry.plugin)(&mode_data)?;

        let policy = Self {
            data,
            resource_type,
            conditions,
            filters,
            actions,
            mode,
            core: core.clone(),
        };
        policy.mode.validate(&policy)?;
        Ok(policy)
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn resource_name(&self) -> String {
        self.resource_type.full_name()
    }

    pub fn resource_type(&self) -> &Arc<ResourceType> {
        &self.resource_type
    }

    pub fn data(&self) -> &PolicyData {
        &self.data
    }

    pub fn mode(&self) -> &dyn ExecutionMode {
        self.mode.as_ref()
    }

    pub fn filters(&self) -> &[Box<dyn Filter>] {
        &self.filters
    }

    pub fn actions(&self) -> &[Box<dyn Action>] {
        &self.actions
    }

    /// Permissions the run needs: the type's listing plus every filter and action.
    pub fn permissions(&self) -> Vec<String> {
        let mut permissions: Vec<String> = self.resource_type.descriptor.permissions.clone();
        permissions.extend(self.filters.iter().flat_map(|filter| filter.permissions()));
        permissions.extend(self.actions.iter().flat_map(|action| action.permissions()));
        permissions.sort();
        permissions.dedup();
        permissions
    }

    pub fn provision(&self) -> Value {
        self.mode.provision(self)
    }

    pub fn manager(&self) -> Result<ResourceManager> {
        self.core.manager(&self.resource_type)
    }

    /// Fresh run context carrying the core's account, flags and metrics sink.
    pub fn context(&self) -> ExecutionContext {
        self.core.context(self.name())
    }

    pub async fn run(&self, event: Option<&Value>) -> Result<PolicyRunReport> {
        let ctx = self.context();
        self.run_with(event, &ctx).await
    }

    /// Runs under a caller-owned context; the ledger stays readable on `ctx` after errors.
    pub async fn run_with(
        &self,
        event: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> Result<PolicyRunReport> {
        let started = Instant::now();
        tracing::info!(
            target: "policy",
            policy = self.name(),
            resource = %self.resource_name(),
            mode = self.mode.type_name(),
            run_id = ctx.run_id(),
            dry_run = ctx.dry_run(),
            "policy_run_started"
        );

        if !self.conditions_match(event, ctx).await? {
            tracing::info!(
                target: "policy",
                policy = self.name(),
                run_id = ctx.run_id(),
                "policy_conditions_not_met"
            );
            return Ok(self.report(ctx, true, PipelineOutcome::default(), started));
        }

        match self.mode.run(self, event, ctx).await {
            Ok(outcome) => {
                let report = self.report(ctx, false, outcome, started);
                let totals = report.ledger.totals();
                tracing::info!(
                    target: "policy",
                    policy = self.name(),
                    run_id = ctx.run_id(),
                    enumerated = report.enumerated,
                    matched = report.matched,
                    ok = totals.ok,
                    skip = totals.skip,
                    error = totals.error,
                    duration_ms = report.duration_ms,
                    "policy_run_completed"
                );
                Ok(report)
            }
            Err(err) => {
                tracing::error!(
                    target: "policy",
                    policy = self.name(),
                    run_id = ctx.run_id(),
                    kind = err.kind.as_str(),
                    error = %err,
                    "policy_run_failed"
                );
                Err(err)
            }
        }
    }

    /// Drives the pipeline for `source`; called by execution modes.
    pub async fn execute(
        &self,
        source: Source<'_>,
        event: Option<&Value>,
        ctx: &ExecutionContext,
    ) -> Result<PipelineOutcome> {
        let manager = self.manager()?;
        Pipeline {
            manager: &manager,
            filters: &self.filters,
            actions: &self.actions,
            limits: self.data.limits(),
            collaborators: self.core.collaborators(),
            event,
        }
        .run(source, ctx)
        .await
    }

    async fn conditions_match(&self, event: Option<&Value>, ctx: &ExecutionContext) -> Result<bool> {
        if self.conditions.is_empty() {
            return Ok(true);
        }
        let subject = json!({
            "name": self.name(),
            "resource": self.resource_name(),
            "region": ctx.region(),
            "account_id": ctx.account_id(),
            "now": ctx.start_time().format(&Rfc3339).unwrap_or_default(),
            "event": event.cloned().unwrap_or(Value::Null),
            "mode": self.mode.type_name(),
        });
        let Value::Object(subject) = subject else {
            return Ok(false);
        };
        let fctx = FilterContext::new(ctx, None, event);
        Ok(!apply_all(&self.conditions, vec![subject], &fctx).await?.is_empty())
    }

    fn report(
        &self,
        ctx: &ExecutionContext,
        skipped: bool,
        outcome: PipelineOutcome,
        started: Instant,
    ) -> PolicyRunReport {
        PolicyRunReport {
            policy: self.name().to_string(),
            resource: self.resource_name(),
            run_id: ctx.run_id().to_string(),
            mode: self.mode.type_name().to_string(),
            start_time: ctx.start_time().format(&Rfc3339).unwrap_or_default(),
            skipped,
            enumerated: outcome.enumerated,
            matched: outcome.resources.len(),
            resources: outcome.resources,
            ledger: ctx.ledger_snapshot(),
            warnings: ctx.warnings(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Policies loaded from one document; names are unique.
#[derive(Debug, Default)]
pub struct PolicyCollection {
    policies: Vec<Policy>,
}

impl PolicyCollection {
    /// Validates the whole document before binding any policy.
    pub fn from_document(document: &Value, core: &Arc<Core>) -> Result<Self> {
        if let Some(err) = core.validate_document(document).into_iter().next() {
            return Err(err);
        }
        let mut policies = Vec::new();
        if let Some(items) = document.get("policies").and_then(Value::as_array) {
            for (index, item) in items.iter().enumerate() {
                let data: PolicyData = serde_json::from_value(item.clone()).map_err(|err| {
                    policy_validation(format!("invalid policy: {err}"))
                        .with_path(format!("/policies/{index}"))
                })?;
                let policy = Policy::new(data, core)
                    .map_err(|err| crate::filters::prefix_path(err, &format!("/policies/{index}")))?;
                policies.push(policy);
            }
        }
        Ok(Self { policies })
    }

    /// Parses YAML (JSON is valid YAML) and loads it.
    pub fn from_yaml(text: &str, core: &Arc<Core>) -> Result<Self> {
        let document = parse_document(text)?;
        Self::from_document(&document, core)
    }

    pub fn load_file(path: &Path, core: &Arc<Core>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            configuration_error(format!("failed to read policy file '{}': {err}", path.display()))
        })?;
        Self::from_yaml(&text, core)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|policy| policy.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.iter().map(Policy::name).collect()
    }

    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.policies.iter().map(Policy::resource_name).collect();
        types.sort();
        types.dedup();
        types
    }
}

impl<'a> IntoIterator for &'a PolicyCollection {
    type Item = &'a Policy;
    type IntoIter = std::slice::Iter<'a, Policy>;

    fn into_iter(self) -> Self::IntoIter {
        self.policies.iter()
    }
}

pub fn parse_document(text: &str) -> Result<Value> {
    serde_yaml::from_str(text)
        .map_err(|err| policy_validation(format!("policy document is not valid YAML: {err}")))
}
