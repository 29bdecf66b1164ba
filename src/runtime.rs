//! The `Core`: one value owning every registry, threaded explicitly into policy loading.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use serde_json::Value;

use crate::{
    actions::{self, ActionFactory, Collaborators},
    context::ExecutionContext,
    error::{CustodianError, Result, configuration_error, policy_validation, unknown_plugin},
    filters::{self, FilterFactory},
    metrics::{MetricsSink, NoopMetricsSink},
    modes::{self, ModeFactory},
    policy::{Policy, PolicyCollection},
    provider::{Provider, ResourceType, RetryPolicy, RetryingSession, Session, SessionOptions},
    registry::Registry,
    resources::{
        ManagerOptions, NullCache, Resource, ResourceCache, ResourceManager,
        ResourceTypeDescriptor, manager::ResourceResolver,
    },
    schema,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CoreOptions {
    pub account_id: String,
    pub region: String,
    pub profile: Option<String>,
    pub assume_role: Option<String>,
    pub output_dir: Option<String>,
    pub workers: usize,
    pub chunk_size: usize,
    pub dry_run: bool,
    pub fail_fast: bool,
    pub deadline: Option<Duration>,
    pub value_from_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoreOptions {
    fn default() -> Self {
        let manager = ManagerOptions::default();
        Self {
            account_id: String::new(),
            region: String::new(),
            profile: None,
            assume_role: None,
            output_dir: None,
            workers: manager.workers,
            chunk_size: manager.chunk_size,
            dry_run: false,
            fail_fast: false,
            deadline: None,
            value_from_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl CoreOptions {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            account_id: self.account_id.clone(),
            region: self.region.clone(),
            profile: self.profile.clone(),
            assume_role: self.assume_role.clone(),
        }
    }
}

/// Providers plus the resource types they registered, loaded on first reference.
pub struct Catalog {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    types: RwLock<Registry<Arc<ResourceType>>>,
    filters: Registry<FilterFactory>,
    actions: Registry<ActionFactory>,
    retry: RetryPolicy,
}

impl Catalog {
    /// Generic filters every resource type inherits.
    pub fn filters(&self) -> &Registry<FilterFactory> {
        &self.filters
    }

    pub fn actions(&self) -> &Registry<ActionFactory> {
        &self.actions
    }

    /// Every resource type name known now or loadable on demand, sorted.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .read()
            .expect("lock poisoned")
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        for (provider_name, provider) in &self.providers {
            names.extend(
                provider
                    .resource_types()
                    .into_iter()
                    .map(|short| format!("{provider_name}.{short}")),
            );
        }
        names.sort();
        names.dedup();
        names
    }

    /// `ec2` resolves to `aws.ec2` when exactly one known type has that short name.
    fn qualify(&self, name: &str) -> Result<String> {
        if name.contains('.') {
            return Ok(name.to_string());
        }
        let known = self.resource_names();
        let candidates: Vec<&String> = known
            .iter()
            .filter(|full| full.split_once('.').is_some_and(|(_, short)| short == name))
            .collect();
        match candidates.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(self.unknown(name)),
            many => Err(policy_validation(format!(
                "resource type '{name}' is ambiguous; use one of: {}",
                many.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    fn unknown(&self, name: &str) -> CustodianError {
        let known = self.resource_names();
        let known: Vec<&str> = known.iter().map(String::as_str).collect();
        unknown_plugin("resource", name, &known)
    }

    fn prepare(&self, mut resource_type: ResourceType) -> Arc<ResourceType> {
        resource_type.filters.inherit(&self.filters);
        resource_type.actions.inherit(&self.actions);
        Arc::new(resource_type)
    }

    fn install(&self, full_name: &str, resource_type: ResourceType) -> Result<Arc<ResourceType>> {
        let schema = serde_json::to_value(resource_type.descriptor.as_ref())?;
        let prepared = self.prepare(resource_type);
        let mut types = self.types.write().expect("lock poisoned");
        if let Some(existing) = types.find(full_name) {
            return Ok(existing.plugin.clone());
        }
        types.register(full_name, schema, prepared.clone())?;
        tracing::debug!(
            target: "registry",
            resource_type = full_name,
            filters = prepared.filters.len(),
            actions = prepared.actions.len(),
            "resource_type_registered"
        );
        Ok(prepared)
    }
}

impl ResourceResolver for Catalog {
    fn resource_type(&self, name: &str) -> Result<Arc<ResourceType>> {
        let full_name = self.qualify(name)?;
        if let Some(entry) = self.types.read().expect("lock poisoned").find(&full_name) {
            return Ok(entry.plugin.clone());
        }
        let Some((provider_name, short)) = full_name.split_once('.') else {
            return Err(self.unknown(name));
        };
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| self.unknown(name))?;
        let resource_type = provider
            .resource_type(short)?
            .ok_or_else(|| self.unknown(name))?;
        self.install(&full_name, resource_type)
    }

    fn session(&self, provider: &str, options: &SessionOptions) -> Result<Arc<dyn Session>> {
        let provider = self.providers.get(provider).ok_or_else(|| {
            configuration_error(format!("no provider '{provider}' is registered"))
        })?;
        let inner = provider.session(options)?;
        Ok(Arc::new(RetryingSession::new(inner, self.retry)))
    }

    fn format_identity(
        &self,
        descriptor: &ResourceTypeDescriptor,
        resource: &Resource,
        options: &SessionOptions,
    ) -> Option<String> {
        self.providers
            .get(&descriptor.provider)
            .and_then(|provider| provider.format_identity(descriptor, resource, options))
    }
}

/// Owns the registries and collaborators shared by every policy of a driver.
pub struct Core {
    catalog: Arc<Catalog>,
    modes: Registry<ModeFactory>,
    collaborators: Collaborators,
    cache: Arc<dyn ResourceCache>,
    metrics: Arc<dyn MetricsSink>,
    options: CoreOptions,
}

impl Core {
    pub fn builder() -> Result<CoreBuilder> {
        CoreBuilder::new()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn modes(&self) -> &Registry<ModeFactory> {
        &self.modes
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn cache(&self) -> &Arc<dyn ResourceCache> {
        &self.cache
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    pub fn resource_type(&self, name: &str) -> Result<Arc<ResourceType>> {
        self.catalog.resource_type(name)
    }

    /// Every violation in a policy document, each with its path. Performs no cloud I/O.
    pub fn validate_document(&self, document: &Value) -> Vec<CustodianError> {
        schema::document_errors(
            document,
            self.catalog.as_ref(),
            self.catalog.filters(),
            &self.modes,
        )
    }

    pub fn load_policies(self: &Arc<Self>, document: &Value) -> Result<PolicyCollection> {
        PolicyCollection::from_document(document, self)
    }

    pub fn load_policy(self: &Arc<Self>, policy: &Value) -> Result<Policy> {
        Policy::from_value(policy, self)
    }

    /// Assembled policy schema for every known resource type, or only `resource`.
    pub fn schema(&self, resource: Option<&str>) -> Result<Value> {
        let names = match resource {
            Some(name) => vec![self.resource_type(name)?.full_name()],
            None => self.catalog.resource_names(),
        };
        let mut resources = BTreeMap::new();
        for name in names {
            let resource_type = self.resource_type(&name)?;
            resources.insert(
                name.clone(),
                schema::resource_definition(&name, &resource_type.filters, &resource_type.actions),
            );
        }
        Ok(schema::assemble(&resources, &self.modes))
    }

    /// Binds a resource type to a session for one run.
    pub fn manager(&self, resource_type: &Arc<ResourceType>) -> Result<ResourceManager> {
        let session_options = self.options.session_options();
        let session = self
            .catalog
            .session(&resource_type.descriptor.provider, &session_options)?;
        let options = ManagerOptions {
            workers: self.options.workers,
            chunk_size: self.options.chunk_size,
            session: session_options,
        };
        Ok(ResourceManager::new(resource_type.clone(), session, options)
            .with_cache(self.cache.clone())
            .with_resolver(self.catalog.clone()))
    }

    pub fn context(&self, policy: &str) -> ExecutionContext {
        let ctx = ExecutionContext::new(policy)
            .with_account(self.options.account_id.clone(), self.options.region.clone())
            .with_dry_run(self.options.dry_run)
            .with_fail_fast(self.options.fail_fast)
            .with_output_dir(self.options.output_dir.clone())
            .with_value_from_timeout(self.options.value_from_timeout)
            .with_metrics(self.metrics.clone());
        match self.options.deadline {
            Some(deadline) => ctx.with_deadline(deadline),
            None => ctx,
        }
    }
}

pub struct CoreBuilder {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    types: Vec<ResourceType>,
    filters: Registry<FilterFactory>,
    actions: Registry<ActionFactory>,
    modes: Registry<ModeFactory>,
    collaborators: Collaborators,
    cache: Arc<dyn ResourceCache>,
    metrics: Arc<dyn MetricsSink>,
    options: CoreOptions,
}

impl CoreBuilder {
    /// Starts from the generic filters, actions and modes.
    pub fn new() -> Result<Self> {
        let mut filters = Registry::new("filter");
        filters::register_defaults(&mut filters)?;
        let mut actions = Registry::new("action");
        actions::register_defaults(&mut actions)?;
        let mut modes = Registry::new("mode");
        modes::register_defaults(&mut modes)?;
        Ok(Self {
            providers: BTreeMap::new(),
            types: Vec::new(),
            filters,
            actions,
            modes,
            collaborators: Collaborators::default(),
            cache: Arc::new(NullCache),
            metrics: Arc::new(NoopMetricsSink),
            options: CoreOptions::default(),
        })
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Result<Self> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(configuration_error(format!(
                "provider '{name}' is already registered"
            )));
        }
        self.providers.insert(name, provider);
        Ok(self)
    }

    /// Registers a type eagerly instead of waiting for its provider to supply it.
    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.types.push(resource_type);
        self
    }

    /// Adds a generic filter inherited by every resource type.
    pub fn filter(mut self, name: &str, schema: Value, factory: FilterFactory) -> Result<Self> {
        self.filters.register(name, schema, factory)?;
        Ok(self)
    }

    pub fn action(mut self, name: &str, schema: Value, factory: ActionFactory) -> Result<Self> {
        self.actions.register(name, schema, factory)?;
        Ok(self)
    }

    pub fn mode(mut self, name: &str, schema: Value, factory: ModeFactory) -> Result<Self> {
        self.modes.register(name, schema, factory)?;
        Ok(self)
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResourceCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn options(mut self, options: CoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<Arc<Core>> {
        let catalog = Catalog {
            providers: self.providers,
            types: RwLock::new(Registry::new("resource")),
            filters: self.filters,
            actions: self.actions,
            retry: self.options.retry,
        };
        for resource_type in self.types {
            let full_name = resource_type.full_name();
            if catalog.types.read().expect("lock poisoned").contains(&full_name) {
                return Err(configuration_error(format!(
                    "resource type '{full_name}' is already registered"
                )));
            }
            catalog.install(&full_name, resource_type)?;
        }
        Ok(Arc::new(Core {
            catalog: Arc::new(catalog),
            modes: self.modes,
            collaborators: self.collaborators,
            cache: self.cache,
            metrics: self.metrics,
            options: self.options,
        }))
    }
}
