use std::{fmt, sync::Arc};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::{
    actions::ActionFactory,
    context::ExecutionContext,
    error::Result,
    filters::FilterFactory,
    pool::DEFAULT_WORKERS,
    provider::{ResourceType, Session, SessionOptions},
    registry::Registry,
    resources::{
        NullCache, PARENT_ID_ANNOTATION, Resource, ResourceCache, ResourceTypeDescriptor,
        TagAdapter, pipeline, scalar_string,
    },
};

/// Looks up resource types and sessions for related and parent managers.
pub trait ResourceResolver: Send + Sync {
    fn resource_type(&self, name: &str) -> Result<Arc<ResourceType>>;

    fn session(&self, provider: &str, options: &SessionOptions) -> Result<Arc<dyn Session>>;

    fn format_identity(
        &self,
        _descriptor: &ResourceTypeDescriptor,
        _resource: &Resource,
        _options: &SessionOptions,
    ) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    pub workers: usize,
    pub chunk_size: usize,
    pub session: SessionOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chunk_size: 20,
            session: SessionOptions::default(),
        }
    }
}

/// Binds one resource type to one policy run.
#[derive(Clone)]
pub struct ResourceManager {
    resource_type: Arc<ResourceType>,
    session: Arc<dyn Session>,
    options: ManagerOptions,
    cache: Arc<dyn ResourceCache>,
    resolver: Option<Arc<dyn ResourceResolver>>,
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("resource_type", &self.type_name())
            .field("options", &self.options)
            .finish()
    }
}

impl ResourceManager {
    pub fn new(
        resource_type: Arc<ResourceType>,
        session: Arc<dyn Session>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            resource_type,
            session,
            options,
            cache: Arc::new(NullCache),
            resolver: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResourceCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn resource_type(&self) -> &Arc<ResourceType> {
        &self.resource_type
    }

    pub fn descriptor(&self) -> &ResourceTypeDescriptor {
        &self.resource_type.descriptor
    }

    pub fn type_name(&self) -> String {
        self.resource_type.full_name()
    }

    pub fn filters(&self) -> &Registry<FilterFactory> {
        &self.resource_type.filters
    }

    pub fn actions(&self) -> &Registry<ActionFactory> {
        &self.resource_type.actions
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn tag_adapter(&self) -> &Arc<dyn TagAdapter> {
        &self.resource_type.tag_adapter
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<dyn ResourceCache> {
        &self.cache
    }

    /// Run identity: the native id, prefixed by the parent id for child resources.
    pub fn resource_id(&self, resource: &Resource) -> String {
        let native = self
            .descriptor()
            .native_id(resource)
            .unwrap_or_else(|| content_identity(resource));
        match resource.get(PARENT_ID_ANNOTATION).and_then(scalar_string) {
            Some(parent) => format!("{parent}/{native}"),
            None => native,
        }
    }

    /// Provider-formatted report identity (ARN/URN), when the provider has one.
    pub fn format_identity(&self, resource: &Resource) -> Option<String> {
        self.resolver.as_ref().and_then(|resolver| {
            resolver.format_identity(self.descriptor(), resource, &self.options.session)
        })
    }

    /// Enumerates and augments every resource of this type, through the cache.
    ///
    /// Boxed because child types enumerate their parents through this call.
    pub fn resources<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Vec<Resource>>> {
        Box::pin(pipeline::load_resources(self, ctx))
    }

    /// Fetches exactly the resources with the given native identities.
    pub async fn get_resources(
        &self,
        ids: &[String],
        ctx: &ExecutionContext,
    ) -> Result<Vec<Resource>> {
        pipeline::load_by_ids(self, ids, ctx).await
    }

    /// Manager for another resource type sharing this run's session options and cache.
    pub fn related_manager(&self, type_name: &str) -> Result<ResourceManager> {
        if type_name == self.type_name() {
            return Ok(self.clone());
        }
        let resolver = self.resolver.as_ref().ok_or_else(|| {
            crate::error::configuration_error(format!(
                "no resolver available to load related type '{type_name}'"
            ))
        })?;
        let resource_type = resolver.resource_type(type_name)?;
        let session = if resource_type.descriptor.provider == self.descriptor().provider {
            self.session.clone()
        } else {
            resolver.session(&resource_type.descriptor.provider, &self.options.session)?
        };
        Ok(ResourceManager {
            resource_type,
            session,
            options: self.options.clone(),
            cache: self.cache.clone(),
            resolver: Some(resolver.clone()),
        })
    }
}

/// Identity for resources lacking their id key: the content without annotations.
pub(crate) fn content_identity(resource: &Resource) -> String {
    let content: serde_json::Map<String, Value> = resource
        .iter()
        .filter(|(key, _)| !key.starts_with(crate::resources::ANNOTATION_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    serde_json::to_string(&content).unwrap_or_default()
}
