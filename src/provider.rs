use std::{collections::BTreeMap, fmt, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    actions::ActionFactory,
    error::{Result, configuration_error, timeout_error},
    filters::{FilterFactory, related},
    registry::Registry,
    resources::{
        DeclarativeAdapter, Resource, ResourceAdapter, ResourceTypeDescriptor, TagAdapter,
        tags::DeclarativeTagAdapter,
    },
};

/// Opaque credentialed transport. Every cloud call is a named operation with JSON
/// parameters and a JSON response.
#[async_trait]
pub trait Session: Send + Sync {
    async fn call(&self, operation: &str, params: &Value) -> Result<Value>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub assume_role: Option<String>,
}

/// A cloud provider binding supplied by the driver.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Short names of the resource types this provider can register on demand.
    fn resource_types(&self) -> Vec<String>;

    fn resource_type(&self, name: &str) -> Result<Option<ResourceType>>;

    fn session(&self, options: &SessionOptions) -> Result<Arc<dyn Session>>;

    /// Stable report identity (ARN/URN) of a resource.
    fn format_identity(
        &self,
        _descriptor: &ResourceTypeDescriptor,
        _resource: &Resource,
        _options: &SessionOptions,
    ) -> Option<String> {
        None
    }
}

/// Everything registered for one resource type.
#[derive(Clone)]
pub struct ResourceType {
    pub descriptor: Arc<ResourceTypeDescriptor>,
    pub adapter: Arc<dyn ResourceAdapter>,
    pub tag_adapter: Arc<dyn TagAdapter>,
    pub filters: Registry<FilterFactory>,
    pub actions: Registry<ActionFactory>,
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType")
            .field("name", &self.descriptor.full_name())
            .field("filters", &self.filters.keys())
            .field("actions", &self.actions.keys())
            .finish()
    }
}

impl ResourceType {
    /// Builds a type entirely from its descriptor, registering any declared related filters.
    pub fn declarative(descriptor: ResourceTypeDescriptor) -> Result<Self> {
        descriptor.validate()?;
        let tag_adapter = Arc::new(DeclarativeTagAdapter::new(
            descriptor.tag_spec.clone(),
            descriptor.id.clone(),
        ));
        let mut filters = Registry::new("filter");
        for spec in &descriptor.related {
            related::register(&mut filters, spec.clone())?;
        }
        Ok(Self {
            descriptor: Arc::new(descriptor),
            adapter: Arc::new(DeclarativeAdapter),
            tag_adapter,
            filters,
            actions: Registry::new("action"),
        })
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ResourceAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_tag_adapter(mut self, tag_adapter: Arc<dyn TagAdapter>) -> Self {
        self.tag_adapter = tag_adapter;
        self
    }

    pub fn with_filter(mut self, name: &str, schema: Value, factory: FilterFactory) -> Result<Self> {
        self.filters.register(name, schema, factory)?;
        Ok(self)
    }

    pub fn with_action(mut self, name: &str, schema: Value, factory: ActionFactory) -> Result<Self> {
        self.actions.register(name, schema, factory)?;
        Ok(self)
    }

    pub fn full_name(&self) -> String {
        self.descriptor.full_name()
    }
}

/// Provider whose resource types are plain descriptors, typically loaded from a JSON file.
pub struct DescriptorProvider {
    name: String,
    descriptors: BTreeMap<String, ResourceTypeDescriptor>,
    transport: Option<Arc<dyn Session>>,
}

impl DescriptorProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptors: BTreeMap::new(),
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Session>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn add(&mut self, descriptor: ResourceTypeDescriptor) -> Result<()> {
        if descriptor.provider != self.name {
            return Err(configuration_error(format!(
                "descriptor '{}' does not belong to provider '{}'",
                descriptor.full_name(),
                self.name
            )));
        }
        descriptor.validate()?;
        self.descriptors
            .insert(descriptor.type_name.clone(), descriptor);
        Ok(())
    }

    /// Groups descriptors from a JSON array file into one provider per provider name.
    pub fn load_file(path: &Path) -> Result<Vec<DescriptorProvider>> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            configuration_error(format!(
                "failed to read resource types '{}': {err}",
                path.display()
            ))
        })?;
        let descriptors: Vec<ResourceTypeDescriptor> = serde_json::from_str(&text)
            .map_err(|err| {
                configuration_error(format!(
                    "invalid resource types '{}': {err}",
                    path.display()
                ))
            })?;

        let mut providers: BTreeMap<String, DescriptorProvider> = BTreeMap::new();
        for descriptor in descriptors {
            providers
                .entry(descriptor.provider.clone())
                .or_insert_with(|| DescriptorProvider::new(descriptor.provider.clone()))
                .add(descriptor)?;
        }
        Ok(providers.into_values().collect())
    }
}

impl Provider for DescriptorProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_types(&self) -> Vec<String> {
        self.descriptors.keys().cloned().collect()
    }

    fn resource_type(&self, name: &str) -> Result<Option<ResourceType>> {
        self.descriptors
            .get(name)
            .cloned()
            .map(ResourceType::declarative)
            .transpose()
    }

    fn session(&self, _options: &SessionOptions) -> Result<Arc<dyn Session>> {
        self.transport.clone().ok_or_else(|| {
            configuration_error(format!(
                "provider '{}' has no transport configured",
                self.name
            ))
        })
    }
}

/// Marks every request object with `DryRun: true`; providers answer with a dry-run
/// indication instead of mutating.
pub struct DryRunSession {
    inner: Arc<dyn Session>,
}

impl DryRunSession {
    pub fn new(inner: Arc<dyn Session>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Session for DryRunSession {
    async fn call(&self, operation: &str, params: &Value) -> Result<Value> {
        let mut params = params.clone();
        if let Value::Object(map) = &mut params {
            map.insert("DryRun".to_string(), Value::Bool(true));
        }
        self.inner.call(operation, &params).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff capped at `backoff_max_ms`, with a small deterministic jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base_ms.max(1) as f64;
        let max = self.backoff_max_ms.max(1) as f64;
        let exp = (attempt.min(30)) as i32;
        let without_jitter = (base * 2f64.powi(exp)).min(max);
        let jitter_factor = 0.9 + (attempt as f64 % 3.0) * 0.05;
        Duration::from_millis((without_jitter * jitter_factor) as u64)
    }
}

/// Session wrapper that retries throttling and timeouts and bounds each call.
pub struct RetryingSession {
    inner: Arc<dyn Session>,
    policy: RetryPolicy,
}

impl RetryingSession {
    pub fn new(inner: Arc<dyn Session>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn attempt(&self, operation: &str, params: &Value) -> Result<Value> {
        let timeout = Duration::from_millis(self.policy.call_timeout_ms.max(1));
        match tokio::time::timeout(timeout, self.inner.call(operation, params)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(format!(
                "call '{operation}' timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl Session for RetryingSession {
    async fn call(&self, operation: &str, params: &Value) -> Result<Value> {
        let mut attempt = 0;
        loop {
            match self.attempt(operation, params).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff_delay(attempt);
                    tracing::debug!(
                        target: "session",
                        operation = operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "session_call_retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::warn!(
                            target: "session",
                            operation = operation,
                            attempts = attempt + 1,
                            error = %err,
                            "session_retries_exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::{RetryPolicy, RetryingSession, Session};
    use crate::error::{ErrorKind, Result, action_error, throttling_error};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl Session for Flaky {
        async fn call(&self, _operation: &str, _params: &Value) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.retryable {
                    return Err(throttling_error("rate exceeded"));
                }
                return Err(action_error("access denied"));
            }
            Ok(json!({"ok": true}))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            call_timeout_ms: 1_000,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff_delay(1) > policy.backoff_delay(0));
        assert!(policy.backoff_delay(20) <= Duration::from_millis(10_000));
    }

    #[tokio::test]
    async fn throttling_is_retried_transparently() {
        let inner = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            retryable: true,
        });
        let session = RetryingSession::new(inner.clone(), fast_policy(5));
        let value = session
            .call("DescribeThings", &json!({}))
            .await
            .expect("retries should absorb throttling");
        assert_eq!(value["ok"], json!(true));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_throttling() {
        let inner = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            retryable: true,
        });
        let session = RetryingSession::new(inner.clone(), fast_policy(2));
        let err = session
            .call("DescribeThings", &json!({}))
            .await
            .expect_err("retries should exhaust");
        assert_eq!(err.kind, ErrorKind::Throttling);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let inner = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
            retryable: false,
        });
        let session = RetryingSession::new(inner.clone(), fast_policy(5));
        let err = session
            .call("DeleteThing", &json!({}))
            .await
            .expect_err("business error should surface");
        assert_eq!(err.kind, ErrorKind::Action);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
