//! Side-effect actions delivered through driver-supplied collaborators.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    actions::{Action, ActionContext, ActionFactory, ActionResult, ResourceFailure},
    error::{Result, action_error, policy_validation},
    keypath::KeyPath,
    pool::{chunked, map_chunks},
    registry::Registry,
    resources::{ANNOTATION_PREFIX, Resource},
    schema::type_schema,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyMessage {
    pub policy: String,
    pub subject: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub transport: Option<Value>,
    pub account_id: String,
    pub region: String,
    pub execution_id: String,
    pub action: Map<String, Value>,
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub event: Option<Value>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &NotifyMessage) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Returns the HTTP status code of the response.
    async fn send(&self, request: &WebhookRequest) -> Result<u16>;
}

#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, function: &str, payload: &Value, asynchronous: bool) -> Result<Value>;
}

/// Default collaborators: record what would have been sent and succeed.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &NotifyMessage) -> Result<()> {
        tracing::info!(
            target: "actions",
            policy = %message.policy,
            subject = %message.subject,
            to = ?message.to,
            resources = message.resources.len(),
            "notification_logged"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogWebhookTransport;

#[async_trait]
impl WebhookTransport for LogWebhookTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<u16> {
        tracing::info!(
            target: "actions",
            url = %request.url,
            method = %request.method,
            "webhook_logged"
        );
        Ok(200)
    }
}

#[derive(Debug, Default)]
pub struct LogFunctionInvoker;

#[async_trait]
impl FunctionInvoker for LogFunctionInvoker {
    async fn invoke(&self, function: &str, payload: &Value, asynchronous: bool) -> Result<Value> {
        let count = payload
            .get("resources")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        tracing::info!(
            target: "actions",
            function = function,
            asynchronous = asynchronous,
            resources = count,
            "function_invocation_logged"
        );
        Ok(Value::Null)
    }
}

/// Webhook transport over HTTP.
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| action_error(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<u16> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| action_error(format!("invalid http method '{}'", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| action_error(format!("webhook '{}' failed: {err}", request.url)))?;
        Ok(response.status().as_u16())
    }
}

/// External collaborators available to actions.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub webhook: Arc<dyn WebhookTransport>,
    pub invoker: Arc<dyn FunctionInvoker>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            webhook: Arc::new(LogWebhookTransport),
            invoker: Arc::new(LogFunctionInvoker),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookTransport>) -> Self {
        self.webhook = webhook;
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn FunctionInvoker>) -> Self {
        self.invoker = invoker;
        self
    }
}

/// Resources as sent to external systems; only `c7n:MatchedFilters` survives of the annotations.
fn outbound(resources: &[Resource]) -> Vec<Value> {
    resources
        .iter()
        .map(|resource| {
            Value::Object(
                resource
                    .iter()
                    .filter(|(key, _)| {
                        !key.starts_with(ANNOTATION_PREFIX) || key.as_str() == "c7n:MatchedFilters"
                    })
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            )
        })
        .collect()
}

fn envelope(ctx: &ActionContext<'_>, config: &Map<String, Value>) -> Map<String, Value> {
    let mut envelope = Map::new();
    envelope.insert("policy".to_string(), Value::from(ctx.execution.policy()));
    envelope.insert("account_id".to_string(), Value::from(ctx.execution.account_id()));
    envelope.insert("region".to_string(), Value::from(ctx.execution.region()));
    envelope.insert("execution_id".to_string(), Value::from(ctx.execution.run_id()));
    envelope.insert(
        "execution_start".to_string(),
        Value::from(ctx.execution.start_time().unix_timestamp()),
    );
    envelope.insert("action".to_string(), Value::Object(config.clone()));
    envelope.insert("event".to_string(), ctx.event.cloned().unwrap_or(Value::Null));
    envelope
}

fn string_list(data: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    match data.get(key) {
        None => Ok(Vec::new()),
        Some(Value::String(one)) => Ok(vec![one.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| policy_validation(format!("'{key}' entries must be strings")))
            })
            .collect(),
        Some(_) => Err(policy_validation(format!("'{key}' must be a string or list"))),
    }
}

#[derive(Debug)]
pub struct NotifyAction {
    config: Map<String, Value>,
    to: Vec<String>,
    subject: String,
}

impl NotifyAction {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let to = string_list(data, "to")?;
        if to.is_empty() {
            return Err(policy_validation("notify requires at least one 'to' recipient"));
        }
        Ok(Self {
            config: data.clone(),
            to,
            subject: data
                .get("subject")
                .and_then(Value::as_str)
                .unwrap_or("Custodian notification: {policy}")
                .to_string(),
        })
    }

    fn render_subject(&self, ctx: &ActionContext<'_>, count: usize) -> String {
        self.subject
            .replace("{policy}", ctx.execution.policy())
            .replace("{account_id}", ctx.execution.account_id())
            .replace("{region}", ctx.execution.region())
            .replace("{count}", &count.to_string())
    }
}

#[async_trait]
impl Action for NotifyAction {
    fn type_name(&self) -> &str {
        "notify"
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    async fn process(
        &self,
        resources: &mut [Resource],
        ctx: &ActionContext<'_>,
    ) -> Result<ActionResult> {
        let message = NotifyMessage {
            policy: ctx.execution.policy().to_string(),
            subject: self.render_subject(ctx, resources.len()),
            to: self.to.clone(),
            transport: self.config.get("transport").cloned(),
            account_id: ctx.execution.account_id().to_string(),
            region: ctx.execution.region().to_string(),
            execution_id: ctx.execution.run_id().to_string(),
            action: self.config.clone(),
            resources: outbound(resources)
                .into_iter()
                .filter_map(|value| match value {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            event: ctx.event.cloned(),
        };
        ctx.collaborators.notifier.notify(&message).await?;
        Ok(ActionResult::ok())
    }
}

#[derive(Debug)]
pub struct WebhookAction {
    config: Map<String, Value>,
    url: String,
    method: String,
    batch: bool,
    batch_size: usize,
    body: Option<KeyPath>,
    headers: BTreeMap<String, String>,
}

impl WebhookAction {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let url = data
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| policy_validation("webhook requires 'url'"))?
            .to_string();
        let method = data
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST")
            .to_ascii_uppercase();
        let body = data
            .get("body")
            .and_then(Value::as_str)
            .map(|expr| {
                KeyPath::parse(expr)
                    .map_err(|err| policy_validation(format!("invalid webhook body '{expr}': {err}")))
            })
            .transpose()?;
        let mut headers = BTreeMap::new();
        if let Some(Value::Object(map)) = data.get("headers") {
            for (name, value) in map {
                let value = value.as_str().ok_or_else(|| {
                    policy_validation(format!("webhook header '{name}' must be a string"))
                })?;
                headers.insert(name.clone(), value.to_string());
            }
        }
        Ok(Self {
            config: data.clone(),
            url,
            method,
            batch: data.get("batch").and_then(Value::as_bool).unwrap_or(false),
            batch_size: data
                .get("batch_size")
                .and_then(Value::as_u64)
                .map(|n| n.max(1) as usize)
                .unwrap_or(500),
            body,
            headers,
        })
    }

    fn request(&self, mut envelope: Map<String, Value>, resources: Vec<Value>) -> WebhookRequest {
        if self.batch {
            envelope.insert("resources".to_string(), Value::Array(resources));
        } else {
            let resource = resources.into_iter().next().unwrap_or(Value::Null);
            envelope.insert("resource".to_string(), resource);
        }
        let envelope = Value::Object(envelope);
        let body = match &self.body {
            Some(path) => path.search(&envelope),
            None => envelope,
        };
        WebhookRequest {
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body,
        }
    }
}

#[async_trait]
impl Action for WebhookAction {
    fn type_name(&self) -> &str {
        "webhook"
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    async fn process(
        &self,
        resources: &mut [Resource],
        ctx: &ActionContext<'_>,
    ) -> Result<ActionResult> {
        let ids: Vec<String> = resources.iter().map(|r| ctx.resource_id(r)).collect();
        let payloads = outbound(resources);
        let size = if self.batch { self.batch_size } else { 1 };
        let chunks = chunked((0..payloads.len()).collect::<Vec<_>>(), size);
        let base = envelope(ctx, &self.config);
        let transport = ctx.collaborators.webhook.clone();

        let results = map_chunks(chunks.clone(), ctx.workers(), ctx.execution, |_, positions| {
            let request = self.request(
                base.clone(),
                positions.iter().map(|&p| payloads[p].clone()).collect(),
            );
            let transport = transport.clone();
            async move {
                let status = transport.send(&request).await?;
                if status >= 400 {
                    return Err(action_error(format!(
                        "webhook {} {} returned status {status}",
                        request.method, request.url
                    )));
                }
                Ok(())
            }
        })
        .await;

        let failures = collect_chunk_failures(&chunks, &ids, results);
        Ok(ActionResult::with_failures(failures))
    }
}

fn collect_chunk_failures(
    chunks: &[Vec<usize>],
    ids: &[String],
    results: Vec<crate::pool::ChunkResult<()>>,
) -> Vec<ResourceFailure> {
    results
        .into_iter()
        .filter_map(|chunk| chunk.result.err().map(|err| (chunk.index, err)))
        .flat_map(|(index, err)| {
            chunks[index]
                .iter()
                .map(|&position| ResourceFailure::from_error(ids[position].clone(), &err))
                .collect::<Vec<_>>()
        })
        .collect()
}

#[derive(Debug)]
pub struct InvokeLambdaAction {
    config: Map<String, Value>,
    function: String,
    batch_size: usize,
    asynchronous: bool,
}

impl InvokeLambdaAction {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let function = data
            .get("function")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| policy_validation("invoke-lambda requires 'function'"))?
            .to_string();
        Ok(Self {
            config: data.clone(),
            function,
            batch_size: data
                .get("batch_size")
                .and_then(Value::as_u64)
                .map(|n| n.max(1) as usize)
                .unwrap_or(250),
            asynchronous: data.get("async").and_then(Value::as_bool).unwrap_or(true),
        })
    }
}

#[async_trait]
impl Action for InvokeLambdaAction {
    fn type_name(&self) -> &str {
        "invoke-lambda"
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    async fn process(
        &self,
        resources: &mut [Resource],
        ctx: &ActionContext<'_>,
    ) -> Result<ActionResult> {
        let ids: Vec<String> = resources.iter().map(|r| ctx.resource_id(r)).collect();
        let payloads = outbound(resources);
        let chunks = chunked((0..payloads.len()).collect::<Vec<_>>(), self.batch_size);
        let base = envelope(ctx, &self.config);
        let invoker = ctx.collaborators.invoker.clone();

        let results = map_chunks(chunks.clone(), ctx.workers(), ctx.execution, |_, positions| {
            let mut payload = base.clone();
            payload.insert("version".to_string(), json!(1));
            payload.insert(
                "resources".to_string(),
                Value::Array(positions.iter().map(|&p| payloads[p].clone()).collect()),
            );
            let payload = Value::Object(payload);
            let invoker = invoker.clone();
            let function = self.function.as_str();
            let asynchronous = self.asynchronous;
            async move {
                invoker.invoke(function, &payload, asynchronous).await?;
                Ok(())
            }
        })
        .await;

        let failures = collect_chunk_failures(&chunks, &ids, results);
        Ok(ActionResult::with_failures(failures))
    }
}

pub fn register(registry: &mut Registry<ActionFactory>) -> Result<()> {
    let notify: ActionFactory =
        Arc::new(|data, _builder| Ok(Box::new(NotifyAction::from_data(data)?)));
    registry.register(
        "notify",
        type_schema(
            "notify",
            json!({
                "to": {"type": ["string", "array"], "items": {"type": "string"}},
                "subject": {"type": "string"},
                "violation_desc": {"type": "string"},
                "action_desc": {"type": "string"},
                "template": {"type": "string"},
                "transport": {"type": "object"}
            }),
            &["to"],
        ),
        notify,
    )?;

    let webhook: ActionFactory =
        Arc::new(|data, _builder| Ok(Box::new(WebhookAction::from_data(data)?)));
    registry.register(
        "webhook",
        type_schema(
            "webhook",
            json!({
                "url": {"type": "string"},
                "method": {"enum": ["GET", "POST", "PUT", "PATCH", "DELETE"]},
                "batch": {"type": "boolean"},
                "batch_size": {"type": "integer", "minimum": 1},
                "body": {"type": "string"},
                "headers": {"type": "object", "additionalProperties": {"type": "string"}}
            }),
            &["url"],
        ),
        webhook,
    )?;

    let invoke: ActionFactory =
        Arc::new(|data, _builder| Ok(Box::new(InvokeLambdaAction::from_data(data)?)));
    registry.register(
        "invoke-lambda",
        type_schema(
            "invoke-lambda",
            json!({
                "function": {"type": "string"},
                "batch_size": {"type": "integer", "minimum": 1},
                "async": {"type": "boolean"}
            }),
            &["function"],
        ),
        invoke,
    )
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::{InvokeLambdaAction, NotifyAction, WebhookAction};

    fn data(value: serde_json::Value) -> Map<String, serde_json::Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn webhook_body_selects_from_envelope() {
        let action = WebhookAction::from_data(&data(json!({
            "type": "webhook",
            "url": "https://hooks.example/x",
            "method": "put",
            "body": "resource.Name"
        })))
        .expect("webhook should build");
        let mut envelope = Map::new();
        envelope.insert("policy".to_string(), json!("p"));
        let request = action.request(envelope, vec![json!({"Name": "a"})]);
        assert_eq!(request.method, "PUT");
        assert_eq!(request.body, json!("a"));
    }

    #[test]
    fn required_fields_are_enforced() {
        assert!(NotifyAction::from_data(&data(json!({"type": "notify"}))).is_err());
        assert!(WebhookAction::from_data(&data(json!({"type": "webhook"}))).is_err());
        assert!(InvokeLambdaAction::from_data(&data(json!({"type": "invoke-lambda", "function": ""}))).is_err());
        let notify = NotifyAction::from_data(&data(json!({"type": "notify", "to": "ops@example.com"})))
            .expect("single recipient string is accepted");
        assert_eq!(notify.to, vec!["ops@example.com"]);
    }

    #[tokio::test]
    async fn log_invoker_accepts_any_payload_shape() {
        use super::{FunctionInvoker, LogFunctionInvoker};

        let invoker = LogFunctionInvoker;
        for payload in [json!({"resources": [{"id": "a"}, {"id": "b"}]}), json!({}), json!(null)] {
            let response = invoker
                .invoke("cleanup", &payload, true)
                .await
                .expect("logging invoker should succeed");
            assert!(response.is_null());
        }
    }
}
