use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{Result, cancelled, timeout_error},
    ledger::ResultLedger,
    metrics::{Dimensions, MetricKind, MetricSample, MetricsSink, NoopMetricsSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    ImplicitFilter,
    RelatedResourceMissing,
    DuplicateIdentity,
    AugmentDropped,
    ValueFromEmpty,
}

/// Structured warning recorded on the run so callers can assert on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    pub kind: WarningKind,
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
}

impl RunWarning {
    pub fn new(kind: WarningKind, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            message: message.into(),
            key: None,
            count: 0,
            ids: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.count = self.count.max(ids.len());
        self.ids = ids;
        self
    }
}

/// Per-policy-run execution state.
pub struct ExecutionContext {
    run_id: String,
    policy: String,
    start_time: OffsetDateTime,
    started_at: Instant,
    account_id: String,
    region: String,
    dry_run: bool,
    fail_fast: bool,
    output_dir: Option<String>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    value_from_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    ledger: Mutex<ResultLedger>,
    warnings: Mutex<Vec<RunWarning>>,
    value_cache: Mutex<HashMap<String, Value>>,
}

impl ExecutionContext {
    pub fn new(policy: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            policy: policy.into(),
            start_time: OffsetDateTime::now_utc(),
            started_at: Instant::now(),
            account_id: String::new(),
            region: String::new(),
            dry_run: false,
            fail_fast: false,
            output_dir: None,
            deadline: None,
            cancellation: CancellationToken::new(),
            value_from_timeout: Duration::from_secs(10),
            metrics: Arc::new(NoopMetricsSink),
            ledger: Mutex::new(ResultLedger::new()),
            warnings: Mutex::new(Vec::new()),
            value_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>, region: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self.region = region.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_output_dir(mut self, output_dir: Option<String>) -> Self {
        self.output_dir = output_dir;
        self
    }

    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = self.started_at.checked_add(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_value_from_timeout(mut self, timeout: Duration) -> Self {
        self.value_from_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn start_time(&self) -> OffsetDateTime {
        self.start_time
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn output_dir(&self) -> Option<&str> {
        self.output_dir.as_deref()
    }

    pub fn value_from_timeout(&self) -> Duration {
        self.value_from_timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Fails once the driver cancelled the run or the deadline passed.
    pub fn check_deadline(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(cancelled(format!("policy '{}' run was cancelled", self.policy)));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(timeout_error(format!(
                "policy '{}' exceeded its deadline",
                self.policy
            )));
        }
        Ok(())
    }

    pub fn ledger(&self) -> MutexGuard<'_, ResultLedger> {
        self.ledger.lock().expect("lock poisoned")
    }

    pub fn ledger_snapshot(&self) -> ResultLedger {
        self.ledger().clone()
    }

    pub fn warn(&self, warning: RunWarning) {
        tracing::warn!(
            target: "context",
            run_id = %self.run_id,
            policy = %self.policy,
            kind = ?warning.kind,
            source = %warning.source,
            count = warning.count,
            key = warning.key.as_deref().unwrap_or(""),
            "{}",
            warning.message
        );
        self.warnings.lock().expect("lock poisoned").push(warning);
    }

    pub fn warnings(&self) -> Vec<RunWarning> {
        self.warnings.lock().expect("lock poisoned").clone()
    }

    pub fn cached_value(&self, key: &str) -> Option<Value> {
        self.value_cache
            .lock()
            .expect("lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn store_value(&self, key: impl Into<String>, value: Value) {
        self.value_cache
            .lock()
            .expect("lock poisoned")
            .insert(key.into(), value);
    }

    pub fn counter(&self, name: &str, value: f64, dimensions: Dimensions) {
        self.emit(name, MetricKind::Counter, value, dimensions);
    }

    pub fn gauge(&self, name: &str, value: f64, dimensions: Dimensions) {
        self.emit(name, MetricKind::Gauge, value, dimensions);
    }

    pub fn histogram(&self, name: &str, value: f64, dimensions: Dimensions) {
        self.emit(name, MetricKind::Histogram, value, dimensions);
    }

    fn emit(&self, name: &str, kind: MetricKind, value: f64, mut dimensions: Dimensions) {
        dimensions
            .entry("policy".to_string())
            .or_insert_with(|| self.policy.clone());
        self.metrics.record(MetricSample {
            name: name.to_string(),
            kind,
            value,
            dimensions,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{ExecutionContext, RunWarning, WarningKind};
    use crate::{error::ErrorKind, ledger::OutcomeRecord, metrics::MemoryMetricsSink};

    #[test]
    fn deadline_and_cancellation_are_reported_distinctly() {
        let ctx = ExecutionContext::new("p").with_deadline(Duration::ZERO);
        let err = ctx.check_deadline().expect_err("zero deadline should expire");
        assert_eq!(err.kind, ErrorKind::Timeout);

        let ctx = ExecutionContext::new("p");
        ctx.check_deadline().expect("fresh context should be live");
        ctx.cancellation().cancel();
        let err = ctx.check_deadline().expect_err("cancelled context should fail");
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[test]
    fn unrepresentable_deadline_never_expires() {
        let ctx = ExecutionContext::new("p").with_deadline(Duration::MAX);
        ctx.check_deadline().expect("deadline beyond the clock should stay live");
    }

    #[test]
    fn metrics_carry_policy_dimension() {
        let sink = Arc::new(MemoryMetricsSink::new());
        let ctx = ExecutionContext::new("tag-prod").with_metrics(sink.clone());
        ctx.counter("action.tag.ok", 2.0, Default::default());

        let samples = sink.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(
            samples[0].dimensions.get("policy").map(String::as_str),
            Some("tag-prod")
        );
    }

    #[test]
    fn warnings_and_ledger_accumulate() {
        let ctx = ExecutionContext::new("p");
        ctx.warn(
            RunWarning::new(WarningKind::ImplicitFilter, "stop", "removed 2 resources")
                .with_key("State.Name")
                .with_count(2),
        );
        ctx.ledger().record("i-1", OutcomeRecord::ok("stop"));

        assert_eq!(ctx.warnings()[0].count, 2);
        assert_eq!(ctx.ledger_snapshot().len(), 1);
        assert!(!ctx.run_id().is_empty());
    }
}
