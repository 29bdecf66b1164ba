use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use jsonschema::{JSONSchema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::{provider::RetryPolicy, runtime::CoreOptions};

const BUNDLED_SCHEMA: &str = include_str!("../custodian.schema.json");

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RuntimeConfig {
    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingConfig,
    #[serde(default)]
    #[validate(nested)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,
    #[serde(default)]
    #[validate(nested)]
    pub session: SessionConfig,
    #[serde(default)]
    #[validate(nested)]
    pub value_from: ValueFromConfig,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub output_dir: Option<String>,
}

fn default_enabled_true() -> bool {
    true
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("./logs/custodian")
}

fn default_logging_filter() -> String {
    "info".to_string()
}

fn default_logging_rotation() -> LoggingRotation {
    LoggingRotation::Daily
}

fn default_logging_retention_days() -> usize {
    14
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_logging_filter")]
    #[validate(length(min = 1))]
    pub filter: String,
    #[serde(default = "default_logging_rotation")]
    pub rotation: LoggingRotation,
    #[serde(default = "default_logging_retention_days")]
    #[validate(range(min = 1))]
    pub retention_days: usize,
    #[serde(default = "default_enabled_true")]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logging_dir(),
            filter: default_logging_filter(),
            rotation: default_logging_rotation(),
            retention_days: default_logging_retention_days(),
            stderr_warn_enabled: true,
        }
    }
}

fn default_workers() -> usize {
    3
}

fn default_chunk_size() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExecutionConfig {
    #[serde(default = "default_workers")]
    #[validate(range(min = 1))]
    pub workers: usize,
    #[serde(default = "default_chunk_size")]
    #[validate(range(min = 1))]
    pub default_chunk_size: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    #[validate(range(min = 1))]
    pub deadline_seconds: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            default_chunk_size: default_chunk_size(),
            fail_fast: false,
            dry_run: false,
            deadline_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    None,
    Memory,
    File,
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Memory
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./state/cache")
}

fn default_cache_ttl_minutes() -> u64 {
    15
}

fn default_cache_max_entries() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_ttl_minutes")]
    pub ttl_minutes: u64,
    #[serde(default = "default_cache_max_entries")]
    #[validate(range(min = 1))]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            dir: default_cache_dir(),
            ttl_minutes: default_cache_ttl_minutes(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_max_retries() -> u32 {
    RetryPolicy::default().max_retries
}

fn default_backoff_base_ms() -> u64 {
    RetryPolicy::default().backoff_base_ms
}

fn default_backoff_max_ms() -> u64 {
    RetryPolicy::default().backoff_max_ms
}

fn default_call_timeout_ms() -> u64 {
    RetryPolicy::default().call_timeout_ms
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SessionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    #[validate(range(min = 1))]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    #[validate(range(min = 1))]
    pub backoff_max_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    #[validate(range(min = 1))]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub assume_role: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            profile: None,
            assume_role: None,
        }
    }
}

impl SessionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms.max(self.backoff_base_ms),
            call_timeout_ms: self.call_timeout_ms,
        }
    }
}

fn default_value_from_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ValueFromConfig {
    #[serde(default = "default_value_from_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
}

impl Default for ValueFromConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_value_from_timeout_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config_value: Value = json5::from_str(&config_content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let config_base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let schema = resolve_schema(config_base, &config_value)?;
        validate_against_schema(&config_value, &schema)?;

        let mut config: RuntimeConfig =
            serde_json::from_value(config_value).context("failed to deserialize runtime config")?;
        config
            .validate()
            .map_err(|errors| anyhow!("config validation failed: {errors}"))?;

        if !config.cache.dir.is_absolute() {
            config.cache.dir = config_base.join(&config.cache.dir);
        }
        if let Some(output_dir) = &config.output_dir
            && !Path::new(output_dir).is_absolute()
            && !output_dir.contains("://")
        {
            config.output_dir = Some(config_base.join(output_dir).display().to_string());
        }

        Ok(config)
    }

    /// Options the `Core` applies to every policy it loads.
    pub fn core_options(&self) -> CoreOptions {
        CoreOptions {
            account_id: self.account_id.clone(),
            region: self.region.clone(),
            profile: self.session.profile.clone(),
            assume_role: self.session.assume_role.clone(),
            output_dir: self.output_dir.clone(),
            workers: self.execution.workers,
            chunk_size: self.execution.default_chunk_size,
            dry_run: self.execution.dry_run,
            fail_fast: self.execution.fail_fast,
            deadline: self.execution.deadline_seconds.map(Duration::from_secs),
            value_from_timeout: Duration::from_millis(self.value_from.timeout_ms),
            retry: self.session.retry_policy(),
        }
    }
}

fn resolve_schema(config_base: &Path, config_value: &Value) -> Result<Value> {
    if let Some(path_text) = config_value.get("$schema").and_then(|value| value.as_str()) {
        let configured = PathBuf::from(path_text);
        let schema_path = if configured.is_absolute() {
            configured
        } else {
            config_base.join(&configured)
        };
        let schema_content = fs::read_to_string(&schema_path)
            .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
        return serde_json::from_str(&schema_content)
            .with_context(|| format!("failed to parse schema {}", schema_path.display()));
    }

    let local_default = config_base.join("custodian.schema.json");
    if local_default.exists() {
        let schema_content = fs::read_to_string(&local_default)
            .with_context(|| format!("failed to read schema {}", local_default.display()))?;
        return serde_json::from_str(&schema_content)
            .with_context(|| format!("failed to parse schema {}", local_default.display()));
    }

    serde_json::from_str(BUNDLED_SCHEMA).context("failed to parse bundled config schema")
}

fn validate_against_schema(config_value: &Value, schema: &Value) -> Result<()> {
    let compiled =
        JSONSchema::compile(schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    match compiled.validate(config_value) {
        Ok(()) => Ok(()),
        Err(errors_iter) => {
            let validation_errors: Vec<ValidationError> = errors_iter.collect();
            let messages: Vec<String> = validation_errors
                .into_iter()
                .map(|error| error.to_string())
                .collect();
            Err(anyhow!("config validation failed: {}", messages.join("; ")))
        }
    }
}
