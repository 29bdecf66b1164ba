use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PolicyValidation,
    Configuration,
    ResourceEnumeration,
    Augment,
    Filter,
    Action,
    DryRun,
    Throttling,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Throttling | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PolicyValidation => "policy_validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::ResourceEnumeration => "resource_enumeration",
            ErrorKind::Augment => "augment",
            ErrorKind::Filter => "filter",
            ErrorKind::Action => "action",
            ErrorKind::DryRun => "dry_run",
            ErrorKind::Throttling => "throttling",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl CustodianError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            resource_id: None,
            path: None,
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Attaches the document path (JSON pointer style) of the offending node.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_dry_run(&self) -> bool {
        self.kind == ErrorKind::DryRun
    }
}

impl fmt::Display for CustodianError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, &self.resource_id) {
            (Some(path), _) => write!(f, "{} (at {})", self.message, path),
            (None, Some(resource_id)) => write!(f, "{} (resource={})", self.message, resource_id),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CustodianError {}

impl From<serde_json::Error> for CustodianError {
    fn from(err: serde_json::Error) -> Self {
        internal_error(format!("json error: {err}"))
    }
}

pub type Result<T, E = CustodianError> = std::result::Result<T, E>;

pub fn policy_validation(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::PolicyValidation, message)
}

pub fn configuration_error(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::Configuration, message)
}

pub fn enumeration_error(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::ResourceEnumeration, message)
}

pub fn augment_error(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::Augment, message)
}

pub fn filter_error(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::Filter, message)
}

pub fn action_error(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::Action, message)
}

pub fn dry_run_indication(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::DryRun, message)
}

pub fn throttling_error(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::Throttling, message)
}

pub fn timeout_error(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::Timeout, message)
}

pub fn cancelled(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::Cancelled, message)
}

pub fn internal_error(message: impl Into<String>) -> CustodianError {
    CustodianError::new(ErrorKind::Internal, message)
}

/// Builds the "unknown name" validation error with the sorted list of valid alternatives.
pub fn unknown_plugin(kind: &str, name: &str, valid: &[&str]) -> CustodianError {
    let mut valid: Vec<&str> = valid.to_vec();
    valid.sort_unstable();
    policy_validation(format!(
        "unknown {kind} type '{name}'; valid choices: {}",
        valid.join(", ")
    ))
}
