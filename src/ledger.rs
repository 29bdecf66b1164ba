use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    Skip,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Ok => "ok",
            OutcomeStatus::Skip => "skip",
            OutcomeStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub action: String,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OutcomeRecord {
    pub fn ok(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: OutcomeStatus::Ok,
            reason: None,
        }
    }

    pub fn skip(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: OutcomeStatus::Skip,
            reason: Some(reason.into()),
        }
    }

    pub fn error(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: OutcomeStatus::Error,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounters {
    pub ok: u64,
    pub skip: u64,
    pub error: u64,
}

impl OutcomeCounters {
    fn bump(&mut self, status: OutcomeStatus) {
        match status {
            OutcomeStatus::Ok => self.ok = self.ok.saturating_add(1),
            OutcomeStatus::Skip => self.skip = self.skip.saturating_add(1),
            OutcomeStatus::Error => self.error = self.error.saturating_add(1),
        }
    }

    pub fn total(&self) -> u64 {
        self.ok + self.skip + self.error
    }
}

/// Per-run record of action outcomes keyed by resource identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLedger {
    entries: BTreeMap<String, Vec<OutcomeRecord>>,
    counters: BTreeMap<String, OutcomeCounters>,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome. Returns `false` when `(resource, action)` already has one;
    /// the first record wins.
    pub fn record(&mut self, resource_id: &str, record: OutcomeRecord) -> bool {
        let outcomes = self.entries.entry(resource_id.to_string()).or_default();
        if outcomes.iter().any(|existing| existing.action == record.action) {
            tracing::debug!(
                target: "ledger",
                resource_id = resource_id,
                action = %record.action,
                "duplicate_outcome_suppressed"
            );
            return false;
        }

        self.counters
            .entry(record.action.clone())
            .or_default()
            .bump(record.status);
        outcomes.push(record);
        true
    }

    pub fn outcomes(&self, resource_id: &str) -> &[OutcomeRecord] {
        self.entries
            .get(resource_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn outcome(&self, resource_id: &str, action: &str) -> Option<&OutcomeRecord> {
        self.outcomes(resource_id)
            .iter()
            .find(|record| record.action == action)
    }

    pub fn has_error(&self, resource_id: &str) -> bool {
        self.outcomes(resource_id)
            .iter()
            .any(|record| record.status == OutcomeStatus::Error)
    }

    pub fn counters(&self, action: &str) -> OutcomeCounters {
        self.counters.get(action).copied().unwrap_or_default()
    }

    pub fn totals(&self) -> OutcomeCounters {
        self.counters
            .values()
            .fold(OutcomeCounters::default(), |mut acc, counters| {
                acc.ok += counters.ok;
                acc.skip += counters.skip;
                acc.error += counters.error;
                acc
            })
    }

    /// Entries ordered by resource identity.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[OutcomeRecord])> {
        self.entries
            .iter()
            .map(|(resource_id, outcomes)| (resource_id.as_str(), outcomes.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
