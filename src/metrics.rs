use std::{collections::BTreeMap, sync::Mutex};

use serde::{Deserialize, Serialize};

pub const RESOURCE_COUNT_METRIC: &str = "ResourceCount";
pub const RESOURCE_TIME_METRIC: &str = "ResourceTime";
pub const ACTION_TIME_METRIC: &str = "ActionTime";

pub type Dimensions = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    #[serde(default)]
    pub dimensions: Dimensions,
}

/// Destination for run metrics, supplied by the driver.
pub trait MetricsSink: Send + Sync {
    fn record(&self, sample: MetricSample);
}

#[derive(Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _sample: MetricSample) {}
}

#[derive(Default)]
pub struct MemoryMetricsSink {
    samples: Mutex<Vec<MetricSample>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().expect("lock poisoned").clone()
    }

    pub fn counter_total(&self, name: &str) -> f64 {
        self.samples
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|sample| sample.kind == MetricKind::Counter && sample.name == name)
            .map(|sample| sample.value)
            .sum()
    }

    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.samples
            .lock()
            .expect("lock poisoned")
            .iter()
            .rev()
            .find(|sample| sample.kind == MetricKind::Gauge && sample.name == name)
            .map(|sample| sample.value)
    }

    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.samples
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|sample| sample.kind == MetricKind::Histogram && sample.name == name)
            .map(|sample| sample.value)
            .collect()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&self, sample: MetricSample) {
        self.samples.lock().expect("lock poisoned").push(sample);
    }
}
