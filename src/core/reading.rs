//! Decoded sensor values and the outcome of one poll.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::error::PollFailure;

/// Value of one metric, serialized as a bare JSON number or string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Integer(v) => Some(*v as f64),
            MetricValue::Decimal(v) => Some(*v),
            MetricValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetricValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Decimal(v) => write!(f, "{}", v),
            MetricValue::Text(text) => f.write_str(text),
        }
    }
}

/// Timestamped snapshot of the metrics of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub device_unique_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl Reading {
    pub fn new(device_unique_id: &str, metrics: BTreeMap<String, MetricValue>) -> Self {
        Self {
            device_unique_id: device_unique_id.to_string(),
            timestamp: Utc::now(),
            metrics,
        }
    }

    /// Numeric value of `name`, if present and numeric.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(MetricValue::as_f64)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.metrics.get(name).and_then(MetricValue::as_text)
    }

    /// `battery=87 battery_state=high moisture=45 temperature=22.5` style summary.
    pub fn summary(&self) -> String {
        self.metrics
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of polling one device, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub unique_id: String,
    pub name: String,
    pub attempts: u32,
    pub result: Result<Reading, PollFailure>,
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn reading(&self) -> Option<&Reading> {
        self.result.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&PollFailure> {
        self.result.as_ref().err()
    }
}
