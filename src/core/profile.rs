//! Data point layout of a sensor class.

use crate::core::protocol::{DataPoint, DpValue};
use crate::core::reading::MetricValue;

/// How the raw data point value becomes a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    /// Integer divided by 10^scale.
    Number { scale: u8, unit: &'static str },
    /// Enum index into a list of labels, `unknown` when out of range.
    Label(&'static [&'static str]),
}

/// One metric reported by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub name: &'static str,
    pub dp_id: u8,
    pub kind: MetricKind,
    pub device_class: &'static str,
    pub display_name: &'static str,
    pub diagnostic: bool,
    /// A reading is complete once every required metric has arrived.
    pub required: bool,
}

pub const UNKNOWN_LABEL: &str = "unknown";

impl MetricSpec {
    pub fn convert(&self, value: &DpValue) -> Option<MetricValue> {
        match &self.kind {
            MetricKind::Number { scale: 0, .. } => value.as_integer().map(MetricValue::Integer),
            MetricKind::Number { scale, .. } => {
                let divisor = 10f64.powi(i32::from(*scale));
                value
                    .as_integer()
                    .map(|raw| MetricValue::Decimal(raw as f64 / divisor))
            }
            MetricKind::Label(labels) => match value {
                DpValue::Enum(index) => {
                    let label = labels.get(usize::from(*index)).copied().unwrap_or(UNKNOWN_LABEL);
                    Some(MetricValue::Text(label.to_string()))
                }
                _ => None,
            },
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self.kind {
            MetricKind::Number { unit, .. } => Some(unit),
            MetricKind::Label(_) => None,
        }
    }
}

/// Data point map for a device class plus the write that makes it report.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorProfile {
    pub model: &'static str,
    pub manufacturer: &'static str,
    pub metrics: Vec<MetricSpec>,
    pub poke: DataPoint,
}

impl SensorProfile {
    /// Tuya SGS01 soil moisture / temperature sensor.
    ///
    /// Writing the temperature unit (DP 9) as celsius makes it push its
    /// current values.
    pub fn sgs01() -> Self {
        Self {
            model: "SGS01 Plant Sensor",
            manufacturer: "Tuya / Smart Life",
            metrics: vec![
                MetricSpec {
                    name: "moisture",
                    dp_id: 4,
                    kind: MetricKind::Number { scale: 0, unit: "%" },
                    device_class: "moisture",
                    display_name: "Soil Moisture",
                    diagnostic: false,
                    required: true,
                },
                MetricSpec {
                    name: "temperature",
                    dp_id: 3,
                    kind: MetricKind::Number { scale: 1, unit: "°C" },
                    device_class: "temperature",
                    display_name: "Temperature",
                    diagnostic: false,
                    required: true,
                },
                MetricSpec {
                    name: "battery",
                    dp_id: 15,
                    kind: MetricKind::Number { scale: 0, unit: "%" },
                    device_class: "battery",
                    display_name: "Battery",
                    diagnostic: true,
                    required: true,
                },
                MetricSpec {
                    name: "battery_state",
                    dp_id: 14,
                    kind: MetricKind::Label(&["low", "medium", "high"]),
                    device_class: "enum",
                    display_name: "Battery State",
                    diagnostic: true,
                    required: false,
                },
            ],
            poke: DataPoint::new(9, DpValue::Enum(0)),
        }
    }

    pub fn metric_for(&self, dp_id: u8) -> Option<&MetricSpec> {
        self.metrics.iter().find(|m| m.dp_id == dp_id)
    }

    pub fn required_metrics(&self) -> impl Iterator<Item = &MetricSpec> {
        self.metrics.iter().filter(|m| m.required)
    }
}

impl Default for SensorProfile {
    fn default() -> Self {
        Self::sgs01()
    }
}
