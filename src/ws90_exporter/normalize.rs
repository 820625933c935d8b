// ws90_exporter - Prometheus metrics exporter for WS90 weather stations
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::config::{MetricKind, MetricsConfig};
use crate::reading::{DeviceId, Field, Reading};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;

const UNKNOWN_FIRMWARE: &str = "unknown";

/// A single value ready to be stored in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub device: DeviceId,
    pub value: f64,
}

/// Model and firmware of a device, exported as labels on a constant gauge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub metric: String,
    pub model: String,
    pub firmware: String,
}

/// A field value that was present in a reading but outside its valid range.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub field: Field,
    pub metric: String,
    pub value: f64,
}

/// Everything derived from one accepted reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub device: DeviceId,
    pub timestamp: Option<DateTime<Utc>>,
    pub info: ModelInfo,
    pub samples: Vec<MetricSample>,
    pub rejected: Vec<Rejected>,
}

/// Reason a reading produced no samples at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    OtherModel(Option<String>),
    MissingId,
    UnwatchedDevice(DeviceId),
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OtherModel(Some(m)) => write!(f, "model {} is not exported", m),
            Self::OtherModel(None) => write!(f, "record has no model"),
            Self::MissingId => write!(f, "record has no device ID"),
            Self::UnwatchedDevice(id) => write!(f, "device {} (0x{:x}) is not watched", id, id.0),
        }
    }
}

/// Turns readings into metric samples according to a `MetricsConfig`.
///
/// If `devices` is empty, readings from every device of the configured model
/// are accepted.
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: MetricsConfig,
    devices: HashSet<DeviceId>,
}

impl Normalizer {
    pub fn new(config: MetricsConfig, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        Normalizer {
            config,
            devices: devices.into_iter().collect(),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn normalize(&self, reading: &Reading) -> Result<Normalized, Skip> {
        match reading.model.as_deref() {
            Some(m) if m == self.config.model => {}
            other => return Err(Skip::OtherModel(other.map(String::from))),
        }

        let device = reading.id.ok_or(Skip::MissingId)?;
        if !self.devices.is_empty() && !self.devices.contains(&device) {
            return Err(Skip::UnwatchedDevice(device));
        }

        let mut samples = Vec::with_capacity(self.config.metrics.len());
        let mut rejected = Vec::new();

        for spec in &self.config.metrics {
            let raw = match reading.field(spec.field) {
                Some(v) => v,
                None => continue,
            };

            let value = raw * spec.scale;
            if spec.in_range(value) {
                samples.push(MetricSample {
                    name: spec.name.clone(),
                    help: spec.help.clone(),
                    kind: spec.kind,
                    device,
                    value,
                });
            } else {
                tracing::warn!(
                    message = "dropping out of range value",
                    device = %device,
                    field = %spec.field,
                    metric = %spec.name,
                    value = raw,
                    min = ?spec.min,
                    max = ?spec.max,
                );

                rejected.push(Rejected {
                    field: spec.field,
                    metric: spec.name.clone(),
                    value: raw,
                });
            }
        }

        Ok(Normalized {
            device,
            timestamp: reading.timestamp(),
            info: ModelInfo {
                metric: self.config.info_metric.clone(),
                model: self.config.model.clone(),
                firmware: reading
                    .firmware
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_FIRMWARE.to_owned()),
            },
            samples,
            rejected,
        })
    }
}
