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

//! Mapping of rtl_433 record fields to exported metrics.
//!
//! The defaults export every WS90 sensor under a `ws90_` prefix. A JSON5 file
//! can replace them entirely:
//!
//! ```json5
//! {
//!   model: "Fineoffset-WS90",
//!   info_metric: "ws90_model_info",
//!   metrics: [
//!     { field: "temperature_C", name: "ws90_temperature_celsius", help: "Temperature in Celsius", min: -40, max: 60 },
//!     { field: "rain_mm", name: "ws90_rain_meters", help: "Total rain in meters", kind: "counter", scale: 0.001, min: 0 },
//!   ],
//! }
//! ```

use crate::metrics::EXPORTER_PREFIX;
use crate::reading::Field;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_MODEL: &str = "Fineoffset-WS90";
pub const DEFAULT_INFO_METRIC: &str = "ws90_model_info";

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(json5::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "unable to read config: {}", e),
            Self::Parse(e) => write!(f, "unable to parse config: {}", e),
            Self::Invalid(s) => write!(f, "invalid config: {}", s),
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauge => f.write_str("gauge"),
            Self::Counter => f.write_str("counter"),
        }
    }
}

/// How a single record field becomes a metric sample.
///
/// The exported value is `field * scale`. Values outside `[min, max]` are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub field: Field,
    pub name: String,
    pub help: String,
    #[serde(default)]
    pub kind: MetricKind,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

fn default_scale() -> f64 {
    1.0
}

impl MetricSpec {
    pub fn gauge(field: Field, name: &str, help: &str) -> Self {
        MetricSpec {
            field,
            name: name.to_owned(),
            help: help.to_owned(),
            kind: MetricKind::Gauge,
            scale: default_scale(),
            min: None,
            max: None,
        }
    }

    pub fn counter(field: Field, name: &str, help: &str) -> Self {
        MetricSpec {
            kind: MetricKind::Counter,
            ..Self::gauge(field, name, help)
        }
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Return true if the (already scaled) value is finite and within bounds.
    pub fn in_range(&self, value: f64) -> bool {
        value.is_finite() && self.min.map_or(true, |m| value >= m) && self.max.map_or(true, |m| value <= m)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// rtl_433 model name of records to export, other models are ignored.
    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the per-device gauge carrying model and firmware labels.
    #[serde(default = "default_info_metric")]
    pub info_metric: String,

    pub metrics: Vec<MetricSpec>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_owned()
}

fn default_info_metric() -> String {
    DEFAULT_INFO_METRIC.to_owned()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            model: default_model(),
            info_metric: default_info_metric(),
            metrics: vec![
                MetricSpec::gauge(Field::Temperature, "ws90_temperature_celsius", "Temperature in Celsius")
                    .range(Some(-40.0), Some(60.0)),
                MetricSpec::gauge(Field::Humidity, "ws90_humidity_ratio", "Humidity in percent")
                    .range(Some(0.0), Some(100.0)),
                MetricSpec::gauge(Field::BatteryOk, "ws90_battery_ratio", "Battery percent")
                    .range(Some(0.0), Some(1.0)),
                MetricSpec::gauge(Field::BatteryMillivolts, "ws90_battery_volts", "Battery voltage")
                    .scale(0.001)
                    .range(Some(0.0), None),
                MetricSpec::gauge(Field::SupercapVolts, "ws90_supercap_volts", "Supercap voltage")
                    .range(Some(0.0), None),
                MetricSpec::gauge(Field::WindDir, "ws90_wind_dir_degrees", "Wind direction in degrees")
                    .range(Some(0.0), Some(360.0)),
                MetricSpec::gauge(Field::WindAvg, "ws90_wind_avg_speed", "Wind speed in m/s")
                    .range(Some(0.0), None),
                MetricSpec::gauge(Field::WindMax, "ws90_wind_gust_speed", "Wind gust speed in m/s")
                    .range(Some(0.0), None),
                MetricSpec::gauge(Field::Uvi, "ws90_uvi", "UV index").range(Some(0.0), None),
                MetricSpec::gauge(Field::Light, "ws90_light_lux", "Light in lux").range(Some(0.0), None),
                MetricSpec::gauge(Field::Rain, "ws90_rain_m", "Total rain")
                    .scale(0.001)
                    .range(Some(0.0), None),
                MetricSpec::counter(Field::Rain, "ws90_rain_meters", "Total rain in meters, across device resets")
                    .scale(0.001)
                    .range(Some(0.0), None),
                MetricSpec::gauge(Field::RainStart, "ws90_rain_start", "Rain start info"),
                MetricSpec::gauge(Field::Rssi, "ws90_signal_rssi_db", "Received signal strength in dB"),
                MetricSpec::gauge(Field::Snr, "ws90_signal_snr_db", "Signal to noise ratio in dB"),
                MetricSpec::gauge(Field::Noise, "ws90_signal_noise_db", "Noise level in dB"),
            ],
        }
    }
}

impl MetricsConfig {
    /// Load and validate a mapping from a JSON5 file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        Self::from_json5(&content)
    }

    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".to_owned()));
        }

        if !is_valid_metric_name(&self.info_metric) {
            return Err(ConfigError::Invalid(format!(
                "invalid info metric name '{}'",
                self.info_metric
            )));
        }

        if self.metrics.is_empty() {
            return Err(ConfigError::Invalid("at least one metric must be configured".to_owned()));
        }

        let mut names = HashSet::new();
        claim_name(&mut names, &self.info_metric, MetricKind::Gauge)?;

        for spec in &self.metrics {
            if !is_valid_metric_name(&spec.name) {
                return Err(ConfigError::Invalid(format!("invalid metric name '{}'", spec.name)));
            }

            // The text encoder appends the suffix to counters itself
            if spec.kind == MetricKind::Counter && spec.name.ends_with("_total") {
                return Err(ConfigError::Invalid(format!(
                    "counter '{}' must not end with '_total'",
                    spec.name
                )));
            }

            claim_name(&mut names, &spec.name, spec.kind)?;

            if !spec.scale.is_finite() || spec.scale == 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "scale for '{}' must be finite and non-zero",
                    spec.name
                )));
            }

            if let (Some(min), Some(max)) = (spec.min, spec.max) {
                if min > max {
                    return Err(ConfigError::Invalid(format!(
                        "min {} is greater than max {} for '{}'",
                        min, max, spec.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Record every name a metric is exposed under, failing if another metric or
/// the exporter's own metrics already use one of them. Counters are exposed both
/// as the family name and with the "_total" suffix.
fn claim_name(names: &mut HashSet<String>, name: &str, kind: MetricKind) -> Result<(), ConfigError> {
    if name.starts_with(EXPORTER_PREFIX) {
        return Err(ConfigError::Invalid(format!(
            "metric name '{}' uses the reserved prefix '{}'",
            name, EXPORTER_PREFIX
        )));
    }

    let mut exposed = vec![name.to_owned()];
    if kind == MetricKind::Counter {
        exposed.push(format!("{}_total", name));
    }

    for n in exposed {
        if !names.insert(n.clone()) {
            return Err(ConfigError::Invalid(format!(
                "metric name '{}' conflicts with another metric exposed as '{}'",
                name, n
            )));
        }
    }

    Ok(())
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[cfg(test)]
mod test {
    use super::{is_valid_metric_name, MetricKind, MetricSpec, MetricsConfig};
    use crate::reading::Field;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = MetricsConfig::default();
        config.validate().unwrap();
        assert_eq!("Fineoffset-WS90", config.model);
        assert!(config
            .metrics
            .iter()
            .any(|m| m.field == Field::Rain && m.kind == MetricKind::Counter));
    }

    #[test]
    fn test_in_range() {
        let spec = MetricSpec::gauge(Field::Humidity, "h", "h").range(Some(0.0), Some(100.0));
        assert!(spec.in_range(0.0));
        assert!(spec.in_range(100.0));
        assert!(!spec.in_range(100.1));
        assert!(!spec.in_range(-0.5));
        assert!(!spec.in_range(f64::NAN));

        let unbounded = MetricSpec::gauge(Field::Rssi, "r", "r");
        assert!(unbounded.in_range(-12.5));
        assert!(!unbounded.in_range(f64::INFINITY));
    }

    #[test]
    fn test_from_json5() {
        let config = MetricsConfig::from_json5(
            r#"{
                // only the basics
                metrics: [
                    { field: "temperature_C", name: "weather_temp_c", help: "Temp", min: -50 },
                    { field: "rain_mm", name: "weather_rain_mm", help: "Rain", kind: "counter" },
                ],
            }"#,
        )
        .unwrap();

        assert_eq!("Fineoffset-WS90", config.model);
        assert_eq!("ws90_model_info", config.info_metric);
        assert_eq!(2, config.metrics.len());
        assert_eq!(Field::Temperature, config.metrics[0].field);
        assert_eq!(MetricKind::Gauge, config.metrics[0].kind);
        assert_eq!(1.0, config.metrics[0].scale);
        assert_eq!(Some(-50.0), config.metrics[0].min);
        assert_eq!(MetricKind::Counter, config.metrics[1].kind);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ model: "Fineoffset-WH51", metrics: [{{ field: "humidity", name: "soil_moisture", help: "Moisture" }}] }}"#
        )
        .unwrap();

        let config = MetricsConfig::load_from_file(file.path()).unwrap();
        assert_eq!("Fineoffset-WH51", config.model);
        assert_eq!("soil_moisture", config.metrics[0].name);
    }

    #[test]
    fn test_load_from_missing_file() {
        assert!(MetricsConfig::load_from_file("/nonexistent/ws90.json5").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let res = MetricsConfig::from_json5(r#"{ metrics: [{ field: "pressure_hPa", name: "p", help: "p" }] }"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_duplicate_names() {
        let res = MetricsConfig::from_json5(
            r#"{ metrics: [
                { field: "humidity", name: "dup", help: "a" },
                { field: "uvi", name: "dup", help: "b" },
            ] }"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_counter_collides_with_total_gauge() {
        let res = MetricsConfig::from_json5(
            r#"{ metrics: [
                { field: "rain_mm", name: "rain", help: "r", kind: "counter" },
                { field: "humidity", name: "rain_total", help: "h" },
            ] }"#,
        );
        assert!(res.is_err());

        let res = MetricsConfig::from_json5(
            r#"{ metrics: [
                { field: "humidity", name: "rain_total", help: "h" },
                { field: "rain_mm", name: "rain", help: "r", kind: "counter" },
            ] }"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_counter_collides_with_gauge_family() {
        let res = MetricsConfig::from_json5(
            r#"{ metrics: [
                { field: "rain_mm", name: "rain", help: "r", kind: "counter" },
                { field: "humidity", name: "rain", help: "h" },
            ] }"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_info_metric_collides_with_counter() {
        let res = MetricsConfig::from_json5(
            r#"{ info_metric: "rain_total", metrics: [{ field: "rain_mm", name: "rain", help: "r", kind: "counter" }] }"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_reserved_prefix() {
        let res = MetricsConfig::from_json5(
            r#"{ metrics: [{ field: "humidity", name: "ws90_exporter_devices", help: "h" }] }"#,
        );
        assert!(res.is_err());

        let res = MetricsConfig::from_json5(
            r#"{ info_metric: "ws90_exporter_info", metrics: [{ field: "humidity", name: "h", help: "h" }] }"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_counter_total_suffix() {
        let res = MetricsConfig::from_json5(
            r#"{ metrics: [{ field: "rain_mm", name: "rain_total", help: "r", kind: "counter" }] }"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_bad_range_and_scale() {
        let res = MetricsConfig::from_json5(r#"{ metrics: [{ field: "uvi", name: "u", help: "u", min: 5, max: 1 }] }"#);
        assert!(res.is_err());

        let res = MetricsConfig::from_json5(r#"{ metrics: [{ field: "uvi", name: "u", help: "u", scale: 0 }] }"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_empty_metrics() {
        assert!(MetricsConfig::from_json5(r#"{ metrics: [] }"#).is_err());
    }

    #[test]
    fn test_is_valid_metric_name() {
        assert!(is_valid_metric_name("ws90_temperature_celsius"));
        assert!(is_valid_metric_name("_private:thing"));
        assert!(!is_valid_metric_name(""));
        assert!(!is_valid_metric_name("9lives"));
        assert!(!is_valid_metric_name("ws90-temp"));
    }
}
