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

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::error;
use std::fmt;
use std::str::FromStr;

const RTL_433_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug)]
pub enum ReadingError {
    Malformed(serde_json::Error),
    InvalidDeviceId(String),
}

impl fmt::Display for ReadingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed record: {}", e),
            Self::InvalidDeviceId(s) => write!(f, "invalid device ID {}", s),
        }
    }
}

impl error::Error for ReadingError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

/// Identifier transmitted by a station, rendered as decimal in labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl FromStr for DeviceId {
    type Err = ReadingError;

    /// Parse a device ID in decimal or, when prefixed with `0x`, hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };

        parsed
            .map(DeviceId)
            .map_err(|_| ReadingError::InvalidDeviceId(s.to_owned()))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric fields of an rtl_433 record that can be mapped to metrics.
///
/// The serialized names are the keys rtl_433 uses in its JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "temperature_C")]
    Temperature,
    #[serde(rename = "humidity")]
    Humidity,
    #[serde(rename = "wind_avg_m_s")]
    WindAvg,
    #[serde(rename = "wind_max_m_s")]
    WindMax,
    #[serde(rename = "wind_dir_deg")]
    WindDir,
    #[serde(rename = "rain_mm")]
    Rain,
    #[serde(rename = "rain_start")]
    RainStart,
    #[serde(rename = "battery_ok")]
    BatteryOk,
    #[serde(rename = "battery_mV")]
    BatteryMillivolts,
    #[serde(rename = "supercap_V")]
    SupercapVolts,
    #[serde(rename = "uvi")]
    Uvi,
    #[serde(rename = "light_lux")]
    Light,
    #[serde(rename = "rssi")]
    Rssi,
    #[serde(rename = "snr")]
    Snr,
    #[serde(rename = "noise")]
    Noise,
}

impl Field {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature_C",
            Self::Humidity => "humidity",
            Self::WindAvg => "wind_avg_m_s",
            Self::WindMax => "wind_max_m_s",
            Self::WindDir => "wind_dir_deg",
            Self::Rain => "rain_mm",
            Self::RainStart => "rain_start",
            Self::BatteryOk => "battery_ok",
            Self::BatteryMillivolts => "battery_mV",
            Self::SupercapVolts => "supercap_V",
            Self::Uvi => "uvi",
            Self::Light => "light_lux",
            Self::Rssi => "rssi",
            Self::Snr => "snr",
            Self::Noise => "noise",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Time of a record as emitted by rtl_433, which depends on its `-M time` setting.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RecordTime {
    Unix(f64),
    Text(String),
}

/// One decoded transmission from rtl_433.
///
/// Every sensor field is optional since rtl_433 omits fields a decoder doesn't
/// produce (signal levels only appear with `-M level`, for example).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reading {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "device_id")]
    pub id: Option<DeviceId>,
    #[serde(default)]
    pub time: Option<RecordTime>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub firmware: Option<String>,
    #[serde(default, rename = "temperature_C")]
    pub temperature_c: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub wind_avg_m_s: Option<f64>,
    #[serde(default)]
    pub wind_max_m_s: Option<f64>,
    #[serde(default)]
    pub wind_dir_deg: Option<f64>,
    #[serde(default)]
    pub rain_mm: Option<f64>,
    #[serde(default)]
    pub rain_start: Option<f64>,
    #[serde(default)]
    pub battery_ok: Option<f64>,
    #[serde(default, rename = "battery_mV")]
    pub battery_mv: Option<f64>,
    #[serde(default, rename = "supercap_V")]
    pub supercap_v: Option<f64>,
    #[serde(default)]
    pub uvi: Option<f64>,
    #[serde(default)]
    pub light_lux: Option<f64>,
    #[serde(default)]
    pub rssi: Option<f64>,
    #[serde(default)]
    pub snr: Option<f64>,
    #[serde(default)]
    pub noise: Option<f64>,
}

impl Reading {
    /// Parse a single line of `rtl_433 -F json` output.
    pub fn from_line(line: &str) -> Result<Self, ReadingError> {
        serde_json::from_str(line).map_err(ReadingError::Malformed)
    }

    pub fn field(&self, field: Field) -> Option<f64> {
        match field {
            Field::Temperature => self.temperature_c,
            Field::Humidity => self.humidity,
            Field::WindAvg => self.wind_avg_m_s,
            Field::WindMax => self.wind_max_m_s,
            Field::WindDir => self.wind_dir_deg,
            Field::Rain => self.rain_mm,
            Field::RainStart => self.rain_start,
            Field::BatteryOk => self.battery_ok,
            Field::BatteryMillivolts => self.battery_mv,
            Field::SupercapVolts => self.supercap_v,
            Field::Uvi => self.uvi,
            Field::Light => self.light_lux,
            Field::Rssi => self.rssi,
            Field::Snr => self.snr,
            Field::Noise => self.noise,
        }
    }

    /// Time the record was decoded, if rtl_433 included one that could be understood.
    ///
    /// The default rtl_433 format has no zone and is interpreted as local time.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.time.as_ref()? {
            RecordTime::Unix(secs) => {
                if !secs.is_finite() {
                    return None;
                }

                let whole = secs.trunc() as i64;
                let nanos = (secs.fract() * 1e9) as u32;
                Utc.timestamp_opt(whole, nanos).single()
            }
            RecordTime::Text(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Some(dt.with_timezone(&Utc));
                }

                let naive = NaiveDateTime::parse_from_str(s, RTL_433_TIME_FORMAT).ok()?;
                Local
                    .from_local_datetime(&naive)
                    .earliest()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

fn text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

// Some rtl_433 decoders emit string IDs. Those are parsed when possible and
// otherwise treated as missing rather than failing the whole record.
fn device_id<'de, D>(deserializer: D) -> Result<Option<DeviceId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => n.as_u64().map(DeviceId),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}
