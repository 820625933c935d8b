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

//! Prometheus metrics exporter for WS90 weather stations
//!
//! ## Features
//!
//! `ws90_exporter` reads transmissions from Fine Offset WS90 (sold as Ecowitt WS90 and
//! many other brands) weather stations decoded by [rtl_433] and emits them as Prometheus
//! metrics. rtl_433 is run as a child process, or its JSON output can be read from a TCP
//! connection. The following metrics are emitted by default when available, each with an
//! `id` label set to the decimal device ID.
//!
//! * `ws90_temperature_celsius` - Temperature, in degrees celsius.
//! * `ws90_humidity_ratio` - Relative humidity (0-100).
//! * `ws90_battery_ratio` - Battery level (0-1).
//! * `ws90_battery_volts` - Battery voltage.
//! * `ws90_supercap_volts` - Supercapacitor voltage.
//! * `ws90_wind_dir_degrees` - Wind direction, in degrees.
//! * `ws90_wind_avg_speed` - Average wind speed, in meters per second.
//! * `ws90_wind_gust_speed` - Wind gust speed, in meters per second.
//! * `ws90_uvi` - UV index.
//! * `ws90_light_lux` - Light, in lux.
//! * `ws90_rain_m` - Rain counter as reported by the device, in meters.
//! * `ws90_rain_meters_total` - Rain since the exporter started, in meters. Never decreases,
//!   even when the device resets its counter.
//! * `ws90_rain_start` - Rain start indicator.
//! * `ws90_signal_rssi_db`, `ws90_signal_snr_db`, `ws90_signal_noise_db` - Signal levels, only
//!   when rtl_433 is run with `-M level`.
//! * `ws90_model_info{id=$ID, model=$MODEL, firmware=$FIRMWARE}` - Device metadata.
//!
//! Values outside of their valid range (humidity above 100 for example) are dropped. Metrics
//! about the exporter itself use the prefix `ws90_exporter_`.
//!
//! [rtl_433]: https://github.com/merbanan/rtl_433
//!
//! ## Build
//!
//! `ws90_exporter` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! git clone git@github.com:56quarters/ws90_exporter.git && cd ws90_exporter
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Picking a device
//!
//! By default, readings from every WS90 that rtl_433 picks up are exported. If your
//! neighbors have one too, pass the ID of yours (decimal or `0x` hex) one or more times.
//!
//! ```text
//! ./ws90_exporter --id 0x3741
//! ```
//!
//! ### Decoder
//!
//! The default command is `rtl_433 -Y minmax -f 868.3M -F json`. Use `--cmd` to change it
//! (e.g. `915M` in North America) or `--connect HOST:PORT` to read rtl_433 JSON output
//! from a TCP connection instead. If the decoder exits or the connection is lost, it is
//! restarted with an exponential backoff.
//!
//! ### Metric mapping
//!
//! Which fields become which metrics can be changed with a JSON5 file passed via
//! `--metrics-config`.
//!
//! ```json5
//! {
//!   model: "Fineoffset-WS90",
//!   metrics: [
//!     { field: "temperature_C", name: "ws90_temperature_celsius", help: "Temperature in celsius", min: -40, max: 60 },
//!     { field: "rain_mm", name: "ws90_rain_meters", help: "Rain in meters", kind: "counter", scale: 0.001 },
//!   ],
//! }
//! ```
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `8000` at `/metrics`. Devices that haven't been
//! heard from in `--clear-secs` (120 by default) are removed. Readings can also be pushed to
//! VictoriaMetrics as they arrive by passing its URL with `--vm-url`.
//!
//! ```yaml
//! scrape_configs:
//! - job_name: ws90_exporter
//!   static_configs:
//!   - targets: ['example:8000']
//! ```
//!

pub mod backoff;
pub mod config;
pub mod http;
pub mod ingest;
pub mod lines;
pub mod metrics;
pub mod normalize;
pub mod reading;
pub mod registry;
pub mod victoria;
