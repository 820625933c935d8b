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

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Prefix of every metric about the exporter itself, not available for device metrics.
pub const EXPORTER_PREFIX: &str = "ws90_exporter_";

/// Holder for metrics about the exporter itself.
///
/// Metrics are cheap handles to shared atomics so clones of this struct all update
/// the same values. All metrics share the prefix "ws90_exporter_". Counter names
/// get a "_total" suffix when encoded.
#[derive(Debug, Clone, Default)]
pub struct ExporterMetrics {
    pub records: Counter,
    pub parse_errors: Counter,
    pub skipped: Counter,
    pub readings: Counter,
    pub out_of_range: Counter,
    pub counter_resets: Counter,
    pub decoder_restarts: Counter,
    pub expired_devices: Counter,
    pub publish_errors: Counter,
    pub publish_dropped: Counter,
    pub devices: Gauge,
}

impl ExporterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register each metric with the provided `Registry`.
    pub fn register(&self, reg: &mut Registry) {
        reg.register(
            "ws90_exporter_records",
            "Lines received from the decoder",
            self.records.clone(),
        );
        reg.register(
            "ws90_exporter_parse_errors",
            "Lines from the decoder that could not be parsed",
            self.parse_errors.clone(),
        );
        reg.register(
            "ws90_exporter_skipped",
            "Records ignored because of their model or device ID",
            self.skipped.clone(),
        );
        reg.register(
            "ws90_exporter_readings",
            "Readings accepted from watched devices",
            self.readings.clone(),
        );
        reg.register(
            "ws90_exporter_out_of_range",
            "Values dropped for being outside their valid range",
            self.out_of_range.clone(),
        );
        reg.register(
            "ws90_exporter_counter_resets",
            "Counter resets detected on devices",
            self.counter_resets.clone(),
        );
        reg.register(
            "ws90_exporter_decoder_restarts",
            "Times the connection to the decoder was restarted",
            self.decoder_restarts.clone(),
        );
        reg.register(
            "ws90_exporter_expired_devices",
            "Devices whose metrics were cleared after not being heard from",
            self.expired_devices.clone(),
        );
        reg.register(
            "ws90_exporter_publish_errors",
            "Failed pushes of readings to VictoriaMetrics",
            self.publish_errors.clone(),
        );
        reg.register(
            "ws90_exporter_publish_dropped",
            "Readings not pushed to VictoriaMetrics because the queue was full",
            self.publish_dropped.clone(),
        );
        reg.register(
            "ws90_exporter_devices",
            "Devices with metrics currently exported",
            self.devices.clone(),
        );
    }
}

#[cfg(test)]
mod test {
    use super::ExporterMetrics;
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;

    #[test]
    fn test_clones_share_values() {
        let metrics = ExporterMetrics::new();
        let other = metrics.clone();
        other.records.inc();
        other.records.inc();

        assert_eq!(2, metrics.records.get());
    }

    #[test]
    fn test_register() {
        let metrics = ExporterMetrics::new();
        metrics.parse_errors.inc();
        metrics.devices.set(3);

        let mut reg = Registry::default();
        metrics.register(&mut reg);
        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert!(buf.contains("ws90_exporter_parse_errors_total 1"));
        assert!(buf.contains("ws90_exporter_records_total 0"));
        assert!(buf.contains("ws90_exporter_devices 3"));
    }
}
