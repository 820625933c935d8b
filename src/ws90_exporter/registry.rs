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

use crate::config::MetricKind;
use crate::metrics::ExporterMetrics;
use crate::normalize::{MetricSample, ModelInfo, Normalized};
use crate::reading::DeviceId;
use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const INFO_HELP: &str = "Model information";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DeviceLabels {
    id: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ModelLabels {
    id: String,
    model: String,
    firmware: String,
}

/// What applying a sample did to the stored series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// Gauge overwritten or new series created.
    Set,
    /// Counter increased by the difference from the previous raw value.
    Accumulated,
    /// Counter raw value went backwards, the device restarted counting from zero.
    Reset,
    /// Sample kind didn't match the kind already registered under the name.
    Conflict,
}

#[derive(Debug, Clone, PartialEq)]
struct Descriptor {
    help: String,
    kind: MetricKind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Series {
    /// Exported value.
    value: f64,
    /// Last value reported by the device, used to compute counter increases.
    raw: f64,
}

#[derive(Debug, Default)]
struct State {
    descriptors: BTreeMap<String, Descriptor>,
    series: BTreeMap<(String, DeviceId), Series>,
    info: BTreeMap<DeviceId, ModelInfo>,
    last_seen: HashMap<DeviceId, Instant>,
}

impl State {
    fn apply(&mut self, sample: &MetricSample) -> Update {
        match self.descriptors.get(&sample.name) {
            Some(d) if d.kind != sample.kind => {
                tracing::warn!(
                    message = "ignoring sample with conflicting kind",
                    metric = %sample.name,
                    expected = %d.kind,
                    actual = %sample.kind,
                );
                return Update::Conflict;
            }
            Some(_) => {}
            None => {
                self.descriptors.insert(
                    sample.name.clone(),
                    Descriptor {
                        help: sample.help.clone(),
                        kind: sample.kind,
                    },
                );
            }
        }

        let key = (sample.name.clone(), sample.device);
        let existing = self.series.get_mut(&key);

        match (sample.kind, existing) {
            (MetricKind::Gauge, Some(series)) => {
                series.value = sample.value;
                series.raw = sample.value;
                Update::Set
            }
            (MetricKind::Counter, Some(series)) if sample.value >= series.raw => {
                series.value += sample.value - series.raw;
                series.raw = sample.value;
                Update::Accumulated
            }
            (MetricKind::Counter, Some(series)) => {
                tracing::warn!(
                    message = "counter reset detected",
                    metric = %sample.name,
                    device = %sample.device,
                    previous = series.raw,
                    current = sample.value,
                );

                series.value += sample.value.max(0.0);
                series.raw = sample.value;
                Update::Reset
            }
            (kind, None) => {
                let value = match kind {
                    MetricKind::Gauge => sample.value,
                    MetricKind::Counter => sample.value.max(0.0),
                };

                self.series.insert(
                    key,
                    Series {
                        value,
                        raw: sample.value,
                    },
                );
                Update::Set
            }
        }
    }

    fn remove_device(&mut self, device: DeviceId) {
        self.series.retain(|(_, d), _| *d != device);
        self.info.remove(&device);
        self.last_seen.remove(&device);
    }
}

/// Latest values for every (metric, device) pair.
///
/// All access goes through a single lock. Samples from one reading are applied
/// while holding it, so snapshots never contain part of a reading.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    state: RwLock<State>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a single sample, overwriting gauges and accumulating counters.
    pub fn update(&self, sample: MetricSample) -> Update {
        let mut state = self.state.write();
        state.last_seen.insert(sample.device, Instant::now());
        state.apply(&sample)
    }

    /// Store every sample and the model info of a reading, returning the number
    /// of counter resets that were detected.
    pub fn update_reading(&self, normalized: &Normalized) -> usize {
        let mut state = self.state.write();
        state.last_seen.insert(normalized.device, Instant::now());
        state.info.insert(normalized.device, normalized.info.clone());

        normalized
            .samples
            .iter()
            .map(|s| state.apply(s))
            .filter(|u| *u == Update::Reset)
            .count()
    }

    /// Remove every series of devices not updated within `max_age`, returning
    /// the number of devices removed.
    pub fn expire(&self, max_age: Duration) -> usize {
        self.expire_at(Instant::now(), max_age)
    }

    pub(crate) fn expire_at(&self, now: Instant, max_age: Duration) -> usize {
        let mut state = self.state.write();
        let stale: Vec<DeviceId> = state
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > max_age)
            .map(|(device, _)| *device)
            .collect();

        for device in &stale {
            tracing::debug!(message = "clearing metrics for device", device = %device);
            state.remove_device(*device);
        }

        stale.len()
    }

    /// Current exported value of a single series.
    pub fn value(&self, name: &str, device: DeviceId) -> Option<f64> {
        let state = self.state.read();
        state.series.get(&(name.to_owned(), device)).map(|s| s.value)
    }

    /// Point-in-time copy of all stored series.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let mut families: Vec<SnapshotFamily> = Vec::new();

        for ((name, device), series) in state.series.iter() {
            match families.last_mut() {
                Some(f) if &f.name == name => f.series.push((*device, series.value)),
                _ => {
                    // Descriptors are always written before the first series for a name
                    let (help, kind) = state
                        .descriptors
                        .get(name)
                        .map(|d| (d.help.clone(), d.kind))
                        .unwrap_or_default();

                    families.push(SnapshotFamily {
                        name: name.clone(),
                        help,
                        kind,
                        series: vec![(*device, series.value)],
                    });
                }
            }
        }

        let info = state.info.iter().map(|(d, i)| (*d, i.clone())).collect();
        Snapshot { families, info }
    }
}

/// Periodically remove devices that haven't been heard from within `max_age`
/// until cancelled. Checks run at half of `max_age`, at most once a second.
pub async fn run_expiry(
    registry: Arc<MetricsRegistry>,
    metrics: ExporterMetrics,
    max_age: Duration,
    token: CancellationToken,
) {
    let period = (max_age / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = registry.expire(max_age);
                if removed > 0 {
                    metrics.expired_devices.inc_by(removed as u64);
                    tracing::info!(message = "cleared metrics for devices not recently seen", devices = removed);
                }
            }
            _ = token.cancelled() => break,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub series: Vec<(DeviceId, f64)>,
}

/// Consistent view of the registry, used for rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    families: Vec<SnapshotFamily>,
    info: Vec<(DeviceId, ModelInfo)>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.families.is_empty() && self.info.is_empty()
    }

    pub fn families(&self) -> &[SnapshotFamily] {
        &self.families
    }

    pub fn value(&self, name: &str, device: DeviceId) -> Option<f64> {
        self.families
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.series.iter().find(|(d, _)| *d == device))
            .map(|(_, v)| *v)
    }

    pub fn info(&self, device: DeviceId) -> Option<&ModelInfo> {
        self.info.iter().find(|(d, _)| *d == device).map(|(_, i)| i)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .families
            .iter()
            .flat_map(|f| f.series.iter().map(|(d, _)| *d))
            .chain(self.info.iter().map(|(d, _)| *d))
            .collect();

        devices.sort();
        devices.dedup();
        devices
    }

    /// Register a metric family for every stored metric with the provided `Registry`.
    pub fn register(&self, reg: &mut Registry) {
        for family in &self.families {
            match family.kind {
                MetricKind::Gauge => {
                    let metric = Family::<DeviceLabels, Gauge<f64, AtomicU64>>::default();
                    for (device, value) in &family.series {
                        metric.get_or_create(&DeviceLabels { id: device.to_string() }).set(*value);
                    }
                    reg.register(family.name.clone(), family.help.clone(), metric);
                }
                MetricKind::Counter => {
                    let metric = Family::<DeviceLabels, Counter<f64, AtomicU64>>::default();
                    for (device, value) in &family.series {
                        metric.get_or_create(&DeviceLabels { id: device.to_string() }).inc_by(*value);
                    }
                    reg.register(family.name.clone(), family.help.clone(), metric);
                }
            }
        }

        let mut info: BTreeMap<&str, Family<ModelLabels, Gauge>> = BTreeMap::new();
        for (device, model) in &self.info {
            info.entry(model.metric.as_str())
                .or_default()
                .get_or_create(&ModelLabels {
                    id: device.to_string(),
                    model: model.model.clone(),
                    firmware: model.firmware.clone(),
                })
                .set(1);
        }

        for (name, metric) in info {
            reg.register(name, INFO_HELP, metric);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{run_expiry, MetricsRegistry, Update};
    use crate::config::MetricKind;
    use crate::metrics::ExporterMetrics;
    use crate::normalize::{MetricSample, ModelInfo, Normalized};
    use crate::reading::DeviceId;
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn sample(name: &str, kind: MetricKind, device: u64, value: f64) -> MetricSample {
        MetricSample {
            name: name.to_owned(),
            help: format!("{} help", name),
            kind,
            device: DeviceId(device),
            value,
        }
    }

    fn reading(device: u64, samples: Vec<MetricSample>) -> Normalized {
        Normalized {
            device: DeviceId(device),
            timestamp: None,
            info: ModelInfo {
                metric: "ws90_model_info".to_owned(),
                model: "Fineoffset-WS90".to_owned(),
                firmware: "126".to_owned(),
            },
            samples,
            rejected: vec![],
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let registry = MetricsRegistry::new();
        let snapshot = registry.snapshot();
        assert!(snapshot.is_empty());
        assert!(snapshot.devices().is_empty());
    }

    #[test]
    fn test_gauge_overwrites() {
        let registry = MetricsRegistry::new();
        assert_eq!(Update::Set, registry.update(sample("temp", MetricKind::Gauge, 1, 20.0)));
        assert_eq!(Update::Set, registry.update(sample("temp", MetricKind::Gauge, 1, 15.5)));
        assert_eq!(Update::Set, registry.update(sample("temp", MetricKind::Gauge, 2, 30.0)));

        let snapshot = registry.snapshot();
        assert_eq!(Some(15.5), snapshot.value("temp", DeviceId(1)));
        assert_eq!(Some(30.0), snapshot.value("temp", DeviceId(2)));
        assert_eq!(vec![DeviceId(1), DeviceId(2)], snapshot.devices());
    }

    #[test]
    fn test_counter_accumulates() {
        let registry = MetricsRegistry::new();
        registry.update(sample("rain", MetricKind::Counter, 1, 10.0));
        assert_eq!(Update::Accumulated, registry.update(sample("rain", MetricKind::Counter, 1, 12.5)));
        assert_eq!(Update::Accumulated, registry.update(sample("rain", MetricKind::Counter, 1, 12.5)));

        assert_eq!(Some(12.5), registry.snapshot().value("rain", DeviceId(1)));
    }

    #[test]
    fn test_counter_reset_never_decreases() {
        let registry = MetricsRegistry::new();
        registry.update(sample("rain", MetricKind::Counter, 1, 10.0));
        registry.update(sample("rain", MetricKind::Counter, 1, 14.0));
        let before = registry.snapshot().value("rain", DeviceId(1)).unwrap();

        // Device restarted and counts up from zero again
        assert_eq!(Update::Reset, registry.update(sample("rain", MetricKind::Counter, 1, 1.0)));
        let after_reset = registry.snapshot().value("rain", DeviceId(1)).unwrap();
        assert!(after_reset >= before);
        assert_eq!(15.0, after_reset);

        registry.update(sample("rain", MetricKind::Counter, 1, 3.0));
        assert_eq!(Some(17.0), registry.snapshot().value("rain", DeviceId(1)));
        assert_eq!(Some(17.0), registry.value("rain", DeviceId(1)));
        assert_eq!(None, registry.value("rain", DeviceId(2)));
    }

    #[test]
    fn test_counter_monotonic_for_arbitrary_sequence() {
        let registry = MetricsRegistry::new();
        let mut previous = 0.0;
        for raw in [5.0, 7.0, 7.0, 2.0, 0.0, 9.0, 8.5, 100.0, 3.0] {
            registry.update(sample("rain", MetricKind::Counter, 7, raw));
            let current = registry.snapshot().value("rain", DeviceId(7)).unwrap();
            assert!(current >= previous, "{} < {}", current, previous);
            previous = current;
        }
    }

    #[test]
    fn test_kind_conflict() {
        let registry = MetricsRegistry::new();
        registry.update(sample("rain", MetricKind::Counter, 1, 10.0));
        assert_eq!(Update::Conflict, registry.update(sample("rain", MetricKind::Gauge, 1, 1.0)));
        assert_eq!(Some(10.0), registry.snapshot().value("rain", DeviceId(1)));
    }

    #[test]
    fn test_update_reading_counts_resets() {
        let registry = MetricsRegistry::new();
        let first = reading(
            1,
            vec![
                sample("temp", MetricKind::Gauge, 1, 20.0),
                sample("rain", MetricKind::Counter, 1, 8.0),
            ],
        );
        assert_eq!(0, registry.update_reading(&first));

        let second = reading(
            1,
            vec![
                sample("temp", MetricKind::Gauge, 1, 21.0),
                sample("rain", MetricKind::Counter, 1, 0.5),
            ],
        );
        assert_eq!(1, registry.update_reading(&second));

        let snapshot = registry.snapshot();
        assert_eq!(Some(21.0), snapshot.value("temp", DeviceId(1)));
        assert_eq!(Some(8.5), snapshot.value("rain", DeviceId(1)));
        assert_eq!("126", snapshot.info(DeviceId(1)).unwrap().firmware);
    }

    #[test]
    fn test_expire() {
        let registry = MetricsRegistry::new();
        registry.update_reading(&reading(1, vec![sample("temp", MetricKind::Gauge, 1, 20.0)]));
        registry.update_reading(&reading(2, vec![sample("temp", MetricKind::Gauge, 2, 25.0)]));

        assert_eq!(0, registry.expire_at(Instant::now(), Duration::from_secs(120)));
        assert_eq!(2, registry.snapshot().devices().len());

        let later = Instant::now() + Duration::from_secs(300);
        assert_eq!(2, registry.expire_at(later, Duration::from_secs(120)));

        let snapshot = registry.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(None, snapshot.info(DeviceId(1)));
    }

    #[tokio::test]
    async fn test_run_expiry() {
        let registry = Arc::new(MetricsRegistry::new());
        let metrics = ExporterMetrics::new();
        let token = CancellationToken::new();
        registry.update_reading(&reading(1, vec![sample("temp", MetricKind::Gauge, 1, 20.0)]));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The first check happens right away
        let handle = tokio::spawn(run_expiry(
            Arc::clone(&registry),
            metrics.clone(),
            Duration::from_millis(5),
            token.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.expired_devices.get() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(registry.snapshot().is_empty());
        assert_eq!(1, metrics.expired_devices.get());

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_register_and_encode() {
        let registry = MetricsRegistry::new();
        registry.update_reading(&reading(
            14145,
            vec![
                sample("ws90_temperature_celsius", MetricKind::Gauge, 14145, 21.5),
                sample("ws90_rain_meters", MetricKind::Counter, 14145, 0.25),
            ],
        ));

        let mut reg = Registry::default();
        registry.snapshot().register(&mut reg);
        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert!(buf.contains("# TYPE ws90_temperature_celsius gauge"));
        assert!(buf.contains(r#"ws90_temperature_celsius{id="14145"} 21.5"#));
        assert!(buf.contains("# TYPE ws90_rain_meters counter"));
        assert!(buf.contains(r#"ws90_rain_meters_total{id="14145"} 0.25"#));
        assert!(buf.contains(r#"ws90_model_info{id="14145",model="Fineoffset-WS90",firmware="126"} 1"#));
        assert!(buf.ends_with("# EOF\n"));
    }

    #[test]
    fn test_concurrent_updates_never_torn() {
        let registry = Arc::new(MetricsRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..500 {
                        let v = (w * 1000 + i) as f64;
                        registry.update_reading(&reading(
                            1,
                            vec![
                                sample("a", MetricKind::Gauge, 1, v),
                                sample("b", MetricKind::Gauge, 1, v),
                                sample("c", MetricKind::Gauge, 1, v),
                            ],
                        ));
                    }
                })
            })
            .collect();

        for _ in 0..500 {
            let snapshot = registry.snapshot();
            let a = snapshot.value("a", DeviceId(1));
            assert_eq!(a, snapshot.value("b", DeviceId(1)));
            assert_eq!(a, snapshot.value("c", DeviceId(1)));
        }

        for w in writers {
            w.join().unwrap();
        }
    }
}
