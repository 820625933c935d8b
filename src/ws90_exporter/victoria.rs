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
use crate::normalize::Normalized;
use crate::reading::DeviceId;
use chrono::{DateTime, Utc};
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode, Url};
use std::error;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum ClientError {
    Internal(reqwest::Error),
    InvalidUrl(String),
    Unexpected(StatusCode, Url),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::InvalidUrl(msg) => write!(f, "invalid URL: {}", msg),
            Self::Unexpected(status, url) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

/// One request body for the CSV import API along with the description of its columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvImport {
    pub format: String,
    pub line: String,
}

/// Columns for the timestamp and every sample value of a reading, or `None` if
/// the reading had no samples.
///
/// Counters are pushed with the `_total` suffix they are scraped with. Their
/// values are expected to be the exported totals, not the raw device values.
pub fn metric_rows(normalized: &Normalized, ts: DateTime<Utc>) -> Option<CsvImport> {
    if normalized.samples.is_empty() {
        return None;
    }

    let mut format = vec!["1:time:unix_s".to_owned()];
    let mut line = vec![ts.timestamp().to_string()];

    for (i, sample) in normalized.samples.iter().enumerate() {
        let name = match sample.kind {
            MetricKind::Counter => format!("{}_total", sample.name),
            MetricKind::Gauge => sample.name.clone(),
        };

        format.push(format!("{}:metric:{}", i + 2, name));
        line.push(sample.value.to_string());
    }

    Some(CsvImport {
        format: format.join(","),
        line: line.join(","),
    })
}

/// Columns for the model info metric of a reading with firmware and model as labels.
pub fn info_rows(normalized: &Normalized, ts: DateTime<Utc>) -> CsvImport {
    let format = [
        "1:time:unix_s".to_owned(),
        format!("2:metric:{}", normalized.info.metric),
        "3:label:firmware".to_owned(),
        "4:label:model".to_owned(),
    ];

    let line = [
        ts.timestamp().to_string(),
        "1".to_owned(),
        csv_field(&normalized.info.firmware),
        csv_field(&normalized.info.model),
    ];

    CsvImport {
        format: format.join(","),
        line: line.join(","),
    }
}

fn csv_field(val: &str) -> String {
    if val.contains([',', '"', '\n']) {
        format!("\"{}\"", val.replace('"', "\"\""))
    } else {
        val.to_owned()
    }
}

/// Client for pushing readings to the VictoriaMetrics CSV import API.
#[derive(Debug)]
pub struct VictoriaMetricsClient {
    client: Client,
    import_url: Url,
}

impl VictoriaMetricsClient {
    const USER_AGENT: &'static str = "ws90_exporter (https://github.com/56quarters/ws90_exporter)";
    const IMPORT_PATH: &'static str = "/api/v1/import/csv";

    pub fn new(client: Client, base_url: &str) -> Result<Self, ClientError> {
        let import_url = Url::parse(base_url)
            .and_then(|u| u.join(Self::IMPORT_PATH))
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        Ok(VictoriaMetricsClient { client, import_url })
    }

    /// Push sample values and model info of a reading, timestamped with the time
    /// from the record or the current time if it didn't have one.
    pub async fn import(&self, normalized: &Normalized) -> Result<(), ClientError> {
        let ts = normalized.timestamp.unwrap_or_else(Utc::now);
        if let Some(rows) = metric_rows(normalized, ts) {
            self.make_request(normalized.device, rows).await?;
        }

        self.make_request(normalized.device, info_rows(normalized, ts)).await
    }

    async fn make_request(&self, device: DeviceId, rows: CsvImport) -> Result<(), ClientError> {
        let extra_label = format!("id={}", device);
        let res = self
            .client
            .post(self.import_url.clone())
            .query(&[("format", rows.format.as_str()), ("extra_label", extra_label.as_str())])
            .header(USER_AGENT, Self::USER_AGENT)
            .body(rows.line)
            .send()
            .await
            .map_err(ClientError::Internal)?;

        let status = res.status();
        if status.is_success() {
            tracing::debug!(message = "pushed reading to VictoriaMetrics", device = %device, status = %status);
            Ok(())
        } else {
            Err(ClientError::Unexpected(status, self.import_url.clone()))
        }
    }
}

/// Push readings received on `rx` until cancelled or every sender is dropped.
pub async fn run_publisher(
    client: VictoriaMetricsClient,
    mut rx: mpsc::Receiver<Normalized>,
    metrics: ExporterMetrics,
    token: CancellationToken,
) {
    tracing::info!(message = "VictoriaMetrics publisher started", url = %client.import_url);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(normalized) => {
                    if let Err(e) = client.import(&normalized).await {
                        metrics.publish_errors.inc();
                        tracing::warn!(message = "failed to push reading to VictoriaMetrics", device = %normalized.device, error = %e);
                    }
                }
                None => break,
            },
        }
    }

    tracing::info!(message = "VictoriaMetrics publisher stopped");
}
