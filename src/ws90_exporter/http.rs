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

use crate::metrics::ExporterMetrics;
use crate::registry::MetricsRegistry;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::fmt;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const OPEN_METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Global state shared between all HTTP requests via `Arc`.
#[derive(Debug)]
pub struct RequestContext {
    registry: Arc<MetricsRegistry>,
    metrics: ExporterMetrics,
}

impl RequestContext {
    pub fn new(registry: Arc<MetricsRegistry>, metrics: ExporterMetrics) -> Self {
        RequestContext { registry, metrics }
    }

    /// Encode a consistent snapshot of every device metric along with metrics
    /// about the exporter itself in the OpenMetrics text format.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let snapshot = self.registry.snapshot();
        self.metrics.devices.set(snapshot.devices().len() as i64);

        let mut reg = Registry::default();
        self.metrics.register(&mut reg);
        snapshot.register(&mut reg);

        let mut buf = String::new();
        encode(&mut buf, &reg)?;
        Ok(buf)
    }
}

/// Create an axum router that serves metrics in the OpenMetrics text format on `/metrics`.
///
/// Other methods for `/metrics` get a 405 response and other paths a 404.
pub fn text_metrics(context: Arc<RequestContext>) -> Router {
    Router::new()
        .route("/metrics", get(text_metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn text_metrics_handler(State(context): State<Arc<RequestContext>>) -> Response {
    match context.render() {
        Ok(buf) => {
            tracing::debug!(message = "encoded metrics to text format", num_bytes = buf.len());
            (StatusCode::OK, [(CONTENT_TYPE, OPEN_METRICS_CONTENT_TYPE)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
