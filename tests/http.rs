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

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request, StatusCode};
use std::sync::Arc;
use tower::ServiceExt;
use ws90_exporter::config::MetricsConfig;
use ws90_exporter::http::{text_metrics, RequestContext};
use ws90_exporter::metrics::ExporterMetrics;
use ws90_exporter::normalize::Normalizer;
use ws90_exporter::reading::{DeviceId, Reading};
use ws90_exporter::registry::MetricsRegistry;

const WS90_LINE: &str = r#"{"time" : "2023-06-13 19:31:51", "model" : "Fineoffset-WS90", "id" : 14145, "battery_ok" : 0.73, "battery_mV" : 2580, "temperature_C" : 21.4, "humidity" : 61, "wind_dir_deg" : 268, "wind_avg_m_s" : 1.2, "wind_max_m_s" : 2.4, "uvi" : 3.1, "light_lux" : 41270.0, "flags" : 130, "rain_mm" : 29.4, "rain_start" : 0, "supercap_V" : 5.4, "firmware" : 126, "data" : "3fff000000------0000ff7ff70000", "mic" : "CRC"}"#;

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
}

async fn body_string(res: axum::response::Response) -> String {
    let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_metrics_empty_registry() {
    let context = Arc::new(RequestContext::new(
        Arc::new(MetricsRegistry::new()),
        ExporterMetrics::new(),
    ));

    let res = text_metrics(context)
        .oneshot(request(Method::GET, "/metrics"))
        .await
        .unwrap();

    assert_eq!(StatusCode::OK, res.status());
    assert_eq!(
        "application/openmetrics-text; version=1.0.0; charset=utf-8",
        res.headers()[CONTENT_TYPE].to_str().unwrap()
    );

    let body = body_string(res).await;
    assert!(body.contains("ws90_exporter_records_total 0"));
    assert!(!body.contains("ws90_temperature_celsius"));
    assert!(body.ends_with("# EOF\n"));
}

#[tokio::test]
async fn test_metrics_after_reading() {
    let registry = Arc::new(MetricsRegistry::new());
    let normalizer = Normalizer::new(MetricsConfig::default(), vec![DeviceId(0x3741)]);
    let reading = Reading::from_line(WS90_LINE).unwrap();
    registry.update_reading(&normalizer.normalize(&reading).unwrap());

    let context = Arc::new(RequestContext::new(registry, ExporterMetrics::new()));
    let res = text_metrics(context)
        .oneshot(request(Method::GET, "/metrics"))
        .await
        .unwrap();

    assert_eq!(StatusCode::OK, res.status());

    let body = body_string(res).await;
    assert!(body.contains(r#"ws90_temperature_celsius{id="14145"} 21.4"#));
    assert!(body.contains(r#"ws90_humidity_ratio{id="14145"} 61.0"#));
    assert!(body.contains(r#"ws90_wind_gust_speed{id="14145"} 2.4"#));
    assert!(body.contains("# TYPE ws90_rain_meters counter"));
    assert!(body.contains(r#"ws90_model_info{id="14145",model="Fineoffset-WS90",firmware="126"} 1"#));
    assert!(body.contains("ws90_exporter_devices 1"));
    assert!(!body.contains("ws90_signal_rssi_db"));
}

#[tokio::test]
async fn test_metrics_method_not_allowed() {
    let context = Arc::new(RequestContext::new(
        Arc::new(MetricsRegistry::new()),
        ExporterMetrics::new(),
    ));

    let res = text_metrics(context)
        .oneshot(request(Method::POST, "/metrics"))
        .await
        .unwrap();

    assert_eq!(StatusCode::METHOD_NOT_ALLOWED, res.status());
}

#[tokio::test]
async fn test_unknown_path() {
    let context = Arc::new(RequestContext::new(
        Arc::new(MetricsRegistry::new()),
        ExporterMetrics::new(),
    ));

    let res = text_metrics(context)
        .oneshot(request(Method::GET, "/"))
        .await
        .unwrap();

    assert_eq!(StatusCode::NOT_FOUND, res.status());
}
