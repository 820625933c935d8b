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

use clap::{Parser, ValueEnum};
use reqwest::Client;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use ws90_exporter::backoff::Backoff;
use ws90_exporter::config::MetricsConfig;
use ws90_exporter::http::RequestContext;
use ws90_exporter::ingest::{Ingester, Source};
use ws90_exporter::metrics::ExporterMetrics;
use ws90_exporter::normalize::Normalizer;
use ws90_exporter::reading::DeviceId;
use ws90_exporter::registry::{self, MetricsRegistry};
use ws90_exporter::victoria::{self, VictoriaMetricsClient};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8000);
const DEFAULT_CMD: &str = "rtl_433 -Y minmax -f 868.3M -F json";
const DEFAULT_CLEAR_SECS: u64 = 120;
const DEFAULT_TIMEOUT_MILLIS: u64 = 5000;
const DEFAULT_BACKOFF_INITIAL_MILLIS: u64 = 1000;
const DEFAULT_BACKOFF_MAX_MILLIS: u64 = 60_000;
const PUBLISH_QUEUE_SIZE: usize = 128;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogTarget {
    Stderr,
    Journald,
}

#[derive(Debug, Parser)]
#[clap(name = "ws90_exporter", version = clap::crate_version!())]
struct Ws90ExporterApplication {
    /// ID of a WS90 to export metrics for, in decimal or hex prefixed with '0x'. May
    /// be given multiple times. By default, all WS90 devices received are exported.
    #[clap(long)]
    id: Vec<DeviceId>,

    /// rtl_433 command to run, split on whitespace. Must output JSON records on stdout.
    #[clap(long, default_value_t = DEFAULT_CMD.into())]
    cmd: String,

    /// Read rtl_433 JSON records from a TCP connection to this HOST:PORT instead
    /// of running a command.
    #[clap(long, conflicts_with = "cmd")]
    connect: Option<String>,

    /// Remove metrics for devices not heard from in this many seconds. 0 disables
    /// removing devices.
    #[clap(long, default_value_t = DEFAULT_CLEAR_SECS)]
    clear_secs: u64,

    /// JSON5 file describing which record fields to export as which metrics. Uses
    /// the built-in WS90 mapping when not set.
    #[clap(long)]
    metrics_config: Option<PathBuf>,

    /// Base URL of a VictoriaMetrics server to push each reading to, e.g.
    /// 'http://localhost:8428/'. Readings are not pushed when not set.
    #[clap(long)]
    vm_url: Option<String>,

    /// Timeout for pushing readings to VictoriaMetrics, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Initial delay before restarting the decoder after it exits, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_BACKOFF_INITIAL_MILLIS)]
    backoff_initial_millis: u64,

    /// Maximum delay before restarting the decoder after it exits, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_BACKOFF_MAX_MILLIS)]
    backoff_max_millis: u64,

    /// Where to write logs.
    #[clap(long, value_enum, default_value_t = LogTarget::Stderr)]
    log: LogTarget,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, ws90_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = Ws90ExporterApplication::parse();
    match opts.log {
        LogTarget::Stderr => tracing::subscriber::set_global_default(
            tracing_subscriber::FmtSubscriber::builder()
                .with_writer(io::stderr)
                .with_max_level(opts.log_level)
                .finish(),
        )
        .expect("failed to set tracing subscriber"),
        LogTarget::Journald => {
            let journald = tracing_journald::layer().unwrap_or_else(|e| {
                eprintln!("ws90_exporter: unable to connect to journald: {}", e);
                process::exit(1)
            });

            tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(journald)
                    .with(LevelFilter::from_level(opts.log_level)),
            )
            .expect("failed to set tracing subscriber")
        }
    }

    let config = match &opts.metrics_config {
        Some(path) => MetricsConfig::load_from_file(path).unwrap_or_else(|e| {
            tracing::error!(message = "unable to load metrics config", path = %path.display(), error = %e);
            process::exit(1)
        }),
        None => MetricsConfig::default(),
    };

    let source = match &opts.connect {
        Some(addr) => Source::Tcp(addr.clone()),
        None => Source::command(&opts.cmd).unwrap_or_else(|e| {
            tracing::error!(message = "invalid decoder command", cmd = %opts.cmd, error = %e);
            process::exit(1)
        }),
    };

    let registry = Arc::new(MetricsRegistry::new());
    let metrics = ExporterMetrics::new();
    let token = CancellationToken::new();
    let backoff = Backoff::new(
        Duration::from_millis(opts.backoff_initial_millis),
        Duration::from_millis(opts.backoff_max_millis),
    );

    let mut ingester = Ingester::new(
        source,
        Normalizer::new(config, opts.id.iter().copied()),
        Arc::clone(&registry),
        metrics.clone(),
        backoff,
    );

    let mut tasks = Vec::new();

    if let Some(vm_url) = &opts.vm_url {
        let timeout = Duration::from_millis(opts.timeout_millis);
        let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize HTTP client", error = %e);
            process::exit(1)
        });

        let client = VictoriaMetricsClient::new(http_client, vm_url).unwrap_or_else(|e| {
            tracing::error!(message = "invalid VictoriaMetrics URL", url = %vm_url, error = %e);
            process::exit(1)
        });

        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_SIZE);
        ingester = ingester.with_publisher(tx);
        tasks.push(tokio::spawn(victoria::run_publisher(
            client,
            rx,
            metrics.clone(),
            token.clone(),
        )));
    }

    if opts.clear_secs > 0 {
        tasks.push(tokio::spawn(registry::run_expiry(
            Arc::clone(&registry),
            metrics.clone(),
            Duration::from_secs(opts.clear_secs),
            token.clone(),
        )));
    }

    tasks.push(tokio::spawn(ingester.run(token.clone())));

    let context = Arc::new(RequestContext::new(registry, metrics));
    let app = ws90_exporter::http::text_metrics(context);
    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "server started", address = %opts.bind);
    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");

    // Stop reading from the decoder and make sure it exits before we do
    token.cancel();
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
            tracing::warn!(message = "background task did not stop before timeout");
        }
    }

    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
