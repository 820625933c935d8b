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

use crate::backoff::Backoff;
use crate::config::MetricKind;
use crate::lines::{Line, LineReader};
use crate::metrics::ExporterMetrics;
use crate::normalize::{Normalized, Normalizer, Skip};
use crate::reading::Reading;
use crate::registry::MetricsRegistry;
use std::error;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum IngestError {
    EmptyCommand,
    Spawn(io::Error),
    Connect(io::Error),
    MissingPipe,
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyCommand => write!(f, "decoder command is empty"),
            Self::Spawn(e) => write!(f, "unable to start decoder: {}", e),
            Self::Connect(e) => write!(f, "unable to connect to decoder: {}", e),
            Self::MissingPipe => write!(f, "decoder output was not captured"),
        }
    }
}

impl error::Error for IngestError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            Self::Connect(e) => Some(e),
            _ => None,
        }
    }
}

/// Where newline delimited rtl_433 JSON records come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Run the decoder as a child process and read its stdout.
    Command(Vec<String>),
    /// Read from a TCP connection, e.g. a socat or netcat relay of rtl_433 output.
    Tcp(String),
}

impl Source {
    /// Split a decoder command line on whitespace.
    pub fn command(cmd: &str) -> Result<Self, IngestError> {
        let argv: Vec<String> = cmd.split_whitespace().map(String::from).collect();
        if argv.is_empty() {
            return Err(IngestError::EmptyCommand);
        }

        Ok(Source::Command(argv))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(argv) => write!(f, "{}", argv.join(" ")),
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Cancelled,
    Ended,
}

#[derive(Debug, Clone, Copy)]
struct Session {
    outcome: Outcome,
    lines: u64,
}

impl Session {
    fn cancelled(lines: u64) -> Self {
        Session {
            outcome: Outcome::Cancelled,
            lines,
        }
    }

    fn ended(lines: u64) -> Self {
        Session {
            outcome: Outcome::Ended,
            lines,
        }
    }
}

/// Reads records from the decoder and stores them in the registry until cancelled.
///
/// When the decoder exits or the connection drops, a new one is started after a
/// backoff delay. The backoff is reset after any connection that delivered data.
pub struct Ingester {
    source: Source,
    normalizer: Normalizer,
    registry: Arc<MetricsRegistry>,
    metrics: ExporterMetrics,
    backoff: Backoff,
    publisher: Option<mpsc::Sender<Normalized>>,
    shutdown_grace: Duration,
}

impl Ingester {
    pub fn new(
        source: Source,
        normalizer: Normalizer,
        registry: Arc<MetricsRegistry>,
        metrics: ExporterMetrics,
        backoff: Backoff,
    ) -> Self {
        Ingester {
            source,
            normalizer,
            registry,
            metrics,
            backoff,
            publisher: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Also hand every accepted reading to a publisher. Readings are dropped
    /// instead of waiting when the channel is full.
    pub fn with_publisher(mut self, publisher: mpsc::Sender<Normalized>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// How long a decoder process gets to exit after SIGTERM before it is killed.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(message = "decoder ingest started", source = %self.source);

        loop {
            let res = match &self.source {
                Source::Command(argv) => self.read_command(argv, &token).await,
                Source::Tcp(addr) => self.read_tcp(addr, &token).await,
            };

            match res {
                Ok(Session {
                    outcome: Outcome::Cancelled,
                    ..
                }) => break,
                Ok(Session { lines, .. }) => {
                    if lines > 0 {
                        self.backoff.reset();
                    }

                    tracing::warn!(message = "decoder output ended", source = %self.source, lines = lines);
                }
                Err(e) => {
                    tracing::error!(message = "decoder unavailable", source = %self.source, error = %e);
                }
            }

            self.metrics.decoder_restarts.inc();
            let delay = self.backoff.next_delay();
            tracing::info!(message = "restarting decoder after delay", delay_ms = delay.as_millis() as u64);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => break,
            }
        }

        tracing::info!(message = "decoder ingest stopped");
    }

    async fn read_command(&self, argv: &[String], token: &CancellationToken) -> Result<Session, IngestError> {
        let (program, args) = argv.split_first().ok_or(IngestError::EmptyCommand)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(IngestError::Spawn)?;

        let stdout = child.stdout.take().ok_or(IngestError::MissingPipe)?;
        let stderr = child.stderr.take().ok_or(IngestError::MissingPipe)?;
        let mut out = LineReader::new(stdout);
        let mut err = LineReader::new(stderr);
        let mut err_open = true;
        let mut lines = 0;

        tracing::debug!(message = "decoder started", program = %program, pid = ?child.id());

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    terminate(&mut child, self.shutdown_grace).await;
                    return Ok(Session::cancelled(lines));
                }
                line = out.next_line() => match line {
                    Ok(Some(l)) => {
                        if self.handle_output(l) {
                            lines += 1;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // The decoder may still be running, don't wait for it to exit on its own
                        tracing::error!(message = "error reading decoder output", error = %e);
                        terminate(&mut child, self.shutdown_grace).await;
                        return Ok(Session::ended(lines));
                    }
                },
                line = err.next_line(), if err_open => match line {
                    Ok(Some(Line::Text(l))) | Ok(Some(Line::InvalidUtf8(l))) => {
                        let l = l.trim();
                        if !l.is_empty() {
                            tracing::warn!(message = "decoder stderr", program = %program, line = %l);
                        }
                    }
                    Ok(Some(Line::TooLong(n))) => {
                        tracing::warn!(message = "decoder stderr line too long", program = %program, bytes = n);
                    }
                    _ => err_open = false,
                },
            }
        }

        tokio::select! {
            status = child.wait() => match status {
                Ok(s) => tracing::warn!(message = "decoder exited", status = %s),
                Err(e) => tracing::error!(message = "unable to get decoder exit status", error = %e),
            },
            _ = token.cancelled() => {
                terminate(&mut child, self.shutdown_grace).await;
                return Ok(Session::cancelled(lines));
            }
        }

        Ok(Session::ended(lines))
    }

    async fn read_tcp(&self, addr: &str, token: &CancellationToken) -> Result<Session, IngestError> {
        let stream = tokio::select! {
            res = TcpStream::connect(addr) => res.map_err(IngestError::Connect)?,
            _ = token.cancelled() => return Ok(Session::cancelled(0)),
        };

        tracing::debug!(message = "connected to decoder", address = %addr);
        let mut reader = LineReader::new(stream);
        let mut lines = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(Session::cancelled(lines)),
                line = reader.next_line() => match line {
                    Ok(Some(l)) => {
                        if self.handle_output(l) {
                            lines += 1;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(message = "error reading from decoder connection", address = %addr, error = %e);
                        break;
                    }
                },
            }
        }

        Ok(Session::ended(lines))
    }

    /// Handle a line of decoder output. Lines that can't be records are counted as
    /// parse errors. Returns false for blank lines.
    fn handle_output(&self, line: Line) -> bool {
        match line {
            Line::Text(l) => self.handle_line(&l),
            Line::InvalidUtf8(l) => {
                self.metrics.records.inc();
                self.metrics.parse_errors.inc();
                tracing::error!(message = "decoder output is not valid UTF-8", line = %l);
                true
            }
            Line::TooLong(n) => {
                self.metrics.records.inc();
                self.metrics.parse_errors.inc();
                tracing::error!(message = "discarded decoder output longer than maximum", bytes = n);
                true
            }
        }
    }

    /// Parse, normalize, and store a single line. Returns false for blank lines.
    fn handle_line(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }

        self.metrics.records.inc();
        let reading = match Reading::from_line(line) {
            Ok(r) => r,
            Err(e) => {
                self.metrics.parse_errors.inc();
                tracing::error!(message = "failed to parse decoder output", error = %e, line = %line);
                return true;
            }
        };

        let normalized = match self.normalizer.normalize(&reading) {
            Ok(n) => n,
            Err(skip) => {
                self.metrics.skipped.inc();
                match skip {
                    Skip::MissingId => tracing::error!(message = "ignoring record", reason = %skip, line = %line),
                    _ => tracing::debug!(message = "ignoring record", reason = %skip),
                }
                return true;
            }
        };

        self.metrics.readings.inc();
        self.metrics.out_of_range.inc_by(normalized.rejected.len() as u64);
        let resets = self.registry.update_reading(&normalized);
        self.metrics.counter_resets.inc_by(resets as u64);

        tracing::debug!(
            message = "received reading",
            device = %normalized.device,
            samples = normalized.samples.len(),
        );

        if let Some(tx) = &self.publisher {
            match tx.try_send(self.with_counter_totals(normalized)) {
                Ok(()) => {}
                Err(TrySendError::Full(n)) => {
                    self.metrics.publish_dropped.inc();
                    tracing::warn!(message = "publish queue full, dropping reading", device = %n.device);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(message = "publisher stopped, not publishing reading");
                }
            }
        }

        true
    }

    /// Replace raw counter values from the device with the totals kept by the
    /// registry, the same values that are scraped.
    fn with_counter_totals(&self, mut normalized: Normalized) -> Normalized {
        for sample in normalized.samples.iter_mut().filter(|s| s.kind == MetricKind::Counter) {
            if let Some(total) = self.registry.value(&sample.name, sample.device) {
                sample.value = total;
            }
        }

        normalized
    }
}

/// Ask the decoder to exit with SIGTERM, killing it if it doesn't within `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    sigterm(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(message = "decoder stopped", status = %status),
        Ok(Err(e)) => tracing::warn!(message = "unable to wait for decoder", error = %e),
        Err(_) => {
            tracing::warn!(message = "decoder did not exit after SIGTERM, killing it");
            if let Err(e) = child.kill().await {
                tracing::error!(message = "unable to kill decoder", error = %e);
            }
        }
    }
}

#[cfg(unix)]
fn sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(message = "unable to send SIGTERM to decoder", pid = pid, error = %e);
        }
    }
}

#[cfg(not(unix))]
fn sigterm(_child: &Child) {}
