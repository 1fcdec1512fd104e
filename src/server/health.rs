use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::pipeline::PipelineState;

/// Both stages must have reported within this window for a 200.
const HEALTHY_MAX_AGE: Duration = Duration::from_secs(10);

/// Point-in-time view of pipeline health. Built per request.
#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub stream_name: String,
    pub fps: f64,
    pub last_capture_seconds_ago: f64,
    pub last_processing_seconds_ago: f64,
    pub reconnect_count: u64,
    pub connected_clients_ai: usize,
    pub connected_clients_clean: usize,
    pub is_streaming: bool,
    #[serde(skip)]
    healthy: bool,
    #[serde(skip)]
    capture_age: Duration,
    #[serde(skip)]
    processing_age: Duration,
}

impl HealthSnapshot {
    pub fn collect(
        state: &PipelineState,
        stream_name: &str,
        clients_ai: usize,
        clients_clean: usize,
        now: Instant,
    ) -> Self {
        let healthy = state.is_healthy();
        let capture_age = state.capture().age_at(now);
        let processing_age = state.processing().age_at(now);
        Self {
            status: if healthy { "healthy" } else { "unhealthy" },
            stream_name: stream_name.to_string(),
            fps: round2(f64::from(state.fps())),
            last_capture_seconds_ago: round2(capture_age.as_secs_f64()),
            last_processing_seconds_ago: round2(processing_age.as_secs_f64()),
            reconnect_count: state.reconnect_count(),
            connected_clients_ai: clients_ai,
            connected_clients_clean: clients_clean,
            is_streaming: state.is_streaming(),
            healthy,
            capture_age,
            processing_age,
        }
    }

    /// Healthy flag set and both stages fresh.
    pub fn is_ok(&self) -> bool {
        self.healthy && self.capture_age < HEALTHY_MAX_AGE && self.processing_age < HEALTHY_MAX_AGE
    }

    pub fn http_status(&self) -> u16 {
        if self.is_ok() {
            200
        } else {
            503
        }
    }

    /// Prometheus text exposition.
    pub fn render_metrics(&self) -> String {
        let stream = escape_label(&self.stream_name);
        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{}{{stream=\"{}\"}} {}", name, stream, value);
        };
        metric(
            "stream_fps",
            "gauge",
            "Current frames per second",
            self.fps.to_string(),
        );
        metric(
            "stream_healthy",
            "gauge",
            "Stream health status (1=healthy, 0=unhealthy)",
            u8::from(self.healthy).to_string(),
        );
        metric(
            "stream_reconnects",
            "counter",
            "Total number of reconnections",
            self.reconnect_count.to_string(),
        );
        metric(
            "stream_clients_ai",
            "gauge",
            "Number of connected clients (AI feed)",
            self.connected_clients_ai.to_string(),
        );
        metric(
            "stream_clients_clean",
            "gauge",
            "Number of connected clients (clean feed)",
            self.connected_clients_clean.to_string(),
        );
        out
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
