//! Observability counters and gauges.
//!
//! Thread-safe collection using atomic counters; each component owns one
//! metrics struct and renders it into Prometheus text exposition format for
//! its `/metrics` endpoint.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: i64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

/// Metrics for the tap orchestrator.
#[derive(Debug, Default)]
pub struct TapMetrics {
    pub taps_started: Counter,
    pub taps_failed: Counter,
    pub sessions_active: Gauge,
    pub cleanups: Counter,
    pub bridge_add_retries: Counter,
}

impl TapMetrics {
    pub fn render(&self) -> String {
        let mut out = String::new();
        write_counter(
            &mut out,
            "tapgate_tap_started_total",
            "Taps accepted via /start_tap",
            self.taps_started.get(),
        );
        write_counter(
            &mut out,
            "tapgate_tap_failed_total",
            "Taps that failed during setup",
            self.taps_failed.get(),
        );
        write_gauge(
            &mut out,
            "tapgate_tap_sessions_active",
            "Live tap sessions",
            self.sessions_active.get(),
        );
        write_counter(
            &mut out,
            "tapgate_tap_cleanups_total",
            "Session cleanups executed",
            self.cleanups.get(),
        );
        write_counter(
            &mut out,
            "tapgate_tap_bridge_add_retries_total",
            "Retried add-to-bridge operations",
            self.bridge_add_retries.get(),
        );
        out
    }
}

/// Metrics for the framed-TCP gateway.
#[derive(Debug, Default)]
pub struct FramedMetrics {
    pub sessions_active: Gauge,
    pub rtp_packets: Counter,
    pub rtp_bytes: Counter,
    pub frames_sent: Counter,
    pub register_conflicts: Counter,
    pub inactivity_closes: Counter,
    pub sessions_ended: Counter,
}

impl FramedMetrics {
    pub fn render(&self) -> String {
        let mut out = String::new();
        write_gauge(
            &mut out,
            "tapgate_framed_sessions_active",
            "Live framed sessions",
            self.sessions_active.get(),
        );
        write_counter(
            &mut out,
            "tapgate_framed_rtp_packets_total",
            "RTP datagrams received",
            self.rtp_packets.get(),
        );
        write_counter(
            &mut out,
            "tapgate_framed_rtp_bytes_total",
            "PCM payload bytes received",
            self.rtp_bytes.get(),
        );
        write_counter(
            &mut out,
            "tapgate_framed_frames_sent_total",
            "AUDIO frames written downstream",
            self.frames_sent.get(),
        );
        write_counter(
            &mut out,
            "tapgate_framed_register_conflicts_total",
            "Registrations rejected because the port was taken",
            self.register_conflicts.get(),
        );
        write_counter(
            &mut out,
            "tapgate_framed_inactivity_closes_total",
            "Sessions closed by the inactivity watchdog",
            self.inactivity_closes.get(),
        );
        write_counter(
            &mut out,
            "tapgate_framed_sessions_ended_total",
            "Sessions that reached END",
            self.sessions_ended.get(),
        );
        out
    }
}

/// Metrics for the streaming gateway.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub sessions_active: Gauge,
    pub rtp_packets: Counter,
    pub dropped_over_capacity: Counter,
    pub unknown_bindings: Counter,
    pub upstream_reconnects: Counter,
    pub boot_frames_dropped: Counter,
    pub transcripts: Counter,
    pub assist_requests: Counter,
    pub widget_clients: Gauge,
}

impl StreamMetrics {
    pub fn render(&self) -> String {
        let mut out = String::new();
        write_gauge(
            &mut out,
            "tapgate_stream_sessions_active",
            "Live streaming sessions",
            self.sessions_active.get(),
        );
        write_counter(
            &mut out,
            "tapgate_stream_rtp_packets_total",
            "RTP datagrams received",
            self.rtp_packets.get(),
        );
        write_counter(
            &mut out,
            "tapgate_stream_dropped_over_capacity_total",
            "New SSRCs dropped at the session cap",
            self.dropped_over_capacity.get(),
        );
        write_counter(
            &mut out,
            "tapgate_stream_unknown_bindings_total",
            "Sessions bound without a pending registration",
            self.unknown_bindings.get(),
        );
        write_counter(
            &mut out,
            "tapgate_stream_upstream_reconnects_total",
            "Upstream socket reconnect attempts",
            self.upstream_reconnects.get(),
        );
        write_counter(
            &mut out,
            "tapgate_stream_boot_frames_dropped_total",
            "Payloads dropped while the upstream socket was opening",
            self.boot_frames_dropped.get(),
        );
        write_counter(
            &mut out,
            "tapgate_stream_transcripts_total",
            "Transcript results forwarded to rooms",
            self.transcripts.get(),
        );
        write_counter(
            &mut out,
            "tapgate_stream_assist_requests_total",
            "Assistant samples posted",
            self.assist_requests.get(),
        );
        write_gauge(
            &mut out,
            "tapgate_stream_widget_clients",
            "Connected widget subscribers",
            self.widget_clients.get(),
        );
        out
    }
}
