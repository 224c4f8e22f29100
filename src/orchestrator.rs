//! Periodic test runner and the player-log analyzer.
//!
//! The monitor drives client sessions on a fixed cadence over a longer
//! wall-clock window, persisting every result and a run-level summary at
//! the end. The analyzer is a separate entry point: a pure reducer over an
//! externally produced JSON-lines log of video-player quality events.

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::{Config, Protocol};
use crate::report::TestReport;
use crate::Result;

/// Parameters of one monitoring run.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub server: String,
    pub port: u16,
    /// Total wall-clock window the monitor keeps cycling for
    pub total_duration: Duration,
    /// Cadence between cycle starts
    pub interval: Duration,
    /// Duration of each individual sub-test
    pub test_duration: Duration,
    pub parallel: usize,
    /// When set, each cycle runs a UDP test at this bitrate after the TCP one
    pub udp_bitrate: Option<u64>,
    /// Directory for per-test and summary artifacts; current dir when `None`
    pub output_dir: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: 5201,
            total_duration: Duration::from_secs(3600),
            interval: Duration::from_secs(300),
            test_duration: Duration::from_secs(10),
            parallel: 1,
            udp_bitrate: None,
            output_dir: None,
        }
    }
}

/// Mean/min/max throughput and loss across one protocol's sub-tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSummary {
    pub runs: usize,
    pub failed_runs: usize,
    pub mean_throughput_bps: f64,
    pub min_throughput_bps: f64,
    pub max_throughput_bps: f64,
    pub total_packets_lost: u64,
}

impl ProtocolSummary {
    fn from_reports(reports: &[TestReport], failed_runs: usize) -> Self {
        let rates: Vec<f64> = reports.iter().map(|r| r.throughput_bits_per_sec).collect();
        let (mean, min) = if rates.is_empty() {
            (0.0, 0.0)
        } else {
            (
                rates.iter().sum::<f64>() / rates.len() as f64,
                rates.iter().copied().fold(f64::INFINITY, f64::min),
            )
        };
        Self {
            runs: reports.len(),
            failed_runs,
            mean_throughput_bps: mean,
            min_throughput_bps: min,
            max_throughput_bps: rates.iter().copied().fold(0.0, f64::max),
            total_packets_lost: reports.iter().map(|r| r.total_packets_lost).sum(),
        }
    }
}

/// Run-level artifact written once at the end of a monitoring window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started: chrono::DateTime<Utc>,
    pub finished: chrono::DateTime<Utc>,
    pub cycles: usize,
    pub tcp: ProtocolSummary,
    pub udp: Option<ProtocolSummary>,
}

/// Runs client sessions on a fixed cadence and summarizes the window.
pub struct Monitor {
    config: MonitorConfig,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cycles until the window closes or cancellation. A failed sub-test is
    /// logged and counted; the monitor moves on to the next cycle.
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Utc::now();
        let window_start = time::Instant::now();
        // Absolute cycle deadlines, so one slow test does not shift the
        // whole cadence.
        let mut next_cycle = window_start;

        let mut tcp_reports = Vec::new();
        let mut udp_reports = Vec::new();
        let mut tcp_failures = 0usize;
        let mut udp_failures = 0usize;
        let mut cycles = 0usize;

        while window_start.elapsed() < self.config.total_duration && !self.cancel.is_cancelled() {
            cycles += 1;
            info!("monitor cycle {cycles} starting");

            match self.run_test(Protocol::Tcp).await {
                Ok(report) => {
                    self.persist(&report);
                    tcp_reports.push(report);
                }
                Err(e) => {
                    error!("TCP sub-test failed: {e}");
                    tcp_failures += 1;
                }
            }

            if let Some(bitrate) = self.config.udp_bitrate {
                if !self.cancel.is_cancelled() {
                    match self.run_udp_test(bitrate).await {
                        Ok(report) => {
                            self.persist(&report);
                            udp_reports.push(report);
                        }
                        Err(e) => {
                            error!("UDP sub-test failed: {e}");
                            udp_failures += 1;
                        }
                    }
                }
            }

            next_cycle += self.config.interval;
            let window_end = window_start + self.config.total_duration;
            if next_cycle >= window_end {
                break;
            }
            tokio::select! {
                _ = time::sleep_until(next_cycle) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        let summary = RunSummary {
            started,
            finished: Utc::now(),
            cycles,
            tcp: ProtocolSummary::from_reports(&tcp_reports, tcp_failures),
            udp: self
                .config
                .udp_bitrate
                .map(|_| ProtocolSummary::from_reports(&udp_reports, udp_failures)),
        };
        self.persist_summary(&summary)?;
        print_run_summary(&summary);
        Ok(summary)
    }

    async fn run_test(&self, protocol: Protocol) -> Result<TestReport> {
        let config = Config::client(self.config.server.clone(), self.config.port)
            .with_protocol(protocol)
            .with_duration(self.config.test_duration)
            .with_parallel(self.config.parallel);
        Client::new(config).run().await
    }

    async fn run_udp_test(&self, bitrate: u64) -> Result<TestReport> {
        let config = Config::client(self.config.server.clone(), self.config.port)
            .with_protocol(Protocol::Udp)
            .with_bitrate(bitrate)
            .with_duration(self.config.test_duration)
            .with_parallel(self.config.parallel);
        Client::new(config).run().await
    }

    fn persist(&self, report: &TestReport) {
        let name = format!(
            "netmeter_{}_{}.json",
            report.protocol.as_str(),
            report.timestamp.timestamp()
        );
        let path = self.output_path(&name);
        // A failed write must not discard the in-memory result.
        if let Err(e) = report.save(&path) {
            error!("could not persist report to {}: {e}", path.display());
        }
    }

    fn persist_summary(&self, summary: &RunSummary) -> Result<()> {
        let name = format!("netmeter_summary_{}.json", summary.finished.timestamp());
        let path = self.output_path(&name);
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json)?;
        info!("run summary written to {}", path.display());
        Ok(())
    }

    fn output_path(&self, name: &str) -> PathBuf {
        match &self.config.output_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("=== monitoring run summary ===");
    println!("  cycles:  {}", summary.cycles);
    print_protocol_line("tcp", &summary.tcp);
    if let Some(udp) = &summary.udp {
        print_protocol_line("udp", udp);
    }
    println!();
}

fn print_protocol_line(name: &str, p: &ProtocolSummary) {
    println!(
        "  {name}: {} run(s), {} failed, throughput mean {:.2} / min {:.2} / max {:.2} Mbps, {} packets lost",
        p.runs,
        p.failed_runs,
        p.mean_throughput_bps / 1e6,
        p.min_throughput_bps / 1e6,
        p.max_throughput_bps / 1e6,
        p.total_packets_lost,
    );
}

/// One record of the external player-quality log. Every field is optional;
/// the log format is not under this crate's control.
#[derive(Debug, Deserialize)]
struct PlayerLogRecord {
    #[serde(rename = "type")]
    kind: Option<String>,
    quality: Option<serde_json::Value>,
    #[serde(rename = "timeSec")]
    time_sec: Option<f64>,
    #[serde(rename = "totalStallDuration")]
    total_stall_duration: Option<f64>,
}

/// Summary counters computed from a player-quality log.
///
/// Quality keys are ordered, so the same input always serializes to the
/// same output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLogSummary {
    pub total_records: usize,
    pub skipped_records: usize,
    /// Number of stall events (records of type `stall`)
    pub total_stalls: u64,
    /// Final cumulative stall duration reported by the player, in seconds
    pub total_stall_duration: f64,
    pub periodic_samples: u64,
    /// Playback seconds spent at each quality level
    pub time_per_quality: BTreeMap<String, f64>,
    pub most_common_quality: Option<String>,
}

/// Reduces a JSON-lines player log to summary counters.
///
/// Lines that do not parse are counted and skipped; record types this crate
/// does not know still contribute their timestamps to the quality timeline.
/// The reduction is a pure function of the file contents.
pub fn analyze_player_log<P: AsRef<Path>>(path: P) -> Result<PlayerLogSummary> {
    let content = std::fs::read_to_string(path.as_ref())?;

    let mut total_records = 0usize;
    let mut skipped = 0usize;
    let mut total_stalls = 0u64;
    let mut total_stall_duration = 0.0f64;
    let mut periodic_samples = 0u64;
    let mut time_per_quality: BTreeMap<String, f64> = BTreeMap::new();

    let mut current_quality: Option<String> = None;
    let mut last_time: Option<f64> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total_records += 1;

        let record: PlayerLogRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping malformed log line: {e}");
                skipped += 1;
                continue;
            }
        };

        match record.kind.as_deref() {
            Some("stall") => total_stalls += 1,
            Some("periodic") => periodic_samples += 1,
            _ => {}
        }
        if let Some(d) = record.total_stall_duration {
            // The player reports a running total; keep the largest seen.
            total_stall_duration = total_stall_duration.max(d);
        }

        // Elapsed time since the previous record counts toward the quality
        // that was in effect over that span.
        if let Some(t) = record.time_sec {
            if let (Some(prev), Some(quality)) = (last_time, &current_quality) {
                let delta = t - prev;
                if delta > 0.0 {
                    *time_per_quality.entry(quality.clone()).or_insert(0.0) += delta;
                }
            }
            last_time = Some(t);
        }
        if let Some(q) = record.quality.as_ref().and_then(quality_label) {
            current_quality = Some(q);
        }
    }

    let most_common_quality = time_per_quality
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(q, _)| q.clone());

    Ok(PlayerLogSummary {
        total_records,
        skipped_records: skipped,
        total_stalls,
        total_stall_duration,
        periodic_samples,
        time_per_quality,
        most_common_quality,
    })
}

fn quality_label(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
