//! Test reports: the persisted and printed form of a session result.

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::Protocol;
use crate::stats::{StreamSummary, TestResult};
use crate::Result;

/// Self-contained record of one finished test, suitable for saving to disk
/// and for later comparison across runs.
///
/// # Examples
///
/// ```no_run
/// use netmeter::report::TestReport;
///
/// # fn load() -> netmeter::Result<()> {
/// let report = TestReport::load("netmeter_tcp_1700000000.json")?;
/// println!("{:.2} Mbps", report.throughput_bits_per_sec / 1e6);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub duration_secs: f64,
    pub parallel: usize,
    /// Target bitrate in bits/sec; `None` for TCP tests
    pub target_bitrate: Option<u64>,
    pub total_bytes: u64,
    pub throughput_bits_per_sec: f64,
    pub total_packets_sent: u64,
    pub total_packets_lost: u64,
    pub loss_percent: f64,
    pub jitter_ms: f64,
    pub per_stream: Vec<StreamSummary>,
    /// True if any stream terminated before the full duration
    pub partial_failure: bool,
}

impl TestReport {
    /// Builds the report from an aggregated result.
    pub fn from_result(result: &TestResult, parallel: usize, target_bitrate: Option<u64>) -> Self {
        Self {
            timestamp: Utc::now(),
            protocol: result.protocol,
            duration_secs: result.duration.as_secs_f64(),
            parallel,
            target_bitrate,
            total_bytes: result.total_bytes,
            throughput_bits_per_sec: result.throughput_bits_per_sec,
            total_packets_sent: result.total_packets_sent,
            total_packets_lost: result.total_packets_lost,
            loss_percent: result.loss_percent,
            jitter_ms: result.jitter_ms,
            per_stream: result.streams.clone(),
            partial_failure: result.partial_failure,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }

    /// Writes the report as pretty-printed JSON. Loading the file back
    /// yields a report equal to this one.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        info!("report written to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!();
        println!("=== {} test results ===", self.protocol.as_str().to_uppercase());
        println!("  duration:    {:.1} s", self.duration_secs);
        println!("  streams:     {}", self.parallel);
        println!("  transferred: {}", format_bytes(self.total_bytes));
        println!(
            "  throughput:  {:.2} Mbps",
            self.throughput_bits_per_sec / 1e6
        );
        if self.protocol == Protocol::Udp {
            println!(
                "  packets:     {} sent, {} lost ({:.2}% loss)",
                self.total_packets_sent, self.total_packets_lost, self.loss_percent
            );
            println!("  jitter:      {:.3} ms", self.jitter_ms);
        }
        if self.per_stream.len() > 1 {
            for s in &self.per_stream {
                let rate = (s.bytes as f64 * 8.0) / self.duration_secs / 1e6;
                let mark = if s.failed { " [failed]" } else { "" };
                println!("    stream {}: {} ({rate:.2} Mbps){mark}", s.index, format_bytes(s.bytes));
            }
        }
        if self.partial_failure {
            println!("  note: one or more streams ended early; totals include partial data");
        }
        println!();
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> TestReport {
        TestReport {
            timestamp: Utc::now(),
            protocol: Protocol::Udp,
            duration_secs: 10.0,
            parallel: 2,
            target_bitrate: Some(10_000_000),
            total_bytes: 12_500_000,
            throughput_bits_per_sec: 10_000_000.0,
            total_packets_sent: 8929,
            total_packets_lost: 12,
            loss_percent: 0.134,
            jitter_ms: 0.82,
            per_stream: vec![
                StreamSummary {
                    index: 0,
                    bytes: 6_250_000,
                    packets_sent: 4465,
                    packets_received: 4459,
                    packets_lost: 6,
                    jitter_ms: 0.80,
                    failed: false,
                },
                StreamSummary {
                    index: 1,
                    bytes: 6_250_000,
                    packets_sent: 4464,
                    packets_received: 4458,
                    packets_lost: 6,
                    jitter_ms: 0.84,
                    failed: false,
                },
            ],
            partial_failure: false,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let report = sample_report();
        report.save(&path).unwrap();
        let loaded = TestReport::load(&path).unwrap();

        assert_eq!(report, loaded);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(TestReport::load(&path).is_err());
    }

    #[test]
    fn test_format_bytes_scales() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
