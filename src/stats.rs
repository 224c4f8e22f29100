//! Per-stream counters, interval samples, UDP loss/jitter accounting and the
//! session-level aggregation that runs once after all workers have joined.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::config::Protocol;
use crate::protocol::ReceiverStreamStats;

/// One interval's worth of measurement for a single stream.
///
/// Emitted on a fixed cadence from each worker's private monotonic counter;
/// immutable once produced. Loss and jitter fields are `None` for TCP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSample {
    pub stream: usize,
    /// Offset of the interval start from session start
    pub start: Duration,
    /// Offset of the interval end from session start
    pub end: Duration,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets_lost: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
}

impl IntervalSample {
    pub fn bits_per_second(&self) -> f64 {
        let secs = (self.end - self.start).as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 * 8.0) / secs
        } else {
            0.0
        }
    }
}

/// RFC 3550 inter-arrival jitter estimator.
///
/// Tracks the transit time (receive timestamp minus send timestamp) of
/// consecutive packets and smooths the absolute difference with a 1/16
/// gain: `J += (|D| - J) / 16`. The first packet only seeds the transit
/// reference; the estimate starts moving with the second.
///
/// # Examples
///
/// ```
/// use netmeter::stats::JitterEstimator;
///
/// let mut jitter = JitterEstimator::new();
/// jitter.record(0, 100);
/// jitter.record(10_000, 10_100);     // same transit, no jitter
/// assert_eq!(jitter.jitter_ms(), 0.0);
/// jitter.record(20_000, 20_260);     // transit grew by 160 us
/// assert!((jitter.jitter_ms() - 0.01).abs() < 1e-9); // 160/16 us
/// ```
#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    prev_transit_us: Option<i64>,
    jitter_us: f64,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one packet's send/receive timestamps (microseconds).
    pub fn record(&mut self, send_us: u64, recv_us: u64) {
        let transit = recv_us as i64 - send_us as i64;
        if let Some(prev) = self.prev_transit_us {
            let delta = (transit - prev).abs() as f64;
            self.jitter_us += (delta - self.jitter_us) / 16.0;
        }
        self.prev_transit_us = Some(transit);
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_us / 1000.0
    }
}

/// Receive-side accounting for one UDP stream.
///
/// Keeps the sequence high-water mark plus the set of sequences that arrived
/// inside the current interval window. On each window close the loss for the
/// interval is `(highest_seen - previous_highest) - received_in_window`, so a
/// reordered packet that still lands inside its window counts as received.
/// A packet arriving after its window closed has already been counted lost.
#[derive(Debug, Default)]
pub struct FlowTracker {
    highest_seen: Option<u64>,
    window_base: u64,
    window_seqs: HashSet<u64>,
    bytes: u64,
    total_received: u64,
    total_lost: u64,
    out_of_order: u64,
    jitter: JitterEstimator,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one received packet.
    pub fn record(&mut self, sequence: u64, send_us: u64, recv_us: u64, bytes: u64) {
        // A packet whose window already closed was counted lost and stays
        // lost; only note the reordering.
        if sequence < self.window_base {
            self.out_of_order += 1;
            return;
        }
        // Duplicate within the current window: count nothing twice
        if !self.window_seqs.insert(sequence) {
            return;
        }
        self.bytes += bytes;
        self.total_received += 1;
        self.jitter.record(send_us, recv_us);

        match self.highest_seen {
            Some(high) if sequence < high => self.out_of_order += 1,
            Some(high) if sequence > high => self.highest_seen = Some(sequence),
            None => self.highest_seen = Some(sequence),
            _ => {}
        }
    }

    /// Closes the current interval window, returning
    /// `(received_in_window, lost_in_window)` and resetting the window.
    pub fn close_window(&mut self) -> (u64, u64) {
        let received = self.window_seqs.len() as u64;
        let high = self.highest_seen.map(|h| h + 1).unwrap_or(0);
        let expected = high.saturating_sub(self.window_base);
        let lost = expected.saturating_sub(received);
        self.total_lost += lost;
        self.window_base = high;
        self.window_seqs.clear();
        (received, lost)
    }

    /// Finalizes the tracker at session end, closing any open window.
    pub fn finish(mut self) -> FlowTotals {
        self.close_window();
        FlowTotals {
            bytes: self.bytes,
            packets_received: self.total_received,
            packets_lost: self.total_lost,
            out_of_order: self.out_of_order,
            jitter_ms: self.jitter.jitter_ms(),
        }
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter.jitter_ms()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Immutable totals produced by a finished `FlowTracker`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowTotals {
    pub bytes: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub out_of_order: u64,
    pub jitter_ms: f64,
}

/// What one stream worker hands back at the join barrier.
///
/// Exclusively owned by its worker until then; the aggregator only ever sees
/// finished values.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub index: usize,
    pub bytes: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_ms: f64,
    pub samples: Vec<IntervalSample>,
    pub failed: bool,
    pub error: Option<String>,
}

impl StreamOutcome {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            bytes: 0,
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            jitter_ms: 0.0,
            samples: Vec::new(),
            failed: false,
            error: None,
        }
    }

    /// Marks a worker that never reported back within the join barrier.
    pub fn unreported(index: usize) -> Self {
        let mut outcome = Self::new(index);
        outcome.failed = true;
        outcome.error = Some("worker did not report within the join timeout".to_string());
        outcome
    }

    /// Folds the server's receiver-side accounting into a sender outcome.
    /// Loss and jitter can only be observed at the receiving end.
    pub fn merge_receiver_stats(&mut self, stats: &ReceiverStreamStats) {
        self.packets_received = stats.packets_received;
        self.packets_lost = stats.packets_lost;
        self.jitter_ms = stats.jitter_ms;
        if stats.failed {
            self.failed = true;
        }
    }
}

/// Per-stream entry of the persisted result schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub index: usize,
    pub bytes: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_ms: f64,
    pub failed: bool,
}

impl From<&StreamOutcome> for StreamSummary {
    fn from(o: &StreamOutcome) -> Self {
        Self {
            index: o.index,
            bytes: o.bytes,
            packets_sent: o.packets_sent,
            packets_received: o.packets_received,
            packets_lost: o.packets_lost,
            jitter_ms: o.jitter_ms,
            failed: o.failed,
        }
    }
}

/// Aggregate result of one session, derived once after the join barrier.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub protocol: Protocol,
    pub duration: Duration,
    pub total_bytes: u64,
    pub throughput_bits_per_sec: f64,
    pub total_packets_sent: u64,
    pub total_packets_lost: u64,
    pub loss_percent: f64,
    pub jitter_ms: f64,
    pub streams: Vec<StreamSummary>,
    pub partial_failure: bool,
}

/// Merges finished per-stream outcomes into the session result.
///
/// Bytes and packet counts are summed across every stream, including the
/// partial counters of streams that failed mid-test, so the per-stream
/// breakdown always sums exactly to the totals. Jitter is averaged weighted
/// by each stream's received-packet count; streams with unequal packet
/// counts would skew a naive mean. Any failed worker flags the whole result
/// as partial.
pub fn aggregate(
    protocol: Protocol,
    duration: Duration,
    outcomes: &[StreamOutcome],
) -> TestResult {
    let total_bytes: u64 = outcomes.iter().map(|o| o.bytes).sum();
    let total_packets_sent: u64 = outcomes.iter().map(|o| o.packets_sent).sum();
    let total_packets_lost: u64 = outcomes.iter().map(|o| o.packets_lost).sum();
    let partial_failure = outcomes.iter().any(|o| o.failed);

    let secs = duration.as_secs_f64();
    let throughput = if secs > 0.0 {
        (total_bytes as f64 * 8.0) / secs
    } else {
        0.0
    };

    let loss_percent = if protocol == Protocol::Udp && total_packets_sent > 0 {
        (total_packets_lost as f64 / total_packets_sent as f64) * 100.0
    } else {
        0.0
    };

    let received_total: u64 = outcomes.iter().map(|o| o.packets_received).sum();
    let jitter_ms = if protocol == Protocol::Udp && received_total > 0 {
        outcomes
            .iter()
            .map(|o| o.jitter_ms * o.packets_received as f64)
            .sum::<f64>()
            / received_total as f64
    } else {
        0.0
    };

    TestResult {
        protocol,
        duration,
        total_bytes,
        throughput_bits_per_sec: throughput,
        total_packets_sent,
        total_packets_lost,
        loss_percent,
        jitter_ms,
        streams: outcomes.iter().map(StreamSummary::from).collect(),
        partial_failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_constant_transit_is_zero() {
        let mut j = JitterEstimator::new();
        for i in 0..10u64 {
            j.record(i * 1000, i * 1000 + 250);
        }
        assert_eq!(j.jitter_ms(), 0.0);
    }

    #[test]
    fn test_jitter_rfc3550_smoothing() {
        let mut j = JitterEstimator::new();
        // Seed: transit 100 us
        j.record(0, 100);
        // Transit 300 us, |D| = 200, J = 200/16 = 12.5 us
        j.record(10_000, 10_300);
        assert!((j.jitter_ms() - 0.0125).abs() < 1e-12);
        // Transit back to 100 us, |D| = 200, J = 12.5 + (200 - 12.5)/16
        j.record(20_000, 20_100);
        let expected_us = 12.5 + (200.0 - 12.5) / 16.0;
        assert!((j.jitter_ms() - expected_us / 1000.0).abs() < 1e-12);
    }

    #[test]
    fn test_flow_tracker_no_loss() {
        let mut f = FlowTracker::new();
        for seq in 0..100u64 {
            f.record(seq, seq * 1000, seq * 1000 + 50, 1400);
        }
        let totals = f.finish();
        assert_eq!(totals.packets_received, 100);
        assert_eq!(totals.packets_lost, 0);
        assert_eq!(totals.bytes, 140_000);
    }

    #[test]
    fn test_flow_tracker_detects_gaps() {
        let mut f = FlowTracker::new();
        // Sequences 0..6 with 2 and 4 missing
        for seq in [0u64, 1, 3, 5] {
            f.record(seq, seq * 1000, seq * 1000 + 50, 100);
        }
        let totals = f.finish();
        assert_eq!(totals.packets_received, 4);
        assert_eq!(totals.packets_lost, 2);
    }

    #[test]
    fn test_flow_tracker_reorder_within_window_not_lost() {
        let mut f = FlowTracker::new();
        for seq in [0u64, 2, 1, 3] {
            f.record(seq, seq * 1000, seq * 1000 + 50, 100);
        }
        let (received, lost) = f.close_window();
        assert_eq!(received, 4);
        assert_eq!(lost, 0);
    }

    #[test]
    fn test_flow_tracker_out_of_order_counted() {
        let mut f = FlowTracker::new();
        for seq in [0u64, 2, 1, 3] {
            f.record(seq, seq * 1000, seq * 1000 + 50, 100);
        }
        let totals = f.finish();
        assert_eq!(totals.out_of_order, 1);
    }

    #[test]
    fn test_flow_tracker_interval_windows() {
        let mut f = FlowTracker::new();
        // First window: 0..5 with 3 missing
        for seq in [0u64, 1, 2, 4] {
            f.record(seq, 0, 50, 100);
        }
        let (received, lost) = f.close_window();
        assert_eq!(received, 4);
        assert_eq!(lost, 1);

        // Second window: 5..8, all present; 3 arriving now stays lost
        for seq in [5u64, 6, 7] {
            f.record(seq, 0, 50, 100);
        }
        let (received, lost) = f.close_window();
        assert_eq!(received, 3);
        assert_eq!(lost, 0);

        let totals = f.finish();
        assert_eq!(totals.packets_lost, 1);
    }

    #[test]
    fn test_flow_tracker_late_arrival_stays_lost() {
        let mut f = FlowTracker::new();
        for seq in [0u64, 1, 3] {
            f.record(seq, 0, 50, 100);
        }
        f.close_window(); // 2 is now lost

        // 2 arrives after its window closed: stays lost, no double counting
        f.record(2, 0, 50, 100);
        for seq in [4u64, 5] {
            f.record(seq, 0, 50, 100);
        }
        let totals = f.finish();
        assert_eq!(totals.packets_lost, 1);
        assert_eq!(totals.packets_received, 5);
    }

    #[test]
    fn test_flow_tracker_ignores_duplicates() {
        let mut f = FlowTracker::new();
        f.record(0, 0, 50, 100);
        f.record(0, 0, 50, 100);
        let totals = f.finish();
        assert_eq!(totals.packets_received, 1);
        assert_eq!(totals.bytes, 100);
    }

    fn outcome(index: usize, bytes: u64, received: u64, jitter_ms: f64) -> StreamOutcome {
        let mut o = StreamOutcome::new(index);
        o.bytes = bytes;
        o.packets_sent = received;
        o.packets_received = received;
        o.jitter_ms = jitter_ms;
        o
    }

    #[test]
    fn test_aggregate_sums_bytes_exactly() {
        let outcomes = vec![
            outcome(0, 1000, 10, 0.0),
            outcome(1, 2500, 25, 0.0),
            outcome(2, 499, 5, 0.0),
        ];
        let result = aggregate(Protocol::Tcp, Duration::from_secs(1), &outcomes);
        assert_eq!(result.total_bytes, 3999);
        assert_eq!(
            result.streams.iter().map(|s| s.bytes).sum::<u64>(),
            result.total_bytes
        );
        assert!(!result.partial_failure);
        assert_eq!(result.throughput_bits_per_sec, 3999.0 * 8.0);
    }

    #[test]
    fn test_aggregate_jitter_weighted_by_packets() {
        // Stream 0: 90 packets at 1 ms, stream 1: 10 packets at 11 ms.
        // Weighted mean is 2 ms; a naive mean would say 6 ms.
        let outcomes = vec![outcome(0, 0, 90, 1.0), outcome(1, 0, 10, 11.0)];
        let result = aggregate(Protocol::Udp, Duration::from_secs(1), &outcomes);
        assert!((result.jitter_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_marks_partial_failure() {
        let mut failed = outcome(1, 500, 5, 0.0);
        failed.failed = true;
        let outcomes = vec![outcome(0, 1000, 10, 0.0), failed];
        let result = aggregate(Protocol::Tcp, Duration::from_secs(1), &outcomes);
        assert!(result.partial_failure);
        // Partial counters still contribute to the totals
        assert_eq!(result.total_bytes, 1500);
    }

    #[test]
    fn test_aggregate_loss_percent_bounds() {
        let mut o = outcome(0, 1000, 50, 0.5);
        o.packets_sent = 100;
        o.packets_lost = 50;
        let result = aggregate(Protocol::Udp, Duration::from_secs(1), &[o]);
        assert!((result.loss_percent - 50.0).abs() < 1e-9);
        assert!(result.loss_percent >= 0.0 && result.loss_percent <= 100.0);
    }
}
