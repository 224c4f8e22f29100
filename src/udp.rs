//! UDP throughput engine: a paced sender and an accounting receiver.
//!
//! The sender spaces packets to the target bitrate with absolute send
//! deadlines, so scheduling jitter in one iteration is corrected by the next
//! sleep instead of accumulating. The receiver demultiplexes streams by the
//! packet header, tracks per-stream loss against the sequence high-water
//! mark and feeds the jitter estimator from the embedded send timestamps.

use log::{debug, error, warn};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::packet::{create_packet, now_micros, parse_packet, DataPacketHeader};
use crate::stats::{FlowTracker, IntervalSample, StreamOutcome};

/// How long the receiver keeps listening after the nominal duration for
/// packets still in flight.
const RECEIVE_GRACE: Duration = Duration::from_secs(2);

/// Drives one paced sending stream.
///
/// The inter-packet gap is `wire_bits / bitrate`; each iteration advances an
/// absolute deadline by that gap and sleeps only the remaining distance, so
/// a late wakeup shortens the next sleep rather than shifting every
/// subsequent packet.
pub async fn send(
    socket: UdpSocket,
    index: usize,
    duration: Duration,
    bitrate: u64,
    payload_size: usize,
    interval: Duration,
    cancel: CancellationToken,
) -> StreamOutcome {
    let mut outcome = StreamOutcome::new(index);
    let packet_len = DataPacketHeader::SIZE + payload_size;
    let gap = Duration::from_secs_f64((packet_len as f64 * 8.0) / bitrate as f64);

    let start = Instant::now();
    let mut sampler = crate::tcp::Sampler::new(index, start, interval);
    let mut interval_packets = 0u64;
    let mut next_send = start;
    let mut sequence = 0u64;

    while start.elapsed() < duration {
        if cancel.is_cancelled() {
            debug!("stream {index} sender cancelled");
            outcome.failed = true;
            outcome.error = Some("cancelled".to_string());
            break;
        }

        let packet = create_packet(index as u32, sequence, payload_size);
        match socket.send(&packet).await {
            Ok(n) => {
                sequence += 1;
                outcome.bytes += n as u64;
                outcome.packets_sent += 1;
                interval_packets += 1;
                sampler.add(n as u64);
            }
            Err(e) => {
                error!("stream {index} send error: {e}");
                outcome.failed = true;
                outcome.error = Some(e.to_string());
                break;
            }
        }

        emit_send_sample(&mut sampler, &mut outcome.samples, &mut interval_packets);

        next_send += gap;
        let now = Instant::now();
        if next_send > now {
            time::sleep(next_send - now).await;
        } else if now - next_send > Duration::from_millis(100) {
            // A long stall would otherwise trigger a burst of catch-up
            // packets; resynchronize instead.
            next_send = now;
        }
    }

    sampler.flush(&mut outcome.samples);
    if let Some(last) = outcome.samples.last_mut() {
        last.packets_sent = Some(interval_packets);
    }
    outcome
}

fn emit_send_sample(
    sampler: &mut crate::tcp::Sampler,
    samples: &mut Vec<IntervalSample>,
    interval_packets: &mut u64,
) {
    let before = samples.len();
    sampler.maybe_emit(samples);
    if samples.len() > before {
        if let Some(last) = samples.last_mut() {
            last.packets_sent = Some(*interval_packets);
        }
        *interval_packets = 0;
    }
}

/// Receives all streams of a session on one socket, demultiplexing by the
/// header's stream index. Per-stream state is owned exclusively by this
/// task; nothing else observes it until the outcomes are returned.
///
/// The clock starts with the first valid packet, so server-side setup time
/// does not eat into the measurement window.
pub async fn receive_session(
    socket: UdpSocket,
    parallel: usize,
    duration: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> Vec<StreamOutcome> {
    let mut trackers: Vec<FlowTracker> = (0..parallel).map(|_| FlowTracker::new()).collect();
    let mut outcomes: Vec<StreamOutcome> = (0..parallel).map(StreamOutcome::new).collect();
    let mut buf = vec![0u8; 65_536];

    let setup_deadline = Instant::now() + duration + RECEIVE_GRACE;
    let mut traffic_start: Option<Instant> = None;
    let mut last_window_close = Instant::now();

    loop {
        if cancel.is_cancelled() {
            for outcome in &mut outcomes {
                outcome.failed = true;
                outcome.error = Some("cancelled".to_string());
            }
            break;
        }

        let done = match traffic_start {
            Some(start) => start.elapsed() >= duration + RECEIVE_GRACE,
            None => Instant::now() >= setup_deadline,
        };
        if done {
            break;
        }

        match time::timeout(Duration::from_millis(100), socket.recv_from(&mut buf)).await {
            Ok(Ok((n, peer))) => {
                let Some((header, _payload)) = parse_packet(&buf[..n]) else {
                    debug!("non-measurement datagram from {peer}, ignoring");
                    continue;
                };
                let stream = header.stream as usize;
                if stream >= parallel {
                    warn!("packet for unknown stream {stream}, ignoring");
                    continue;
                }

                let start = *traffic_start.get_or_insert_with(Instant::now);
                trackers[stream].record(header.sequence, header.timestamp_us, now_micros(), n as u64);

                if last_window_close.elapsed() >= interval {
                    let end = start.elapsed();
                    close_windows(&mut trackers, &mut outcomes, end, interval);
                    last_window_close = Instant::now();
                }
            }
            Ok(Err(e)) => {
                error!("receive error: {e}");
                for outcome in &mut outcomes {
                    outcome.failed = true;
                    outcome.error = Some(e.to_string());
                }
                break;
            }
            Err(_) => {
                // Idle: once traffic has both started and stopped for a
                // while past the duration, there is nothing left to drain.
                if let Some(start) = traffic_start {
                    if start.elapsed() >= duration {
                        break;
                    }
                }
            }
        }
    }

    for (tracker, outcome) in trackers.into_iter().zip(outcomes.iter_mut()) {
        let totals = tracker.finish();
        outcome.bytes = totals.bytes;
        outcome.packets_received = totals.packets_received;
        outcome.packets_lost = totals.packets_lost;
        outcome.jitter_ms = totals.jitter_ms;
    }
    outcomes
}

fn close_windows(
    trackers: &mut [FlowTracker],
    outcomes: &mut [StreamOutcome],
    end: Duration,
    interval: Duration,
) {
    let start_offset = end.saturating_sub(interval);
    for (stream, (tracker, outcome)) in trackers.iter_mut().zip(outcomes.iter_mut()).enumerate() {
        let window_bytes_before = outcome
            .samples
            .iter()
            .map(|s| s.bytes)
            .sum::<u64>();
        let (received, lost) = tracker.close_window();
        outcome.samples.push(IntervalSample {
            stream,
            start: start_offset,
            end,
            bytes: tracker.bytes().saturating_sub(window_bytes_before),
            packets_sent: None,
            packets_received: Some(received),
            packets_lost: Some(lost),
            jitter_ms: Some(tracker.jitter_ms()),
        });
    }
}
