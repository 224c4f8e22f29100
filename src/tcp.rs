//! TCP throughput engine: one sender or receiver loop per stream worker.
//!
//! The sender saturates the connection with a repeating buffer and relies on
//! the transport's own flow control for pacing. Both ends sample cumulative
//! bytes on a fixed cadence; loss and jitter do not apply to a reliable
//! transport.

use log::{debug, error};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::stats::{IntervalSample, StreamOutcome};

/// Extra time a receiver keeps reading past the nominal duration so it
/// drains bytes still in flight when the sender stops.
const RECEIVE_GRACE: Duration = Duration::from_secs(2);

/// Drives one sending stream for the test duration and returns its counters.
///
/// A write error or cancellation terminates the stream early; the partial
/// counters collected so far are kept and the outcome is marked failed.
pub async fn send(
    mut stream: TcpStream,
    index: usize,
    duration: Duration,
    interval: Duration,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
) -> StreamOutcome {
    let buffer = pool.get();
    let mut outcome = StreamOutcome::new(index);
    let start = Instant::now();
    let mut sampler = Sampler::new(index, start, interval);

    while start.elapsed() < duration {
        if cancel.is_cancelled() {
            debug!("stream {index} sender cancelled");
            outcome.failed = true;
            outcome.error = Some("cancelled".to_string());
            break;
        }

        match stream.write(&buffer).await {
            Ok(n) => {
                outcome.bytes += n as u64;
                sampler.add(n as u64);
                sampler.maybe_emit(&mut outcome.samples);
            }
            Err(e) => {
                error!("stream {index} send error: {e}");
                outcome.failed = true;
                outcome.error = Some(e.to_string());
                break;
            }
        }
    }

    sampler.flush(&mut outcome.samples);
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
    pool.put(buffer);
    outcome
}

/// Drives one receiving stream: reads and discards until the peer closes or
/// the duration (plus a small grace) elapses.
pub async fn receive(
    mut stream: TcpStream,
    index: usize,
    duration: Duration,
    interval: Duration,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
) -> StreamOutcome {
    let mut buffer = pool.get();
    let mut outcome = StreamOutcome::new(index);
    let start = Instant::now();
    let mut sampler = Sampler::new(index, start, interval);
    let deadline = duration + RECEIVE_GRACE;

    while start.elapsed() < deadline {
        if cancel.is_cancelled() {
            debug!("stream {index} receiver cancelled");
            outcome.failed = true;
            outcome.error = Some("cancelled".to_string());
            break;
        }

        match time::timeout(Duration::from_millis(100), stream.read(&mut buffer)).await {
            Ok(Ok(0)) => break, // peer finished
            Ok(Ok(n)) => {
                outcome.bytes += n as u64;
                sampler.add(n as u64);
                sampler.maybe_emit(&mut outcome.samples);
            }
            Ok(Err(e)) => {
                error!("stream {index} receive error: {e}");
                outcome.failed = true;
                outcome.error = Some(e.to_string());
                break;
            }
            Err(_) => {
                // Idle stretches still emit on the cadence, so a stalled
                // sender shows up as zero-byte intervals rather than one
                // oversized sample afterwards.
                sampler.maybe_emit(&mut outcome.samples);
            }
        }
    }

    sampler.flush(&mut outcome.samples);
    pool.put(buffer);
    outcome
}

/// Accumulates bytes between interval boundaries and emits ordered samples
/// from a private monotonic counter.
pub(crate) struct Sampler {
    stream: usize,
    start: Instant,
    interval: Duration,
    last_emit: Instant,
    last_offset: Duration,
    bytes: u64,
}

impl Sampler {
    pub(crate) fn new(stream: usize, start: Instant, interval: Duration) -> Self {
        Self {
            stream,
            start,
            interval,
            last_emit: start,
            last_offset: Duration::ZERO,
            bytes: 0,
        }
    }

    pub(crate) fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    pub(crate) fn maybe_emit(&mut self, samples: &mut Vec<IntervalSample>) {
        if self.last_emit.elapsed() >= self.interval {
            self.emit(samples);
        }
    }

    pub(crate) fn flush(&mut self, samples: &mut Vec<IntervalSample>) {
        if self.bytes > 0 || self.last_emit.elapsed() > Duration::ZERO {
            self.emit(samples);
        }
    }

    fn emit(&mut self, samples: &mut Vec<IntervalSample>) {
        let end = self.start.elapsed();
        samples.push(IntervalSample {
            stream: self.stream,
            start: self.last_offset,
            end,
            bytes: self.bytes,
            packets_sent: None,
            packets_received: None,
            packets_lost: None,
            jitter_ms: None,
        });
        self.bytes = 0;
        self.last_offset = end;
        self.last_emit = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_loopback_send_receive_counts_match() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let pool = Arc::new(BufferPool::new(16 * 1024, 4));
        let recv_pool = pool.clone();
        let duration = Duration::from_millis(500);
        let interval = Duration::from_millis(100);

        let receiver = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            receive(
                stream,
                0,
                duration,
                interval,
                recv_pool,
                CancellationToken::new(),
            )
            .await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let sent = send(
            stream,
            0,
            duration,
            interval,
            pool,
            CancellationToken::new(),
        )
        .await;
        let received = receiver.await.unwrap();

        assert!(!sent.failed);
        assert!(!received.failed);
        assert!(sent.bytes > 0);
        assert_eq!(sent.bytes, received.bytes);
        assert!(!sent.samples.is_empty());
    }

    #[tokio::test]
    async fn test_sender_survives_peer_reset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_millis(50)).await;
            drop(stream); // hard close mid-test
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let pool = Arc::new(BufferPool::new(16 * 1024, 2));
        let outcome = send(
            stream,
            2,
            Duration::from_secs(2),
            Duration::from_millis(100),
            pool,
            CancellationToken::new(),
        )
        .await;

        // Terminal failure with partial counters intact, no retry
        assert!(outcome.failed);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_receiver_keeps_cadence_while_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Peer connects but never sends, then hangs up.
        let idle_peer = tokio::spawn(async move {
            let _conn = TcpStream::connect(addr).await.unwrap();
            time::sleep(Duration::from_millis(700)).await;
        });

        let (stream, _) = listener.accept().await.unwrap();
        let pool = Arc::new(BufferPool::new(16 * 1024, 1));
        let outcome = receive(
            stream,
            0,
            Duration::from_millis(500),
            Duration::from_millis(150),
            pool,
            CancellationToken::new(),
        )
        .await;
        idle_peer.await.unwrap();

        // The cadence holds through the silence: several zero-byte samples
        // instead of one oversized sample at the end.
        assert!(
            outcome.samples.len() >= 3,
            "expected cadence samples during idle, got {}",
            outcome.samples.len()
        );
        assert!(outcome.samples.iter().all(|s| s.bytes == 0));
        for pair in outcome.samples.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_samples_are_ordered() {
        let start = Instant::now();
        let mut sampler = Sampler::new(0, start, Duration::from_millis(1));
        let mut samples = Vec::new();

        sampler.add(100);
        std::thread::sleep(Duration::from_millis(2));
        sampler.maybe_emit(&mut samples);
        sampler.add(200);
        std::thread::sleep(Duration::from_millis(2));
        sampler.maybe_emit(&mut samples);

        assert_eq!(samples.len(), 2);
        assert!(samples[0].end <= samples[1].start);
        assert_eq!(samples[0].bytes, 100);
        assert_eq!(samples[1].bytes, 200);
    }
}
