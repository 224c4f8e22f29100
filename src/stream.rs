//! Stream fan-out and fan-in: opening the parallel data connections behind a
//! bounded start barrier, tagging each with its stream index, and joining the
//! workers behind a bounded shutdown barrier.
//!
//! A test never silently proceeds with fewer streams than requested; if any
//! connection fails to establish inside the timeout the whole session aborts.
//! At shutdown a worker that fails to report inside the timeout is marked
//! failed instead of blocking the rest.

use log::{debug, warn};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time;

use crate::packet::{decode_tcp_preamble, encode_tcp_preamble, TCP_PREAMBLE_SIZE};
use crate::stats::StreamOutcome;
use crate::{Error, Result};

/// One data connection, tagged with its stream index.
#[derive(Debug)]
pub struct StreamHandle {
    pub index: usize,
    pub conn: DataConnection,
}

#[derive(Debug)]
pub enum DataConnection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl DataConnection {
    pub fn into_tcp(self) -> Option<TcpStream> {
        match self {
            DataConnection::Tcp(stream) => Some(stream),
            DataConnection::Udp(_) => None,
        }
    }

    pub fn into_udp(self) -> Option<UdpSocket> {
        match self {
            DataConnection::Udp(socket) => Some(socket),
            DataConnection::Tcp(_) => None,
        }
    }
}

/// Opens and joins the session's data streams. Parallelism is fixed at
/// construction and never changes for the session's lifetime.
pub struct StreamManager {
    parallel: usize,
    timeout: Duration,
}

impl StreamManager {
    pub fn new(parallel: usize, timeout: Duration) -> Self {
        Self { parallel, timeout }
    }

    /// Client-side start barrier: opens exactly `parallel` TCP connections
    /// to `addr`, writing the stream-index preamble on each. Aborts the whole
    /// session if they do not all establish within the timeout.
    pub async fn connect_all_tcp(&self, addr: &str) -> Result<Vec<StreamHandle>> {
        let parallel = self.parallel;
        let connect = async {
            let mut handles = Vec::with_capacity(parallel);
            for index in 0..parallel {
                let mut stream = TcpStream::connect(addr).await?;
                use tokio::io::AsyncWriteExt;
                stream.write_all(&encode_tcp_preamble(index as u32)).await?;
                debug!("data stream {index} connected to {addr}");
                handles.push(StreamHandle {
                    index,
                    conn: DataConnection::Tcp(stream),
                });
            }
            Ok::<_, Error>(handles)
        };

        time::timeout(self.timeout, connect)
            .await
            .map_err(|_| connect_timeout(parallel, addr, self.timeout))?
    }

    /// Client-side start barrier for UDP: binds one ephemeral socket per
    /// stream and connects it to the server's data port.
    pub async fn connect_all_udp(&self, addr: &str) -> Result<Vec<StreamHandle>> {
        let parallel = self.parallel;
        let connect = async {
            let mut handles = Vec::with_capacity(parallel);
            for index in 0..parallel {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(addr).await?;
                debug!("udp stream {index} bound to {}", socket.local_addr()?);
                handles.push(StreamHandle {
                    index,
                    conn: DataConnection::Udp(socket),
                });
            }
            Ok::<_, Error>(handles)
        };

        time::timeout(self.timeout, connect)
            .await
            .map_err(|_| connect_timeout(parallel, addr, self.timeout))?
    }

    /// Server-side start barrier: accepts exactly `parallel` TCP data
    /// connections and demultiplexes them by the preamble's stream index.
    pub async fn accept_all_tcp(&self, listener: &TcpListener) -> Result<Vec<StreamHandle>> {
        let parallel = self.parallel;
        let accept = async {
            let mut handles: Vec<Option<StreamHandle>> = (0..parallel).map(|_| None).collect();
            let mut accepted = 0usize;
            while accepted < parallel {
                let (mut stream, peer) = listener.accept().await?;
                use tokio::io::AsyncReadExt;
                let mut preamble = [0u8; TCP_PREAMBLE_SIZE];
                stream.read_exact(&mut preamble).await?;
                let index = match decode_tcp_preamble(&preamble) {
                    Some(i) if (i as usize) < parallel => i as usize,
                    Some(i) => {
                        return Err(Error::Protocol(format!(
                            "stream index {i} out of range for {parallel} streams"
                        )));
                    }
                    None => {
                        warn!("connection from {peer} without a valid preamble, dropping");
                        continue;
                    }
                };
                if handles[index].is_some() {
                    return Err(Error::Protocol(format!(
                        "duplicate data connection for stream {index}"
                    )));
                }
                handles[index] = Some(StreamHandle {
                    index,
                    conn: DataConnection::Tcp(stream),
                });
                accepted += 1;
            }
            // All slots filled by construction
            Ok::<_, Error>(handles.into_iter().flatten().collect())
        };

        time::timeout(self.timeout, accept)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "only some of {parallel} data connections arrived within {:?}",
                    self.timeout
                ))
            })?
    }

    /// Shutdown barrier: joins every worker within the timeout. A worker
    /// that does not report is aborted and marked failed; the others'
    /// outcomes are returned intact, ordered by stream index.
    pub async fn join_all(
        workers: Vec<(usize, JoinHandle<StreamOutcome>)>,
        timeout: Duration,
    ) -> Vec<StreamOutcome> {
        let deadline = time::Instant::now() + timeout;
        let mut outcomes = Vec::with_capacity(workers.len());

        for (index, handle) in workers {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            let abort = handle.abort_handle();
            match time::timeout(remaining, handle).await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(join_err)) => {
                    warn!("stream {index} worker panicked or was aborted: {join_err}");
                    let mut outcome = StreamOutcome::new(index);
                    outcome.failed = true;
                    outcome.error = Some(join_err.to_string());
                    outcomes.push(outcome);
                }
                Err(_) => {
                    warn!("stream {index} worker missed the join deadline, aborting it");
                    abort.abort();
                    outcomes.push(StreamOutcome::unreported(index));
                }
            }
        }

        outcomes.sort_by_key(|o| o.index);
        outcomes
    }
}

fn connect_timeout(parallel: usize, addr: &str, timeout: Duration) -> Error {
    Error::Timeout(format!(
        "could not establish all {parallel} data connections to {addr} within {timeout:?}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_barrier_times_out_cleanly() {
        // No listener on the data port: the barrier must abort the session
        // instead of proceeding with fewer streams.
        let manager = StreamManager::new(2, Duration::from_millis(200));
        let err = manager
            .connect_all_tcp("127.0.0.1:1") // reserved port, nothing listening
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_) | Error::Io(_)));
    }

    #[tokio::test]
    async fn test_accept_barrier_matches_preambles() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let manager = StreamManager::new(3, Duration::from_secs(2));
        let client = tokio::spawn(async move {
            let m = StreamManager::new(3, Duration::from_secs(2));
            m.connect_all_tcp(&addr).await
        });

        let accepted = manager.accept_all_tcp(&listener).await.unwrap();
        let connected = client.await.unwrap().unwrap();

        assert_eq!(accepted.len(), 3);
        assert_eq!(connected.len(), 3);
        for (i, handle) in accepted.iter().enumerate() {
            assert_eq!(handle.index, i);
        }
    }

    #[tokio::test]
    async fn test_join_barrier_bounds_stuck_workers() {
        let quick = tokio::spawn(async {
            let mut o = StreamOutcome::new(0);
            o.bytes = 42;
            o
        });
        let stuck: JoinHandle<StreamOutcome> = tokio::spawn(async {
            time::sleep(Duration::from_secs(60)).await;
            StreamOutcome::new(1)
        });

        let outcomes =
            StreamManager::join_all(vec![(0, quick), (1, stuck)], Duration::from_millis(200))
                .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].bytes, 42);
        assert!(!outcomes[0].failed);
        assert!(outcomes[1].failed);
    }
}
