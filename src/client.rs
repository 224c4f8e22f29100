//! Measurement client: negotiates a session over the control channel,
//! drives the sending side of every stream and assembles the final report.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::config::{Config, Protocol};
use crate::protocol::{read_message, write_message, ControlMessage};
use crate::report::TestReport;
use crate::stats::{aggregate, StreamOutcome};
use crate::stream::StreamManager;
use crate::{tcp, udp, Error, Result};

/// Extra time granted past the nominal duration before workers are aborted.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the server's final statistics after the streams end.
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs one test session against a server.
///
/// # Examples
///
/// ```no_run
/// use netmeter::client::Client;
/// use netmeter::config::Config;
///
/// # async fn run() -> netmeter::Result<()> {
/// let config = Config::client("192.168.1.10".to_string(), 5201);
/// let report = Client::new(config).run().await?;
/// report.print_summary();
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that terminates all streams early. Cancelled streams keep
    /// their partial counters and the report is flagged as a partial
    /// failure.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the full session: handshake, start barrier, traffic, join
    /// barrier, receiver statistics, aggregation.
    pub async fn run(&self) -> Result<TestReport> {
        self.config.validate()?;
        let server = self
            .config
            .server_addr
            .as_deref()
            .ok_or_else(|| Error::Config("client requires a server address".to_string()))?;

        let control_addr = format!("{}:{}", server, self.config.port);
        info!("connecting to {control_addr}");
        let mut control =
            match time::timeout(self.config.connect_timeout, TcpStream::connect(&control_addr))
                .await
            {
                Ok(conn) => conn?,
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "control connection to {control_addr} timed out"
                    )))
                }
            };

        let request = ControlMessage::request(
            self.config.protocol,
            self.config.duration,
            self.config.parallel,
            self.config.bitrate,
            self.config.payload_size,
        );
        write_message(&mut control, &request).await?;

        let data_port = match time::timeout(self.config.connect_timeout, read_message(&mut control))
            .await
        {
            Ok(msg) => match msg? {
                ControlMessage::Accepted { data_port, cookie } => {
                    debug!("session accepted, cookie {cookie}, data port {data_port}");
                    data_port
                }
                ControlMessage::Rejected { reason } => return Err(Error::Rejected(reason)),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected handshake reply: {other:?}"
                    )))
                }
            },
            Err(_) => {
                return Err(Error::Timeout(
                    "server did not answer the handshake in time".to_string(),
                ))
            }
        };

        let data_addr = format!("{}:{}", server, data_port);
        let mut outcomes = match self.config.protocol {
            Protocol::Tcp => self.run_tcp(&data_addr).await?,
            Protocol::Udp => self.run_udp(&data_addr).await?,
        };

        // Loss and jitter live on the receiving end; fetch them before
        // finalizing.
        match time::timeout(COMPLETE_TIMEOUT, read_message(&mut control)).await {
            Ok(Ok(ControlMessage::Complete { streams })) => {
                for stats in &streams {
                    if let Some(outcome) = outcomes.iter_mut().find(|o| o.index == stats.index) {
                        outcome.merge_receiver_stats(stats);
                    }
                }
            }
            Ok(Ok(other)) => {
                warn!("expected final statistics, got {other:?}");
            }
            Ok(Err(e)) => {
                warn!("control channel failed before final statistics: {e}");
            }
            Err(_) => {
                warn!("server did not send final statistics in time");
            }
        }

        let result = aggregate(self.config.protocol, self.config.duration, &outcomes);
        let report = TestReport::from_result(&result, self.config.parallel, self.config.bitrate);
        info!(
            "test finished: {:.2} Mbps over {} stream(s)",
            report.throughput_bits_per_sec / 1e6,
            report.parallel
        );

        // A failed write must not discard the measurement itself.
        if let Some(path) = &self.config.output {
            if let Err(e) = report.save(path) {
                warn!("could not write report to {}: {e}", path.display());
            }
        }
        Ok(report)
    }

    async fn run_tcp(&self, data_addr: &str) -> Result<Vec<StreamOutcome>> {
        let manager = StreamManager::new(self.config.parallel, self.config.connect_timeout);
        let handles = manager.connect_all_tcp(data_addr).await?;

        let pool = Arc::new(BufferPool::new(
            self.config.payload_size,
            self.config.parallel,
        ));
        let mut workers = Vec::with_capacity(handles.len());
        for handle in handles {
            let index = handle.index;
            let stream = handle
                .conn
                .into_tcp()
                .ok_or_else(|| Error::Protocol("expected a TCP data connection".to_string()))?;
            let pool = Arc::clone(&pool);
            let cancel = self.cancel.clone();
            let duration = self.config.duration;
            let interval = self.config.interval;
            let task = tokio::spawn(async move {
                tcp::send(stream, index, duration, interval, pool, cancel).await
            });
            workers.push((index, task));
        }

        Ok(StreamManager::join_all(workers, self.config.duration + JOIN_GRACE).await)
    }

    async fn run_udp(&self, data_addr: &str) -> Result<Vec<StreamOutcome>> {
        let bitrate = self
            .config
            .bitrate
            .ok_or_else(|| Error::Config("UDP tests require a target bitrate".to_string()))?;
        // Each stream paces to an equal share of the target.
        let per_stream = (bitrate / self.config.parallel as u64).max(1);

        let manager = StreamManager::new(self.config.parallel, self.config.connect_timeout);
        let handles = manager.connect_all_udp(data_addr).await?;

        let mut workers = Vec::with_capacity(handles.len());
        for handle in handles {
            let index = handle.index;
            let socket = handle
                .conn
                .into_udp()
                .ok_or_else(|| Error::Protocol("expected a UDP data socket".to_string()))?;
            let cancel = self.cancel.clone();
            let duration = self.config.duration;
            let interval = self.config.interval;
            let payload_size = self.config.payload_size;
            let task = tokio::spawn(async move {
                udp::send(socket, index, duration, per_stream, payload_size, interval, cancel).await
            });
            workers.push((index, task));
        }

        Ok(StreamManager::join_all(workers, self.config.duration + JOIN_GRACE).await)
    }
}
