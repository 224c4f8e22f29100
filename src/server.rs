//! Measurement server: accepts control connections, validates requests and
//! runs the receive side of each session.
//!
//! Sessions are handled sequentially. One client at a time keeps the data
//! path free of cross-session interference, which matters more for a
//! measurement tool than connection throughput.

use log::{error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::buffer_pool::BufferPool;
use crate::config::Protocol;
use crate::packet::DataPacketHeader;
use crate::protocol::{
    read_message, write_message, ControlMessage, ReceiverStreamStats, PROTOCOL_VERSION,
};
use crate::stats::StreamOutcome;
use crate::stream::StreamManager;
use crate::{tcp, udp, Error, Result};

/// How long the server waits for a handshake on a fresh control connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the server waits for the client's data connections to arrive.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time granted past the nominal duration before workers are aborted.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on what a single request may ask for.
const MAX_DURATION_SECS: u64 = 3600;
const MAX_PARALLEL: usize = 128;

/// Validated parameters of one accepted session.
#[derive(Debug, Clone)]
struct SessionPlan {
    protocol: Protocol,
    duration: Duration,
    parallel: usize,
    payload_size: usize,
}

/// Listens for clients and serves measurement sessions until cancelled.
///
/// # Examples
///
/// ```no_run
/// use netmeter::server::Server;
///
/// # async fn run() -> netmeter::Result<()> {
/// let server = Server::new(5201, None);
/// server.run().await
/// # }
/// ```
pub struct Server {
    port: u16,
    bind_addr: Option<IpAddr>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(port: u16, bind_addr: Option<IpAddr>) -> Self {
        Self {
            port,
            bind_addr,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop and any in-flight session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept loop. A failed session is logged and the loop continues; only
    /// a listener-level error or cancellation ends it.
    pub async fn run(&self) -> Result<()> {
        let bind = self.bind_host();
        let listener = TcpListener::bind((bind.as_str(), self.port)).await?;
        info!("server listening on {}:{}", bind, self.port);

        loop {
            let (control, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    return Ok(());
                }
            };
            info!("control connection from {peer}");

            if let Err(e) = self.handle_session(control).await {
                error!("session from {peer} failed: {e}");
            }
        }
    }

    async fn handle_session(&self, mut control: TcpStream) -> Result<()> {
        let request = match time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut control)).await {
            Ok(msg) => msg?,
            Err(_) => {
                return Err(Error::Timeout(
                    "client did not send a handshake in time".to_string(),
                ))
            }
        };

        let plan = match validate_request(&request) {
            Ok(plan) => plan,
            Err(reason) => {
                warn!("rejecting request: {reason}");
                write_message(&mut control, &ControlMessage::rejected(reason.clone())).await?;
                return Err(Error::Rejected(reason));
            }
        };
        info!(
            "accepted {} test: {} stream(s), {:?}",
            plan.protocol.as_str(),
            plan.parallel,
            plan.duration
        );

        let data_port = self.port.wrapping_add(1);
        let cookie: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        // The data side must exist before the client is told to connect.
        let outcomes = match plan.protocol {
            Protocol::Tcp => {
                let data_listener = TcpListener::bind((self.bind_host(), data_port)).await?;
                write_message(&mut control, &ControlMessage::accepted(data_port, cookie)).await?;
                self.receive_tcp(&plan, &data_listener).await?
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind((self.bind_host(), data_port)).await?;
                write_message(&mut control, &ControlMessage::accepted(data_port, cookie)).await?;
                udp::receive_session(
                    socket,
                    plan.parallel,
                    plan.duration,
                    Duration::from_secs(1),
                    self.cancel.clone(),
                )
                .await
            }
        };

        let streams: Vec<ReceiverStreamStats> = outcomes
            .iter()
            .map(|o| ReceiverStreamStats {
                index: o.index,
                bytes: o.bytes,
                packets_received: o.packets_received,
                packets_lost: o.packets_lost,
                jitter_ms: o.jitter_ms,
                failed: o.failed,
            })
            .collect();
        write_message(&mut control, &ControlMessage::Complete { streams }).await?;

        let total_bytes: u64 = outcomes.iter().map(|o| o.bytes).sum();
        let throughput = total_bytes as f64 * 8.0 / plan.duration.as_secs_f64();
        info!(
            "session done: {} bytes received, {:.2} Mbps",
            total_bytes,
            throughput / 1e6
        );
        Ok(())
    }

    async fn receive_tcp(
        &self,
        plan: &SessionPlan,
        listener: &TcpListener,
    ) -> Result<Vec<StreamOutcome>> {
        let manager = StreamManager::new(plan.parallel, ACCEPT_TIMEOUT);
        let handles = manager.accept_all_tcp(listener).await?;

        let pool = Arc::new(BufferPool::new(plan.payload_size, plan.parallel));
        let mut workers = Vec::with_capacity(handles.len());
        for handle in handles {
            let index = handle.index;
            let stream = handle
                .conn
                .into_tcp()
                .ok_or_else(|| Error::Protocol("expected a TCP data connection".to_string()))?;
            let pool = Arc::clone(&pool);
            let cancel = self.cancel.clone();
            let duration = plan.duration;
            let task = tokio::spawn(async move {
                tcp::receive(stream, index, duration, Duration::from_secs(1), pool, cancel).await
            });
            workers.push((index, task));
        }

        Ok(StreamManager::join_all(workers, plan.duration + JOIN_GRACE).await)
    }

    fn bind_host(&self) -> String {
        self.bind_addr
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }
}

/// Applies the same rules the client applies to its own config, plus the
/// version check only the server can make. Returns the rejection reason on
/// failure; the caller ships it back verbatim.
fn validate_request(request: &ControlMessage) -> std::result::Result<SessionPlan, String> {
    let ControlMessage::TestRequest {
        version,
        protocol,
        duration_secs,
        parallel,
        bitrate,
        payload_size,
    } = request
    else {
        return Err("expected a test request".to_string());
    };

    if *version != PROTOCOL_VERSION {
        return Err(format!(
            "protocol version mismatch: client {version}, server {PROTOCOL_VERSION}"
        ));
    }
    if *parallel < 1 {
        return Err("parallel stream count must be >= 1".to_string());
    }
    if *parallel > MAX_PARALLEL {
        return Err(format!("parallel stream count must be <= {MAX_PARALLEL}"));
    }
    if *duration_secs == 0 {
        return Err("duration must be > 0".to_string());
    }
    if *duration_secs > MAX_DURATION_SECS {
        return Err(format!("duration must be <= {MAX_DURATION_SECS}s"));
    }
    if *payload_size == 0 {
        return Err("payload size must be > 0".to_string());
    }
    match protocol {
        Protocol::Udp => {
            if bitrate.map_or(true, |b| b == 0) {
                return Err("UDP tests require a target bitrate".to_string());
            }
            if payload_size + DataPacketHeader::SIZE > 65_507 {
                return Err(format!(
                    "UDP payload of {payload_size} bytes does not fit in a datagram"
                ));
            }
        }
        Protocol::Tcp => {
            if bitrate.is_some() {
                return Err("bitrate pacing applies to UDP tests only".to_string());
            }
        }
    }

    Ok(SessionPlan {
        protocol: *protocol,
        duration: Duration::from_secs(*duration_secs),
        parallel: *parallel,
        payload_size: *payload_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(protocol: Protocol, parallel: usize, bitrate: Option<u64>) -> ControlMessage {
        ControlMessage::request(protocol, Duration::from_secs(5), parallel, bitrate, 1400)
    }

    #[test]
    fn test_validate_accepts_sane_tcp_request() {
        assert!(validate_request(&request(Protocol::Tcp, 4, None)).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_parallel() {
        let reason = validate_request(&request(Protocol::Tcp, 0, None)).unwrap_err();
        assert!(reason.contains("parallel"));
    }

    #[test]
    fn test_validate_rejects_udp_without_bitrate() {
        let reason = validate_request(&request(Protocol::Udp, 1, None)).unwrap_err();
        assert!(reason.contains("bitrate"));
    }

    #[test]
    fn test_validate_rejects_tcp_with_bitrate() {
        let reason = validate_request(&request(Protocol::Tcp, 1, Some(1_000_000))).unwrap_err();
        assert!(reason.contains("UDP"));
    }

    #[test]
    fn test_validate_rejects_version_mismatch() {
        let msg = ControlMessage::TestRequest {
            version: PROTOCOL_VERSION + 1,
            protocol: Protocol::Tcp,
            duration_secs: 5,
            parallel: 1,
            bitrate: None,
            payload_size: 1400,
        };
        let reason = validate_request(&msg).unwrap_err();
        assert!(reason.contains("version"));
    }

    #[test]
    fn test_validate_rejects_oversized_udp_payload() {
        let msg = ControlMessage::request(
            Protocol::Udp,
            Duration::from_secs(5),
            1,
            Some(1_000_000),
            66_000,
        );
        let reason = validate_request(&msg).unwrap_err();
        assert!(reason.contains("datagram"));
    }
}
