use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Protocol;
use crate::{Error, Result};

/// Current protocol version for client-server communication.
///
/// Carried in every `TestRequest`. A server built from a different revision
/// rejects the handshake with a reason string instead of misparsing traffic.
pub const PROTOCOL_VERSION: u32 = 2;

/// Messages exchanged over the control channel.
///
/// All messages are serialized as length-prefixed JSON with a `type` field
/// discriminator, so unknown shapes fail deserialization at the boundary.
///
/// # Protocol Flow
///
/// 1. Client sends `TestRequest` with the negotiated parameters
/// 2. Server replies `TestAck` (accepted with the assigned data port, or
///    rejected with a reason)
/// 3. Client opens the data connections and traffic runs for the duration
/// 4. Server sends `Complete` carrying its receiver-side per-stream stats
///
/// # Examples
///
/// ```
/// use netmeter::protocol::ControlMessage;
/// use netmeter::config::Protocol;
/// use std::time::Duration;
///
/// let req = ControlMessage::request(
///     Protocol::Udp,
///     Duration::from_secs(10),
///     2,
///     Some(10_000_000),
///     1400,
/// );
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Initial handshake from client with test parameters
    TestRequest {
        version: u32,
        protocol: Protocol,
        duration_secs: u64,
        parallel: usize,
        /// Target bitrate in bits/sec; required iff protocol is UDP
        bitrate: Option<u64>,
        payload_size: usize,
    },

    /// Server accepted the request; data connections go to `data_port`
    Accepted { data_port: u16, cookie: String },

    /// Server rejected the request; no session was created
    Rejected { reason: String },

    /// Final receiver-side statistics, sent by the server at session end.
    ///
    /// Only the receiving end can account for UDP loss and jitter, so a
    /// sending client must collect these before finalizing its result.
    Complete { streams: Vec<ReceiverStreamStats> },
}

/// Receiver-side accounting for one stream, shipped over the control
/// channel in the `Complete` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverStreamStats {
    pub index: usize,
    pub bytes: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_ms: f64,
    /// True if the stream's worker terminated early
    pub failed: bool,
}

impl ControlMessage {
    /// Creates a `TestRequest` stamped with the current protocol version.
    pub fn request(
        protocol: Protocol,
        duration: Duration,
        parallel: usize,
        bitrate: Option<u64>,
        payload_size: usize,
    ) -> Self {
        ControlMessage::TestRequest {
            version: PROTOCOL_VERSION,
            protocol,
            duration_secs: duration.as_secs(),
            parallel,
            bitrate,
            payload_size,
        }
    }

    pub fn accepted(data_port: u16, cookie: String) -> Self {
        ControlMessage::Accepted { data_port, cookie }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        ControlMessage::Rejected {
            reason: reason.into(),
        }
    }
}

/// Serializes a control message to length-prefixed JSON bytes.
///
/// - First 4 bytes: message length as big-endian u32
/// - Remaining bytes: UTF-8 encoded JSON
///
/// # Examples
///
/// ```
/// use netmeter::protocol::{ControlMessage, serialize_message};
///
/// let msg = ControlMessage::rejected("parallel must be >= 1");
/// let bytes = serialize_message(&msg).unwrap();
/// assert!(bytes.len() > 4);
/// ```
pub fn serialize_message(msg: &ControlMessage) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Maximum accepted control-message size. Anything larger is treated as a
/// framing error rather than an allocation request.
const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Reads one length-prefixed control message from an async reader.
///
/// # Errors
///
/// Returns an error if the stream fails, the length prefix is implausible,
/// or the payload is not a known message shape.
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<ControlMessage> {
    use tokio::io::AsyncReadExt;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!(
            "implausible control message length: {len}"
        )));
    }

    let mut json_bytes = vec![0u8; len];
    reader.read_exact(&mut json_bytes).await?;

    let msg = serde_json::from_slice(&json_bytes)?;
    Ok(msg)
}

/// Writes one control message to an async writer and flushes it.
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &ControlMessage,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let bytes = serialize_message(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
