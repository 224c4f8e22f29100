//! Data-connection framing: the UDP packet header carrying stream index,
//! sequence number and send timestamp, and the short preamble that tags a
//! TCP data connection with its stream index.
//!
//! # UDP Packet Format
//!
//! ```text
//! | Magic (4) | Stream (4) | Sequence (8) | Timestamp (8) | Payload (variable) |
//! ```
//!
//! - **Magic**: 0x4e4d5452 ("NMTR" in ASCII), identifies our packets
//! - **Stream**: stream index within the session (big-endian u32)
//! - **Sequence**: per-stream monotonic packet number, starting at 0
//! - **Timestamp**: send time in microseconds since UNIX epoch
//! - **Payload**: zero-filled filler up to the configured payload size
//!
//! Sequence gaps let the receiver detect loss; the send timestamp feeds the
//! jitter estimator. Packets without the magic marker are ignored so stray
//! datagrams on the port cannot corrupt the accounting.

use std::time::{SystemTime, UNIX_EPOCH};

/// Magic marker identifying netmeter data traffic
const DATA_MAGIC: u32 = 0x4e4d5452; // "NMTR"

/// Header prepended to every UDP data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacketHeader {
    /// Stream index within the session (0..parallel)
    pub stream: u32,
    /// Per-stream sequence number, monotonic from 0
    pub sequence: u64,
    /// Send timestamp in microseconds since UNIX epoch
    pub timestamp_us: u64,
}

impl DataPacketHeader {
    /// Size of the serialized header in bytes
    pub const SIZE: usize = 24; // 4 magic + 4 stream + 8 sequence + 8 timestamp

    pub fn new(stream: u32, sequence: u64, timestamp_us: u64) -> Self {
        Self {
            stream,
            sequence,
            timestamp_us,
        }
    }

    /// Creates a header stamped with the current wall-clock time.
    pub fn with_current_time(stream: u32, sequence: u64) -> Self {
        Self::new(stream, sequence, now_micros())
    }

    /// Serializes the header (big-endian fields).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&DATA_MAGIC.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.stream.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.timestamp_us.to_be_bytes());
        bytes
    }

    /// Parses a header, returning `None` when the buffer is short or the
    /// magic marker does not match.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }

        let magic = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        if magic != DATA_MAGIC {
            return None;
        }

        Some(Self {
            stream: u32::from_be_bytes(bytes[4..8].try_into().ok()?),
            sequence: u64::from_be_bytes(bytes[8..16].try_into().ok()?),
            timestamp_us: u64::from_be_bytes(bytes[16..24].try_into().ok()?),
        })
    }
}

/// Microseconds since UNIX epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Builds a complete UDP data packet: header plus zero-filled payload.
///
/// `payload_size` excludes the header, so the wire size is
/// `DataPacketHeader::SIZE + payload_size`.
///
/// # Examples
///
/// ```
/// use netmeter::packet::{create_packet, parse_packet, DataPacketHeader};
///
/// let packet = create_packet(1, 42, 1400);
/// assert_eq!(packet.len(), DataPacketHeader::SIZE + 1400);
///
/// let (header, payload) = parse_packet(&packet).unwrap();
/// assert_eq!(header.stream, 1);
/// assert_eq!(header.sequence, 42);
/// assert_eq!(payload.len(), 1400);
/// ```
pub fn create_packet(stream: u32, sequence: u64, payload_size: usize) -> Vec<u8> {
    let header = DataPacketHeader::with_current_time(stream, sequence);
    let mut packet = Vec::with_capacity(DataPacketHeader::SIZE + payload_size);
    packet.extend_from_slice(&header.to_bytes());
    packet.resize(DataPacketHeader::SIZE + payload_size, 0);
    packet
}

/// Splits a received datagram into header and payload.
pub fn parse_packet(packet: &[u8]) -> Option<(DataPacketHeader, &[u8])> {
    let header = DataPacketHeader::from_bytes(packet)?;
    Some((header, &packet[DataPacketHeader::SIZE..]))
}

/// Length of the preamble sent as the first bytes of a TCP data connection.
pub const TCP_PREAMBLE_SIZE: usize = 8;

/// Encodes the TCP stream preamble: magic plus stream index.
pub fn encode_tcp_preamble(stream: u32) -> [u8; TCP_PREAMBLE_SIZE] {
    let mut bytes = [0u8; TCP_PREAMBLE_SIZE];
    bytes[0..4].copy_from_slice(&DATA_MAGIC.to_be_bytes());
    bytes[4..8].copy_from_slice(&stream.to_be_bytes());
    bytes
}

/// Decodes a TCP stream preamble, returning the stream index.
pub fn decode_tcp_preamble(bytes: &[u8; TCP_PREAMBLE_SIZE]) -> Option<u32> {
    let magic = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
    if magic != DATA_MAGIC {
        return None;
    }
    Some(u32::from_be_bytes(bytes[4..8].try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_serialization() {
        let header = DataPacketHeader::new(3, 42, 1234567890);
        let bytes = header.to_bytes();
        let parsed = DataPacketHeader::from_bytes(&bytes).expect("failed to parse header");

        assert_eq!(parsed.stream, 3);
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.timestamp_us, 1234567890);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = [0u8; DataPacketHeader::SIZE];
        bytes[0..4].copy_from_slice(&0x12345678u32.to_be_bytes());
        assert!(DataPacketHeader::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_packet_creation() {
        let packet = create_packet(0, 100, 1024);
        assert_eq!(packet.len(), DataPacketHeader::SIZE + 1024);

        let (header, payload) = parse_packet(&packet).expect("failed to parse packet");
        assert_eq!(header.sequence, 100);
        assert_eq!(payload.len(), 1024);
        assert!(payload.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_packet() {
        let short = vec![0u8; 10];
        assert!(parse_packet(&short).is_none());
    }

    #[test]
    fn test_tcp_preamble_roundtrip() {
        let bytes = encode_tcp_preamble(7);
        assert_eq!(decode_tcp_preamble(&bytes), Some(7));
    }

    #[test]
    fn test_tcp_preamble_bad_magic() {
        let bytes = [0u8; TCP_PREAMBLE_SIZE];
        assert_eq!(decode_tcp_preamble(&bytes), None);
    }
}
