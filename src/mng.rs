//! Version-1 UDP management protocol (spec.md §6, §9).
//!
//! Out of scope as a *core* component (spec.md §1 lists the management
//! protocol among the external collaborators), but the crate still needs a
//! server side to be a runnable whole. Kept deliberately small: one bitpacked
//! header byte behind a 32-byte shared secret, two methods.
//!
//! Per spec.md §9's design note, the bitfields are explicit shifts/masks on
//! a plain integer rather than a host-struct-layout bitfield — that's the
//! whole point of the note (the original silently depends on host byte
//! order in places; this doesn't).

pub const SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GetMetrics,
    SetConfig,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Unauthorized,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub method: Method,
    pub status: Status,
}

impl Header {
    /// `type:1 (bit7) | method:4 (bits 3-6) | status:2 (bits 1-2) | reserved:1 (bit0)`.
    pub fn encode(self) -> u8 {
        let type_bit: u8 = match self.packet_type {
            PacketType::Request => 0,
            PacketType::Response => 1,
        };
        let method_bits: u8 = match self.method {
            Method::GetMetrics => 0,
            Method::SetConfig => 1,
            Method::Other(n) => n & 0b1111,
        };
        let status_bits: u8 = match self.status {
            Status::Ok => 0,
            Status::Error => 1,
            Status::Unauthorized => 2,
            Status::Unknown => 3,
        };
        (type_bit << 7) | (method_bits << 3) | (status_bits << 1)
    }

    pub fn decode(byte: u8) -> Header {
        let packet_type = if (byte >> 7) & 1 == 1 {
            PacketType::Response
        } else {
            PacketType::Request
        };
        let method = match (byte >> 3) & 0b1111 {
            0 => Method::GetMetrics,
            1 => Method::SetConfig,
            n => Method::Other(n),
        };
        let status = match (byte >> 1) & 0b11 {
            0 => Status::Ok,
            1 => Status::Error,
            2 => Status::Unauthorized,
            _ => Status::Unknown,
        };
        Header { packet_type, method, status }
    }
}

/// `secret || header_byte || payload`.
pub fn build_packet(secret: &[u8; SECRET_LEN], header: Header, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECRET_LEN + 1 + payload.len());
    out.extend_from_slice(secret);
    out.push(header.encode());
    out.extend_from_slice(payload);
    out
}

/// Validate the shared secret and split the rest into `(header, payload)`.
pub fn parse_packet<'a>(datagram: &'a [u8], expected_secret: &[u8; SECRET_LEN]) -> Option<(Header, &'a [u8])> {
    if datagram.len() < SECRET_LEN + 1 {
        return None;
    }
    let (secret, rest) = datagram.split_at(SECRET_LEN);
    if secret != expected_secret {
        return None;
    }
    let header = Header::decode(rest[0]);
    Some((header, &rest[1..]))
}

/// Encode the four `Stats` counters as the `GET_METRICS` response payload.
pub fn encode_metrics(snap: &crate::stats::StatsSnapshot) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&snap.total_connections.to_be_bytes());
    out.extend_from_slice(&snap.concurrent_connections.to_be_bytes());
    out.extend_from_slice(&snap.total_bytes_sent.to_be_bytes());
    out.extend_from_slice(&snap.total_bytes_received.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_encode_decode() {
        let h = Header {
            packet_type: PacketType::Request,
            method: Method::GetMetrics,
            status: Status::Ok,
        };
        assert_eq!(Header::decode(h.encode()), h);

        let h2 = Header {
            packet_type: PacketType::Response,
            method: Method::SetConfig,
            status: Status::Unauthorized,
        };
        assert_eq!(Header::decode(h2.encode()), h2);
    }

    #[test]
    fn packet_round_trips_with_matching_secret() {
        let secret = [7u8; SECRET_LEN];
        let h = Header {
            packet_type: PacketType::Request,
            method: Method::GetMetrics,
            status: Status::Ok,
        };
        let packet = build_packet(&secret, h, b"payload");
        let (decoded, payload) = parse_packet(&packet, &secret).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let secret = [7u8; SECRET_LEN];
        let other = [8u8; SECRET_LEN];
        let h = Header {
            packet_type: PacketType::Request,
            method: Method::GetMetrics,
            status: Status::Ok,
        };
        let packet = build_packet(&secret, h, b"");
        assert!(parse_packet(&packet, &other).is_none());
    }

    #[test]
    fn metrics_payload_is_four_big_endian_u64s() {
        let snap = crate::stats::StatsSnapshot {
            total_connections: 1,
            concurrent_connections: 2,
            total_bytes_sent: 3,
            total_bytes_received: 4,
        };
        let payload = encode_metrics(&snap);
        assert_eq!(payload.len(), 32);
        assert_eq!(&payload[0..8], &1u64.to_be_bytes());
        assert_eq!(&payload[24..32], &4u64.to_be_bytes());
    }
}
