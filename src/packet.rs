//! Wire format for the two protocol frames.
//!
//! Everything is big-endian and bit-packed: a Hello is a fixed 12-byte frame
//! carrying the sender's outbound link measurements, an Update is a 4-byte
//! header followed by 20-byte route entries. The checksum is the 16-bit
//! one's-complement sum over the whole frame with the checksum field zeroed.

use crate::error::ParseError;
use crate::metric::LinkMetrics;
use crate::Prefix;
use std::net::Ipv4Addr;

pub const PROTOCOL_VERSION: u8 = 1;
pub const DEFAULT_MTU: usize = 1500;

pub const HELLO_LEN: usize = 12;
pub const UPDATE_HEADER_LEN: usize = 4;
pub const ROUTE_ENTRY_LEN: usize = 20;

/// Largest number of route entries that fit one frame under the default MTU.
pub const MAX_ENTRIES_PER_UPDATE: usize = (DEFAULT_MTU - UPDATE_HEADER_LEN) / ROUTE_ENTRY_LEN;

const OPCODE_HELLO: u8 = 1;
const OPCODE_UPDATE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Hello(Hello),
    Update(Update),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub metrics: LinkMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub entries: Vec<RouteEntry>,
}

/// Role of a route entry within the diffusing computation, carried in the
/// first byte of the entry's reserved field. Plain updates advertise, queries
/// open a diffusing computation, replies answer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Update,
    Query,
    Reply,
}

impl EntryKind {
    fn to_wire(self) -> u8 {
        match self {
            EntryKind::Update => 0,
            EntryKind::Query => 1,
            EntryKind::Reply => 2,
        }
    }

    fn from_wire(byte: u8) -> Self {
        match byte {
            1 => EntryKind::Query,
            2 => EntryKind::Reply,
            _ => EntryKind::Update,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub kind: EntryKind,
    pub prefix: Prefix,
    pub metrics: LinkMetrics,
    /// Composite distance the sender reports for the prefix; all-ones
    /// withdraws it.
    pub reported_distance: u32,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Hello(hello) => hello.encode(),
            Packet::Update(update) => update.encode(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, ParseError> {
        Packet::decode_with_mtu(bytes, DEFAULT_MTU)
    }

    pub fn decode_with_mtu(bytes: &[u8], mtu: usize) -> Result<Packet, ParseError> {
        if bytes.len() > mtu {
            return Err(ParseError::MtuExceeded(bytes.len()));
        }
        if bytes.len() < UPDATE_HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        let version = bytes[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }
        match bytes[0] & 0x0f {
            OPCODE_HELLO => Hello::decode(bytes).map(Packet::Hello),
            OPCODE_UPDATE => Update::decode(bytes).map(Packet::Update),
            opcode => Err(ParseError::UnknownOpCode(opcode)),
        }
    }
}

impl Hello {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HELLO_LEN];
        buf[0] = (PROTOCOL_VERSION << 4) | OPCODE_HELLO;
        buf[2..4].copy_from_slice(&self.metrics.delay_us.to_be_bytes());
        buf[4..6].copy_from_slice(&self.metrics.jitter_us.to_be_bytes());
        buf[6] = self.metrics.loss_permille;
        buf[7] = self.metrics.congestion_pct;
        buf[8..10].copy_from_slice(&self.metrics.stability.to_be_bytes());
        let sum = checksum(&buf);
        buf[10..12].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Hello, ParseError> {
        if bytes.len() != HELLO_LEN {
            return Err(ParseError::Truncated);
        }
        verify_checksum(bytes, 10)?;
        Ok(Hello {
            metrics: LinkMetrics {
                delay_us: u16::from_be_bytes([bytes[2], bytes[3]]),
                jitter_us: u16::from_be_bytes([bytes[4], bytes[5]]),
                loss_permille: bytes[6],
                congestion_pct: bytes[7],
                stability: u16::from_be_bytes([bytes[8], bytes[9]]),
            },
        })
    }
}

impl Update {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; UPDATE_HEADER_LEN + self.entries.len() * ROUTE_ENTRY_LEN];
        buf[0] = (PROTOCOL_VERSION << 4) | OPCODE_UPDATE;
        for (i, entry) in self.entries.iter().enumerate() {
            let at = UPDATE_HEADER_LEN + i * ROUTE_ENTRY_LEN;
            let e = &mut buf[at..at + ROUTE_ENTRY_LEN];
            e[0] = entry.prefix.prefix();
            e[1] = entry.kind.to_wire();
            e[4..8].copy_from_slice(&entry.prefix.ip().octets());
            e[8..10].copy_from_slice(&entry.metrics.delay_us.to_be_bytes());
            e[10..12].copy_from_slice(&entry.metrics.jitter_us.to_be_bytes());
            e[12] = entry.metrics.loss_permille;
            e[13] = entry.metrics.congestion_pct;
            e[14..16].copy_from_slice(&entry.metrics.stability.to_be_bytes());
            e[16..20].copy_from_slice(&entry.reported_distance.to_be_bytes());
        }
        let sum = checksum(&buf);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Update, ParseError> {
        if (bytes.len() - UPDATE_HEADER_LEN) % ROUTE_ENTRY_LEN != 0 {
            return Err(ParseError::Truncated);
        }
        verify_checksum(bytes, 2)?;
        let mut entries = Vec::with_capacity((bytes.len() - UPDATE_HEADER_LEN) / ROUTE_ENTRY_LEN);
        for e in bytes[UPDATE_HEADER_LEN..].chunks_exact(ROUTE_ENTRY_LEN) {
            let prefix_len = e[0];
            if prefix_len > 32 {
                return Err(ParseError::Truncated);
            }
            let address = Ipv4Addr::new(e[4], e[5], e[6], e[7]);
            let prefix =
                Prefix::new(address, prefix_len).map_err(|_| ParseError::Truncated)?;
            entries.push(RouteEntry {
                kind: EntryKind::from_wire(e[1]),
                prefix,
                metrics: LinkMetrics {
                    delay_us: u16::from_be_bytes([e[8], e[9]]),
                    jitter_us: u16::from_be_bytes([e[10], e[11]]),
                    loss_permille: e[12],
                    congestion_pct: e[13],
                    stability: u16::from_be_bytes([e[14], e[15]]),
                },
                reported_distance: u32::from_be_bytes([e[16], e[17], e[18], e[19]]),
            });
        }
        Ok(Update { entries })
    }
}

/// 16-bit one's-complement sum of the 16-bit big-endian words of `frame`.
fn checksum(frame: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = frame.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn verify_checksum(bytes: &[u8], field: usize) -> Result<(), ParseError> {
    let stored = u16::from_be_bytes([bytes[field], bytes[field + 1]]);
    let mut scratch = bytes.to_vec();
    scratch[field] = 0;
    scratch[field + 1] = 0;
    if checksum(&scratch) != stored {
        return Err(ParseError::BadChecksum);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::INFINITY;

    fn sample_metrics() -> LinkMetrics {
        LinkMetrics::new(1000, 10, 2, 7, 100)
    }

    fn sample_update() -> Update {
        Update {
            entries: vec![
                RouteEntry {
                    kind: EntryKind::Update,
                    prefix: "192.168.3.0/24".parse().unwrap(),
                    metrics: sample_metrics(),
                    reported_distance: 1990,
                },
                RouteEntry {
                    kind: EntryKind::Query,
                    prefix: "10.0.7.0/24".parse().unwrap(),
                    metrics: LinkMetrics::default(),
                    reported_distance: INFINITY,
                },
            ],
        }
    }

    #[test]
    fn hello_roundtrip() {
        let packet = Packet::Hello(Hello {
            metrics: sample_metrics(),
        });
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HELLO_LEN);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn update_roundtrip() {
        let packet = Packet::Update(sample_update());
        let bytes = packet.encode();
        assert_eq!(bytes.len(), UPDATE_HEADER_LEN + 2 * ROUTE_ENTRY_LEN);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn empty_update_roundtrip() {
        let packet = Packet::Update(Update { entries: vec![] });
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut bytes = Packet::Hello(Hello {
            metrics: sample_metrics(),
        })
        .encode();
        bytes[5] ^= 0x01;
        assert_eq!(Packet::decode(&bytes), Err(ParseError::BadChecksum));
    }

    #[test]
    fn update_payload_corruption_fails_checksum() {
        let mut bytes = Packet::Update(sample_update()).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        assert_eq!(Packet::decode(&bytes), Err(ParseError::BadChecksum));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = Packet::Hello(Hello {
            metrics: sample_metrics(),
        })
        .encode();
        bytes[0] = (2 << 4) | OPCODE_HELLO;
        assert_eq!(Packet::decode(&bytes), Err(ParseError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bytes = Packet::Update(Update { entries: vec![] }).encode();
        bytes[0] = (PROTOCOL_VERSION << 4) | 5;
        assert_eq!(Packet::decode(&bytes), Err(ParseError::UnknownOpCode(5)));
    }

    #[test]
    fn rejects_short_hello() {
        let bytes = Packet::Hello(Hello {
            metrics: sample_metrics(),
        })
        .encode();
        assert_eq!(Packet::decode(&bytes[..11]), Err(ParseError::Truncated));
    }

    #[test]
    fn rejects_partial_route_entry() {
        let bytes = Packet::Update(sample_update()).encode();
        assert_eq!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(ParseError::Truncated)
        );
    }

    #[test]
    fn rejects_oversized_frame() {
        let bytes = vec![0u8; DEFAULT_MTU + 1];
        assert_eq!(
            Packet::decode(&bytes),
            Err(ParseError::MtuExceeded(DEFAULT_MTU + 1))
        );
    }

    #[test]
    fn rejects_bad_prefix_length() {
        let mut bytes = Packet::Update(sample_update()).encode();
        bytes[UPDATE_HEADER_LEN] = 33;
        // re-stamp the checksum so only the prefix length is at fault
        bytes[2] = 0;
        bytes[3] = 0;
        let sum = checksum(&bytes);
        bytes[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(Packet::decode(&bytes), Err(ParseError::Truncated));
    }

    #[test]
    fn encoded_frames_verify() {
        for packet in [
            Packet::Hello(Hello {
                metrics: sample_metrics(),
            }),
            Packet::Update(sample_update()),
        ] {
            let bytes = packet.encode();
            let field = match packet {
                Packet::Hello(_) => 10,
                Packet::Update(_) => 2,
            };
            assert!(verify_checksum(&bytes, field).is_ok());
        }
    }
}
