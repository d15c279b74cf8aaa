//! RIP response decoding (RFC 2453 wire format)
//!
//! A datagram is parsed into a [`RipPacket`] in full before any entry is
//! applied, so a malformed datagram never leaves the trie half-updated.
//!
//! ## Wire format
//!
//! | Field | Size |
//! |-------|------|
//! | command | 1 |
//! | version | 1 |
//! | must be zero | 2 |
//! | entries | 20 each |
//!
//! Each entry starts with a 2-byte address family. Family 2 (IPv4) is
//! followed by route tag (2), address (4), mask (4), next hop (4) and
//! metric (4). Family `0xFFFF` marks an authentication entry: auth type (2)
//! and 16 opaque bytes. All fields are big-endian.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Wire format validation before use
//! - AU-12: Audit Record Generation - Route change notifications

use crate::address::{is_contiguous, mask_len, to_dotted};
use crate::trie::{POISON, RoutingTrie};
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

/// Well-known RIP port
pub const RIP_PORT: u16 = 520;

/// RIPv2 multicast group (RIP2-ROUTERS.MCAST.NET)
pub const RIP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 9);

// RIP commands
pub const COMMAND_REQUEST: u8 = 1;
pub const COMMAND_RESPONSE: u8 = 2;

// Address families
pub const FAMILY_IPV4: u16 = 2;
pub const FAMILY_AUTH: u16 = 0xFFFF;

/// Header length in bytes
pub const HEADER_LEN: usize = 4;

/// Entry length following the 2-byte family tag
pub const ENTRY_BODY_LEN: usize = 18;

/// Full entry length, family tag included
pub const ENTRY_LEN: usize = 2 + ENTRY_BODY_LEN;

/// Decoder errors. The offending datagram is dropped as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RipError {
    /// Fewer bytes left than the structure at `offset` requires
    #[error("truncated message at offset {offset}: need {needed} bytes, {remaining} remain")]
    TruncatedMessage {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    /// A record that cannot be interpreted
    #[error("malformed record at offset {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, RipError>;

/// One IPv4 route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub route_tag: u16,
    pub address: u32,
    pub mask: u32,
    pub next_hop: u32,
    pub metric: u32,
}

impl RouteEntry {
    fn decode(body: &[u8]) -> Self {
        Self {
            route_tag: BigEndian::read_u16(&body[0..2]),
            address: BigEndian::read_u32(&body[2..6]),
            mask: BigEndian::read_u32(&body[6..10]),
            next_hop: BigEndian::read_u32(&body[10..14]),
            metric: BigEndian::read_u32(&body[14..18]),
        }
    }
}

/// A fully validated RIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RipPacket {
    pub command: u8,
    pub version: u8,
    /// IPv4 route entries in wire order
    pub entries: Vec<RouteEntry>,
    /// Number of authentication entries skipped
    pub auth_entries: usize,
    /// Number of entries of other families skipped
    pub skipped_entries: usize,
}

impl RipPacket {
    /// Parse and validate a whole datagram.
    ///
    /// Only responses carry routes; other commands parse to a packet with no
    /// entries and their body is not inspected.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(RipError::TruncatedMessage {
                offset: 0,
                needed: HEADER_LEN,
                remaining: buf.len(),
            });
        }

        let mut packet = RipPacket {
            command: buf[0],
            version: buf[1],
            entries: Vec::new(),
            auth_entries: 0,
            skipped_entries: 0,
        };
        if packet.command != COMMAND_RESPONSE {
            return Ok(packet);
        }

        let mut offset = HEADER_LEN;
        while offset < buf.len() {
            let remaining = buf.len() - offset;
            if remaining < 2 {
                return Err(RipError::TruncatedMessage {
                    offset,
                    needed: 2,
                    remaining,
                });
            }
            let family = BigEndian::read_u16(&buf[offset..offset + 2]);
            offset += 2;

            let body = &buf[offset..];
            if body.len() < ENTRY_BODY_LEN {
                return Err(match family {
                    FAMILY_IPV4 => RipError::TruncatedMessage {
                        offset,
                        needed: ENTRY_BODY_LEN,
                        remaining: body.len(),
                    },
                    FAMILY_AUTH => RipError::MalformedRecord {
                        offset,
                        reason: format!("authentication entry cut short ({} bytes)", body.len()),
                    },
                    other => RipError::MalformedRecord {
                        offset,
                        reason: format!("family {} entry cut short ({} bytes)", other, body.len()),
                    },
                });
            }

            match family {
                FAMILY_IPV4 => {
                    let entry = RouteEntry::decode(&body[..ENTRY_BODY_LEN]);
                    if !is_contiguous(entry.mask) {
                        return Err(RipError::MalformedRecord {
                            offset,
                            reason: format!("non-contiguous mask {}", to_dotted(entry.mask)),
                        });
                    }
                    packet.entries.push(entry);
                }
                FAMILY_AUTH => packet.auth_entries += 1,
                _ => packet.skipped_entries += 1,
            }
            offset += ENTRY_BODY_LEN;
        }

        Ok(packet)
    }
}

/// A route whose stored metric changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteChange {
    pub address: Ipv4Addr,
    pub prefix_len: u32,
    pub metric: u32,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for RouteChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = format!("{}/{}", self.address, self.prefix_len);
        write!(
            f,
            "{}\t{:<19}\t{:>2}",
            self.timestamp.to_rfc3339(),
            prefix,
            self.metric
        )
    }
}

/// Apply every entry of a validated packet to the trie.
pub fn apply(trie: &RoutingTrie, packet: &RipPacket) -> Vec<RouteChange> {
    apply_at(trie, packet, Instant::now())
}

pub fn apply_at(trie: &RoutingTrie, packet: &RipPacket, now: Instant) -> Vec<RouteChange> {
    let mut changes = Vec::new();
    for entry in &packet.entries {
        if entry.metric == 0 || entry.metric > POISON {
            warn!(
                address = %to_dotted(entry.address),
                prefix_len = mask_len(entry.mask),
                metric = entry.metric,
                "Route advertised with out-of-range metric"
            );
        }
        if trie.set_at(entry.address, entry.mask, entry.metric, now) {
            changes.push(RouteChange {
                address: Ipv4Addr::from(entry.address),
                prefix_len: mask_len(entry.mask),
                metric: entry.metric,
                timestamp: Utc::now(),
            });
        }
    }
    changes
}

/// Parse a datagram and apply it to the trie.
pub fn decode(trie: &RoutingTrie, buf: &[u8]) -> Result<Vec<RouteChange>> {
    let packet = RipPacket::parse(buf)?;
    Ok(apply(trie, &packet))
}

/// Builds RIPv2 response datagrams.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    buf: Vec<u8>,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new(2)
    }
}

impl ResponseBuilder {
    pub fn new(version: u8) -> Self {
        Self {
            buf: vec![COMMAND_RESPONSE, version, 0, 0],
        }
    }

    pub fn route(mut self, address: u32, mask: u32, metric: u32) -> Self {
        let mut entry = [0u8; ENTRY_LEN];
        BigEndian::write_u16(&mut entry[0..2], FAMILY_IPV4);
        BigEndian::write_u32(&mut entry[4..8], address);
        BigEndian::write_u32(&mut entry[8..12], mask);
        BigEndian::write_u32(&mut entry[16..20], metric);
        self.buf.extend_from_slice(&entry);
        self
    }

    pub fn auth(mut self, auth_type: u16, credential: &[u8; 16]) -> Self {
        let mut entry = [0u8; ENTRY_LEN];
        BigEndian::write_u16(&mut entry[0..2], FAMILY_AUTH);
        BigEndian::write_u16(&mut entry[2..4], auth_type);
        entry[4..].copy_from_slice(credential);
        self.buf.extend_from_slice(&entry);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{mask_from_len, parse_dotted};
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> u32 {
        parse_dotted(s).unwrap()
    }

    #[test]
    fn test_parse_response() {
        let buf = ResponseBuilder::new(2)
            .auth(2, b"simple-password\0")
            .route(ip("10.0.0.0"), mask_from_len(8), 5)
            .route(ip("10.16.0.0"), mask_from_len(16), 8)
            .build();

        let packet = RipPacket::parse(&buf).unwrap();
        assert_eq!(packet.command, COMMAND_RESPONSE);
        assert_eq!(packet.version, 2);
        assert_eq!(packet.auth_entries, 1);
        assert_eq!(
            packet.entries,
            vec![
                RouteEntry {
                    route_tag: 0,
                    address: ip("10.0.0.0"),
                    mask: mask_from_len(8),
                    next_hop: 0,
                    metric: 5,
                },
                RouteEntry {
                    route_tag: 0,
                    address: ip("10.16.0.0"),
                    mask: mask_from_len(16),
                    next_hop: 0,
                    metric: 8,
                },
            ]
        );
    }

    #[test]
    fn test_decode_reports_changes() {
        let trie = RoutingTrie::new();
        let buf = ResponseBuilder::default()
            .route(ip("192.0.2.0"), mask_from_len(24), 3)
            .build();

        let changes = decode(&trie, &buf).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].address, Ipv4Addr::new(192, 0, 2, 0));
        assert_eq!(changes[0].prefix_len, 24);
        assert_eq!(changes[0].metric, 3);

        // periodic re-advertisement
        assert!(decode(&trie, &buf).unwrap().is_empty());
        assert_eq!(trie.find(ip("192.0.2.77")).metric(), Some(3));
    }

    #[test]
    fn test_request_is_ignored() {
        let trie = RoutingTrie::new();
        let mut buf = ResponseBuilder::default()
            .route(ip("192.0.2.0"), mask_from_len(24), 3)
            .build();
        buf[0] = COMMAND_REQUEST;

        let packet = RipPacket::parse(&buf).unwrap();
        assert!(packet.entries.is_empty());
        assert!(decode(&trie, &buf).unwrap().is_empty());
        assert_eq!(trie.population(), 0.0);
    }

    #[test]
    fn test_short_header() {
        assert_eq!(
            RipPacket::parse(&[2, 2, 0]).unwrap_err(),
            RipError::TruncatedMessage {
                offset: 0,
                needed: HEADER_LEN,
                remaining: 3
            }
        );
    }

    #[test]
    fn test_truncated_record_leaves_trie_unchanged() {
        let trie = RoutingTrie::new();
        let mut buf = ResponseBuilder::default()
            .route(ip("10.0.0.0"), mask_from_len(8), 5)
            .route(ip("172.16.0.0"), mask_from_len(12), 2)
            .build();
        buf.truncate(buf.len() - 10);

        let err = decode(&trie, &buf).unwrap_err();
        assert_eq!(
            err,
            RipError::TruncatedMessage {
                offset: HEADER_LEN + ENTRY_LEN + 2,
                needed: ENTRY_BODY_LEN,
                remaining: 8
            }
        );
        // the intact first entry was not applied either
        assert_eq!(trie.population(), 0.0);
        assert_eq!(trie.node_count(), 1);
    }

    #[test]
    fn test_truncated_auth_is_malformed() {
        let mut buf = ResponseBuilder::default().auth(2, &[0u8; 16]).build();
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            RipPacket::parse(&buf),
            Err(RipError::MalformedRecord { offset: 6, .. })
        ));
    }

    #[test]
    fn test_unknown_family_is_skipped() {
        let mut buf = ResponseBuilder::default()
            .route(ip("10.0.0.0"), mask_from_len(8), 5)
            .route(ip("10.1.0.0"), mask_from_len(16), 6)
            .build();
        // rewrite the first entry's family tag
        buf[HEADER_LEN + 1] = 7;

        let packet = RipPacket::parse(&buf).unwrap();
        assert_eq!(packet.skipped_entries, 1);
        assert_eq!(packet.entries.len(), 1);
        assert_eq!(packet.entries[0].address, ip("10.1.0.0"));
    }

    #[test]
    fn test_non_contiguous_mask_is_malformed() {
        let buf = ResponseBuilder::default()
            .route(ip("10.0.0.0"), 0xFF00_FF00, 5)
            .build();
        let err = RipPacket::parse(&buf).unwrap_err();
        assert!(err.to_string().contains("non-contiguous mask 255.0.255.0"));
    }

    #[test]
    fn test_out_of_range_metric_still_applied() {
        let trie = RoutingTrie::new();
        let buf = ResponseBuilder::default()
            .route(ip("198.51.100.0"), mask_from_len(24), 0)
            .build();
        let changes = decode(&trie, &buf).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(trie.find(ip("198.51.100.1")).metric(), Some(0));
    }

    #[test]
    fn test_route_change_display() {
        let change = RouteChange {
            address: Ipv4Addr::new(10, 16, 0, 0),
            prefix_len: 16,
            metric: 8,
            timestamp: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_eq!(
            change.to_string(),
            "2024-01-01T00:00:00+00:00\t10.16.0.0/16       \t 8"
        );
    }
}
