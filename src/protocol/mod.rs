//! Wire format of the SA-MP server query.
//!
//! A query is `"SAMP"` followed by the four IPv4 octets, the port (u16 LE) and an
//! opcode byte. Replies echo that 11-byte header before the opcode payload.

use std::net::Ipv4Addr;

use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"SAMP";
pub const HEADER_LEN: usize = 11;
/// Basic server information (hostname, player counts, password flag).
pub const OPCODE_INFO: u8 = b'i';

const INFO_FIXED_LEN: usize = HEADER_LEN + 1 + 2 + 2 + 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid IPv4 address: {0:?}")]
    InvalidAddress(String),
    #[error("packet too short: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },
    #[error("packet does not start with the SAMP magic")]
    BadMagic,
    #[error("hostname length {declared} overruns packet ({available} bytes left)")]
    HostnameOverrun { declared: usize, available: usize },
}

/// The echoed query header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryHeader {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub opcode: u8,
}

/// Payload of an `'i'` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoReply {
    pub passworded: bool,
    pub players: u16,
    pub max_players: u16,
    pub hostname: String,
}

/// Parse a strict dotted IPv4 literal: exactly four decimal octets in 0..=255.
pub fn parse_ipv4(ip: &str) -> Result<[u8; 4], ProtocolError> {
    let invalid = || ProtocolError::InvalidAddress(ip.to_owned());
    let mut octets = [0u8; 4];
    let mut parts = ip.trim().split('.');
    for slot in octets.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *slot = part.parse::<u8>().map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(octets)
}

pub fn encode_query(ip: &str, port: u16, opcode: u8) -> Result<Vec<u8>, ProtocolError> {
    let octets = parse_ipv4(ip)?;
    let mut packet = Vec::with_capacity(HEADER_LEN);
    packet.extend_from_slice(MAGIC);
    packet.extend_from_slice(&octets);
    packet.extend_from_slice(&port.to_le_bytes());
    packet.push(opcode);
    Ok(packet)
}

pub fn decode_header(packet: &[u8]) -> Result<QueryHeader, ProtocolError> {
    if packet.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            len: packet.len(),
            needed: HEADER_LEN,
        });
    }
    if &packet[..4] != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    Ok(QueryHeader {
        ip: Ipv4Addr::new(packet[4], packet[5], packet[6], packet[7]),
        port: u16::from_le_bytes([packet[8], packet[9]]),
        opcode: packet[10],
    })
}

/// Decode an `'i'` reply at its fixed offsets. The header bytes are not validated;
/// servers behind proxies are known to rewrite them.
pub fn decode_info(packet: &[u8]) -> Result<InfoReply, ProtocolError> {
    if packet.len() < INFO_FIXED_LEN {
        return Err(ProtocolError::Truncated {
            len: packet.len(),
            needed: INFO_FIXED_LEN,
        });
    }
    let passworded = packet[11] != 0;
    let players = u16::from_le_bytes([packet[12], packet[13]]);
    let max_players = u16::from_le_bytes([packet[14], packet[15]]);
    let declared = u32::from_le_bytes([packet[16], packet[17], packet[18], packet[19]]) as usize;
    let available = packet.len() - INFO_FIXED_LEN;
    if declared > available {
        return Err(ProtocolError::HostnameOverrun {
            declared,
            available,
        });
    }
    let raw = &packet[INFO_FIXED_LEN..INFO_FIXED_LEN + declared];
    let hostname = String::from_utf8_lossy(raw).trim().to_owned();
    Ok(InfoReply {
        passworded,
        players,
        max_players,
        hostname,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::info_packet;

    #[test]
    fn encodes_literal_octets_and_le_port() {
        let packet = encode_query("192.168.1.20", 7777, OPCODE_INFO).unwrap();
        assert_eq!(
            packet,
            vec![b'S', b'A', b'M', b'P', 192, 168, 1, 20, 0x61, 0x1e, b'i']
        );
    }

    #[test]
    fn header_round_trips() {
        let samples = [
            ("0.0.0.0", 0u16, b'i'),
            ("255.255.255.255", u16::MAX, b'p'),
            ("10.0.12.7", 7777, b'c'),
            ("1.2.3.4", 256, b'r'),
        ];
        for (ip, port, opcode) in samples {
            let packet = encode_query(ip, port, opcode).unwrap();
            let header = decode_header(&packet).unwrap();
            assert_eq!(header.ip.to_string(), ip);
            assert_eq!(header.port, port);
            assert_eq!(header.opcode, opcode);
        }
    }

    #[test]
    fn rejects_non_ipv4_addresses() {
        for ip in ["", "1.2.3", "1.2.3.4.5", "256.0.0.1", "a.b.c.d", "1..2.3", "-1.2.3.4", "::1"] {
            assert_eq!(
                encode_query(ip, 7777, OPCODE_INFO),
                Err(ProtocolError::InvalidAddress(ip.to_owned())),
                "{ip}"
            );
        }
    }

    #[test]
    fn decodes_info_reply() {
        let reply = decode_info(&info_packet(12, 100, b"  My Server  ")).unwrap();
        assert!(reply.passworded);
        assert_eq!(reply.players, 12);
        assert_eq!(reply.max_players, 100);
        assert_eq!(reply.hostname, "My Server");
    }

    #[test]
    fn short_replies_are_truncated() {
        let full = info_packet(1, 2, b"x");
        for len in 0..20 {
            assert!(matches!(
                decode_info(&full[..len]),
                Err(ProtocolError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn hostname_overrun_is_reported() {
        let mut packet = info_packet(1, 2, b"abc");
        packet.truncate(packet.len() - 1);
        assert_eq!(
            decode_info(&packet),
            Err(ProtocolError::HostnameOverrun {
                declared: 3,
                available: 2
            })
        );
    }

    #[test]
    fn invalid_utf8_hostname_is_lossy() {
        let reply = decode_info(&info_packet(0, 0, &[b'o', 0xff, b'k'])).unwrap();
        assert_eq!(reply.hostname, "o\u{fffd}k");
    }
}
