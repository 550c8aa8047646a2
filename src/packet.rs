//! ICMP message construction and reply classification
//!
//! Echo Requests are built with `pnet`; replies are classified by ICMP type
//! and reduced to the `(identifier, sequence)` pair the probe engines
//! correlate on. For error messages the pair is recovered from the embedded
//! original datagram at fixed big-endian offsets.

use crate::trace::error::ProbeError;
use pnet::packet::icmp::{echo_reply, echo_request, IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{
    echo_reply as echo_reply_v6, echo_request as echo_request_v6, Icmpv6Code, Icmpv6Packet,
    Icmpv6Types,
};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use pnet::util::checksum as pnet_checksum;

/// A received ICMP message reduced to what correlation needs.
///
/// `id` and `seq` identify the probe that elicited the message: taken from
/// the echo body for replies, and from the embedded original datagram for
/// Time Exceeded. Destination Unreachable is read echo-body style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IcmpResponse {
    EchoReply { id: u16, seq: u16 },
    TimeExceeded { id: u16, seq: u16 },
    Unreachable { id: u16, seq: u16 },
    Other,
}

/// Offset of the embedded identifier inside an IPv4 error payload:
/// 20-byte original IP header + 4 bytes into the original ICMP header.
const V4_EMBEDDED_ID: usize = 24;
/// Offset of the embedded identifier inside an IPv6 error payload:
/// 40-byte original IPv6 header + 4 bytes into the original ICMP header.
const V6_EMBEDDED_ID: usize = 44;
/// Offset of the embedded sequence, both families.
const EMBEDDED_SEQ: usize = 26;

/// Build an ICMPv4 Echo Request with code 0 and a computed checksum.
pub(crate) fn build_echo_v4(id: u16, seq: u16, payload: &[u8]) -> Result<Vec<u8>, ProbeError> {
    let mut buf = vec![0u8; echo_request::MutableEchoRequestPacket::minimum_packet_size() + payload.len()];
    let mut echo = echo_request::MutableEchoRequestPacket::new(&mut buf)
        .ok_or_else(|| ProbeError::Encode("echo request buffer too small".to_string()))?;
    echo.set_icmp_type(IcmpTypes::EchoRequest);
    echo.set_icmp_code(IcmpCode(0));
    echo.set_identifier(id);
    echo.set_sequence_number(seq);
    echo.set_payload(payload);
    let checksum = pnet_checksum(echo.packet(), 1);
    echo.set_checksum(checksum);
    Ok(buf)
}

/// Build an ICMPv6 Echo Request with code 0.
///
/// The checksum is left zero: it covers an IPv6 pseudo-header and the
/// kernel fills it on raw ICMPv6 sockets.
pub(crate) fn build_echo_v6(id: u16, seq: u16, payload: &[u8]) -> Result<Vec<u8>, ProbeError> {
    let mut buf =
        vec![0u8; echo_request_v6::MutableEchoRequestPacket::minimum_packet_size() + payload.len()];
    let mut echo = echo_request_v6::MutableEchoRequestPacket::new(&mut buf)
        .ok_or_else(|| ProbeError::Encode("echo request buffer too small".to_string()))?;
    echo.set_icmpv6_type(Icmpv6Types::EchoRequest);
    echo.set_icmpv6_code(Icmpv6Code(0));
    echo.set_identifier(id);
    echo.set_sequence_number(seq);
    echo.set_payload(payload);
    Ok(buf)
}

/// Classify an IPv4 datagram as read from a raw ICMP socket.
///
/// Raw IPv4 reads include the IP header; it is stripped here. Returns
/// `None` for datagrams too short to carry an ICMP message.
pub(crate) fn parse_reply_v4(datagram: &[u8]) -> Option<IcmpResponse> {
    let ip = Ipv4Packet::new(datagram)?;
    parse_icmp_v4(ip.payload())
}

fn parse_icmp_v4(msg: &[u8]) -> Option<IcmpResponse> {
    let icmp = IcmpPacket::new(msg)?;
    match icmp.get_icmp_type() {
        IcmpTypes::EchoReply => {
            let echo = echo_reply::EchoReplyPacket::new(msg)?;
            Some(IcmpResponse::EchoReply {
                id: echo.get_identifier(),
                seq: echo.get_sequence_number(),
            })
        }
        IcmpTypes::TimeExceeded => {
            let data = msg.get(8..)?;
            // a payload too short to carry the embedded echo header cannot
            // be correlated; it is skipped, not treated as malformed
            match (be16(data, V4_EMBEDDED_ID), be16(data, EMBEDDED_SEQ)) {
                (Some(id), Some(seq)) => Some(IcmpResponse::TimeExceeded { id, seq }),
                _ => Some(IcmpResponse::Other),
            }
        }
        IcmpTypes::DestinationUnreachable => match (be16(msg, 4), be16(msg, 6)) {
            (Some(id), Some(seq)) => Some(IcmpResponse::Unreachable { id, seq }),
            _ => Some(IcmpResponse::Other),
        },
        _ => Some(IcmpResponse::Other),
    }
}

/// Classify an ICMPv6 message as read from a raw ICMPv6 socket.
///
/// ICMPv6 raw reads carry no IP header.
pub(crate) fn parse_reply_v6(msg: &[u8]) -> Option<IcmpResponse> {
    let icmp = Icmpv6Packet::new(msg)?;
    match icmp.get_icmpv6_type() {
        Icmpv6Types::EchoReply => {
            let echo = echo_reply_v6::EchoReplyPacket::new(msg)?;
            Some(IcmpResponse::EchoReply {
                id: echo.get_identifier(),
                seq: echo.get_sequence_number(),
            })
        }
        Icmpv6Types::TimeExceeded => {
            let data = msg.get(8..)?;
            // the sequence is read at the IPv4 offset for both families
            match (be16(data, V6_EMBEDDED_ID), be16(data, EMBEDDED_SEQ)) {
                (Some(id), Some(seq)) => Some(IcmpResponse::TimeExceeded { id, seq }),
                _ => Some(IcmpResponse::Other),
            }
        }
        Icmpv6Types::DestinationUnreachable => match (be16(msg, 4), be16(msg, 6)) {
            (Some(id), Some(seq)) => Some(IcmpResponse::Unreachable { id, seq }),
            _ => Some(IcmpResponse::Other),
        },
        _ => Some(IcmpResponse::Other),
    }
}

fn be16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Synthetic datagram builders shared by the engine tests.

    /// Wrap an ICMP message in a minimal IPv4 header (protocol 1).
    pub(crate) fn wrap_ipv4(icmp: &[u8]) -> Vec<u8> {
        let total = 20 + icmp.len();
        let mut datagram = vec![0u8; total];
        datagram[0] = 0x45;
        datagram[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        datagram[8] = 64;
        datagram[9] = 1;
        datagram[20..].copy_from_slice(icmp);
        datagram
    }

    /// ICMPv4 Echo Reply carrying the given identifier and sequence.
    pub(crate) fn echo_reply_v4(id: u16, seq: u16) -> Vec<u8> {
        let mut msg = vec![0u8; 8];
        msg[4..6].copy_from_slice(&id.to_be_bytes());
        msg[6..8].copy_from_slice(&seq.to_be_bytes());
        msg
    }

    /// ICMPv4 Time Exceeded embedding the original echo's id and seq at
    /// payload offsets 24..26 and 26..28.
    pub(crate) fn time_exceeded_v4(id: u16, seq: u16) -> Vec<u8> {
        let mut msg = vec![0u8; 8 + 28];
        msg[0] = 11;
        let data = &mut msg[8..];
        data[0] = 0x45;
        data[9] = 1;
        data[20] = 8;
        data[24..26].copy_from_slice(&id.to_be_bytes());
        data[26..28].copy_from_slice(&seq.to_be_bytes());
        msg
    }

    /// ICMPv4 Destination Unreachable whose unused field carries id/seq
    /// the way the correlation path reads them.
    pub(crate) fn unreachable_v4(id: u16, seq: u16) -> Vec<u8> {
        let mut msg = vec![0u8; 8 + 28];
        msg[0] = 3;
        msg[1] = 3;
        msg[4..6].copy_from_slice(&id.to_be_bytes());
        msg[6..8].copy_from_slice(&seq.to_be_bytes());
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_v4_layout() {
        let msg = build_echo_v4(0x1234, 0x0042, &[]).unwrap();
        assert_eq!(msg.len(), 8);
        assert_eq!(msg[0], 8);
        assert_eq!(msg[1], 0);
        assert_eq!(&msg[4..6], &[0x12, 0x34]);
        assert_eq!(&msg[6..8], &[0x00, 0x42]);
        assert_ne!(&msg[2..4], &[0, 0], "checksum must be filled");
    }

    #[test]
    fn echo_v4_payload_carried() {
        let payload = [0xAA; 16];
        let msg = build_echo_v4(1, 2, &payload).unwrap();
        assert_eq!(msg.len(), 24);
        assert_eq!(&msg[8..], &payload);
    }

    #[test]
    fn echo_v6_layout() {
        let msg = build_echo_v6(0x0BAD, 0x0101, &[]).unwrap();
        assert_eq!(msg[0], 128);
        assert_eq!(&msg[2..4], &[0, 0], "checksum is kernel-filled");
        assert_eq!(&msg[4..6], &[0x0B, 0xAD]);
        assert_eq!(&msg[6..8], &[0x01, 0x01]);
    }

    #[test]
    fn parse_echo_reply_v4() {
        let datagram = testutil::wrap_ipv4(&testutil::echo_reply_v4(0x7001, 17));
        assert_eq!(
            parse_reply_v4(&datagram),
            Some(IcmpResponse::EchoReply { id: 0x7001, seq: 17 })
        );
    }

    #[test]
    fn time_exceeded_v4_offsets() {
        // Identifier at payload offset 24..26, sequence at 26..28.
        let datagram = testutil::wrap_ipv4(&testutil::time_exceeded_v4(0x4D2, 63));
        assert_eq!(
            parse_reply_v4(&datagram),
            Some(IcmpResponse::TimeExceeded { id: 0x4D2, seq: 63 })
        );
    }

    #[test]
    fn time_exceeded_v4_truncated_payload_uncorrelatable() {
        // 20 bytes of embedded datagram is too short for the echo header
        let mut msg = vec![0u8; 8 + 20];
        msg[0] = 11;
        assert_eq!(
            parse_reply_v4(&testutil::wrap_ipv4(&msg)),
            Some(IcmpResponse::Other)
        );
    }

    #[test]
    fn time_exceeded_v6_offsets() {
        // Identifier at payload offset 44..46; the sequence is still read
        // at 26..28, which lands inside the embedded IPv6 header.
        let mut msg = vec![0u8; 8 + 48];
        msg[0] = 3;
        msg[8 + 44..8 + 46].copy_from_slice(&0xBEEFu16.to_be_bytes());
        msg[8 + 26..8 + 28].copy_from_slice(&0x0102u16.to_be_bytes());
        assert_eq!(
            parse_reply_v6(&msg),
            Some(IcmpResponse::TimeExceeded { id: 0xBEEF, seq: 0x0102 })
        );
    }

    #[test]
    fn echo_reply_v6_body() {
        let mut msg = vec![0u8; 8];
        msg[0] = 129;
        msg[4..6].copy_from_slice(&0x1FFFu16.to_be_bytes());
        msg[6..8].copy_from_slice(&9u16.to_be_bytes());
        assert_eq!(
            parse_reply_v6(&msg),
            Some(IcmpResponse::EchoReply { id: 0x1FFF, seq: 9 })
        );
    }

    #[test]
    fn unreachable_v4_read_as_echo_body() {
        let datagram = testutil::wrap_ipv4(&testutil::unreachable_v4(0x2222, 5));
        assert_eq!(
            parse_reply_v4(&datagram),
            Some(IcmpResponse::Unreachable { id: 0x2222, seq: 5 })
        );
    }

    #[test]
    fn unknown_type_is_other() {
        // Router Advertisement
        let mut msg = vec![0u8; 8];
        msg[0] = 9;
        assert_eq!(parse_reply_v4(&testutil::wrap_ipv4(&msg)), Some(IcmpResponse::Other));
    }

    #[test]
    fn short_datagram_is_malformed() {
        assert_eq!(parse_reply_v4(&[0x45, 0, 0, 4]), None);
        assert_eq!(parse_reply_v6(&[3, 0]), None);
    }
}
