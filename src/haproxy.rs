//! HAProxy PROXY protocol v2 header writer.
//!
//! Emitted to a backend before any Minecraft bytes so it learns the original
//! client and proxy socket addresses over an otherwise opaque TCP stream.
//!
//! Reference: https://www.haproxy.org/download/2.4/doc/proxy-protocol.txt

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// PROXY protocol v2 signature.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

// Version 2, command PROXY.
const VERSION_COMMAND: u8 = 0x21;
// Address family + transport: INET/STREAM and INET6/STREAM.
const FAMILY_TCP4: u8 = 0x11;
const FAMILY_TCP6: u8 = 0x21;

const ADDR_LEN_TCP4: u16 = 12;
const ADDR_LEN_TCP6: u16 = 36;

/// Encode a v2 PROXY header for a TCP connection. IPv4 is used when both
/// peers are IPv4; anything else is carried as IPv6 with v4 peers mapped.
pub fn encode_v2(source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut buf = Vec::with_capacity(16 + ADDR_LEN_TCP4 as usize);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(VERSION_COMMAND);
            buf.push(FAMILY_TCP4);
            buf.extend_from_slice(&ADDR_LEN_TCP4.to_be_bytes());
            buf.extend_from_slice(&src.octets());
            buf.extend_from_slice(&dst.octets());
            buf.extend_from_slice(&source.port().to_be_bytes());
            buf.extend_from_slice(&destination.port().to_be_bytes());
            buf
        }
        (src, dst) => {
            let mut buf = Vec::with_capacity(16 + ADDR_LEN_TCP6 as usize);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(VERSION_COMMAND);
            buf.push(FAMILY_TCP6);
            buf.extend_from_slice(&ADDR_LEN_TCP6.to_be_bytes());
            buf.extend_from_slice(&as_v6(src).octets());
            buf.extend_from_slice(&as_v6(dst).octets());
            buf.extend_from_slice(&source.port().to_be_bytes());
            buf.extend_from_slice(&destination.port().to_be_bytes());
            buf
        }
    }
}

fn as_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
