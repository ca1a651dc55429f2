//! The TTL-walking wire layer. One call probes one hop: send a packet whose
//! TTL expires `ttl` routers out, then read the ICMP answer that names the
//! router (Time Exceeded) or confirms arrival (Echo Reply / completed
//! connect). Everything here blocks; callers run it on the blocking pool.

use std::io;
use std::mem::MaybeUninit;
use std::net::{
    IpAddr,
    Ipv4Addr,
    Ipv6Addr,
    Shutdown,
    SocketAddr,
};
use std::time::{
    Duration,
    Instant,
};

use socket2::{
    Domain,
    Protocol,
    SockAddr,
    Socket,
    Type,
};
use sparrow_commons::{
    Hop,
    HopAddress,
    TracerouteProtocol,
};
use thiserror::Error;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV4_TIME_EXCEEDED: u8 = 11;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMPV6_TIME_EXCEEDED: u8 = 3;

const IPV6_HEADER_LEN: usize = 40;
const IPPROTO_TCP: u8 = 6;
const ECHO_PAYLOAD_LEN: usize = 16;

/// TCP connects consume the whole probe budget before the listener is read;
/// the kernel has queued any Time Exceeded by then, so a short drain window
/// is enough to pick it up.
const ICMP_DRAIN_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct ProbeSpec {
    pub dest: SocketAddr,
    pub protocol: TracerouteProtocol,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum TtlError {
    #[error("failed to open socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to configure socket: {0}")]
    Configure(#[source] io::Error),
    #[error("failed to send probe: {0}")]
    Send(#[source] io::Error),
    #[error("failed to read reply: {0}")]
    Recv(#[source] io::Error),
    #[error("{primary}; socket release also failed: {cleanup}")]
    Cleanup { primary: String, cleanup: io::Error },
    #[error("probe task failed: {0}")]
    Join(String),
    #[error("udp traceroute is not supported")]
    UnsupportedProtocol,
}

/// Probe one hop. A router answering Time Exceeded or nothing answering at
/// all both produce a `Hop` (`reached = false`, the latter with no address);
/// only socket-level failures are errors.
pub fn hop_blocking(spec: &ProbeSpec, ttl: u8) -> Result<Hop, TtlError> {
    match spec.protocol {
        TracerouteProtocol::Icmp => icmp_hop(spec, ttl),
        TracerouteProtocol::Tcp => tcp_hop(spec, ttl),
        TracerouteProtocol::Udp => Err(TtlError::UnsupportedProtocol),
    }
}

fn icmp_hop(spec: &ProbeSpec, ttl: u8) -> Result<Hop, TtlError> {
    let dest_ip = spec.dest.ip();
    let v4 = dest_ip.is_ipv4();

    let socket = open_icmp_socket(v4)?;
    set_hop_limit(&socket, v4, ttl)?;

    let ident = process_ident();
    let seq = u16::from(ttl);
    let packet = if v4 {
        build_echo_v4(ident, seq)
    } else {
        build_echo_v6(ident, seq)
    };

    let dest: SockAddr = SocketAddr::new(dest_ip, 0).into();
    let started = Instant::now();
    socket.send_to(&packet, &dest).map_err(TtlError::Send)?;

    let deadline = started + spec.timeout;
    loop {
        let Some((bytes, peer)) = recv_until(&socket, deadline)? else {
            return Ok(unanswered(ttl));
        };

        let reply = if v4 {
            parse_echo_reply_v4(&bytes, ident, seq)
        } else {
            parse_echo_reply_v6(&bytes, ident, seq)
        };

        match reply {
            Some(Reply::Reached) => {
                return Ok(Hop {
                    latency: started.elapsed().as_secs_f64(),
                    addr: HopAddress {
                        ip: dest_ip.to_string(),
                        port: spec.dest.port(),
                    },
                    name: String::new(),
                    ttl,
                    reached: true,
                });
            }
            Some(Reply::Intermediate) => {
                return Ok(intermediate(ttl, peer, started.elapsed()));
            }
            None => continue,
        }
    }
}

fn tcp_hop(spec: &ProbeSpec, ttl: u8) -> Result<Hop, TtlError> {
    let dest_ip = spec.dest.ip();
    let v4 = dest_ip.is_ipv4();

    // The listener must exist before the SYN goes out or the kernel drops
    // the Time Exceeded on the floor.
    let listener = open_icmp_socket(v4)?;

    let domain = if v4 { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(TtlError::Socket)?;
    set_hop_limit(&socket, v4, ttl)?;

    let bind_addr: SocketAddr = if v4 {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&bind_addr.into()).map_err(TtlError::Configure)?;
    let local_port = socket
        .local_addr()
        .map_err(TtlError::Configure)?
        .as_socket()
        .map(|addr| addr.port())
        .unwrap_or(0);

    let started = Instant::now();
    if socket
        .connect_timeout(&spec.dest.into(), spec.timeout)
        .is_ok()
    {
        let hop = Hop {
            latency: started.elapsed().as_secs_f64(),
            addr: HopAddress {
                ip: dest_ip.to_string(),
                port: spec.dest.port(),
            },
            name: String::new(),
            ttl,
            reached: true,
        };
        return match socket.shutdown(Shutdown::Both) {
            Ok(()) => Ok(hop),
            Err(cleanup) => Err(TtlError::Cleanup {
                primary: format!("reached {} at ttl {}", spec.dest, ttl),
                cleanup,
            }),
        };
    }

    // Connect failures are the expected outcome for intermediate TTLs.
    let remaining = (started + spec.timeout).saturating_duration_since(Instant::now());
    let deadline = Instant::now() + remaining.max(ICMP_DRAIN_WINDOW);

    loop {
        let Some((bytes, peer)) = recv_until(&listener, deadline)? else {
            return Ok(unanswered(ttl));
        };

        let matched = if v4 {
            parse_tcp_time_exceeded_v4(&bytes, local_port)
        } else {
            parse_tcp_time_exceeded_v6(&bytes, local_port)
        };

        if matched {
            return Ok(intermediate(ttl, peer, started.elapsed()));
        }
    }
}

fn open_icmp_socket(v4: bool) -> Result<Socket, TtlError> {
    let (domain, proto) = if v4 {
        (Domain::IPV4, Protocol::ICMPV4)
    } else {
        (Domain::IPV6, Protocol::ICMPV6)
    };
    Socket::new(domain, Type::RAW, Some(proto)).map_err(TtlError::Socket)
}

fn set_hop_limit(socket: &Socket, v4: bool, ttl: u8) -> Result<(), TtlError> {
    if v4 {
        socket.set_ttl(u32::from(ttl)).map_err(TtlError::Configure)
    } else {
        socket
            .set_unicast_hops_v6(u32::from(ttl))
            .map_err(TtlError::Configure)
    }
}

fn process_ident() -> u16 {
    (std::process::id() & 0xffff) as u16
}

/// Read one datagram, bounded by `deadline`. `None` means the deadline
/// passed without traffic.
fn recv_until(socket: &Socket, deadline: Instant) -> Result<Option<(Vec<u8>, IpAddr)>, TtlError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(TtlError::Configure)?;

        let mut buf = [MaybeUninit::<u8>::uninit(); 512];
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                // recv_from initialised the first `n` bytes.
                let bytes: Vec<u8> = buf[..n]
                    .iter()
                    .map(|byte| unsafe { byte.assume_init() })
                    .collect();
                let Some(peer_ip) = peer.as_socket().map(|addr| addr.ip()) else {
                    continue;
                };
                return Ok(Some((bytes, peer_ip)));
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None);
            }
            Err(e) => return Err(TtlError::Recv(e)),
        }
    }
}

fn unanswered(ttl: u8) -> Hop {
    Hop {
        latency: 0.0,
        addr: HopAddress {
            ip: String::new(),
            port: 0,
        },
        name: String::new(),
        ttl,
        reached: false,
    }
}

fn intermediate(ttl: u8, peer: IpAddr, elapsed: Duration) -> Hop {
    Hop {
        latency: elapsed.as_secs_f64(),
        addr: HopAddress {
            ip: peer.to_string(),
            port: 0,
        },
        name: String::new(),
        ttl,
        reached: false,
    }
}

fn build_echo_v4(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + ECHO_PAYLOAD_LEN];
    packet[0] = ICMPV4_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// ICMPv6 checksums need the IPv6 pseudo-header; the kernel fills them in
/// on raw ICMPv6 sockets, so the field stays zero here.
fn build_echo_v6(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + ECHO_PAYLOAD_LEN];
    packet[0] = ICMPV6_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum = sum.wrapping_add(u32::from(word));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

enum Reply {
    Reached,
    Intermediate,
}

fn echo_ident_seq(icmp: &[u8]) -> Option<(u16, u16)> {
    if icmp.len() < 8 {
        return None;
    }
    let ident = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    Some((ident, seq))
}

/// Raw ICMPv4 sockets hand back the full IP packet; skip the variable-length
/// header first.
fn strip_ipv4_header(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < 20 {
        return None;
    }
    let header_len = usize::from(bytes[0] & 0x0f) * 4;
    bytes.get(header_len..)
}

fn parse_echo_reply_v4(bytes: &[u8], ident: u16, seq: u16) -> Option<Reply> {
    let icmp = strip_ipv4_header(bytes)?;
    if icmp.len() < 8 {
        return None;
    }
    match icmp[0] {
        ICMPV4_ECHO_REPLY => {
            (echo_ident_seq(icmp)? == (ident, seq)).then_some(Reply::Reached)
        }
        ICMPV4_TIME_EXCEEDED => {
            // The payload carries the expired packet: original IP header
            // plus the first 8 bytes of our echo request.
            let inner = strip_ipv4_header(icmp.get(8..)?)?;
            (inner.first() == Some(&ICMPV4_ECHO_REQUEST) && echo_ident_seq(inner)? == (ident, seq))
                .then_some(Reply::Intermediate)
        }
        _ => None,
    }
}

/// Raw ICMPv6 sockets deliver the ICMP message without an IP header.
fn parse_echo_reply_v6(icmp: &[u8], ident: u16, seq: u16) -> Option<Reply> {
    if icmp.len() < 8 {
        return None;
    }
    match icmp[0] {
        ICMPV6_ECHO_REPLY => {
            (echo_ident_seq(icmp)? == (ident, seq)).then_some(Reply::Reached)
        }
        ICMPV6_TIME_EXCEEDED => {
            let inner = icmp.get(8 + IPV6_HEADER_LEN..)?;
            (inner.first() == Some(&ICMPV6_ECHO_REQUEST) && echo_ident_seq(inner)? == (ident, seq))
                .then_some(Reply::Intermediate)
        }
        _ => None,
    }
}

/// Match a Time Exceeded against our TCP attempt: the embedded transport
/// header starts with the source port the kernel picked for us.
fn parse_tcp_time_exceeded_v4(bytes: &[u8], local_port: u16) -> bool {
    let Some(icmp) = strip_ipv4_header(bytes) else {
        return false;
    };
    if icmp.first() != Some(&ICMPV4_TIME_EXCEEDED) {
        return false;
    }
    let Some(inner_packet) = icmp.get(8..) else {
        return false;
    };
    if inner_packet.len() < 20 || inner_packet[9] != IPPROTO_TCP {
        return false;
    }
    let Some(tcp) = strip_ipv4_header(inner_packet) else {
        return false;
    };
    embedded_source_port(tcp) == Some(local_port)
}

fn parse_tcp_time_exceeded_v6(icmp: &[u8], local_port: u16) -> bool {
    if icmp.first() != Some(&ICMPV6_TIME_EXCEEDED) {
        return false;
    }
    let Some(inner_packet) = icmp.get(8..) else {
        return false;
    };
    // next-header byte of the embedded IPv6 header
    if inner_packet.len() < IPV6_HEADER_LEN || inner_packet[6] != IPPROTO_TCP {
        return false;
    }
    embedded_source_port(&inner_packet[IPV6_HEADER_LEN..]) == Some(local_port)
}

fn embedded_source_port(transport: &[u8]) -> Option<u16> {
    if transport.len() < 4 {
        return None;
    }
    Some(u16::from_be_bytes([transport[0], transport[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap_ipv4(proto: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45; // version 4, 20-byte header
        packet[9] = proto;
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        let packet = build_echo_v4(0x1234, 7);
        // Re-summing a checksummed packet must fold to zero.
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_echo_reply_v4_matches_ident_and_seq() {
        let mut icmp = vec![0u8; 8];
        icmp[0] = ICMPV4_ECHO_REPLY;
        icmp[4..6].copy_from_slice(&process_ident().to_be_bytes());
        icmp[6..8].copy_from_slice(&5u16.to_be_bytes());
        let packet = wrap_ipv4(1, &icmp);

        assert!(matches!(
            parse_echo_reply_v4(&packet, process_ident(), 5),
            Some(Reply::Reached)
        ));
        assert!(parse_echo_reply_v4(&packet, process_ident(), 6).is_none());
    }

    #[test]
    fn test_time_exceeded_v4_matches_embedded_echo() {
        let ident = 0x0badu16;
        let seq = 3u16;

        let mut inner_icmp = vec![0u8; 8];
        inner_icmp[0] = ICMPV4_ECHO_REQUEST;
        inner_icmp[4..6].copy_from_slice(&ident.to_be_bytes());
        inner_icmp[6..8].copy_from_slice(&seq.to_be_bytes());
        let inner = wrap_ipv4(1, &inner_icmp);

        let mut outer_icmp = vec![0u8; 8];
        outer_icmp[0] = ICMPV4_TIME_EXCEEDED;
        outer_icmp.extend_from_slice(&inner);
        let packet = wrap_ipv4(1, &outer_icmp);

        assert!(matches!(
            parse_echo_reply_v4(&packet, ident, seq),
            Some(Reply::Intermediate)
        ));
        assert!(parse_echo_reply_v4(&packet, ident, seq + 1).is_none());
    }

    #[test]
    fn test_tcp_time_exceeded_v4_matches_source_port() {
        let local_port = 43210u16;

        let mut tcp = vec![0u8; 8];
        tcp[0..2].copy_from_slice(&local_port.to_be_bytes());
        let inner = wrap_ipv4(IPPROTO_TCP, &tcp);

        let mut outer_icmp = vec![0u8; 8];
        outer_icmp[0] = ICMPV4_TIME_EXCEEDED;
        outer_icmp.extend_from_slice(&inner);
        let packet = wrap_ipv4(1, &outer_icmp);

        assert!(parse_tcp_time_exceeded_v4(&packet, local_port));
        assert!(!parse_tcp_time_exceeded_v4(&packet, local_port + 1));
    }

    #[test]
    fn test_truncated_packets_are_ignored() {
        assert!(parse_echo_reply_v4(&[0x45, 0, 0], 1, 1).is_none());
        assert!(parse_echo_reply_v6(&[ICMPV6_ECHO_REPLY], 1, 1).is_none());
        assert!(!parse_tcp_time_exceeded_v4(&[0x45], 1));
    }

    #[test]
    fn test_udp_protocol_is_rejected() {
        let spec = ProbeSpec {
            dest: "127.0.0.1:53".parse().unwrap(),
            protocol: TracerouteProtocol::Udp,
            timeout: Duration::from_millis(200),
        };
        assert!(matches!(
            hop_blocking(&spec, 1),
            Err(TtlError::UnsupportedProtocol)
        ));
    }

    #[test]
    fn test_unanswered_hop_has_no_address() {
        let hop = unanswered(4);
        assert_eq!(hop.ttl, 4);
        assert!(!hop.reached);
        assert!(hop.addr.ip.is_empty());
        assert_eq!(hop.latency, 0.0);
    }
}
