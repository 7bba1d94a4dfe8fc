//! IP packet parsing and NAT rewriting.
//!
//! Outbound packets get their source replaced by the configured public
//! address and their TTL/hop limit decremented; inbound packets get their
//! destination restored from the flow table. Every rewrite re-serialises
//! into a fresh buffer with length fields and checksums recomputed, so the
//! caller's buffer is never mutated.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tracing::trace;

use crate::flow::{FlowKey, FlowTable, FlowValue};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

/// Public addresses used to NAT outgoing packets. Fixed at substrate
/// construction; a packet whose family has no address here fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicAddrs {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("cannot send IPv4 packet: no public IPv4 address set")]
    NoPublicV4,
    #[error("cannot send IPv6 packet: no public IPv6 address set")]
    NoPublicV6,
    #[error("TTL would expire in flight")]
    TtlExpired,
    #[error("hop limit would expire in flight")]
    HopLimitExpired,
    #[error("malformed packet: {0}")]
    Malformed(String),
}

fn malformed(msg: impl Into<String>) -> RewriteError {
    RewriteError::Malformed(msg.into())
}

/// A successfully rewritten outbound packet plus the flow bookkeeping the
/// caller records after the packet is accepted by the NAT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRewrite {
    pub bytes: Vec<u8>,
    pub key: FlowKey,
    pub value: FlowValue,
}

/// Rewrite one cleartext packet for NAT egress.
///
/// `Ok(None)` means the packet was discarded as success: it carries no
/// TCP/UDP transport (e.g. ICMP, IPv6 extension chains, non-first
/// fragments). Errors cover missing public addresses, expiring TTLs and
/// malformed headers.
pub fn rewrite_outbound(
    data: &[u8],
    public: &PublicAddrs,
) -> Result<Option<OutboundRewrite>, RewriteError> {
    match ip_version(data)? {
        4 => rewrite_outbound_v4(data, public),
        _ => rewrite_outbound_v6(data, public),
    }
}

/// Rewrite one packet received from the NAT back towards the tunneled peer.
///
/// The flow is looked up by the packet's source endpoint (the remote the
/// peer contacted); a miss drops the packet silently. The TTL/hop limit is
/// left untouched on this path.
pub fn rewrite_inbound(
    data: &[u8],
    flows: &FlowTable,
) -> Result<Option<Vec<u8>>, RewriteError> {
    match ip_version(data)? {
        4 => rewrite_inbound_v4(data, flows),
        _ => rewrite_inbound_v6(data, flows),
    }
}

fn ip_version(data: &[u8]) -> Result<u8, RewriteError> {
    match data.first().map(|b| b >> 4) {
        Some(4) => Ok(4),
        Some(6) => Ok(6),
        Some(v) => Err(malformed(format!("unknown IP version {v}"))),
        None => Err(malformed("empty packet")),
    }
}

// IPv4

struct V4Packet<'a> {
    data: &'a [u8],
    header_len: usize,
    ttl: u8,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    // non-first fragment: no transport header present
    later_fragment: bool,
}

fn parse_v4(data: &[u8]) -> Result<V4Packet<'_>, RewriteError> {
    if data.len() < IPV4_MIN_HEADER {
        return Err(malformed("truncated IPv4 header"));
    }
    let header_len = usize::from(data[0] & 0x0f) * 4;
    if header_len < IPV4_MIN_HEADER {
        return Err(malformed("bad IPv4 IHL"));
    }
    let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if total_len < header_len || total_len > data.len() {
        return Err(malformed("bad IPv4 total length"));
    }
    let frag_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1fff;
    Ok(V4Packet {
        data: &data[..total_len],
        header_len,
        ttl: data[8],
        protocol: data[9],
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        later_fragment: frag_offset != 0,
    })
}

fn rewrite_outbound_v4(
    data: &[u8],
    public: &PublicAddrs,
) -> Result<Option<OutboundRewrite>, RewriteError> {
    let pkt = parse_v4(data)?;
    let public_v4 = public.v4.ok_or(RewriteError::NoPublicV4)?;
    if pkt.ttl <= 1 {
        return Err(RewriteError::TtlExpired);
    }
    let Some(l4) = transport_view(pkt.data, pkt.header_len, pkt.protocol, pkt.later_fragment)?
    else {
        return Ok(None);
    };

    let mut out = pkt.data.to_vec();
    out[12..16].copy_from_slice(&public_v4.octets());
    out[8] = pkt.ttl - 1;
    finalize_v4(&mut out, pkt.header_len, pkt.protocol);

    Ok(Some(OutboundRewrite {
        bytes: out,
        key: FlowKey {
            remote_addr: IpAddr::V4(pkt.dst),
            remote_port: l4.dst_port,
        },
        value: FlowValue {
            original_src: IpAddr::V4(pkt.src),
        },
    }))
}

fn rewrite_inbound_v4(
    data: &[u8],
    flows: &FlowTable,
) -> Result<Option<Vec<u8>>, RewriteError> {
    let pkt = parse_v4(data)?;
    let Some(l4) = transport_view(pkt.data, pkt.header_len, pkt.protocol, pkt.later_fragment)?
    else {
        return Ok(None);
    };

    let key = FlowKey {
        remote_addr: IpAddr::V4(pkt.src),
        remote_port: l4.src_port,
    };
    let Some(original_dst) = lookup_v4(flows, &key) else {
        return Ok(None);
    };

    let mut out = pkt.data.to_vec();
    out[16..20].copy_from_slice(&original_dst.octets());
    finalize_v4(&mut out, pkt.header_len, pkt.protocol);
    Ok(Some(out))
}

fn lookup_v4(flows: &FlowTable, key: &FlowKey) -> Option<Ipv4Addr> {
    let Some(value) = flows.lookup(key) else {
        trace!(remote = %key.remote_addr, port = key.remote_port, "no flow entry for inbound packet");
        return None;
    };
    match value.original_src {
        IpAddr::V4(addr) => Some(addr),
        IpAddr::V6(_) => {
            trace!(remote = %key.remote_addr, "flow entry address family mismatch");
            None
        }
    }
}

/// Recompute the IPv4 total length, header checksum and transport checksum
/// of `out` after its addresses were edited.
fn finalize_v4(out: &mut [u8], header_len: usize, protocol: u8) {
    let total_len = out.len() as u16;
    out[2..4].copy_from_slice(&total_len.to_be_bytes());

    out[10] = 0;
    out[11] = 0;
    let header_sum = checksum_fold(sum_words(&out[..header_len], 0));
    out[10..12].copy_from_slice(&header_sum.to_be_bytes());

    let l4_len = (out.len() - header_len) as u16;
    let src = Ipv4Addr::new(out[12], out[13], out[14], out[15]);
    let dst = Ipv4Addr::new(out[16], out[17], out[18], out[19]);
    let pseudo = pseudo_sum_v4(src, dst, protocol, l4_len);
    finalize_transport(out, header_len, protocol, pseudo, l4_len);
}

// IPv6

struct V6Packet<'a> {
    data: &'a [u8],
    hop_limit: u8,
    next_header: u8,
    src: Ipv6Addr,
    dst: Ipv6Addr,
}

fn parse_v6(data: &[u8]) -> Result<V6Packet<'_>, RewriteError> {
    if data.len() < IPV6_HEADER {
        return Err(malformed("truncated IPv6 header"));
    }
    let payload_len = usize::from(u16::from_be_bytes([data[4], data[5]]));
    let total_len = IPV6_HEADER + payload_len;
    if total_len > data.len() {
        return Err(malformed("bad IPv6 payload length"));
    }
    let src: [u8; 16] = data[8..24].try_into().expect("fixed-width slice");
    let dst: [u8; 16] = data[24..40].try_into().expect("fixed-width slice");
    Ok(V6Packet {
        data: &data[..total_len],
        hop_limit: data[7],
        next_header: data[6],
        src: Ipv6Addr::from(src),
        dst: Ipv6Addr::from(dst),
    })
}

fn rewrite_outbound_v6(
    data: &[u8],
    public: &PublicAddrs,
) -> Result<Option<OutboundRewrite>, RewriteError> {
    let pkt = parse_v6(data)?;
    let public_v6 = public.v6.ok_or(RewriteError::NoPublicV6)?;
    if pkt.hop_limit <= 1 {
        return Err(RewriteError::HopLimitExpired);
    }
    let Some(l4) = transport_view(pkt.data, IPV6_HEADER, pkt.next_header, false)? else {
        return Ok(None);
    };

    let mut out = pkt.data.to_vec();
    out[8..24].copy_from_slice(&public_v6.octets());
    out[7] = pkt.hop_limit - 1;
    finalize_v6(&mut out, pkt.next_header);

    Ok(Some(OutboundRewrite {
        bytes: out,
        key: FlowKey {
            remote_addr: IpAddr::V6(pkt.dst),
            remote_port: l4.dst_port,
        },
        value: FlowValue {
            original_src: IpAddr::V6(pkt.src),
        },
    }))
}

fn rewrite_inbound_v6(
    data: &[u8],
    flows: &FlowTable,
) -> Result<Option<Vec<u8>>, RewriteError> {
    let pkt = parse_v6(data)?;
    let Some(l4) = transport_view(pkt.data, IPV6_HEADER, pkt.next_header, false)? else {
        return Ok(None);
    };

    let key = FlowKey {
        remote_addr: IpAddr::V6(pkt.src),
        remote_port: l4.src_port,
    };
    let Some(value) = flows.lookup(&key) else {
        trace!(remote = %key.remote_addr, port = key.remote_port, "no flow entry for inbound packet");
        return Ok(None);
    };
    let IpAddr::V6(original_dst) = value.original_src else {
        trace!(remote = %key.remote_addr, "flow entry address family mismatch");
        return Ok(None);
    };

    let mut out = pkt.data.to_vec();
    out[24..40].copy_from_slice(&original_dst.octets());
    finalize_v6(&mut out, pkt.next_header);
    Ok(Some(out))
}

/// Recompute the IPv6 payload length and transport checksum of `out` after
/// its addresses were edited.
fn finalize_v6(out: &mut [u8], next_header: u8) {
    let payload_len = (out.len() - IPV6_HEADER) as u16;
    out[4..6].copy_from_slice(&payload_len.to_be_bytes());

    let src: [u8; 16] = out[8..24].try_into().expect("fixed-width slice");
    let dst: [u8; 16] = out[24..40].try_into().expect("fixed-width slice");
    let pseudo = pseudo_sum_v6(&src, &dst, next_header, payload_len);
    finalize_transport(out, IPV6_HEADER, next_header, pseudo, payload_len);
}

// Transport layer

struct TransportView {
    src_port: u16,
    dst_port: u16,
}

/// Locate the TCP/UDP header behind the network header. `Ok(None)` marks
/// packets to discard as success: unsupported transports and fragments
/// whose transport header travelled in an earlier fragment.
fn transport_view(
    data: &[u8],
    l4_offset: usize,
    protocol: u8,
    later_fragment: bool,
) -> Result<Option<TransportView>, RewriteError> {
    if later_fragment {
        trace!("skipping non-first fragment without transport header");
        return Ok(None);
    }
    let min_len = match protocol {
        IPPROTO_TCP => TCP_MIN_HEADER,
        IPPROTO_UDP => UDP_HEADER,
        other => {
            trace!(protocol = other, "skipping packet without TCP/UDP transport");
            return Ok(None);
        }
    };
    let l4 = &data[l4_offset..];
    if l4.len() < min_len {
        return Err(malformed("truncated transport header"));
    }
    Ok(Some(TransportView {
        src_port: u16::from_be_bytes([l4[0], l4[1]]),
        dst_port: u16::from_be_bytes([l4[2], l4[3]]),
    }))
}

/// Write the transport checksum (and the UDP length field) over the
/// pseudo-header of the emitted network header.
fn finalize_transport(out: &mut [u8], l4_offset: usize, protocol: u8, pseudo: u32, l4_len: u16) {
    match protocol {
        IPPROTO_UDP => {
            out[l4_offset + 4..l4_offset + 6].copy_from_slice(&l4_len.to_be_bytes());
            out[l4_offset + 6] = 0;
            out[l4_offset + 7] = 0;
            let mut sum = checksum_fold(sum_words(&out[l4_offset..], pseudo));
            // a computed checksum of zero is transmitted as all-ones
            if sum == 0 {
                sum = 0xffff;
            }
            out[l4_offset + 6..l4_offset + 8].copy_from_slice(&sum.to_be_bytes());
        }
        IPPROTO_TCP => {
            out[l4_offset + 16] = 0;
            out[l4_offset + 17] = 0;
            let sum = checksum_fold(sum_words(&out[l4_offset..], pseudo));
            out[l4_offset + 16..l4_offset + 18].copy_from_slice(&sum.to_be_bytes());
        }
        _ => {}
    }
}

// Internet checksum (RFC 1071)

fn sum_words(data: &[u8], start: u32) -> u32 {
    let mut sum = start;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn checksum_fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn pseudo_sum_v4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, l4_len: u16) -> u32 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum + u32::from(protocol) + u32::from(l4_len)
}

fn pseudo_sum_v6(src: &[u8; 16], dst: &[u8; 16], next_header: u8, l4_len: u16) -> u32 {
    let mut sum = sum_words(src, 0);
    sum = sum_words(dst, sum);
    sum + u32::from(next_header) + u32::from(l4_len)
}
