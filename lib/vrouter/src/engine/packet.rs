// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! A decoded Ethernet frame and its flow match.

use crate::api::ETHER_TYPE_ARP;
use crate::api::ETHER_TYPE_IPV4;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::PROTO_ICMP;
use crate::api::PROTO_TCP;
use crate::api::PROTO_UDP;
use crate::api::PacketMatch;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use smoltcp::wire::UdpPacket;
use smoltcp::wire::UdpRepr;
use thiserror::Error;

pub const ETHER_HDR_LEN: usize = 14;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// The TTL of packets the controller originates.
pub const DEFAULT_TTL: u8 = 64;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FrameError {
    #[error("malformed ethernet header: {0}")]
    Ethernet(smoltcp::wire::Error),

    #[error("malformed IPv4 header: {0}")]
    Ipv4(smoltcp::wire::Error),
}

/// An Ethernet frame whose headers have been validated.
///
/// The frame owns its bytes. If the Ethernet type is IPv4 the IPv4
/// header is known to be complete and consistent with the buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn parse(bytes: Vec<u8>) -> Result<Self, FrameError> {
        let eth = EthernetFrame::new_checked(&bytes[..])
            .map_err(FrameError::Ethernet)?;

        if u16::from(eth.ethertype()) == ETHER_TYPE_IPV4 {
            Ipv4Packet::new_checked(eth.payload()).map_err(FrameError::Ipv4)?;
        }

        Ok(Self { bytes })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn eth(&self) -> EthernetFrame<&[u8]> {
        EthernetFrame::new_unchecked(&self.bytes[..])
    }

    pub fn src_mac(&self) -> MacAddr {
        self.eth().src_addr().into()
    }

    pub fn dst_mac(&self) -> MacAddr {
        self.eth().dst_addr().into()
    }

    pub fn set_src_mac(&mut self, mac: MacAddr) {
        EthernetFrame::new_unchecked(&mut self.bytes[..])
            .set_src_addr(mac.into());
    }

    pub fn set_dst_mac(&mut self, mac: MacAddr) {
        EthernetFrame::new_unchecked(&mut self.bytes[..])
            .set_dst_addr(mac.into());
    }

    pub fn ether_type(&self) -> u16 {
        self.eth().ethertype().into()
    }

    pub fn is_ipv4(&self) -> bool {
        self.ether_type() == ETHER_TYPE_IPV4
    }

    /// The IPv4 packet carried by this frame.
    ///
    /// The view stops at the IPv4 total length, so any Ethernet
    /// padding is excluded.
    pub fn ipv4(&self) -> Option<Ipv4Packet<&[u8]>> {
        if !self.is_ipv4() {
            return None;
        }

        let payload = &self.bytes[ETHER_HDR_LEN..];
        let pkt = Ipv4Packet::new_unchecked(payload);
        let total = usize::from(pkt.total_len()).min(payload.len());
        Some(Ipv4Packet::new_unchecked(&payload[..total]))
    }

    pub fn ip_src(&self) -> Option<Ipv4Addr> {
        self.ipv4().map(|ip| ip.src_addr().into())
    }

    pub fn ip_dst(&self) -> Option<Ipv4Addr> {
        self.ipv4().map(|ip| ip.dst_addr().into())
    }

    /// Is this a fragment other than the first?
    pub fn is_trailing_fragment(&self) -> bool {
        self.ipv4().is_some_and(|ip| ip.frag_offset() != 0)
    }

    /// The transport header bytes of an unfragmented or first-fragment
    /// IPv4 packet.
    fn l4(&self) -> Option<(u8, &[u8])> {
        let ip = self.ipv4()?;
        if ip.frag_offset() != 0 {
            return None;
        }
        let hdr_len = usize::from(ip.header_len());
        let ip_bytes = &self.bytes[ETHER_HDR_LEN..];
        let total = usize::from(ip.total_len()).min(ip_bytes.len());
        let l4 = ip_bytes.get(hdr_len..total)?;
        Some((ip.next_header().into(), l4))
    }

    /// The (type, code) of an ICMP message.
    pub fn icmp_type_code(&self) -> Option<(u8, u8)> {
        match self.l4()? {
            (PROTO_ICMP, l4) if l4.len() >= 2 => Some((l4[0], l4[1])),
            _ => None,
        }
    }

    /// The UDP payload when the packet is UDP.
    pub fn udp_payload(&self) -> Option<(u16, u16, &[u8])> {
        match self.l4()? {
            (PROTO_UDP, l4) if l4.len() >= 8 => {
                let src = u16::from_be_bytes([l4[0], l4[1]]);
                let dst = u16::from_be_bytes([l4[2], l4[3]]);
                Some((src, dst, &l4[8..]))
            }
            _ => None,
        }
    }

    /// Is this an IPv4 DHCP boot request (UDP 68 -> 67)?
    pub fn is_dhcp_request(&self) -> bool {
        matches!(
            self.udp_payload(),
            Some((DHCP_CLIENT_PORT, DHCP_SERVER_PORT, _))
        )
    }

    /// The IPv4 header followed by the first eight bytes of its
    /// payload, as quoted by ICMP error messages.
    pub fn ip_header_and_leading_data(&self) -> Option<&[u8]> {
        let ip = self.ipv4()?;
        let len = (usize::from(ip.header_len()) + 8)
            .min(usize::from(ip.total_len()));
        self.bytes.get(ETHER_HDR_LEN..ETHER_HDR_LEN + len)
    }

    /// Build the OpenFlow 1.0 match of this frame.
    ///
    /// ARP packets put the opcode and the protocol addresses in the
    /// network fields. ICMP puts the type and code in the transport
    /// fields.
    pub fn flow_match(
        &self,
        in_port: u16,
        tunnel_id: Option<u64>,
    ) -> PacketMatch {
        let mut m = PacketMatch {
            in_port: Some(in_port),
            dl_src: Some(self.src_mac()),
            dl_dst: Some(self.dst_mac()),
            dl_type: Some(self.ether_type()),
            tunnel_id,
            ..Default::default()
        };

        match self.ether_type() {
            ETHER_TYPE_IPV4 => {
                if let Some(ip) = self.ipv4() {
                    m.nw_src = Some(ip.src_addr().into());
                    m.nw_dst = Some(ip.dst_addr().into());
                    m.nw_proto = Some(ip.next_header().into());
                }

                match self.l4() {
                    Some((PROTO_TCP | PROTO_UDP, l4)) if l4.len() >= 4 => {
                        m.tp_src = Some(u16::from_be_bytes([l4[0], l4[1]]));
                        m.tp_dst = Some(u16::from_be_bytes([l4[2], l4[3]]));
                    }
                    Some((PROTO_ICMP, l4)) if l4.len() >= 2 => {
                        m.tp_src = Some(u16::from(l4[0]));
                        m.tp_dst = Some(u16::from(l4[1]));
                    }
                    _ => (),
                }
            }

            ETHER_TYPE_ARP => {
                let payload = &self.bytes[ETHER_HDR_LEN..];
                if let Ok(arp) = ArpPacket::new_checked(payload) {
                    if let (Ok(spa), Ok(tpa)) = (
                        <[u8; 4]>::try_from(arp.source_protocol_addr()),
                        <[u8; 4]>::try_from(arp.target_protocol_addr()),
                    ) {
                        m.nw_src = Some(Ipv4Addr::from(spa));
                        m.nw_dst = Some(Ipv4Addr::from(tpa));
                    }
                    // Only the low byte of the opcode fits.
                    m.nw_proto = Some(u16::from(arp.operation()) as u8);
                }
            }

            _ => (),
        }

        m
    }
}

/// Emit an Ethernet + IPv4 frame around an L4 payload of `l4_len`
/// bytes, written by `fill`.
fn emit_ipv4_frame<F>(
    eth_src: MacAddr,
    eth_dst: MacAddr,
    ip_src: Ipv4Addr,
    ip_dst: Ipv4Addr,
    proto: IpProtocol,
    l4_len: usize,
    fill: F,
) -> Vec<u8>
where
    F: FnOnce(&mut [u8]),
{
    let eth_repr = EthernetRepr {
        src_addr: eth_src.into(),
        dst_addr: eth_dst.into(),
        ethertype: EthernetProtocol::Ipv4,
    };
    let ip_repr = Ipv4Repr {
        src_addr: ip_src.into(),
        dst_addr: ip_dst.into(),
        next_header: proto,
        payload_len: l4_len,
        hop_limit: DEFAULT_TTL,
    };

    let len = eth_repr.buffer_len() + ip_repr.buffer_len() + l4_len;
    let mut buf = vec![0u8; len];
    let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
    eth_repr.emit(&mut eth);
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
    fill(ip.payload_mut());
    buf
}

/// Build a complete UDP/IPv4/Ethernet frame.
#[allow(clippy::too_many_arguments)]
pub fn build_udp_frame(
    eth_src: MacAddr,
    eth_dst: MacAddr,
    ip_src: Ipv4Addr,
    ip_dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_repr = UdpRepr { src_port, dst_port };
    let l4_len = udp_repr.header_len() + payload.len();
    emit_ipv4_frame(
        eth_src,
        eth_dst,
        ip_src,
        ip_dst,
        IpProtocol::Udp,
        l4_len,
        |l4| {
            let mut udp = UdpPacket::new_unchecked(l4);
            udp_repr.emit(
                &mut udp,
                &IpAddress::Ipv4(ip_src.into()),
                &IpAddress::Ipv4(ip_dst.into()),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &ChecksumCapabilities::default(),
            );
        },
    )
}

/// Build a complete ICMP/IPv4/Ethernet frame around an already
/// checksummed ICMP message.
pub fn build_icmp_frame(
    eth_src: MacAddr,
    eth_dst: MacAddr,
    ip_src: Ipv4Addr,
    ip_dst: Ipv4Addr,
    icmp: &[u8],
) -> Vec<u8> {
    emit_ipv4_frame(
        eth_src,
        eth_dst,
        ip_src,
        ip_dst,
        IpProtocol::Icmp,
        icmp.len(),
        |l4| l4.copy_from_slice(icmp),
    )
}
