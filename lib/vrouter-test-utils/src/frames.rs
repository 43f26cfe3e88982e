// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Frame generators.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::Icmpv4Packet;
use smoltcp::wire::Icmpv4Repr;
use smoltcp::wire::Ipv4Packet;
use vrouter::api::Ipv4Addr;
use vrouter::api::MacAddr;
use vrouter::engine::packet::build_icmp_frame;
use vrouter::engine::packet::build_udp_frame;

pub const GUEST_MAC: MacAddr =
    MacAddr::from_const([0xa8, 0x40, 0x25, 0, 0, 0x63]);
pub const GUEST_MAC2: MacAddr =
    MacAddr::from_const([0xa8, 0x40, 0x25, 0, 0, 0x77]);
pub const ROUTER_MAC: MacAddr = MacAddr::from_const([0x02, 0, 0, 0, 0, 0x01]);
pub const ROUTER_MAC2: MacAddr = MacAddr::from_const([0x02, 0, 0, 0, 0, 0x02]);

pub fn gen_udp(
    eth_src: MacAddr,
    eth_dst: MacAddr,
    ip_src: Ipv4Addr,
    ip_dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    build_udp_frame(eth_src, eth_dst, ip_src, ip_dst, sport, dport, payload)
}

pub fn gen_icmp_echo(
    eth_src: MacAddr,
    eth_dst: MacAddr,
    ip_src: Ipv4Addr,
    ip_dst: Ipv4Addr,
) -> Vec<u8> {
    let data = b"reunion\0";
    let repr =
        Icmpv4Repr::EchoRequest { ident: 7, seq_no: 777, data: &data[..] };
    let mut icmp = vec![0u8; repr.buffer_len()];
    let mut pkt = Icmpv4Packet::new_unchecked(&mut icmp[..]);
    repr.emit(&mut pkt, &ChecksumCapabilities::default());
    build_icmp_frame(eth_src, eth_dst, ip_src, ip_dst, &icmp)
}

/// An ICMP message of the given type and code, with an otherwise
/// empty header.
pub fn gen_icmp(
    eth_src: MacAddr,
    eth_dst: MacAddr,
    ip_src: Ipv4Addr,
    ip_dst: Ipv4Addr,
    icmp_type: u8,
    code: u8,
) -> Vec<u8> {
    let mut icmp = vec![0u8; 8];
    icmp[0] = icmp_type;
    icmp[1] = code;
    let mut pkt = Icmpv4Packet::new_unchecked(&mut icmp[..]);
    pkt.fill_checksum();
    build_icmp_frame(eth_src, eth_dst, ip_src, ip_dst, &icmp)
}

pub fn gen_arp_request(
    eth_src: MacAddr,
    ip_src: Ipv4Addr,
    ip_dst: Ipv4Addr,
) -> Vec<u8> {
    let eth_repr = EthernetRepr {
        src_addr: eth_src.into(),
        dst_addr: MacAddr::BROADCAST.into(),
        ethertype: EthernetProtocol::Arp,
    };
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: eth_src.into(),
        source_protocol_addr: ip_src.into(),
        target_hardware_addr: MacAddr::ZERO.into(),
        target_protocol_addr: ip_dst.into(),
    };

    let mut buf = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut eth = EthernetFrame::new_unchecked(&mut buf[..]);
    eth_repr.emit(&mut eth);
    let mut arp = ArpPacket::new_unchecked(eth.payload_mut());
    arp_repr.emit(&mut arp);
    buf
}

/// Mark an IPv4 frame as a fragment at `offset` bytes.
pub fn set_frag_offset(frame: &mut [u8], offset: u16) {
    let mut eth = EthernetFrame::new_unchecked(frame);
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip.set_frag_offset(offset);
    ip.fill_checksum();
}
