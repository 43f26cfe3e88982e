// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Client-side DHCP for tests.

use std::collections::BTreeMap;
use vrouter::api::Ipv4Addr;
use vrouter::api::MacAddr;
use vrouter::engine::dhcp::BOOTP_HDR_LEN;
use vrouter::engine::dhcp::HTYPE_ETHERNET;
use vrouter::engine::dhcp::MAGIC_COOKIE;
use vrouter::engine::dhcp::MessageType;
use vrouter::engine::dhcp::OP_REQUEST;
use vrouter::engine::dhcp::opt;
use vrouter::engine::packet::DHCP_CLIENT_PORT;
use vrouter::engine::packet::DHCP_SERVER_PORT;
use vrouter::engine::packet::Frame;
use vrouter::engine::packet::build_udp_frame;

/// A boot request, as a client would send it.
#[derive(Clone, Debug)]
pub struct DhcpReq {
    pub op: u8,
    pub msg_type: MessageType,
    pub hlen: u8,
    pub xid: u32,
    pub chaddr: MacAddr,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
    pub params: Vec<u8>,
}

impl DhcpReq {
    pub fn new(msg_type: MessageType, chaddr: MacAddr) -> Self {
        Self {
            op: OP_REQUEST,
            msg_type,
            hlen: 6,
            xid: 0x3903_f326,
            chaddr,
            requested_ip: None,
            server_id: None,
            params: vec![opt::SUBNET_MASK, opt::ROUTER],
        }
    }

    pub fn bootp(&self) -> Vec<u8> {
        let mut b = vec![0u8; BOOTP_HDR_LEN];
        b[0] = self.op;
        b[1] = HTYPE_ETHERNET;
        b[2] = self.hlen;
        b[4..8].copy_from_slice(&self.xid.to_be_bytes());
        b[28..34].copy_from_slice(&self.chaddr.bytes());
        b.extend_from_slice(&MAGIC_COOKIE);

        b.extend_from_slice(&[opt::MESSAGE_TYPE, 1, self.msg_type as u8]);
        if let Some(ip) = self.requested_ip {
            b.extend_from_slice(&[opt::REQUESTED_IP, 4]);
            b.extend_from_slice(&ip.bytes());
        }
        if let Some(ip) = self.server_id {
            b.extend_from_slice(&[opt::SERVER_ID, 4]);
            b.extend_from_slice(&ip.bytes());
        }
        if !self.params.is_empty() {
            b.push(opt::PARAMETER_REQUEST_LIST);
            b.push(self.params.len() as u8);
            b.extend_from_slice(&self.params);
        }
        b.push(opt::END);
        b
    }

    /// The request broadcast from an unconfigured client.
    pub fn frame(&self) -> Vec<u8> {
        build_udp_frame(
            self.chaddr,
            MacAddr::BROADCAST,
            Ipv4Addr::ANY_ADDR,
            Ipv4Addr::LOCAL_BCAST,
            DHCP_CLIENT_PORT,
            DHCP_SERVER_PORT,
            &self.bootp(),
        )
    }
}

pub fn gen_dhcp_request(
    msg_type: MessageType,
    chaddr: MacAddr,
    requested_ip: Option<Ipv4Addr>,
) -> Vec<u8> {
    DhcpReq { requested_ip, ..DhcpReq::new(msg_type, chaddr) }.frame()
}

/// The interesting bits of a reply frame.
#[derive(Clone, Debug)]
pub struct DhcpReply {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub op: u8,
    pub xid: u32,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub bootp_len: usize,
    pub options: BTreeMap<u8, Vec<u8>>,
}

impl DhcpReply {
    pub fn msg_type(&self) -> u8 {
        self.options[&opt::MESSAGE_TYPE][0]
    }

    pub fn ip_opt(&self, code: u8) -> Ipv4Addr {
        let d = &self.options[&code];
        Ipv4Addr::from([d[0], d[1], d[2], d[3]])
    }
}

/// Pick apart a reply frame, panicking on anything malformed.
pub fn parse_reply(bytes: &[u8]) -> DhcpReply {
    let frame = Frame::parse(bytes.to_vec()).unwrap();
    let (sport, dport, b) = frame.udp_payload().unwrap();
    assert_eq!((sport, dport), (DHCP_SERVER_PORT, DHCP_CLIENT_PORT));
    assert_eq!(&b[BOOTP_HDR_LEN..BOOTP_HDR_LEN + 4], &MAGIC_COOKIE);

    let ip4 = |off: usize| {
        Ipv4Addr::from([b[off], b[off + 1], b[off + 2], b[off + 3]])
    };
    let mut chaddr = [0u8; 6];
    chaddr.copy_from_slice(&b[28..34]);

    let mut options = BTreeMap::new();
    let mut off = BOOTP_HDR_LEN + 4;
    while off < b.len() && b[off] != opt::END {
        if b[off] == opt::PAD {
            off += 1;
            continue;
        }
        let len = usize::from(b[off + 1]);
        options.insert(b[off], b[off + 2..off + 2 + len].to_vec());
        off += 2 + len;
    }

    DhcpReply {
        eth_src: frame.src_mac(),
        eth_dst: frame.dst_mac(),
        ip_src: frame.ip_src().unwrap(),
        ip_dst: frame.ip_dst().unwrap(),
        op: b[0],
        xid: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        yiaddr: ip4(16),
        siaddr: ip4(20),
        chaddr: MacAddr::from(chaddr),
        bootp_len: b.len(),
        options,
    }
}
