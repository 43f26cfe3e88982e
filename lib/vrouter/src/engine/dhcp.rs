// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! DHCP for hosts attached to router ports.
//!
//! The server is stateless: every port has exactly one address to
//! hand out, the port's configured local network address, so an
//! OFFER needs nothing from the DISCOVER but its transaction id, and
//! a REQUEST is acceptable only if it asks for that same address.
//!
//! Options are parsed here rather than through smoltcp because
//! smoltcp stops at, rather than rejects, an option that overruns
//! the message.

use super::packet::DHCP_CLIENT_PORT;
use super::packet::DHCP_SERVER_PORT;
use super::packet::Frame;
use super::packet::build_udp_frame;
use super::port::DevicePort;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use core::fmt;
use core::fmt::Display;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// Size of the fixed BOOTP header, up to the options.
pub const BOOTP_HDR_LEN: usize = 236;

/// Marks the start of the options.
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// The smallest BOOTP message a relay or client must accept.
pub const BOOTP_MIN_LEN: usize = 300;

pub const OP_REQUEST: u8 = 1;
pub const OP_REPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;

const CHADDR_OFF: usize = 28;

/// DHCP option codes.
pub mod opt {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const BROADCAST_ADDR: u8 = 28;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    pub const END: u8 = 255;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = DhcpError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            _ => Err(DhcpError::UnknownMessageType(val)),
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        write!(f, "{s}")
    }
}

/// Why a boot request got no reply.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DhcpError {
    #[error("not a UDP boot request")]
    NotDhcp,

    #[error("message too short: {0} bytes")]
    Truncated(usize),

    #[error("op {0} is not a boot request")]
    NotRequest(u8),

    #[error("hardware address length {0}, expected 6")]
    BadHardwareLen(u8),

    #[error("bad magic cookie")]
    BadCookie,

    #[error("option {code} overruns the message")]
    OptionOverrun { code: u8 },

    #[error("message type option has length {0}")]
    BadMessageTypeLen(usize),

    #[error("empty parameter request list")]
    EmptyParameterList,

    #[error("no message type option")]
    NoMessageType,

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("{0} is not answered")]
    Unhandled(MessageType),

    #[error("REQUEST without a requested address")]
    NoRequestedIp,

    #[error("requested {requested}, but the port offers {offered}")]
    RequestedIpMismatch { requested: Ipv4Addr, offered: Ipv4Addr },
}

/// A parsed boot request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DhcpRequest {
    pub xid: u32,
    pub ciaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    pub msg_type: MessageType,
    pub options: BTreeMap<u8, Vec<u8>>,
    /// The codes from the parameter request list.
    pub requested_params: BTreeSet<u8>,
}

fn ip_opt(data: &[u8]) -> Option<Ipv4Addr> {
    <[u8; 4]>::try_from(data).ok().map(Ipv4Addr::from)
}

impl DhcpRequest {
    pub fn parse(buf: &[u8]) -> Result<Self, DhcpError> {
        if buf.len() < BOOTP_HDR_LEN + MAGIC_COOKIE.len() {
            return Err(DhcpError::Truncated(buf.len()));
        }

        if buf[0] != OP_REQUEST {
            return Err(DhcpError::NotRequest(buf[0]));
        }

        let hlen = buf[2];
        if hlen != 6 {
            return Err(DhcpError::BadHardwareLen(hlen));
        }

        if buf[BOOTP_HDR_LEN..BOOTP_HDR_LEN + 4] != MAGIC_COOKIE {
            return Err(DhcpError::BadCookie);
        }

        let xid = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ciaddr = Ipv4Addr::from([buf[12], buf[13], buf[14], buf[15]]);
        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&buf[CHADDR_OFF..CHADDR_OFF + 6]);

        let mut options = BTreeMap::new();
        let mut requested_params = BTreeSet::new();
        let mut off = BOOTP_HDR_LEN + MAGIC_COOKIE.len();

        while off < buf.len() {
            let code = buf[off];
            if code == opt::END {
                break;
            }
            if code == opt::PAD {
                off += 1;
                continue;
            }

            let len = match buf.get(off + 1) {
                Some(len) => usize::from(*len),
                None => return Err(DhcpError::OptionOverrun { code }),
            };
            let data = buf
                .get(off + 2..off + 2 + len)
                .ok_or(DhcpError::OptionOverrun { code })?;

            match code {
                opt::MESSAGE_TYPE if len != 1 => {
                    return Err(DhcpError::BadMessageTypeLen(len));
                }
                opt::PARAMETER_REQUEST_LIST => {
                    if len == 0 {
                        return Err(DhcpError::EmptyParameterList);
                    }
                    requested_params.extend(data.iter().copied());
                }
                _ => (),
            }

            let _ = options.insert(code, data.to_vec());
            off += 2 + len;
        }

        let msg_type = match options.get(&opt::MESSAGE_TYPE) {
            Some(data) => MessageType::try_from(data[0])?,
            None => return Err(DhcpError::NoMessageType),
        };

        Ok(Self {
            xid,
            ciaddr,
            chaddr: MacAddr::from(chaddr),
            msg_type,
            options,
            requested_params,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.get(&opt::REQUESTED_IP).and_then(|d| ip_opt(d))
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.options.get(&opt::SERVER_ID).and_then(|d| ip_opt(d))
    }
}

/// The reply a request deserves, or why it deserves none.
///
/// `Ok` carries diagnostics that do not prevent a reply.
pub fn reply_type(
    req: &DhcpRequest,
    port: &DevicePort,
) -> Result<(MessageType, Vec<String>), DhcpError> {
    let mut notes = Vec::new();

    match req.msg_type {
        MessageType::Discover => Ok((MessageType::Offer, notes)),

        MessageType::Request => {
            // RFC 2131 says a client selecting an offer MUST include
            // the server identifier. Some clients leave it out, so
            // its absence and even a mismatch are only noted.
            match req.server_id() {
                None => notes.push("REQUEST has no server id".to_string()),
                Some(sid) if sid != port.config.port_addr => {
                    notes.push(format!(
                        "REQUEST chose server {sid}, not {}",
                        port.config.port_addr
                    ));
                }
                Some(_) => (),
            }

            let requested =
                req.requested_ip().ok_or(DhcpError::NoRequestedIp)?;
            let offered = port.config.local_nw_addr;
            if requested != offered {
                return Err(DhcpError::RequestedIpMismatch {
                    requested,
                    offered,
                });
            }

            Ok((MessageType::Ack, notes))
        }

        other => Err(DhcpError::Unhandled(other)),
    }
}

/// Build the BOOTP payload of a reply.
pub fn build_reply(
    req: &DhcpRequest,
    reply: MessageType,
    client_mac: MacAddr,
    port: &DevicePort,
    lease_secs: u32,
) -> Vec<u8> {
    let cfg = &port.config;
    let mut b = vec![0u8; BOOTP_HDR_LEN];
    b[0] = OP_REPLY;
    b[1] = HTYPE_ETHERNET;
    b[2] = 6;
    b[4..8].copy_from_slice(&req.xid.to_be_bytes());
    b[16..20].copy_from_slice(&cfg.local_nw_addr.bytes());
    b[20..24].copy_from_slice(&cfg.port_addr.bytes());
    b[CHADDR_OFF..CHADDR_OFF + 6].copy_from_slice(&client_mac.bytes());

    b.extend_from_slice(&MAGIC_COOKIE);

    let mut push = |code: u8, data: &[u8]| {
        b.push(code);
        b.push(data.len() as u8);
        b.extend_from_slice(data);
    };
    push(opt::MESSAGE_TYPE, &[reply as u8]);
    push(opt::SUBNET_MASK, &cfg.subnet_mask().bytes());
    push(opt::BROADCAST_ADDR, &cfg.subnet_broadcast().bytes());
    push(opt::LEASE_TIME, &lease_secs.to_be_bytes());
    push(opt::ROUTER, &cfg.port_addr.bytes());
    push(opt::SERVER_ID, &cfg.port_addr.bytes());
    b.push(opt::END);

    if b.len() < BOOTP_MIN_LEN {
        b.resize(BOOTP_MIN_LEN, opt::PAD);
    }

    b
}

/// Answer a boot request received on `port`.
///
/// On success returns the complete reply frame along with any
/// diagnostics worth logging.
pub fn handle_request(
    frame: &Frame,
    port: &DevicePort,
    lease_secs: u32,
) -> Result<(Vec<u8>, Vec<String>), DhcpError> {
    let (_, _, payload) = frame.udp_payload().ok_or(DhcpError::NotDhcp)?;
    let req = DhcpRequest::parse(payload)?;
    let (reply, notes) = reply_type(&req, port)?;
    let client_mac = frame.src_mac();
    let bootp = build_reply(&req, reply, client_mac, port, lease_secs);

    let pkt = build_udp_frame(
        port.mac,
        client_mac,
        port.config.port_addr,
        Ipv4Addr::LOCAL_BCAST,
        DHCP_SERVER_PORT,
        DHCP_CLIENT_PORT,
        &bootp,
    );

    Ok((pkt, notes))
}
