// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! ICMP destination unreachable errors.
//!
//! A router that cannot deliver a packet owes its sender an error,
//! unless RFC 1812 4.3.2.7 says otherwise. The error is built the way
//! the last router that handled the packet would have built it: from
//! that router's ingress address, quoting the packet as that router
//! saw it.

use super::controller::Controller;
use super::network::Action;
use super::network::ForwardInfo;
use super::network::PortKind;
use super::network::RouterPortConfig;
use super::packet::Frame;
use super::packet::build_icmp_frame;
use super::tunnel;
use super::tunnel::ICMP_TUNNEL;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::PROTO_ICMP;
use crate::api::PortId;
use core::fmt;
use core::fmt::Display;
use slog::debug;
use slog::warn;
use smoltcp::wire::Icmpv4Message;
use smoltcp::wire::Icmpv4Packet;
use std::collections::BTreeSet;

pub const ICMP_DEST_UNREACH: u8 = 3;

/// Message types which report an error, and so never cause one.
pub const ICMP_ERROR_TYPES: [u8; 5] = [3, 4, 5, 11, 12];

/// Written over both addresses of a tunneled packet before it is
/// checked, since the tunnel encoding can look like a group address.
pub const SCRUBBED_MAC: MacAddr =
    MacAddr::from_const([0x02, 0x00, 0x00, 0x33, 0x44, 0x55]);

/// Placeholder addresses for an error that still has to be routed.
pub const ROUTING_SRC_MAC: MacAddr =
    MacAddr::from_const([0x02, 0xa1, 0xb2, 0xc3, 0xd4, 0xe5]);
pub const ROUTING_DST_MAC: MacAddr =
    MacAddr::from_const([0x02, 0xa1, 0xb2, 0xc3, 0xd4, 0xe6]);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum UnreachCode {
    Net = 0,
    Host = 1,
    FilterProhibited = 13,
}

impl Display for UnreachCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Net => "net unreachable",
            Self::Host => "host unreachable",
            Self::FilterProhibited => "administratively prohibited",
        };
        write!(f, "{s}")
    }
}

/// Why no ICMP error may be sent about `frame`, or `None` if one may.
///
/// `egress` is the config of the port the packet would have left by,
/// when known. It is used to recognize subnet broadcasts.
pub fn icmp_suppressed(
    frame: &Frame,
    egress: Option<&RouterPortConfig>,
) -> Option<&'static str> {
    let Some(ip) = frame.ipv4() else {
        return Some("not IPv4");
    };

    if u8::from(ip.next_header()) == PROTO_ICMP {
        if let Some((ty, _)) = frame.icmp_type_code() {
            if ICMP_ERROR_TYPES.contains(&ty) {
                return Some("packet is an ICMP error");
            }
        }
    }

    let src = Ipv4Addr::from(ip.src_addr());
    let dst = Ipv4Addr::from(ip.dst_addr());

    if dst.is_multicast() {
        return Some("IP multicast destination");
    }

    if let Some(cfg) = egress {
        if dst == cfg.subnet_broadcast() {
            return Some("subnet broadcast destination");
        }
    }

    if frame.dst_mac().is_multicast() {
        return Some("link-layer multicast or broadcast destination");
    }

    if src.is_local_broadcast() || dst.is_local_broadcast() {
        return Some("all-ones address");
    }

    if ip.frag_offset() != 0 {
        return Some("trailing fragment");
    }

    None
}

/// The ICMP message: type, code, four unused bytes, then the quoted
/// datagram.
pub fn unreachable_body(code: UnreachCode, quoted: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; 8 + quoted.len()];
    let mut pkt = Icmpv4Packet::new_unchecked(&mut body[..]);
    pkt.set_msg_type(Icmpv4Message::DstUnreachable);
    pkt.set_msg_code(code as u8);
    pkt.data_mut().copy_from_slice(quoted);
    pkt.fill_checksum();
    body
}

impl Controller {
    /// May an ICMP error be sent about `frame`, which would have left
    /// by `egress`?
    pub fn can_send_icmp(&self, frame: &Frame, egress: Option<PortId>) -> bool {
        let cfg = match egress.map(|port| self.network.port_config(port)) {
            Some(Ok(cfg)) => Some(cfg),
            Some(Err(e)) => {
                debug!(self.log, "no ICMP: egress unknown"; "err" => %e);
                return false;
            }
            None => None,
        };

        match icmp_suppressed(frame, cfg.as_ref()) {
            Some(reason) => {
                debug!(self.log, "no ICMP"; "reason" => reason);
                false
            }
            None => true,
        }
    }

    /// Answer a packet that entered the router network through
    /// `first_ingress`, a local port, and was dropped as `fwd`
    /// describes.
    ///
    /// `egress` is the router port the packet would have left by. It
    /// is `None` when there is no such port, as for a port set, and
    /// then only the packet itself is checked.
    pub(crate) fn send_icmp_for_local_pkt(
        &mut self,
        code: UnreachCode,
        first_ingress: PortId,
        pkt_at_first_ingress: &Frame,
        fwd: &ForwardInfo,
        egress: Option<PortId>,
    ) {
        let pkt_at_last_ingress = match Frame::parse(fwd.pkt_in.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(self.log, "no ICMP: bad packet"; "err" => %e);
                return;
            }
        };

        if !self.can_send_icmp(&pkt_at_last_ingress, egress) {
            return;
        }

        let Some(quoted) = pkt_at_last_ingress.ip_header_and_leading_data()
        else {
            return;
        };
        let body = unreachable_body(code, quoted);

        let last_ingress = match self.network.port_config(fwd.in_port_id) {
            Ok(cfg) => cfg,
            Err(e) => {
                debug!(self.log, "no ICMP: last ingress unknown"; "err" => %e);
                return;
            }
        };

        // Rather than route the error back from the last router, turn
        // it around at the first ingress port.
        let Some(dst) = pkt_at_first_ingress.ip_src() else {
            return;
        };
        let Some(port) = self.ports.get_by_id(first_ingress) else {
            debug!(self.log, "no ICMP: first ingress port is gone");
            return;
        };
        let (mac, num) = (port.mac, port.num);

        let pkt = build_icmp_frame(
            mac,
            pkt_at_first_ingress.src_mac(),
            last_ingress.port_addr,
            dst,
            &body,
        );

        debug!(
            self.log,
            "sending ICMP {}", code;
            "port" => num,
            "src" => %last_ingress.port_addr,
            "dst" => %dst,
        );
        self.send_unbuffered(pkt, num);
    }

    /// Answer a packet that reached us over a tunnel and could not be
    /// delivered.
    ///
    /// We only have the packet as the last router would have emitted
    /// it, so that router is asked to undo its rewrite, and the error
    /// is routed back from the last ingress port, which is not ours.
    pub(crate) fn send_icmp_for_tunneled_pkt(
        &mut self,
        code: UnreachCode,
        mut frame: Frame,
        last_ingress: PortId,
        last_egress: PortId,
    ) {
        frame.set_src_mac(SCRUBBED_MAC);
        frame.set_dst_mac(SCRUBBED_MAC);
        if !self.can_send_icmp(&frame, Some(last_egress)) {
            return;
        }

        self.network.undo_router_transformation(&mut frame);

        let Some(quoted) = frame.ip_header_and_leading_data() else {
            return;
        };
        let body = unreachable_body(code, quoted);

        let cfg = match self.network.port_config(last_ingress) {
            Ok(cfg) => cfg,
            Err(e) => {
                debug!(self.log, "no ICMP: last ingress unknown"; "err" => %e);
                return;
            }
        };
        let Some(dst) = frame.ip_src() else {
            return;
        };

        let pkt = build_icmp_frame(
            ROUTING_SRC_MAC,
            ROUTING_DST_MAC,
            cfg.port_addr,
            dst,
            &body,
        );
        let mut reply = match Frame::parse(pkt) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(self.log, "no ICMP: built bad reply"; "err" => %e);
                return;
            }
        };

        let flow_match = reply.flow_match(0, None);
        let mut fwd =
            ForwardInfo::new(last_ingress, flow_match, reply.bytes().to_vec());
        let mut routers = BTreeSet::new();

        let routed = match cfg.kind {
            // Hopefully the router agrees the error leaves by the port
            // the original packet came in on.
            PortKind::Materialized => self
                .network
                .process_in_router(last_ingress, &mut fwd, &mut routers)
                .map(|_| {
                    fwd.action == Some(Action::Forward)
                        && fwd.out_port_id == Some(last_ingress)
                }),

            PortKind::Logical { peer } => {
                fwd.in_port_id = peer;
                self.network
                    .process(&mut fwd, &mut routers)
                    .map(|_| fwd.action == Some(Action::Forward))
            }
        };

        // No flow is installed for the error.
        self.release_routers(&fwd.flow_match, &routers);

        match routed {
            Ok(true) => (),
            Ok(false) => {
                debug!(
                    self.log,
                    "no ICMP: routing did not forward it";
                    "action" => ?fwd.action,
                );
                return;
            }
            Err(e) => {
                debug!(self.log, "no ICMP: routing failed"; "err" => %e);
                return;
            }
        }

        let Some(out) = fwd.out_port_id else {
            return;
        };
        if self.ports.contains_id(out) {
            warn!(
                self.log,
                "dropping ICMP for tunneled packet, it would leave by a \
                local port";
                "port" => %out,
            );
            return;
        }

        let Some(tun_port) = self.tunnel_port_for_vport(out) else {
            debug!(self.log, "no ICMP: no tunnel toward"; "port" => %out);
            return;
        };

        // The receiver needs no ingress id for an error, so the slot
        // marks the packet as one instead.
        let next_hop = fwd.next_hop_nw_addr.unwrap_or(Ipv4Addr::ANY_ADDR);
        let (src, dst) =
            tunnel::encode(ICMP_TUNNEL, out.compressed(), next_hop);
        reply.set_src_mac(src);
        reply.set_dst_mac(dst);

        debug!(
            self.log,
            "tunneling ICMP {}", code;
            "tunnel_port" => tun_port,
            "egress" => %out,
        );
        self.send_unbuffered(reply.into_bytes(), tun_port);
    }
}
