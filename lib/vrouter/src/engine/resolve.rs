// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Packets waiting on the MAC address of their next hop.
//!
//! Forwarding out of a local port needs the next hop's link address,
//! which the network learns asynchronously. The controller parks
//! everything it needs to finish the job under a [`ResolutionId`],
//! and picks it back up when the answer arrives through
//! [`Controller::on_mac_resolved`].

use super::controller::Controller;
use super::controller::make_actions_for_flow;
use super::icmp::UnreachCode;
use super::network::ForwardInfo;
use super::packet::Frame;
use super::tunnel::TunnelAddrs;
use crate::api::BufferId;
use crate::api::DatapathCmd;
use crate::api::MacAddr;
use crate::api::PacketMatch;
use crate::api::PacketOut;
use crate::api::PortId;
use crate::api::RouterId;
use core::fmt;
use core::fmt::Display;
use slog::debug;
use slog::warn;
use std::collections::BTreeSet;

/// Names one outstanding MAC resolution.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResolutionId(u64);

impl ResolutionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ResolutionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A packet from a local port, routed to a local port.
#[derive(Debug)]
pub struct LocalResolution {
    pub buffer_id: BufferId,
    pub first_ingress: PortId,
    pub first_ingress_num: u16,
    pub flow_match: PacketMatch,
    pub fwd: ForwardInfo,
    /// The packet as it arrived.
    pub frame: Frame,
    pub routers: BTreeSet<RouterId>,
}

/// A packet that arrived over a tunnel for one of our ports.
#[derive(Debug)]
pub struct TunneledResolution {
    pub buffer_id: BufferId,
    /// The tunnel port it arrived on.
    pub in_port: u16,
    pub flow_match: PacketMatch,
    pub addrs: TunnelAddrs,
    /// The ingress port of the last router, expanded from `addrs`.
    pub ingress: PortId,
    /// Our port the packet leaves by.
    pub egress: PortId,
    pub frame: Frame,
}

#[derive(Debug)]
pub enum PendingResolution {
    Local(LocalResolution),
    Tunneled(TunneledResolution),
}

impl Controller {
    /// Finish forwarding the packet parked under `id`.
    ///
    /// `mac` is `None` when resolution timed out.
    pub fn on_mac_resolved(&mut self, id: ResolutionId, mac: Option<MacAddr>) {
        match self.pending.remove(&id) {
            Some(PendingResolution::Local(res)) => self.finish_local(res, mac),
            Some(PendingResolution::Tunneled(res)) => {
                self.finish_tunneled(res, mac)
            }
            None => {
                warn!(self.log, "resolution for unknown id"; "id" => %id);
            }
        }
    }

    fn finish_local(&mut self, res: LocalResolution, mac: Option<MacAddr>) {
        let LocalResolution {
            buffer_id,
            first_ingress,
            first_ingress_num,
            flow_match,
            fwd,
            frame,
            routers,
        } = res;

        let Some(mac) = mac else {
            debug!(
                self.log,
                "resolution timed out for local packet";
                "match" => %flow_match,
            );
            let hard = self.cfg.icmp_expiry_secs;
            self.install_blackhole(flow_match.clone(), buffer_id, 0, hard);
            self.release_routers(&flow_match, &routers);
            self.send_icmp_for_local_pkt(
                UnreachCode::Host,
                first_ingress,
                &frame,
                &fwd,
                fwd.out_port_id,
            );
            return;
        };

        let out = fwd
            .out_port_id
            .and_then(|id| self.ports.get_by_id(id))
            .map(|port| (port.mac, port.num));
        let Some((port_mac, port_num)) = out else {
            warn!(
                self.log,
                "egress port went away during resolution";
                "port" => ?fwd.out_port_id,
            );
            self.release_routers(&flow_match, &routers);
            self.free_buffer(buffer_id);
            return;
        };

        debug!(
            self.log,
            "resolved, forwarding";
            "match" => %flow_match,
            "ingress" => first_ingress_num,
            "egress" => port_num,
        );

        let mut match_out = fwd.match_out;
        match_out.dl_src = Some(port_mac);
        match_out.dl_dst = Some(mac);
        let actions =
            make_actions_for_flow(&flow_match, &match_out, [port_num]);
        let installed = self.cfg.granularity.forward.apply(&flow_match);
        self.tracker.track(installed.clone(), flow_match, routers);
        self.add_flow_and_send_packet(
            buffer_id,
            installed,
            actions,
            frame.into_bytes(),
        );
    }

    fn finish_tunneled(
        &mut self,
        res: TunneledResolution,
        mac: Option<MacAddr>,
    ) {
        let TunneledResolution {
            buffer_id,
            in_port,
            flow_match,
            addrs,
            ingress,
            egress,
            frame,
        } = res;

        let Some(mac) = mac else {
            debug!(
                self.log,
                "resolution timed out for tunneled packet";
                "match" => %flow_match,
            );
            let hard = self.cfg.icmp_expiry_secs;
            self.install_blackhole(flow_match, buffer_id, 0, hard);
            self.send_icmp_for_tunneled_pkt(
                UnreachCode::Host,
                frame,
                ingress,
                egress,
            );
            return;
        };

        let Some(port) = self.ports.get_by_id(egress) else {
            warn!(
                self.log,
                "egress port went away during resolution";
                "port" => %egress,
            );
            self.free_buffer(buffer_id);
            return;
        };
        let (port_mac, port_num) = (port.mac, port.num);

        let match_out = PacketMatch {
            dl_src: Some(port_mac),
            dl_dst: Some(mac),
            ..flow_match.clone()
        };
        let actions =
            make_actions_for_flow(&flow_match, &match_out, [port_num]);

        // An ICMP error from a peer is delivered, but no flow is made
        // for it.
        if addrs.is_icmp() {
            debug!(self.log, "delivering tunneled ICMP"; "port" => port_num);
            let data = if buffer_id.is_buffered() {
                Vec::new()
            } else {
                frame.into_bytes()
            };
            self.emit(DatapathCmd::SendPacket(PacketOut {
                buffer_id,
                in_port,
                actions,
                data,
            }));
            return;
        }

        debug!(
            self.log,
            "resolved, delivering tunneled packet";
            "match" => %flow_match,
            "egress" => port_num,
        );
        let installed = self.cfg.granularity.tunnel.apply(&flow_match);
        self.add_flow_and_send_packet(
            buffer_id,
            installed,
            actions,
            frame.into_bytes(),
        );
    }
}
