// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The ingress dispatcher.
//!
//! A [`Controller`] turns datapath events into forwarding decisions
//! and the flows that cache them. It performs no I/O of its own:
//! every handler pushes [`DatapathCmd`] values into an outbox which
//! the owner drains with [`Controller::drain_cmds`], and collaborators
//! answer asynchronous requests (address resolution) by calling back
//! into the controller with a new event.
//!
//! The handlers for resolution completions, ICMP errors and service
//! ports live in their own modules as further `impl Controller`
//! blocks.

use super::dhcp;
use super::dhcp::DhcpError;
use super::flow_tracker::FlowTracker;
use super::icmp::UnreachCode;
use super::network::Action;
use super::network::Directory;
use super::network::ForwardInfo;
use super::network::Network;
use super::network::PortService;
use super::packet::DHCP_CLIENT_PORT;
use super::packet::DHCP_SERVER_PORT;
use super::packet::Frame;
use super::port::DevicePort;
use super::port::PortRegistry;
use super::port::TunnelPorts;
use super::resolve::LocalResolution;
use super::resolve::PendingResolution;
use super::resolve::ResolutionId;
use super::resolve::TunneledResolution;
use super::tunnel;
use crate::api::BufferId;
use crate::api::DatapathCmd;
use crate::api::ETHER_TYPE_IPV4;
use crate::api::FlowAction;
use crate::api::FlowMod;
use crate::api::FlowModFlags;
use crate::api::FlowRemoved;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::OFPP_CONTROLLER;
use crate::api::OFPP_LOCAL;
use crate::api::OFPP_NONE;
use crate::api::PROTO_UDP;
use crate::api::PacketIn;
use crate::api::PacketMatch;
use crate::api::PacketOut;
use crate::api::PortId;
use crate::api::RouterId;
use crate::cfg::Config;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// How many bytes of a DHCP request the datapath sends us.
pub const DHCP_MISS_LEN: u16 = 1024;

/// Errors surfaced to the owner of a [`Controller`].
///
/// Everything else that can go wrong while handling a packet is dealt
/// with (logged, buffer freed, resources released) before the handler
/// returns.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DispatchError {
    #[error("routing returned an unusable decision: {0}")]
    ContractViolation(String),
}

/// Build the actions turning a packet that matched `orig` into one
/// that matches `out`, then sending it out of each of `ports`.
pub fn make_actions_for_flow<I>(
    orig: &PacketMatch,
    out: &PacketMatch,
    ports: I,
) -> Vec<FlowAction>
where
    I: IntoIterator<Item = u16>,
{
    let mut actions = Vec::new();

    if let Some(mac) = out.dl_src.filter(|_| orig.dl_src != out.dl_src) {
        actions.push(FlowAction::SetDlSrc(mac));
    }

    if let Some(mac) = out.dl_dst.filter(|_| orig.dl_dst != out.dl_dst) {
        actions.push(FlowAction::SetDlDst(mac));
    }

    if let Some(ip) = out.nw_src.filter(|_| orig.nw_src != out.nw_src) {
        actions.push(FlowAction::SetNwSrc(ip));
    }

    if let Some(ip) = out.nw_dst.filter(|_| orig.nw_dst != out.nw_dst) {
        actions.push(FlowAction::SetNwDst(ip));
    }

    if let Some(p) = out.tp_src.filter(|_| orig.tp_src != out.tp_src) {
        actions.push(FlowAction::SetTpSrc(p));
    }

    if let Some(p) = out.tp_dst.filter(|_| orig.tp_dst != out.tp_dst) {
        actions.push(FlowAction::SetTpDst(p));
    }

    actions.extend(ports.into_iter().map(FlowAction::output));
    actions
}

/// The flow sending a port's DHCP requests to the controller.
pub fn dhcp_flow(port_num: u16, priority: u16) -> FlowMod {
    FlowMod {
        flow_match: PacketMatch {
            in_port: Some(port_num),
            dl_type: Some(ETHER_TYPE_IPV4),
            nw_proto: Some(PROTO_UDP),
            tp_src: Some(DHCP_CLIENT_PORT),
            tp_dst: Some(DHCP_SERVER_PORT),
            ..Default::default()
        },
        cookie: 0,
        idle_timeout: 0,
        hard_timeout: 0,
        priority,
        buffer_id: BufferId::Unbuffered,
        flags: FlowModFlags::empty(),
        actions: vec![FlowAction::Output {
            port: OFPP_CONTROLLER,
            max_len: DHCP_MISS_LEN,
        }],
    }
}

pub struct Controller {
    pub(crate) log: Logger,
    pub(crate) cfg: Config,
    pub(crate) network: Box<dyn Network>,
    pub(crate) directory: Box<dyn Directory>,
    pub(crate) service: Box<dyn PortService>,
    pub(crate) ports: PortRegistry,
    pub(crate) tunnels: TunnelPorts,
    pub(crate) tracker: FlowTracker,
    pub(crate) pending: BTreeMap<ResolutionId, PendingResolution>,
    pub(crate) next_resolution: u64,
    /// Where packets trapped to `OFPP_LOCAL` by the service flows
    /// really came from.
    pub(crate) service_target_port: Option<u16>,
    /// Service ports waiting for the port they serve to be added,
    /// keyed by that port.
    pub(crate) service_watchers: BTreeMap<PortId, Vec<u16>>,
    outbox: Vec<DatapathCmd>,
}

impl Controller {
    pub fn new(
        log: &Logger,
        cfg: Config,
        network: Box<dyn Network>,
        directory: Box<dyn Directory>,
        service: Box<dyn PortService>,
    ) -> Self {
        let log = log.new(o!(
            "component" => "vrouter-controller",
            "datapath" => cfg.datapath_id,
        ));

        Self {
            log,
            cfg,
            network,
            directory,
            service,
            ports: PortRegistry::new(),
            tunnels: TunnelPorts::new(),
            tracker: FlowTracker::new(),
            pending: BTreeMap::new(),
            next_resolution: 0,
            service_target_port: None,
            service_watchers: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn tracker(&self) -> &FlowTracker {
        &self.tracker
    }

    /// The number of resolutions still waiting for an answer.
    pub fn pending_resolutions(&self) -> usize {
        self.pending.len()
    }

    /// Take every command issued since the last call.
    pub fn drain_cmds(&mut self) -> Vec<DatapathCmd> {
        core::mem::take(&mut self.outbox)
    }

    pub(crate) fn emit(&mut self, cmd: DatapathCmd) {
        self.outbox.push(cmd);
    }

    pub(crate) fn free_buffer(&mut self, buffer_id: BufferId) {
        if let BufferId::Buffered(raw) = buffer_id {
            self.emit(DatapathCmd::FreeBuffer(raw));
        }
    }

    /// Let each router release whatever it set aside for the flow.
    pub(crate) fn release_routers(
        &mut self,
        flow_match: &PacketMatch,
        routers: &BTreeSet<RouterId>,
    ) {
        for router in routers {
            self.network.free_flow_resources(*router, flow_match);
        }
    }

    /// Install a drop flow. A buffered packet is dropped by the
    /// datapath applying the new flow to it.
    pub(crate) fn install_blackhole(
        &mut self,
        flow_match: PacketMatch,
        buffer_id: BufferId,
        idle_timeout: u16,
        hard_timeout: u16,
    ) {
        self.emit(DatapathCmd::InstallFlow(FlowMod {
            flow_match,
            cookie: 0,
            idle_timeout,
            hard_timeout,
            priority: self.cfg.flow_priority,
            buffer_id,
            flags: FlowModFlags::SEND_FLOW_REM,
            actions: vec![],
        }));
    }

    /// Install a forwarding flow and make sure the packet that
    /// triggered it is forwarded too.
    pub(crate) fn add_flow_and_send_packet(
        &mut self,
        buffer_id: BufferId,
        flow_match: PacketMatch,
        actions: Vec<FlowAction>,
        data: Vec<u8>,
    ) {
        self.emit(DatapathCmd::InstallFlow(FlowMod {
            flow_match,
            cookie: 0,
            idle_timeout: self.cfg.idle_flow_expire_secs,
            hard_timeout: 0,
            priority: self.cfg.flow_priority,
            buffer_id,
            flags: FlowModFlags::SEND_FLOW_REM,
            actions: actions.clone(),
        }));

        // The datapath only applies a new flow to a packet it is
        // holding.
        if !buffer_id.is_buffered() && !data.is_empty() {
            self.emit(DatapathCmd::SendPacket(PacketOut {
                buffer_id: BufferId::Unbuffered,
                in_port: OFPP_NONE,
                actions,
                data,
            }));
        }
    }

    pub(crate) fn send_unbuffered(&mut self, data: Vec<u8>, port_num: u16) {
        self.emit(DatapathCmd::SendPacket(PacketOut {
            buffer_id: BufferId::Unbuffered,
            in_port: OFPP_NONE,
            actions: vec![FlowAction::output(port_num)],
            data,
        }));
    }

    /// The tunnel port leading to the host a remote virtual port
    /// lives on.
    pub(crate) fn tunnel_port_for_vport(&self, port: PortId) -> Option<u16> {
        let peer = self.directory.vport_location(port)?;
        self.tunnels.port_for_peer(peer)
    }

    pub(crate) fn next_resolution_id(&mut self) -> ResolutionId {
        let id = ResolutionId::new(self.next_resolution);
        self.next_resolution += 1;
        id
    }

    fn contract_violation(
        &mut self,
        detail: String,
        buffer_id: BufferId,
        flow_match: &PacketMatch,
        routers: &BTreeSet<RouterId>,
    ) -> Result<(), DispatchError> {
        error!(
            self.log,
            "routing contract violated";
            "detail" => %detail,
            "match" => %flow_match,
        );
        self.free_buffer(buffer_id);
        self.release_routers(flow_match, routers);
        Err(DispatchError::ContractViolation(detail))
    }

    /// Handle a packet the datapath had no flow for.
    pub fn on_packet_in(&mut self, pi: PacketIn) -> Result<(), DispatchError> {
        let PacketIn { buffer_id, in_port: arrival_port, data, tunnel_id, .. } =
            pi;

        let mut in_port = arrival_port;
        if in_port == OFPP_LOCAL {
            if let Some(target) = self.service_target_port {
                debug!(
                    self.log,
                    "rewriting local ingress to service target";
                    "target" => target,
                );
                in_port = target;
            }
        }

        let dev_in = match self.ports.get_by_num(in_port) {
            Some(port) => Some(port.clone()),
            None if self.tunnels.is_tunnel(in_port) => None,
            None => {
                debug!(
                    self.log,
                    "dropping packet from unknown port";
                    "port" => in_port,
                );
                self.free_buffer(buffer_id);
                return Ok(());
            }
        };

        let frame = match Frame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    self.log,
                    "dropping malformed packet";
                    "port" => in_port,
                    "err" => %e,
                );
                self.free_buffer(buffer_id);
                return Ok(());
            }
        };

        let flow_match = frame.flow_match(arrival_port, tunnel_id);

        let Some(dev_in) = dev_in else {
            self.on_tunnel_ingress(buffer_id, in_port, flow_match, frame);
            return Ok(());
        };

        if frame.is_dhcp_request() {
            match dhcp::handle_request(
                &frame,
                &dev_in,
                self.cfg.dhcp_lease_secs,
            ) {
                Ok((reply, notes)) => {
                    for note in notes {
                        warn!(self.log, "{}", note; "port" => %dev_in.id);
                    }
                    debug!(self.log, "sending DHCP reply"; "port" => %dev_in);
                    self.send_unbuffered(reply, dev_in.num);
                    self.free_buffer(buffer_id);
                    return Ok(());
                }

                // A boot reply on the server port is routed like any
                // other packet.
                Err(DhcpError::NotRequest(_)) => (),

                Err(e) => {
                    warn!(
                        self.log,
                        "dropping DHCP request";
                        "port" => %dev_in.id,
                        "err" => %e,
                    );
                    self.free_buffer(buffer_id);
                    return Ok(());
                }
            }
        }

        let dl_dst = frame.dst_mac();
        if dl_dst != dev_in.mac && !dl_dst.is_multicast() {
            warn!(
                self.log,
                "dl_dst is neither multicast nor the port's address";
                "dl_dst" => %dl_dst,
                "port" => %dev_in.id,
            );
            let hard = self.cfg.icmp_expiry_secs;
            self.install_blackhole(flow_match, buffer_id, 0, hard);
            return Ok(());
        }

        let mut fwd = ForwardInfo::new(
            dev_in.id,
            flow_match.clone(),
            frame.bytes().to_vec(),
        );
        let mut routers = BTreeSet::new();
        if let Err(e) = self.network.process(&mut fwd, &mut routers) {
            warn!(
                self.log,
                "dropping packet, routing failed";
                "match" => %flow_match,
                "err" => %e,
            );
            self.free_buffer(buffer_id);
            self.release_routers(&flow_match, &routers);
            return Ok(());
        }

        let hard = self.cfg.icmp_expiry_secs;
        let action = fwd.action;
        match action {
            Some(Action::Blackhole) => {
                debug!(self.log, "blackhole"; "match" => %flow_match);
                let m = self.cfg.granularity.blackhole.apply(&flow_match);
                self.install_blackhole(m, buffer_id, 0, hard);
                // The drop flow is short lived and nothing is held for
                // it, so the routers are done with it now.
                self.release_routers(&flow_match, &routers);
            }

            Some(Action::Consumed) => {
                debug!(self.log, "consumed"; "match" => %flow_match);
                self.free_buffer(buffer_id);
            }

            Some(Action::Forward) => {
                return self.forward(
                    buffer_id, &dev_in, flow_match, frame, fwd, routers,
                );
            }

            Some(Action::NotIpv4) => {
                let dl_type = frame.ether_type();
                debug!(self.log, "not IPv4"; "dl_type" => dl_type);
                // One drop flow per ethertype.
                let m = PacketMatch::ether_type(dl_type);
                self.install_blackhole(m, buffer_id, 0, 0);
            }

            Some(Action::NoRoute) => {
                debug!(self.log, "no route"; "match" => %flow_match);
                self.install_blackhole(flow_match.clone(), buffer_id, 0, hard);
                self.release_routers(&flow_match, &routers);
                self.send_icmp_for_local_pkt(
                    UnreachCode::Net,
                    dev_in.id,
                    &frame,
                    &fwd,
                    fwd.out_port_id,
                );
            }

            Some(Action::Reject) => {
                debug!(self.log, "reject"; "match" => %flow_match);
                self.install_blackhole(flow_match.clone(), buffer_id, 0, hard);
                self.release_routers(&flow_match, &routers);
                self.send_icmp_for_local_pkt(
                    UnreachCode::FilterProhibited,
                    dev_in.id,
                    &frame,
                    &fwd,
                    fwd.out_port_id,
                );
            }

            None => {
                return self.contract_violation(
                    "no action".to_string(),
                    buffer_id,
                    &flow_match,
                    &routers,
                );
            }
        }

        Ok(())
    }

    fn on_tunnel_ingress(
        &mut self,
        buffer_id: BufferId,
        in_port: u16,
        flow_match: PacketMatch,
        frame: Frame,
    ) {
        let addrs = tunnel::decode(frame.src_mac(), frame.dst_mac());

        // The peer only tunnels to us for ports we own; anything else
        // means the two of us disagree about where ports live.
        let Some(egress) = self.ports.get_by_compressed(addrs.egress) else {
            warn!(
                self.log,
                "tunneled packet for an egress port that is not local";
                "egress" => addrs.egress,
                "tunnel_port" => in_port,
            );
            return;
        };
        let egress = egress.id;

        let id = self.next_resolution_id();
        if let Err(e) = self.network.request_mac(egress, addrs.next_hop, id) {
            warn!(
                self.log,
                "dropping tunneled packet, resolution failed";
                "next_hop" => %addrs.next_hop,
                "err" => %e,
            );
            self.free_buffer(buffer_id);
            return;
        }

        let _ = self.pending.insert(
            id,
            PendingResolution::Tunneled(TunneledResolution {
                buffer_id,
                in_port,
                flow_match,
                ingress: PortId::from_compressed(addrs.ingress),
                egress,
                addrs,
                frame,
            }),
        );
    }

    fn forward(
        &mut self,
        buffer_id: BufferId,
        dev_in: &DevicePort,
        flow_match: PacketMatch,
        frame: Frame,
        mut fwd: ForwardInfo,
        routers: BTreeSet<RouterId>,
    ) -> Result<(), DispatchError> {
        let Some(out_id) = fwd.out_port_id else {
            return self.contract_violation(
                "FORWARD without an egress port".to_string(),
                buffer_id,
                &flow_match,
                &routers,
            );
        };

        // Local egress: resolve the next hop, then finish up in
        // `on_mac_resolved`.
        if self.ports.contains_id(out_id) {
            let Some(next_hop) = fwd.next_hop_nw_addr.or(fwd.match_out.nw_dst)
            else {
                return self.contract_violation(
                    "FORWARD without a next hop".to_string(),
                    buffer_id,
                    &flow_match,
                    &routers,
                );
            };

            let id = self.next_resolution_id();
            if let Err(e) = self.network.request_mac(out_id, next_hop, id) {
                warn!(
                    self.log,
                    "dropping packet, resolution failed";
                    "next_hop" => %next_hop,
                    "err" => %e,
                );
                self.free_buffer(buffer_id);
                self.release_routers(&flow_match, &routers);
                return Ok(());
            }

            let _ = self.pending.insert(
                id,
                PendingResolution::Local(LocalResolution {
                    buffer_id,
                    first_ingress: dev_in.id,
                    first_ingress_num: dev_in.num,
                    flow_match,
                    fwd,
                    frame,
                    routers,
                }),
            );
            return Ok(());
        }

        let hard = self.cfg.icmp_expiry_secs;

        if let Some(peers) = self.directory.port_set_peers(out_id) {
            let local = self.cfg.local_tunnel_addr.map(Ipv4Addr::from);
            let mut out_ports = BTreeSet::new();
            for peer in peers.into_iter().filter(|p| Some(*p) != local) {
                match self.tunnels.port_for_peer(peer) {
                    Some(num) => {
                        let _ = out_ports.insert(num);
                    }
                    None => {
                        warn!(
                            self.log,
                            "no tunnel port for port set peer";
                            "peer" => %peer,
                        );
                    }
                }
            }

            if out_ports.is_empty() {
                warn!(
                    self.log,
                    "no tunnel reaches any member of port set";
                    "port_set" => %out_id,
                );
                self.install_blackhole(flow_match.clone(), buffer_id, 0, hard);
                self.release_routers(&flow_match, &routers);
                self.send_icmp_for_local_pkt(
                    UnreachCode::Net,
                    dev_in.id,
                    &frame,
                    &fwd,
                    None,
                );
                return Ok(());
            }

            let actions =
                make_actions_for_flow(&flow_match, &fwd.match_out, out_ports);
            let installed = self.cfg.granularity.tunnel.apply(&flow_match);
            self.tracker.track(installed.clone(), flow_match, routers);
            self.add_flow_and_send_packet(
                buffer_id,
                installed,
                actions,
                frame.into_bytes(),
            );
            return Ok(());
        }

        let Some(tun_port) = self.tunnel_port_for_vport(out_id) else {
            warn!(
                self.log,
                "no tunnel port toward egress";
                "egress" => %out_id,
            );
            self.install_blackhole(flow_match.clone(), buffer_id, 0, hard);
            self.release_routers(&flow_match, &routers);
            self.send_icmp_for_local_pkt(
                UnreachCode::Net,
                dev_in.id,
                &frame,
                &fwd,
                None,
            );
            return Ok(());
        };

        debug!(
            self.log,
            "forwarding to tunnel";
            "tunnel_port" => tun_port,
            "egress" => %out_id,
        );
        let next_hop = fwd.next_hop_nw_addr.unwrap_or(Ipv4Addr::ANY_ADDR);
        let (dl_src, dl_dst) = tunnel::encode(
            fwd.in_port_id.compressed(),
            out_id.compressed(),
            next_hop,
        );
        fwd.match_out.dl_src = Some(dl_src);
        fwd.match_out.dl_dst = Some(dl_dst);

        let actions =
            make_actions_for_flow(&flow_match, &fwd.match_out, [tun_port]);
        let installed = self.cfg.granularity.tunnel.apply(&flow_match);
        self.tracker.track(installed.clone(), flow_match, routers);
        self.add_flow_and_send_packet(
            buffer_id,
            installed,
            actions,
            frame.into_bytes(),
        );
        Ok(())
    }

    /// Release the routers behind a flow the datapath dropped.
    pub fn on_flow_removed(&mut self, fr: &FlowRemoved) {
        debug!(
            self.log,
            "flow removed";
            "match" => %fr.flow_match,
            "reason" => %fr.reason,
            "packets" => fr.packets,
            "bytes" => fr.bytes,
        );

        let Some(held) = self.tracker.remove(&fr.flow_match) else {
            return;
        };
        for (exact, routers) in held {
            self.release_routers(&exact, &routers);
        }
    }

    pub fn add_virtual_port(
        &mut self,
        num: u16,
        name: &str,
        mac: MacAddr,
        id: PortId,
    ) {
        if self.ports.get_by_num(num).is_some() {
            error!(
                self.log,
                "virtual port already added";
                "num" => num,
                "name" => name,
            );
            return;
        }

        let config = match self.network.port_config(id) {
            Ok(config) => config,
            Err(e) => {
                error!(
                    self.log,
                    "cannot add virtual port without its config";
                    "num" => num,
                    "id" => %id,
                    "err" => %e,
                );
                return;
            }
        };

        let port = DevicePort { id, num, name: name.to_string(), mac, config };
        if let Err(e) = self.ports.add(port.clone()) {
            error!(self.log, "failed to add virtual port"; "err" => %e);
            return;
        }

        info!(
            self.log,
            "added virtual port";
            "num" => num,
            "id" => %id,
            "addr" => %config.port_addr,
        );

        if let Err(e) = self.network.add_port(id) {
            error!(self.log, "network rejected port"; "id" => %id, "err" => %e);
        }
        self.add_service_port(&port);

        let flow = dhcp_flow(num, self.cfg.service_flow_priority);
        self.emit(DatapathCmd::InstallFlow(flow));
    }

    pub fn delete_virtual_port(&mut self, num: u16, id: PortId) {
        let Some(port) = self.ports.get_by_num(num) else {
            error!(
                self.log,
                "deleting virtual port that was never added";
                "num" => num,
                "id" => %id,
            );
            return;
        };

        info!(
            self.log,
            "deleting virtual port";
            "num" => num,
            "id" => %port.id,
            "addr" => %port.config.port_addr,
        );

        let port_id = port.id;
        if let Err(e) = self.network.remove_port(port_id) {
            error!(
                self.log,
                "network failed to remove port";
                "id" => %port_id,
                "err" => %e,
            );
        }

        let _ = self.ports.remove(num);
    }

    pub fn add_tunnel_port(&mut self, num: u16, peer: Ipv4Addr) {
        info!(self.log, "added tunnel port"; "num" => num, "peer" => %peer);
        self.tunnels.add(num, peer);
    }

    pub fn remove_tunnel_port(&mut self, num: u16) {
        match self.tunnels.remove(num) {
            Some(peer) => {
                info!(
                    self.log,
                    "removed tunnel port";
                    "num" => num,
                    "peer" => %peer,
                );
            }
            None => {
                warn!(self.log, "removing unknown tunnel port"; "num" => num);
            }
        }
    }
}
