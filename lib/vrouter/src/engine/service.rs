// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Service ports.
//!
//! A service (a BGP speaker, say) runs behind a port of the datapath
//! and talks to peers through one of the router's materialized ports.
//! Its traffic bypasses routing entirely: a handful of static flows
//! patch the service port straight through to the port it serves.

use super::controller::Controller;
use super::port::DevicePort;
use crate::api::BufferId;
use crate::api::DatapathCmd;
use crate::api::ETHER_TYPE_ARP;
use crate::api::ETHER_TYPE_IPV4;
use crate::api::FlowAction;
use crate::api::FlowMod;
use crate::api::FlowModFlags;
use crate::api::Ipv4Addr;
use crate::api::OFPP_CONTROLLER;
use crate::api::PROTO_ICMP;
use crate::api::PROTO_TCP;
use crate::api::PacketMatch;
use crate::api::PortId;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;

/// The OpenFlow default `max_len` for packets sent to the controller.
pub const CONTROLLER_MISS_LEN: u16 = 128;

impl Controller {
    fn service_flow(
        &mut self,
        flow_match: PacketMatch,
        actions: Vec<FlowAction>,
    ) {
        self.emit(DatapathCmd::InstallFlow(FlowMod {
            flow_match,
            cookie: 0,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: self.cfg.service_flow_priority,
            buffer_id: BufferId::Unbuffered,
            flags: FlowModFlags::empty(),
            actions,
        }));
    }

    /// Patch the TCP session (on `local_tport`/`remote_tport`), ARP
    /// and ICMP between a service on `local_port` and the router port
    /// on `remote_port`.
    pub fn set_service_flows(
        &mut self,
        local_port: u16,
        remote_port: u16,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        local_tport: u16,
        remote_tport: u16,
    ) {
        info!(
            self.log,
            "setting service flows";
            "local_port" => local_port,
            "remote_port" => remote_port,
            "local_addr" => %local_addr,
            "remote_addr" => %remote_addr,
        );

        // Packets the service flows copy to the controller arrive on
        // OFPP_LOCAL; they are really from the served port.
        self.service_target_port = Some(remote_port);

        let tcp = PacketMatch {
            dl_type: Some(ETHER_TYPE_IPV4),
            nw_proto: Some(PROTO_TCP),
            ..Default::default()
        };
        let to_remote = vec![FlowAction::output(remote_port)];
        let to_local = vec![FlowAction::output(local_port)];

        // Local to remote, either end of the session.
        let outbound = PacketMatch {
            in_port: Some(local_port),
            nw_src: Some(local_addr),
            nw_dst: Some(remote_addr),
            ..tcp.clone()
        };
        self.service_flow(
            PacketMatch { tp_dst: Some(remote_tport), ..outbound.clone() },
            to_remote.clone(),
        );
        self.service_flow(
            PacketMatch { tp_src: Some(local_tport), ..outbound },
            to_remote.clone(),
        );

        // Remote to local.
        let inbound = PacketMatch {
            in_port: Some(remote_port),
            nw_src: Some(remote_addr),
            nw_dst: Some(local_addr),
            ..tcp
        };
        self.service_flow(
            PacketMatch { tp_dst: Some(local_tport), ..inbound.clone() },
            to_local.clone(),
        );
        self.service_flow(
            PacketMatch { tp_src: Some(remote_tport), ..inbound },
            to_local.clone(),
        );

        // ARP. Replies from the remote side are also copied to us.
        self.service_flow(
            PacketMatch {
                in_port: Some(local_port),
                dl_type: Some(ETHER_TYPE_ARP),
                ..Default::default()
            },
            to_remote.clone(),
        );
        self.service_flow(
            PacketMatch {
                in_port: Some(remote_port),
                dl_type: Some(ETHER_TYPE_ARP),
                ..Default::default()
            },
            vec![
                FlowAction::output(local_port),
                FlowAction::Output {
                    port: OFPP_CONTROLLER,
                    max_len: CONTROLLER_MISS_LEN,
                },
            ],
        );

        // ICMP, only for the service's own address.
        self.service_flow(
            PacketMatch {
                in_port: Some(local_port),
                dl_type: Some(ETHER_TYPE_IPV4),
                nw_proto: Some(PROTO_ICMP),
                nw_src: Some(local_addr),
                ..Default::default()
            },
            to_remote,
        );
        self.service_flow(
            PacketMatch {
                in_port: Some(remote_port),
                dl_type: Some(ETHER_TYPE_IPV4),
                nw_proto: Some(PROTO_ICMP),
                nw_dst: Some(local_addr),
                ..Default::default()
            },
            to_local,
        );
    }

    /// A service port named `name` appeared as datapath port `num`.
    pub fn setup_service_port(&mut self, num: u16, name: &str) {
        let port_id = match self.service.get_remote_port(name) {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(
                    self.log,
                    "no router port served by service port";
                    "name" => name,
                );
                return;
            }
            Err(e) => {
                error!(
                    self.log,
                    "failed to look up service port";
                    "name" => name,
                    "err" => %e,
                );
                return;
            }
        };

        if let Err(e) = self.service.configure_port(port_id, name) {
            error!(
                self.log,
                "failed to configure service port";
                "name" => name,
                "err" => %e,
            );
            return;
        }

        self.start_port_service(num, port_id);
    }

    /// Start the service on `service_port` once the router port it
    /// serves is bound here.
    fn start_port_service(&mut self, service_port: u16, port_id: PortId) {
        let Some(target) = self.ports.get_by_id(port_id).map(|p| p.num) else {
            debug!(
                self.log,
                "deferring service until its port is added";
                "service_port" => service_port,
                "port" => %port_id,
            );
            self.service_watchers
                .entry(port_id)
                .or_default()
                .push(service_port);
            return;
        };

        self.start_service(service_port, target);
    }

    fn start_service(&mut self, service_port: u16, target: u16) {
        let dp = self.cfg.datapath_id;
        if let Err(e) = self.service.start(dp, service_port, target) {
            warn!(
                self.log,
                "failed to start service";
                "service_port" => service_port,
                "err" => %e,
            );
        }
    }

    /// Tell the service machinery about a newly added router port.
    pub(crate) fn add_service_port(&mut self, port: &DevicePort) {
        let services = match self.service.get_ports(port.id) {
            Ok(services) => services,
            Err(e) => {
                error!(
                    self.log,
                    "failed to look up services";
                    "port" => %port.id,
                    "err" => %e,
                );
                return;
            }
        };

        if !services.is_empty() {
            if let Some(waiting) = self.service_watchers.remove(&port.id) {
                for service_port in waiting {
                    self.start_service(service_port, port.num);
                }
                return;
            }
        }

        let dp = self.cfg.datapath_id;
        if let Err(e) = self.service.add_port(dp, port.id, port.mac) {
            error!(
                self.log,
                "failed to add port to service";
                "port" => %port.id,
                "err" => %e,
            );
        }
    }
}
