// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The collaborators the controller consults but does not own.
//!
//! The routing decision itself (route tables, rule chains, NAT) lives
//! behind [`Network`]. Where virtual ports physically live is answered
//! by [`Directory`]. BGP-style service ports are driven through
//! [`PortService`].

use super::packet::Frame;
use super::resolve::ResolutionId;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::PacketMatch;
use crate::api::PortId;
use crate::api::RouterId;
use core::fmt;
use core::fmt::Display;
use std::collections::BTreeSet;
use thiserror::Error;

/// The outcome of a routing decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Send the packet out `ForwardInfo::out_port_id`.
    Forward,
    /// Drop silently.
    Blackhole,
    /// The routing engine handled the packet itself (ARP, for
    /// example).
    Consumed,
    NotIpv4,
    /// Drop and tell the sender the network is unreachable.
    NoRoute,
    /// Drop and tell the sender it was administratively filtered.
    Reject,
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Forward => "FORWARD",
            Self::Blackhole => "BLACKHOLE",
            Self::Consumed => "CONSUMED",
            Self::NotIpv4 => "NOT_IPV4",
            Self::NoRoute => "NO_ROUTE",
            Self::Reject => "REJECT",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortKind {
    /// Bound to a datapath port somewhere.
    Materialized,
    /// Linked to a port of another router.
    Logical { peer: PortId },
}

/// The virtual configuration of a router port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouterPortConfig {
    /// The router's own address on this port.
    pub port_addr: Ipv4Addr,
    /// The address handed to whatever is attached to the port.
    pub local_nw_addr: Ipv4Addr,
    pub nw_addr: Ipv4Addr,
    pub nw_length: u8,
    pub kind: PortKind,
}

impl RouterPortConfig {
    pub fn subnet_mask(&self) -> Ipv4Addr {
        Ipv4Addr::netmask(self.nw_length)
    }

    pub fn subnet_broadcast(&self) -> Ipv4Addr {
        self.nw_addr.subnet_broadcast(self.nw_length)
    }
}

/// Everything known about one packet while a forwarding decision is
/// made for it.
#[derive(Clone, Debug)]
pub struct ForwardInfo {
    pub in_port_id: PortId,

    /// The match of the packet as it arrived. This is the key flows
    /// are installed and tracked under.
    pub flow_match: PacketMatch,

    /// The match the routing engine evaluates.
    pub match_in: PacketMatch,

    /// The match after every header rewrite applied along the way.
    pub match_out: PacketMatch,

    /// The frame. The routing engine replaces it with the packet as
    /// it looked when it entered the last router, which is what an
    /// ICMP error must quote.
    pub pkt_in: Vec<u8>,

    pub action: Option<Action>,

    pub out_port_id: Option<PortId>,

    pub next_hop_nw_addr: Option<Ipv4Addr>,

    /// The number of routers traversed.
    pub depth: u32,
}

impl ForwardInfo {
    pub fn new(
        in_port_id: PortId,
        flow_match: PacketMatch,
        pkt: Vec<u8>,
    ) -> Self {
        Self {
            in_port_id,
            match_in: flow_match.clone(),
            match_out: flow_match.clone(),
            flow_match,
            pkt_in: pkt,
            action: None,
            out_port_id: None,
            next_hop_nw_addr: None,
            depth: 0,
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NetworkError {
    #[error("unknown port {0}")]
    UnknownPort(PortId),

    #[error("routing failed: {0}")]
    Routing(String),

    #[error("address resolution failed: {0}")]
    Lookup(String),

    #[error("state access failed: {0}")]
    Storage(String),
}

/// The routing-decision engine.
pub trait Network: Send {
    /// Route a packet starting at `fwd.in_port_id`.
    ///
    /// On return `fwd.action` is set and, for [`Action::Forward`], so
    /// are the egress port and next hop. Every router visited is
    /// added to `routers`, including on error.
    fn process(
        &mut self,
        fwd: &mut ForwardInfo,
        routers: &mut BTreeSet<RouterId>,
    ) -> Result<(), NetworkError>;

    /// Run only the decision of the router owning `port`.
    fn process_in_router(
        &mut self,
        port: PortId,
        fwd: &mut ForwardInfo,
        routers: &mut BTreeSet<RouterId>,
    ) -> Result<(), NetworkError>;

    /// Start resolving `ip` on the network attached to `port`.
    ///
    /// The result is delivered later, exactly once, by handing `id`
    /// to [`Controller::on_mac_resolved`]. If this returns an error
    /// there will be no delivery.
    ///
    /// [`Controller::on_mac_resolved`]:
    ///     super::controller::Controller::on_mac_resolved
    fn request_mac(
        &mut self,
        port: PortId,
        ip: Ipv4Addr,
        id: ResolutionId,
    ) -> Result<(), NetworkError>;

    fn port_config(
        &self,
        port: PortId,
    ) -> Result<RouterPortConfig, NetworkError>;

    /// Revert the header rewrite (NAT, for instance) the last router
    /// applied to `frame`.
    fn undo_router_transformation(&mut self, frame: &mut Frame);

    /// Release what `router` allocated for flows matching
    /// `flow_match`.
    fn free_flow_resources(
        &mut self,
        router: RouterId,
        flow_match: &PacketMatch,
    );

    fn add_port(&mut self, port: PortId) -> Result<(), NetworkError>;

    fn remove_port(&mut self, port: PortId) -> Result<(), NetworkError>;
}

/// The location of virtual ports in the physical network.
pub trait Directory: Send {
    /// The tunnel address of the host a port is bound on.
    fn vport_location(&self, port: PortId) -> Option<Ipv4Addr>;

    /// If `port` names a port set, the tunnel addresses of the hosts
    /// with members of the set.
    fn port_set_peers(&self, port: PortId) -> Option<Vec<Ipv4Addr>>;
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("port service: {0}")]
pub struct ServiceError(pub String);

/// Service ports (BGP speakers, for instance) attached next to
/// router ports.
pub trait PortService: Send {
    /// Announce a newly bound router port.
    fn add_port(
        &mut self,
        datapath_id: u64,
        port: PortId,
        mac: MacAddr,
    ) -> Result<(), ServiceError>;

    /// The names of the service ports configured for a router port.
    fn get_ports(&self, port: PortId) -> Result<BTreeSet<String>, ServiceError>;

    fn configure_port(
        &mut self,
        port: PortId,
        name: &str,
    ) -> Result<(), ServiceError>;

    /// Start the service on `service_port`, talking to the router
    /// port bound at `target_port`.
    fn start(
        &mut self,
        datapath_id: u64,
        service_port: u16,
        target_port: u16,
    ) -> Result<(), ServiceError>;

    /// The router port a named service port serves.
    fn get_remote_port(
        &self,
        name: &str,
    ) -> Result<Option<PortId>, ServiceError>;
}
