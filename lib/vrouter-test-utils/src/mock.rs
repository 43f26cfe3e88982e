// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Scripted stand-ins for the controller's collaborators.
//!
//! Each mock is a cheap handle onto shared state, so a test keeps one
//! clone for scripting and inspection while the controller owns
//! another.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use vrouter::api::Ipv4Addr;
use vrouter::api::MacAddr;
use vrouter::api::PacketMatch;
use vrouter::api::PortId;
use vrouter::api::RouterId;
use vrouter::engine::network::Action;
use vrouter::engine::network::Directory;
use vrouter::engine::network::ForwardInfo;
use vrouter::engine::network::Network;
use vrouter::engine::network::NetworkError;
use vrouter::engine::network::PortService;
use vrouter::engine::network::RouterPortConfig;
use vrouter::engine::network::ServiceError;
use vrouter::engine::packet::Frame;
use vrouter::engine::resolve::ResolutionId;

/// What the next routing call decides.
#[derive(Clone, Debug, Default)]
pub struct Decision {
    pub action: Option<Action>,
    pub out_port: Option<PortId>,
    pub next_hop: Option<Ipv4Addr>,
    /// Replaces `match_out` when set.
    pub match_out: Option<PacketMatch>,
    /// Replaces `in_port_id` when set, as if more than one router ran.
    pub last_ingress: Option<PortId>,
    /// Replaces `pkt_in` when set.
    pub pkt_at_last_ingress: Option<Vec<u8>>,
    pub routers: Vec<RouterId>,
    /// Fail the call, after recording `routers` as traversed.
    pub error: Option<NetworkError>,
}

impl Decision {
    pub fn new(action: Action) -> Self {
        Self { action: Some(action), ..Default::default() }
    }

    pub fn forward(out_port: PortId, next_hop: Ipv4Addr) -> Self {
        Self {
            action: Some(Action::Forward),
            out_port: Some(out_port),
            next_hop: Some(next_hop),
            ..Default::default()
        }
    }

    pub fn via(mut self, routers: &[RouterId]) -> Self {
        self.routers = routers.to_vec();
        self
    }

    fn apply(
        self,
        fwd: &mut ForwardInfo,
        routers: &mut BTreeSet<RouterId>,
    ) -> Result<(), NetworkError> {
        routers.extend(self.routers);
        if let Some(err) = self.error {
            return Err(err);
        }

        fwd.action = self.action;
        fwd.out_port_id = self.out_port;
        fwd.next_hop_nw_addr = self.next_hop;
        fwd.depth = routers.len() as u32;
        if let Some(m) = self.match_out {
            fwd.match_out = m;
        }
        if let Some(port) = self.last_ingress {
            fwd.in_port_id = port;
        }
        if let Some(pkt) = self.pkt_at_last_ingress {
            fwd.pkt_in = pkt;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NetworkState {
    pub configs: BTreeMap<PortId, RouterPortConfig>,
    pub decisions: VecDeque<Decision>,
    pub in_router_decisions: VecDeque<Decision>,
    /// The `ForwardInfo` of every `process` call, as handed in.
    pub processed: Vec<ForwardInfo>,
    /// The port of every `process_in_router` call.
    pub processed_in_router: Vec<PortId>,
    pub freed: Vec<(RouterId, PacketMatch)>,
    pub mac_requests: Vec<(PortId, Ipv4Addr, ResolutionId)>,
    pub fail_mac_requests: bool,
    pub undo_calls: usize,
    pub added: Vec<PortId>,
    pub removed: Vec<PortId>,
}

#[derive(Clone, Debug, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap()
    }

    pub fn set_port_config(&self, id: PortId, cfg: RouterPortConfig) {
        self.state().configs.insert(id, cfg);
    }

    /// Queue the outcome of the next `process` call. Calls with
    /// nothing queued decide nothing.
    pub fn push_decision(&self, decision: Decision) {
        self.state().decisions.push_back(decision);
    }

    pub fn push_in_router_decision(&self, decision: Decision) {
        self.state().in_router_decisions.push_back(decision);
    }

    pub fn freed(&self) -> Vec<(RouterId, PacketMatch)> {
        self.state().freed.clone()
    }

    pub fn mac_requests(&self) -> Vec<(PortId, Ipv4Addr, ResolutionId)> {
        self.state().mac_requests.clone()
    }

    /// The id of the most recent MAC request.
    pub fn last_resolution(&self) -> ResolutionId {
        self.state().mac_requests.last().unwrap().2
    }
}

impl Network for MockNetwork {
    fn process(
        &mut self,
        fwd: &mut ForwardInfo,
        routers: &mut BTreeSet<RouterId>,
    ) -> Result<(), NetworkError> {
        let mut state = self.state();
        state.processed.push(fwd.clone());
        let decision = state.decisions.pop_front().unwrap_or_default();
        decision.apply(fwd, routers)
    }

    fn process_in_router(
        &mut self,
        port: PortId,
        fwd: &mut ForwardInfo,
        routers: &mut BTreeSet<RouterId>,
    ) -> Result<(), NetworkError> {
        let mut state = self.state();
        state.processed_in_router.push(port);
        let decision =
            state.in_router_decisions.pop_front().unwrap_or_default();
        decision.apply(fwd, routers)
    }

    fn request_mac(
        &mut self,
        port: PortId,
        ip: Ipv4Addr,
        id: ResolutionId,
    ) -> Result<(), NetworkError> {
        let mut state = self.state();
        if state.fail_mac_requests {
            return Err(NetworkError::Lookup(format!("no ARP cache for {ip}")));
        }
        state.mac_requests.push((port, ip, id));
        Ok(())
    }

    fn port_config(
        &self,
        port: PortId,
    ) -> Result<RouterPortConfig, NetworkError> {
        self.state()
            .configs
            .get(&port)
            .copied()
            .ok_or(NetworkError::UnknownPort(port))
    }

    fn undo_router_transformation(&mut self, _frame: &mut Frame) {
        self.state().undo_calls += 1;
    }

    fn free_flow_resources(
        &mut self,
        router: RouterId,
        flow_match: &PacketMatch,
    ) {
        self.state().freed.push((router, flow_match.clone()));
    }

    fn add_port(&mut self, port: PortId) -> Result<(), NetworkError> {
        self.state().added.push(port);
        Ok(())
    }

    fn remove_port(&mut self, port: PortId) -> Result<(), NetworkError> {
        self.state().removed.push(port);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DirectoryState {
    pub locations: BTreeMap<PortId, Ipv4Addr>,
    pub port_sets: BTreeMap<PortId, Vec<Ipv4Addr>>,
}

#[derive(Clone, Debug, Default)]
pub struct MockDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a remote port on the controller at `host`.
    pub fn set_location(&self, port: PortId, host: Ipv4Addr) {
        self.state.lock().unwrap().locations.insert(port, host);
    }

    pub fn set_port_set(&self, port_set: PortId, peers: Vec<Ipv4Addr>) {
        self.state.lock().unwrap().port_sets.insert(port_set, peers);
    }
}

impl Directory for MockDirectory {
    fn vport_location(&self, port: PortId) -> Option<Ipv4Addr> {
        self.state.lock().unwrap().locations.get(&port).copied()
    }

    fn port_set_peers(&self, port: PortId) -> Option<Vec<Ipv4Addr>> {
        self.state.lock().unwrap().port_sets.get(&port).cloned()
    }
}

#[derive(Debug, Default)]
pub struct ServiceState {
    /// Service names per router port, as `get_ports` reports them.
    pub services: BTreeMap<PortId, BTreeSet<String>>,
    /// Router port served by each service port name.
    pub remote_ports: BTreeMap<String, PortId>,
    pub added: Vec<(u64, PortId, MacAddr)>,
    pub configured: Vec<(PortId, String)>,
    pub started: Vec<(u64, u16, u16)>,
}

#[derive(Clone, Debug, Default)]
pub struct MockPortService {
    state: Arc<Mutex<ServiceState>>,
}

impl MockPortService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap()
    }

    /// Declare a service port `name` serving router port `port`.
    pub fn add_service(&self, port: PortId, name: &str) {
        let mut state = self.state();
        state.services.entry(port).or_default().insert(name.to_string());
        state.remote_ports.insert(name.to_string(), port);
    }
}

impl PortService for MockPortService {
    fn add_port(
        &mut self,
        datapath_id: u64,
        port: PortId,
        mac: MacAddr,
    ) -> Result<(), ServiceError> {
        self.state().added.push((datapath_id, port, mac));
        Ok(())
    }

    fn get_ports(
        &self,
        port: PortId,
    ) -> Result<BTreeSet<String>, ServiceError> {
        Ok(self.state().services.get(&port).cloned().unwrap_or_default())
    }

    fn configure_port(
        &mut self,
        port: PortId,
        name: &str,
    ) -> Result<(), ServiceError> {
        self.state().configured.push((port, name.to_string()));
        Ok(())
    }

    fn start(
        &mut self,
        datapath_id: u64,
        service_port: u16,
        target_port: u16,
    ) -> Result<(), ServiceError> {
        self.state().started.push((datapath_id, service_port, target_port));
        Ok(())
    }

    fn get_remote_port(
        &self,
        name: &str,
    ) -> Result<Option<PortId>, ServiceError> {
        Ok(self.state().remote_ports.get(name).copied())
    }
}
