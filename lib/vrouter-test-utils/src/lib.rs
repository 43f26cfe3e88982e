// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod dhcp;
pub mod frames;
pub mod mock;

pub use mock::Decision;
pub use mock::MockDirectory;
pub use mock::MockNetwork;
pub use mock::MockPortService;

// Let's make our lives easier and pub use a bunch of stuff.
pub use vrouter::api::*;
pub use vrouter::cfg::Config;
pub use vrouter::engine::controller::Controller;
pub use vrouter::engine::controller::DispatchError;
pub use vrouter::engine::network::Action;
pub use vrouter::engine::network::PortKind;
pub use vrouter::engine::network::RouterPortConfig;
pub use vrouter::engine::packet::Frame;
pub use vrouter::engine::resolve::ResolutionId;

use slog::Logger;
use slog::o;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A controller wired to fresh mocks, which are returned for
/// scripting and inspection.
pub struct Harness {
    pub ctl: Controller,
    pub net: MockNetwork,
    pub dir: MockDirectory,
    pub svc: MockPortService,
}

impl Harness {
    pub fn new(cfg: Config) -> Self {
        let net = MockNetwork::new();
        let dir = MockDirectory::new();
        let svc = MockPortService::new();
        let ctl = Controller::new(
            &test_logger(),
            cfg,
            Box::new(net.clone()),
            Box::new(dir.clone()),
            Box::new(svc.clone()),
        );
        Self { ctl, net, dir, svc }
    }

    /// Bind a materialized port on `num` and throw away the commands
    /// that produced.
    pub fn add_port(
        &mut self,
        num: u16,
        id: PortId,
        mac: MacAddr,
        cfg: RouterPortConfig,
    ) {
        self.net.set_port_config(id, cfg);
        self.ctl.add_virtual_port(num, &format!("vport{num}"), mac, id);
        let _ = self.ctl.drain_cmds();
    }
}

/// A /24 materialized port config with the router at `.1` and the
/// host at `.2`.
pub fn port_cfg(net: [u8; 3]) -> RouterPortConfig {
    let [a, b, c] = net;
    RouterPortConfig {
        port_addr: Ipv4Addr::from([a, b, c, 1]),
        local_nw_addr: Ipv4Addr::from([a, b, c, 2]),
        nw_addr: Ipv4Addr::from([a, b, c, 0]),
        nw_length: 24,
        kind: PortKind::Materialized,
    }
}

/// Split commands by kind.
pub fn flows(cmds: &[DatapathCmd]) -> Vec<&FlowMod> {
    cmds.iter()
        .filter_map(|c| match c {
            DatapathCmd::InstallFlow(f) => Some(f),
            _ => None,
        })
        .collect()
}

pub fn packet_outs(cmds: &[DatapathCmd]) -> Vec<&PacketOut> {
    cmds.iter()
        .filter_map(|c| match c {
            DatapathCmd::SendPacket(p) => Some(p),
            _ => None,
        })
        .collect()
}

pub fn freed_buffers(cmds: &[DatapathCmd]) -> Vec<u32> {
    cmds.iter()
        .filter_map(|c| match c {
            DatapathCmd::FreeBuffer(id) => Some(*id),
            _ => None,
        })
        .collect()
}
