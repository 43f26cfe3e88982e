// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Datapath ports known to the controller.

use super::network::RouterPortConfig;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::PortId;
use core::fmt;
use core::fmt::Display;
use std::collections::BTreeMap;
use thiserror::Error;

/// A virtual router port bound to a local datapath port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DevicePort {
    pub id: PortId,
    pub num: u16,
    pub name: String,
    pub mac: MacAddr,
    pub config: RouterPortConfig,
}

impl Display for DevicePort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} (num {} {} addr {})",
            self.id, self.num, self.mac, self.config.port_addr
        )
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("port number {0} is already bound")]
    NumInUse(u16),

    #[error("port {0} is already bound")]
    IdInUse(PortId),

    #[error("compressed id {0:#010x} is already bound to port number {1}")]
    CompressedInUse(u32, u16),

    #[error("port number {0} is not bound")]
    NumUnknown(u16),
}

/// The virtual ports bound on this datapath.
///
/// Ports are indexed by datapath port number, by id, and by the
/// compressed id carried in tunneled frames.
#[derive(Debug, Default)]
pub struct PortRegistry {
    by_num: BTreeMap<u16, DevicePort>,
    by_id: BTreeMap<PortId, u16>,
    by_compressed: BTreeMap<u32, u16>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, port: DevicePort) -> Result<(), RegistryError> {
        if self.by_num.contains_key(&port.num) {
            return Err(RegistryError::NumInUse(port.num));
        }

        if self.by_id.contains_key(&port.id) {
            return Err(RegistryError::IdInUse(port.id));
        }

        let compressed = port.id.compressed();
        if let Some(num) = self.by_compressed.get(&compressed) {
            return Err(RegistryError::CompressedInUse(compressed, *num));
        }

        let _ = self.by_id.insert(port.id, port.num);
        let _ = self.by_compressed.insert(compressed, port.num);
        let _ = self.by_num.insert(port.num, port);
        Ok(())
    }

    pub fn remove(&mut self, num: u16) -> Result<DevicePort, RegistryError> {
        let port =
            self.by_num.remove(&num).ok_or(RegistryError::NumUnknown(num))?;
        let _ = self.by_id.remove(&port.id);
        let _ = self.by_compressed.remove(&port.id.compressed());
        Ok(port)
    }

    pub fn get_by_num(&self, num: u16) -> Option<&DevicePort> {
        self.by_num.get(&num)
    }

    pub fn get_by_id(&self, id: PortId) -> Option<&DevicePort> {
        self.by_id.get(&id).and_then(|num| self.by_num.get(num))
    }

    pub fn get_by_compressed(&self, id: u32) -> Option<&DevicePort> {
        self.by_compressed.get(&id).and_then(|num| self.by_num.get(num))
    }

    pub fn contains_id(&self, id: PortId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_num.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_num.is_empty()
    }
}

/// Datapath ports that tunnel to peer controllers.
#[derive(Debug, Default)]
pub struct TunnelPorts {
    by_num: BTreeMap<u16, Ipv4Addr>,
    by_peer: BTreeMap<Ipv4Addr, u16>,
}

impl TunnelPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `num` as the tunnel to `peer`, replacing any previous
    /// binding of either.
    pub fn add(&mut self, num: u16, peer: Ipv4Addr) {
        if let Some(old_peer) = self.by_num.insert(num, peer) {
            let _ = self.by_peer.remove(&old_peer);
        }
        if let Some(old_num) = self.by_peer.insert(peer, num) {
            if old_num != num {
                let _ = self.by_num.remove(&old_num);
            }
        }
    }

    pub fn remove(&mut self, num: u16) -> Option<Ipv4Addr> {
        let peer = self.by_num.remove(&num)?;
        let _ = self.by_peer.remove(&peer);
        Some(peer)
    }

    pub fn is_tunnel(&self, num: u16) -> bool {
        self.by_num.contains_key(&num)
    }

    pub fn port_for_peer(&self, peer: Ipv4Addr) -> Option<u16> {
        self.by_peer.get(&peer).copied()
    }
}
