// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Identifiers for virtual ports and the routers that own them.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// The identity of a virtual port.
///
/// This is stable and globally unique, unlike the datapath port
/// number the port happens to be bound to on a given switch.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PortId(Uuid);

impl PortId {
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// The 32-bit form carried in tunnel-encoded MAC addresses.
    ///
    /// This is the low 32 bits of the UUID. Port identifiers must be
    /// allocated so that this value is unique across the virtual
    /// topology.
    pub fn compressed(&self) -> u32 {
        // Truncation is the point.
        self.0.as_u128() as u32
    }

    /// Expand a compressed id received over a tunnel.
    ///
    /// The result is only the original id when the upper 96 bits of
    /// that id were zero, which is how tunnel-addressable ports are
    /// allocated.
    pub const fn from_compressed(id: u32) -> Self {
        Self(Uuid::from_u128(id as u128))
    }
}

impl From<Uuid> for PortId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity of a virtual router.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct RouterId(Uuid);

impl RouterId {
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
