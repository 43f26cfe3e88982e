// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The routers behind each installed flow.
//!
//! A router may allocate state for a flow while deciding how to
//! forward it (a NAT binding, for instance). That state must be
//! released once the datapath reports the flow gone, so the set of
//! routers traversed is kept under the flow's match until then.

use crate::api::PacketMatch;
use crate::api::RouterId;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// The routers behind one installed flow, grouped by the exact match
/// each of them allocated under.
///
/// A wildcarded flow can stand in for several exact matches, and each
/// router must be told about the match it actually saw.
pub type FlowRouters = BTreeMap<PacketMatch, BTreeSet<RouterId>>;

#[derive(Debug, Default)]
pub struct FlowTracker {
    flows: BTreeMap<PacketMatch, FlowRouters>,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `routers` handled `exact` and that the flow
    /// installed for it is `installed`.
    ///
    /// Tracking an installed match again adds to what is already held
    /// for it.
    pub fn track(
        &mut self,
        installed: PacketMatch,
        exact: PacketMatch,
        routers: BTreeSet<RouterId>,
    ) {
        self.flows
            .entry(installed)
            .or_default()
            .entry(exact)
            .or_default()
            .extend(routers);
    }

    /// Forget the installed flow and return the routers that must
    /// release it.
    pub fn remove(&mut self, installed: &PacketMatch) -> Option<FlowRouters> {
        self.flows.remove(installed)
    }

    pub fn get(&self, installed: &PacketMatch) -> Option<&FlowRouters> {
        self.flows.get(installed)
    }

    /// The number of installed flows tracked.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
