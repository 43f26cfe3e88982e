// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Virtual topology carried in the Ethernet addresses of tunneled
//! frames.
//!
//! The tunnel encapsulation itself carries nothing about the virtual
//! network, so before a frame is sent to a peer controller its MAC
//! addresses are rewritten to hold the last ingress port, the last
//! egress port, and the next hop the egress router picked:
//!
//! ```text
//!           0    1    2    3    4    5
//! src:   [ ingress (BE)      | nh0  nh1 ]
//! dst:   [ nh2  nh3 | egress (BE)       ]
//! ```
//!
//! Every controller sharing a tunnel must agree on this layout byte
//! for byte.

use crate::api::Ipv4Addr;
use crate::api::MacAddr;

/// The ingress id marking a tunneled ICMP error generated by the
/// sending controller rather than ordinary traffic. The receiver
/// delivers such a packet without installing a flow for it.
pub const ICMP_TUNNEL: u32 = 0x05;

/// The virtual topology decoded from a tunneled frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TunnelAddrs {
    /// Compressed id of the last port the packet entered a router on.
    pub ingress: u32,
    /// Compressed id of the port the packet is to leave from.
    pub egress: u32,
    pub next_hop: Ipv4Addr,
}

impl TunnelAddrs {
    pub fn is_icmp(&self) -> bool {
        self.ingress == ICMP_TUNNEL
    }
}

/// Encode into a (source, destination) MAC pair.
pub fn encode(
    ingress: u32,
    egress: u32,
    next_hop: Ipv4Addr,
) -> (MacAddr, MacAddr) {
    let nh = u32::from(next_hop).to_be_bytes();
    let ing = ingress.to_be_bytes();
    let egr = egress.to_be_bytes();

    let src = [ing[0], ing[1], ing[2], ing[3], nh[0], nh[1]];
    let dst = [nh[2], nh[3], egr[0], egr[1], egr[2], egr[3]];
    (MacAddr::from(src), MacAddr::from(dst))
}

pub fn decode(src: MacAddr, dst: MacAddr) -> TunnelAddrs {
    let s = src.bytes();
    let d = dst.bytes();

    TunnelAddrs {
        ingress: u32::from_be_bytes([s[0], s[1], s[2], s[3]]),
        egress: u32::from_be_bytes([d[2], d[3], d[4], d[5]]),
        next_hop: Ipv4Addr::from([s[4], s[5], d[0], d[1]]),
    }
}
