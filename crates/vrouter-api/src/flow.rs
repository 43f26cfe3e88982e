// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Datapath-facing types: the OpenFlow 1.0 match, the actions we
//! install, and the events and commands exchanged with a switch.
//!
//! These are typed values. Encoding them onto an OpenFlow channel is
//! the job of whatever owns the switch connection.

use super::ip::Ipv4Addr;
use super::mac::MacAddr;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Maximum number of physical switch ports.
pub const OFPP_MAX: u16 = 0xff00;
/// Send the packet out the input port.
pub const OFPP_IN_PORT: u16 = 0xfff8;
/// Send to controller.
pub const OFPP_CONTROLLER: u16 = 0xfffd;
/// Local openflow "port".
pub const OFPP_LOCAL: u16 = 0xfffe;
/// Not associated with a physical port.
pub const OFPP_NONE: u16 = 0xffff;

/// The buffer id a switch uses for a packet it did not buffer.
pub const NO_BUFFER: u32 = 0xffff_ffff;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;

/// The classification key of a flow.
///
/// A `None` field is wildcarded. For ICMP the type and code are
/// carried in `tp_src` and `tp_dst` respectively, as OpenFlow 1.0
/// does.
///
/// A match used as a key (by the flow tracker, or in an installed
/// flow) is never modified in place; a rewritten view of a packet
/// is a new `PacketMatch`.
#[derive(
    Clone,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PacketMatch {
    pub in_port: Option<u16>,
    pub dl_src: Option<MacAddr>,
    pub dl_dst: Option<MacAddr>,
    pub dl_type: Option<u16>,
    pub nw_proto: Option<u8>,
    pub nw_src: Option<Ipv4Addr>,
    pub nw_dst: Option<Ipv4Addr>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
    pub tunnel_id: Option<u64>,
}

impl PacketMatch {
    /// A match on nothing but the Ethernet type.
    pub fn ether_type(dl_type: u16) -> Self {
        Self { dl_type: Some(dl_type), ..Default::default() }
    }

    /// Keep only the fields that identify an L3 conversation: the
    /// ingress port, Ethernet type, IP endpoints and tunnel id.
    pub fn l3_only(&self) -> Self {
        Self {
            in_port: self.in_port,
            dl_type: self.dl_type,
            nw_src: self.nw_src,
            nw_dst: self.nw_dst,
            tunnel_id: self.tunnel_id,
            ..Default::default()
        }
    }
}

fn opt<T: Display>(
    f: &mut fmt::Formatter,
    name: &str,
    val: &Option<T>,
) -> fmt::Result {
    match val {
        Some(v) => write!(f, " {name}={v}"),
        None => Ok(()),
    }
}

impl Display for PacketMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "match[")?;
        opt(f, "in_port", &self.in_port)?;
        opt(f, "dl_src", &self.dl_src)?;
        opt(f, "dl_dst", &self.dl_dst)?;
        if let Some(t) = self.dl_type {
            write!(f, " dl_type=0x{t:04x}")?;
        }
        opt(f, "nw_proto", &self.nw_proto)?;
        opt(f, "nw_src", &self.nw_src)?;
        opt(f, "nw_dst", &self.nw_dst)?;
        opt(f, "tp_src", &self.tp_src)?;
        opt(f, "tp_dst", &self.tp_dst)?;
        opt(f, "tunnel_id", &self.tunnel_id)?;
        write!(f, " ]")
    }
}

/// Actions associated with flows and packets.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowAction {
    SetDlSrc(MacAddr),
    SetDlDst(MacAddr),
    SetNwSrc(Ipv4Addr),
    SetNwDst(Ipv4Addr),
    SetTpSrc(u16),
    SetTpDst(u16),
    /// Output to a port. `max_len` only matters when `port` is
    /// [`OFPP_CONTROLLER`].
    Output { port: u16, max_len: u16 },
}

impl FlowAction {
    pub fn output(port: u16) -> Self {
        Self::Output { port, max_len: 0 }
    }
}

/// Where the packet of a packet-in event lives.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum BufferId {
    /// The switch sent us the whole packet and kept nothing.
    Unbuffered,
    /// The switch is holding the packet under this id.
    Buffered(u32),
}

impl BufferId {
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }
}

impl From<u32> for BufferId {
    fn from(raw: u32) -> Self {
        if raw == NO_BUFFER { Self::Unbuffered } else { Self::Buffered(raw) }
    }
}

impl From<BufferId> for u32 {
    fn from(id: BufferId) -> u32 {
        match id {
            BufferId::Unbuffered => NO_BUFFER,
            BufferId::Buffered(raw) => raw,
        }
    }
}

bitflags! {
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
/// Flags carried by a flow-mod.
pub struct FlowModFlags: u16 {
    /// Have the switch report the flow when it expires or is deleted.
    const SEND_FLOW_REM = 1 << 0;
    /// Check for overlapping entries first.
    const CHECK_OVERLAP = 1 << 1;
    /// Remark this is for emergency.
    const EMERG = 1 << 2;
}
}

/// An add-flow request for the datapath.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowMod {
    pub flow_match: PacketMatch,
    pub cookie: u64,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    /// A buffered packet the new flow should be applied to.
    pub buffer_id: BufferId,
    pub flags: FlowModFlags,
    pub actions: Vec<FlowAction>,
}

/// A packet sent from the controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketOut {
    pub buffer_id: BufferId,
    pub in_port: u16,
    pub actions: Vec<FlowAction>,
    /// Empty when `buffer_id` refers to a packet held by the switch.
    pub data: Vec<u8>,
}

/// A packet sent to the controller by the datapath.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketIn {
    pub buffer_id: BufferId,
    pub total_len: u16,
    pub in_port: u16,
    pub data: Vec<u8>,
    /// Set when the packet arrived over a tunnel port.
    pub tunnel_id: Option<u64>,
}

/// Reason a flow was removed from a switch.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
}

impl Display for FlowRemovedReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::IdleTimeout => "idle-timeout",
            Self::HardTimeout => "hard-timeout",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// Flow removed (datapath -> controller).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowRemoved {
    pub flow_match: PacketMatch,
    pub cookie: u64,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub duration_secs: u32,
    pub packets: u64,
    pub bytes: u64,
}

/// A command for the datapath.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DatapathCmd {
    InstallFlow(FlowMod),
    SendPacket(PacketOut),
    /// Release a packet buffered by the switch without sending it.
    FreeBuffer(u32),
}
