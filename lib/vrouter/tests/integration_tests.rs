// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Integration tests.
//!
//! Each test drives a [`Controller`] wired to scripted mocks: the
//! routing decision for every packet is queued up front, and the
//! datapath commands the controller issues are checked afterwards.

use common::dhcp::DhcpReq;
use common::dhcp::gen_dhcp_request;
use common::dhcp::parse_reply;
use common::frames::*;
use common::*;
use vrouter::cfg::FlowGranularity;
use vrouter::cfg::GranularityCfg;
use vrouter::engine::dhcp::MessageType;
use vrouter::engine::dhcp::opt;
use vrouter::engine::network::NetworkError;
use vrouter::engine::tunnel;
use vrouter::engine::tunnel::ICMP_TUNNEL;
use vrouter::task::ControllerStatus;
use vrouter::task::ControllerTask;
use vrouter::task::TaskError;
use vrouter_test_utils as common;

const PORT_A: PortId = PortId::from_u128(0xa1);
const PORT_B: PortId = PortId::from_u128(0xb2);
const NUM_A: u16 = 1;
const NUM_B: u16 = 2;

const R1: RouterId = RouterId::from_u128(0x1001);
const R2: RouterId = RouterId::from_u128(0x1002);
const R3: RouterId = RouterId::from_u128(0x1003);

const TUN_PORT: u16 = 10;
const TUN_PORT2: u16 = 11;

fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::from([a, b, c, d])
}

/// Ports A (10.0.0.0/24) and B (10.0.1.0/24), bound on 1 and 2.
fn two_ports(cfg: Config) -> Harness {
    let mut h = Harness::new(cfg);
    h.add_port(NUM_A, PORT_A, ROUTER_MAC, port_cfg([10, 0, 0]));
    h.add_port(NUM_B, PORT_B, ROUTER_MAC2, port_cfg([10, 0, 1]));
    h
}

fn pkt_in(in_port: u16, buffer_id: BufferId, data: Vec<u8>) -> PacketIn {
    PacketIn {
        buffer_id,
        total_len: data.len() as u16,
        in_port,
        data,
        tunnel_id: None,
    }
}

fn recv(h: &mut Harness, in_port: u16, buffer_id: BufferId, data: Vec<u8>) {
    h.ctl.on_packet_in(pkt_in(in_port, buffer_id, data)).unwrap();
}

/// A guest on A talking to a guest on B.
fn guest_udp() -> Vec<u8> {
    gen_udp(
        GUEST_MAC,
        ROUTER_MAC,
        ip(10, 0, 0, 2),
        ip(10, 0, 1, 2),
        33000,
        80,
        b"hello",
    )
}

fn guest_match() -> PacketMatch {
    Frame::parse(guest_udp()).unwrap().flow_match(NUM_A, None)
}

fn flow_removed(flow_match: PacketMatch) -> FlowRemoved {
    FlowRemoved {
        flow_match,
        cookie: 0,
        priority: 0,
        reason: FlowRemovedReason::IdleTimeout,
        duration_secs: 60,
        packets: 10,
        bytes: 1000,
    }
}

fn assert_blackhole(flow: &FlowMod, flow_match: &PacketMatch, buf: BufferId) {
    assert_eq!(&flow.flow_match, flow_match);
    assert!(flow.actions.is_empty());
    assert_eq!(flow.buffer_id, buf);
    assert_eq!(flow.idle_timeout, 0);
    assert_eq!(flow.hard_timeout, 5);
    assert!(flow.flags.contains(FlowModFlags::SEND_FLOW_REM));
}

/// The (code, src, dst) of an ICMP unreachable sent out `port`.
fn icmp_unreach(po: &PacketOut, port: u16) -> (u8, Ipv4Addr, Ipv4Addr) {
    assert_eq!(po.actions, vec![FlowAction::output(port)]);
    assert_eq!(po.buffer_id, BufferId::Unbuffered);
    let f = Frame::parse(po.data.clone()).unwrap();
    let (ty, code) = f.icmp_type_code().unwrap();
    assert_eq!(ty, 3);
    (code, f.ip_src().unwrap(), f.ip_dst().unwrap())
}

// ================================================================
// DHCP
// ================================================================

#[test]
fn dhcp_discover_gets_offer() {
    let mut h = two_ports(Config::default());
    let req = DhcpReq::new(MessageType::Discover, GUEST_MAC);
    h.ctl
        .on_packet_in(pkt_in(NUM_A, BufferId::Unbuffered, req.frame()))
        .unwrap();

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 1);
    let outs = packet_outs(&cmds);
    assert_eq!(outs[0].actions, vec![FlowAction::output(NUM_A)]);

    let reply = parse_reply(&outs[0].data);
    assert_eq!(reply.msg_type(), MessageType::Offer as u8);
    assert_eq!(reply.op, 2);
    assert_eq!(reply.xid, req.xid);
    assert_eq!(reply.eth_src, ROUTER_MAC);
    assert_eq!(reply.eth_dst, GUEST_MAC);
    assert_eq!(reply.ip_src, ip(10, 0, 0, 1));
    assert_eq!(reply.ip_dst, Ipv4Addr::LOCAL_BCAST);
    assert_eq!(reply.yiaddr, ip(10, 0, 0, 2));
    assert_eq!(reply.siaddr, ip(10, 0, 0, 1));
    assert_eq!(reply.chaddr, GUEST_MAC);
    assert_eq!(reply.ip_opt(opt::SUBNET_MASK), ip(255, 255, 255, 0));
    assert_eq!(reply.ip_opt(opt::BROADCAST_ADDR), ip(10, 0, 0, 255));
    assert_eq!(reply.ip_opt(opt::ROUTER), ip(10, 0, 0, 1));
    assert_eq!(reply.ip_opt(opt::SERVER_ID), ip(10, 0, 0, 1));
    assert_eq!(
        reply.options[&opt::LEASE_TIME],
        86400u32.to_be_bytes().to_vec()
    );
    assert!(reply.bootp_len >= 300);

    // Never routed.
    assert!(h.net.state().processed.is_empty());
}

#[test]
fn dhcp_reply_frees_buffer() {
    let mut h = two_ports(Config::default());
    let frame = gen_dhcp_request(MessageType::Discover, GUEST_MAC, None);
    recv(&mut h, NUM_A, BufferId::Buffered(7), frame);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(packet_outs(&cmds).len(), 1);
    assert_eq!(freed_buffers(&cmds), vec![7]);
}

#[test]
fn dhcp_bad_hardware_len_dropped() {
    let mut h = two_ports(Config::default());
    let req =
        DhcpReq { hlen: 5, ..DhcpReq::new(MessageType::Discover, GUEST_MAC) };
    h.ctl
        .on_packet_in(pkt_in(NUM_A, BufferId::Buffered(3), req.frame()))
        .unwrap();

    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(3)]);
    assert!(h.net.state().processed.is_empty());
}

#[test]
fn dhcp_request_for_offered_address_acked() {
    let mut h = two_ports(Config::default());
    let req = DhcpReq {
        requested_ip: Some(ip(10, 0, 0, 2)),
        server_id: Some(ip(10, 0, 0, 1)),
        ..DhcpReq::new(MessageType::Request, GUEST_MAC)
    };
    h.ctl
        .on_packet_in(pkt_in(NUM_A, BufferId::Unbuffered, req.frame()))
        .unwrap();

    let cmds = h.ctl.drain_cmds();
    let reply = parse_reply(&packet_outs(&cmds)[0].data);
    assert_eq!(reply.msg_type(), MessageType::Ack as u8);
    assert_eq!(reply.yiaddr, ip(10, 0, 0, 2));
}

#[test]
fn dhcp_request_without_server_id_acked() {
    let mut h = two_ports(Config::default());
    let frame = gen_dhcp_request(
        MessageType::Request,
        GUEST_MAC,
        Some(ip(10, 0, 0, 2)),
    );
    recv(&mut h, NUM_A, BufferId::Unbuffered, frame);

    let cmds = h.ctl.drain_cmds();
    let reply = parse_reply(&packet_outs(&cmds)[0].data);
    assert_eq!(reply.msg_type(), MessageType::Ack as u8);
}

#[test]
fn dhcp_request_for_other_address_ignored() {
    let mut h = two_ports(Config::default());
    let frame = gen_dhcp_request(
        MessageType::Request,
        GUEST_MAC,
        Some(ip(10, 0, 0, 9)),
    );
    recv(&mut h, NUM_A, BufferId::Buffered(4), frame);

    let cmds = h.ctl.drain_cmds();
    assert!(packet_outs(&cmds).is_empty());
    assert!(flows(&cmds).is_empty());
    assert_eq!(freed_buffers(&cmds), vec![4]);
}

// ================================================================
// Port management
// ================================================================

#[test]
fn add_virtual_port_traps_dhcp() {
    let mut h = Harness::new(Config { datapath_id: 77, ..Default::default() });
    h.net.set_port_config(PORT_A, port_cfg([10, 0, 0]));
    h.ctl.add_virtual_port(NUM_A, "vnet0", ROUTER_MAC, PORT_A);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(
        cmds,
        vec![DatapathCmd::InstallFlow(vrouter::engine::controller::dhcp_flow(
            NUM_A, 1
        ))]
    );
    assert_eq!(h.ctl.ports().len(), 1);
    assert_eq!(h.net.state().added, vec![PORT_A]);
    assert_eq!(h.svc.state().added, vec![(77, PORT_A, ROUTER_MAC)]);

    // Adding the same number again changes nothing.
    h.ctl.add_virtual_port(NUM_A, "vnet0", ROUTER_MAC, PORT_A);
    assert!(h.ctl.drain_cmds().is_empty());
    assert_eq!(h.net.state().added.len(), 1);
}

#[test]
fn add_virtual_port_without_config() {
    let mut h = Harness::new(Config::default());
    h.ctl.add_virtual_port(NUM_A, "vnet0", ROUTER_MAC, PORT_A);
    assert!(h.ctl.drain_cmds().is_empty());
    assert!(h.ctl.ports().is_empty());
}

#[test]
fn deleted_port_is_unknown() {
    let mut h = two_ports(Config::default());
    h.ctl.delete_virtual_port(NUM_A, PORT_A);
    assert_eq!(h.net.state().removed, vec![PORT_A]);
    assert_eq!(h.ctl.ports().len(), 1);

    recv(&mut h, NUM_A, BufferId::Buffered(1), guest_udp());
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(1)]);
}

#[test]
fn port_with_clashing_compressed_id_rejected() {
    let first = PortId::from_u128(1 << 64 | 0x77);
    let second = PortId::from_u128(2 << 64 | 0x77);
    let mut h = Harness::new(Config::default());
    h.add_port(5, first, ROUTER_MAC, port_cfg([10, 0, 0]));
    h.net.set_port_config(second, port_cfg([10, 0, 1]));

    h.ctl.add_virtual_port(6, "vport6", ROUTER_MAC2, second);
    assert!(h.ctl.drain_cmds().is_empty());
    assert_eq!(h.ctl.ports().len(), 1);
    assert_eq!(h.net.state().added, vec![first]);

    // Deleting the rejected port leaves the first one reachable.
    h.ctl.delete_virtual_port(6, second);
    assert_eq!(h.ctl.ports().get_by_compressed(0x77).unwrap().id, first);
}

// ================================================================
// Ingress checks
// ================================================================

#[test]
fn unknown_port_dropped() {
    let mut h = two_ports(Config::default());
    recv(&mut h, 9, BufferId::Buffered(3), guest_udp());
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(3)]);

    recv(&mut h, 9, BufferId::Unbuffered, guest_udp());
    assert!(h.ctl.drain_cmds().is_empty());
    assert!(h.net.state().processed.is_empty());
}

#[test]
fn malformed_packet_dropped() {
    let mut h = two_ports(Config::default());
    let mut bytes = guest_udp();
    bytes.truncate(20);
    recv(&mut h, NUM_A, BufferId::Buffered(5), bytes);
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(5)]);
}

#[test]
fn foreign_unicast_dl_dst_blackholed() {
    let mut h = two_ports(Config::default());
    let bytes = gen_udp(
        GUEST_MAC,
        ROUTER_MAC2,
        ip(10, 0, 0, 2),
        ip(10, 0, 1, 2),
        33000,
        80,
        b"hello",
    );
    let m = Frame::parse(bytes.clone()).unwrap().flow_match(NUM_A, None);
    recv(&mut h, NUM_A, BufferId::Buffered(8), bytes);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 1);
    assert_blackhole(flows(&cmds)[0], &m, BufferId::Buffered(8));
    assert!(h.net.state().processed.is_empty());
}

#[test]
fn routing_sees_ingress_port_and_packet() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::new(Action::Consumed));
    recv(&mut h, NUM_A, BufferId::Buffered(2), guest_udp());

    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(2)]);
    let state = h.net.state();
    assert_eq!(state.processed.len(), 1);
    assert_eq!(state.processed[0].in_port_id, PORT_A);
    assert_eq!(state.processed[0].flow_match, guest_match());
    assert_eq!(state.processed[0].pkt_in, guest_udp());
}

// ================================================================
// Local forwarding
// ================================================================

#[test]
fn forward_local_after_resolution() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(
        Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R1, R2]),
    );
    recv(&mut h, NUM_A, BufferId::Buffered(11), guest_udp());

    // Nothing happens until the next hop resolves.
    assert!(h.ctl.drain_cmds().is_empty());
    assert_eq!(h.ctl.pending_resolutions(), 1);
    let reqs = h.net.mac_requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!((reqs[0].0, reqs[0].1), (PORT_B, ip(10, 0, 1, 2)));

    h.ctl.on_mac_resolved(reqs[0].2, Some(GUEST_MAC2));
    assert_eq!(h.ctl.pending_resolutions(), 0);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 1);
    let flow = flows(&cmds)[0];
    assert_eq!(flow.flow_match, guest_match());
    assert_eq!(flow.buffer_id, BufferId::Buffered(11));
    assert_eq!(flow.idle_timeout, 60);
    assert_eq!(flow.hard_timeout, 0);
    assert!(flow.flags.contains(FlowModFlags::SEND_FLOW_REM));
    assert_eq!(
        flow.actions,
        vec![
            FlowAction::SetDlSrc(ROUTER_MAC2),
            FlowAction::SetDlDst(GUEST_MAC2),
            FlowAction::output(NUM_B),
        ]
    );
    assert_eq!(h.ctl.tracker().len(), 1);
    assert!(h.net.freed().is_empty());

    // Both routers are released exactly once when the flow goes.
    h.ctl.on_flow_removed(&flow_removed(guest_match()));
    assert_eq!(
        h.net.freed(),
        vec![(R1, guest_match()), (R2, guest_match())]
    );
    assert!(h.ctl.tracker().is_empty());

    h.ctl.on_flow_removed(&flow_removed(guest_match()));
    assert_eq!(h.net.freed().len(), 2);
}

#[test]
fn repeated_packet_in_keeps_every_router() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R1]));
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R2]));

    // The switch sends the packet again while the first is pending.
    recv(&mut h, NUM_A, BufferId::Buffered(1), guest_udp());
    recv(&mut h, NUM_A, BufferId::Buffered(2), guest_udp());
    assert_eq!(h.ctl.pending_resolutions(), 2);
    for (_, _, id) in h.net.mac_requests() {
        h.ctl.on_mac_resolved(id, Some(GUEST_MAC2));
    }
    assert_eq!(flows(&h.ctl.drain_cmds()).len(), 2);
    assert_eq!(h.ctl.tracker().len(), 1);
    assert!(h.net.freed().is_empty());

    h.ctl.on_flow_removed(&flow_removed(guest_match()));
    assert_eq!(
        h.net.freed(),
        vec![(R1, guest_match()), (R2, guest_match())]
    );
    assert!(h.ctl.tracker().is_empty());
}

#[test]
fn forward_local_unbuffered_sends_packet() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)));
    recv(&mut h, NUM_A, BufferId::Unbuffered, guest_udp());
    let id = h.net.last_resolution();
    h.ctl.on_mac_resolved(id, Some(GUEST_MAC2));

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 2);
    let flow = flows(&cmds)[0];
    let po = packet_outs(&cmds)[0];
    assert_eq!(po.in_port, OFPP_NONE);
    assert_eq!(po.buffer_id, BufferId::Unbuffered);
    assert_eq!(po.actions, flow.actions);
    assert_eq!(po.data, guest_udp());
}

#[test]
fn forward_local_uses_rewritten_match() {
    let mut h = two_ports(Config::default());
    let mut out = guest_match();
    out.nw_dst = Some(ip(10, 0, 1, 3));
    out.tp_dst = Some(8080);
    h.net.push_decision(Decision {
        match_out: Some(out),
        ..Decision::forward(PORT_B, ip(10, 0, 1, 3))
    });
    recv(&mut h, NUM_A, BufferId::Buffered(1), guest_udp());
    h.ctl.on_mac_resolved(h.net.last_resolution(), Some(GUEST_MAC2));

    let cmds = h.ctl.drain_cmds();
    assert_eq!(
        flows(&cmds)[0].actions,
        vec![
            FlowAction::SetDlSrc(ROUTER_MAC2),
            FlowAction::SetDlDst(GUEST_MAC2),
            FlowAction::SetNwDst(ip(10, 0, 1, 3)),
            FlowAction::SetTpDst(8080),
            FlowAction::output(NUM_B),
        ]
    );
}

#[test]
fn forward_local_next_hop_defaults_to_destination() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision {
        next_hop: None,
        ..Decision::forward(PORT_B, Ipv4Addr::ANY_ADDR)
    });
    recv(&mut h, NUM_A, BufferId::Buffered(1), guest_udp());
    assert_eq!(h.net.mac_requests()[0].1, ip(10, 0, 1, 2));
}

#[test]
fn forward_local_wildcarded() {
    let cfg = Config {
        granularity: GranularityCfg {
            forward: FlowGranularity::Wildcarded,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut h = two_ports(cfg);
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R1]));
    recv(&mut h, NUM_A, BufferId::Buffered(1), guest_udp());
    h.ctl.on_mac_resolved(h.net.last_resolution(), Some(GUEST_MAC2));

    let cmds = h.ctl.drain_cmds();
    let wild = guest_match().l3_only();
    assert_eq!(flows(&cmds)[0].flow_match, wild);
    assert_eq!(flows(&cmds)[0].flow_match.tp_dst, None);

    // Tracked under what was installed, released under what R1 saw.
    h.ctl.on_flow_removed(&flow_removed(guest_match()));
    assert!(h.net.freed().is_empty());
    h.ctl.on_flow_removed(&flow_removed(wild));
    assert_eq!(h.net.freed(), vec![(R1, guest_match())]);
}

#[test]
fn forward_local_wildcarded_merges_exact_matches() {
    let cfg = Config {
        granularity: GranularityCfg {
            forward: FlowGranularity::Wildcarded,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut h = two_ports(cfg);
    let other = gen_udp(
        GUEST_MAC,
        ROUTER_MAC,
        ip(10, 0, 0, 2),
        ip(10, 0, 1, 2),
        33001,
        80,
        b"hello",
    );
    let other_match =
        Frame::parse(other.clone()).unwrap().flow_match(NUM_A, None);

    // Both packets arrive before either resolves.
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R1]));
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R2]));
    recv(&mut h, NUM_A, BufferId::Buffered(1), guest_udp());
    recv(&mut h, NUM_A, BufferId::Buffered(2), other);
    for (_, _, id) in h.net.mac_requests() {
        h.ctl.on_mac_resolved(id, Some(GUEST_MAC2));
    }
    let _ = h.ctl.drain_cmds();
    assert_eq!(h.ctl.tracker().len(), 1);

    h.ctl.on_flow_removed(&flow_removed(guest_match().l3_only()));
    assert_eq!(
        h.net.freed(),
        vec![(R1, guest_match()), (R2, other_match)]
    );
    assert!(h.ctl.tracker().is_empty());
}

#[test]
fn resolution_timeout_sends_host_unreachable() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R1]));
    recv(&mut h, NUM_A, BufferId::Buffered(6), guest_udp());
    h.ctl.on_mac_resolved(h.net.last_resolution(), None);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 2);
    assert_blackhole(flows(&cmds)[0], &guest_match(), BufferId::Buffered(6));
    assert_eq!(h.net.freed(), vec![(R1, guest_match())]);
    assert!(h.ctl.tracker().is_empty());

    let po = packet_outs(&cmds)[0];
    let (code, src, dst) = icmp_unreach(po, NUM_A);
    assert_eq!(code, 1);
    assert_eq!(src, ip(10, 0, 0, 1));
    assert_eq!(dst, ip(10, 0, 0, 2));

    let f = Frame::parse(po.data.clone()).unwrap();
    assert_eq!(f.src_mac(), ROUTER_MAC);
    assert_eq!(f.dst_mac(), GUEST_MAC);
}

#[test]
fn resolution_failure_drops() {
    let mut h = two_ports(Config::default());
    h.net.state().fail_mac_requests = true;
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R1]));
    recv(&mut h, NUM_A, BufferId::Buffered(6), guest_udp());

    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(6)]);
    assert_eq!(h.net.freed(), vec![(R1, guest_match())]);
    assert_eq!(h.ctl.pending_resolutions(), 0);
}

#[test]
fn egress_removed_during_resolution() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::forward(PORT_B, ip(10, 0, 1, 2)).via(&[R1]));
    recv(&mut h, NUM_A, BufferId::Buffered(6), guest_udp());
    h.ctl.delete_virtual_port(NUM_B, PORT_B);
    h.ctl.on_mac_resolved(h.net.last_resolution(), Some(GUEST_MAC2));

    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(6)]);
    assert_eq!(h.net.freed(), vec![(R1, guest_match())]);
}

#[test]
fn unknown_resolution_ignored() {
    let mut h = two_ports(Config::default());
    h.ctl.on_mac_resolved(ResolutionId::new(999), Some(GUEST_MAC2));
    assert!(h.ctl.drain_cmds().is_empty());
}

// ================================================================
// Drops
// ================================================================

#[test]
fn blackhole_releases_routers_immediately() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::new(Action::Blackhole).via(&[R1, R2]));
    recv(&mut h, NUM_A, BufferId::Buffered(9), guest_udp());

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 1);
    assert_blackhole(flows(&cmds)[0], &guest_match(), BufferId::Buffered(9));
    assert_eq!(h.net.freed().len(), 2);
    assert!(h.ctl.tracker().is_empty());

    // The drop flow expiring releases nothing more.
    h.ctl.on_flow_removed(&flow_removed(guest_match()));
    assert_eq!(h.net.freed().len(), 2);
}

#[test]
fn blackhole_wildcarded() {
    let cfg = Config {
        granularity: GranularityCfg {
            blackhole: FlowGranularity::Wildcarded,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut h = two_ports(cfg);
    h.net.push_decision(Decision::new(Action::Blackhole));
    recv(&mut h, NUM_A, BufferId::Buffered(9), guest_udp());

    let cmds = h.ctl.drain_cmds();
    assert_eq!(flows(&cmds)[0].flow_match, guest_match().l3_only());
}

#[test]
fn consumed_frees_buffer() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::new(Action::Consumed).via(&[R1]));
    recv(&mut h, NUM_A, BufferId::Buffered(9), guest_udp());
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(9)]);
}

#[test]
fn not_ipv4_drops_ethertype() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::new(Action::NotIpv4));
    let arp = gen_arp_request(GUEST_MAC, ip(10, 0, 0, 2), ip(10, 0, 0, 1));
    recv(&mut h, NUM_A, BufferId::Buffered(4), arp);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 1);
    let flow = flows(&cmds)[0];
    assert_eq!(flow.flow_match, PacketMatch::ether_type(ETHER_TYPE_ARP));
    assert_eq!((flow.idle_timeout, flow.hard_timeout), (0, 0));
    assert!(flow.actions.is_empty());
    assert_eq!(flow.buffer_id, BufferId::Buffered(4));
}

#[test]
fn no_route_sends_net_unreachable() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::new(Action::NoRoute).via(&[R1]));
    recv(&mut h, NUM_A, BufferId::Buffered(2), guest_udp());

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 2);
    assert_blackhole(flows(&cmds)[0], &guest_match(), BufferId::Buffered(2));
    assert_eq!(h.net.freed(), vec![(R1, guest_match())]);
    let (code, src, dst) = icmp_unreach(packet_outs(&cmds)[0], NUM_A);
    assert_eq!(code, 0);
    assert_eq!(src, ip(10, 0, 0, 1));
    assert_eq!(dst, ip(10, 0, 0, 2));
}

#[test]
fn reject_sends_filter_prohibited() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::new(Action::Reject));
    recv(&mut h, NUM_A, BufferId::Buffered(2), guest_udp());

    let cmds = h.ctl.drain_cmds();
    let (code, _, _) = icmp_unreach(packet_outs(&cmds)[0], NUM_A);
    assert_eq!(code, 13);
}

#[test]
fn icmp_error_from_last_router() {
    // Two routers deep: the error comes from the last ingress port,
    // quoting the packet as that router saw it.
    let mut h = two_ports(Config::default());
    let far = PortId::from_u128(0xf0);
    h.net.set_port_config(far, port_cfg([172, 16, 0]));
    let seen = gen_udp(
        GUEST_MAC,
        ROUTER_MAC,
        ip(192, 0, 2, 7),
        ip(10, 0, 1, 2),
        33000,
        80,
        b"hello",
    );
    h.net.push_decision(Decision {
        last_ingress: Some(far),
        pkt_at_last_ingress: Some(seen),
        ..Decision::new(Action::NoRoute)
    });
    recv(&mut h, NUM_A, BufferId::Buffered(2), guest_udp());

    let cmds = h.ctl.drain_cmds();
    let po = packet_outs(&cmds)[0];
    let (_, src, dst) = icmp_unreach(po, NUM_A);
    assert_eq!(src, ip(172, 16, 0, 1));
    assert_eq!(dst, ip(10, 0, 0, 2));

    // Quoted header: 14 eth + 20 ip + 8 icmp, then the quoted source.
    let quoted_src = &po.data[14 + 20 + 8 + 12..14 + 20 + 8 + 16];
    assert_eq!(quoted_src, &[192, 0, 2, 7]);
}

#[test]
fn no_icmp_about_icmp_errors() {
    let mut h = two_ports(Config::default());
    let err = gen_icmp(
        GUEST_MAC,
        ROUTER_MAC,
        ip(10, 0, 0, 2),
        ip(10, 0, 1, 2),
        3,
        1,
    );
    h.net.push_decision(Decision::new(Action::NoRoute));
    recv(&mut h, NUM_A, BufferId::Buffered(2), err);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(flows(&cmds).len(), 1);
    assert!(packet_outs(&cmds).is_empty());
}

#[test]
fn can_send_icmp_matrix() {
    let h = two_ports(Config::default());
    let frame = |dst_mac: MacAddr, src: Ipv4Addr, dst: Ipv4Addr| {
        Frame::parse(gen_udp(GUEST_MAC, dst_mac, src, dst, 1, 2, b"x"))
            .unwrap()
    };
    let unicast = frame(ROUTER_MAC, ip(10, 0, 0, 2), ip(10, 0, 1, 2));

    assert!(h.ctl.can_send_icmp(&unicast, None));
    assert!(h.ctl.can_send_icmp(&unicast, Some(PORT_B)));
    assert!(!h.ctl.can_send_icmp(&unicast, Some(PortId::from_u128(0x99))));

    let echo = Frame::parse(gen_icmp_echo(
        GUEST_MAC,
        ROUTER_MAC,
        ip(10, 0, 0, 2),
        ip(10, 0, 1, 2),
    ))
    .unwrap();
    assert!(h.ctl.can_send_icmp(&echo, None));

    let subnet_bcast = frame(ROUTER_MAC, ip(10, 0, 0, 2), ip(10, 0, 1, 255));
    assert!(!h.ctl.can_send_icmp(&subnet_bcast, Some(PORT_B)));
    assert!(h.ctl.can_send_icmp(&subnet_bcast, None));

    let cases = [
        frame(ROUTER_MAC, ip(10, 0, 0, 2), ip(239, 1, 1, 1)),
        frame(MacAddr::BROADCAST, ip(10, 0, 0, 2), ip(10, 0, 1, 2)),
        frame(ROUTER_MAC, Ipv4Addr::LOCAL_BCAST, ip(10, 0, 1, 2)),
        frame(ROUTER_MAC, ip(10, 0, 0, 2), Ipv4Addr::LOCAL_BCAST),
    ];
    for f in &cases {
        assert!(!h.ctl.can_send_icmp(f, None));
    }

    let mut frag = unicast.clone().into_bytes();
    set_frag_offset(&mut frag, 64);
    assert!(!h.ctl.can_send_icmp(&Frame::parse(frag).unwrap(), None));

    let arp = gen_arp_request(GUEST_MAC, ip(10, 0, 0, 2), ip(10, 0, 0, 1));
    assert!(!h.ctl.can_send_icmp(&Frame::parse(arp).unwrap(), None));
}

#[test]
fn routing_error_drops_and_releases() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision {
        error: Some(NetworkError::Routing("loop".to_string())),
        ..Decision::default().via(&[R1, R2])
    });
    recv(&mut h, NUM_A, BufferId::Buffered(3), guest_udp());

    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(3)]);
    assert_eq!(h.net.freed().len(), 2);
}

#[test]
fn missing_action_is_contract_violation() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::default().via(&[R1]));
    let res =
        h.ctl.on_packet_in(pkt_in(NUM_A, BufferId::Buffered(3), guest_udp()));

    assert!(matches!(res, Err(DispatchError::ContractViolation(_))));
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(3)]);
    assert_eq!(h.net.freed(), vec![(R1, guest_match())]);
}

#[test]
fn forward_without_egress_is_contract_violation() {
    let mut h = two_ports(Config::default());
    h.net.push_decision(Decision::new(Action::Forward));
    let res =
        h.ctl.on_packet_in(pkt_in(NUM_A, BufferId::Buffered(3), guest_udp()));

    assert!(matches!(res, Err(DispatchError::ContractViolation(_))));
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(3)]);
}

// ================================================================
// Tunnels
// ================================================================

const PEER1: Ipv4Addr = Ipv4Addr::from_const([192, 168, 0, 2]);
const PEER2: Ipv4Addr = Ipv4Addr::from_const([192, 168, 0, 3]);
const PORT_SET: PortId = PortId::from_u128(0x5e7);
const REMOTE: PortId = PortId::from_u128(0xdead_beef);

fn tunnel_cfg() -> Config {
    Config {
        local_tunnel_addr: Some(std::net::Ipv4Addr::new(192, 168, 0, 1)),
        ..Default::default()
    }
}

fn with_tunnels(cfg: Config) -> Harness {
    let mut h = two_ports(cfg);
    h.ctl.add_tunnel_port(TUN_PORT, PEER1);
    h.ctl.add_tunnel_port(TUN_PORT2, PEER2);
    h
}

#[test]
fn port_set_fans_out_to_peers() {
    let mut h = with_tunnels(tunnel_cfg());
    h.dir.set_port_set(
        PORT_SET,
        vec![ip(192, 168, 0, 1), PEER2, PEER1, ip(192, 168, 0, 99)],
    );
    h.net.push_decision(
        Decision::forward(PORT_SET, ip(10, 0, 1, 2)).via(&[R1]),
    );
    recv(&mut h, NUM_A, BufferId::Unbuffered, guest_udp());

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 2);
    let flow = flows(&cmds)[0];
    assert_eq!(flow.flow_match, guest_match());
    assert_eq!(
        flow.actions,
        vec![FlowAction::output(TUN_PORT), FlowAction::output(TUN_PORT2)]
    );
    assert_eq!(packet_outs(&cmds)[0].actions, flow.actions);
    assert_eq!(h.ctl.tracker().len(), 1);
    assert!(h.net.mac_requests().is_empty());
}

#[test]
fn port_set_with_only_ourselves() {
    let mut h = with_tunnels(tunnel_cfg());
    h.dir.set_port_set(PORT_SET, vec![ip(192, 168, 0, 1)]);
    h.net.push_decision(
        Decision::forward(PORT_SET, ip(10, 0, 1, 2)).via(&[R1]),
    );
    recv(&mut h, NUM_A, BufferId::Buffered(4), guest_udp());

    let cmds = h.ctl.drain_cmds();
    assert_blackhole(flows(&cmds)[0], &guest_match(), BufferId::Buffered(4));
    let (code, _, _) = icmp_unreach(packet_outs(&cmds)[0], NUM_A);
    assert_eq!(code, 0);
    assert_eq!(h.net.freed(), vec![(R1, guest_match())]);
    assert!(h.ctl.tracker().is_empty());
}

#[test]
fn remote_port_over_tunnel() {
    let mut h = with_tunnels(tunnel_cfg());
    h.dir.set_location(REMOTE, PEER2);
    h.net.push_decision(Decision::forward(REMOTE, ip(10, 0, 5, 5)).via(&[R1]));
    recv(&mut h, NUM_A, BufferId::Buffered(4), guest_udp());

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 1);
    let flow = flows(&cmds)[0];
    let (src, dst) = tunnel::encode(
        PORT_A.compressed(),
        REMOTE.compressed(),
        ip(10, 0, 5, 5),
    );
    assert_eq!(
        flow.actions,
        vec![
            FlowAction::SetDlSrc(src),
            FlowAction::SetDlDst(dst),
            FlowAction::output(TUN_PORT2),
        ]
    );
    assert_eq!(flow.buffer_id, BufferId::Buffered(4));
    assert_eq!(h.ctl.tracker().len(), 1);
}

#[test]
fn remote_port_without_tunnel() {
    let mut h = two_ports(tunnel_cfg());
    h.dir.set_location(REMOTE, PEER2);
    h.net.push_decision(Decision::forward(REMOTE, ip(10, 0, 5, 5)));
    recv(&mut h, NUM_A, BufferId::Buffered(4), guest_udp());

    let cmds = h.ctl.drain_cmds();
    assert_blackhole(flows(&cmds)[0], &guest_match(), BufferId::Buffered(4));
    let (code, _, _) = icmp_unreach(packet_outs(&cmds)[0], NUM_A);
    assert_eq!(code, 0);
}

const LAST_INGRESS: u32 = 0x1234;

/// A frame from a peer, for port B.
fn tunneled(ingress: u32) -> Vec<u8> {
    let (src, dst) =
        tunnel::encode(ingress, PORT_B.compressed(), ip(10, 0, 1, 2));
    gen_udp(src, dst, ip(10, 0, 9, 2), ip(10, 0, 1, 2), 5000, 80, b"hi")
}

fn tunnel_pkt_in(buffer_id: BufferId, data: Vec<u8>) -> PacketIn {
    PacketIn { tunnel_id: Some(42), ..pkt_in(TUN_PORT, buffer_id, data) }
}

#[test]
fn tunnel_ingress_delivered_after_resolution() {
    let mut h = with_tunnels(tunnel_cfg());
    let data = tunneled(LAST_INGRESS);
    let m = Frame::parse(data.clone()).unwrap().flow_match(TUN_PORT, Some(42));
    h.ctl
        .on_packet_in(tunnel_pkt_in(BufferId::Unbuffered, data.clone()))
        .unwrap();

    assert!(h.ctl.drain_cmds().is_empty());
    let reqs = h.net.mac_requests();
    assert_eq!((reqs[0].0, reqs[0].1), (PORT_B, ip(10, 0, 1, 2)));
    // Tunneled traffic was routed by the sender.
    assert!(h.net.state().processed.is_empty());

    h.ctl.on_mac_resolved(reqs[0].2, Some(GUEST_MAC2));
    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 2);
    let flow = flows(&cmds)[0];
    assert_eq!(flow.flow_match, m);
    assert_eq!(flow.flow_match.tunnel_id, Some(42));
    assert_eq!(
        flow.actions,
        vec![
            FlowAction::SetDlSrc(ROUTER_MAC2),
            FlowAction::SetDlDst(GUEST_MAC2),
            FlowAction::output(NUM_B),
        ]
    );
    assert_eq!(packet_outs(&cmds)[0].data, data);

    // The sender owns the routers.
    assert!(h.ctl.tracker().is_empty());
}

#[test]
fn tunneled_icmp_delivered_without_flow() {
    let mut h = with_tunnels(tunnel_cfg());
    let data = tunneled(ICMP_TUNNEL);
    h.ctl.on_packet_in(tunnel_pkt_in(BufferId::Buffered(12), data)).unwrap();
    h.ctl.on_mac_resolved(h.net.last_resolution(), Some(GUEST_MAC2));

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 1);
    let po = packet_outs(&cmds)[0];
    assert_eq!(po.in_port, TUN_PORT);
    assert_eq!(po.buffer_id, BufferId::Buffered(12));
    assert!(po.data.is_empty());
    assert_eq!(po.actions.last(), Some(&FlowAction::output(NUM_B)));
}

#[test]
fn tunnel_ingress_for_foreign_egress_ignored() {
    let mut h = with_tunnels(tunnel_cfg());
    let (src, dst) = tunnel::encode(LAST_INGRESS, 0x9999, ip(10, 0, 1, 2));
    let data =
        gen_udp(src, dst, ip(10, 0, 9, 2), ip(10, 0, 1, 2), 5000, 80, b"hi");
    h.ctl.on_packet_in(tunnel_pkt_in(BufferId::Buffered(1), data)).unwrap();

    assert!(h.ctl.drain_cmds().is_empty());
    assert_eq!(h.ctl.pending_resolutions(), 0);
    assert!(h.net.mac_requests().is_empty());
}

#[test]
fn tunnel_ingress_resolution_failure_frees_buffer() {
    let mut h = with_tunnels(tunnel_cfg());
    h.net.state().fail_mac_requests = true;
    let data = tunneled(LAST_INGRESS);
    h.ctl.on_packet_in(tunnel_pkt_in(BufferId::Buffered(1), data)).unwrap();
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(1)]);
}

#[test]
fn tunnel_egress_removed_during_resolution() {
    let mut h = with_tunnels(tunnel_cfg());
    let data = tunneled(LAST_INGRESS);
    h.ctl.on_packet_in(tunnel_pkt_in(BufferId::Buffered(8), data)).unwrap();
    h.ctl.delete_virtual_port(NUM_B, PORT_B);
    h.ctl.on_mac_resolved(h.net.last_resolution(), Some(GUEST_MAC2));

    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(8)]);
    assert_eq!(h.ctl.pending_resolutions(), 0);
}

#[test]
fn tunneled_timeout_sends_icmp_back_over_tunnel() {
    let mut h = with_tunnels(tunnel_cfg());
    let last_ingress = PortId::from_compressed(LAST_INGRESS);
    h.net.set_port_config(last_ingress, port_cfg([10, 0, 9]));
    h.dir.set_location(last_ingress, PEER1);
    h.net.push_in_router_decision(
        Decision::forward(last_ingress, ip(10, 0, 9, 2)).via(&[R3]),
    );

    let data = tunneled(LAST_INGRESS);
    let m = Frame::parse(data.clone()).unwrap().flow_match(TUN_PORT, Some(42));
    h.ctl.on_packet_in(tunnel_pkt_in(BufferId::Buffered(1), data)).unwrap();
    h.ctl.on_mac_resolved(h.net.last_resolution(), None);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(cmds.len(), 2);
    assert_blackhole(flows(&cmds)[0], &m, BufferId::Buffered(1));

    {
        let state = h.net.state();
        assert_eq!(state.undo_calls, 1);
        assert_eq!(state.processed_in_router, vec![last_ingress]);
        assert_eq!(state.freed.len(), 1);
        assert_eq!(state.freed[0].0, R3);
    }

    let po = packet_outs(&cmds)[0];
    assert_eq!(po.actions, vec![FlowAction::output(TUN_PORT)]);
    let f = Frame::parse(po.data.clone()).unwrap();
    let addrs = tunnel::decode(f.src_mac(), f.dst_mac());
    assert!(addrs.is_icmp());
    assert_eq!(addrs.egress, LAST_INGRESS);
    assert_eq!(addrs.next_hop, ip(10, 0, 9, 2));
    assert_eq!(f.icmp_type_code(), Some((3, 1)));
    assert_eq!(f.ip_src(), Some(ip(10, 0, 9, 1)));
    assert_eq!(f.ip_dst(), Some(ip(10, 0, 9, 2)));
}

#[test]
fn tunneled_icmp_not_forwarded_by_router() {
    let mut h = with_tunnels(tunnel_cfg());
    let last_ingress = PortId::from_compressed(LAST_INGRESS);
    h.net.set_port_config(last_ingress, port_cfg([10, 0, 9]));
    h.net.push_in_router_decision(Decision::new(Action::NoRoute).via(&[R3]));

    let data = tunneled(LAST_INGRESS);
    h.ctl.on_packet_in(tunnel_pkt_in(BufferId::Buffered(1), data)).unwrap();
    h.ctl.on_mac_resolved(h.net.last_resolution(), None);

    let cmds = h.ctl.drain_cmds();
    assert_eq!(flows(&cmds).len(), 1);
    assert!(packet_outs(&cmds).is_empty());
    assert_eq!(h.net.freed().len(), 1);
}

#[test]
fn tunnel_port_removed() {
    let mut h = with_tunnels(tunnel_cfg());
    h.ctl.remove_tunnel_port(TUN_PORT);
    h.ctl
        .on_packet_in(tunnel_pkt_in(BufferId::Buffered(1), tunneled(1)))
        .unwrap();
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(1)]);
}

// ================================================================
// Service ports
// ================================================================

#[test]
fn service_flows_patch_through() {
    let mut h = two_ports(Config::default());
    h.ctl.set_service_flows(
        5,
        NUM_A,
        ip(10, 0, 0, 3),
        ip(10, 0, 0, 1),
        179,
        179,
    );

    let cmds = h.ctl.drain_cmds();
    let fl = flows(&cmds);
    assert_eq!(fl.len(), 8);
    for f in &fl {
        assert_eq!(f.priority, 1);
        assert_eq!(f.buffer_id, BufferId::Unbuffered);
        assert_eq!((f.idle_timeout, f.hard_timeout), (0, 0));
    }

    let arp_in = fl
        .iter()
        .find(|f| {
            f.flow_match.in_port == Some(NUM_A)
                && f.flow_match.dl_type == Some(ETHER_TYPE_ARP)
        })
        .unwrap();
    assert_eq!(
        arp_in.actions,
        vec![
            FlowAction::output(5),
            FlowAction::Output { port: OFPP_CONTROLLER, max_len: 128 },
        ]
    );
}

#[test]
fn local_port_packets_attributed_to_service_target() {
    let mut h = two_ports(Config::default());
    h.ctl.set_service_flows(
        5,
        NUM_A,
        ip(10, 0, 0, 3),
        ip(10, 0, 0, 1),
        179,
        179,
    );
    let _ = h.ctl.drain_cmds();

    h.net.push_decision(Decision::new(Action::Consumed));
    h.ctl
        .on_packet_in(pkt_in(OFPP_LOCAL, BufferId::Buffered(1), guest_udp()))
        .unwrap();

    let state = h.net.state();
    assert_eq!(state.processed[0].in_port_id, PORT_A);
    assert_eq!(state.processed[0].flow_match.in_port, Some(OFPP_LOCAL));
}

#[test]
fn local_port_without_service_is_unknown() {
    let mut h = two_ports(Config::default());
    h.ctl
        .on_packet_in(pkt_in(OFPP_LOCAL, BufferId::Buffered(1), guest_udp()))
        .unwrap();
    assert_eq!(h.ctl.drain_cmds(), vec![DatapathCmd::FreeBuffer(1)]);
}

#[test]
fn service_waits_for_its_port() {
    let mut h = Harness::new(Config { datapath_id: 3, ..Default::default() });
    h.svc.add_service(PORT_A, "bgp0");

    h.ctl.setup_service_port(7, "bgp0");
    assert_eq!(h.svc.state().configured, vec![(PORT_A, "bgp0".to_string())]);
    assert!(h.svc.state().started.is_empty());

    h.add_port(NUM_A, PORT_A, ROUTER_MAC, port_cfg([10, 0, 0]));
    assert_eq!(h.svc.state().started, vec![(3, 7, NUM_A)]);

    // Once the port is bound a service starts right away.
    h.ctl.setup_service_port(8, "bgp0");
    assert_eq!(h.svc.state().started, vec![(3, 7, NUM_A), (3, 8, NUM_A)]);
}

#[test]
fn service_port_for_nothing() {
    let mut h = two_ports(Config::default());
    h.ctl.setup_service_port(7, "nobody");
    assert!(h.svc.state().configured.is_empty());
    assert!(h.svc.state().started.is_empty());
}

// ================================================================
// Task
// ================================================================

#[tokio::test]
async fn task_round_trip() {
    let net = MockNetwork::new();
    net.set_port_config(PORT_A, port_cfg([10, 0, 0]));
    let ctl = Controller::new(
        &test_logger(),
        Config::default(),
        Box::new(net.clone()),
        Box::new(MockDirectory::new()),
        Box::new(MockPortService::new()),
    );

    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::channel(16);
    let (mut task, handle) = ControllerTask::new(ctl, cmd_tx, &test_logger());
    let jh = tokio::spawn(async move { task.run().await });

    handle.add_virtual_port(NUM_A, "vnet0", ROUTER_MAC, PORT_A).await.unwrap();
    let Some(DatapathCmd::InstallFlow(flow)) = cmd_rx.recv().await else {
        panic!("expected the DHCP flow");
    };
    assert_eq!(flow.flow_match.tp_dst, Some(67));

    let frame = gen_dhcp_request(MessageType::Discover, GUEST_MAC, None);
    handle
        .packet_in(pkt_in(NUM_A, BufferId::Unbuffered, frame))
        .await
        .unwrap();
    let Some(DatapathCmd::SendPacket(po)) = cmd_rx.recv().await else {
        panic!("expected a DHCP reply");
    };
    assert_eq!(parse_reply(&po.data).msg_type(), MessageType::Offer as u8);

    net.push_decision(Decision::forward(PORT_A, ip(10, 0, 0, 2)));
    handle
        .packet_in(pkt_in(NUM_A, BufferId::Buffered(1), guest_udp()))
        .await
        .unwrap();
    assert_eq!(
        handle.status().await.unwrap(),
        ControllerStatus { ports: 1, tracked_flows: 0, pending_resolutions: 1 }
    );

    handle.mac_resolved(net.last_resolution(), Some(GUEST_MAC2)).await.unwrap();
    assert!(matches!(cmd_rx.recv().await, Some(DatapathCmd::InstallFlow(_))));
    assert_eq!(
        handle.status().await.unwrap(),
        ControllerStatus { ports: 1, tracked_flows: 1, pending_resolutions: 0 }
    );

    handle.shutdown().await.unwrap();
    jh.await.unwrap();
    assert_eq!(handle.status().await, Err(TaskError::Send));
}

#[tokio::test]
async fn task_stops_on_contract_violation() {
    let net = MockNetwork::new();
    net.set_port_config(PORT_A, port_cfg([10, 0, 0]));
    let ctl = Controller::new(
        &test_logger(),
        Config::default(),
        Box::new(net.clone()),
        Box::new(MockDirectory::new()),
        Box::new(MockPortService::new()),
    );

    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::channel(16);
    let (mut task, handle) = ControllerTask::new(ctl, cmd_tx, &test_logger());
    let jh = tokio::spawn(async move { task.run().await });

    handle.add_virtual_port(NUM_A, "vnet0", ROUTER_MAC, PORT_A).await.unwrap();
    assert!(matches!(cmd_rx.recv().await, Some(DatapathCmd::InstallFlow(_))));

    // No decision queued: routing comes back without an action.
    handle
        .packet_in(pkt_in(NUM_A, BufferId::Buffered(4), guest_udp()))
        .await
        .unwrap();
    assert_eq!(cmd_rx.recv().await, Some(DatapathCmd::FreeBuffer(4)));

    jh.await.unwrap();
    assert_eq!(handle.status().await, Err(TaskError::Send));
    assert_eq!(cmd_rx.recv().await, None);
}
