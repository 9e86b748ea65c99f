//! Shared fixtures: a loopback engine whose emitted mutations are reflected
//! straight back through the decoder, as if the monitor had picked them up
//! from the kernel, plus builders for the netlink events the scenarios feed.

use flowsync_lib::addr::AfAddr;
use flowsync_lib::config::Config;
use flowsync_lib::engine::Engine;
use flowsync_lib::tc_rule::{RuleType, TcRule};
use flowsync_lib::wire::{
    LinkEvent, NeighEvent, NextHop, Op, RouteEvent, RtnlEvent, RTM_DELTFILTER, RTM_NEWTFILTER,
};

pub const EGRESS_IFINDEX: i32 = 1;
pub const TABLE_ID: u32 = 254;

pub const LLADDR_A: [u8; 6] = [0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf];
pub const LLADDR_B: [u8; 6] = [0xba, 0xbb, 0xbc, 0xbd, 0xbe, 0xbf];
pub const LLADDR_C: [u8; 6] = [0xca, 0xcb, 0xcc, 0xcd, 0xce, 0xcf];

pub fn test_config() -> Config {
    Config::new("test0", EGRESS_IFINDEX, TABLE_ID)
}

pub fn engine() -> Engine {
    Engine::new_loopback(test_config())
}

pub fn addr(s: &str) -> std::net::IpAddr {
    s.parse().expect("valid address")
}

pub fn prefix(s: &str) -> AfAddr {
    s.parse::<cidr::IpCidr>().expect("valid prefix").into()
}

pub fn link(op: Op, ifindex: i32, vlan_id: u16, lladdr: [u8; 6]) -> RtnlEvent {
    RtnlEvent::Link(LinkEvent {
        op,
        ifindex,
        lladdr: Some(lladdr),
        lower_ifindex: EGRESS_IFINDEX,
        vlan_id,
        mtu: 1500,
        ifname: Some(format!("test0.{vlan_id}")),
    })
}

pub fn neigh(op: Op, ifindex: i32, address: &str, lladdr: [u8; 6]) -> RtnlEvent {
    RtnlEvent::Neigh(NeighEvent {
        op,
        ifindex,
        addr: AfAddr::host(addr(address)),
        lladdr: Some(lladdr),
    })
}

pub fn route(op: Op, dst: &str, oif: i32, gateway: &str) -> RtnlEvent {
    RtnlEvent::Route(RouteEvent {
        op,
        dst: prefix(dst),
        nexthop: Some(NextHop {
            ifindex: oif,
            gateway: addr(gateway),
        }),
    })
}

/// The forward rule a target with this link/neighbour combination asks for.
pub fn forward_rule(vlan_id: u16, src_mac: [u8; 6], dst_mac: [u8; 6]) -> TcRule {
    let mut tcr = TcRule::new(test_config().flower_flags);
    tcr.vlan_id = vlan_id;
    tcr.src_mac = src_mac;
    tcr.dst_mac = dst_mac;
    tcr.set_type_and_traits(RuleType::Forward);
    tcr
}

pub fn installs(engine: &Engine) -> usize {
    engine
        .sent_log()
        .iter()
        .filter(|m| m.message_type == RTM_NEWTFILTER)
        .count()
}

pub fn uninstalls(engine: &Engine) -> usize {
    engine
        .sent_log()
        .iter()
        .filter(|m| m.message_type == RTM_DELTFILTER)
        .count()
}
