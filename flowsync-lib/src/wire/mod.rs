//! Wire codec for the rtnetlink conversations this daemon holds: link,
//! neighbour and route state in one direction, traffic-control chains and
//! flower filters in both.
//!
//! The tc constants are declared here rather than pulled from a bindings
//! crate: the flower/action surface we speak is not modelled by any released
//! netlink-packet crate, and the decoder wants one uniform schema anyway.

pub mod attr;
pub mod flower;
pub mod rtnl;
pub mod tc;

use netlink_packet_core::NetlinkBuffer;
use netlink_packet_core::NetlinkHeader;
use netlink_packet_utils::DecodeError;
use netlink_packet_utils::Emitable;

use crate::addr::AfAddr;
use crate::tc_rule::TcRule;

// Message types (linux/rtnetlink.h).
pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_GETROUTE: u16 = 26;
pub const RTM_NEWNEIGH: u16 = 28;
pub const RTM_DELNEIGH: u16 = 29;
pub const RTM_GETNEIGH: u16 = 30;
pub const RTM_NEWQDISC: u16 = 36;
pub const RTM_DELQDISC: u16 = 37;
pub const RTM_GETQDISC: u16 = 38;
pub const RTM_NEWTFILTER: u16 = 44;
pub const RTM_DELTFILTER: u16 = 45;
pub const RTM_GETTFILTER: u16 = 46;
pub const RTM_NEWCHAIN: u16 = 100;
pub const RTM_DELCHAIN: u16 = 101;
pub const RTM_GETCHAIN: u16 = 102;

// Control message types.
pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

// Header flag bits beyond what netlink-packet-core exports.
pub const NLM_F_CAPPED: u16 = 0x100;
pub const NLM_F_ACK_TLVS: u16 = 0x200;

// Multicast groups the monitor joins.
pub const RTNLGRP_LINK: u32 = 1;
pub const RTNLGRP_NEIGH: u32 = 3;
pub const RTNLGRP_TC: u32 = 4;
pub const RTNLGRP_IPV4_ROUTE: u32 = 7;
pub const RTNLGRP_IPV6_ROUTE: u32 = 10;

// Link attributes.
pub const IFLA_ADDRESS: u16 = 1;
pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_MTU: u16 = 4;
pub const IFLA_LINK: u16 = 5;
pub const IFLA_LINKINFO: u16 = 18;
pub const IFLA_INFO_KIND: u16 = 1;
pub const IFLA_INFO_DATA: u16 = 2;
pub const IFLA_VLAN_ID: u16 = 1;
pub const IFLA_VLAN_FLAGS: u16 = 2;
pub const IFLA_VLAN_PROTOCOL: u16 = 5;
pub const ARPHRD_ETHER: u16 = 1;

// Neighbour attributes.
pub const NDA_DST: u16 = 1;
pub const NDA_LLADDR: u16 = 2;
pub const NDA_CACHEINFO: u16 = 3;
pub const NDA_PROBES: u16 = 4;

// Route attributes.
pub const RTA_DST: u16 = 1;
pub const RTA_SRC: u16 = 2;
pub const RTA_OIF: u16 = 4;
pub const RTA_GATEWAY: u16 = 5;
pub const RTA_PRIORITY: u16 = 6;
pub const RTA_PREFSRC: u16 = 7;
pub const RTA_METRICS: u16 = 8;
pub const RTA_MULTIPATH: u16 = 9;
pub const RTA_FLOW: u16 = 11;
pub const RTA_CACHEINFO: u16 = 12;
pub const RTA_TABLE: u16 = 15;
pub const RT_TABLE_UNSPEC: u8 = 0;

// Traffic-control attributes.
pub const TCA_KIND: u16 = 1;
pub const TCA_OPTIONS: u16 = 2;
pub const TCA_STATS: u16 = 3;
pub const TCA_XSTATS: u16 = 4;
pub const TCA_STATS2: u16 = 7;
pub const TCA_CHAIN: u16 = 11;
pub const TCA_HW_OFFLOAD: u16 = 12;

// tc handle composition (linux/pkt_sched.h).
pub const TC_H_CLSACT: u32 = 0xffff_fff1;
pub const TC_H_MIN_INGRESS: u32 = 0xfff2;
/// Chains report the ingress qdisc handle (ffff:0000) as their parent.
pub const TC_H_MAJ_INGRESS: u32 = 0xffff_0000;

pub const fn tc_h_make(maj: u32, min: u32) -> u32 {
    (maj & 0xffff_0000) | (min & 0xffff)
}

pub const PARENT_CLSACT_INGRESS: u32 = tc_h_make(TC_H_CLSACT, TC_H_MIN_INGRESS);

// Flower classifier attributes (linux/pkt_cls.h).
pub const TCA_FLOWER_ACT: u16 = 3;
pub const TCA_FLOWER_KEY_ETH_TYPE: u16 = 8;
pub const TCA_FLOWER_KEY_IPV4_SRC: u16 = 10;
pub const TCA_FLOWER_KEY_IPV4_SRC_MASK: u16 = 11;
pub const TCA_FLOWER_KEY_IPV4_DST: u16 = 12;
pub const TCA_FLOWER_KEY_IPV4_DST_MASK: u16 = 13;
pub const TCA_FLOWER_KEY_IPV6_DST: u16 = 16;
pub const TCA_FLOWER_KEY_IPV6_DST_MASK: u16 = 17;
pub const TCA_FLOWER_FLAGS: u16 = 22;
pub const TCA_FLOWER_KEY_VLAN_ETH_TYPE: u16 = 25;
pub const TCA_FLOWER_KEY_IP_TTL: u16 = 75;
pub const TCA_FLOWER_KEY_IP_TTL_MASK: u16 = 76;
pub const TCA_FLOWER_IN_HW_COUNT: u16 = 86;

pub const TCA_CLS_FLAGS_SKIP_HW: u32 = 1 << 0;
pub const TCA_CLS_FLAGS_SKIP_SW: u32 = 1 << 1;
pub const TCA_CLS_FLAGS_IN_HW: u32 = 1 << 2;

// Action attributes.
pub const TCA_ACT_KIND: u16 = 1;
pub const TCA_ACT_OPTIONS: u16 = 2;
pub const TCA_ACT_INDEX: u16 = 3;
pub const TCA_ACT_STATS: u16 = 4;
pub const TCA_ACT_USED_HW_STATS: u16 = 9;
pub const TCA_ACT_IN_HW_COUNT: u16 = 10;

pub const TCA_GACT_TM: u16 = 1;
pub const TCA_GACT_PARMS: u16 = 2;
pub const TCA_GACT_PROB: u16 = 3;

pub const TCA_VLAN_TM: u16 = 1;
pub const TCA_VLAN_PARMS: u16 = 2;
pub const TCA_VLAN_PUSH_VLAN_ID: u16 = 3;
pub const TCA_VLAN_PUSH_VLAN_PROTOCOL: u16 = 4;
pub const TCA_VLAN_ACT_MODIFY: i32 = 3;

pub const TCA_PEDIT_TM: u16 = 1;
pub const TCA_PEDIT_PARMS_EX: u16 = 4;
pub const TCA_PEDIT_KEYS_EX: u16 = 5;
pub const TCA_PEDIT_KEY_EX: u16 = 6;
pub const TCA_PEDIT_KEY_EX_HTYPE: u16 = 1;
pub const TCA_PEDIT_KEY_EX_CMD: u16 = 2;
pub const TCA_PEDIT_KEY_EX_HDR_TYPE_ETH: u16 = 1;
pub const TCA_PEDIT_KEY_EX_HDR_TYPE_IP4: u16 = 2;
pub const TCA_PEDIT_KEY_EX_HDR_TYPE_IP6: u16 = 3;
pub const TCA_PEDIT_KEY_EX_CMD_SET: u16 = 0;
pub const TCA_PEDIT_KEY_EX_CMD_ADD: u16 = 1;

pub const TCA_MIRRED_TM: u16 = 1;
pub const TCA_MIRRED_PARMS: u16 = 2;
pub const TCA_EGRESS_REDIR: i32 = 1;

pub const TCA_CSUM_PARMS: u16 = 1;
pub const TCA_CSUM_UPDATE_FLAG_IPV4HDR: u32 = 1;

// Generic action verdicts.
pub const TC_ACT_PIPE: i32 = 3;
pub const TC_ACT_STOLEN: i32 = 4;
pub const TC_ACT_TRAP: i32 = 8;
pub const TC_ACT_GOTO_CHAIN: i32 = 0x2000_0000;
pub const TC_ACT_EXT_VAL_MASK: i32 = 0x0fff_ffff;

pub const fn tc_act_ext_cmp(combined: i32, opcode: i32) -> bool {
    (combined & !TC_ACT_EXT_VAL_MASK) == opcode
}

// Ethertypes, in host order; put on the wire big-endian.
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86dd;
pub const ETH_P_8021Q: u16 = 0x8100;

// Extended-ack attributes on NLMSG_ERROR (linux/netlink.h).
pub const NLMSGERR_ATTR_MSG: u16 = 1;
pub const NLMSGERR_ATTR_OFFS: u16 = 2;
pub const NLMSGERR_ATTR_MISS_TYPE: u16 = 5;
pub const NLMSGERR_ATTR_MISS_NEST: u16 = 6;

/// Whether a message announces or withdraws state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    New,
    Del,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkEvent {
    pub op: Op,
    pub ifindex: i32,
    pub lladdr: Option<[u8; 6]>,
    pub lower_ifindex: i32,
    pub vlan_id: u16,
    pub mtu: u32,
    pub ifname: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighEvent {
    pub op: Op,
    pub ifindex: i32,
    pub addr: AfAddr,
    pub lladdr: Option<[u8; 6]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextHop {
    pub ifindex: i32,
    pub gateway: std::net::IpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEvent {
    pub op: Op,
    pub dst: AfAddr,
    pub nexthop: Option<NextHop>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QdiscEvent {
    pub kind: String,
    pub chain_no: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainEvent {
    pub op: Op,
    pub chain_no: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterEvent {
    pub op: Op,
    pub chain_no: u32,
    pub prio: u16,
    pub rule: Option<TcRule>,
}

/// One semantic event per accepted datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RtnlEvent {
    Link(LinkEvent),
    Neigh(NeighEvent),
    Route(RouteEvent),
    Qdisc(QdiscEvent),
    Chain(ChainEvent),
    Filter(FilterEvent),
}

/// One netlink frame, split out of a datagram.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub message_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub port: u32,
    pub payload: Vec<u8>,
}

const NLMSG_HDR_LEN: usize = 16;

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Split a received datagram into its frames.
pub fn split_frames(buf: &[u8]) -> Result<Vec<RawMessage>, DecodeError> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let nb = NetlinkBuffer::new_checked(&buf[offset..])?;
        frames.push(RawMessage {
            message_type: nb.message_type(),
            flags: nb.flags(),
            seq: nb.sequence_number(),
            port: nb.port_number(),
            payload: nb.payload().to_vec(),
        });
        offset += nlmsg_align(nb.length() as usize);
    }

    Ok(frames)
}

/// The slice of configuration the decoders filter on.
#[derive(Clone, Copy, Debug)]
pub struct DecodeFilter {
    pub egress_ifindex: i32,
    pub table_id: u32,
}

/// Decode one frame into its semantic event. `None` means the message was
/// valid but filtered (wrong interface, wrong table, not ours to track).
pub fn decode(msg: &RawMessage, filt: &DecodeFilter) -> Result<Option<RtnlEvent>, DecodeError> {
    match msg.message_type {
        RTM_NEWLINK | RTM_DELLINK => rtnl::decode_link(msg, filt),
        RTM_NEWNEIGH | RTM_DELNEIGH | RTM_GETNEIGH => rtnl::decode_neigh(msg),
        RTM_NEWROUTE | RTM_DELROUTE => rtnl::decode_route(msg, filt),
        RTM_NEWQDISC | RTM_DELQDISC => tc::decode_qdisc(msg, filt),
        RTM_NEWCHAIN | RTM_DELCHAIN => tc::decode_chain(msg, filt),
        RTM_NEWTFILTER | RTM_DELTFILTER => flower::decode_filter(msg, filt),
        other => {
            tracing::trace!(message_type = other, "no handler for message type");
            Ok(None)
        }
    }
}

/// Build a complete request message around `payload`; the sequence number is
/// stamped by the connection at send time.
pub fn request(message_type: u16, flags: u16, payload: Vec<u8>) -> Vec<u8> {
    let mut header = NetlinkHeader::default();
    header.message_type = message_type;
    header.flags = flags;
    header.length = (NLMSG_HDR_LEN + payload.len()) as u32;

    let mut buf = vec![0u8; NLMSG_HDR_LEN + payload.len()];
    header.emit(&mut buf[..NLMSG_HDR_LEN]);
    buf[NLMSG_HDR_LEN..].copy_from_slice(&payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_core::NLM_F_REQUEST;

    #[test]
    fn request_frames_split_back() -> anyhow::Result<()> {
        let a = request(RTM_GETLINK, NLM_F_REQUEST, vec![0u8; 16]);
        let b = request(RTM_GETNEIGH, NLM_F_REQUEST, vec![0u8; 12]);
        let mut joined = a.clone();
        joined.extend_from_slice(&b);

        let frames = split_frames(&joined)?;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message_type, RTM_GETLINK);
        assert_eq!(frames[0].payload.len(), 16);
        assert_eq!(frames[1].message_type, RTM_GETNEIGH);
        assert_eq!(frames[1].payload.len(), 12);
        Ok(())
    }
}
