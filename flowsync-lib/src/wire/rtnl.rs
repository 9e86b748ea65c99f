//! Link, neighbour and route messages: schema tables, decoders and the dump
//! requests the scan driver sends.

use netlink_packet_core::{NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_utils::DecodeError;

use crate::addr::{AfAddr, Family};
use crate::wire::attr::{AttrKind, AttrSet, MsgBuilder, read_i32_ne, read_u8, read_u16_ne, spec};
use crate::wire::{
    ARPHRD_ETHER, DecodeFilter, IFLA_ADDRESS, IFLA_IFNAME, IFLA_INFO_DATA, IFLA_INFO_KIND,
    IFLA_LINK, IFLA_LINKINFO, IFLA_MTU, IFLA_VLAN_FLAGS, IFLA_VLAN_ID, IFLA_VLAN_PROTOCOL,
    LinkEvent, NDA_CACHEINFO, NDA_DST, NDA_LLADDR, NDA_PROBES, NeighEvent, NextHop, Op,
    RT_TABLE_UNSPEC, RTA_CACHEINFO, RTA_DST, RTA_FLOW, RTA_GATEWAY, RTA_METRICS, RTA_MULTIPATH,
    RTA_OIF, RTA_PREFSRC, RTA_PRIORITY, RTA_SRC, RTA_TABLE, RTM_DELLINK, RTM_DELNEIGH,
    RTM_DELROUTE, RTM_GETLINK, RTM_GETNEIGH, RTM_GETROUTE, RawMessage, RtnlEvent, RouteEvent,
    request,
};

const IFINFOMSG_LEN: usize = 16;
const NDMSG_LEN: usize = 12;
const RTMSG_LEN: usize = 12;
const RTNEXTHOP_LEN: usize = 8;

const LINK_ATTRS: &[crate::wire::attr::AttrSpec] = &[
    spec(IFLA_ADDRESS, AttrKind::Binary, "IFLA_ADDRESS"),
    spec(IFLA_MTU, AttrKind::U32, "IFLA_MTU"),
    spec(IFLA_IFNAME, AttrKind::NulString, "IFLA_IFNAME"),
    spec(IFLA_LINK, AttrKind::U32, "IFLA_LINK"),
    spec(IFLA_LINKINFO, AttrKind::Nested, "IFLA_LINKINFO"),
];

const LINK_INFO_ATTRS: &[crate::wire::attr::AttrSpec] = &[
    spec(IFLA_INFO_KIND, AttrKind::NulString, "IFLA_INFO_KIND"),
    spec(IFLA_INFO_DATA, AttrKind::Nested, "IFLA_INFO_DATA"),
];

const LINK_VLAN_ATTRS: &[crate::wire::attr::AttrSpec] = &[
    spec(IFLA_VLAN_ID, AttrKind::U16, "IFLA_VLAN_ID"),
    spec(IFLA_VLAN_FLAGS, AttrKind::Binary, "IFLA_VLAN_FLAGS"),
    spec(IFLA_VLAN_PROTOCOL, AttrKind::U16, "IFLA_VLAN_PROTOCOL"),
];

const NEIGH_ATTRS: &[crate::wire::attr::AttrSpec] = &[
    spec(NDA_DST, AttrKind::Binary, "NDA_DST"),
    spec(NDA_LLADDR, AttrKind::Binary, "NDA_LLADDR"),
    spec(NDA_CACHEINFO, AttrKind::Binary, "NDA_CACHEINFO"),
    spec(NDA_PROBES, AttrKind::U32, "NDA_PROBES"),
];

const ROUTE4_ATTRS: &[crate::wire::attr::AttrSpec] = &[
    spec(RTA_TABLE, AttrKind::U32, "RTA_TABLE"),
    spec(RTA_OIF, AttrKind::U32, "RTA_OIF"),
    spec(RTA_FLOW, AttrKind::U32, "RTA_FLOW"),
    spec(RTA_PRIORITY, AttrKind::U32, "RTA_PRIORITY"),
    spec(RTA_DST, AttrKind::U32, "RTA_DST"),
    spec(RTA_SRC, AttrKind::U32, "RTA_SRC"),
    spec(RTA_PREFSRC, AttrKind::U32, "RTA_PREFSRC"),
    spec(RTA_GATEWAY, AttrKind::U32, "RTA_GATEWAY"),
    spec(RTA_METRICS, AttrKind::Nested, "RTA_METRICS"),
    spec(RTA_MULTIPATH, AttrKind::Binary, "RTA_MULTIPATH"),
];

const ROUTE6_ATTRS: &[crate::wire::attr::AttrSpec] = &[
    spec(RTA_TABLE, AttrKind::U32, "RTA_TABLE"),
    spec(RTA_OIF, AttrKind::U32, "RTA_OIF"),
    spec(RTA_FLOW, AttrKind::U32, "RTA_FLOW"),
    spec(RTA_PRIORITY, AttrKind::U32, "RTA_PRIORITY"),
    spec(RTA_DST, AttrKind::Binary, "RTA_DST"),
    spec(RTA_SRC, AttrKind::Binary, "RTA_SRC"),
    spec(RTA_PREFSRC, AttrKind::Binary, "RTA_PREFSRC"),
    spec(RTA_GATEWAY, AttrKind::Binary, "RTA_GATEWAY"),
    spec(RTA_METRICS, AttrKind::Nested, "RTA_METRICS"),
    spec(RTA_MULTIPATH, AttrKind::Binary, "RTA_MULTIPATH"),
    spec(RTA_CACHEINFO, AttrKind::Binary, "RTA_CACHEINFO"),
];

fn parse_ip(family: Family, value: &[u8]) -> Option<std::net::IpAddr> {
    match family {
        Family::V4 => {
            let octets: [u8; 4] = value.get(..4)?.try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
        Family::V6 => {
            let octets: [u8; 16] = value.get(..16)?.try_into().ok()?;
            Some(std::net::IpAddr::from(octets))
        }
    }
}

/// Only Ethernet links riding on the egress interface are of interest; their
/// VLAN id is dug out of the nested link info.
pub(crate) fn decode_link(
    msg: &RawMessage,
    filt: &DecodeFilter,
) -> Result<Option<RtnlEvent>, DecodeError> {
    let payload = &msg.payload;
    if payload.len() < IFINFOMSG_LEN {
        return Err(DecodeError::from("short ifinfomsg"));
    }
    if read_u16_ne(payload, 2)? != ARPHRD_ETHER {
        return Ok(None);
    }
    let ifindex = read_i32_ne(payload, 4)?;

    let attrs = AttrSet::parse(&payload[IFINFOMSG_LEN..], LINK_ATTRS)?;
    let lower_ifindex = attrs.get_u32(IFLA_LINK).unwrap_or(0) as i32;
    if lower_ifindex != filt.egress_ifindex {
        return Ok(None);
    }

    let mut vlan_id = 0;
    if let Some(info) = attrs.get(IFLA_LINKINFO) {
        let info = AttrSet::parse(info, LINK_INFO_ATTRS)?;
        let is_vlan = info.get_string(IFLA_INFO_KIND).as_deref() == Some("vlan");
        if is_vlan && let Some(data) = info.get(IFLA_INFO_DATA) {
            let vlan = AttrSet::parse(data, LINK_VLAN_ATTRS)?;
            vlan_id = vlan.get_u16(IFLA_VLAN_ID).unwrap_or(0);
        }
    }

    Ok(Some(RtnlEvent::Link(LinkEvent {
        op: if msg.message_type == RTM_DELLINK { Op::Del } else { Op::New },
        ifindex,
        lladdr: attrs.get_mac(IFLA_ADDRESS),
        lower_ifindex,
        vlan_id,
        mtu: attrs.get_u32(IFLA_MTU).unwrap_or(0),
        ifname: attrs.get_string(IFLA_IFNAME),
    })))
}

pub(crate) fn decode_neigh(msg: &RawMessage) -> Result<Option<RtnlEvent>, DecodeError> {
    let payload = &msg.payload;
    if payload.len() < NDMSG_LEN {
        return Err(DecodeError::from("short ndmsg"));
    }
    let Some(family) = Family::from_af(read_u8(payload, 0)?) else {
        return Ok(None);
    };
    let ifindex = read_i32_ne(payload, 4)?;

    let attrs = AttrSet::parse(&payload[NDMSG_LEN..], NEIGH_ATTRS)?;
    let addr = attrs
        .get(NDA_DST)
        .and_then(|v| parse_ip(family, v))
        .map(AfAddr::host)
        .unwrap_or_else(|| AfAddr::unspec(family));

    Ok(Some(RtnlEvent::Neigh(NeighEvent {
        op: if msg.message_type == RTM_DELNEIGH { Op::Del } else { Op::New },
        ifindex,
        addr,
        lladdr: attrs.get_mac(NDA_LLADDR),
    })))
}

/// A multipath route collapses to its first next-hop carrying a gateway.
fn first_nexthop(family: Family, mp: &[u8]) -> Result<Option<NextHop>, DecodeError> {
    if mp.len() < RTNEXTHOP_LEN {
        return Ok(None);
    }
    let rtnh_len = usize::from(read_u16_ne(mp, 0)?);
    if rtnh_len < RTNEXTHOP_LEN || rtnh_len > mp.len() {
        return Err(DecodeError::from("malformed rtnexthop"));
    }
    let ifindex = read_i32_ne(mp, 4)?;

    let schema = match family {
        Family::V4 => ROUTE4_ATTRS,
        Family::V6 => ROUTE6_ATTRS,
    };
    let attrs = AttrSet::parse(&mp[RTNEXTHOP_LEN..rtnh_len], schema)?;
    let gateway = attrs.get(RTA_GATEWAY).and_then(|v| parse_ip(family, v));

    Ok(gateway.map(|gateway| NextHop { ifindex, gateway }))
}

pub(crate) fn decode_route(
    msg: &RawMessage,
    filt: &DecodeFilter,
) -> Result<Option<RtnlEvent>, DecodeError> {
    let payload = &msg.payload;
    if payload.len() < RTMSG_LEN {
        return Err(DecodeError::from("short rtmsg"));
    }
    let Some(family) = Family::from_af(read_u8(payload, 0)?) else {
        return Ok(None);
    };
    let dst_len = read_u8(payload, 1)?;

    let schema = match family {
        Family::V4 => ROUTE4_ATTRS,
        Family::V6 => ROUTE6_ATTRS,
    };
    let attrs = AttrSet::parse(&payload[RTMSG_LEN..], schema)?;

    let table = attrs
        .get_u32(RTA_TABLE)
        .unwrap_or_else(|| u32::from(payload[4]));
    if table != filt.table_id {
        return Ok(None);
    }

    let Some(dst) = attrs.get(RTA_DST).and_then(|v| parse_ip(family, v)) else {
        return Ok(None);
    };

    let nexthop = if let Some(mp) = attrs.get(RTA_MULTIPATH) {
        first_nexthop(family, mp)?
    } else {
        let oif = attrs.get_u32(RTA_OIF);
        let gateway = attrs.get(RTA_GATEWAY).and_then(|v| parse_ip(family, v));
        match (oif, gateway) {
            (Some(oif), Some(gateway)) => Some(NextHop { ifindex: oif as i32, gateway }),
            _ => {
                tracing::trace!(%dst, "route without usable next-hop");
                None
            }
        }
    };

    Ok(Some(RtnlEvent::Route(RouteEvent {
        op: if msg.message_type == RTM_DELROUTE { Op::Del } else { Op::New },
        dst: AfAddr::new(dst, dst_len),
        nexthop,
    })))
}

pub fn dump_links_request() -> Vec<u8> {
    let mut ifinfomsg = [0u8; IFINFOMSG_LEN];
    ifinfomsg[0] = libc::AF_UNSPEC as u8;
    request(RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP, ifinfomsg.to_vec())
}

pub fn dump_neigh_request(family: Family) -> Vec<u8> {
    let mut ndmsg = [0u8; NDMSG_LEN];
    ndmsg[0] = family.af();
    request(RTM_GETNEIGH, NLM_F_REQUEST | NLM_F_DUMP, ndmsg.to_vec())
}

pub fn dump_routes_request(family: Family, table_id: u32) -> Vec<u8> {
    let mut b = MsgBuilder::new();
    let mut rtmsg = [0u8; RTMSG_LEN];
    rtmsg[0] = family.af();
    rtmsg[4] = RT_TABLE_UNSPEC;
    b.raw(&rtmsg);
    b.attr_u32(RTA_TABLE, table_id);
    request(RTM_GETROUTE, NLM_F_REQUEST | NLM_F_DUMP, b.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{RTM_NEWLINK, RTM_NEWNEIGH, RTM_NEWROUTE, split_frames};

    const FILT: DecodeFilter = DecodeFilter {
        egress_ifindex: 1,
        table_id: 254,
    };

    fn raw(message_type: u16, payload: Vec<u8>) -> RawMessage {
        RawMessage {
            message_type,
            flags: 0,
            seq: 0,
            port: 0,
            payload,
        }
    }

    fn link_payload(ifindex: i32, lower: u32, vlan_id: u16) -> Vec<u8> {
        let mut b = MsgBuilder::new();
        let mut ifinfomsg = [0u8; IFINFOMSG_LEN];
        ifinfomsg[2..4].copy_from_slice(&ARPHRD_ETHER.to_ne_bytes());
        ifinfomsg[4..8].copy_from_slice(&ifindex.to_ne_bytes());
        b.raw(&ifinfomsg);
        b.attr(IFLA_ADDRESS, &[0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf]);
        b.attr_str(IFLA_IFNAME, "eth0.123");
        b.attr_u32(IFLA_MTU, 1500);
        b.attr_u32(IFLA_LINK, lower);
        let info = b.nest_start(IFLA_LINKINFO);
        b.attr_str(IFLA_INFO_KIND, "vlan");
        let data = b.nest_start(IFLA_INFO_DATA);
        b.attr_u16(IFLA_VLAN_ID, vlan_id);
        b.nest_end(data);
        b.nest_end(info);
        b.into_bytes()
    }

    #[test]
    fn link_decodes_with_vlan_id() -> anyhow::Result<()> {
        let ev = decode_link(&raw(RTM_NEWLINK, link_payload(2, 1, 123)), &FILT)?;
        let Some(RtnlEvent::Link(link)) = ev else {
            anyhow::bail!("expected a link event");
        };
        assert_eq!(link.op, Op::New);
        assert_eq!(link.ifindex, 2);
        assert_eq!(link.vlan_id, 123);
        assert_eq!(link.mtu, 1500);
        assert_eq!(link.ifname.as_deref(), Some("eth0.123"));
        assert_eq!(link.lladdr, Some([0xaa, 0xab, 0xac, 0xad, 0xae, 0xaf]));
        Ok(())
    }

    #[test]
    fn link_on_other_parent_is_filtered() -> anyhow::Result<()> {
        let ev = decode_link(&raw(RTM_NEWLINK, link_payload(2, 9, 123)), &FILT)?;
        assert_eq!(ev, None);
        Ok(())
    }

    #[test]
    fn neigh_decodes() -> anyhow::Result<()> {
        let mut b = MsgBuilder::new();
        let mut ndmsg = [0u8; NDMSG_LEN];
        ndmsg[0] = libc::AF_INET as u8;
        ndmsg[4..8].copy_from_slice(&2i32.to_ne_bytes());
        b.raw(&ndmsg);
        b.attr(NDA_DST, &[192, 0, 2, 1]);
        b.attr(NDA_LLADDR, &[0xca, 0xcb, 0xcc, 0xcd, 0xce, 0xcf]);

        let ev = decode_neigh(&raw(RTM_NEWNEIGH, b.into_bytes()))?;
        let Some(RtnlEvent::Neigh(neigh)) = ev else {
            anyhow::bail!("expected a neigh event");
        };
        assert_eq!(neigh.ifindex, 2);
        assert_eq!(neigh.addr.to_string(), "192.0.2.1/0");
        assert_eq!(neigh.lladdr, Some([0xca, 0xcb, 0xcc, 0xcd, 0xce, 0xcf]));
        Ok(())
    }

    fn route_payload(table: u32, with_dst: bool) -> Vec<u8> {
        let mut b = MsgBuilder::new();
        let mut rtmsg = [0u8; RTMSG_LEN];
        rtmsg[0] = libc::AF_INET as u8;
        rtmsg[1] = 25;
        b.raw(&rtmsg);
        b.attr_u32(RTA_TABLE, table);
        if with_dst {
            b.attr(RTA_DST, &[192, 0, 2, 128]);
        }
        b.attr_u32(RTA_OIF, 2);
        b.attr(RTA_GATEWAY, &[192, 0, 2, 1]);
        b.into_bytes()
    }

    #[test]
    fn route_decodes_unipath() -> anyhow::Result<()> {
        let ev = decode_route(&raw(RTM_NEWROUTE, route_payload(254, true)), &FILT)?;
        let Some(RtnlEvent::Route(route)) = ev else {
            anyhow::bail!("expected a route event");
        };
        assert_eq!(route.dst.to_string(), "192.0.2.128/25");
        let nh = route.nexthop.expect("next-hop");
        assert_eq!(nh.ifindex, 2);
        assert_eq!(nh.gateway.to_string(), "192.0.2.1");
        Ok(())
    }

    #[test]
    fn route_in_other_table_is_filtered() -> anyhow::Result<()> {
        let ev = decode_route(&raw(RTM_NEWROUTE, route_payload(1, true)), &FILT)?;
        assert_eq!(ev, None);
        Ok(())
    }

    #[test]
    fn route_without_destination_is_ignored() -> anyhow::Result<()> {
        let ev = decode_route(&raw(RTM_NEWROUTE, route_payload(254, false)), &FILT)?;
        assert_eq!(ev, None);
        Ok(())
    }

    #[test]
    fn multipath_collapses_to_first_hop() -> anyhow::Result<()> {
        let mut b = MsgBuilder::new();
        let mut rtmsg = [0u8; RTMSG_LEN];
        rtmsg[0] = libc::AF_INET as u8;
        rtmsg[1] = 24;
        b.raw(&rtmsg);
        b.attr_u32(RTA_TABLE, 254);
        b.attr(RTA_DST, &[198, 51, 100, 0]);

        // two next-hops, each an 8-byte rtnexthop followed by a gateway attr
        let mut mp = Vec::new();
        for (ifindex, gw) in [(2i32, [192, 0, 2, 1]), (3i32, [192, 0, 2, 2])] {
            let mut hop = MsgBuilder::new();
            hop.attr(RTA_GATEWAY, &gw);
            let attrs = hop.into_bytes();
            let rtnh_len = (RTNEXTHOP_LEN + attrs.len()) as u16;
            mp.extend_from_slice(&rtnh_len.to_ne_bytes());
            mp.extend_from_slice(&[0, 0]);
            mp.extend_from_slice(&ifindex.to_ne_bytes());
            mp.extend_from_slice(&attrs);
        }
        b.attr(RTA_MULTIPATH, &mp);

        let ev = decode_route(&raw(RTM_NEWROUTE, b.into_bytes()), &FILT)?;
        let Some(RtnlEvent::Route(route)) = ev else {
            anyhow::bail!("expected a route event");
        };
        let nh = route.nexthop.expect("next-hop");
        assert_eq!(nh.ifindex, 2);
        assert_eq!(nh.gateway.to_string(), "192.0.2.1");
        Ok(())
    }

    #[test]
    fn dump_requests_are_well_formed() -> anyhow::Result<()> {
        for bytes in [
            dump_links_request(),
            dump_neigh_request(Family::V6),
            dump_routes_request(Family::V4, 254),
        ] {
            let frames = split_frames(&bytes)?;
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].flags, NLM_F_REQUEST | NLM_F_DUMP);
        }
        Ok(())
    }
}
