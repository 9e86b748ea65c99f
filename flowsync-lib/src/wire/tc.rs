//! Qdisc and chain messages plus the traffic-control dump requests.

use netlink_packet_core::{NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_utils::DecodeError;

use crate::wire::attr::{AttrKind, AttrSet, AttrSpec, MsgBuilder, read_i32_ne, read_u32_ne, spec};
use crate::wire::{
    ChainEvent, DecodeFilter, Op, PARENT_CLSACT_INGRESS, QdiscEvent, RTM_DELCHAIN, RTM_GETCHAIN,
    RTM_GETQDISC, RTM_GETTFILTER, RawMessage, RtnlEvent, TC_H_MAJ_INGRESS, TCA_CHAIN,
    TCA_HW_OFFLOAD, TCA_KIND, TCA_OPTIONS, TCA_STATS, TCA_STATS2, TCA_XSTATS, request,
};

pub(crate) const TCMSG_LEN: usize = 20;

pub(crate) const TC_ATTRS: &[AttrSpec] = &[
    spec(TCA_KIND, AttrKind::NulString, "TCA_KIND"),
    spec(TCA_OPTIONS, AttrKind::Nested, "TCA_OPTIONS"),
    spec(TCA_STATS, AttrKind::Binary, "TCA_STATS"),
    spec(TCA_XSTATS, AttrKind::Binary, "TCA_XSTATS"),
    spec(TCA_STATS2, AttrKind::Nested, "TCA_STATS2"),
    spec(TCA_CHAIN, AttrKind::U32, "TCA_CHAIN"),
    spec(TCA_HW_OFFLOAD, AttrKind::U8, "TCA_HW_OFFLOAD"),
];

pub(crate) struct TcMsg {
    pub ifindex: i32,
    pub handle: u32,
    pub parent: u32,
    pub info: u32,
}

pub(crate) fn read_tcmsg(payload: &[u8]) -> Result<TcMsg, DecodeError> {
    if payload.len() < TCMSG_LEN {
        return Err(DecodeError::from("short tcmsg"));
    }
    Ok(TcMsg {
        ifindex: read_i32_ne(payload, 4)?,
        handle: read_u32_ne(payload, 8)?,
        parent: read_u32_ne(payload, 12)?,
        info: read_u32_ne(payload, 16)?,
    })
}

pub(crate) fn tcmsg_bytes(ifindex: i32, handle: u32, parent: u32, info: u32) -> [u8; TCMSG_LEN] {
    let mut buf = [0u8; TCMSG_LEN];
    buf[0] = libc::AF_UNSPEC as u8;
    buf[4..8].copy_from_slice(&ifindex.to_ne_bytes());
    buf[8..12].copy_from_slice(&handle.to_ne_bytes());
    buf[12..16].copy_from_slice(&parent.to_ne_bytes());
    buf[16..20].copy_from_slice(&info.to_ne_bytes());
    buf
}

pub(crate) fn decode_qdisc(
    msg: &RawMessage,
    filt: &DecodeFilter,
) -> Result<Option<RtnlEvent>, DecodeError> {
    let tcm = read_tcmsg(&msg.payload)?;
    let attrs = AttrSet::parse(&msg.payload[TCMSG_LEN..], TC_ATTRS)?;

    if tcm.ifindex != filt.egress_ifindex {
        return Ok(None);
    }
    let Some(kind) = attrs.get_string(TCA_KIND) else {
        return Ok(None);
    };

    Ok(Some(RtnlEvent::Qdisc(QdiscEvent {
        kind,
        chain_no: attrs.get_u32(TCA_CHAIN).unwrap_or(0),
    })))
}

pub(crate) fn decode_chain(
    msg: &RawMessage,
    filt: &DecodeFilter,
) -> Result<Option<RtnlEvent>, DecodeError> {
    let tcm = read_tcmsg(&msg.payload)?;
    let attrs = AttrSet::parse(&msg.payload[TCMSG_LEN..], TC_ATTRS)?;

    if tcm.ifindex != filt.egress_ifindex {
        return Ok(None);
    }
    if tcm.parent != TC_H_MAJ_INGRESS {
        tracing::trace!(
            parent = format_args!("{:08x}", tcm.parent),
            "chain with unexpected parent"
        );
        return Ok(None);
    }

    Ok(Some(RtnlEvent::Chain(ChainEvent {
        op: if msg.message_type == RTM_DELCHAIN { Op::Del } else { Op::New },
        chain_no: attrs.get_u32(TCA_CHAIN).unwrap_or(0),
    })))
}

pub fn dump_qdiscs_request(egress_ifindex: i32) -> Vec<u8> {
    let tcm = tcmsg_bytes(egress_ifindex, 0, 0, 0);
    request(RTM_GETQDISC, NLM_F_REQUEST | NLM_F_DUMP, tcm.to_vec())
}

pub fn dump_chains_request(egress_ifindex: i32) -> Vec<u8> {
    let tcm = tcmsg_bytes(egress_ifindex, 0, PARENT_CLSACT_INGRESS, 0);
    request(RTM_GETCHAIN, NLM_F_REQUEST | NLM_F_DUMP, tcm.to_vec())
}

pub fn dump_chain_filters_request(egress_ifindex: i32, chain_no: u32) -> Vec<u8> {
    let mut b = MsgBuilder::new();
    b.raw(&tcmsg_bytes(egress_ifindex, 0, PARENT_CLSACT_INGRESS, 0));
    b.attr_u32(TCA_CHAIN, chain_no);
    request(RTM_GETTFILTER, NLM_F_REQUEST | NLM_F_DUMP, b.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RTM_NEWCHAIN;

    const FILT: DecodeFilter = DecodeFilter {
        egress_ifindex: 1,
        table_id: 254,
    };

    fn chain_msg(ifindex: i32, parent: u32, chain_no: u32) -> RawMessage {
        let mut b = MsgBuilder::new();
        b.raw(&tcmsg_bytes(ifindex, 0, parent, 0));
        b.attr_u32(TCA_CHAIN, chain_no);
        RawMessage {
            message_type: RTM_NEWCHAIN,
            flags: 0,
            seq: 0,
            port: 0,
            payload: b.into_bytes(),
        }
    }

    #[test]
    fn chain_decodes() -> anyhow::Result<()> {
        let ev = decode_chain(&chain_msg(1, TC_H_MAJ_INGRESS, 5), &FILT)?;
        assert_eq!(
            ev,
            Some(RtnlEvent::Chain(ChainEvent {
                op: Op::New,
                chain_no: 5
            }))
        );
        Ok(())
    }

    #[test]
    fn chain_on_other_interface_is_filtered() -> anyhow::Result<()> {
        assert_eq!(decode_chain(&chain_msg(7, TC_H_MAJ_INGRESS, 5), &FILT)?, None);
        Ok(())
    }

    #[test]
    fn chain_with_egress_parent_is_filtered() -> anyhow::Result<()> {
        assert_eq!(decode_chain(&chain_msg(1, 0x1000_0000, 5), &FILT)?, None);
        Ok(())
    }
}
