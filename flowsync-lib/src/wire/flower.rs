//! Flower filter codec.
//!
//! Decoding walks the classifier keys and the ordered action list, folding
//! everything it recognizes into the rule's trait set; anything outside that
//! grammar makes the rule alien. Encoding produces the mutation messages for
//! the action socket. The two directions are written against the same field
//! conventions so that a rule reflected through encode-then-decode compares
//! equal to the original; in loopback mode the encoder emits the message the
//! way the kernel would dump it back (ethertype rewritten, IN_HW kept).

use netlink_packet_core::{NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST};
use netlink_packet_utils::DecodeError;
use netlink_packet_utils::nla::NlasIterator;

use crate::addr::{AfAddr, Family};
use crate::tc_rule::{RuleType, TcRule, Traits};
use crate::wire::attr::{AttrKind, AttrSet, AttrSpec, MsgBuilder, read_i32_ne, read_u8, spec};
use crate::wire::tc::{TC_ATTRS, TCMSG_LEN, read_tcmsg, tcmsg_bytes};
use crate::wire::{
    DecodeFilter, ETH_P_8021Q, ETH_P_IP, ETH_P_IPV6, FilterEvent, Op, PARENT_CLSACT_INGRESS,
    RTM_DELTFILTER, RTM_NEWTFILTER, RawMessage, RtnlEvent, TC_ACT_EXT_VAL_MASK, TC_ACT_GOTO_CHAIN, tc_act_ext_cmp,
    TC_ACT_PIPE, TC_ACT_STOLEN, TC_ACT_TRAP, TCA_ACT_IN_HW_COUNT, TCA_ACT_INDEX, TCA_ACT_KIND,
    TCA_ACT_OPTIONS, TCA_ACT_STATS, TCA_ACT_USED_HW_STATS, TCA_CHAIN, TCA_CLS_FLAGS_IN_HW,
    TCA_CSUM_PARMS, TCA_CSUM_UPDATE_FLAG_IPV4HDR, TCA_FLOWER_ACT, TCA_FLOWER_FLAGS,
    TCA_FLOWER_IN_HW_COUNT, TCA_FLOWER_KEY_ETH_TYPE, TCA_FLOWER_KEY_IP_TTL,
    TCA_FLOWER_KEY_IP_TTL_MASK, TCA_FLOWER_KEY_IPV4_DST, TCA_FLOWER_KEY_IPV4_DST_MASK,
    TCA_FLOWER_KEY_IPV4_SRC, TCA_FLOWER_KEY_IPV4_SRC_MASK, TCA_FLOWER_KEY_IPV6_DST,
    TCA_FLOWER_KEY_IPV6_DST_MASK, TCA_FLOWER_KEY_VLAN_ETH_TYPE, TCA_GACT_PARMS, TCA_GACT_PROB,
    TCA_GACT_TM, TCA_KIND, TCA_MIRRED_PARMS, TCA_MIRRED_TM, TCA_OPTIONS, TCA_PEDIT_KEY_EX,
    TCA_PEDIT_KEY_EX_CMD, TCA_PEDIT_KEY_EX_CMD_ADD, TCA_PEDIT_KEY_EX_CMD_SET,
    TCA_PEDIT_KEY_EX_HDR_TYPE_ETH, TCA_PEDIT_KEY_EX_HDR_TYPE_IP4, TCA_PEDIT_KEY_EX_HDR_TYPE_IP6,
    TCA_PEDIT_KEY_EX_HTYPE, TCA_PEDIT_KEYS_EX, TCA_PEDIT_PARMS_EX, TCA_PEDIT_TM, TCA_VLAN_ACT_MODIFY,
    TCA_VLAN_PARMS, TCA_VLAN_PUSH_VLAN_ID, TCA_VLAN_PUSH_VLAN_PROTOCOL, TCA_VLAN_TM,
    TCA_EGRESS_REDIR,
};

const FLOWER_ATTRS: &[AttrSpec] = &[
    spec(TCA_FLOWER_ACT, AttrKind::Nested, "TCA_FLOWER_ACT"),
    spec(TCA_FLOWER_KEY_ETH_TYPE, AttrKind::U16, "TCA_FLOWER_KEY_ETH_TYPE"),
    spec(TCA_FLOWER_KEY_IPV4_SRC, AttrKind::U32, "TCA_FLOWER_KEY_IPV4_SRC"),
    spec(TCA_FLOWER_KEY_IPV4_SRC_MASK, AttrKind::U32, "TCA_FLOWER_KEY_IPV4_SRC_MASK"),
    spec(TCA_FLOWER_KEY_IPV4_DST, AttrKind::U32, "TCA_FLOWER_KEY_IPV4_DST"),
    spec(TCA_FLOWER_KEY_IPV4_DST_MASK, AttrKind::U32, "TCA_FLOWER_KEY_IPV4_DST_MASK"),
    spec(TCA_FLOWER_KEY_IPV6_DST, AttrKind::Binary, "TCA_FLOWER_KEY_IPV6_DST"),
    spec(TCA_FLOWER_KEY_IPV6_DST_MASK, AttrKind::Binary, "TCA_FLOWER_KEY_IPV6_DST_MASK"),
    spec(TCA_FLOWER_FLAGS, AttrKind::U32, "TCA_FLOWER_FLAGS"),
    spec(TCA_FLOWER_KEY_VLAN_ETH_TYPE, AttrKind::U16, "TCA_FLOWER_KEY_VLAN_ETH_TYPE"),
    spec(TCA_FLOWER_KEY_IP_TTL, AttrKind::U8, "TCA_FLOWER_KEY_IP_TTL"),
    spec(TCA_FLOWER_KEY_IP_TTL_MASK, AttrKind::U8, "TCA_FLOWER_KEY_IP_TTL_MASK"),
    spec(TCA_FLOWER_IN_HW_COUNT, AttrKind::U32, "TCA_FLOWER_IN_HW_COUNT"),
];

const ACT_ATTRS: &[AttrSpec] = &[
    spec(TCA_ACT_KIND, AttrKind::NulString, "TCA_ACT_KIND"),
    spec(TCA_ACT_OPTIONS, AttrKind::Nested, "TCA_ACT_OPTIONS"),
    spec(TCA_ACT_INDEX, AttrKind::U32, "TCA_ACT_INDEX"),
    spec(TCA_ACT_STATS, AttrKind::Nested, "TCA_ACT_STATS"),
    spec(TCA_ACT_USED_HW_STATS, AttrKind::Binary, "TCA_ACT_USED_HW_STATS"),
    spec(TCA_ACT_IN_HW_COUNT, AttrKind::U32, "TCA_ACT_IN_HW_COUNT"),
];

const GACT_ATTRS: &[AttrSpec] = &[
    spec(TCA_GACT_TM, AttrKind::Binary, "TCA_GACT_TM"),
    spec(TCA_GACT_PARMS, AttrKind::Binary, "TCA_GACT_PARMS"),
    spec(TCA_GACT_PROB, AttrKind::Binary, "TCA_GACT_PROB"),
];

const VLAN_ATTRS: &[AttrSpec] = &[
    spec(TCA_VLAN_TM, AttrKind::Binary, "TCA_VLAN_TM"),
    spec(TCA_VLAN_PARMS, AttrKind::Binary, "TCA_VLAN_PARMS"),
    spec(TCA_VLAN_PUSH_VLAN_ID, AttrKind::U16, "TCA_VLAN_PUSH_VLAN_ID"),
    spec(TCA_VLAN_PUSH_VLAN_PROTOCOL, AttrKind::U16, "TCA_VLAN_PUSH_VLAN_PROTOCOL"),
];

const PEDIT_ATTRS: &[AttrSpec] = &[
    spec(TCA_PEDIT_TM, AttrKind::Binary, "TCA_PEDIT_TM"),
    spec(TCA_PEDIT_PARMS_EX, AttrKind::Binary, "TCA_PEDIT_PARMS_EX"),
    spec(TCA_PEDIT_KEYS_EX, AttrKind::Nested, "TCA_PEDIT_KEYS_EX"),
];

const PEDIT_KEY_EX_ATTRS: &[AttrSpec] = &[
    spec(TCA_PEDIT_KEY_EX_HTYPE, AttrKind::U16, "TCA_PEDIT_KEY_EX_HTYPE"),
    spec(TCA_PEDIT_KEY_EX_CMD, AttrKind::U16, "TCA_PEDIT_KEY_EX_CMD"),
];

const MIRRED_ATTRS: &[AttrSpec] = &[
    spec(TCA_MIRRED_TM, AttrKind::Binary, "TCA_MIRRED_TM"),
    spec(TCA_MIRRED_PARMS, AttrKind::Binary, "TCA_MIRRED_PARMS"),
];

const TC_GEN_LEN: usize = 20;
const PEDIT_KEY_LEN: usize = 24;

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Prefix masks must be contiguous high bits; anything else is alien.
fn count_ones(mask: Option<&[u8]>, rule: &mut TcRule) -> u8 {
    let Some(mask) = mask else {
        rule.mark_alien();
        return 0;
    };

    let mut len = 0u8;
    for &octet in mask {
        match octet {
            0xff => len += 8,
            0xfe => return len + 7,
            0xfc => return len + 6,
            0xf8 => return len + 5,
            0xf0 => return len + 4,
            0xe0 => return len + 3,
            0xc0 => return len + 2,
            0x80 => return len + 1,
            0x00 => return len,
            _ => {
                rule.mark_alien();
                return 0;
            }
        }
    }
    len
}

fn decode_gact(opts: Option<&[u8]>, rule: &mut TcRule) -> Result<(), DecodeError> {
    let Some(opts) = opts else {
        rule.mark_alien();
        return Ok(());
    };
    let attrs = AttrSet::parse(opts, GACT_ATTRS)?;
    let Some(parms) = attrs.get(TCA_GACT_PARMS) else {
        rule.mark_alien();
        return Ok(());
    };
    let action = read_i32_ne(parms, 8)?;

    if tc_act_ext_cmp(action, TC_ACT_GOTO_CHAIN) {
        rule.traits |= Traits::GOTO;
        rule.goto_chain = (action & TC_ACT_EXT_VAL_MASK) as u32;
    } else if action == TC_ACT_TRAP {
        rule.traits |= Traits::TRAP;
    }
    Ok(())
}

fn decode_vlan(opts: Option<&[u8]>, rule: &mut TcRule) -> Result<(), DecodeError> {
    let Some(opts) = opts else {
        rule.mark_alien();
        return Ok(());
    };
    let attrs = AttrSet::parse(opts, VLAN_ATTRS)?;
    let Some(parms) = attrs.get(TCA_VLAN_PARMS) else {
        rule.mark_alien();
        return Ok(());
    };
    if read_i32_ne(parms, TC_GEN_LEN)? != TCA_VLAN_ACT_MODIFY {
        rule.mark_alien();
    }

    let vlan_id = attrs.get_u16(TCA_VLAN_PUSH_VLAN_ID).unwrap_or(0);
    if vlan_id > 0 {
        rule.traits |= Traits::VLAN_MOD;
        rule.vlan_id = vlan_id;
    }
    Ok(())
}

fn decode_pedit(opts: Option<&[u8]>, rule: &mut TcRule) -> Result<(), DecodeError> {
    let Some(opts) = opts else {
        rule.mark_alien();
        return Ok(());
    };
    let attrs = AttrSet::parse(opts, PEDIT_ATTRS)?;
    let (Some(sel), Some(keys_ex)) = (attrs.get(TCA_PEDIT_PARMS_EX), attrs.get(TCA_PEDIT_KEYS_EX))
    else {
        rule.mark_alien();
        return Ok(());
    };

    let mut ex = Vec::new();
    for nla in NlasIterator::new(keys_ex) {
        let nla = nla?;
        if nla.kind() != TCA_PEDIT_KEY_EX {
            continue;
        }
        let key = AttrSet::parse(nla.value(), PEDIT_KEY_EX_ATTRS)?;
        match (key.get_u16(TCA_PEDIT_KEY_EX_HTYPE), key.get_u16(TCA_PEDIT_KEY_EX_CMD)) {
            (Some(htype), Some(cmd)) => ex.push((htype, cmd)),
            _ => {
                rule.mark_alien();
                return Ok(());
            }
        }
    }

    let nkeys = usize::from(read_u8(sel, TC_GEN_LEN)?);
    if nkeys == 0 || nkeys != ex.len() || sel.len() < TC_GEN_LEN + 4 + nkeys * PEDIT_KEY_LEN {
        rule.mark_alien();
        return Ok(());
    }

    for (i, &(htype, cmd)) in ex.iter().enumerate() {
        let key = &sel[TC_GEN_LEN + 4 + i * PEDIT_KEY_LEN..];
        let mask: [u8; 4] = key[0..4].try_into().expect("sliced to width");
        let val: [u8; 4] = key[4..8].try_into().expect("sliced to width");
        let off = crate::wire::attr::read_u32_ne(key, 8)? as usize;

        match htype {
            TCA_PEDIT_KEY_EX_HDR_TYPE_ETH => {
                if cmd != TCA_PEDIT_KEY_EX_CMD_SET || off % 4 != 0 || off > 8 {
                    rule.mark_alien();
                    return Ok(());
                }
                rule.apply_mac_word(off, mask, val);
                rule.traits |= Traits::LLADDR;
            }
            TCA_PEDIT_KEY_EX_HDR_TYPE_IP4 | TCA_PEDIT_KEY_EX_HDR_TYPE_IP6 => {
                if cmd != TCA_PEDIT_KEY_EX_CMD_ADD {
                    rule.mark_alien();
                    return Ok(());
                }
                // adding into the TTL/hop-limit byte
                rule.traits |= Traits::TTL_DEC;
            }
            _ => {
                rule.mark_alien();
                return Ok(());
            }
        }
    }
    Ok(())
}

fn decode_mirred(opts: Option<&[u8]>, rule: &mut TcRule) -> Result<(), DecodeError> {
    let Some(opts) = opts else {
        rule.mark_alien();
        return Ok(());
    };
    let attrs = AttrSet::parse(opts, MIRRED_ATTRS)?;
    let Some(parms) = attrs.get(TCA_MIRRED_PARMS) else {
        rule.mark_alien();
        return Ok(());
    };
    if read_i32_ne(parms, TC_GEN_LEN)? != TCA_EGRESS_REDIR {
        rule.mark_alien();
    }
    Ok(())
}

fn decode_actions(acts: &[u8], rule: &mut TcRule) -> Result<(), DecodeError> {
    for nla in NlasIterator::new(acts) {
        let nla = nla?;
        let act = AttrSet::parse(nla.value(), ACT_ATTRS)?;
        let Some(kind) = act.get_string(TCA_ACT_KIND) else {
            rule.mark_alien();
            continue;
        };
        let opts = act.get(TCA_ACT_OPTIONS);
        match kind.as_str() {
            "gact" => decode_gact(opts, rule)?,
            "vlan" => decode_vlan(opts, rule)?,
            "pedit" => decode_pedit(opts, rule)?,
            "mirred" => decode_mirred(opts, rule)?,
            "csum" => {}
            other => {
                tracing::trace!(kind = other, "action outside the expected grammar");
                rule.mark_alien();
            }
        }
    }
    Ok(())
}

fn decode_flower(opts: &[u8], rule: &mut TcRule) -> Result<(), DecodeError> {
    let f = AttrSet::parse(opts, FLOWER_ATTRS)?;

    match f.get(TCA_FLOWER_ACT) {
        Some(acts) => decode_actions(acts, rule)?,
        None => rule.mark_alien(),
    }

    if let Some(flags) = f.get_u32(TCA_FLOWER_FLAGS) {
        rule.flower_flags = flags;
    }

    if let Some(ttl) = f.get_u8(TCA_FLOWER_KEY_IP_TTL) {
        if ttl == 1 {
            rule.traits |= Traits::TTL_CHECK;
        } else {
            rule.mark_alien();
        }
    }

    let vlan_ethertype = f.get_u16_be(TCA_FLOWER_KEY_VLAN_ETH_TYPE).unwrap_or(0);
    let ethertype = f.get_u16_be(TCA_FLOWER_KEY_ETH_TYPE).unwrap_or(0);

    if vlan_ethertype > 0 && vlan_ethertype == ethertype {
        match vlan_ethertype {
            ETH_P_IP => {
                rule.dst = AfAddr::unspec(Family::V4);
                rule.traits |= Traits::AF;
                if let Some(dst) = f.get(TCA_FLOWER_KEY_IPV4_DST) {
                    let mask_len = count_ones(f.get(TCA_FLOWER_KEY_IPV4_DST_MASK), rule);
                    let octets: [u8; 4] = dst.try_into().expect("validated as u32");
                    rule.dst = AfAddr::new(octets.into(), mask_len);
                    rule.traits |= Traits::IP;
                }
            }
            ETH_P_IPV6 => {
                rule.dst = AfAddr::unspec(Family::V6);
                rule.traits |= Traits::AF;
                if let Some(dst) = f.get(TCA_FLOWER_KEY_IPV6_DST) {
                    let mask_len = count_ones(f.get(TCA_FLOWER_KEY_IPV6_DST_MASK), rule);
                    match <[u8; 16]>::try_from(dst) {
                        Ok(octets) => {
                            rule.dst = AfAddr::new(octets.into(), mask_len);
                            rule.traits |= Traits::IP;
                        }
                        Err(_) => rule.mark_alien(),
                    }
                }
            }
            _ => rule.mark_alien(),
        }
    } else {
        rule.mark_alien();
    }

    Ok(())
}

/// Decode a filter message into a positioned rule. Filters with handle zero
/// are chain-level bookkeeping and carry no rule.
pub(crate) fn decode_filter(
    msg: &RawMessage,
    filt: &DecodeFilter,
) -> Result<Option<RtnlEvent>, DecodeError> {
    let tcm = read_tcmsg(&msg.payload)?;
    if tcm.ifindex != filt.egress_ifindex {
        return Ok(None);
    }
    if tcm.handle == 0 {
        return Ok(None);
    }

    let attrs = AttrSet::parse(&msg.payload[TCMSG_LEN..], TC_ATTRS)?;
    let op = if msg.message_type == RTM_DELTFILTER { Op::Del } else { Op::New };

    let mut rule = TcRule::default();
    let is_flower = attrs.get_string(TCA_KIND).as_deref() == Some("flower");
    match attrs.get(TCA_OPTIONS) {
        Some(opts) if is_flower => decode_flower(opts, &mut rule)?,
        _ => {
            if op == Op::New {
                rule.mark_alien();
            }
        }
    }

    if op == Op::New {
        let detected = rule.detect();
        rule.set_type(detected);
    }

    Ok(Some(RtnlEvent::Filter(FilterEvent {
        op,
        chain_no: attrs.get_u32(TCA_CHAIN).unwrap_or(0),
        prio: (tcm.info >> 16) as u16,
        rule: (op == Op::New).then_some(rule),
    })))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn tc_gen(action: i32) -> [u8; TC_GEN_LEN] {
    let mut g = [0u8; TC_GEN_LEN];
    g[8..12].copy_from_slice(&action.to_ne_bytes());
    g
}

fn action_start(b: &mut MsgBuilder, index: u16, kind: &str) -> (usize, usize) {
    let act = b.nest_start(index);
    b.attr_str(TCA_ACT_KIND, kind);
    let opts = b.nest_start(TCA_ACT_OPTIONS);
    (act, opts)
}

fn action_end(b: &mut MsgBuilder, nests: (usize, usize)) {
    b.nest_end(nests.1);
    b.nest_end(nests.0);
}

fn gact_action(b: &mut MsgBuilder, index: u16, verdict: i32) {
    let nests = action_start(b, index, "gact");
    b.attr(TCA_GACT_PARMS, &tc_gen(verdict));
    action_end(b, nests);
}

fn simple_gact(b: &mut MsgBuilder, verdict: i32) {
    let acts = b.nest_start(TCA_FLOWER_ACT);
    gact_action(b, 1, verdict);
    b.nest_end(acts);
}

fn vlan_modify_action(b: &mut MsgBuilder, index: u16, vlan_id: u16) {
    let nests = action_start(b, index, "vlan");
    let mut parms = [0u8; TC_GEN_LEN + 4];
    parms[..TC_GEN_LEN].copy_from_slice(&tc_gen(TC_ACT_PIPE));
    parms[TC_GEN_LEN..].copy_from_slice(&TCA_VLAN_ACT_MODIFY.to_ne_bytes());
    b.attr(TCA_VLAN_PARMS, &parms);
    b.attr_u16(TCA_VLAN_PUSH_VLAN_ID, vlan_id);
    action_end(b, nests);
}

fn pedit_key(sel: &mut Vec<u8>, mask: [u8; 4], val: [u8; 4], off: u32) {
    sel.extend_from_slice(&mask);
    sel.extend_from_slice(&val);
    sel.extend_from_slice(&off.to_ne_bytes());
    sel.extend_from_slice(&[0u8; 12]); // at, offmask, shift
}

/// The packet editor rewrites both MAC addresses and decrements the
/// TTL/hop-limit, all in one action: three exact-set words over the 12
/// address bytes plus one add-0xff (-1 with carry) on the TTL byte.
fn pedit_action(b: &mut MsgBuilder, index: u16, rule: &TcRule) {
    let nests = action_start(b, index, "pedit");

    let keys_ex = b.nest_start(TCA_PEDIT_KEYS_EX);
    for _ in 0..3 {
        let key = b.nest_start(TCA_PEDIT_KEY_EX);
        b.attr_u16(TCA_PEDIT_KEY_EX_CMD, TCA_PEDIT_KEY_EX_CMD_SET);
        b.attr_u16(TCA_PEDIT_KEY_EX_HTYPE, TCA_PEDIT_KEY_EX_HDR_TYPE_ETH);
        b.nest_end(key);
    }
    let key = b.nest_start(TCA_PEDIT_KEY_EX);
    b.attr_u16(TCA_PEDIT_KEY_EX_CMD, TCA_PEDIT_KEY_EX_CMD_ADD);
    let ip_htype = match rule.dst.family() {
        Family::V4 => TCA_PEDIT_KEY_EX_HDR_TYPE_IP4,
        Family::V6 => TCA_PEDIT_KEY_EX_HDR_TYPE_IP6,
    };
    b.attr_u16(TCA_PEDIT_KEY_EX_HTYPE, ip_htype);
    b.nest_end(key);
    b.nest_end(keys_ex);

    let mut sel = Vec::with_capacity(TC_GEN_LEN + 4 + 4 * PEDIT_KEY_LEN);
    sel.extend_from_slice(&tc_gen(TC_ACT_PIPE));
    sel.push(4); // nkeys
    sel.extend_from_slice(&[0u8; 3]);
    for (i, word) in rule.mac_words().iter().enumerate() {
        pedit_key(&mut sel, [0; 4], *word, (i * 4) as u32);
    }
    match rule.dst.family() {
        Family::V4 => pedit_key(&mut sel, [0x00, 0xff, 0xff, 0xff], [0xff, 0x00, 0x00, 0x00], 8),
        Family::V6 => pedit_key(&mut sel, [0xff, 0xff, 0xff, 0x00], [0x00, 0x00, 0x00, 0xff], 4),
    }
    b.attr(TCA_PEDIT_PARMS_EX, &sel);

    action_end(b, nests);
}

fn csum_action(b: &mut MsgBuilder, index: u16) {
    let nests = action_start(b, index, "csum");
    let mut parms = [0u8; TC_GEN_LEN + 4];
    parms[..TC_GEN_LEN].copy_from_slice(&tc_gen(TC_ACT_PIPE));
    parms[TC_GEN_LEN..].copy_from_slice(&TCA_CSUM_UPDATE_FLAG_IPV4HDR.to_ne_bytes());
    b.attr(TCA_CSUM_PARMS, &parms);
    action_end(b, nests);
}

fn mirred_redirect_action(b: &mut MsgBuilder, index: u16, egress_ifindex: i32) {
    let nests = action_start(b, index, "mirred");
    let mut parms = [0u8; TC_GEN_LEN + 8];
    parms[..TC_GEN_LEN].copy_from_slice(&tc_gen(TC_ACT_STOLEN));
    parms[TC_GEN_LEN..TC_GEN_LEN + 4].copy_from_slice(&TCA_EGRESS_REDIR.to_ne_bytes());
    parms[TC_GEN_LEN + 4..].copy_from_slice(&egress_ifindex.to_ne_bytes());
    b.attr(TCA_MIRRED_PARMS, &parms);
    action_end(b, nests);
}

fn v6_mask(mask_len: u8) -> [u8; 16] {
    let mut mask = [0u8; 16];
    let mut bits = usize::from(mask_len);
    for octet in mask.iter_mut() {
        if bits >= 8 {
            *octet = 0xff;
            bits -= 8;
        } else if bits > 0 {
            *octet = 0xff << (8 - bits);
            bits = 0;
        }
    }
    mask
}

fn match_prefix(b: &mut MsgBuilder, rule: &TcRule, loopback: bool) {
    let dst = &rule.dst;
    match dst.addr {
        std::net::IpAddr::V4(addr) => {
            // the kernel elides an all-zero v4 match on dump
            if loopback && dst.mask_len == 0 {
                return;
            }
            b.attr(TCA_FLOWER_KEY_IPV4_DST, &addr.octets());
            let mask = if dst.mask_len > 0 {
                (u32::MAX << (32 - u32::from(dst.mask_len))).to_be_bytes()
            } else {
                [0u8; 4]
            };
            b.attr(TCA_FLOWER_KEY_IPV4_DST_MASK, &mask);
        }
        std::net::IpAddr::V6(addr) => {
            b.attr(TCA_FLOWER_KEY_IPV6_DST, &addr.octets());
            b.attr(TCA_FLOWER_KEY_IPV6_DST_MASK, &v6_mask(dst.mask_len));
        }
    }
}

fn forward_actions(b: &mut MsgBuilder, rule: &TcRule, egress_ifindex: i32) {
    let acts = b.nest_start(TCA_FLOWER_ACT);
    let mut index = 0u16;

    index += 1;
    vlan_modify_action(b, index, rule.vlan_id);
    index += 1;
    pedit_action(b, index, rule);
    if rule.dst.family() == Family::V4 {
        index += 1;
        csum_action(b, index);
    }
    index += 1;
    mirred_redirect_action(b, index, egress_ifindex);

    b.nest_end(acts);
}

fn ethertype_for(family: Family) -> u16 {
    match family {
        Family::V4 => ETH_P_IP,
        Family::V6 => ETH_P_IPV6,
    }
}

fn encode_add(
    chain_no: u32,
    prio: u16,
    rule: &TcRule,
    egress_ifindex: i32,
    loopback: bool,
) -> Vec<u8> {
    let info = (u32::from(prio) << 16) | u32::from(ETH_P_8021Q.to_be());
    let handle = u32::from(loopback);

    let mut b = MsgBuilder::new();
    b.raw(&tcmsg_bytes(egress_ifindex, handle, PARENT_CLSACT_INGRESS, info));
    b.attr_u32(TCA_CHAIN, chain_no);
    b.attr_str(TCA_KIND, "flower");

    let flower = b.nest_start(TCA_OPTIONS);

    let mut flower_flags = rule.flower_flags;
    if !loopback {
        flower_flags &= !TCA_CLS_FLAGS_IN_HW;
    }
    b.attr_u32(TCA_FLOWER_FLAGS, flower_flags);

    let vlan_ethertype = ethertype_for(rule.dst.family());
    b.attr_u16_be(TCA_FLOWER_KEY_VLAN_ETH_TYPE, vlan_ethertype);
    // normally matched behind the 802.1Q tag; the kernel dumps the inner
    // ethertype back, which loopback mode mimics
    let ethertype = if loopback { vlan_ethertype } else { ETH_P_8021Q };
    b.attr_u16_be(TCA_FLOWER_KEY_ETH_TYPE, ethertype);

    match rule.rtype {
        RuleType::Forward => forward_actions(&mut b, rule, egress_ifindex),
        RuleType::RouteTrap => {
            match_prefix(&mut b, rule, loopback);
            simple_gact(&mut b, TC_ACT_TRAP);
        }
        RuleType::RouteGoto => {
            match_prefix(&mut b, rule, loopback);
            simple_gact(&mut b, TC_ACT_GOTO_CHAIN | rule.goto_chain as i32);
        }
        RuleType::TtlCheck => {
            b.attr_u8(TCA_FLOWER_KEY_IP_TTL, 0x01);
            b.attr_u8(TCA_FLOWER_KEY_IP_TTL_MASK, 0xff);
            simple_gact(&mut b, TC_ACT_TRAP);
        }
        other => unreachable!("unencodable rule type {other:?}"),
    }

    b.nest_end(flower);

    crate::wire::request(
        RTM_NEWTFILTER,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_EXCL | NLM_F_CREATE,
        b.into_bytes(),
    )
}

fn encode_del(chain_no: u32, prio: u16, egress_ifindex: i32) -> Vec<u8> {
    let info = u32::from(prio) << 16;
    let mut b = MsgBuilder::new();
    b.raw(&tcmsg_bytes(egress_ifindex, 0, PARENT_CLSACT_INGRESS, info));
    b.attr_u32(TCA_CHAIN, chain_no);
    crate::wire::request(RTM_DELTFILTER, NLM_F_REQUEST | NLM_F_ACK, b.into_bytes())
}

/// Encode the mutation for a positioned rule: install `Some(rule)`, or drop
/// whatever occupies the slot with `None`.
pub fn encode_rule(
    chain_no: u32,
    prio: u16,
    rule: Option<&TcRule>,
    egress_ifindex: i32,
    loopback: bool,
) -> Vec<u8> {
    match rule {
        Some(rule) => encode_add(chain_no, prio, rule, egress_ifindex, loopback),
        None => encode_del(chain_no, prio, egress_ifindex),
    }
}
