//! Rule placement.
//!
//! Chain 0 dispatches by address family into chain 1 (IPv4) and chain 2
//! (IPv6). Those two carry a TTL trap at priority 1, the static prefix
//! traps from priority 10, and the dynamic per-route gotos from priority
//! 100. Forward rules each get their own chain, the lowest free number
//! from 5 up.

use std::collections::BTreeMap;

use crate::addr::{AfAddr, Family};
use crate::engine::Engine;
use crate::tc_rule::{RuleType, TcRule};

const FORWARD_CHAIN_BASE: u32 = 5;
const GOTO_PRIO_BASE: u16 = 100;
const ONLOAD_PRIO_BASE: u16 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    /// Observed in the kernel.
    Present,
    /// Handed out by the scheduler this run.
    Reserved,
}

/// Chains known to exist or already promised, so placement never hands out
/// a number twice.
#[derive(Default)]
pub struct ChainSet {
    chains: BTreeMap<u32, ChainState>,
}

impl ChainSet {
    pub fn note_present(&mut self, chain_no: u32) {
        self.chains.insert(chain_no, ChainState::Present);
    }

    pub fn forget(&mut self, chain_no: u32) {
        self.chains.remove(&chain_no);
    }

    pub fn contains(&self, chain_no: u32) -> bool {
        self.chains.contains_key(&chain_no)
    }

    pub fn chain_nos(&self) -> Vec<u32> {
        self.chains.keys().copied().collect()
    }

    /// The lowest unused chain number >= `min_chain_no`; reserves it.
    pub fn find_available_chain_no(&mut self, min_chain_no: u32) -> u32 {
        let mut ret = min_chain_no;
        for &chain_no in self.chains.keys() {
            if chain_no < ret {
                continue;
            }
            if chain_no == ret {
                ret += 1;
            } else {
                break;
            }
        }
        self.chains.insert(ret, ChainState::Reserved);
        ret
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }
}

pub fn af_chain(family: Family) -> u32 {
    match family {
        Family::V4 => 1,
        Family::V6 => 2,
    }
}

impl Engine {
    /// Pick a (chain, priority) slot for a schedulable rule type.
    pub(crate) fn sched_place(&mut self, tcr: &TcRule) -> Option<(u32, u16)> {
        match tcr.rtype {
            RuleType::Forward => {
                let chain_no = self.chains.find_available_chain_no(FORWARD_CHAIN_BASE);
                tracing::debug!(chain_no, "placed forward rule");
                Some((chain_no, 1))
            }
            RuleType::RouteGoto => {
                let chain_no = af_chain(tcr.dst.family());
                let prio = self.rules.find_available_prio(chain_no, GOTO_PRIO_BASE);
                tracing::debug!(chain_no, prio, "placed goto rule");
                Some((chain_no, prio))
            }
            other => {
                tracing::debug!(rtype = ?other, "no placement for rule type");
                None
            }
        }
    }

    fn seed_af_goto(&mut self, chain_no: u32, prio: u16, family: Family, goto_chain: u32) {
        let mut tcr = TcRule::new(self.cfg.flower_flags);
        tcr.dst = match family {
            Family::V4 => AfAddr::unspec(Family::V4),
            // mlx5 hardware cannot match ::/0, so dispatch on the unicast space
            Family::V6 => AfAddr::new("2000::".parse().expect("fixed address"), 3),
        };
        tcr.goto_chain = goto_chain;
        tcr.set_type_and_traits(RuleType::RouteGoto);
        self.rule_static_want(chain_no, prio, tcr);
    }

    fn seed_ttl_check(&mut self, chain_no: u32, prio: u16, family: Family) {
        let mut tcr = TcRule::new(self.cfg.flower_flags);
        tcr.dst = AfAddr::unspec(family);
        tcr.set_type_and_traits(RuleType::TtlCheck);
        self.rule_static_want(chain_no, prio, tcr);
    }

    fn seed_onload_trap(&mut self, prefix: AfAddr) {
        let chain_no = af_chain(prefix.family());
        let prio = self.rules.find_available_prio(chain_no, ONLOAD_PRIO_BASE);
        let mut tcr = TcRule::new(self.cfg.flower_flags);
        tcr.dst = prefix;
        tcr.set_type_and_traits(RuleType::RouteTrap);
        self.rule_static_want(chain_no, prio, tcr);
    }

    /// The immutable rule skeleton: family dispatch, TTL traps, and a trap
    /// per configured prefix. Chain 0 stays minimal since skip_sw rules
    /// slow the software path.
    pub fn seed_static_rules(&mut self) {
        self.seed_af_goto(0, 1, Family::V4, af_chain(Family::V4));
        self.seed_af_goto(0, 2, Family::V6, af_chain(Family::V6));

        self.seed_ttl_check(af_chain(Family::V4), 1, Family::V4);
        self.seed_ttl_check(af_chain(Family::V6), 1, Family::V6);

        let prefixes: Vec<AfAddr> = self
            .cfg
            .prefix_lists
            .iter()
            .flat_map(|list| list.prefixes.iter().copied())
            .collect();
        for prefix in prefixes {
            self.seed_onload_trap(prefix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_allocation_skips_known_chains() {
        let mut chains = ChainSet::default();
        chains.note_present(0);
        chains.note_present(5);
        chains.note_present(6);

        assert_eq!(chains.find_available_chain_no(5), 7);
        // the grant is remembered
        assert_eq!(chains.find_available_chain_no(5), 8);
        assert_eq!(chains.find_available_chain_no(1), 1);
    }

    #[test]
    fn chain_allocation_from_empty() {
        let mut chains = ChainSet::default();
        assert_eq!(chains.find_available_chain_no(5), 5);
        assert!(chains.contains(5));
    }

    #[test]
    fn forgetting_a_chain_frees_its_number() {
        let mut chains = ChainSet::default();
        chains.note_present(5);
        chains.forget(5);
        assert_eq!(chains.find_available_chain_no(5), 5);
    }
}
