//! The rule engine.
//!
//! Two indices cover every rule: a positional tree keyed by (chain,
//! priority) for everything we intend, and a lost-and-found tree keyed by
//! the observed descriptor for rules discovered in the kernel that nothing
//! has asked for yet. A want request that matches a lost-and-found resident
//! adopts it instead of installing a duplicate, which is what keeps rules
//! stable across process restarts.
//!
//! State transitions are gated by the pin, a monotonic level raised during
//! the first scan: 0 freezes everything, 1 allows classification, 2 allows
//! installs, 3 also allows uninstalls. Raising the pin level by level makes
//! sure matching have/want pairs settle into OK before anything is torn
//! down or duplicated.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::engine::Engine;
use crate::graph::{ObjState, Target, ent_ref, ent_unref, is_reapable};
use crate::queue::{RuleAction, WorkItem};
use crate::tc_rule::TcRule;
use crate::wire::{FilterEvent, Op};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleState {
    New,
    Alien,
    Want,
    Queued,
    Pending,
    Ok,
    Zombie,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleClass {
    /// Uninstalled when the last reference drops.
    Dynamic,
    /// Seeded by the scheduler; survives until an explicit clear.
    Static,
}

pub struct Rule {
    pub chain_no: u32,
    pub prio: u16,
    pub class: RuleClass,
    pub state: RuleState,
    pub life: ObjState,
    pub refcnt: u32,
    pub have: Option<TcRule>,
    pub want: Option<TcRule>,
    pub target: Option<Weak<RefCell<Target>>>,
    in_pos: bool,
    /// Key this rule occupies in the lost-and-found tree, if any. Kept
    /// verbatim so removal still works after `have` moves on.
    laf_key: Option<TcRule>,
}

pub type RuleHandle = Rc<RefCell<Rule>>;

pub(crate) fn rule_ref(r: &RuleHandle) -> RuleHandle {
    {
        let mut rb = r.borrow_mut();
        let life = rb.life;
        ent_ref(&mut rb.refcnt, life);
    }
    r.clone()
}

/// Both rule indices plus the pin level.
#[derive(Default)]
pub struct RuleSet {
    pos: BTreeMap<(u32, u16), RuleHandle>,
    laf: BTreeMap<TcRule, RuleHandle>,
    pin: u8,
}

impl RuleSet {
    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub(crate) fn set_pin(&mut self, level: u8) {
        self.pin = level;
    }

    pub fn pos_lookup(&self, chain_no: u32, prio: u16) -> Option<RuleHandle> {
        self.pos.get(&(chain_no, prio)).cloned()
    }

    fn laf_lookup(&self, tcr: &TcRule) -> Option<RuleHandle> {
        self.laf.get(tcr).cloned()
    }

    fn pos_insert(&mut self, r: &RuleHandle) -> bool {
        let key = {
            let rb = r.borrow();
            assert!(!rb.in_pos);
            (rb.chain_no, rb.prio)
        };
        if self.pos.contains_key(&key) {
            return false;
        }
        self.pos.insert(key, r.clone());
        r.borrow_mut().in_pos = true;
        true
    }

    fn laf_insert(&mut self, r: &RuleHandle) -> bool {
        let key = {
            let rb = r.borrow();
            assert!(rb.laf_key.is_none());
            rb.have.clone().expect("lost-and-found entry without have")
        };
        if self.laf.contains_key(&key) {
            return false;
        }
        self.laf.insert(key.clone(), r.clone());
        r.borrow_mut().laf_key = Some(key);
        true
    }

    fn laf_remove(&mut self, r: &RuleHandle) {
        if let Some(key) = r.borrow_mut().laf_key.take() {
            self.laf.remove(&key);
        }
    }

    fn pos_remove(&mut self, r: &RuleHandle) {
        let mut rb = r.borrow_mut();
        if rb.in_pos {
            self.pos.remove(&(rb.chain_no, rb.prio));
            rb.in_pos = false;
        }
    }

    /// The lowest priority >= `min_prio` not occupied in `chain_no`. Stable
    /// under concurrent insertions at lower priorities.
    pub fn find_available_prio(&self, chain_no: u32, min_prio: u16) -> u16 {
        let mut ret = min_prio;
        for (&(_, prio), _) in self.pos.range((chain_no, 0)..=(chain_no, u16::MAX)) {
            if prio < ret {
                continue;
            }
            if prio == ret {
                ret = ret.checked_add(1).expect("priority space exhausted");
            } else {
                break;
            }
        }
        ret
    }

    pub(crate) fn pos_handles(&self) -> Vec<RuleHandle> {
        self.pos.values().cloned().collect()
    }

    pub(crate) fn laf_handles(&self) -> Vec<RuleHandle> {
        self.laf.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }
}

impl Engine {
    fn rule_alloc(&mut self, chain_no: u32, prio: u16) -> RuleHandle {
        self.counts.rules += 1;
        Rc::new(RefCell::new(Rule {
            chain_no,
            prio,
            class: RuleClass::Dynamic,
            state: RuleState::New,
            life: ObjState::Present,
            refcnt: 0,
            have: None,
            want: None,
            target: None,
            in_pos: false,
            laf_key: None,
        }))
    }

    pub(crate) fn rule_set_target(&self, r: &RuleHandle, t: &Rc<RefCell<Target>>) {
        let mut rb = r.borrow_mut();
        assert!(rb.target.is_none());
        rb.target = Some(Rc::downgrade(t));
    }

    pub(crate) fn rule_unset_target(&self, r: &RuleHandle) {
        r.borrow_mut().target = None;
    }

    fn rule_is_reapable(&self, r: &RuleHandle) -> bool {
        let rb = r.borrow();
        is_reapable(self.mode, rb.refcnt, rb.life)
    }

    fn rule_reap(&mut self, r: &RuleHandle) {
        {
            let mut rb = r.borrow_mut();
            assert_eq!(rb.refcnt, 0);
            rb.life = ObjState::Zombie;
            rb.target = None;
            rb.want = None;
            rb.have = None;
        }
        self.rules.laf_remove(r);
        self.rules.pos_remove(r);
        self.counts.rules -= 1;
    }

    /// Drop one reference. A dynamic rule whose last holder lets go while it
    /// still has both descriptors gets uninstalled, so dropping the graph
    /// cascades deletions in teardown as well as in normal operation.
    pub(crate) fn rule_unref(&mut self, r: &RuleHandle) {
        let uninstall = {
            let mut rb = r.borrow_mut();
            let life = rb.life;
            let remaining = ent_unref(&mut rb.refcnt, life);
            remaining == 0
                && rb.want.is_some()
                && rb.have.is_some()
                && rb.class != RuleClass::Static
        };
        if uninstall {
            self.rule_uninstall(r);
        }
        if self.rule_is_reapable(r) {
            self.rule_reap(r);
        }
    }

    /// Drop the intent; the state machine takes it from there.
    pub(crate) fn rule_uninstall(&mut self, r: &RuleHandle) {
        r.borrow_mut().want = None;
        self.rule_update_state(r);
    }

    fn rule_queue_install(&mut self, r: &RuleHandle) {
        if self.rules.pin() < 2 {
            return;
        }
        let (chain_no, prio) = {
            let mut rb = r.borrow_mut();
            assert_eq!(rb.state, RuleState::Want);
            rb.state = RuleState::Queued;
            (rb.chain_no, rb.prio)
        };
        tracing::info!(chain_no, prio, "queueing rule install");
        self.queue_schedule(WorkItem {
            rule: rule_ref(r),
            action: RuleAction::Install,
        });
    }

    fn rule_queue_uninstall(&mut self, r: &RuleHandle) {
        if self.rules.pin() < 3 {
            return;
        }
        let (chain_no, prio) = {
            let mut rb = r.borrow_mut();
            assert_eq!(rb.state, RuleState::Alien);
            rb.state = RuleState::Queued;
            (rb.chain_no, rb.prio)
        };
        tracing::info!(chain_no, prio, "queueing rule uninstall");
        self.queue_schedule(WorkItem {
            rule: rule_ref(r),
            action: RuleAction::Uninstall,
        });
    }

    /// Recompute the state from (have, want) and fire whatever the pin
    /// allows. Queued rules are left alone until their completion.
    pub(crate) fn rule_update_state(&mut self, r: &RuleHandle) {
        if self.rules.pin() == 0 {
            return;
        }
        if r.borrow().state == RuleState::Queued {
            return;
        }

        enum Next {
            Zombie,
            Alien,
            Want,
            Ok,
        }

        let next = {
            let rb = r.borrow();
            match (&rb.have, &rb.want) {
                (None, None) => Next::Zombie,
                (Some(_), None) => Next::Alien,
                (None, Some(_)) => Next::Want,
                (Some(have), Some(want)) if have == want => Next::Ok,
                (Some(_), Some(_)) => Next::Alien,
            }
        };

        match next {
            Next::Zombie => {
                let mut rb = r.borrow_mut();
                if rb.state != RuleState::New {
                    rb.state = RuleState::Zombie;
                }
            }
            Next::Alien => {
                r.borrow_mut().state = RuleState::Alien;
                self.rule_queue_uninstall(r);
            }
            Next::Want => {
                r.borrow_mut().state = RuleState::Want;
                self.rule_queue_install(r);
            }
            Next::Ok => {
                r.borrow_mut().state = RuleState::Ok;
                let target = r.borrow().target.clone().and_then(|t| t.upgrade());
                if let Some(t) = target {
                    self.target_notify_routes(&t);
                }
            }
        }
    }

    /// A filter observed in the kernel (scan or monitor). Positioned rules
    /// match directly; otherwise a lost-and-found resident with the same
    /// position and image is the same rule.
    pub(crate) fn on_filter(&mut self, ev: FilterEvent) {
        let mut r = self.rules.pos_lookup(ev.chain_no, ev.prio);
        if r.is_none()
            && let Some(tcr) = &ev.rule
        {
            r = self
                .rules
                .laf_lookup(tcr)
                .filter(|c| {
                    let cb = c.borrow();
                    cb.chain_no == ev.chain_no && cb.prio == ev.prio
                });
        }

        if ev.op == Op::Del {
            if let Some(r) = r {
                self.rule_delete(&r);
            }
            return;
        }

        let tcr = ev.rule.expect("new filter event without rule");
        let is_new = r.is_none();
        let r = r.unwrap_or_else(|| self.rule_alloc(ev.chain_no, ev.prio));

        let mut changes = 0;
        {
            let mut rb = r.borrow_mut();
            assert_eq!((rb.chain_no, rb.prio), (ev.chain_no, ev.prio));
            if rb.have.as_ref() != Some(&tcr) {
                if rb.have.is_none() {
                    rb.life = ObjState::Installed;
                }
                rb.have = Some(tcr);
                changes += 1;
            }
        }

        if is_new {
            self.rules.pos_insert(&r);
            self.rules.laf_insert(&r);
            self.rule_update_state(&r);
        } else if changes > 0 {
            self.rule_update_state(&r);
        }
    }

    /// The kernel deleted the filter occupying this rule's slot.
    fn rule_delete(&mut self, r: &RuleHandle) {
        rule_ref(r);
        let recheck = {
            let mut rb = r.borrow_mut();
            rb.life = ObjState::Present;
            rb.have = None;
            rb.want.is_some()
        };
        if recheck {
            // a surviving want re-requests itself
            self.rule_update_state(r);
        } else {
            let mut rb = r.borrow_mut();
            if rb.state != RuleState::New {
                rb.state = RuleState::Zombie;
            }
        }
        self.rule_unref(r);
    }

    /// Seed an immovable rule at a fixed slot.
    pub(crate) fn rule_static_want(&mut self, chain_no: u32, prio: u16, tcr: TcRule) {
        assert!(self.rules.pos_lookup(chain_no, prio).is_none());
        let r = self.rule_alloc(chain_no, prio);
        {
            let mut rb = r.borrow_mut();
            rb.class = RuleClass::Static;
            rb.want = Some(tcr);
        }
        self.rules.pos_insert(&r);
        self.rule_update_state(&r);
    }

    /// Produce a positioned rule for `want`: adopt a matching lost-and-found
    /// resident, or have the scheduler place a fresh one. The caller owns
    /// the returned reference.
    pub(crate) fn rule_prime_request(&mut self, tcr: &TcRule) -> Option<RuleHandle> {
        if let Some(r) = self.rules.laf_lookup(tcr) {
            {
                let mut rb = r.borrow_mut();
                assert!(rb.have.is_some());
                assert!(rb.want.is_none());
                rb.want = Some(tcr.clone());
            }
            self.rules.laf_remove(&r);
            tracing::debug!(
                chain_no = r.borrow().chain_no,
                prio = r.borrow().prio,
                "adopted rule from lost-and-found"
            );
            return Some(rule_ref(&r));
        }

        let (chain_no, prio) = self.sched_place(tcr)?;
        let r = self.rule_alloc(chain_no, prio);
        {
            let mut rb = r.borrow_mut();
            rb.want = Some(tcr.clone());
        }
        self.rules.pos_insert(&r);
        Some(rule_ref(&r))
    }

    pub(crate) fn rule_request(&mut self, tcr: &TcRule) -> Option<RuleHandle> {
        let r = self.rule_prime_request(tcr)?;
        self.rule_update_state(&r);
        Some(r)
    }

    /// Raise the pin one level at a time up to `level`, recomputing every
    /// positioned rule at each step so matching pairs settle into OK before
    /// installs (level 2) or uninstalls (level 3) may fire.
    pub fn advance_pin_to(&mut self, level: u8) {
        let level = level.min(3);
        if self.rules.pin() >= level {
            return;
        }
        for l in self.rules.pin() + 1..=level {
            tracing::debug!(level = l, "raising rule pin");
            self.rules.set_pin(l);
            for r in self.rules.pos_handles() {
                self.rule_update_state(&r);
            }
        }
    }

    pub fn remove_pin(&mut self) {
        self.advance_pin_to(3);
    }

    /// Let go of every rule, lost-and-found residents included. Dynamic
    /// rules with both descriptors get uninstalled on the way out.
    pub(crate) fn rules_clear_all(&mut self) {
        for r in self.rules.laf_handles() {
            rule_ref(&r);
            r.borrow_mut().life = ObjState::Present;
            self.rule_unref(&r);
        }
        for r in self.rules.pos_handles() {
            rule_ref(&r);
            r.borrow_mut().life = ObjState::Present;
            self.rule_unref(&r);
        }
    }

    /// Completion of an install/uninstall request. Success waits for the
    /// kernel's own filter event to update `have`; failure puts the rule
    /// back where the request found it, to be retried on the next trigger.
    pub(crate) fn on_rule_action_done(&mut self, r: &RuleHandle, errno: i32) {
        if errno != 0 {
            let mut rb = r.borrow_mut();
            tracing::warn!(
                chain_no = rb.chain_no,
                prio = rb.prio,
                errno,
                "rule mutation failed"
            );
            rb.state = match (&rb.have, &rb.want) {
                (_, Some(_)) => RuleState::Want,
                (Some(_), None) => RuleState::Alien,
                (None, None) => RuleState::Zombie,
            };
        }
        self.rule_unref(r);
    }

    /// Dump both trees at debug level; the post-scan diagnostic.
    pub fn log_rules(&self) {
        for r in self.rules.pos.values() {
            let rb = r.borrow();
            tracing::debug!(
                chain_no = rb.chain_no,
                prio = rb.prio,
                state = ?rb.state,
                have = rb.have.as_ref().map(|t| t.rtype.name()),
                want = rb.want.as_ref().map(|t| t.rtype.name()),
                refcnt = rb.refcnt,
                "rule"
            );
        }
        for r in self.rules.laf.values() {
            let rb = r.borrow();
            tracing::debug!(
                chain_no = rb.chain_no,
                prio = rb.prio,
                have = rb.have.as_ref().map(|t| t.rtype.name()),
                "lost-and-found rule"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(chain_no: u32, prio: u16) -> RuleHandle {
        Rc::new(RefCell::new(Rule {
            chain_no,
            prio,
            class: RuleClass::Dynamic,
            state: RuleState::New,
            life: ObjState::Present,
            refcnt: 0,
            have: None,
            want: None,
            target: None,
            in_pos: false,
            laf_key: None,
        }))
    }

    fn occupied(slots: &[(u32, u16)]) -> RuleSet {
        let mut set = RuleSet::default();
        for &(chain_no, prio) in slots {
            assert!(set.pos_insert(&dummy(chain_no, prio)));
        }
        set
    }

    #[test]
    fn find_available_prio_skips_occupied_slots() {
        let set = occupied(&[(1, 1), (1, 100), (1, 101), (2, 100)]);
        assert_eq!(set.find_available_prio(1, 100), 102);
        assert_eq!(set.find_available_prio(1, 10), 10);
        assert_eq!(set.find_available_prio(2, 100), 101);
        assert_eq!(set.find_available_prio(3, 100), 100);
    }

    #[test]
    fn find_available_prio_ignores_other_chains() {
        let set = occupied(&[(1, 100), (3, 100), (3, 101)]);
        assert_eq!(set.find_available_prio(2, 100), 100);
        assert_eq!(set.find_available_prio(3, 100), 102);
    }

    #[test]
    fn successive_requests_are_adjacent() {
        let mut set = occupied(&[]);
        let a = set.find_available_prio(1, 100);
        set.pos_insert(&dummy(1, a));
        let b = set.find_available_prio(1, 100);
        assert_eq!((a, b), (100, 101));
    }

    #[test]
    fn duplicate_positions_are_rejected() {
        let mut set = occupied(&[(5, 1)]);
        assert!(!set.pos_insert(&dummy(5, 1)));
        assert_eq!(set.len(), 1);
    }
}
