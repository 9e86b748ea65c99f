//! Targets: the abstract next-hop between routes and neighbours. A target
//! owns the forward rule that rewrites and redirects traffic for its
//! neighbour, and the list of routes resolving through it.

use std::cell::RefCell;
use std::rc::Rc;

use crate::addr::AfAddr;
use crate::engine::Engine;
use crate::graph::{
    NeighHandle, ObjState, RouteHandle, Target, TargetHandle, ent_ref, ent_unref, is_lladdr_zero,
    is_reapable,
};
use crate::rules::RuleState;
use crate::tc_rule::{RuleType, TcRule};

impl Engine {
    /// The unipath target for a neighbour: reuse the current one or create
    /// and splice a new one at the head of the neighbour's target list. The
    /// list entry is what keeps the target alive.
    pub(crate) fn target_get_unipath(&mut self, n: &NeighHandle) -> TargetHandle {
        if let Some(t) = n.borrow().targets.first() {
            return t.clone();
        }

        self.counts.targets += 1;
        let t = Rc::new(RefCell::new(Target {
            nexthop: Some(Rc::downgrade(n)),
            state: ObjState::Present,
            refcnt: 0,
            routes: Vec::new(),
            rule: None,
        }));
        {
            let mut tb = t.borrow_mut();
            let state = tb.state;
            ent_ref(&mut tb.refcnt, state);
        }
        n.borrow_mut().targets.insert(0, t.clone());
        t
    }

    /// A forward rule is only worth asking for once the link carries a VLAN
    /// id and both hardware addresses are known.
    fn target_prepare_rule(&self, t: &TargetHandle) -> Option<TcRule> {
        let n = t.borrow().nexthop.clone()?.upgrade()?;
        let l = n.borrow().link.clone()?.upgrade()?;

        let (vlan_id, link_lladdr) = {
            let lb = l.borrow();
            (lb.vlan_id, lb.lladdr)
        };
        if vlan_id == 0 {
            return None;
        }
        if is_lladdr_zero(&link_lladdr) {
            tracing::trace!("skipping, link lladdr is zero");
            return None;
        }
        let (neigh_lladdr, family) = {
            let nb = n.borrow();
            (nb.lladdr, nb.addr.family())
        };
        if is_lladdr_zero(&neigh_lladdr) {
            tracing::trace!("skipping, neighbour lladdr is zero");
            return None;
        }

        let mut tcr = TcRule::new(self.cfg.flower_flags);
        tcr.vlan_id = vlan_id;
        tcr.src_mac = link_lladdr;
        tcr.dst_mac = neigh_lladdr;
        tcr.dst = AfAddr::unspec(family);
        tcr.set_type_and_traits(RuleType::Forward);
        Some(tcr)
    }

    /// Swap the target's forward rule for a new intent (or none). The old
    /// rule is let go first; with no replacement the routes get a chance to
    /// notice the change.
    fn target_set_rule(&mut self, t: &TargetHandle, tcr: Option<TcRule>) {
        if let Some(old) = t.borrow_mut().rule.take() {
            self.rule_unset_target(&old);
            self.rule_unref(&old);
        }

        match tcr {
            Some(tcr) => {
                if let Some(r) = self.rule_prime_request(&tcr) {
                    self.rule_set_target(&r, t);
                    t.borrow_mut().rule = Some(r.clone());
                    self.rule_update_state(&r);
                }
            }
            None => self.target_notify_routes(t),
        }
    }

    fn target_install(&mut self, t: &TargetHandle) {
        if let Some(tcr) = self.target_prepare_rule(t) {
            self.target_set_rule(t, Some(tcr));
        }
    }

    /// The neighbour (or its link) changed: re-prepare the forward rule and
    /// request a replacement when the intent differs, or withdraw it when
    /// the target became ineligible.
    pub(crate) fn target_neigh_update(&mut self, t: &TargetHandle) {
        match self.target_prepare_rule(t) {
            Some(new_tcr) => {
                let needs_request = match &t.borrow().rule {
                    Some(r) => r.borrow().want.as_ref() != Some(&new_tcr),
                    None => true,
                };
                if needs_request {
                    self.target_set_rule(t, Some(new_tcr));
                }
            }
            None => self.target_set_rule(t, None),
        }
    }

    /// Once the forward rule is confirmed, every route through this target
    /// may install its goto rule.
    pub(crate) fn target_notify_routes(&mut self, t: &TargetHandle) {
        let ready = t
            .borrow()
            .rule
            .as_ref()
            .is_some_and(|r| r.borrow().state == RuleState::Ok);
        if !ready {
            return;
        }
        let routes = t.borrow().routes.clone();
        for r in routes {
            self.route_install(&r);
        }
    }

    /// Attach a route; the first route triggers the forward rule request.
    pub(crate) fn target_link_route(&mut self, t: &TargetHandle, r: &RouteHandle) {
        {
            let mut rb = r.borrow_mut();
            assert!(rb.target.is_none());
            rb.target = Some(Rc::downgrade(t));
            let state = rb.state;
            ent_ref(&mut rb.refcnt, state);
        }
        t.borrow_mut().routes.push(r.clone());

        if t.borrow().rule.is_none() {
            self.target_install(t);
        }
    }

    pub(crate) fn target_unlink_route(&mut self, t: &TargetHandle, r: &RouteHandle) {
        // hold both ends while unhooking
        {
            let mut tb = t.borrow_mut();
            let state = tb.state;
            ent_ref(&mut tb.refcnt, state);
        }
        {
            let mut rb = r.borrow_mut();
            let state = rb.state;
            ent_ref(&mut rb.refcnt, state);
            rb.target = None;
        }

        let found = {
            let mut tb = t.borrow_mut();
            let before = tb.routes.len();
            tb.routes.retain(|c| !Rc::ptr_eq(c, r));
            tb.routes.len() != before
        };
        if found {
            self.route_unref(r);
        }

        self.route_unref(r);
        self.target_unref(t);
    }

    pub(crate) fn target_unref(&mut self, t: &TargetHandle) {
        {
            let mut tb = t.borrow_mut();
            let state = tb.state;
            ent_unref(&mut tb.refcnt, state);
        }
        self.target_consider_reaping(t);
    }

    pub(crate) fn target_consider_reaping(&mut self, t: &TargetHandle) {
        let reapable = {
            let tb = t.borrow();
            is_reapable(self.mode, tb.refcnt, tb.state)
        };
        if reapable {
            self.target_reap(t);
        }
    }

    fn target_reap(&mut self, t: &TargetHandle) {
        let (routes, rule) = {
            let mut tb = t.borrow_mut();
            assert_eq!(tb.refcnt, 0);
            tb.state = ObjState::Zombie;
            tb.nexthop = None;
            (std::mem::take(&mut tb.routes), tb.rule.take())
        };

        for r in routes {
            self.route_unref(&r);
        }
        if let Some(r) = rule {
            self.rule_unref(&r);
        }

        self.counts.targets -= 1;
    }
}
