//! Route lifecycle: resolve the next-hop to a target, keep the goto rule in
//! step with the target's forward rule, and unwind cleanly on withdrawal.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::Engine;
use crate::graph::{ObjState, Route, RouteHandle, TargetHandle, ent_ref, ent_unref, is_reapable};
use crate::rules::{RuleHandle, RuleState, rule_ref};
use crate::tc_rule::{RuleType, TcRule};
use crate::wire::{Op, RouteEvent};

impl Engine {
    pub(crate) fn on_route(&mut self, ev: RouteEvent) {
        let Some(nh) = ev.nexthop else {
            return;
        };
        // resolving the next-hop may create a degenerate neighbour
        let Some(n) = self.neigh_get_or_create(nh.ifindex, nh.gateway) else {
            return; // unknown link
        };
        let t = self.target_get_unipath(&n);
        self.route_update(ev.op, &t, ev.dst);
    }

    fn route_update(&mut self, op: Op, t: &TargetHandle, dst: crate::addr::AfAddr) {
        let existing = self.routes.get(&dst).cloned();

        if op == Op::Del {
            if let Some(r) = existing {
                self.route_delete(&r);
            }
            return;
        }

        let is_new = existing.is_none();
        let r = existing.unwrap_or_else(|| {
            self.counts.routes += 1;
            Rc::new(RefCell::new(Route {
                dst,
                state: ObjState::Present,
                refcnt: 0,
                target: None,
                rule: None,
                target_rule: None,
            }))
        });

        let mut changes = 0;
        let current_target = r.borrow().target.clone().and_then(|w| w.upgrade());
        let retarget = match &current_target {
            Some(current) => !Rc::ptr_eq(current, t),
            None => true,
        };
        if retarget {
            if let Some(current) = current_target {
                self.target_unlink_route(&current, &r);
            }
            self.target_link_route(t, &r);
            changes += 1;
        }

        let target_rule_ok = t
            .borrow()
            .rule
            .as_ref()
            .is_some_and(|tr| tr.borrow().state == RuleState::Ok);
        if target_rule_ok && r.borrow().rule.is_none() {
            self.route_install(&r);
        }

        if is_new {
            r.borrow_mut().state = ObjState::Installed;
            self.routes.insert(dst, r.clone());
            tracing::info!(dst = %dst, "route up");
        } else if changes > 0 {
            r.borrow_mut().state = ObjState::Installed;
        }
    }

    fn route_delete(&mut self, r: &RouteHandle) {
        {
            let mut rb = r.borrow_mut();
            let state = rb.state;
            ent_ref(&mut rb.refcnt, state);
            rb.state = ObjState::Present;
        }

        let rule = r.borrow().rule.clone();
        if let Some(rule) = rule
            && rule.borrow().have.is_some()
        {
            self.rule_uninstall(&rule);
        }

        let target = r.borrow().target.clone().and_then(|w| w.upgrade());
        if let Some(t) = target {
            self.target_unlink_route(&t, r);
        }

        self.route_unref(r);
    }

    fn route_prepare_rule(&self, r: &RouteHandle, target_rule: &RuleHandle) -> TcRule {
        let trb = target_rule.borrow();
        assert_eq!(trb.state, RuleState::Ok);
        let mut tcr = TcRule::new(self.cfg.flower_flags);
        tcr.dst = r.borrow().dst;
        tcr.goto_chain = trb.chain_no;
        tcr.set_type_and_traits(RuleType::RouteGoto);
        tcr
    }

    /// (Re)request the goto rule for a route whose target rule is OK. A
    /// changed intent swaps rules while holding the old pair, so the
    /// teardown of the previous generation cannot outrun the request.
    pub(crate) fn route_install(&mut self, r: &RouteHandle) {
        let Some(t) = r.borrow().target.clone().and_then(|w| w.upgrade()) else {
            return;
        };
        let Some(target_rule) = t.borrow().rule.clone() else {
            return;
        };
        let new_tcr = self.route_prepare_rule(r, &target_rule);

        let current = r.borrow().rule.clone();
        match current {
            Some(current_rule) => {
                let unchanged = current_rule.borrow().want.as_ref() == Some(&new_tcr);
                if unchanged {
                    return;
                }
                let old_rule = rule_ref(&current_rule);
                let old_target_rule = r.borrow().target_rule.clone().map(|tr| rule_ref(&tr));

                let swap_target_rule = r
                    .borrow()
                    .target_rule
                    .as_ref()
                    .is_none_or(|tr| !Rc::ptr_eq(tr, &target_rule));
                if swap_target_rule {
                    if let Some(old) = r.borrow_mut().target_rule.take() {
                        self.rule_unref(&old);
                    }
                    r.borrow_mut().target_rule = Some(rule_ref(&target_rule));
                }

                if let Some(old) = r.borrow_mut().rule.take() {
                    self.rule_unref(&old);
                }
                let new_rule = self.rule_request(&new_tcr);
                r.borrow_mut().rule = new_rule;

                if let Some(old) = old_target_rule {
                    self.rule_unref(&old);
                }
                self.rule_unref(&old_rule);
            }
            None => {
                r.borrow_mut().target_rule = Some(rule_ref(&target_rule));
                let new_rule = self.rule_request(&new_tcr);
                r.borrow_mut().rule = new_rule;
            }
        }
    }

    pub(crate) fn route_unref(&mut self, r: &RouteHandle) {
        {
            let mut rb = r.borrow_mut();
            let state = rb.state;
            ent_unref(&mut rb.refcnt, state);
        }
        let reapable = {
            let rb = r.borrow();
            is_reapable(self.mode, rb.refcnt, rb.state)
        };
        if reapable {
            self.route_reap(r);
        }
    }

    fn route_reap(&mut self, r: &RouteHandle) {
        let dst = {
            let mut rb = r.borrow_mut();
            assert_eq!(rb.refcnt, 0);
            rb.state = ObjState::Zombie;
            rb.dst
        };

        let target = r.borrow().target.clone().and_then(|w| w.upgrade());
        if let Some(t) = target {
            self.target_unlink_route(&t, r);
        }

        let (rule, target_rule) = {
            let mut rb = r.borrow_mut();
            (rb.rule.take(), rb.target_rule.take())
        };
        if let Some(rule) = rule {
            self.rule_unref(&rule);
        }
        if let Some(rule) = target_rule {
            self.rule_unref(&rule);
        }

        self.routes.remove(&dst);
        self.counts.routes -= 1;
    }
}
