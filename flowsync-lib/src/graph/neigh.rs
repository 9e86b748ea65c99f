//! Neighbour lifecycle. Neighbours live in their link's forwarding
//! database, keyed by address; a neighbour the kernel has not announced yet
//! can be created on demand for a route, with an all-zero hardware address
//! that keeps it ineligible for forwarding until resolution arrives.

use std::cell::RefCell;
use std::net::IpAddr;
use std::rc::Rc;

use crate::addr::AfAddr;
use crate::engine::Engine;
use crate::graph::{LinkHandle, Neigh, NeighHandle, ObjState, is_reapable, lladdr_set};
use crate::wire::{NeighEvent, Op};

impl Engine {
    fn neigh_alloc(&mut self, l: &LinkHandle, addr: AfAddr) -> NeighHandle {
        self.counts.neighs += 1;
        Rc::new(RefCell::new(Neigh {
            link: Some(Rc::downgrade(l)),
            addr,
            lladdr: [0; 6],
            state: ObjState::Present,
            refcnt: 0,
            targets: Vec::new(),
        }))
    }

    fn neigh_fdb_lookup(&self, l: &LinkHandle, addr: &AfAddr) -> Option<NeighHandle> {
        l.borrow().fdb.get(addr).cloned()
    }

    pub(crate) fn on_neigh(&mut self, ev: NeighEvent) {
        let Some(l) = self.link_lookup(ev.ifindex) else {
            return;
        };
        let existing = self.neigh_fdb_lookup(&l, &ev.addr);

        if ev.op == Op::Del {
            if let Some(n) = existing {
                self.neigh_delete(&n);
            }
            return;
        }

        let is_new = existing.is_none();
        let n = existing.unwrap_or_else(|| {
            let n = self.neigh_alloc(&l, ev.addr);
            l.borrow_mut().fdb.insert(ev.addr, n.clone());
            n
        });

        let changes = lladdr_set(&mut n.borrow_mut().lladdr, ev.lladdr);

        if is_new {
            n.borrow_mut().state = ObjState::Installed;
            let nb = n.borrow();
            tracing::info!(
                ifindex = ev.ifindex,
                addr = %nb.addr.addr,
                "neighbour up"
            );
        } else if changes {
            n.borrow_mut().state = ObjState::Installed;
            self.neigh_notify_targets(&n);
        }
    }

    /// Find or create the neighbour a route resolves through. The kernel
    /// may not have announced it yet; a degenerate entry is fine.
    pub(crate) fn neigh_get_or_create(
        &mut self,
        ifindex: i32,
        gateway: IpAddr,
    ) -> Option<NeighHandle> {
        let l = self.link_lookup(ifindex)?;
        let addr = AfAddr::host(gateway);

        if let Some(n) = self.neigh_fdb_lookup(&l, &addr) {
            return Some(n);
        }

        let n = self.neigh_alloc(&l, addr);
        l.borrow_mut().fdb.insert(addr, n.clone());
        tracing::debug!(ifindex, gateway = %gateway, "neighbour created on demand");
        Some(n)
    }

    fn neigh_notify_targets(&mut self, n: &NeighHandle) {
        let targets = n.borrow().targets.clone();
        for t in targets {
            self.target_neigh_update(&t);
        }
    }

    /// The owning link changed attributes.
    pub(crate) fn neigh_link_update(&mut self, n: &NeighHandle) {
        self.neigh_notify_targets(n);
    }

    fn neigh_delete(&mut self, n: &NeighHandle) {
        n.borrow_mut().state = ObjState::Present;
        self.neigh_consider_reaping(n);
    }

    fn neigh_consider_reaping(&mut self, n: &NeighHandle) {
        let reapable = {
            let nb = n.borrow();
            is_reapable(self.mode, nb.refcnt, nb.state)
        };
        if reapable {
            self.neigh_reap(n);
        }
    }

    /// Drop a neighbour: release its targets, then unhook from the link.
    fn neigh_reap(&mut self, n: &NeighHandle) {
        let targets = {
            let mut nb = n.borrow_mut();
            assert_eq!(nb.refcnt, 0);
            nb.state = ObjState::Zombie;
            std::mem::take(&mut nb.targets)
        };
        for t in targets {
            self.target_unref(&t);
        }

        self.neigh_unlink(n);
        self.counts.neighs -= 1;
    }

    fn neigh_unlink(&self, n: &NeighHandle) {
        let (link, addr) = {
            let mut nb = n.borrow_mut();
            (nb.link.take(), nb.addr)
        };
        if let Some(l) = link.and_then(|w| w.upgrade()) {
            l.borrow_mut().fdb.remove(&addr);
        }
    }

    /// The owning link is going away: unhook first, then let go.
    pub(crate) fn neigh_link_gone(&mut self, n: &NeighHandle) {
        assert!(n.borrow().link.is_some());
        self.neigh_unlink(n);
        self.neigh_delete(n);
    }
}
