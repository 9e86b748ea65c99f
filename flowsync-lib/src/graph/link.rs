//! Link lifecycle: creation and updates from netlink, and the delete
//! cascade that unhooks every neighbour in the forwarding database.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::Engine;
use crate::graph::{Link, LinkHandle, ObjState, is_reapable, lladdr_set};
use crate::wire::{LinkEvent, Op};

impl Engine {
    pub(crate) fn link_lookup(&self, ifindex: i32) -> Option<LinkHandle> {
        self.links.get(&ifindex).cloned()
    }

    pub(crate) fn on_link(&mut self, ev: LinkEvent) {
        let existing = self.link_lookup(ev.ifindex);

        if ev.op == Op::Del {
            if let Some(l) = existing {
                self.link_delete(&l);
            }
            return;
        }

        let is_new = existing.is_none();
        let l = existing.unwrap_or_else(|| {
            self.counts.links += 1;
            Rc::new(RefCell::new(Link {
                ifindex: ev.ifindex,
                lower_ifindex: 0,
                vlan_id: 0,
                mtu: 0,
                ifname: None,
                lladdr: [0; 6],
                state: ObjState::Present,
                refcnt: 0,
                fdb: Default::default(),
            }))
        });

        let changes = {
            let mut lb = l.borrow_mut();
            assert_eq!(lb.ifindex, ev.ifindex);
            let mut changes = 0;
            if lladdr_set(&mut lb.lladdr, ev.lladdr) {
                changes += 1;
            }
            if lb.ifname != ev.ifname {
                lb.ifname = ev.ifname;
                changes += 1;
            }
            if lb.lower_ifindex != ev.lower_ifindex {
                lb.lower_ifindex = ev.lower_ifindex;
                changes += 1;
            }
            if lb.mtu != ev.mtu {
                lb.mtu = ev.mtu;
                changes += 1;
            }
            if lb.vlan_id != ev.vlan_id {
                lb.vlan_id = ev.vlan_id;
                changes += 1;
            }
            changes
        };

        if is_new {
            l.borrow_mut().state = ObjState::Installed;
            self.links.insert(ev.ifindex, l.clone());
            let lb = l.borrow();
            tracing::info!(
                ifindex = lb.ifindex,
                ifname = lb.ifname.as_deref().unwrap_or(""),
                vlan_id = lb.vlan_id,
                mtu = lb.mtu,
                "link up"
            );
        } else if changes > 0 {
            l.borrow_mut().state = ObjState::Installed;
            self.link_notify_neighs(&l);
        } else {
            tracing::debug!(ifindex = ev.ifindex, "link update without changes");
        }
    }

    /// A link attribute changed; every neighbour re-evaluates its targets.
    fn link_notify_neighs(&mut self, l: &LinkHandle) {
        let neighs: Vec<_> = l.borrow().fdb.values().cloned().collect();
        for n in neighs {
            self.neigh_link_update(&n);
        }
    }

    fn link_delete(&mut self, l: &LinkHandle) {
        l.borrow_mut().state = ObjState::Present;
        self.link_consider_reaping(l);
    }

    pub(crate) fn link_consider_reaping(&mut self, l: &LinkHandle) {
        let reapable = {
            let lb = l.borrow();
            is_reapable(self.mode, lb.refcnt, lb.state)
        };
        if reapable {
            self.link_reap(l);
        }
    }

    fn link_reap(&mut self, l: &LinkHandle) {
        let (ifindex, neighs) = {
            let mut lb = l.borrow_mut();
            assert_eq!(lb.refcnt, 0);
            lb.state = ObjState::Zombie;
            (lb.ifindex, lb.fdb.values().cloned().collect::<Vec<_>>())
        };
        tracing::info!(ifindex, "link gone");

        for n in neighs {
            self.neigh_link_gone(&n);
        }

        self.links.remove(&ifindex);
        self.counts.links -= 1;
    }
}
