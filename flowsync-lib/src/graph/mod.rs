//! The reference-counted object graph: links own their forwarding database
//! of neighbours, neighbours grant lifetime to next-hop targets, targets own
//! the routes resolving through them, and routes pin the rules installed on
//! their behalf. Back-references are always weak; the explicit refcount
//! carries the reap protocol while `Rc`/`Weak` carry the memory edges.

mod link;
mod neigh;
mod route;
mod target;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::addr::AfAddr;
use crate::rules::RuleHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjState {
    /// Known locally, not (or no longer) confirmed in the kernel.
    Present,
    /// Confirmed present in the kernel.
    Installed,
    /// Mid-reap.
    Zombie,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatingMode {
    Normal,
    Teardown,
}

/// Live entity totals, for diagnostics and the lifecycle tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counts {
    pub links: usize,
    pub neighs: usize,
    pub targets: usize,
    pub routes: usize,
    pub rules: usize,
}

impl Counts {
    pub fn all_zero(&self) -> bool {
        *self == Counts::default()
    }
}

/// An entity may be reaped once nothing counts on it; in normal operation a
/// kernel-confirmed entity stays put regardless, teardown ignores that.
pub(crate) fn is_reapable(mode: OperatingMode, refcnt: u32, state: ObjState) -> bool {
    match mode {
        OperatingMode::Normal => refcnt == 0 && state == ObjState::Present,
        OperatingMode::Teardown => refcnt == 0 && state != ObjState::Zombie,
    }
}

pub(crate) fn ent_ref(refcnt: &mut u32, state: ObjState) {
    if state == ObjState::Zombie && *refcnt == 0 {
        return;
    }
    *refcnt += 1;
}

pub(crate) fn ent_unref(refcnt: &mut u32, state: ObjState) -> u32 {
    if state == ObjState::Zombie && *refcnt == 0 {
        return 0;
    }
    assert!(*refcnt > 0, "refcount underflow");
    *refcnt -= 1;
    *refcnt
}

pub(crate) fn is_lladdr_zero(lladdr: &[u8; 6]) -> bool {
    lladdr.iter().all(|&b| b == 0)
}

/// Overwrite `dst` from an optional update, reporting whether it changed.
/// An absent source clears the address.
pub(crate) fn lladdr_set(dst: &mut [u8; 6], src: Option<[u8; 6]>) -> bool {
    let src = src.unwrap_or([0; 6]);
    if *dst == src {
        return false;
    }
    *dst = src;
    true
}

pub struct Link {
    pub ifindex: i32,
    pub lower_ifindex: i32,
    pub vlan_id: u16,
    pub mtu: u32,
    pub ifname: Option<String>,
    pub lladdr: [u8; 6],
    pub state: ObjState,
    pub refcnt: u32,
    /// Forwarding database, keyed by neighbour address. Owning.
    pub fdb: BTreeMap<AfAddr, NeighHandle>,
}

pub type LinkHandle = Rc<RefCell<Link>>;

pub struct Neigh {
    /// Back-reference to the owning link; cleared when the link goes away.
    pub link: Option<Weak<RefCell<Link>>>,
    pub addr: AfAddr,
    pub lladdr: [u8; 6],
    pub state: ObjState,
    pub refcnt: u32,
    /// Targets resolving through this neighbour, newest first. Owning.
    pub targets: Vec<TargetHandle>,
}

pub type NeighHandle = Rc<RefCell<Neigh>>;

/// An abstract next-hop. Currently always unipath: one neighbour.
pub struct Target {
    pub nexthop: Option<Weak<RefCell<Neigh>>>,
    pub state: ObjState,
    pub refcnt: u32,
    /// Routes resolving through this target, in arrival order. Owning.
    pub routes: Vec<RouteHandle>,
    /// The forward rule installed for this target.
    pub rule: Option<RuleHandle>,
}

pub type TargetHandle = Rc<RefCell<Target>>;

pub struct Route {
    pub dst: AfAddr,
    pub state: ObjState,
    pub refcnt: u32,
    pub target: Option<Weak<RefCell<Target>>>,
    /// The goto rule for this route.
    pub rule: Option<RuleHandle>,
    /// The target's forward rule at install time, pinned so teardown order
    /// stays correct even if the target moves on.
    pub target_rule: Option<RuleHandle>,
}

pub type RouteHandle = Rc<RefCell<Route>>;
