//! The process-wide configuration record: populated once before the event
//! loop starts, immutable afterwards.

use std::ffi::CString;
use std::time::Duration;

use crate::onload::PrefixLists;
use crate::wire::{DecodeFilter, TCA_CLS_FLAGS_IN_HW, TCA_CLS_FLAGS_SKIP_SW};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Config {
    /// The offload-capable egress interface the rules land on.
    pub ifindex: i32,
    pub ifname: String,
    /// Routing table to synchronize.
    pub table_id: u32,
    pub scan_interval: Duration,
    pub timeout: Option<Duration>,
    pub one_off: bool,
    pub dry_run: bool,
    pub flower_flags: u32,
    pub prefix_lists: PrefixLists,
}

impl Config {
    pub fn new(ifname: impl Into<String>, ifindex: i32, table_id: u32) -> Config {
        Config {
            ifindex,
            ifname: ifname.into(),
            table_id,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            timeout: None,
            one_off: false,
            dry_run: false,
            flower_flags: TCA_CLS_FLAGS_SKIP_SW | TCA_CLS_FLAGS_IN_HW,
            prefix_lists: PrefixLists::default(),
        }
    }

    pub fn decode_filter(&self) -> DecodeFilter {
        DecodeFilter {
            egress_ifindex: self.ifindex,
            table_id: self.table_id,
        }
    }
}

/// Resolve an interface name to its index, `None` if it does not exist.
pub fn resolve_ifindex(name: &str) -> Option<i32> {
    let cname = CString::new(name).ok()?;
    let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    (ifindex != 0).then_some(ifindex as i32)
}
