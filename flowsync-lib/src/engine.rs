//! The convergence engine: owns the object graph, the rule indices, the
//! chain registry and the request queue, consumes decoded netlink events,
//! and emits the mutations that steer the hardware pipeline toward the
//! intended rule set.

use std::collections::{BTreeMap, VecDeque};

use crate::addr::AfAddr;
use crate::config::Config;
use crate::graph::{Counts, LinkHandle, OperatingMode, RouteHandle};
use crate::queue::{RequestQueue, WorkItem};
use crate::rules::{RuleSet, RuleState};
use crate::sched::ChainSet;
use crate::wire::{self, RawMessage, RtnlEvent};

/// Where executed mutations go. In production they are staged for the
/// action socket; the loopback feed reflects them straight back through the
/// decoder, standing in for kernel echo in tests and logging every message.
pub enum ActionFeed {
    Stage,
    Loopback,
}

/// A mutation the engine emitted, kept by the loopback feed.
pub struct SentMsg {
    pub message_type: u16,
    pub bytes: Vec<u8>,
}

pub struct Engine {
    pub(crate) cfg: Config,
    pub(crate) links: BTreeMap<i32, LinkHandle>,
    pub(crate) routes: BTreeMap<AfAddr, RouteHandle>,
    pub(crate) rules: RuleSet,
    pub(crate) chains: ChainSet,
    pub(crate) queue: RequestQueue,
    pub(crate) mode: OperatingMode,
    pub(crate) counts: Counts,
    feed: ActionFeed,
    outbox: VecDeque<Vec<u8>>,
    sent_log: Vec<SentMsg>,
}

impl Engine {
    pub fn new(cfg: Config) -> Engine {
        Engine::with_feed(cfg, ActionFeed::Stage)
    }

    /// An engine whose mutations are reflected back as kernel events.
    pub fn new_loopback(cfg: Config) -> Engine {
        Engine::with_feed(cfg, ActionFeed::Loopback)
    }

    fn with_feed(cfg: Config, feed: ActionFeed) -> Engine {
        Engine {
            cfg,
            links: BTreeMap::new(),
            routes: BTreeMap::new(),
            rules: RuleSet::default(),
            chains: ChainSet::default(),
            queue: RequestQueue::default(),
            mode: OperatingMode::Normal,
            counts: Counts::default(),
            feed,
            outbox: VecDeque::new(),
            sent_log: Vec::new(),
        }
    }

    pub fn counts(&self) -> Counts {
        self.counts
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: OperatingMode) {
        self.mode = mode;
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn chains(&self) -> &ChainSet {
        &self.chains
    }

    pub fn sent_log(&self) -> &[SentMsg] {
        &self.sent_log
    }

    /// Decode one frame and run it through the graph.
    pub fn handle_raw(&mut self, msg: &RawMessage) {
        match wire::decode(msg, &self.cfg.decode_filter()) {
            Ok(Some(event)) => self.handle_event(event),
            Ok(None) => {}
            Err(error) => {
                tracing::debug!(
                    message_type = msg.message_type,
                    %error,
                    "dropping undecodable message"
                );
            }
        }
    }

    pub fn handle_event(&mut self, event: RtnlEvent) {
        match event {
            RtnlEvent::Link(ev) => self.on_link(ev),
            RtnlEvent::Neigh(ev) => self.on_neigh(ev),
            RtnlEvent::Route(ev) => self.on_route(ev),
            RtnlEvent::Filter(ev) => self.on_filter(ev),
            RtnlEvent::Chain(ev) => match ev.op {
                wire::Op::New => self.chains.note_present(ev.chain_no),
                wire::Op::Del => self.chains.forget(ev.chain_no),
            },
            RtnlEvent::Qdisc(ev) => {
                tracing::debug!(kind = %ev.kind, "qdisc on egress interface");
            }
        }
    }

    // -- request queue pump --------------------------------------------------

    pub(crate) fn queue_schedule(&mut self, item: WorkItem) {
        self.queue.push(item);
        if !self.queue.is_busy() {
            self.queue_run();
        }
    }

    fn queue_run(&mut self) {
        loop {
            let Some(item) = self.queue.begin() else {
                break;
            };
            self.queue_execute(&item);
            if self.queue.sent() {
                break;
            }
            // nothing went on the wire, finish synchronously
            let item = self.queue.finish();
            self.on_rule_action_done(&item.rule, 0);
        }
    }

    fn queue_execute(&mut self, item: &WorkItem) {
        let (chain_no, prio, want) = {
            let mut rb = item.rule.borrow_mut();
            assert_eq!(rb.state, RuleState::Queued);
            rb.state = RuleState::Pending;
            (rb.chain_no, rb.prio, rb.want.clone())
        };

        let loopback = matches!(self.feed, ActionFeed::Loopback);
        let bytes =
            wire::flower::encode_rule(chain_no, prio, want.as_ref(), self.cfg.ifindex, loopback);

        if self.cfg.dry_run {
            tracing::info!(chain_no, prio, action = ?item.action, "dry run, not sending");
            return;
        }

        if !loopback {
            self.outbox.push_back(bytes);
            self.queue.mark_sent();
            return;
        }

        // reflect the mutation back as if the monitor had just seen it
        match wire::split_frames(&bytes) {
            Ok(frames) if frames.len() == 1 => {
                self.sent_log.push(SentMsg {
                    message_type: frames[0].message_type,
                    bytes,
                });
                self.handle_raw(&frames[0]);
            }
            _ => panic!("loopback produced an unsplittable message"),
        }
    }

    /// The action socket answered the in-flight request.
    pub fn on_action_complete(&mut self, errno: i32) {
        if !self.queue.is_busy() {
            tracing::warn!(errno, "completion without an in-flight request");
            return;
        }
        let item = self.queue.finish();
        self.on_rule_action_done(&item.rule, errno);
        self.queue_run();
    }

    pub fn queue_busy(&self) -> bool {
        self.queue.is_busy()
    }

    pub fn queue_idle(&self) -> bool {
        !self.queue.is_busy() && self.queue.is_empty()
    }

    /// The next staged mutation to put on the action socket.
    pub fn next_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    /// Release every rule; with the mode set to teardown beforehand this
    /// cascades deletions for everything dynamic.
    pub fn clear_rules(&mut self) {
        self.rules_clear_all();
    }
}
