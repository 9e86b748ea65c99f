//! The periodic full-dump conversation, one request socket and one stage at
//! a time: qdiscs, chains, each chain's filters, then links, neighbours and
//! routes per family. Completion of the last stage lifts the rule pin.

use crate::addr::Family;
use crate::config::Config;
use crate::conn::{Burst, Conn, Error};
use crate::engine::Engine;
use crate::wire::{rtnl, tc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Wait,
    Qdiscs,
    Chains,
    EachChain,
    Links,
    Neigh4,
    Neigh6,
    Route4,
    Route6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    Continue,
    CycleDone,
}

pub struct Scan {
    conn: Conn,
    stage: Stage,
    egress_ifindex: i32,
    table_id: u32,
    chain_queue: Vec<u32>,
    next_chain: usize,
}

impl Scan {
    pub fn open(cfg: &Config) -> Result<Scan, Error> {
        Ok(Scan {
            conn: Conn::open("scan", &[])?,
            stage: Stage::Wait,
            egress_ifindex: cfg.ifindex,
            table_id: cfg.table_id,
            chain_queue: Vec::new(),
            next_chain: 0,
        })
    }

    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Wait
    }

    pub async fn recv_burst(&mut self) -> Result<Burst, Error> {
        self.conn.recv_burst().await
    }

    fn send_stage(&mut self, stage: Stage) -> Result<(), Error> {
        let msg = match stage {
            Stage::Qdiscs => tc::dump_qdiscs_request(self.egress_ifindex),
            Stage::Chains => tc::dump_chains_request(self.egress_ifindex),
            Stage::EachChain => {
                let chain_no = self.chain_queue[self.next_chain];
                tracing::debug!(chain_no, "dumping chain");
                tc::dump_chain_filters_request(self.egress_ifindex, chain_no)
            }
            Stage::Links => rtnl::dump_links_request(),
            Stage::Neigh4 => rtnl::dump_neigh_request(Family::V4),
            Stage::Neigh6 => rtnl::dump_neigh_request(Family::V6),
            Stage::Route4 => rtnl::dump_routes_request(Family::V4, self.table_id),
            Stage::Route6 => rtnl::dump_routes_request(Family::V6, self.table_id),
            Stage::Wait => unreachable!("wait stage sends nothing"),
        };
        tracing::debug!(stage = ?stage, "scan stage");
        self.conn.send_request(msg)?;
        self.stage = stage;
        Ok(())
    }

    /// Kick off a new cycle.
    pub fn start(&mut self) -> Result<(), Error> {
        assert!(self.is_idle());
        self.send_stage(Stage::Qdiscs)
    }

    /// The in-flight dump finished; move to the next stage, or complete the
    /// cycle by lifting the pin and logging the rule tables.
    pub fn on_stage_complete(&mut self, engine: &mut Engine) -> Result<ScanOutcome, Error> {
        match self.stage {
            Stage::Wait => Ok(ScanOutcome::Continue),
            Stage::Qdiscs => {
                self.send_stage(Stage::Chains)?;
                Ok(ScanOutcome::Continue)
            }
            Stage::Chains => {
                self.chain_queue = engine.chains().chain_nos();
                self.next_chain = 0;
                if self.chain_queue.is_empty() {
                    self.send_stage(Stage::Links)?;
                } else {
                    self.send_stage(Stage::EachChain)?;
                }
                Ok(ScanOutcome::Continue)
            }
            Stage::EachChain => {
                self.next_chain += 1;
                if self.next_chain < self.chain_queue.len() {
                    self.send_stage(Stage::EachChain)?;
                } else {
                    self.send_stage(Stage::Links)?;
                }
                Ok(ScanOutcome::Continue)
            }
            Stage::Links => {
                self.send_stage(Stage::Neigh4)?;
                Ok(ScanOutcome::Continue)
            }
            Stage::Neigh4 => {
                self.send_stage(Stage::Neigh6)?;
                Ok(ScanOutcome::Continue)
            }
            Stage::Neigh6 => {
                self.send_stage(Stage::Route4)?;
                Ok(ScanOutcome::Continue)
            }
            Stage::Route4 => {
                self.send_stage(Stage::Route6)?;
                Ok(ScanOutcome::Continue)
            }
            Stage::Route6 => {
                engine.remove_pin();
                engine.log_rules();
                self.stage = Stage::Wait;
                tracing::info!("scan cycle complete");
                Ok(ScanOutcome::CycleDone)
            }
        }
    }
}
