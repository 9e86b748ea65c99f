//! The subscription socket: link, neighbour, traffic-control and per-family
//! route groups, streaming incremental updates between scans.

use crate::conn::{Burst, Conn, Error};
use crate::wire::{RTNLGRP_IPV4_ROUTE, RTNLGRP_IPV6_ROUTE, RTNLGRP_LINK, RTNLGRP_NEIGH, RTNLGRP_TC};

pub struct Monitor {
    conn: Conn,
}

impl Monitor {
    pub fn open() -> Result<Monitor, Error> {
        let groups = [
            RTNLGRP_LINK,
            RTNLGRP_NEIGH,
            RTNLGRP_TC,
            RTNLGRP_IPV4_ROUTE,
            RTNLGRP_IPV6_ROUTE,
        ];
        Ok(Monitor {
            conn: Conn::open("monitor", &groups)?,
        })
    }

    pub async fn recv_burst(&mut self) -> Result<Burst, Error> {
        self.conn.recv_burst().await
    }
}
