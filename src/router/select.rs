//! Backend selection
//!
//! Picks the servers a session connects to and, per statement, the
//! connection a statement is sent to.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::backend::{BackendId, BackendRef, BackendServer};
use crate::config::{MasterFailureMode, SelectionCriteria};

use super::session::RouterSession;
use super::RouteTarget;

fn criteria_metric(criteria: SelectionCriteria, backend: &BackendServer) -> u64 {
    let server = backend.server();
    match criteria {
        SelectionCriteria::LeastGlobalConnections => server.current_connections() as u64,
        SelectionCriteria::LeastRouterConnections => backend.router_connections() as u64,
        SelectionCriteria::LeastBehindMaster => server.replication_lag().unwrap_or(u32::MAX) as u64,
        SelectionCriteria::LeastCurrentOperations => server.current_operations() as u64,
    }
}

/// Order two servers by weighted load; `Less` means `a` is the better choice
///
/// A server with zero weight loses to any weighted one.
pub fn compare_servers(criteria: SelectionCriteria, a: &BackendServer, b: &BackendServer) -> Ordering {
    let (ma, mb) = (criteria_metric(criteria, a), criteria_metric(criteria, b));
    let (wa, wb) = (a.server().weight() as u64, b.server().weight() as u64);

    match (wa, wb) {
        (0, 0) => ma.cmp(&mb),
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        _ => ((1000 + 1000 * ma) / wa).cmp(&((1000 + 1000 * mb) / wb)),
    }
}

/// Replication lag is within `max_rlag`, or there is no limit
fn lag_ok(bref: &BackendRef, max_rlag: Option<u32>) -> bool {
    match max_rlag {
        None => true,
        Some(max) => matches!(bref.server().replication_lag(), Some(lag) if lag <= max),
    }
}

impl RouterSession {
    /// Running master with the lowest replication depth, as an index into the instance servers
    pub(super) fn root_master_slot(&self) -> Option<usize> {
        let mut best: Option<(usize, i32)> = None;
        for (slot, backend) in self.instance.backends().iter().enumerate() {
            let server = backend.server();
            if !server.is_master() {
                continue;
            }
            if best.map(|(_, depth)| server.depth() < depth).unwrap_or(true) {
                best = Some((slot, server.depth()));
            }
        }
        best.map(|(slot, _)| slot)
    }

    /// Connected reference to the master with the lowest depth
    pub(super) fn root_master_ref(&self) -> Option<BackendId> {
        let mut best: Option<(BackendId, i32)> = None;
        for bref in self.backends.iter().filter(|b| b.is_in_use()) {
            let server = bref.server();
            if !server.is_master() {
                continue;
            }
            if best.map(|(_, depth)| server.depth() < depth).unwrap_or(true) {
                best = Some((bref.id(), server.depth()));
            }
        }
        best.map(|(id, _)| id)
    }

    fn slot_in_use(&self, slot: usize) -> bool {
        self.slots[slot].map(|id| self.backends[id].is_in_use()).unwrap_or(false)
    }

    fn slot_failed(&self, slot: usize) -> bool {
        self.slots[slot].map(|id| self.backends[id].has_fatal_failure()).unwrap_or(false)
    }

    fn slave_eligible(&self, slot: usize, backend: &BackendServer) -> bool {
        let server = backend.server();
        if self.slot_in_use(slot) || self.slot_failed(slot) {
            return false;
        }
        if !server.is_usable() || !(server.is_slave() || server.is_relay()) {
            return false;
        }
        match self.max_rlag {
            None => true,
            Some(max) => matches!(server.replication_lag(), Some(lag) if lag <= max),
        }
    }

    /// Open a connection to the server in `slot` and bring it up to date
    fn connect_slot(&mut self, slot: usize, backend: Arc<BackendServer>) -> Option<BackendId> {
        let id = self.backends.len();
        let conn = match self.connector.connect(id, backend.server()) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("Unable to establish connection with server '{}': {}", backend.server().name(), e);
                return None;
            }
        };

        let mut bref = BackendRef::new(id, backend, conn, self.history.next_position());
        if !self.history.replay_onto(&mut bref) {
            tracing::error!("Failed to execute session command history on '{}'", bref.name());
            bref.close(true);
            self.backends.push(bref);
            self.slots[slot] = Some(id);
            return None;
        }

        tracing::info!("Selected {} in '{}'", bref.server().role(), bref.name());
        self.backends.push(bref);
        self.slots[slot] = Some(id);
        Some(id)
    }

    /// Connect to the root master (when `connect_master`) and to slaves until the session holds `max_slaves`
    ///
    /// Used both when the session starts and to replace failed slaves. On
    /// failure every connection opened by this call is closed again.
    pub(super) fn select_connect_backend_servers(&mut self, connect_master: bool) -> bool {
        let config = self.instance.config();
        let criteria = config.slave_selection_criteria;
        let fail_instantly = config.master_failure_mode == MasterFailureMode::FailInstantly;
        let servers: Vec<Arc<BackendServer>> = self.instance.backends().to_vec();
        let master_slot = self.root_master_slot();

        if connect_master && master_slot.is_none() && fail_instantly {
            tracing::error!("Couldn't find suitable Master from {} candidates.", servers.len());
            return false;
        }

        let mut order: Vec<usize> = (0..servers.len()).collect();
        order.sort_by(|a, b| compare_servers(criteria, &servers[*a], &servers[*b]));

        let mut slaves_connected = self
            .backends
            .iter()
            .filter(|b| b.is_in_use() && Some(b.id()) != self.master)
            .count();
        let mut master_connected = self.master_in_use();
        let mut opened = Vec::new();

        for slot in order {
            let backend = servers[slot].clone();

            if Some(slot) == master_slot {
                if connect_master && !master_connected && !self.slot_in_use(slot) {
                    if let Some(id) = self.connect_slot(slot, backend) {
                        self.master = Some(id);
                        master_connected = true;
                        opened.push(id);
                    }
                }
                continue;
            }

            if slaves_connected >= self.max_slaves || !self.slave_eligible(slot, &backend) {
                continue;
            }
            if let Some(id) = self.connect_slot(slot, backend) {
                slaves_connected += 1;
                opened.push(id);
            }
        }

        let mut succeeded = slaves_connected > 0 || master_connected;
        if connect_master && fail_instantly && !master_connected {
            succeeded = false;
        }

        if !succeeded {
            for id in opened {
                self.backends[id].close(false);
            }
            if self.master.map(|m| !self.backends[m].is_in_use()).unwrap_or(false) && connect_master {
                self.master = None;
            }
            tracing::error!("Couldn't establish required amount of slave connections for router session.");
        } else if slaves_connected < self.max_slaves {
            tracing::info!(
                "Couldn't connect to the maximum number of slaves: {} of {} connected",
                slaves_connected,
                self.max_slaves
            );
        }

        succeeded
    }

    /// Find the connection a statement of type `btype` goes to
    ///
    /// `name` selects a server by name among the connected ones; when it
    /// matches nothing the statement falls back to a slave.
    pub(super) fn get_backend(&self, btype: RouteTarget, name: Option<&str>, max_rlag: Option<u32>) -> Option<BackendId> {
        if let Some(forced) = self.forced_node {
            if self.trx_active && self.trx_read_only && self.backends[forced].is_in_use() {
                return Some(forced);
            }
        }

        let master = self.root_master_ref();
        let mut btype = btype;

        if let Some(name) = name {
            let found = self.backends.iter().filter(|b| b.is_in_use()).find(|b| {
                let server = b.server();
                b.name().eq_ignore_ascii_case(name) && (server.is_slave() || server.is_relay() || server.is_master())
            });
            match found {
                Some(bref) => return Some(bref.id()),
                None => btype = RouteTarget::SLAVE,
            }
        }

        if btype.contains(RouteTarget::SLAVE) {
            return self.best_slave(master, max_rlag);
        }

        if btype.contains(RouteTarget::MASTER) {
            return master.filter(|id| {
                let bref = &self.backends[*id];
                bref.is_in_use() && bref.server().is_master()
            });
        }

        None
    }

    fn best_slave(&self, master: Option<BackendId>, max_rlag: Option<u32>) -> Option<BackendId> {
        let config = self.instance.config();
        let mut candidate: Option<&BackendRef> = None;

        for bref in self.backends.iter().filter(|b| b.is_in_use()) {
            let server = bref.server();
            if !server.is_master() && !server.is_slave() {
                continue;
            }

            let Some(current) = candidate else {
                if (server.is_master() && Some(bref.id()) == master) || lag_ok(bref, max_rlag) {
                    candidate = Some(bref);
                }
                continue;
            };

            if current.server().is_master()
                && server.is_slave()
                && lag_ok(bref, max_rlag)
                && !config.master_accept_reads
            {
                candidate = Some(bref);
            } else if (server.is_slave() || (server.is_master() && config.master_accept_reads)) && lag_ok(bref, max_rlag) {
                if compare_servers(config.slave_selection_criteria, current.backend(), bref.backend()) == Ordering::Greater {
                    candidate = Some(bref);
                }
            } else if !lag_ok(bref, max_rlag) {
                tracing::info!(
                    "Server '{}' is too much behind the master, {:?} s. and can't be chosen.",
                    bref.name(),
                    server.replication_lag()
                );
            }
        }

        candidate.map(|b| b.id())
    }
}
