//! Router session state

use serde::Serialize;
use std::sync::Arc;

use crate::backend::{BackendId, BackendRef, Connector};
use crate::config::MasterFailureMode;
use crate::error::{Error, Result};

use super::instance::RouterInstance;
use super::sescmd::SescmdHistory;
use super::temp_tables::TempTables;

/// Per-client routing state
///
/// Backend references live in an arena; `slots` maps each configured server
/// (in instance order) to the reference currently used for it.
pub struct RouterSession {
    pub(super) instance: Arc<RouterInstance>,
    pub(super) connector: Box<dyn Connector>,
    pub(super) backends: Vec<BackendRef>,
    pub(super) slots: Vec<Option<BackendId>>,
    /// Reference to the master; kept after the connection is lost
    pub(super) master: Option<BackendId>,
    pub(super) created_with_master: bool,
    /// Every statement goes here while set
    pub(super) forced_node: Option<BackendId>,
    /// `forced_node` was set by a read-only transaction
    pub(super) forced_by_trx: bool,
    pub(super) autocommit: bool,
    pub(super) trx_active: bool,
    pub(super) trx_read_only: bool,
    /// The current statement ends the transaction
    pub(super) trx_ending: bool,
    pub(super) load_active: bool,
    pub(super) load_bytes: u64,
    pub(super) temp_tables: TempTables,
    pub(super) history: SescmdHistory,
    pub(super) client_capabilities: u32,
    pub(super) current_db: Option<String>,
    pub(super) max_slaves: usize,
    pub(super) max_rlag: Option<u32>,
    pub(super) closed: bool,
}

/// Serializable view of a session, for logging and tests
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub master: Option<String>,
    pub backends: Vec<String>,
    pub autocommit: bool,
    pub trx_active: bool,
    pub trx_read_only: bool,
    pub forced_node: Option<String>,
    pub load_active: bool,
    pub temp_tables: usize,
    pub history_len: usize,
    pub history_disabled: bool,
    pub closed: bool,
}

impl RouterSession {
    /// Open a session and connect it to a master and up to `max_slaves` slaves
    pub fn new(
        instance: Arc<RouterInstance>,
        connector: Box<dyn Connector>,
        client_capabilities: u32,
        database: Option<String>,
    ) -> Result<Self> {
        let config = instance.config().clone();
        let n_servers = instance.backends().len();

        let mut session = Self {
            connector,
            backends: Vec::with_capacity(n_servers),
            slots: vec![None; n_servers],
            master: None,
            created_with_master: false,
            forced_node: None,
            forced_by_trx: false,
            autocommit: true,
            trx_active: false,
            trx_read_only: false,
            trx_ending: false,
            load_active: false,
            load_bytes: 0,
            temp_tables: TempTables::new(),
            history: SescmdHistory::new(config.history_limit(), config.disable_sescmd_history),
            client_capabilities,
            current_db: database,
            max_slaves: instance.max_slave_count(),
            max_rlag: config.max_replication_lag(),
            closed: false,
            instance,
        };

        if !session.select_connect_backend_servers(true) {
            session.closed = true;
            let error = if session.master.is_none() && config.master_failure_mode == MasterFailureMode::FailInstantly {
                Error::NoMasterAvailable
            } else {
                Error::NoBackendsAvailable
            };
            tracing::error!("Failed to create new router session: {}", error);
            return Err(error);
        }

        session.created_with_master = session.master.is_some();
        session.instance.stats().session_opened();
        tracing::debug!("New router session with {} backends", session.in_use_count());
        Ok(session)
    }

    pub fn instance(&self) -> &Arc<RouterInstance> {
        &self.instance
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Client packets are `LOAD DATA LOCAL INFILE` data until the empty one
    pub fn is_load_active(&self) -> bool {
        self.load_active
    }

    /// Close every backend reference; later calls do nothing
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for bref in self.backends.iter_mut().filter(|b| b.is_in_use()) {
            bref.close(false);
        }
        self.instance.stats().session_closed();
        tracing::debug!("Router session closed");
    }

    pub fn backend(&self, id: BackendId) -> Option<&BackendRef> {
        self.backends.get(id)
    }

    pub(super) fn in_use_ids(&self) -> Vec<BackendId> {
        self.backends.iter().filter(|b| b.is_in_use()).map(|b| b.id()).collect()
    }

    pub fn in_use_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_in_use()).count()
    }

    pub(super) fn master_in_use(&self) -> bool {
        self.master.map(|m| self.backends[m].is_in_use()).unwrap_or(false)
    }

    pub(super) fn master_name(&self) -> Option<&str> {
        self.master.map(|m| self.backends[m].name())
    }

    /// Database used to qualify unqualified table names
    pub(super) fn db(&self) -> &str {
        self.current_db.as_deref().unwrap_or("")
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            master: self.master_name().map(str::to_string),
            backends: self
                .backends
                .iter()
                .filter(|b| b.is_in_use())
                .map(|b| b.name().to_string())
                .collect(),
            autocommit: self.autocommit,
            trx_active: self.trx_active,
            trx_read_only: self.trx_read_only,
            forced_node: self.forced_node.map(|id| self.backends[id].name().to_string()),
            load_active: self.load_active,
            temp_tables: self.temp_tables.len(),
            history_len: self.history.len(),
            history_disabled: self.history.is_disabled(),
            closed: self.closed,
        }
    }
}

impl Drop for RouterSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RouterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterSession")
            .field("backends", &self.backends)
            .field("master", &self.master)
            .field("forced_node", &self.forced_node)
            .field("closed", &self.closed)
            .finish()
    }
}
