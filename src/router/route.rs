//! Statement routing

use bytes::Bytes;

use crate::backend::BackendId;
use crate::classifier::{contains_multiple_statements, Classification, QueryOperation, QueryType};
use crate::config::MasterFailureMode;
use crate::hint::parse_hints;
use crate::proxy::protocol::{build_error_packet, capabilities, Command, MySqlPacket};

use super::session::RouterSession;
use super::target::{apply_hints, route_target, RouteDecision, TargetContext};
use super::{RouteErrorKind, RouteOutcome, RouteTarget};

const ER_UNKNOWN_ERROR: u16 = 1105;
const ER_PARSE_ERROR: u16 = 1064;
const ER_OPTION_PREVENTS_STATEMENT: u16 = 1290;
pub(super) const CR_SERVER_LOST: u16 = 2013;

/// Error packet sent in reply to a client command
pub(super) fn client_error(code: u16, state: &str, message: &str) -> Bytes {
    build_error_packet(1, code, state, message).to_bytes()
}

/// The session ends; the client is told why before the connection drops
pub(super) fn session_must_close(kind: RouteErrorKind, message: String) -> RouteOutcome {
    RouteOutcome::SessionMustClose {
        kind,
        packet: client_error(CR_SERVER_LOST, "HY000", &message),
        message,
    }
}

/// `LOAD DATA LOCAL INFILE` makes the client stream a file after the statement
fn is_local_infile(sql: &str) -> bool {
    sql.split_whitespace()
        .take(6)
        .any(|word| word.eq_ignore_ascii_case("LOCAL"))
}

impl RouterSession {
    /// Route one client packet
    ///
    /// The packet is the complete client command (or a `LOAD DATA LOCAL
    /// INFILE` data packet). Replies arrive later through
    /// [`RouterSession::on_backend_reply`].
    pub fn route_query(&mut self, packet: MySqlPacket) -> RouteOutcome {
        if self.closed {
            return session_must_close(RouteErrorKind::SessionClosed, "Router session is closed".into());
        }

        if self.load_active {
            return self.route_load_data(packet);
        }

        let command = packet.command_type();
        let sql = packet.sql();
        let (classification, mut qtype) = self.determine_query_type(&packet, sql.as_deref());

        self.handle_multi_temp_and_load(&packet, sql.as_deref(), &classification, &mut qtype);
        self.update_transaction_state(qtype);
        self.track_database(&packet, &classification);

        let ctx = TargetContext {
            forced_to_master: self.forced_node.is_some() && self.forced_node == self.master,
            trx_active: self.trx_active,
            trx_read_only: self.trx_read_only,
            load_active: self.load_active,
            use_sql_variables_in: self.instance.config().use_sql_variables_in,
        };
        let hints = sql.as_deref().map(parse_hints).unwrap_or_default();
        let decision = apply_hints(route_target(&ctx, qtype), &hints);

        tracing::debug!(
            "Routing {:?} [{}] to {:?}: {}",
            command,
            qtype,
            decision.target,
            sql.as_deref().unwrap_or("")
        );

        let expect_reply = !command.map(Command::expects_no_response).unwrap_or(false);
        let outcome = self.dispatch(decision, qtype, packet, sql.as_deref(), expect_reply);
        self.finish_transaction_state();
        outcome
    }

    /// Data packets of `LOAD DATA LOCAL INFILE` all go to the master; the empty one ends the load
    fn route_load_data(&mut self, packet: MySqlPacket) -> RouteOutcome {
        let finished = packet.payload.is_empty();
        if finished {
            self.load_active = false;
            tracing::info!(
                "LOAD DATA LOCAL INFILE finished: {} bytes sent",
                self.load_bytes + packet.to_bytes().len() as u64
            );
        } else {
            self.load_bytes += packet.to_bytes().len() as u64;
        }

        match self.handle_master_is_target() {
            Ok(Some(id)) => {
                if self.handle_got_target(id, packet.to_bytes(), false, finished) {
                    RouteOutcome::Delivered
                } else {
                    self.routing_failed(RouteErrorKind::WriteFailed)
                }
            }
            Ok(None) => RouteOutcome::Error {
                kind: RouteErrorKind::MasterLost,
                packet: read_only_error(),
            },
            Err(outcome) => outcome,
        }
    }

    /// Classify the packet and return its type bits
    fn determine_query_type(&self, packet: &MySqlPacket, sql: Option<&str>) -> (Classification, QueryType) {
        let Some(command) = packet.command_type() else {
            return (Classification::default(), QueryType::UNKNOWN);
        };

        let classification = match command {
            Command::Query | Command::StmtPrepare => sql
                .map(|sql| self.instance.classifier().classify(sql))
                .unwrap_or_default(),
            _ => Classification::default(),
        };

        let qtype = match command {
            Command::Quit
            | Command::InitDb
            | Command::Refresh
            | Command::Debug
            | Command::Ping
            | Command::ChangeUser
            | Command::SetOption => QueryType::SESSION_WRITE,
            Command::CreateDb | Command::DropDb | Command::StmtSendLongData | Command::StmtClose | Command::StmtReset => {
                QueryType::WRITE
            }
            Command::Query => classification.query_type,
            Command::StmtPrepare => classification.query_type | QueryType::PREPARE_STMT,
            Command::StmtExecute => QueryType::EXEC_STMT,
            _ => QueryType::UNKNOWN,
        };

        (classification, qtype)
    }

    /// Multi-statement locking, temporary table bookkeeping and the start of a data load
    fn handle_multi_temp_and_load(
        &mut self,
        packet: &MySqlPacket,
        sql: Option<&str>,
        classification: &Classification,
        qtype: &mut QueryType,
    ) {
        let config = self.instance.config();
        let is_query = packet.command_type() == Some(Command::Query);

        if (self.forced_node.is_none() || self.forced_node != self.master) && is_query {
            let multi = self.client_capabilities & capabilities::CLIENT_MULTI_STATEMENTS != 0
                && contains_multiple_statements(&packet.payload[1..]);
            let sp_call = config.strict_sp_calls && classification.operation == QueryOperation::Call;

            if multi || sp_call {
                if let Some(master) = self.master {
                    self.forced_node = Some(master);
                    self.forced_by_trx = false;
                    tracing::info!("Multi-statement query or stored procedure call, routing all future queries to master.");
                } else {
                    qtype.insert(QueryType::WRITE);
                }
            }
        }

        if self.temp_tables.have_tmp_tables() && is_query {
            let db = self.db().to_string();
            self.temp_tables.check_drop(&db, classification);
            if self.temp_tables.is_read_tmp_table(&db, classification) {
                qtype.insert(QueryType::MASTER_READ | QueryType::READ_TMP_TABLE);
            }
        }

        if qtype.contains(QueryType::CREATE_TMP_TABLE) {
            let db = self.db().to_string();
            self.temp_tables.check_create(&db, classification);
        }

        if is_query && classification.operation == QueryOperation::Load && sql.map(is_local_infile).unwrap_or(false) {
            self.load_active = true;
            self.load_bytes = 0;
            tracing::debug!("Started LOAD DATA LOCAL INFILE");
        }
    }

    /// Autocommit and transaction boundaries, applied before the target is derived
    fn update_transaction_state(&mut self, qtype: QueryType) {
        if qtype.contains(QueryType::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
            if !self.trx_active {
                self.trx_active = true;
                self.trx_read_only = false;
            }
        } else if qtype.contains(QueryType::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
            if self.trx_active {
                self.trx_ending = true;
            }
        }

        if !self.trx_active && qtype.contains(QueryType::BEGIN_TRX) {
            self.trx_active = true;
            self.trx_read_only = qtype.contains(QueryType::READ_ONLY_TRX);
        }

        if self.autocommit && self.trx_active && qtype.intersects(QueryType::COMMIT | QueryType::ROLLBACK) {
            self.trx_ending = true;
        }
    }

    /// Close a transaction that the routed statement ended
    fn finish_transaction_state(&mut self) {
        if !self.trx_ending {
            return;
        }
        if self.trx_read_only && self.forced_by_trx {
            self.forced_node = None;
            self.forced_by_trx = false;
        }
        self.trx_active = false;
        self.trx_read_only = false;
        self.trx_ending = false;
    }

    fn track_database(&mut self, packet: &MySqlPacket, classification: &Classification) {
        let db = packet.init_db().or_else(|| {
            (classification.operation == QueryOperation::ChangeDb)
                .then(|| classification.database.clone())
                .flatten()
        });
        if let Some(db) = db {
            self.current_db = Some(db);
        }
    }

    fn dispatch(
        &mut self,
        decision: RouteDecision,
        qtype: QueryType,
        packet: MySqlPacket,
        sql: Option<&str>,
        expect_reply: bool,
    ) -> RouteOutcome {
        let target = decision.target;
        let wire = packet.to_bytes();

        if target.contains(RouteTarget::ALL) {
            return self.handle_target_is_all(target, qtype, &packet, sql);
        }

        let retry = self.instance.config().retry_failed_reads;
        let (found, store) = if target.contains(RouteTarget::NAMED_SERVER) || target.contains(RouteTarget::RLAG_MAX) {
            (self.handle_hinted_target(&decision), retry && target.contains(RouteTarget::SLAVE))
        } else if target.contains(RouteTarget::SLAVE) {
            (self.handle_slave_is_target(), retry)
        } else {
            let found = self.handle_master_is_target();
            if !self.instance.config().strict_multi_stmt && self.forced_node.is_some() && self.forced_node == self.master {
                self.forced_node = None;
            }
            (found, false)
        };

        match found {
            Ok(Some(id)) => {
                if !self.handle_got_target(id, wire, store, expect_reply) {
                    return self.routing_failed(RouteErrorKind::WriteFailed);
                }
                if Some(id) == self.master {
                    self.instance.stats().routed_to_master();
                } else {
                    self.instance.stats().routed_to_slave();
                }
                RouteOutcome::Delivered
            }
            // Write refused with a read-only error
            Ok(None) => RouteOutcome::Error {
                kind: if self.master.is_some() {
                    RouteErrorKind::MasterLost
                } else {
                    RouteErrorKind::NoMaster
                },
                packet: read_only_error(),
            },
            Err(outcome) => outcome,
        }
    }

    fn handle_hinted_target(&mut self, decision: &RouteDecision) -> Result<Option<BackendId>, RouteOutcome> {
        let max_rlag = decision.max_rlag.or(self.max_rlag);
        let btype = if decision.target.contains(RouteTarget::SLAVE) {
            RouteTarget::SLAVE
        } else {
            RouteTarget::MASTER
        };

        match self.get_backend(btype, decision.named_server.as_deref(), max_rlag) {
            Some(id) => Ok(Some(id)),
            None => {
                let kind = if let Some(name) = &decision.named_server {
                    tracing::info!(
                        "Was supposed to route to named server {} but couldn't find the server in a suitable state.",
                        name
                    );
                    RouteErrorKind::NamedServerNotFound
                } else {
                    tracing::info!(
                        "Was supposed to route to server with replication lag at most {:?} but couldn't find such a slave.",
                        max_rlag
                    );
                    RouteErrorKind::NoSlave
                };
                Err(self.routing_failed(kind))
            }
        }
    }

    fn handle_slave_is_target(&mut self) -> Result<Option<BackendId>, RouteOutcome> {
        match self.get_backend(RouteTarget::SLAVE, None, self.max_rlag) {
            Some(id) => Ok(Some(id)),
            None => {
                tracing::info!("Was supposed to route to slave but finding suitable one failed.");
                Err(self.routing_failed(RouteErrorKind::NoSlave))
            }
        }
    }

    /// The master connection, `Ok(None)` when the write must be refused with a read-only error
    pub(super) fn handle_master_is_target(&mut self) -> Result<Option<BackendId>, RouteOutcome> {
        let found = self.get_backend(RouteTarget::MASTER, None, None);
        if let (Some(id), Some(master)) = (found, self.master) {
            if id == master {
                return Ok(Some(id));
            }
        }

        if self.instance.config().master_failure_mode == MasterFailureMode::ErrorOnWrite {
            if let Some(master) = self.master {
                if self.backends[master].is_in_use() {
                    self.fail_backend(master);
                    self.prune_history();
                }
            }
            return Ok(None);
        }

        let (kind, message) = self.master_failure_reason(found);
        tracing::warn!("Write query received from client. {}. Closing client connection.", message);
        Err(session_must_close(kind, message))
    }

    fn master_failure_reason(&self, found: Option<BackendId>) -> (RouteErrorKind, String) {
        let failure_mode = self.instance.config().master_failure_mode;
        match (found, self.master) {
            (Some(new), Some(old)) => (
                RouteErrorKind::MasterChanged,
                format!(
                    "Master server changed from '{}' to '{}'",
                    self.backends[old].name(),
                    self.backends[new].name()
                ),
            ),
            (_, Some(old)) if !self.backends[old].is_in_use() => (
                RouteErrorKind::MasterLost,
                format!("The connection to master server '{}' is not available", self.backends[old].name()),
            ),
            (_, Some(old)) => (
                RouteErrorKind::MasterChanged,
                format!("Server '{}' is no longer a master", self.backends[old].name()),
            ),
            (_, None) if failure_mode != MasterFailureMode::FailInstantly && !self.created_with_master => (
                RouteErrorKind::NoMaster,
                "Session is in read-only mode because it was created when no master was available".to_string(),
            ),
            (_, None) => (
                RouteErrorKind::NoMaster,
                "Could not find a valid master connection".to_string(),
            ),
        }
    }

    /// Send `wire` to the chosen backend, or queue it behind running session commands
    pub(super) fn handle_got_target(&mut self, id: BackendId, wire: Bytes, store: bool, expect_reply: bool) -> bool {
        if self.forced_node.is_none() && self.trx_active && self.trx_read_only {
            self.forced_node = Some(id);
            self.forced_by_trx = true;
        }

        let is_master = Some(id) == self.master;
        let bref = &mut self.backends[id];

        if store {
            bref.store_stmt(wire.clone());
        }

        if bref.is_sescmd_active() && !is_master {
            tracing::debug!("Queuing statement on '{}' behind session commands", bref.name());
            bref.push_pending(wire);
        } else if !bref.write(wire) {
            tracing::error!("Routing query to '{}' failed.", bref.name());
            bref.clear_stored_stmt();
            return false;
        }

        if expect_reply {
            bref.set_query_active();
            bref.add_waiting_result();
        }
        self.instance.stats().query_forwarded();
        true
    }

    fn handle_target_is_all(
        &mut self,
        target: RouteTarget,
        qtype: QueryType,
        packet: &MySqlPacket,
        sql: Option<&str>,
    ) -> RouteOutcome {
        if target.contains(RouteTarget::MASTER) || target.contains(RouteTarget::SLAVE) {
            tracing::error!(
                "Can't route {:?}:{}:\"{}\". SELECT with session data modification is not supported if \
                 configuration parameter use_sql_variables_in=all .",
                packet.command_type(),
                qtype,
                sql.unwrap_or("")
            );
            if !self.route_session_write(packet, false) {
                return session_must_close(RouteErrorKind::SessionWriteFailed, "Routing session command failed".into());
            }
            return RouteOutcome::Error {
                kind: RouteErrorKind::UnsupportedCombination,
                packet: client_error(
                    ER_PARSE_ERROR,
                    "42000",
                    "Routing query to backend failed. See the error log for further details.",
                ),
            };
        }

        if self.route_session_write(packet, true) {
            self.instance.stats().routed_to_all();
            self.instance.stats().query_forwarded();
            RouteOutcome::Delivered
        } else {
            session_must_close(RouteErrorKind::SessionWriteFailed, "Routing session command failed".into())
        }
    }

    /// Send a session command to every connected backend
    ///
    /// Commands the server answers are recorded in the history; each backend
    /// runs them in order and the first authoritative reply goes to the client.
    pub(super) fn route_session_write(&mut self, packet: &MySqlPacket, forward_reply: bool) -> bool {
        let wire = packet.to_bytes();
        let command = packet.command_byte().unwrap_or(0);
        let ids = self.in_use_ids();

        if ids.is_empty() {
            return false;
        }

        if Command::from(command).expects_no_response() {
            let mut ok = true;
            for id in ids {
                if !self.backends[id].write(wire.clone()) {
                    ok = false;
                }
            }
            return ok;
        }

        self.history.append(wire, command, forward_reply);

        let mut ok = true;
        for &id in &ids {
            let bref = &mut self.backends[id];
            bref.add_waiting_result();
            if !bref.is_sescmd_active() && !self.history.execute(bref) {
                ok = false;
            }
        }

        self.prune_history();
        ok && ids.len() <= self.max_slaves + 1
    }

    /// Forget history entries every connected backend has executed, once history is disabled
    pub(super) fn prune_history(&mut self) {
        if !self.history.is_disabled() {
            return;
        }
        let lowest = self
            .backends
            .iter()
            .filter(|b| b.is_in_use())
            .map(|b| b.cursor().position)
            .min()
            .unwrap_or_else(|| self.history.next_position());
        self.history.prune(lowest);
    }

    /// Error packet if the session can go on, otherwise close it
    pub(super) fn routing_failed(&mut self, kind: RouteErrorKind) -> RouteOutcome {
        if self.in_use_count() == 0 {
            return session_must_close(kind, format!("Could not route query: {}", kind));
        }
        RouteOutcome::Error {
            kind,
            packet: client_error(ER_UNKNOWN_ERROR, "HY000", &format!("Could not route query: {}", kind)),
        }
    }
}

fn read_only_error() -> Bytes {
    client_error(
        ER_OPTION_PREVENTS_STATEMENT,
        "HY000",
        "The MariaDB server is running with the --read-only option so it cannot execute this statement",
    )
}
