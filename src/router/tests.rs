//! Session-level routing tests driven through channel-backed connections

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::backend::{BackendConnection, BackendId, ChannelConnection, Connector};
use crate::classifier::KeywordClassifier;
use crate::config::{MasterFailureMode, RouterConfig, SqlVariablesIn};
use crate::error::Error;
use crate::proxy::protocol::{build_error_packet, build_ok_packet, capabilities, MySqlPacket};
use crate::server::{ServerDescriptor, ServerRegistry, ServerRole};

struct Link {
    id: BackendId,
    server: String,
    rx: UnboundedReceiver<Bytes>,
}

#[derive(Clone, Default)]
struct Links {
    links: Arc<Mutex<Vec<Link>>>,
    down: Arc<Mutex<HashSet<String>>>,
}

struct TestConnector(Links);

impl Connector for TestConnector {
    fn connect(&mut self, id: BackendId, server: &Arc<ServerDescriptor>) -> crate::Result<Box<dyn BackendConnection>> {
        if self.0.down.lock().unwrap().contains(server.name()) {
            return Err(Error::ConnectionFailed {
                address: server.socket_address(),
                reason: "connection refused".into(),
            });
        }
        let (conn, rx) = ChannelConnection::pair();
        self.0.links.lock().unwrap().push(Link {
            id,
            server: server.name().to_string(),
            rx,
        });
        Ok(Box::new(conn))
    }
}

struct Harness {
    instance: Arc<RouterInstance>,
    session: RouterSession,
    links: Links,
}

const THREE: &[(&str, ServerRole)] = &[
    ("db1", ServerRole::Master),
    ("db2", ServerRole::Slave),
    ("db3", ServerRole::Slave),
];

fn instance(config: RouterConfig, servers: &[(&str, ServerRole)]) -> Arc<RouterInstance> {
    let mut registry = ServerRegistry::new();
    for (name, role) in servers {
        registry
            .add(Arc::new(ServerDescriptor::new(*name, "127.0.0.1", 3306, *role)))
            .unwrap();
    }
    Arc::new(RouterInstance::new(config, registry, Arc::new(KeywordClassifier::new())).unwrap())
}

fn open(instance: &Arc<RouterInstance>, links: &Links, client_capabilities: u32) -> crate::Result<RouterSession> {
    RouterSession::new(
        instance.clone(),
        Box::new(TestConnector(links.clone())),
        client_capabilities,
        None,
    )
}

impl Harness {
    fn new(config: RouterConfig) -> Self {
        Self::with_servers(config, THREE)
    }

    fn with_servers(config: RouterConfig, servers: &[(&str, ServerRole)]) -> Self {
        let instance = instance(config, servers);
        let links = Links::default();
        let session = open(&instance, &links, capabilities::PROXY_CAPABILITIES).unwrap();
        Self {
            instance,
            session,
            links,
        }
    }

    /// Most recent reference to `name`
    fn id(&self, name: &str) -> BackendId {
        self.links
            .links
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|l| l.server == name)
            .map(|l| l.id)
            .unwrap()
    }

    /// Everything written to reference `id` since the last call
    fn sent(&self, id: BackendId) -> Vec<Bytes> {
        let mut links = self.links.links.lock().unwrap();
        let link = links.iter_mut().find(|l| l.id == id).unwrap();
        let mut out = Vec::new();
        while let Ok(bytes) = link.rx.try_recv() {
            out.push(bytes);
        }
        out
    }

    fn query(&mut self, sql: &str) -> RouteOutcome {
        self.session.route_query(MySqlPacket::query(sql))
    }

    fn reply(&mut self, id: BackendId, data: Bytes) -> Option<Bytes> {
        self.session.on_backend_reply(id, BackendReply::new(data))
    }

    fn server(&self, name: &str) -> &Arc<ServerDescriptor> {
        self.instance.registry().get(name).unwrap()
    }
}

fn ok() -> Bytes {
    build_ok_packet(1, 0, 0).to_bytes()
}

fn err() -> Bytes {
    build_error_packet(1, 1193, "HY000", "Unknown system variable").to_bytes()
}

fn wire(sql: &str) -> Bytes {
    MySqlPacket::query(sql).to_bytes()
}

fn error_code(bytes: &Bytes) -> u16 {
    MySqlPacket::parse(bytes).unwrap().error_info().unwrap().0
}

fn two_slaves() -> RouterConfig {
    RouterConfig {
        max_slave_connections: 2,
        ..Default::default()
    }
}

#[test]
fn test_session_connects_master_and_slaves() {
    let h = Harness::new(RouterConfig::default());
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.master.as_deref(), Some("db1"));
    assert_eq!(snapshot.backends, vec!["db1", "db2"]);
    assert_eq!(h.instance.stats().snapshot().sessions_current, 1);
    assert_eq!(h.instance.backends()[1].router_connections(), 1);
    assert_eq!(h.instance.backends()[2].router_connections(), 0);

    let instance = h.instance.clone();
    drop(h);
    assert_eq!(instance.stats().snapshot().sessions_current, 0);
    assert_eq!(instance.backends()[0].router_connections(), 0);
}

#[test]
fn test_read_write_split() {
    let mut h = Harness::new(RouterConfig::default());
    let (master, slave) = (h.id("db1"), h.id("db2"));

    assert!(h.query("SELECT * FROM users").is_delivered());
    assert_eq!(h.sent(slave), vec![wire("SELECT * FROM users")]);
    assert!(h.sent(master).is_empty());
    assert_eq!(h.reply(slave, ok()), Some(ok()));

    assert!(h.query("INSERT INTO users VALUES (1)").is_delivered());
    assert_eq!(h.sent(master), vec![wire("INSERT INTO users VALUES (1)")]);
    assert!(h.sent(slave).is_empty());
    assert_eq!(h.reply(master, ok()), Some(ok()));

    let stats = h.instance.stats().snapshot();
    assert_eq!(stats.routed_to_master, 1);
    assert_eq!(stats.routed_to_slave, 1);
    assert_eq!(stats.queries, 2);
}

#[test]
fn test_reads_balance_on_current_operations() {
    let mut h = Harness::new(two_slaves());
    let (db2, db3) = (h.id("db2"), h.id("db3"));

    h.query("SELECT 1 FROM t");
    h.query("SELECT 2 FROM t");
    assert_eq!(h.sent(db2).len(), 1);
    assert_eq!(h.sent(db3).len(), 1);
    assert_eq!(h.server("db2").current_operations(), 1);
}

#[test]
fn test_zero_weight_slave_is_last_resort() {
    let config = two_slaves();
    let instance = instance(config, THREE);
    instance.registry().get("db2").unwrap().set_weight(0);

    let links = Links::default();
    let mut session = open(&instance, &links, 0).unwrap();
    let db3 = links.links.lock().unwrap().iter().find(|l| l.server == "db3").unwrap().id;
    // db2 still gets connected but db3 sorts first
    assert_eq!(session.snapshot().backends, vec!["db1", "db3", "db2"]);

    assert!(session.route_query(MySqlPacket::query("SELECT a FROM t")).is_delivered());
    assert_eq!(session.backend(db3).unwrap().waiting_results(), 1);
}

#[test]
fn test_session_command_goes_everywhere() {
    let mut h = Harness::new(two_slaves());
    let (db1, db2, db3) = (h.id("db1"), h.id("db2"), h.id("db3"));

    assert!(h.query("SET NAMES utf8mb4").is_delivered());
    for id in [db1, db2, db3] {
        assert_eq!(h.sent(id), vec![wire("SET NAMES utf8mb4")]);
    }

    // A slave answering first is held back, the master's answer is forwarded
    assert_eq!(h.reply(db2, ok()), None);
    assert_eq!(h.reply(db1, ok()), Some(ok()));
    assert_eq!(h.reply(db3, ok()), None);

    for id in [db1, db2, db3] {
        let bref = h.session.backend(id).unwrap();
        assert!(!bref.is_sescmd_active());
        assert_eq!(bref.waiting_results(), 0);
    }
    assert_eq!(h.session.snapshot().history_len, 1);
    assert_eq!(h.instance.stats().snapshot().routed_to_all, 1);
}

#[test]
fn test_diverging_slave_is_replaced() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("SET sql_mode = 'ANSI'");
    assert_eq!(h.reply(db1, ok()), Some(ok()));
    assert_eq!(h.reply(db2, err()), None);

    let old = h.session.backend(db2).unwrap();
    assert!(old.is_closed());
    assert!(old.has_fatal_failure());

    // The replacement gets the history replayed
    let db3 = h.id("db3");
    assert_eq!(h.sent(db3), vec![wire("SET sql_mode = 'ANSI'")]);
    assert_eq!(h.reply(db3, ok()), None);
    assert_eq!(h.session.snapshot().backends, vec!["db1", "db3"]);
}

#[test]
fn test_slave_error_before_master_is_detected() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("SET @@session.bogus = 1");
    assert_eq!(h.reply(db2, err()), None);
    assert!(h.session.backend(db2).unwrap().is_in_use());

    assert_eq!(h.reply(db1, ok()), Some(ok()));
    assert!(h.session.backend(db2).unwrap().is_closed());
}

#[test]
fn test_reads_wait_for_session_commands() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("USE shop");
    h.sent(db1);
    h.sent(db2);
    assert_eq!(h.reply(db1, ok()), Some(ok()));

    // The slave is still executing USE; the read is queued behind it
    assert!(h.query("SELECT * FROM orders").is_delivered());
    assert!(h.sent(db2).is_empty());
    assert_eq!(h.session.backend(db2).unwrap().pending_len(), 1);

    assert_eq!(h.reply(db2, ok()), None);
    assert_eq!(h.sent(db2), vec![wire("SELECT * FROM orders")]);

    let rows = build_ok_packet(1, 5, 0).to_bytes();
    assert_eq!(h.reply(db2, rows.clone()), Some(rows));
}

#[test]
fn test_failed_read_is_retried_on_replacement() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("SET autocommit = 1");
    h.reply(db1, ok());
    h.reply(db2, ok());

    h.query("SELECT * FROM items");
    assert_eq!(h.sent(db2).len(), 2);

    let outcome = h.session.on_backend_error(db2, BackendErrorKind::NewConnection);
    assert_eq!(outcome, ErrorOutcome::Continue { client_reply: None });

    // History first, then the retried read once it has been answered
    let db3 = h.id("db3");
    assert_eq!(h.sent(db3), vec![wire("SET autocommit = 1")]);
    assert_eq!(h.reply(db3, ok()), None);
    assert_eq!(h.sent(db3), vec![wire("SELECT * FROM items")]);
    assert_eq!(h.reply(db3, ok()), Some(ok()));

    // A second error for the closed reference is ignored
    assert_eq!(
        h.session.on_backend_error(db2, BackendErrorKind::NewConnection),
        ErrorOutcome::PreviouslyHandled
    );
}

#[test]
fn test_failed_read_without_retry() {
    let mut h = Harness::new(RouterConfig {
        retry_failed_reads: false,
        ..Default::default()
    });
    let db2 = h.id("db2");

    h.query("SELECT * FROM items");
    match h.session.on_backend_error(db2, BackendErrorKind::NewConnection) {
        ErrorOutcome::Continue { client_reply: Some(reply) } => assert_eq!(error_code(&reply), 2013),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_idle_slave_failure_owes_nothing() {
    let mut h = Harness::new(RouterConfig::default());
    let db2 = h.id("db2");
    h.links.down.lock().unwrap().insert("db3".into());

    let outcome = h.session.on_backend_error(db2, BackendErrorKind::NewConnection);
    assert_eq!(outcome, ErrorOutcome::Continue { client_reply: None });
    assert_eq!(h.session.snapshot().backends, vec!["db1"]);

    // Reads fall back to the master
    let db1 = h.id("db1");
    assert!(h.query("SELECT 1 FROM t").is_delivered());
    assert_eq!(h.sent(db1).len(), 1);
}

#[test]
fn test_master_lost_fail_instantly() {
    let mut h = Harness::new(RouterConfig::default());
    let db1 = h.id("db1");
    let outcome = h.session.on_backend_error(db1, BackendErrorKind::NewConnection);
    assert!(outcome.must_close());
    assert!(h.session.is_closed());
    assert!(matches!(
        h.query("SELECT 1"),
        RouteOutcome::SessionMustClose {
            kind: RouteErrorKind::SessionClosed,
            ..
        }
    ));
}

#[test]
fn test_master_lost_fail_on_write() {
    let mut h = Harness::new(RouterConfig {
        master_failure_mode: MasterFailureMode::FailOnWrite,
        ..Default::default()
    });
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    let outcome = h.session.on_backend_error(db1, BackendErrorKind::NewConnection);
    assert_eq!(outcome, ErrorOutcome::Continue { client_reply: None });

    assert!(h.query("SELECT * FROM t").is_delivered());
    assert_eq!(h.sent(db2).len(), 1);

    match h.query("UPDATE t SET a = 1") {
        RouteOutcome::SessionMustClose { kind, packet, message } => {
            assert_eq!(kind, RouteErrorKind::MasterLost);
            assert_eq!(message, "The connection to master server 'db1' is not available");
            let packet = MySqlPacket::parse(&packet).unwrap();
            let (code, text) = packet.error_info().unwrap();
            assert_eq!(code, 2013);
            assert!(text.contains("master server 'db1'"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_master_lost_error_on_write() {
    let mut h = Harness::new(RouterConfig {
        master_failure_mode: MasterFailureMode::ErrorOnWrite,
        ..Default::default()
    });
    let db1 = h.id("db1");
    h.session.on_backend_error(db1, BackendErrorKind::NewConnection);

    match h.query("DELETE FROM t") {
        RouteOutcome::Error { kind, packet } => {
            assert_eq!(kind, RouteErrorKind::MasterLost);
            assert_eq!(error_code(&packet), 1290);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!h.session.is_closed());
}

#[test]
fn test_error_on_write_closes_master_that_lost_its_role() {
    let mut h = Harness::new(RouterConfig {
        master_failure_mode: MasterFailureMode::ErrorOnWrite,
        ..Default::default()
    });
    let db1 = h.id("db1");

    assert!(h.query("SELECT 1 FROM a; SELECT 2 FROM b").is_delivered());
    assert_eq!(h.session.snapshot().forced_node.as_deref(), Some("db1"));
    h.reply(db1, ok());

    h.server("db1").set_role(ServerRole::Slave);
    match h.query("INSERT INTO t VALUES (1)") {
        RouteOutcome::Error { kind, packet } => {
            assert_eq!(kind, RouteErrorKind::MasterLost);
            assert_eq!(error_code(&packet), 1290);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.forced_node, None);
    assert_eq!(snapshot.backends, vec!["db2"]);
    assert!(h.session.backend(db1).unwrap().has_fatal_failure());
    assert!(!h.session.is_closed());
}

#[test]
fn test_no_master_available() {
    let servers = &[("db2", ServerRole::Slave), ("db3", ServerRole::Slave)];
    let links = Links::default();

    let strict = instance(RouterConfig::default(), servers);
    assert!(matches!(open(&strict, &links, 0), Err(Error::NoMasterAvailable)));
    assert_eq!(strict.stats().snapshot().sessions_total, 0);

    let mut h = Harness::with_servers(
        RouterConfig {
            master_failure_mode: MasterFailureMode::FailOnWrite,
            ..Default::default()
        },
        servers,
    );
    assert!(h.query("SELECT * FROM t").is_delivered());
    match h.query("INSERT INTO t VALUES (1)") {
        RouteOutcome::SessionMustClose { kind, message, .. } => {
            assert_eq!(kind, RouteErrorKind::NoMaster);
            assert!(message.contains("read-only mode"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_no_servers_reachable() {
    let instance = instance(RouterConfig::default(), THREE);
    let links = Links::default();
    for name in ["db1", "db2", "db3"] {
        links.down.lock().unwrap().insert(name.to_string());
    }
    assert!(open(&instance, &links, 0).is_err());
    assert_eq!(instance.backends()[0].router_connections(), 0);
}

#[test]
fn test_read_only_transaction_sticks_to_one_slave() {
    let mut h = Harness::new(two_slaves());
    let (db1, db2, db3) = (h.id("db1"), h.id("db2"), h.id("db3"));

    h.query("START TRANSACTION READ ONLY");
    assert_eq!(h.sent(db2).len(), 1);
    assert_eq!(h.session.snapshot().forced_node.as_deref(), Some("db2"));

    // db3 has fewer operations but the transaction stays on db2
    h.query("SELECT * FROM a");
    h.query("COMMIT");
    assert_eq!(h.sent(db2).len(), 2);
    assert!(h.sent(db3).is_empty());
    assert!(h.sent(db1).is_empty());

    let snapshot = h.session.snapshot();
    assert!(!snapshot.trx_active);
    assert_eq!(snapshot.forced_node, None);
}

#[test]
fn test_transaction_reads_go_to_master() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("BEGIN");
    h.query("SELECT * FROM a");
    h.query("COMMIT");
    assert_eq!(h.sent(db1).len(), 3);
    assert!(h.sent(db2).is_empty());

    h.query("SELECT * FROM a");
    assert_eq!(h.sent(db2).len(), 1);
}

#[test]
fn test_autocommit_off_keeps_transaction_open() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("SET autocommit = 0");
    h.reply(db1, ok());
    h.reply(db2, ok());
    assert!(h.session.snapshot().trx_active);
    h.sent(db1);

    h.query("COMMIT");
    h.query("SELECT * FROM a");
    assert_eq!(h.sent(db1).len(), 2);
    assert!(h.session.snapshot().trx_active);

    h.query("SET autocommit = 1");
    assert!(!h.session.snapshot().trx_active);
}

#[test]
fn test_multi_statement_locks_to_master() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("SELECT 1 FROM a; SELECT 2 FROM b");
    h.query("SELECT * FROM c");
    assert_eq!(h.sent(db1).len(), 2);
    assert!(h.sent(db2).is_empty());
    assert_eq!(h.session.snapshot().forced_node.as_deref(), Some("db1"));
}

#[test]
fn test_relaxed_multi_statement() {
    let mut h = Harness::new(RouterConfig {
        strict_multi_stmt: false,
        ..Default::default()
    });
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("SELECT 1 FROM a; SELECT 2 FROM b");
    h.query("SELECT * FROM c");
    assert_eq!(h.sent(db1).len(), 1);
    assert_eq!(h.sent(db2).len(), 1);
}

#[test]
fn test_multi_statement_without_master_is_a_write() {
    let servers = &[("db2", ServerRole::Slave), ("db3", ServerRole::Slave)];
    let mut h = Harness::with_servers(
        RouterConfig {
            master_failure_mode: MasterFailureMode::ErrorOnWrite,
            ..two_slaves()
        },
        servers,
    );
    let slave = h.session.in_use_ids()[0];

    match h.query("SELECT 1 FROM a; SELECT 2 FROM b") {
        RouteOutcome::Error { kind, packet } => {
            assert_eq!(kind, RouteErrorKind::NoMaster);
            assert_eq!(error_code(&packet), 1290);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(h.sent(slave).is_empty());

    assert!(h.query("SELECT 1 FROM a").is_delivered());
    assert_eq!(h.sent(slave).len(), 1);
}

#[test]
fn test_multi_statement_needs_client_capability() {
    let instance = instance(RouterConfig::default(), THREE);
    let links = Links::default();
    let mut session = open(&instance, &links, 0).unwrap();
    session.route_query(MySqlPacket::query("SELECT 1 FROM a; SELECT 2 FROM b"));
    assert_eq!(session.snapshot().forced_node, None);
}

#[test]
fn test_stored_procedure_lock() {
    let mut h = Harness::new(RouterConfig {
        strict_sp_calls: true,
        ..Default::default()
    });
    let db1 = h.id("db1");
    h.query("CALL refresh_totals()");
    h.query("SELECT * FROM totals");
    assert_eq!(h.sent(db1).len(), 2);
}

#[test]
fn test_temporary_tables_are_read_from_master() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("CREATE TEMPORARY TABLE scratch (id INT)");
    h.query("SELECT * FROM scratch");
    assert_eq!(h.sent(db1).len(), 2);
    assert!(h.sent(db2).is_empty());
    assert_eq!(h.session.snapshot().temp_tables, 1);

    h.query("DROP TABLE scratch");
    h.query("SELECT * FROM scratch");
    assert_eq!(h.sent(db1).len(), 1);
    assert_eq!(h.sent(db2).len(), 1);
}

#[test]
fn test_load_data_local_infile() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("LOAD DATA LOCAL INFILE '/tmp/rows.csv' INTO TABLE t");
    assert!(h.session.snapshot().load_active);
    let request = Bytes::from_static(&[15, 0, 0, 1, 0xfb, b'/', b't', b'm', b'p', b'/', b'r', b'o', b'w', b's', b'.', b'c', b's', b'v', 0]);
    assert_eq!(h.reply(db1, request.clone()), Some(request));

    // File contents are never classified
    let data = MySqlPacket::new(2, Bytes::from_static(b"SET autocommit=0\n"));
    assert!(h.session.route_query(data).is_delivered());
    assert_eq!(h.session.backend(db1).unwrap().waiting_results(), 0);

    let end = MySqlPacket::new(3, Bytes::new());
    assert!(h.session.route_query(end).is_delivered());
    assert!(!h.session.snapshot().load_active);
    assert_eq!(h.session.backend(db1).unwrap().waiting_results(), 1);

    assert_eq!(h.sent(db1).len(), 3);
    assert!(h.sent(db2).is_empty());
    assert!(h.session.snapshot().autocommit);
}

#[test]
fn test_read_with_variable_write_is_refused() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    match h.query("SELECT @total := SUM(amount) FROM orders") {
        RouteOutcome::Error { kind, packet } => {
            assert_eq!(kind, RouteErrorKind::UnsupportedCombination);
            assert_eq!(error_code(&packet), 1064);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // The statement still ran everywhere but nothing is forwarded
    assert_eq!(h.sent(db1).len(), 1);
    assert_eq!(h.sent(db2).len(), 1);
    assert_eq!(h.reply(db1, ok()), None);
    assert_eq!(h.reply(db2, ok()), None);
}

#[test]
fn test_user_variables_in_master() {
    let mut h = Harness::new(RouterConfig {
        use_sql_variables_in: SqlVariablesIn::Master,
        ..Default::default()
    });
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    h.query("SET @x = 1");
    h.query("SELECT @x");
    assert_eq!(h.sent(db1).len(), 2);
    assert!(h.sent(db2).is_empty());
}

#[test]
fn test_hints() {
    let mut h = Harness::new(two_slaves());
    let (db1, db2, db3) = (h.id("db1"), h.id("db2"), h.id("db3"));

    h.query("SELECT * FROM t -- maxscale route to master");
    assert_eq!(h.sent(db1).len(), 1);

    h.query("SELECT * FROM t /* maxscale route to server DB3 */");
    h.query("SELECT * FROM t /* maxscale route to server db3 */");
    assert_eq!(h.sent(db3).len(), 2);

    // Unknown names fall back to an ordinary slave
    h.query("SELECT * FROM t -- maxscale route to server nope");
    assert_eq!(h.sent(db2).len(), 1);
}

#[test]
fn test_replication_lag_limit() {
    let mut h = Harness::new(RouterConfig {
        max_slave_connections: 2,
        max_slave_replication_lag: 10,
        ..Default::default()
    });
    // Unknown lag keeps both slaves out of the session
    assert_eq!(h.session.snapshot().backends, vec!["db1"]);
    assert!(h.query("SELECT 1 FROM t").is_delivered());
    assert_eq!(h.sent(h.id("db1")).len(), 1);
}

#[test]
fn test_lagging_slave_not_chosen() {
    let config = RouterConfig {
        max_slave_connections: 2,
        ..Default::default()
    };
    let mut h = Harness::new(config);
    let (db2, db3) = (h.id("db2"), h.id("db3"));
    h.server("db2").set_replication_lag(Some(30));
    h.server("db3").set_replication_lag(Some(2));

    h.query("SELECT * FROM t /* maxscale max_slave_replication_lag=5 */");
    assert!(h.sent(db2).is_empty());
    assert_eq!(h.sent(db3).len(), 1);
}

#[test]
fn test_history_limit_disables_replay() {
    let mut h = Harness::new(RouterConfig {
        max_sescmd_history: 2,
        ..Default::default()
    });
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    for sql in ["SET @a = 1", "SET @b = 2", "SET @c = 3"] {
        h.query(sql);
        h.reply(db1, ok());
        h.reply(db2, ok());
    }
    let snapshot = h.session.snapshot();
    assert!(snapshot.history_disabled);
    assert_eq!(snapshot.history_len, 0);

    // No replacement once history is gone
    h.session.on_backend_error(db2, BackendErrorKind::NewConnection);
    assert_eq!(h.session.snapshot().backends, vec!["db1"]);
}

#[test]
fn test_history_limit_keeps_routing() {
    let mut h = Harness::new(RouterConfig {
        max_sescmd_history: 5,
        ..Default::default()
    });
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    for n in 1..=7 {
        let sql = format!("SET @v{} = {}", n, n);
        assert!(h.query(&sql).is_delivered());
        assert_eq!(h.sent(db1), vec![wire(&sql)]);
        assert_eq!(h.sent(db2), vec![wire(&sql)]);

        let snapshot = h.session.snapshot();
        assert_eq!(snapshot.history_disabled, n >= 6);
        if n == 7 {
            assert_eq!(snapshot.history_len, 1);
        }

        assert_eq!(h.reply(db1, ok()), Some(ok()));
        assert_eq!(h.reply(db2, ok()), None);
    }

    assert!(h.session.history.limit_exceeded());
    assert_eq!(h.session.history.recorded(), 7);
    assert_eq!(h.session.snapshot().history_len, 0);
}

#[test]
fn test_unresponsive_backend() {
    let mut h = Harness::new(RouterConfig::default());
    let db2 = h.id("db2");

    assert_eq!(
        h.session.on_backend_unresponsive(db2),
        ErrorOutcome::Continue { client_reply: None }
    );
    assert!(h.session.backend(db2).unwrap().is_in_use());

    h.server("db2").set_running(false);
    h.session.on_backend_unresponsive(db2);
    assert!(h.session.backend(db2).unwrap().is_closed());
}

#[test]
fn test_quit_is_not_answered() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    let quit = MySqlPacket::command(crate::proxy::protocol::Command::Quit, &[]);
    assert!(h.session.route_query(quit).is_delivered());
    assert_eq!(h.sent(db1).len(), 1);
    assert_eq!(h.sent(db2).len(), 1);
    assert_eq!(h.session.backend(db1).unwrap().waiting_results(), 0);
    assert_eq!(h.session.snapshot().history_len, 0);
}

#[test]
fn test_prepared_statements_go_to_master() {
    let mut h = Harness::new(RouterConfig::default());
    let (db1, db2) = (h.id("db1"), h.id("db2"));

    let prepare = MySqlPacket::command(crate::proxy::protocol::Command::StmtPrepare, b"SELECT * FROM t WHERE id = ?");
    let execute = MySqlPacket::command(crate::proxy::protocol::Command::StmtExecute, &[1, 0, 0, 0, 0, 1, 0, 0, 0]);
    h.session.route_query(prepare);
    h.session.route_query(execute);
    assert_eq!(h.sent(db1).len(), 2);
    assert!(h.sent(db2).is_empty());
}
