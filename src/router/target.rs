//! Route target derivation
//!
//! Turns the query type and the session's transaction state into a
//! [`RouteTarget`], then applies routing hints on top of it.

use crate::classifier::QueryType;
use crate::config::SqlVariablesIn;
use crate::hint::Hint;

use super::RouteTarget;

/// Session state the target depends on
#[derive(Debug, Clone, Copy)]
pub(super) struct TargetContext {
    /// The session is pinned to its master
    pub forced_to_master: bool,
    pub trx_active: bool,
    pub trx_read_only: bool,
    pub load_active: bool,
    pub use_sql_variables_in: SqlVariablesIn,
}

/// Target plus the hint details needed to pick the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RouteDecision {
    pub target: RouteTarget,
    pub named_server: Option<String>,
    pub max_rlag: Option<u32>,
}

const SESSION_WIDE: QueryType = QueryType::from_bits(
    QueryType::SESSION_WRITE.bits()
        | QueryType::GSYSVAR_WRITE.bits()
        | QueryType::ENABLE_AUTOCOMMIT.bits()
        | QueryType::DISABLE_AUTOCOMMIT.bits(),
);

const ANY_PREPARE: QueryType =
    QueryType::from_bits(QueryType::PREPARE_STMT.bits() | QueryType::PREPARE_NAMED_STMT.bits());

const NOT_FOR_SLAVE: QueryType = QueryType::from_bits(
    QueryType::MASTER_READ.bits()
        | QueryType::WRITE.bits()
        | QueryType::PREPARE_STMT.bits()
        | QueryType::PREPARE_NAMED_STMT.bits()
        | QueryType::EXEC_STMT.bits(),
);

const SLAVE_READ: QueryType = QueryType::from_bits(
    QueryType::READ.bits()
        | QueryType::SHOW_TABLES.bits()
        | QueryType::USERVAR_READ.bits()
        | QueryType::SYSVAR_READ.bits()
        | QueryType::GSYSVAR_READ.bits(),
);

/// Derive the target of a statement from its type, ignoring hints
pub(super) fn route_target(ctx: &TargetContext, qtype: QueryType) -> RouteTarget {
    if ctx.forced_to_master {
        return RouteTarget::MASTER;
    }

    let vars_everywhere = ctx.use_sql_variables_in == SqlVariablesIn::All;

    if !ctx.load_active
        && (qtype.intersects(SESSION_WIDE) || (vars_everywhere && qtype.contains(QueryType::USERVAR_WRITE)))
    {
        // A read that also changes session state can't go everywhere
        if qtype.contains(QueryType::READ) && !qtype.intersects(ANY_PREPARE) {
            return RouteTarget::MASTER | RouteTarget::ALL;
        }
        return RouteTarget::ALL;
    }

    if !ctx.trx_active && !ctx.load_active && !qtype.intersects(NOT_FOR_SLAVE) && qtype.intersects(SLAVE_READ) {
        if qtype.contains(QueryType::USERVAR_READ) {
            return if vars_everywhere {
                RouteTarget::SLAVE
            } else {
                RouteTarget::MASTER
            };
        }
        return RouteTarget::SLAVE;
    }

    if ctx.trx_active && ctx.trx_read_only {
        return RouteTarget::SLAVE;
    }

    RouteTarget::MASTER
}

/// Apply hints, in order, to an already derived target
pub(super) fn apply_hints(mut target: RouteTarget, hints: &[Hint]) -> RouteDecision {
    let mut named_server = None;
    let mut max_rlag = None;

    for hint in hints {
        match hint {
            Hint::RouteToMaster => {
                target = RouteTarget::MASTER;
                break;
            }
            Hint::RouteToNamedServer(name) => {
                target |= RouteTarget::NAMED_SERVER;
                named_server = Some(name.clone());
            }
            Hint::Parameter { name, value } => {
                if name.eq_ignore_ascii_case("max_slave_replication_lag") {
                    target |= RouteTarget::RLAG_MAX;
                    match value.trim().parse::<i64>() {
                        Ok(lag) if lag > 0 => max_rlag = Some(lag.min(u32::MAX as i64) as u32),
                        _ => tracing::error!(
                            "Invalid value '{}' for hint parameter max_slave_replication_lag",
                            value
                        ),
                    }
                } else {
                    tracing::error!(
                        "Unknown hint parameter '{}' when 'max_slave_replication_lag' was expected.",
                        name
                    );
                }
            }
            Hint::RouteToSlave => target = RouteTarget::SLAVE,
        }
    }

    RouteDecision {
        target,
        named_server,
        max_rlag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TargetContext {
        TargetContext {
            forced_to_master: false,
            trx_active: false,
            trx_read_only: false,
            load_active: false,
            use_sql_variables_in: SqlVariablesIn::All,
        }
    }

    #[test]
    fn test_plain_read_and_write() {
        assert_eq!(route_target(&ctx(), QueryType::READ), RouteTarget::SLAVE);
        assert_eq!(route_target(&ctx(), QueryType::WRITE), RouteTarget::MASTER);
        assert_eq!(route_target(&ctx(), QueryType::SHOW_TABLES), RouteTarget::SLAVE);
        assert_eq!(route_target(&ctx(), QueryType::READ | QueryType::MASTER_READ), RouteTarget::MASTER);
        assert_eq!(route_target(&ctx(), QueryType::UNKNOWN), RouteTarget::MASTER);
    }

    #[test]
    fn test_session_writes_go_everywhere() {
        assert_eq!(route_target(&ctx(), QueryType::SESSION_WRITE), RouteTarget::ALL);
        assert_eq!(route_target(&ctx(), QueryType::GSYSVAR_WRITE), RouteTarget::ALL);
        assert_eq!(
            route_target(&ctx(), QueryType::SESSION_WRITE | QueryType::DISABLE_AUTOCOMMIT | QueryType::BEGIN_TRX),
            RouteTarget::ALL
        );
        assert_eq!(route_target(&ctx(), QueryType::USERVAR_WRITE), RouteTarget::ALL);

        let mut master_vars = ctx();
        master_vars.use_sql_variables_in = SqlVariablesIn::Master;
        assert_eq!(route_target(&master_vars, QueryType::USERVAR_WRITE), RouteTarget::MASTER);
    }

    #[test]
    fn test_read_with_session_write() {
        let target = route_target(&ctx(), QueryType::READ | QueryType::USERVAR_WRITE);
        assert_eq!(target, RouteTarget::MASTER | RouteTarget::ALL);

        let target = route_target(&ctx(), QueryType::READ | QueryType::SESSION_WRITE | QueryType::PREPARE_NAMED_STMT);
        assert_eq!(target, RouteTarget::ALL);
    }

    #[test]
    fn test_user_variable_reads() {
        assert_eq!(route_target(&ctx(), QueryType::USERVAR_READ), RouteTarget::SLAVE);

        let mut master_vars = ctx();
        master_vars.use_sql_variables_in = SqlVariablesIn::Master;
        assert_eq!(route_target(&master_vars, QueryType::USERVAR_READ), RouteTarget::MASTER);
        assert_eq!(route_target(&master_vars, QueryType::SYSVAR_READ), RouteTarget::SLAVE);
    }

    #[test]
    fn test_transactions() {
        let mut trx = ctx();
        trx.trx_active = true;
        assert_eq!(route_target(&trx, QueryType::READ), RouteTarget::MASTER);

        trx.trx_read_only = true;
        assert_eq!(route_target(&trx, QueryType::READ), RouteTarget::SLAVE);
        assert_eq!(route_target(&trx, QueryType::WRITE), RouteTarget::SLAVE);
        assert_eq!(route_target(&trx, QueryType::SESSION_WRITE), RouteTarget::ALL);
    }

    #[test]
    fn test_forced_and_load() {
        let mut forced = ctx();
        forced.forced_to_master = true;
        assert_eq!(route_target(&forced, QueryType::SESSION_WRITE), RouteTarget::MASTER);
        assert_eq!(route_target(&forced, QueryType::READ), RouteTarget::MASTER);

        let mut load = ctx();
        load.load_active = true;
        assert_eq!(route_target(&load, QueryType::SESSION_WRITE), RouteTarget::MASTER);
        assert_eq!(route_target(&load, QueryType::READ), RouteTarget::MASTER);
    }

    #[test]
    fn test_hints() {
        let decision = apply_hints(RouteTarget::SLAVE, &[Hint::RouteToMaster, Hint::RouteToSlave]);
        assert_eq!(decision.target, RouteTarget::MASTER);

        let decision = apply_hints(RouteTarget::ALL, &[Hint::RouteToMaster]);
        assert_eq!(decision.target, RouteTarget::MASTER);

        let decision = apply_hints(RouteTarget::SLAVE, &[Hint::RouteToNamedServer("db3".into())]);
        assert_eq!(decision.target, RouteTarget::SLAVE | RouteTarget::NAMED_SERVER);
        assert_eq!(decision.named_server.as_deref(), Some("db3"));

        let decision = apply_hints(
            RouteTarget::SLAVE,
            &[Hint::Parameter {
                name: "max_slave_replication_lag".into(),
                value: "5".into(),
            }],
        );
        assert_eq!(decision.target, RouteTarget::SLAVE | RouteTarget::RLAG_MAX);
        assert_eq!(decision.max_rlag, Some(5));

        let decision = apply_hints(
            RouteTarget::SLAVE,
            &[Hint::Parameter {
                name: "bogus".into(),
                value: "1".into(),
            }],
        );
        assert_eq!(decision.target, RouteTarget::SLAVE);

        let decision = apply_hints(RouteTarget::MASTER, &[Hint::RouteToSlave]);
        assert_eq!(decision.target, RouteTarget::SLAVE);
    }
}
