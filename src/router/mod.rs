//! Read/Write Splitting Router
//!
//! A [`RouterInstance`] is created once per listener and shared by every
//! client session. Each client connection gets a [`RouterSession`] that owns
//! its backend references and decides, statement by statement, where the
//! statement runs:
//!
//! - writes and anything transactional go to the master,
//! - reads go to a slave picked by the configured selection criteria,
//! - statements that change session state go to every backend and are kept
//!   in the session command history so that replacement backends can be
//!   brought to the same state.
//!
//! The session is driven entirely by the caller: [`RouterSession::route_query`]
//! for client packets, [`RouterSession::on_backend_reply`] and
//! [`RouterSession::on_backend_error`] for backend events. Nothing here does
//! I/O or blocks.

mod instance;
mod recovery;
mod reply;
mod route;
mod select;
mod session;
pub mod sescmd;
mod target;
mod temp_tables;

#[cfg(test)]
mod tests;

pub use instance::{RouterDiagnostics, RouterInstance, RouterStats, StatsSnapshot};
pub use reply::BackendReply;
pub use select::compare_servers;
pub use session::{RouterSession, SessionSnapshot};
pub use temp_tables::TempTables;

use bytes::Bytes;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Where a statement should go
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteTarget(u8);

impl RouteTarget {
    pub const UNDEFINED: RouteTarget = RouteTarget(0x00);
    pub const MASTER: RouteTarget = RouteTarget(0x01);
    pub const SLAVE: RouteTarget = RouteTarget(0x02);
    pub const NAMED_SERVER: RouteTarget = RouteTarget(0x04);
    pub const ALL: RouteTarget = RouteTarget(0x08);
    pub const RLAG_MAX: RouteTarget = RouteTarget(0x10);

    pub fn is_undefined(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: RouteTarget) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for RouteTarget {
    type Output = RouteTarget;

    fn bitor(self, rhs: RouteTarget) -> RouteTarget {
        RouteTarget(self.0 | rhs.0)
    }
}

impl BitOrAssign for RouteTarget {
    fn bitor_assign(&mut self, rhs: RouteTarget) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            return write!(f, "UNDEFINED");
        }
        let names: Vec<&str> = [
            (RouteTarget::MASTER, "MASTER"),
            (RouteTarget::SLAVE, "SLAVE"),
            (RouteTarget::NAMED_SERVER, "NAMED_SERVER"),
            (RouteTarget::ALL, "ALL"),
            (RouteTarget::RLAG_MAX, "RLAG_MAX"),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "{}", names.join("|"))
    }
}

/// Why a statement could not be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteErrorKind {
    /// The session never had a master
    NoMaster,
    /// The session master connection was closed
    MasterLost,
    /// The cluster master is no longer the session master
    MasterChanged,
    /// No slave satisfies the routing constraints
    NoSlave,
    /// The hinted server is not part of the session
    NamedServerNotFound,
    /// Writing to the chosen backend failed
    WriteFailed,
    /// A read that also modifies session state with `use_sql_variables_in=all`
    UnsupportedCombination,
    /// A session command could not be sent to every backend
    SessionWriteFailed,
    /// The session is already closed
    SessionClosed,
}

impl fmt::Display for RouteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RouteErrorKind::NoMaster => "no master",
            RouteErrorKind::MasterLost => "master lost",
            RouteErrorKind::MasterChanged => "master changed",
            RouteErrorKind::NoSlave => "no slave",
            RouteErrorKind::NamedServerNotFound => "named server not found",
            RouteErrorKind::WriteFailed => "write failed",
            RouteErrorKind::UnsupportedCombination => "unsupported combination",
            RouteErrorKind::SessionWriteFailed => "session write failed",
            RouteErrorKind::SessionClosed => "session closed",
        };
        write!(f, "{}", text)
    }
}

/// Result of routing one client packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sent; the reply arrives through `on_backend_reply`
    Delivered,
    /// Not sent; `packet` goes to the client and the session continues
    Error { kind: RouteErrorKind, packet: Bytes },
    /// The session cannot continue; `packet` goes to the client, then the connection is closed
    SessionMustClose {
        kind: RouteErrorKind,
        packet: Bytes,
        message: String,
    },
}

impl RouteOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RouteOutcome::Delivered)
    }
}

/// How a backend failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Connection lost: try to replace the backend
    NewConnection,
    /// The error is for the client: close the backend and pass the error on
    ReplyClient,
}

/// Result of handling a backend failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// The reference was already closed; nothing was done
    PreviouslyHandled,
    /// The session continues; `client_reply` must be sent to the client if present
    Continue { client_reply: Option<Bytes> },
    /// The session cannot continue
    SessionMustClose { client_reply: Option<Bytes>, message: String },
}

impl ErrorOutcome {
    pub fn must_close(&self) -> bool {
        matches!(self, ErrorOutcome::SessionMustClose { .. })
    }
}

#[cfg(test)]
mod type_tests {
    use super::*;

    #[test]
    fn test_route_target_bits() {
        let target = RouteTarget::ALL | RouteTarget::MASTER;
        assert!(target.contains(RouteTarget::ALL));
        assert!(target.contains(RouteTarget::MASTER));
        assert!(!target.contains(RouteTarget::SLAVE));
        assert!(!target.contains(RouteTarget::UNDEFINED));
        assert_eq!(format!("{:?}", target), "MASTER|ALL");
        assert_eq!(format!("{:?}", RouteTarget::UNDEFINED), "UNDEFINED");
    }
}
