//! WolfSplit - Read/Write Splitting Router for MariaDB
//!
//! A MySQL protocol proxy that sits in front of a replicated MariaDB
//! cluster and splits the statement stream of every client session: writes
//! and transactions go to the master, reads are spread over the slaves, and
//! statements that change session state are run on every backend the
//! session holds.
//!
//! # Architecture
//!
//! - [`router`] holds the routing core. A [`router::RouterInstance`] is
//!   shared by all sessions; each client gets a [`router::RouterSession`]
//!   that picks backends, keeps the session command history and recovers
//!   from backend failures. It does no I/O.
//! - [`proxy`] is the tokio side: the MySQL listener, client
//!   authentication and one task per backend connection.
//! - [`classifier`] and [`hint`] turn SQL text into query type bits and
//!   routing hints.
//! - [`server`] describes the configured servers; a cluster monitor updates
//!   their state through the [`api`].
//!
//! # Features
//!
//! - Slave selection by connections, operations or replication lag, with weights
//! - Session command replay onto replacement backends
//! - Read-only transaction pinning and multi-statement master locking
//! - Temporary table tracking
//! - Configurable behaviour on master loss
//! - HTTP API for status and server updates

pub mod api;
pub mod backend;
pub mod classifier;
pub mod config;
pub mod error;
pub mod hint;
pub mod proxy;
pub mod router;
pub mod server;

pub use config::WolfSplitConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfSplitConfig;
    pub use crate::error::{Error, Result};
    pub use crate::router::{RouteOutcome, RouterInstance, RouterSession};
    pub use crate::server::{ServerDescriptor, ServerRegistry, ServerRole};
}
