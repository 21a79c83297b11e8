//! MySQL Protocol Proxy
//!
//! Accepts MySQL/MariaDB clients, authenticates them against the proxy
//! credentials and runs each connection through a router session. Backend
//! connections are opened per session by [`TcpConnector`].

mod auth;
mod backend;
mod client;
pub mod protocol;
mod response;
mod server;

pub use auth::{scramble_password, HandshakeResponse, ServerGreeting};
pub use backend::{BackendEvent, BackendLogin, TcpConnector};
pub use protocol::{MySqlPacket, PacketCodec};
pub use response::ResponseTracker;
pub use server::ProxyServer;
