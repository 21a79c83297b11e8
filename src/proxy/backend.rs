//! Backend Connections
//!
//! Every backend reference a session opens gets its own tokio task. The task
//! connects and logs in, then pumps packets: bytes the router writes arrive
//! over a channel and go out on the socket, complete responses come back to
//! the session task as [`BackendEvent`]s.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::backend::{BackendConnection, BackendId, ChannelConnection, Connector};
use crate::error::{Error, Result};
use crate::router::{BackendErrorKind, BackendReply};
use crate::server::ServerDescriptor;

use super::auth::{parse_auth_switch, scramble_password, HandshakeResponse, ServerGreeting, NATIVE_PASSWORD_PLUGIN};
use super::protocol::{capabilities, Command, MySqlPacket, PacketCodec};
use super::response::ResponseTracker;

/// Something a backend task reports to its session
#[derive(Debug)]
pub enum BackendEvent {
    /// A complete response
    Reply(BackendId, BackendReply),
    /// The connection failed or was closed by the server
    Error(BackendId, BackendErrorKind),
    /// A response is overdue
    Unresponsive(BackendId),
}

/// What a backend login needs
#[derive(Debug, Clone)]
pub struct BackendLogin {
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

/// Opens real TCP connections for one client session
pub struct TcpConnector {
    login: Arc<BackendLogin>,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl TcpConnector {
    pub fn new(login: BackendLogin, events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self {
            login: Arc::new(login),
            events,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, id: BackendId, server: &Arc<ServerDescriptor>) -> Result<Box<dyn BackendConnection>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no runtime for backend connection: {}", e)))?;

        let (conn, rx) = ChannelConnection::pair();
        let task = BackendTask {
            id,
            server: Arc::clone(server),
            login: Arc::clone(&self.login),
            events: self.events.clone(),
        };
        runtime.spawn(task.run(rx));

        tracing::debug!("Connecting backend {} to '{}' at {}", id, server.name(), server.socket_address());
        Ok(Box::new(conn))
    }
}

struct BackendTask {
    id: BackendId,
    server: Arc<ServerDescriptor>,
    login: Arc<BackendLogin>,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl BackendTask {
    async fn run(self, rx: mpsc::UnboundedReceiver<Bytes>) {
        match self.serve(rx).await {
            Ok(()) => tracing::debug!("Backend {} to '{}' closed", self.id, self.server.name()),
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!("Backend {} to '{}' failed: {}", self.id, self.server.name(), e);
                } else {
                    tracing::error!("Backend {} to '{}' failed: {}", self.id, self.server.name(), e);
                }
                let _ = self.events.send(BackendEvent::Error(self.id, BackendErrorKind::NewConnection));
            }
        }
    }

    async fn serve(&self, rx: mpsc::UnboundedReceiver<Bytes>) -> Result<()> {
        let address = self.server.socket_address();
        let stream = tokio::time::timeout(self.login.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::ConnectionTimeout(address.clone()))?
            .map_err(|e| Error::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, PacketCodec);
        tokio::time::timeout(self.login.connect_timeout, login(&mut framed, &self.login))
            .await
            .map_err(|_| Error::ConnectionTimeout(address.clone()))??;

        tracing::debug!("Backend {} logged in to '{}'", self.id, self.server.name());
        self.pump(framed, rx).await
    }

    /// Forward router writes and assemble responses until either side goes away
    async fn pump(&self, mut framed: Framed<TcpStream, PacketCodec>, mut rx: mpsc::UnboundedReceiver<Bytes>) -> Result<()> {
        let mut tracker = ResponseTracker::new();
        let read_timeout = self.login.read_timeout;

        loop {
            let overdue = read_timeout.filter(|_| tracker.is_waiting());

            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(wire) => {
                        tracker.on_sent(&wire);
                        framed.send(wire).await?;
                    }
                    None => {
                        // Reference closed by the session
                        let _ = framed.send(MySqlPacket::command(Command::Quit, &[])).await;
                        return Ok(());
                    }
                },
                incoming = framed.next() => match incoming {
                    Some(Ok(packet)) => {
                        if let Some(data) = tracker.on_packet(&packet) {
                            let reply = BackendReply::new(data);
                            if self.events.send(BackendEvent::Reply(self.id, reply)).is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(Error::ConnectionFailed {
                            address: self.server.socket_address(),
                            reason: "connection closed by server".into(),
                        })
                    }
                },
                _ = sleep_or_pending(overdue) => {
                    tracing::warn!(
                        "Backend '{}' has not answered in {:?}",
                        self.server.name(),
                        overdue.unwrap_or_default()
                    );
                    if self.events.send(BackendEvent::Unresponsive(self.id)).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Run the client side of the connection phase against a backend
async fn login(framed: &mut Framed<TcpStream, PacketCodec>, login: &BackendLogin) -> Result<()> {
    let greeting = next_packet(framed).await?;
    if greeting.is_err() {
        let (code, message) = greeting.error_info().unwrap_or((0, String::new()));
        return Err(Error::Protocol(format!("backend refused connection: {} {}", code, message)));
    }
    let greeting = ServerGreeting::parse(&greeting.payload)
        .ok_or_else(|| Error::Protocol("invalid backend handshake".into()))?;

    tracing::trace!("Backend server version {}", greeting.server_version);

    let mut caps = capabilities::PROXY_CAPABILITIES & greeting.capabilities;
    if login.database.is_some() {
        caps |= capabilities::CLIENT_CONNECT_WITH_DB;
    } else {
        caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
    }

    let response = HandshakeResponse {
        capabilities: caps,
        max_packet_size: 16 * 1024 * 1024,
        charset: 33,
        username: login.user.clone(),
        auth_response: scramble_password(&login.password, &greeting.scramble),
        database: login.database.clone(),
        auth_plugin: Some(NATIVE_PASSWORD_PLUGIN.to_string()),
    };
    framed.send(response.encode(1)).await?;

    let mut reply = next_packet(framed).await?;
    if let Some((plugin, scramble)) = parse_auth_switch(&reply.payload) {
        if plugin != NATIVE_PASSWORD_PLUGIN {
            return Err(Error::Protocol(format!("unsupported authentication plugin '{}'", plugin)));
        }
        let token = scramble_password(&login.password, &scramble);
        framed.send(MySqlPacket::new(reply.sequence_id.wrapping_add(1), token)).await?;
        reply = next_packet(framed).await?;
    }

    if reply.is_ok() {
        Ok(())
    } else if let Some((code, message)) = reply.error_info() {
        tracing::error!("Backend authentication failed: {} {}", code, message);
        Err(Error::Auth(login.user.clone()))
    } else {
        Err(Error::Protocol("expected OK packet from backend".into()))
    }
}

async fn next_packet(framed: &mut Framed<TcpStream, PacketCodec>) -> Result<MySqlPacket> {
    match framed.next().await {
        Some(packet) => Ok(packet?),
        None => Err(Error::Protocol("backend closed the connection during login".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::auth::generate_scramble;
    use crate::proxy::protocol::{build_handshake_packet, build_ok_packet};
    use crate::server::ServerRole;
    use tokio::net::TcpListener;

    fn login_config(read_timeout: Option<Duration>) -> BackendLogin {
        BackendLogin {
            user: "app".into(),
            password: "secret".into(),
            database: Some("shop".into()),
            connect_timeout: Duration::from_secs(5),
            read_timeout,
        }
    }

    /// Minimal server: greets, checks the login and answers every query with OK
    async fn fake_backend(listener: TcpListener, answer: bool) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec);
        let scramble = generate_scramble();
        framed.send(build_handshake_packet("10.6.0-test", 7, &scramble)).await.unwrap();

        let response = framed.next().await.unwrap().unwrap();
        let response = HandshakeResponse::parse(&response.payload).unwrap();
        assert_eq!(response.username, "app");
        assert_eq!(response.database.as_deref(), Some("shop"));
        assert_eq!(response.auth_response, scramble_password("secret", &scramble));
        framed.send(build_ok_packet(2, 0, 0)).await.unwrap();

        while let Some(Ok(packet)) = framed.next().await {
            if packet.command_type() == Some(Command::Quit) {
                break;
            }
            if answer {
                framed.send(build_ok_packet(1, 1, 0)).await.unwrap();
            }
        }
    }

    async fn server_on(listener: &TcpListener) -> Arc<ServerDescriptor> {
        let addr = listener.local_addr().unwrap();
        Arc::new(ServerDescriptor::new("db1", addr.ip().to_string(), addr.port(), ServerRole::Master))
    }

    #[tokio::test]
    async fn test_connect_and_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = server_on(&listener).await;
        let backend = tokio::spawn(fake_backend(listener, true));

        let (tx, mut events) = mpsc::unbounded_channel();
        let mut connector = TcpConnector::new(login_config(None), tx);
        let mut conn = connector.connect(3, &server).unwrap();
        assert!(conn.write(MySqlPacket::query("UPDATE t SET a = 1").to_bytes()));

        match events.recv().await.unwrap() {
            BackendEvent::Reply(id, reply) => {
                assert_eq!(id, 3);
                assert_eq!(reply.status(), 0x00);
            }
            other => panic!("unexpected event {:?}", other),
        }

        conn.close();
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = server_on(&listener).await;
        drop(listener);

        let (tx, mut events) = mpsc::unbounded_channel();
        let mut connector = TcpConnector::new(login_config(None), tx);
        let _conn = connector.connect(0, &server).unwrap();

        match events.recv().await.unwrap() {
            BackendEvent::Error(0, BackendErrorKind::NewConnection) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_backend_is_unresponsive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = server_on(&listener).await;
        let _backend = tokio::spawn(fake_backend(listener, false));

        let (tx, mut events) = mpsc::unbounded_channel();
        let mut connector = TcpConnector::new(login_config(Some(Duration::from_millis(50))), tx);
        let mut conn = connector.connect(1, &server).unwrap();
        assert!(conn.write(MySqlPacket::query("SELECT SLEEP(10)").to_bytes()));

        match events.recv().await.unwrap() {
            BackendEvent::Unresponsive(1) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_connect_needs_runtime() {
        let (tx, _events) = mpsc::unbounded_channel();
        let mut connector = TcpConnector::new(login_config(None), tx);
        let server = Arc::new(ServerDescriptor::new("db1", "127.0.0.1", 1, ServerRole::Master));
        assert!(connector.connect(0, &server).is_err());
    }
}
