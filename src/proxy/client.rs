//! Client Sessions
//!
//! One task per client connection. It authenticates the client, opens a
//! [`RouterSession`] and then waits on two sources: packets from the client
//! go through `route_query`, events from the backend tasks go through
//! `on_backend_reply` / `on_backend_error`. Whatever the router hands back
//! for the client is written out in order.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::router::{ErrorOutcome, RouteOutcome, RouterInstance, RouterSession};

use super::auth::{generate_scramble, verify_native_password, HandshakeResponse, NATIVE_PASSWORD_PLUGIN};
use super::backend::{BackendEvent, BackendLogin, TcpConnector};
use super::protocol::{build_error_packet, build_handshake_packet, build_ok_packet, Command, MySqlPacket, PacketCodec};

const ER_ACCESS_DENIED: u16 = 1045;
const ER_HANDSHAKE_ERROR: u16 = 1043;
const ER_CONNECTION_FAILED: u16 = 2003;

type ClientStream = Framed<TcpStream, PacketCodec>;

/// Drive one client connection until either side closes it
pub async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    connection_id: u32,
    instance: Arc<RouterInstance>,
    config: Arc<ProxyConfig>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut client = Framed::new(stream, PacketCodec);

    let handshake = match authenticate(&mut client, connection_id, &config).await? {
        Some(handshake) => handshake,
        None => return Ok(()),
    };
    tracing::info!(
        "Client {} ({}) authenticated as '{}'{}",
        connection_id,
        peer,
        handshake.username,
        handshake.database.as_deref().map(|db| format!(" using '{}'", db)).unwrap_or_default()
    );

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let login = BackendLogin {
        user: config.user.clone(),
        password: config.password.clone(),
        database: handshake.database.clone(),
        connect_timeout: config.connect_timeout(),
        read_timeout: config.backend_read_timeout(),
    };
    let connector = TcpConnector::new(login, events_tx);

    let mut session = match RouterSession::new(
        instance,
        Box::new(connector),
        handshake.capabilities,
        handshake.database.clone(),
    ) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Client {}: {}", connection_id, e);
            let error = build_error_packet(2, ER_CONNECTION_FAILED, "HY000", &e.to_string());
            client.send(error).await?;
            return Ok(());
        }
    };

    client.send(build_ok_packet(2, 0, 0)).await?;

    let result = serve(&mut client, &mut session, &mut events, connection_id).await;
    session.close();
    tracing::debug!("Client {} ({}) disconnected", connection_id, peer);
    result
}

/// Server side of the connection phase; `None` when the client was turned away
async fn authenticate(
    client: &mut ClientStream,
    connection_id: u32,
    config: &ProxyConfig,
) -> Result<Option<HandshakeResponse>> {
    let scramble = generate_scramble();
    client
        .send(build_handshake_packet(&config.server_version, connection_id, &scramble))
        .await?;

    let packet = match client.next().await {
        Some(packet) => packet?,
        None => return Ok(None),
    };

    if HandshakeResponse::is_ssl_request(&packet.payload) {
        let error = build_error_packet(packet.sequence_id.wrapping_add(1), ER_HANDSHAKE_ERROR, "08S01", "SSL is not supported");
        client.send(error).await?;
        return Ok(None);
    }

    let response = match HandshakeResponse::parse(&packet.payload) {
        Some(response) => response,
        None => {
            let error = build_error_packet(packet.sequence_id.wrapping_add(1), ER_HANDSHAKE_ERROR, "08S01", "Bad handshake");
            client.send(error).await?;
            return Err(Error::Protocol("malformed handshake response".into()));
        }
    };

    let plugin_ok = response
        .auth_plugin
        .as_deref()
        .map(|plugin| plugin.is_empty() || plugin == NATIVE_PASSWORD_PLUGIN)
        .unwrap_or(true);

    if !plugin_ok
        || response.username != config.user
        || !verify_native_password(&config.password, &scramble, &response.auth_response)
    {
        tracing::warn!("Client {}: access denied for user '{}'", connection_id, response.username);
        let message = format!(
            "Access denied for user '{}' (using password: {})",
            response.username,
            if response.auth_response.is_empty() { "NO" } else { "YES" }
        );
        let error = build_error_packet(packet.sequence_id.wrapping_add(1), ER_ACCESS_DENIED, "28000", &message);
        client.send(error).await?;
        return Ok(None);
    }

    Ok(Some(response))
}

/// Command phase
async fn serve(
    client: &mut ClientStream,
    session: &mut RouterSession,
    events: &mut mpsc::UnboundedReceiver<BackendEvent>,
    connection_id: u32,
) -> Result<()> {
    loop {
        tokio::select! {
            packet = client.next() => {
                let packet = match packet {
                    Some(packet) => packet?,
                    None => return Ok(()),
                };
                let quit = !session.is_load_active() && packet.command_type() == Some(Command::Quit);

                match session.route_query(packet) {
                    RouteOutcome::Delivered => {}
                    RouteOutcome::Error { kind, packet } => {
                        tracing::debug!("Client {}: routing failed ({})", connection_id, kind);
                        send_raw(client, packet).await?;
                    }
                    RouteOutcome::SessionMustClose { kind, packet, message } => {
                        tracing::error!("Client {}: {} ({})", connection_id, message, kind);
                        send_raw(client, packet).await?;
                        return Ok(());
                    }
                }
                if quit {
                    return Ok(());
                }
            }
            Some(event) = events.recv() => {
                let (client_reply, must_close) = match event {
                    BackendEvent::Reply(id, reply) => (session.on_backend_reply(id, reply), false),
                    BackendEvent::Error(id, kind) => error_outcome(session.on_backend_error(id, kind), connection_id),
                    BackendEvent::Unresponsive(id) => error_outcome(session.on_backend_unresponsive(id), connection_id),
                };
                if let Some(reply) = client_reply {
                    send_raw(client, reply).await?;
                }
                if must_close {
                    return Ok(());
                }
            }
        }

        if session.is_closed() {
            tracing::warn!("Client {}: router session closed", connection_id);
            return Ok(());
        }
    }
}

fn error_outcome(outcome: ErrorOutcome, connection_id: u32) -> (Option<Bytes>, bool) {
    match outcome {
        ErrorOutcome::PreviouslyHandled => (None, false),
        ErrorOutcome::Continue { client_reply } => (client_reply, false),
        ErrorOutcome::SessionMustClose { client_reply, message } => {
            tracing::error!("Client {}: {}", connection_id, message);
            (client_reply, true)
        }
    }
}

async fn send_raw(client: &mut ClientStream, data: Bytes) -> Result<()> {
    client.send(data).await?;
    Ok(())
}
