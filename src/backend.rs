//! Backend References
//!
//! A [`BackendRef`] is one session's handle on one physical backend
//! connection. The router owns them in an arena indexed by [`BackendId`];
//! a failed reference is closed in place and a replacement gets a new id.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::server::ServerDescriptor;

/// Index of a reference in the session arena
pub type BackendId = usize;

/// Write side of a backend connection
///
/// `write` never blocks. It returns false when the connection is gone.
pub trait BackendConnection: Send {
    fn write(&mut self, packet: Bytes) -> bool;
    fn close(&mut self);
}

/// Connection that forwards writes into a tokio channel
///
/// The receiving end is a backend I/O task, or a test that wants to see
/// exactly what each backend was sent.
pub struct ChannelConnection {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ChannelConnection {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl BackendConnection for ChannelConnection {
    fn write(&mut self, packet: Bytes) -> bool {
        match &self.tx {
            Some(tx) => tx.send(packet).is_ok(),
            None => false,
        }
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Opens backend connections for a session
///
/// `connect` returns as soon as the connection is usable for writes; a
/// connection that turns out to be broken later reports through the
/// session's backend events under the same `id`.
pub trait Connector: Send {
    fn connect(&mut self, id: BackendId, server: &Arc<ServerDescriptor>) -> crate::Result<Box<dyn BackendConnection>>;
}

/// A configured server as seen by one router instance
#[derive(Debug)]
pub struct BackendServer {
    server: Arc<ServerDescriptor>,
    router_connections: AtomicUsize,
}

impl BackendServer {
    pub fn new(server: Arc<ServerDescriptor>) -> Self {
        Self {
            server,
            router_connections: AtomicUsize::new(0),
        }
    }

    pub fn server(&self) -> &Arc<ServerDescriptor> {
        &self.server
    }

    /// Connections this router currently holds to the server
    pub fn router_connections(&self) -> usize {
        self.router_connections.load(Ordering::Relaxed)
    }

    fn connection_opened(&self) {
        self.router_connections.fetch_add(1, Ordering::Relaxed);
        self.server.connection_opened();
    }

    fn connection_closed(&self) {
        let _ = self
            .router_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.server.connection_closed();
    }
}

/// Reference state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendState(u8);

impl BackendState {
    pub const IN_USE: BackendState = BackendState(0x01);
    pub const QUERY_ACTIVE: BackendState = BackendState(0x02);
    pub const CLOSED: BackendState = BackendState(0x04);
    pub const FATAL_FAILURE: BackendState = BackendState(0x08);

    pub fn contains(self, other: BackendState) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: BackendState) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: BackendState) {
        self.0 &= !other.0;
    }
}

/// Position of a reference in the session command history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SescmdCursor {
    /// Next history position this backend executes (or is executing when active)
    pub position: u64,
    /// A history entry has been written and its reply is outstanding
    pub active: bool,
}

/// One session's handle on a backend connection
pub struct BackendRef {
    id: BackendId,
    backend: Arc<BackendServer>,
    conn: Box<dyn BackendConnection>,
    state: BackendState,
    waiting: usize,
    cursor: SescmdCursor,
    pending: VecDeque<Bytes>,
    sescmd_replies: HashMap<u64, u8>,
    stored_stmt: Option<Bytes>,
}

impl BackendRef {
    /// Wrap a freshly opened connection; the reference starts IN_USE
    ///
    /// `history_position` is the position the next session command will get,
    /// so a new reference counts as caught up until history is replayed onto it.
    pub fn new(id: BackendId, backend: Arc<BackendServer>, conn: Box<dyn BackendConnection>, history_position: u64) -> Self {
        backend.connection_opened();
        Self {
            id,
            backend,
            conn,
            state: BackendState::IN_USE,
            waiting: 0,
            cursor: SescmdCursor {
                position: history_position,
                active: false,
            },
            pending: VecDeque::new(),
            sescmd_replies: HashMap::new(),
            stored_stmt: None,
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn backend(&self) -> &Arc<BackendServer> {
        &self.backend
    }

    pub fn server(&self) -> &Arc<ServerDescriptor> {
        self.backend.server()
    }

    pub fn name(&self) -> &str {
        self.backend.server().name()
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn is_in_use(&self) -> bool {
        self.state.contains(BackendState::IN_USE)
    }

    pub fn is_closed(&self) -> bool {
        self.state.contains(BackendState::CLOSED)
    }

    pub fn has_fatal_failure(&self) -> bool {
        self.state.contains(BackendState::FATAL_FAILURE)
    }

    pub fn is_query_active(&self) -> bool {
        self.state.contains(BackendState::QUERY_ACTIVE)
    }

    pub fn set_query_active(&mut self) {
        self.state.insert(BackendState::QUERY_ACTIVE);
    }

    pub fn clear_query_active(&mut self) {
        self.state.remove(BackendState::QUERY_ACTIVE);
    }

    /// Number of replies still expected
    pub fn waiting_results(&self) -> usize {
        self.waiting
    }

    pub fn is_waiting_result(&self) -> bool {
        self.waiting > 0
    }

    pub fn add_waiting_result(&mut self) {
        self.waiting += 1;
        self.server().operation_started();
    }

    pub fn finish_waiting_result(&mut self) {
        if self.waiting > 0 {
            self.waiting -= 1;
            self.server().operation_finished();
        }
    }

    /// Write wire bytes to the connection. Closed references refuse writes.
    pub fn write(&mut self, packet: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        self.conn.write(packet)
    }

    /// Close the reference; `fatal` marks it as failed
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self, fatal: bool) {
        if fatal {
            self.state.insert(BackendState::FATAL_FAILURE);
        }
        if self.is_closed() {
            return;
        }
        while self.waiting > 0 {
            self.finish_waiting_result();
        }
        self.state.remove(BackendState::IN_USE);
        self.state.remove(BackendState::QUERY_ACTIVE);
        self.state.insert(BackendState::CLOSED);
        self.conn.close();
        self.pending.clear();
        self.backend.connection_closed();
        tracing::debug!("Closed connection to '{}'", self.name());
    }

    pub fn cursor(&self) -> SescmdCursor {
        self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut SescmdCursor {
        &mut self.cursor
    }

    pub fn is_sescmd_active(&self) -> bool {
        self.cursor.active
    }

    /// Queue a statement until the session command cursor goes idle
    pub fn push_pending(&mut self, packet: Bytes) {
        self.pending.push_back(packet);
    }

    pub fn take_pending(&mut self) -> Option<Bytes> {
        self.pending.pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Reply status this backend gave for a history position
    pub fn sescmd_reply(&self, position: u64) -> Option<u8> {
        self.sescmd_replies.get(&position).copied()
    }

    pub fn record_sescmd_reply(&mut self, position: u64, status: u8) {
        self.sescmd_replies.insert(position, status);
    }

    /// Remove and return the status recorded for a history position
    pub fn take_sescmd_reply(&mut self, position: u64) -> Option<u8> {
        self.sescmd_replies.remove(&position)
    }

    pub fn store_stmt(&mut self, packet: Bytes) {
        self.stored_stmt = Some(packet);
    }

    pub fn take_stored_stmt(&mut self) -> Option<Bytes> {
        self.stored_stmt.take()
    }

    pub fn clear_stored_stmt(&mut self) {
        self.stored_stmt = None;
    }
}

impl std::fmt::Debug for BackendRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRef")
            .field("id", &self.id)
            .field("server", &self.name())
            .field("state", &self.state)
            .field("waiting", &self.waiting)
            .field("cursor", &self.cursor)
            .field("pending", &self.pending.len())
            .finish()
    }
}
