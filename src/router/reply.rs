//! Backend reply processing

use bytes::Bytes;

use crate::backend::BackendId;
use crate::proxy::protocol::{ERR_HEADER, PACKET_HEADER_SIZE};

use super::session::RouterSession;

/// One complete response from a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    data: Bytes,
    status: u8,
}

impl BackendReply {
    /// `data` is the full wire response; its first payload byte is the status
    pub fn new(data: Bytes) -> Self {
        let status = data.get(PACKET_HEADER_SIZE).copied().unwrap_or(0);
        Self { data, status }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn is_err(&self) -> bool {
        self.status == ERR_HEADER
    }
}

impl RouterSession {
    /// Handle a complete response from backend `id`
    ///
    /// Returns the bytes to forward to the client, if any. Replies from
    /// closed references are dropped.
    pub fn on_backend_reply(&mut self, id: BackendId, reply: BackendReply) -> Option<Bytes> {
        if self.closed {
            return None;
        }
        match self.backends.get(id) {
            Some(bref) if bref.is_in_use() => {}
            _ => {
                tracing::debug!("Dropping reply from closed backend {}", id);
                return None;
            }
        }

        if self.backends[id].is_sescmd_active() {
            return self.process_sescmd_reply(id, reply);
        }

        let bref = &mut self.backends[id];
        bref.clear_query_active();
        bref.finish_waiting_result();
        bref.clear_stored_stmt();
        Some(reply.data)
    }

    /// Reply to the history entry at the cursor of `id`
    fn process_sescmd_reply(&mut self, id: BackendId, reply: BackendReply) -> Option<Bytes> {
        let position = self.backends[id].cursor().position;
        let status = reply.status();
        let authoritative = !self.master_in_use() || self.master == Some(id);
        let mut forward = None;
        let mut diverged: Vec<(BackendId, u8, u8)> = Vec::new();

        match self.history.get(position).map(|cmd| cmd.reply_status()) {
            None => {
                tracing::error!(
                    "Reply from '{}' to unknown session command {}",
                    self.backends[id].name(),
                    position
                );
            }
            Some(Some(expected)) => {
                // The client already has its reply; this one only has to agree
                if expected != status {
                    diverged.push((id, expected, status));
                }
            }
            Some(None) if authoritative => {
                if let Some(cmd) = self.history.get_mut(position) {
                    cmd.mark_replied(status);
                    if cmd.forward_reply() {
                        forward = Some(reply.data);
                    }
                }
                tracing::debug!(
                    "Server '{}' responded to a session command, sending the response to the client.",
                    self.backends[id].name()
                );

                for other in self.in_use_ids() {
                    if other == id {
                        continue;
                    }
                    if let Some(got) = self.backends[other].take_sescmd_reply(position) {
                        if got != status {
                            diverged.push((other, status, got));
                        }
                    }
                }
            }
            Some(None) => {
                let bref = &mut self.backends[id];
                bref.record_sescmd_reply(position, status);
                tracing::debug!(
                    "Slave '{}' responded before master to a session command. Result: {:#04x}",
                    bref.name(),
                    status
                );
                if reply.is_err() {
                    tracing::error!("Slave '{}' failed to execute session command.", bref.name());
                }
            }
        }

        let evict_self = diverged.iter().any(|(evicted, _, _)| *evicted == id);
        let bref = &mut self.backends[id];
        bref.finish_waiting_result();
        if !evict_self {
            if !self.history.advance(bref) {
                tracing::error!("Failed to continue session command history on '{}'", bref.name());
            } else if !bref.is_sescmd_active() {
                while let Some(packet) = bref.take_pending() {
                    if !bref.write(packet) {
                        tracing::error!("Routing queued query to '{}' failed.", bref.name());
                        break;
                    }
                }
            }
        }

        let mut client_reply = None;
        for (evicted, expected, got) in diverged {
            tracing::warn!(
                "Server '{}' returned {:#04x} to a session command when {:#04x} was expected. \
                 Closing the connection due to inconsistent session state.",
                self.backends[evicted].name(),
                got,
                expected
            );
            if let Some(error) = self.evict_backend(evicted) {
                client_reply.get_or_insert(error);
            }
        }

        self.prune_history();
        forward.or(client_reply)
    }
}
