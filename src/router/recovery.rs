//! Backend failure handling

use bytes::Bytes;

use crate::backend::BackendId;
use crate::config::MasterFailureMode;

use super::route::{client_error, CR_SERVER_LOST};
use super::session::RouterSession;
use super::{BackendErrorKind, ErrorOutcome, RouteTarget};

fn lost_connection_error() -> Bytes {
    client_error(CR_SERVER_LOST, "HY000", "Lost connection to backend server.")
}

/// What a closed reference left behind
pub(super) struct FailedBackend {
    name: String,
    was_master: bool,
    /// The client is waiting for a reply only this backend could give
    client_waiting: bool,
    /// Statement to re-route when the read can be retried
    retry_stmt: Option<Bytes>,
}

impl RouterSession {
    /// Handle a lost or failed backend connection
    pub fn on_backend_error(&mut self, id: BackendId, kind: BackendErrorKind) -> ErrorOutcome {
        if self.closed {
            return ErrorOutcome::PreviouslyHandled;
        }
        match self.backends.get(id) {
            Some(bref) if !bref.is_closed() => {}
            _ => return ErrorOutcome::PreviouslyHandled,
        }

        let failed = self.fail_backend(id);
        tracing::warn!("Backend '{}' failed ({:?})", failed.name, kind);

        let fail_instantly = self.instance.config().master_failure_mode == MasterFailureMode::FailInstantly;
        if failed.was_master && fail_instantly {
            let client_reply = failed.client_waiting.then(lost_connection_error);
            self.close();
            return ErrorOutcome::SessionMustClose {
                client_reply,
                message: format!("Lost connection to the master server '{}', closing session.", failed.name),
            };
        }

        let client_reply = match kind {
            BackendErrorKind::ReplyClient => failed.client_waiting.then(lost_connection_error),
            BackendErrorKind::NewConnection => self.recover(failed),
        };

        if self.in_use_count() == 0 {
            self.close();
            return ErrorOutcome::SessionMustClose {
                client_reply,
                message: "No backend connections left, closing session.".into(),
            };
        }

        ErrorOutcome::Continue { client_reply }
    }

    /// A backend stopped answering; only a server the cluster considers down is given up
    pub fn on_backend_unresponsive(&mut self, id: BackendId) -> ErrorOutcome {
        let running = match self.backends.get(id) {
            Some(bref) if !bref.is_closed() => bref.server().is_running(),
            _ => return ErrorOutcome::PreviouslyHandled,
        };
        if running {
            return ErrorOutcome::Continue { client_reply: None };
        }
        self.on_backend_error(id, BackendErrorKind::NewConnection)
    }

    /// Close a backend whose session state diverged and try to replace it
    pub(super) fn evict_backend(&mut self, id: BackendId) -> Option<Bytes> {
        if self.backends[id].is_closed() {
            return None;
        }
        let failed = self.fail_backend(id);
        let client_reply = self.recover(failed);
        if self.in_use_count() == 0 {
            tracing::error!("No backend connections left after closing inconsistent backends");
            self.close();
        }
        client_reply
    }

    /// Close `id` as failed and record what the client was owed
    pub(super) fn fail_backend(&mut self, id: BackendId) -> FailedBackend {
        let was_master = self.master == Some(id);
        let bref = &self.backends[id];
        let position = bref.cursor().position;

        let sescmd_owed = bref.is_sescmd_active()
            && self
                .history
                .get(position)
                .map(|cmd| !cmd.is_replied() && cmd.forward_reply())
                .unwrap_or(false)
            && !self.backends.iter().any(|other| {
                other.id() != id
                    && other.is_in_use()
                    && other.is_sescmd_active()
                    && other.cursor().position <= position
            });
        let query_owed = bref.is_query_active();

        let bref = &mut self.backends[id];
        let retry_stmt = bref.take_stored_stmt().filter(|_| query_owed && !was_master);
        let name = bref.name().to_string();
        bref.close(true);

        if sescmd_owed {
            // Replacements replay the command; their reply must not reach the client
            if let Some(cmd) = self.history.get_mut(position) {
                cmd.suppress_reply();
            }
        }

        if self.forced_node == Some(id) {
            self.forced_node = None;
            self.forced_by_trx = false;
        }

        if was_master {
            tracing::warn!("Lost connection to master server '{}'", name);
        }

        FailedBackend {
            name,
            was_master,
            client_waiting: sescmd_owed || query_owed,
            retry_stmt,
        }
    }

    /// Replace the failed backend and retry or fail the statement it owed the client
    fn recover(&mut self, failed: FailedBackend) -> Option<Bytes> {
        if self.history.is_disabled() {
            tracing::info!(
                "Session command history is disabled, not replacing '{}'. {} connections remain.",
                failed.name,
                self.in_use_count()
            );
        } else if !self.select_connect_backend_servers(false) {
            tracing::warn!("Unable to find a replacement for '{}'", failed.name);
        }
        self.prune_history();

        if !failed.client_waiting {
            return None;
        }

        if let Some(stmt) = failed.retry_stmt {
            if let Some(target) = self.get_backend(RouteTarget::SLAVE, None, self.max_rlag) {
                tracing::info!(
                    "Retrying failed read from '{}' on '{}'",
                    failed.name,
                    self.backends[target].name()
                );
                if self.handle_got_target(target, stmt, true, true) {
                    return None;
                }
            }
        }

        Some(lost_connection_error())
    }
}
