//! Session Command History
//!
//! Statements that change session state (SET, USE, PREPARE, ...) have to run
//! on every backend of a session, and again on every backend that joins the
//! session later. They are kept here in arrival order, each with a position
//! that never repeats within the session.
//!
//! Every backend walks the history with its own cursor: the entry at the
//! cursor is written, its reply moves the cursor on and writes the next
//! entry, until the cursor runs off the end and goes idle.

use bytes::Bytes;
use std::collections::VecDeque;

use crate::backend::BackendRef;

/// One recorded session command
#[derive(Debug, Clone)]
pub struct SessionCommand {
    packet: Bytes,
    command: u8,
    position: u64,
    replied: bool,
    reply_status: u8,
    forward_reply: bool,
}

impl SessionCommand {
    /// Wire bytes of the statement
    pub fn packet(&self) -> &Bytes {
        &self.packet
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// The client already got its reply for this command
    pub fn is_replied(&self) -> bool {
        self.replied
    }

    /// Status byte of the reply sent to the client
    pub fn reply_status(&self) -> Option<u8> {
        self.replied.then_some(self.reply_status)
    }

    /// The client expects the backend reply (false when it got a synthesized error)
    pub fn forward_reply(&self) -> bool {
        self.forward_reply
    }

    pub fn mark_replied(&mut self, status: u8) {
        self.replied = true;
        self.reply_status = status;
    }

    /// The client was answered some other way; don't forward the backend reply
    pub fn suppress_reply(&mut self) {
        self.forward_reply = false;
    }
}

/// Ordered log of session commands
#[derive(Debug)]
pub struct SescmdHistory {
    entries: VecDeque<SessionCommand>,
    next_position: u64,
    recorded: usize,
    limit: Option<usize>,
    disabled: bool,
    limit_exceeded: bool,
}

impl SescmdHistory {
    /// `limit` is the number of commands after which history is given up
    pub fn new(limit: Option<usize>, disabled: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            next_position: 1,
            recorded: 0,
            limit,
            disabled,
            limit_exceeded: false,
        }
    }

    /// Record a command and return its position
    pub fn append(&mut self, packet: Bytes, command: u8, forward_reply: bool) -> u64 {
        if let Some(limit) = self.limit {
            if !self.disabled && self.recorded >= limit {
                tracing::warn!(
                    "Router session exceeded session command history limit of {}. \
                     Slave recovery is disabled and only slave servers with consistent \
                     session state are used for the duration of the session.",
                    limit
                );
                self.disabled = true;
                self.limit_exceeded = true;
            }
        }

        let position = self.next_position;
        self.next_position += 1;
        self.recorded += 1;
        self.entries.push_back(SessionCommand {
            packet,
            command,
            position,
            replied: false,
            reply_status: 0,
            forward_reply,
        });
        position
    }

    fn index_of(&self, position: u64) -> Option<usize> {
        let first = self.entries.front()?.position;
        if position < first {
            return None;
        }
        let index = (position - first) as usize;
        (index < self.entries.len()).then_some(index)
    }

    pub fn get(&self, position: u64) -> Option<&SessionCommand> {
        self.index_of(position).and_then(|i| self.entries.get(i))
    }

    pub fn get_mut(&mut self, position: u64) -> Option<&mut SessionCommand> {
        self.index_of(position).and_then(move |i| self.entries.get_mut(i))
    }

    /// Position of the oldest command still stored
    pub fn oldest_position(&self) -> u64 {
        self.entries.front().map(|c| c.position).unwrap_or(self.next_position)
    }

    /// Position the next appended command will get
    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    /// Commands currently stored
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Commands recorded over the whole session
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// History is no longer kept for replay
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// The configured limit was hit during this session
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    /// Drop commands below `position`, which every backend has executed
    ///
    /// Only a disabled history forgets anything.
    pub fn prune(&mut self, position: u64) {
        if !self.disabled {
            return;
        }
        while matches!(self.entries.front(), Some(c) if c.position < position) {
            self.entries.pop_front();
        }
    }

    /// Write the command at the cursor of `bref`, or idle the cursor if there is none
    pub fn execute(&self, bref: &mut BackendRef) -> bool {
        let position = bref.cursor().position;
        match self.get(position) {
            Some(cmd) => {
                bref.cursor_mut().active = true;
                let ok = bref.write(cmd.packet.clone());
                if !ok {
                    tracing::info!("Backend '{}' failed to execute session command", bref.name());
                }
                ok
            }
            None => {
                bref.cursor_mut().active = false;
                true
            }
        }
    }

    /// Rewind the cursor of `bref` to the oldest command and start replaying
    pub fn replay_onto(&self, bref: &mut BackendRef) -> bool {
        bref.cursor_mut().position = self.oldest_position();
        bref.cursor_mut().active = false;
        if self.is_empty() {
            return true;
        }
        tracing::debug!(
            "Replaying {} session commands on '{}'",
            self.len(),
            bref.name()
        );
        self.execute(bref)
    }

    /// Move the cursor of `bref` past its current command and write the next one
    pub fn advance(&self, bref: &mut BackendRef) -> bool {
        bref.cursor_mut().position += 1;
        self.execute(bref)
    }
}
