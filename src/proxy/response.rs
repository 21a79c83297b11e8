//! Backend response framing
//!
//! The router wants one complete response per statement. A backend sends a
//! response as a run of packets whose shape depends on the command that was
//! sent, so the tracker watches both directions: outgoing commands queue an
//! expectation, incoming packets are collected until the expectation is met.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use super::protocol::{
    read_lenenc_int, Command, MySqlPacket, ERR_HEADER, LOCAL_INFILE_HEADER, MAX_PAYLOAD_SIZE, OK_HEADER,
    PACKET_HEADER_SIZE,
};

/// SERVER_MORE_RESULTS_EXISTS status flag
const MORE_RESULTS_EXISTS: u16 = 0x0008;

/// Shape of the response a command gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// OK or ERR, or a result set for text and binary queries
    Query,
    /// Column definitions up to EOF
    FieldList,
    /// COM_STMT_PREPARE OK followed by parameter and column definitions
    Prepare,
    /// Rows up to EOF
    Fetch,
    /// Exactly one packet of any kind
    Single,
}

impl Expect {
    fn for_command(command: Command) -> Option<Self> {
        if command.expects_no_response() {
            return None;
        }
        Some(match command {
            Command::Query | Command::StmtExecute => Expect::Query,
            Command::FieldList => Expect::FieldList,
            Command::StmtPrepare => Expect::Prepare,
            Command::StmtFetch => Expect::Fetch,
            Command::Statistics => Expect::Single,
            _ => Expect::Query,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Waiting for the first packet of a response (or of the next result)
    Start,
    /// Waiting for `eofs` more EOF packets; the last EOF of a result set may announce another result
    Eofs { eofs: usize, result_set: bool },
}

/// Assembles backend packets into complete responses
#[derive(Debug)]
pub struct ResponseTracker {
    expected: VecDeque<Expect>,
    state: ReadState,
    current: BytesMut,
    /// The backend asked for a local file; outgoing packets are file data
    infile: bool,
    /// Last outgoing packet was a full-size fragment
    sent_fragment: bool,
    /// Last incoming packet was a full-size fragment
    recv_fragment: bool,
}

impl Default for ResponseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self {
            expected: VecDeque::new(),
            state: ReadState::Start,
            current: BytesMut::new(),
            infile: false,
            sent_fragment: false,
            recv_fragment: false,
        }
    }

    /// Responses still owed by the backend
    pub fn outstanding(&self) -> usize {
        self.expected.len()
    }

    pub fn is_waiting(&self) -> bool {
        !self.expected.is_empty()
    }

    /// Record wire bytes written to the backend
    pub fn on_sent(&mut self, mut wire: &[u8]) {
        while let Ok(packet) = MySqlPacket::parse(wire) {
            wire = &wire[PACKET_HEADER_SIZE + packet.payload.len()..];
            self.on_sent_packet(&packet);
        }
    }

    fn on_sent_packet(&mut self, packet: &MySqlPacket) {
        let continuation = self.sent_fragment;
        self.sent_fragment = packet.payload.len() == MAX_PAYLOAD_SIZE;
        if continuation {
            return;
        }

        if self.infile {
            if packet.payload.is_empty() {
                self.infile = false;
                self.expected.push_back(Expect::Single);
            }
            return;
        }

        if let Some(expect) = packet.command_type().and_then(Expect::for_command) {
            self.expected.push_back(expect);
        }
    }

    /// Feed one packet read from the backend; returns a response once it is complete
    pub fn on_packet(&mut self, packet: &MySqlPacket) -> Option<Bytes> {
        packet.encode(&mut self.current);

        let continuation = self.recv_fragment;
        self.recv_fragment = packet.payload.len() == MAX_PAYLOAD_SIZE;
        if continuation || self.recv_fragment {
            return None;
        }

        let expect = match self.expected.front() {
            Some(expect) => *expect,
            None => {
                tracing::debug!("Unsolicited packet from backend");
                return Some(self.current.split().freeze());
            }
        };

        if self.advance(expect, packet) {
            self.expected.pop_front();
            self.state = ReadState::Start;
            Some(self.current.split().freeze())
        } else {
            None
        }
    }

    /// Move the state machine; true when the response is complete
    fn advance(&mut self, expect: Expect, packet: &MySqlPacket) -> bool {
        let first = packet.payload.first().copied();

        match self.state {
            ReadState::Start => match expect {
                Expect::Single => true,
                _ if first == Some(ERR_HEADER) => true,
                Expect::Query => match first {
                    Some(OK_HEADER) => !ok_has_more_results(&packet.payload),
                    Some(LOCAL_INFILE_HEADER) => {
                        self.infile = true;
                        true
                    }
                    _ => {
                        self.state = ReadState::Eofs { eofs: 2, result_set: true };
                        false
                    }
                },
                Expect::FieldList => {
                    if packet.is_eof() {
                        return true;
                    }
                    self.state = ReadState::Eofs { eofs: 1, result_set: false };
                    false
                }
                Expect::Prepare => {
                    let (columns, params) = prepare_counts(&packet.payload);
                    let eofs = usize::from(columns > 0) + usize::from(params > 0);
                    if eofs == 0 {
                        return true;
                    }
                    self.state = ReadState::Eofs { eofs, result_set: false };
                    false
                }
                Expect::Fetch => {
                    if packet.is_eof() {
                        return true;
                    }
                    self.state = ReadState::Eofs { eofs: 1, result_set: false };
                    false
                }
            },
            ReadState::Eofs { eofs, result_set } => {
                if first == Some(ERR_HEADER) {
                    return true;
                }
                if !packet.is_eof() {
                    return false;
                }
                if eofs > 1 {
                    self.state = ReadState::Eofs { eofs: eofs - 1, result_set };
                    return false;
                }
                if result_set && eof_has_more_results(&packet.payload) {
                    self.state = ReadState::Start;
                    return false;
                }
                true
            }
        }
    }
}

fn ok_has_more_results(payload: &[u8]) -> bool {
    let mut offset = 1;
    for _ in 0..2 {
        match payload.get(offset..).and_then(read_lenenc_int) {
            Some((_, used)) => offset += used,
            None => return false,
        }
    }
    match payload.get(offset..offset + 2) {
        Some(status) => u16::from_le_bytes([status[0], status[1]]) & MORE_RESULTS_EXISTS != 0,
        None => false,
    }
}

fn eof_has_more_results(payload: &[u8]) -> bool {
    match payload.get(3..5) {
        Some(status) => u16::from_le_bytes([status[0], status[1]]) & MORE_RESULTS_EXISTS != 0,
        None => false,
    }
}

/// Column and parameter counts of a COM_STMT_PREPARE OK
fn prepare_counts(payload: &[u8]) -> (u16, u16) {
    match payload.get(5..9) {
        Some(counts) => (
            u16::from_le_bytes([counts[0], counts[1]]),
            u16::from_le_bytes([counts[2], counts[3]]),
        ),
        None => (0, 0),
    }
}
