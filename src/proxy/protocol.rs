//! MySQL Wire Protocol Implementation
//!
//! Packet framing, command codes and the handful of server-side packets the
//! proxy builds itself (handshake, OK, ERR).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;

/// Largest payload a single packet can carry
pub const MAX_PAYLOAD_SIZE: usize = 0xff_ff_ff;

/// First payload byte of an OK packet
pub const OK_HEADER: u8 = 0x00;
/// First payload byte of an ERR packet
pub const ERR_HEADER: u8 = 0xff;
/// First payload byte of an EOF packet
pub const EOF_HEADER: u8 = 0xfe;
/// First payload byte of a LOCAL INFILE request
pub const LOCAL_INFILE_HEADER: u8 = 0xfb;

/// MySQL capability flags
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities the proxy advertises to clients and asks of backends
    ///
    /// No SSL and no DEPRECATE_EOF: result sets are always EOF terminated.
    pub const PROXY_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// MySQL command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// COM_SLEEP (0x00)
    Sleep,
    /// COM_QUIT (0x01)
    Quit,
    /// COM_INIT_DB (0x02)
    InitDb,
    /// COM_QUERY (0x03)
    Query,
    /// COM_FIELD_LIST (0x04)
    FieldList,
    /// COM_CREATE_DB (0x05)
    CreateDb,
    /// COM_DROP_DB (0x06)
    DropDb,
    /// COM_REFRESH (0x07)
    Refresh,
    /// COM_STATISTICS (0x09)
    Statistics,
    /// COM_PROCESS_INFO (0x0a)
    ProcessInfo,
    /// COM_PROCESS_KILL (0x0c)
    ProcessKill,
    /// COM_DEBUG (0x0d)
    Debug,
    /// COM_PING (0x0e)
    Ping,
    /// COM_CHANGE_USER (0x11)
    ChangeUser,
    /// COM_STMT_PREPARE (0x16)
    StmtPrepare,
    /// COM_STMT_EXECUTE (0x17)
    StmtExecute,
    /// COM_STMT_SEND_LONG_DATA (0x18)
    StmtSendLongData,
    /// COM_STMT_CLOSE (0x19)
    StmtClose,
    /// COM_STMT_RESET (0x1a)
    StmtReset,
    /// COM_SET_OPTION (0x1b)
    SetOption,
    /// COM_STMT_FETCH (0x1c)
    StmtFetch,
    /// Anything else
    Unknown(u8),
}

impl From<u8> for Command {
    fn from(cmd: u8) -> Self {
        match cmd {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x11 => Command::ChangeUser,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            _ => Command::Unknown(cmd),
        }
    }
}

impl Command {
    pub fn as_u8(self) -> u8 {
        match self {
            Command::Sleep => 0x00,
            Command::Quit => 0x01,
            Command::InitDb => 0x02,
            Command::Query => 0x03,
            Command::FieldList => 0x04,
            Command::CreateDb => 0x05,
            Command::DropDb => 0x06,
            Command::Refresh => 0x07,
            Command::Statistics => 0x09,
            Command::ProcessInfo => 0x0a,
            Command::ProcessKill => 0x0c,
            Command::Debug => 0x0d,
            Command::Ping => 0x0e,
            Command::ChangeUser => 0x11,
            Command::StmtPrepare => 0x16,
            Command::StmtExecute => 0x17,
            Command::StmtSendLongData => 0x18,
            Command::StmtClose => 0x19,
            Command::StmtReset => 0x1a,
            Command::SetOption => 0x1b,
            Command::StmtFetch => 0x1c,
            Command::Unknown(cmd) => cmd,
        }
    }

    /// Commands the server never answers
    pub fn expects_no_response(self) -> bool {
        matches!(self, Command::Quit | Command::StmtSendLongData | Command::StmtClose)
    }
}

/// MySQL packet header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes)
    pub length: u32,
    /// Sequence ID (1 byte)
    pub sequence_id: u8,
}

impl PacketHeader {
    pub fn read(data: &[u8]) -> io::Result<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Not enough data for header"));
        }

        let length = (data[0] as u32) | ((data[1] as u32) << 8) | ((data[2] as u32) << 16);
        let sequence_id = data[3];

        Ok(Self { length, sequence_id })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length & 0xff) as u8);
        buf.put_u8(((self.length >> 8) & 0xff) as u8);
        buf.put_u8(((self.length >> 16) & 0xff) as u8);
        buf.put_u8(self.sequence_id);
    }
}

/// MySQL packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlPacket {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl MySqlPacket {
    /// Create a new packet
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Command packet as sent by a client, sequence 0
    pub fn command(command: Command, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(data.len() + 1);
        payload.put_u8(command.as_u8());
        payload.extend_from_slice(data);
        Self::new(0, payload.freeze())
    }

    /// COM_QUERY packet
    pub fn query(sql: &str) -> Self {
        Self::command(Command::Query, sql.as_bytes())
    }

    /// Try to read one packet off the front of `src`
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        let header = PacketHeader::read(src).ok()?;
        let total_len = PACKET_HEADER_SIZE + header.length as usize;
        if src.len() < total_len {
            return None;
        }

        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(header.length as usize).freeze();

        Some(Self {
            sequence_id: header.sequence_id,
            payload,
        })
    }

    /// Parse a single packet from wire bytes
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let header = PacketHeader::read(data)?;
        let total_len = PACKET_HEADER_SIZE + header.length as usize;
        if data.len() < total_len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Not enough data for packet"));
        }
        Ok(Self::new(header.sequence_id, Bytes::copy_from_slice(&data[PACKET_HEADER_SIZE..total_len])))
    }

    /// Write packet to buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        PacketHeader {
            length: self.payload.len() as u32,
            sequence_id: self.sequence_id,
        }
        .write(buf);
        buf.extend_from_slice(&self.payload);
    }

    /// Wire bytes (header + payload)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Command byte, `None` for an empty packet
    pub fn command_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn command_type(&self) -> Option<Command> {
        self.command_byte().map(Command::from)
    }

    /// SQL text of COM_QUERY and COM_STMT_PREPARE packets
    pub fn sql(&self) -> Option<String> {
        match self.command_type()? {
            Command::Query | Command::StmtPrepare if self.payload.len() > 1 => {
                Some(String::from_utf8_lossy(&self.payload[1..]).into_owned())
            }
            _ => None,
        }
    }

    /// Database name of a COM_INIT_DB packet
    pub fn init_db(&self) -> Option<String> {
        match self.command_type()? {
            Command::InitDb if self.payload.len() > 1 => {
                Some(String::from_utf8_lossy(&self.payload[1..]).into_owned())
            }
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.payload.first() == Some(&OK_HEADER)
    }

    pub fn is_err(&self) -> bool {
        self.payload.first() == Some(&ERR_HEADER)
    }

    /// EOF packet (as opposed to a row starting with 0xfe)
    pub fn is_eof(&self) -> bool {
        self.payload.first() == Some(&EOF_HEADER) && self.payload.len() < 9
    }

    /// Error code and message of an ERR packet
    pub fn error_info(&self) -> Option<(u16, String)> {
        if !self.is_err() || self.payload.len() < 3 {
            return None;
        }
        let code = u16::from_le_bytes([self.payload[1], self.payload[2]]);
        let mut msg = &self.payload[3..];
        if msg.first() == Some(&b'#') && msg.len() >= 6 {
            msg = &msg[6..];
        }
        Some((code, String::from_utf8_lossy(msg).into_owned()))
    }
}

/// Framing codec for `tokio_util::codec::Framed`
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = MySqlPacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(MySqlPacket::decode(src))
    }
}

impl Encoder<MySqlPacket> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: MySqlPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Raw, already framed bytes
impl Encoder<Bytes> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Build an OK packet
pub fn build_ok_packet(sequence_id: u8, affected_rows: u64, last_insert_id: u64) -> MySqlPacket {
    let mut payload = BytesMut::new();
    payload.put_u8(OK_HEADER);
    write_lenenc_int(&mut payload, affected_rows);
    write_lenenc_int(&mut payload, last_insert_id);
    payload.put_u16_le(0x0002); // SERVER_STATUS_AUTOCOMMIT
    payload.put_u16_le(0); // warnings

    MySqlPacket::new(sequence_id, payload.freeze())
}

/// Build an error packet
pub fn build_error_packet(sequence_id: u8, error_code: u16, sql_state: &str, message: &str) -> MySqlPacket {
    let mut payload = BytesMut::new();
    payload.put_u8(ERR_HEADER);
    payload.put_u16_le(error_code);
    payload.put_u8(b'#'); // SQL state marker
    payload.extend_from_slice(sql_state.as_bytes());
    payload.extend_from_slice(message.as_bytes());

    MySqlPacket::new(sequence_id, payload.freeze())
}

/// Initial handshake packet (server -> client), protocol v10
pub fn build_handshake_packet(server_version: &str, connection_id: u32, scramble: &[u8; 20]) -> MySqlPacket {
    let mut payload = BytesMut::new();

    // Protocol version: 10
    payload.put_u8(10);

    // Server version string (null-terminated)
    payload.extend_from_slice(server_version.as_bytes());
    payload.put_u8(0);

    payload.put_u32_le(connection_id);

    // Auth-plugin-data-part-1 and filler
    payload.extend_from_slice(&scramble[..8]);
    payload.put_u8(0);

    let caps = capabilities::PROXY_CAPABILITIES;
    payload.put_u16_le((caps & 0xffff) as u16);

    // Character set: utf8_general_ci = 33
    payload.put_u8(33);

    // Server status: SERVER_STATUS_AUTOCOMMIT
    payload.put_u16_le(0x0002);

    payload.put_u16_le((caps >> 16) as u16);

    // Auth plugin data length: 8 + 12 + null
    payload.put_u8(21);

    // Reserved
    payload.extend_from_slice(&[0u8; 10]);

    payload.extend_from_slice(&scramble[8..]);
    payload.put_u8(0);

    payload.extend_from_slice(b"mysql_native_password\0");

    MySqlPacket::new(0, payload.freeze())
}

/// Write a length-encoded integer
pub fn write_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xfc);
        buf.put_u16_le(value as u16);
    } else if value < 16_777_216 {
        buf.put_u8(0xfd);
        buf.put_u8((value & 0xff) as u8);
        buf.put_u8(((value >> 8) & 0xff) as u8);
        buf.put_u8(((value >> 16) & 0xff) as u8);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(value);
    }
}

/// Read a length-encoded integer, returns (value, bytes consumed)
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0..=250 => Some((first as u64, 1)),
        0xfc if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xfd if data.len() >= 4 => Some(((data[1] as u64) | ((data[2] as u64) << 8) | ((data[3] as u64) << 16), 4)),
        0xfe if data.len() >= 9 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[1..9]);
            Some((u64::from_le_bytes(bytes), 9))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header() {
        let data = [0x05, 0x00, 0x00, 0x01]; // length=5, seq=1
        let header = PacketHeader::read(&data).unwrap();
        assert_eq!(header.length, 5);
        assert_eq!(header.sequence_id, 1);
        assert!(PacketHeader::read(&data[..3]).is_err());
    }

    #[test]
    fn test_codec_partial_frames() {
        let mut codec = PacketCodec;
        let wire = MySqlPacket::query("SELECT 1").to_bytes();

        let mut buf = BytesMut::from(&wire[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[6..]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.command_type(), Some(Command::Query));
        assert_eq!(packet.sql().as_deref(), Some("SELECT 1"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_error_packet() {
        let packet = build_error_packet(1, 1290, "HY000", "read only");
        assert!(packet.is_err());
        assert_eq!(packet.error_info(), Some((1290, "read only".to_string())));
        let wire = packet.to_bytes();
        assert_eq!(wire[3], 1);
        assert_eq!(&wire[8..13], b"HY000");
    }

    #[test]
    fn test_lenenc_int() {
        for value in [0u64, 250, 251, 65535, 65536, 16_777_216, u64::MAX] {
            let mut buf = BytesMut::new();
            write_lenenc_int(&mut buf, value);
            assert_eq!(read_lenenc_int(&buf), Some((value, buf.len())));
        }
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::from(0x16), Command::StmtPrepare);
        assert_eq!(Command::from(0x42), Command::Unknown(0x42));
        assert_eq!(Command::SetOption.as_u8(), 0x1b);
        assert!(Command::StmtClose.expects_no_response());
        assert!(!Command::Query.expects_no_response());
    }
}
