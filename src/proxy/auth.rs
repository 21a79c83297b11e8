//! Connection phase packets and mysql_native_password
//!
//! The proxy terminates client authentication itself and logs in to every
//! backend with the configured proxy credentials.

use bytes::{BufMut, BytesMut};
use rand::Rng;
use sha1::{Digest, Sha1};

use super::protocol::capabilities::*;
use super::protocol::{read_lenenc_int, MySqlPacket};

/// The only authentication plugin the proxy speaks
pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// First payload byte of an auth switch request
pub const AUTH_SWITCH_HEADER: u8 = 0xfe;

/// Bounds-checked reader over a packet payload
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// NUL terminated string; a missing terminator takes the rest
    fn cstr(&mut self) -> String {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(self.data.len());
        let text = String::from_utf8_lossy(&self.data[..end]).into_owned();
        self.data = &self.data[(end + 1).min(self.data.len())..];
        text
    }

    fn lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let (len, used) = read_lenenc_int(self.data)?;
        self.take(used)?;
        self.take(len as usize)
    }
}

/// Initial handshake sent by a backend server
#[derive(Debug, Clone)]
pub struct ServerGreeting {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub scramble: Vec<u8>,
    pub auth_plugin: String,
}

impl ServerGreeting {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = Reader::new(payload);
        if r.u8()? != 10 {
            return None;
        }
        let server_version = r.cstr();
        let connection_id = r.u32_le()?;
        let mut scramble = r.take(8)?.to_vec();
        r.take(1)?;
        let caps_low = r.u16_le()? as u32;
        let mut capabilities = caps_low;
        let mut auth_plugin = NATIVE_PASSWORD_PLUGIN.to_string();

        if !r.is_empty() {
            let _charset = r.u8()?;
            let _status = r.u16_le()?;
            capabilities |= (r.u16_le()? as u32) << 16;
            let data_len = r.u8()? as usize;
            r.take(10)?;
            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let len = data_len.saturating_sub(8).max(13);
                let part2 = r.take(len.min(r.data.len()))?;
                let end = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
                scramble.extend_from_slice(&part2[..end]);
            }
            if capabilities & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
                auth_plugin = r.cstr();
            }
        }

        Some(Self {
            server_version,
            connection_id,
            capabilities,
            scramble,
            auth_plugin,
        })
    }
}

/// Handshake response sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

impl HandshakeResponse {
    /// Parse a protocol 4.1 handshake response
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = Reader::new(payload);
        let capabilities = r.u32_le()?;
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return None;
        }
        let max_packet_size = r.u32_le()?;
        let charset = r.u8()?;
        r.take(23)?;
        let username = r.cstr();

        let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.lenenc_bytes()?.to_vec()
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8()? as usize;
            r.take(len)?.to_vec()
        } else {
            r.cstr().into_bytes()
        };

        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
            Some(r.cstr()).filter(|db| !db.is_empty())
        } else {
            None
        };

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            Some(r.cstr())
        } else {
            None
        };

        Some(Self {
            capabilities,
            max_packet_size,
            charset,
            username,
            auth_response,
            database,
            auth_plugin,
        })
    }

    /// The client sent an SSL request instead of a full response
    pub fn is_ssl_request(payload: &[u8]) -> bool {
        payload.len() == 32
            && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) & CLIENT_SSL != 0
    }

    pub fn encode(&self, sequence_id: u8) -> MySqlPacket {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.capabilities);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.charset);
        buf.extend_from_slice(&[0u8; 23]);
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capabilities & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(db) = &self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin.as_deref().unwrap_or(NATIVE_PASSWORD_PLUGIN).as_bytes());
            buf.put_u8(0);
        }

        MySqlPacket::new(sequence_id, buf.freeze())
    }
}

/// Plugin name and scramble of an auth switch request
pub fn parse_auth_switch(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let mut r = Reader::new(payload);
    if r.u8()? != AUTH_SWITCH_HEADER {
        return None;
    }
    let plugin = r.cstr();
    let rest = r.take(r.data.len())?;
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    Some((plugin, rest[..end].to_vec()))
}

/// 20 random printable bytes for the client handshake
pub fn generate_scramble() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; 20];
    for byte in scramble.iter_mut() {
        *byte = rng.gen_range(0x21..0x7f);
    }
    scramble
}

/// mysql_native_password token: SHA1(pw) XOR SHA1(scramble + SHA1(SHA1(pw)))
pub fn scramble_password(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let mix = hasher.finalize();

    stage1.iter().zip(mix.iter()).map(|(a, b)| a ^ b).collect()
}

/// Check a client token against the expected password
pub fn verify_native_password(password: &str, scramble: &[u8], token: &[u8]) -> bool {
    scramble_password(password, scramble) == token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::protocol::build_handshake_packet;

    #[test]
    fn test_greeting_round_trip() {
        let scramble = generate_scramble();
        let packet = build_handshake_packet("10.6.0-test", 42, &scramble);
        let greeting = ServerGreeting::parse(&packet.payload).unwrap();
        assert_eq!(greeting.server_version, "10.6.0-test");
        assert_eq!(greeting.connection_id, 42);
        assert_eq!(greeting.scramble, scramble.to_vec());
        assert_eq!(greeting.auth_plugin, NATIVE_PASSWORD_PLUGIN);
        assert_ne!(greeting.capabilities & CLIENT_PROTOCOL_41, 0);
    }

    #[test]
    fn test_handshake_response_with_db() {
        let scramble = generate_scramble();
        let response = HandshakeResponse {
            capabilities: PROXY_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            charset: 33,
            username: "app".into(),
            auth_response: scramble_password("secret", &scramble),
            database: Some("shop".into()),
            auth_plugin: Some(NATIVE_PASSWORD_PLUGIN.into()),
        };
        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();
        assert_eq!(parsed, response);
        assert!(verify_native_password("secret", &scramble, &parsed.auth_response));
        assert!(!verify_native_password("wrong", &scramble, &parsed.auth_response));
    }

    #[test]
    fn test_truncated_response() {
        assert!(HandshakeResponse::parse(&[0x00, 0x02]).is_none());
        let mut payload = PROXY_CAPABILITIES.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 10]);
        assert!(HandshakeResponse::parse(&payload).is_none());
    }

    #[test]
    fn test_empty_password() {
        assert!(scramble_password("", b"12345678901234567890").is_empty());
        assert!(verify_native_password("", b"12345678901234567890", &[]));
    }

    #[test]
    fn test_auth_switch() {
        let mut payload = vec![AUTH_SWITCH_HEADER];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(b"abcdefghijklmnopqrst\0");
        let (plugin, data) = parse_auth_switch(&payload).unwrap();
        assert_eq!(plugin, NATIVE_PASSWORD_PLUGIN);
        assert_eq!(data, b"abcdefghijklmnopqrst".to_vec());
    }
}
