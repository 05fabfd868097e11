//! Connection handshake: greeting, optional TLS upgrade, client response
//! and the authentication exchange.
//!
//! ```text
//! AwaitingGreeting -> [SslRequest -> TLS] -> ClientResponse
//!     -> AuthResult { AuthSwitch | MoreData }* -> Authenticated | Failed
//! ```

#![allow(clippy::cast_possible_truncation)]

use mywire_core::Result;
use mywire_core::error::ConnectionErrorKind;

use crate::auth::{self, caching_sha2, plugins};
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{
    auth_failed, auth_plugin_error, connection_error, greeting_rejected, protocol_error,
    protocol_error_with_data,
};
use crate::protocol::{
    ErrPacket, MAX_PACKET_SIZE, PacketReader, PacketWriter, StatusFlags, capabilities,
};
use crate::tls::{validate_ssl_mode, write_ssl_request};

/// The server's initial handshake packet (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: StatusFlags,
    /// Authentication plugin the server starts with
    pub auth_plugin: String,
    /// Scramble (both parts, as sent)
    pub auth_data: Vec<u8>,
}

impl Greeting {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.first() == Some(&0xFF) {
            let err = ErrPacket::parse(payload)?;
            return Err(greeting_rejected(&err));
        }

        let mut reader = PacketReader::new(payload);
        let protocol_version = reader.read_u8()?;
        if protocol_version != 10 {
            return Err(protocol_error_with_data(
                format!("unsupported protocol version: {}", protocol_version),
                payload,
            ));
        }

        let server_version = reader.read_null_string()?;
        let connection_id = reader.read_u32_le()?;
        let mut auth_data = reader.read_bytes(8)?.to_vec();
        // filler
        reader.skip(1)?;

        let caps_lower = reader.read_u16_le()?;
        let charset = reader.read_u8()?;
        let status_flags = StatusFlags::from_bits(reader.read_u16_le()?);
        let caps_upper = reader.read_u16_le()?;
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let auth_data_len = usize::from(reader.read_u8()?);
        reader.skip(10)?;

        let part2 = auth_data_len.saturating_sub(8).max(13).min(reader.remaining());
        auth_data.extend_from_slice(reader.read_bytes(part2)?);

        let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string_lenient()
        } else {
            plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };

        Ok(Greeting {
            protocol_version,
            server_version,
            connection_id,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
            auth_data,
        })
    }
}

fn max_packet_field(config: &ClientConfig) -> u32 {
    config
        .max_allowed_packet
        .map_or(MAX_PACKET_SIZE as u32, |max| u32::try_from(max).unwrap_or(u32::MAX))
}

/// Run the whole handshake. Any failure closes the connection.
pub fn perform(conn: &mut Connection, config: &ClientConfig) -> Result<()> {
    let result = run(conn, config);
    conn.guard(result)
}

fn run(conn: &mut Connection, config: &ClientConfig) -> Result<()> {
    let greeting = conn.with_read_timeout(config.effective_connect_timeout(), |c| {
        c.read_packet(Greeting::parse)
    })?;

    tracing::debug!(
        server_version = %greeting.server_version,
        connection_id = greeting.connection_id,
        plugin = %greeting.auth_plugin,
        capabilities = format_args!("{:#010x}", greeting.capabilities),
        "Received server greeting"
    );

    let use_tls = validate_ssl_mode(config.ssl_mode, greeting.capabilities)?;
    let mut caps = config.capability_flags() & greeting.capabilities;
    if use_tls {
        caps |= capabilities::CLIENT_SSL;
    } else {
        caps &= !capabilities::CLIENT_SSL;
    }

    {
        let session = conn.session_mut();
        session.server_version = greeting.server_version.clone();
        session.connection_id = greeting.connection_id;
        session.status_flags = greeting.status_flags;
        session.capabilities = caps;
        session.charset = config.charset;
        session.auth_plugin = greeting.auth_plugin.clone();
        session.auth_data = greeting.auth_data.clone();
    }

    let max_packet = max_packet_field(config);
    if use_tls {
        conn.write_packet(|w| write_ssl_request(w, caps, max_packet, config.charset))?;
        conn.upgrade(config)?;
    }

    let password = config.password.as_deref().unwrap_or("");
    let response = auth::auth_response(
        &greeting.auth_plugin,
        password,
        &greeting.auth_data,
        config.enable_cleartext_plugin,
    )?;

    let mut packet = PacketWriter::new();
    write_handshake_response(
        &mut packet,
        config,
        caps,
        max_packet,
        &greeting.auth_plugin,
        &response,
    )?;
    conn.write_packet(|w| w.write_bytes(packet.as_bytes()))?;

    authenticate(conn, config)
}

fn write_handshake_response(
    w: &mut PacketWriter,
    config: &ClientConfig,
    caps: u32,
    max_packet: u32,
    plugin: &str,
    response: &[u8],
) -> Result<()> {
    w.write_u32_le(caps);
    w.write_u32_le(max_packet);
    w.write_u8(config.charset);
    w.write_zeros(23);
    w.write_null_string(&config.user);

    if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        w.write_lenenc_bytes(response);
    } else {
        let len = u8::try_from(response.len()).map_err(|_| {
            auth_plugin_error(format!(
                "{} response of {} bytes does not fit the server's 255-byte auth field",
                plugin,
                response.len()
            ))
        })?;
        w.write_u8(len);
        w.write_bytes(response);
    }

    if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        w.write_null_string(config.database.as_deref().unwrap_or(""));
    }
    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        w.write_null_string(plugin);
    }
    Ok(())
}

/// Read auth results until the server accepts or rejects us.
fn authenticate(conn: &mut Connection, config: &ClientConfig) -> Result<()> {
    let password = config.password.as_deref().unwrap_or("");

    loop {
        let payload = conn.read_payload()?;
        match payload.first() {
            Some(0x00) => {
                conn.apply_ok(&payload)?;
                tracing::debug!(plugin = %conn.session().auth_plugin, "Authenticated");
                return Ok(());
            }
            Some(0xFF) => {
                let err = ErrPacket::parse(&payload)?;
                return Err(auth_failed(&err));
            }
            Some(0xFE) => {
                let mut reader = PacketReader::new(&payload[1..]);
                let plugin = reader.read_null_string_lenient();
                let data = reader.read_rest().to_vec();
                tracing::debug!(plugin = %plugin, "Auth switch requested");

                let response =
                    auth::auth_response(&plugin, password, &data, config.enable_cleartext_plugin)?;
                let session = conn.session_mut();
                session.auth_plugin = plugin;
                session.auth_data = data;
                conn.write_packet(|w| w.write_bytes(&response))?;
            }
            Some(&caching_sha2::MORE_DATA) => match payload.get(1) {
                Some(&caching_sha2::FAST_AUTH_SUCCESS) => {
                    tracing::debug!("Fast auth succeeded");
                }
                Some(&caching_sha2::PERFORM_FULL_AUTH) => {
                    if !conn.is_tls() && !conn.is_unix() {
                        return Err(connection_error(
                            ConnectionErrorKind::Authentication,
                            "full authentication requires a TLS connection or a unix socket",
                        ));
                    }
                    tracing::debug!("Full authentication requested");
                    conn.write_packet(|w| w.write_null_string(password))?;
                }
                _ => {
                    return Err(protocol_error_with_data(
                        "unexpected auth-more-data payload",
                        &payload,
                    ));
                }
            },
            Some(tag) => {
                return Err(protocol_error(format!(
                    "unexpected packet during authentication: {:#04x}",
                    tag
                )));
            }
            None => return Err(protocol_error("empty packet during authentication")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_payload(plugin: &str, caps: u32) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string("8.0.36");
        w.write_u32_le(42);
        w.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        w.write_u8(0);
        w.write_u16_le(caps as u16);
        w.write_u8(45);
        w.write_u16_le(StatusFlags::AUTOCOMMIT);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 0]);
        w.write_null_string(plugin);
        w.into_bytes()
    }

    #[test]
    fn test_parse_greeting() {
        let caps = capabilities::BASE_CLIENT_FLAGS | capabilities::CLIENT_SSL;
        let greeting = Greeting::parse(&greeting_payload("caching_sha2_password", caps)).unwrap();
        assert_eq!(greeting.server_version, "8.0.36");
        assert_eq!(greeting.connection_id, 42);
        assert_eq!(greeting.capabilities, caps);
        assert_eq!(greeting.charset, 45);
        assert!(greeting.status_flags.autocommit());
        assert_eq!(greeting.auth_plugin, "caching_sha2_password");
        assert_eq!(greeting.auth_data.len(), 21);
        assert_eq!(&greeting.auth_data[..20], &(1u8..=20).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_parse_greeting_without_plugin_auth() {
        let caps = capabilities::CLIENT_PROTOCOL_41 | capabilities::CLIENT_SECURE_CONNECTION;
        let greeting = Greeting::parse(&greeting_payload("ignored", caps)).unwrap();
        assert_eq!(greeting.auth_plugin, plugins::MYSQL_NATIVE_PASSWORD);
    }

    #[test]
    fn test_greeting_rejections() {
        let err = Greeting::parse(&[0x09, b'x', 0x00]).unwrap_err();
        assert!(matches!(err, mywire_core::Error::Protocol(_)));

        let mut payload = vec![0xFF, 0x10, 0x04, b'#'];
        payload.extend_from_slice(b"HY000Too many connections");
        let err = Greeting::parse(&payload).unwrap_err();
        assert_eq!(err.server_code(), Some(1040));
        assert!(err.is_connection_error());

        let err = Greeting::parse(&[0x0A, b'8']).unwrap_err();
        assert!(matches!(err, mywire_core::Error::Protocol(_)));
    }

    #[test]
    fn test_handshake_response_layout() {
        let config = ClientConfig::new().user("app").database("shop");
        let caps = capabilities::BASE_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_WITH_DB;
        let mut w = PacketWriter::new();
        write_handshake_response(
            &mut w,
            &config,
            caps,
            0x00FF_FFFF,
            plugins::MYSQL_NATIVE_PASSWORD,
            &[0xAA; 20],
        )
        .unwrap();
        let bytes = w.into_bytes();

        assert_eq!(&bytes[..4], &caps.to_le_bytes());
        assert_eq!(&bytes[4..8], &[0xFF, 0xFF, 0xFF, 0x00]);
        assert_eq!(bytes[8], 45);
        assert!(bytes[9..32].iter().all(|&b| b == 0));
        assert_eq!(&bytes[32..36], b"app\0");
        assert_eq!(bytes[36], 20);
        assert_eq!(&bytes[37..57], &[0xAA; 20]);
        assert_eq!(&bytes[57..62], b"shop\0");
        assert_eq!(&bytes[62..], b"mysql_native_password\0");
    }

    #[test]
    fn test_long_cleartext_response_uses_lenenc() {
        let config = ClientConfig::new().user("app");
        let password = "p".repeat(300);
        let response = auth::auth_response(plugins::MYSQL_CLEAR_PASSWORD, &password, &[], true)
            .unwrap();
        assert_eq!(response.len(), 300);

        let caps = capabilities::BASE_CLIENT_FLAGS;
        assert!(caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0);
        let mut w = PacketWriter::new();
        write_handshake_response(
            &mut w,
            &config,
            caps,
            0x00FF_FFFF,
            plugins::MYSQL_CLEAR_PASSWORD,
            &response,
        )
        .unwrap();
        let bytes = w.into_bytes();

        // 0xFC prefix, then a 2-byte length
        assert_eq!(&bytes[32..36], b"app\0");
        assert_eq!(&bytes[36..39], &[0xFC, 0x2C, 0x01]);
        assert_eq!(&bytes[39..339], password.as_bytes());
        assert_eq!(&bytes[339..], b"mysql_clear_password\0");
    }

    #[test]
    fn test_long_response_without_lenenc_is_rejected() {
        let config = ClientConfig::new().user("app");
        let caps = capabilities::BASE_CLIENT_FLAGS
            & !capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        let mut w = PacketWriter::new();
        let err = write_handshake_response(
            &mut w,
            &config,
            caps,
            0x00FF_FFFF,
            plugins::MYSQL_CLEAR_PASSWORD,
            &[b'p'; 300],
        )
        .unwrap_err();
        assert!(err.is_auth_plugin_error());

        let mut w = PacketWriter::new();
        write_handshake_response(
            &mut w,
            &config,
            caps,
            0x00FF_FFFF,
            plugins::MYSQL_CLEAR_PASSWORD,
            &[b'p'; 255],
        )
        .unwrap();
        assert_eq!(w.as_bytes()[36], 255);
    }
}
