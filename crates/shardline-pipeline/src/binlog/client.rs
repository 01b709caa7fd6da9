//! MySQL replication client
//!
//! Implements the part of the client/server protocol a replica needs:
//! - Handshake and authentication (mysql_native_password, caching_sha2_password fast path)
//! - `SET @master_binlog_checksum` so the server keeps event checksums
//! - COM_REGISTER_SLAVE
//! - COM_BINLOG_DUMP and the event read loop

use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use super::decoder::{decode_error_packet, BinlogFrameDecoder};
use super::event::BinlogUnit;
use super::reader::ByteReader;
use super::rows::lossy;
use crate::checkpoint::BinlogPosition;
use crate::config::BinlogConfig;
use crate::error::{PipelineError, Result};

/// MySQL packet header size (4 bytes: 3 for length + 1 for sequence)
const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload; a payload of exactly this size continues in the next packet
const MAX_PACKET_SIZE: usize = 16_777_215;
/// utf8mb4_general_ci
const CHARSET_UTF8MB4: u8 = 45;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

// ============================================================================
// Handshake Packet
// ============================================================================

/// Initial greeting from the server
#[derive(Debug)]
struct Handshake {
    server_version: String,
    connection_id: u32,
    capabilities: u32,
    auth_data: Vec<u8>,
    auth_plugin: String,
}

impl Handshake {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let protocol_version = reader.u8()?;
        if protocol_version == 0xff {
            return Err(error_packet(&data[1..], "Handshake rejected"));
        }
        let server_version = lossy(reader.null_terminated()?);
        let connection_id = reader.u32_le()?;
        let mut auth_data = reader.bytes(8)?.to_vec();
        reader.skip(1)?; // filler
        let cap_lower = u32::from(reader.u16_le()?);
        reader.skip(1)?; // character set
        reader.skip(2)?; // status flags
        let cap_upper = u32::from(reader.u16_le()?);
        let capabilities = (cap_upper << 16) | cap_lower;
        let auth_data_len = reader.u8()? as usize;
        reader.skip(10)?; // reserved

        let part2_len = if auth_data_len > 8 { auth_data_len - 8 } else { 13 };
        let part2 = reader.bytes(part2_len.min(reader.remaining()))?;
        let part2_end = part2.iter().position(|&b| b == 0).unwrap_or(part2.len());
        auth_data.extend_from_slice(&part2[..part2_end]);

        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            let rest = reader.rest();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            lossy(&rest[..end])
        } else {
            "mysql_native_password".to_string()
        };

        Ok(Self {
            server_version,
            connection_id,
            capabilities,
            auth_data,
            auth_plugin,
        })
    }
}

// ============================================================================
// MySQL Binlog Client
// ============================================================================

/// Connection speaking the replication protocol
pub struct BinlogClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for BinlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogClient")
            .field("sequence_id", &self.sequence_id)
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl BinlogClient {
    /// Connect and authenticate as the configured replication user
    pub async fn connect(config: &BinlogConfig) -> Result<Self> {
        shardline_rdbc::security::validate_sql_identifier(&config.user)?;

        let addr = format!("{}:{}", config.host, config.port);
        info!("Connecting to MySQL at {} for replication", addr);
        let tcp = match timeout(
            Duration::from_secs(config.connect_timeout_secs),
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(PipelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "connection timeout after {}s connecting to {}",
                        config.connect_timeout_secs, addr
                    ),
                )))
            }
        };

        let mut client = Self {
            stream: BufReader::new(tcp),
            sequence_id: 0,
            server_version: String::new(),
            connection_id: 0,
        };
        let handshake = Handshake::parse(&client.read_packet().await?)?;
        info!(
            "Connected to MySQL {} (connection_id={})",
            handshake.server_version, handshake.connection_id
        );
        debug!("Auth plugin: {}", handshake.auth_plugin);
        client.server_version = handshake.server_version.clone();
        client.connection_id = handshake.connection_id;

        client
            .authenticate(&config.user, config.password.as_deref(), &handshake)
            .await?;
        Ok(client)
    }

    /// Server version from the handshake
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Server-side connection id
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Read one logical packet, joining max-size continuation packets
    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; PACKET_HEADER_SIZE];
            self.stream.read_exact(&mut header).await?;
            let len = (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
            self.sequence_id = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream.read_exact(&mut payload[start..]).await?;
            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len >= MAX_PACKET_SIZE {
            return Err(PipelineError::unsupported(format!("packet too large: {} bytes", len)));
        }

        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + len);
        packet.push((len & 0xFF) as u8);
        packet.push(((len >> 8) & 0xFF) as u8);
        packet.push(((len >> 16) & 0xFF) as u8);
        packet.push(self.sequence_id);
        packet.extend_from_slice(data);

        let stream = self.stream.get_mut();
        stream.write_all(&packet).await?;
        stream.flush().await?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    async fn authenticate(&mut self, user: &str, password: Option<&str>, handshake: &Handshake) -> Result<()> {
        let client_flags = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_LONG_PASSWORD
            | CLIENT_TRANSACTIONS
            | CLIENT_PLUGIN_AUTH
            | CLIENT_DEPRECATE_EOF;
        let auth_response = scramble(&handshake.auth_plugin, password, &handshake.auth_data)?;

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(client_flags & (handshake.capabilities | CLIENT_PLUGIN_AUTH));
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(CHARSET_UTF8MB4);
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(handshake.auth_plugin.as_bytes());
        response.put_u8(0);
        self.write_packet(&response).await?;

        let mut plugin = handshake.auth_plugin.clone();
        loop {
            let resp = self.read_packet().await?;
            match resp.first() {
                Some(0x00) => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                Some(0xFF) => return Err(error_packet(&resp[1..], "Authentication failed")),
                Some(0xFE) => {
                    // auth switch: plugin name, then new salt
                    let mut reader = ByteReader::new(&resp[1..]);
                    plugin = lossy(reader.null_terminated()?);
                    let rest = reader.rest();
                    let salt = rest.strip_suffix(&[0u8]).unwrap_or(rest);
                    debug!("Auth switch to plugin: {}", plugin);
                    let auth = scramble(&plugin, password, salt)?;
                    self.write_packet(&auth).await?;
                }
                Some(0x01) if plugin == "caching_sha2_password" => match resp.get(1) {
                    Some(0x03) => debug!("Fast auth success"),
                    Some(0x04) => {
                        return Err(PipelineError::unsupported(
                            "caching_sha2_password full authentication requires TLS",
                        ))
                    }
                    _ => return Err(PipelineError::malformed("unexpected caching_sha2 response")),
                },
                Some(other) => {
                    return Err(PipelineError::malformed(format!(
                        "unexpected auth response: 0x{:02X}",
                        other
                    )))
                }
                None => return Err(PipelineError::malformed("empty auth response")),
            }
        }
    }

    /// Execute a statement that returns no rows
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(error_packet(&resp[1..], "Query failed")),
            _ => Err(PipelineError::unsupported(format!(
                "statement returned a result set: {}",
                sql
            ))),
        }
    }

    /// Register as a replica with `server_id`
    pub async fn register_replica(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id
        self.write_packet(&packet).await?;

        let resp = self.read_packet().await?;
        match resp.first() {
            Some(0x00) => {
                info!("Registered as replica with server_id={}", server_id);
                Ok(())
            }
            Some(0xFF) => Err(error_packet(&resp[1..], "Failed to register as replica")),
            _ => Err(PipelineError::malformed("unexpected response to COM_REGISTER_SLAVE")),
        }
    }

    /// Request events from `position` onwards
    pub async fn binlog_dump(&mut self, server_id: u32, position: &BinlogPosition) -> Result<()> {
        let offset = u32::try_from(position.position).map_err(|_| {
            PipelineError::config(format!("binlog position {} exceeds 4 GiB", position.position))
        })?;
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(position.file.len() + 11);
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(offset);
        packet.put_u16_le(0); // flags
        packet.put_u32_le(server_id);
        packet.put_slice(position.file.as_bytes());
        self.write_packet(&packet).await?;

        info!("Started binlog dump from {}", position);
        Ok(())
    }

    /// Run the replica handshake and stream decoded units
    pub async fn start(mut self, config: &BinlogConfig, decoder: BinlogFrameDecoder) -> Result<BinlogEventStream> {
        self.execute("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await?;
        self.register_replica(config.server_id).await?;
        let position = BinlogPosition::new(config.file.clone().unwrap_or_default(), config.position);
        self.binlog_dump(config.server_id, &position).await?;
        Ok(BinlogEventStream {
            client: self,
            decoder,
            buffer: BytesMut::new(),
            position,
        })
    }
}

fn scramble(plugin: &str, password: Option<&str>, salt: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        "mysql_native_password" => Ok(mysql_native_password(password, salt)),
        "caching_sha2_password" => Ok(caching_sha2_password(password, salt)),
        other => {
            warn!("Unknown auth plugin: {}, trying mysql_native_password", other);
            Ok(mysql_native_password(password, salt))
        }
    }
}

/// SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
fn mysql_native_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let stage1 = Sha1::digest(pwd.as_bytes());
            let stage2 = Sha1::digest(stage1);
            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(stage2);
            let stage3 = hasher.finalize();
            stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
        }
    }
}

/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + salt))
fn caching_sha2_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let hash1 = Sha256::digest(pwd.as_bytes());
            let hash2 = Sha256::digest(hash1);
            let mut hasher = Sha256::new();
            hasher.update(hash2);
            hasher.update(salt);
            let hash3 = hasher.finalize();
            hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
        }
    }
}

/// Server error packet body (after the 0xFF marker), prefixed with `context`
fn error_packet(data: &[u8], context: &str) -> PipelineError {
    match decode_error_packet(data) {
        PipelineError::ProtocolDecode {
            code,
            sql_state,
            message,
        } => PipelineError::ProtocolDecode {
            code,
            sql_state,
            message: format!("{}: {}", context, message),
        },
        other => other,
    }
}

// ============================================================================
// Event stream
// ============================================================================

/// Decoded units from a running binlog dump
#[derive(Debug)]
pub struct BinlogEventStream {
    client: BinlogClient,
    decoder: BinlogFrameDecoder,
    buffer: BytesMut,
    position: BinlogPosition,
}

impl BinlogEventStream {
    /// Next unit, or `None` when the server ends the dump
    pub async fn next(&mut self) -> Result<Option<BinlogUnit>> {
        loop {
            if let Some(unit) = self.decoder.decode(&mut self.buffer)? {
                self.advance(&unit);
                return Ok(Some(unit));
            }
            let packet = self.client.read_packet().await?;
            // an EOF packet is shorter than any event frame
            if packet.first() == Some(&0xFE) && packet.len() < 9 {
                info!("Binlog dump ended at {}", self.position);
                return Ok(None);
            }
            self.buffer.extend_from_slice(&packet);
        }
    }

    /// Position after the last unit returned
    pub fn position(&self) -> &BinlogPosition {
        &self.position
    }

    /// Decoder state, e.g. to resume with the same table maps
    pub fn decoder(&self) -> &BinlogFrameDecoder {
        &self.decoder
    }

    fn advance(&mut self, unit: &BinlogUnit) {
        if let Some(meta) = unit.last_meta() {
            // artificial events carry position 0
            if meta.log_position > 0 {
                self.position = BinlogPosition::new(meta.file.clone(), meta.log_position);
            }
        }
    }
}
