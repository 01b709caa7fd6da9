//! Replication stream framing and transaction grouping
//!
//! Each replication packet payload is a status byte followed by one event:
//!
//! ```text
//! +--------+-------------------+------------------+------------------+
//! | status | header (19 bytes) | body             | checksum (0 / 4) |
//! +--------+-------------------+------------------+------------------+
//! ```
//!
//! The decoder never consumes a partial event: until `1 + event_size` bytes
//! are buffered the input is left exactly as it was.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use super::context::BinlogContext;
use super::event::{
    BinlogEvent, BinlogUnit, EventMeta, FormatDescriptionEvent, PlaceholderEvent, QueryEvent,
    RotateEvent, RowsEvent, TableMapEvent, XidEvent,
};
use super::header::{EventHeader, EventType};
use super::reader::ByteReader;
use super::rows::{decode_row_images, decode_table_map, lossy};
use super::ChecksumType;
use crate::config::BinlogConfig;
use crate::error::{PipelineError, Result};

const STATUS_LEN: usize = 1;
const ERROR_STATUS: u8 = 0xff;

/// Offset of the post-header length array in a format description body
const FDE_POST_HEADER_OFFSET: usize = 2 + 50 + 4 + 1;

/// Codec from replication packet bytes to [`BinlogUnit`]s
#[derive(Debug)]
pub struct BinlogFrameDecoder {
    context: BinlogContext,
    group_by_transaction: bool,
    verify_checksum: bool,
    transaction: Option<Vec<BinlogEvent>>,
}

impl BinlogFrameDecoder {
    /// Create a decoder seeded with known table maps
    pub fn new(
        checksum_length: usize,
        table_map_seed: HashMap<u64, TableMapEvent>,
        group_by_transaction: bool,
    ) -> Self {
        Self::with_context(
            BinlogContext::new(checksum_length).with_table_map(table_map_seed),
            group_by_transaction,
        )
    }

    /// Create a decoder resuming from a saved context
    pub fn with_context(context: BinlogContext, group_by_transaction: bool) -> Self {
        Self {
            context,
            group_by_transaction,
            verify_checksum: false,
            transaction: None,
        }
    }

    /// Decoder for the stream described by `config`
    pub fn from_config(config: &BinlogConfig) -> Self {
        let context = BinlogContext::new(config.checksum.length())
            .with_file_name(config.file.clone().unwrap_or_default());
        Self::with_context(context, config.group_by_transaction).with_checksum_verification(true)
    }

    /// Compare CRC32 trailers against the event bytes
    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Current stream state
    pub fn context(&self) -> &BinlogContext {
        &self.context
    }

    /// Events buffered for a transaction whose `Xid` has not arrived yet
    pub fn open_transaction_len(&self) -> Option<usize> {
        self.transaction.as_ref().map(Vec::len)
    }

    fn decode_frame(&mut self, frame: &[u8]) -> Result<BinlogEvent> {
        let header = EventHeader::parse(frame)?;
        let payload = &frame[EventHeader::SIZE..];
        let event_type = header.event_type();

        if event_type == EventType::FormatDescription {
            // carries its own algorithm byte, so its trailer is handled there
            let meta = self.meta(&header);
            return self.decode_format_description(meta, payload);
        }

        let body_len = payload.len().saturating_sub(self.context.checksum_length);
        if self.verify_checksum && self.context.checksum_length == 4 {
            verify_crc32(&frame[..EventHeader::SIZE + body_len], &payload[body_len..])?;
        }
        let body = &payload[..body_len];
        let meta = self.meta(&header);

        let event = match event_type {
            EventType::Rotate => {
                let rotate = decode_rotate(meta, body)?;
                debug!("Binlog rotated to {}:{}", rotate.next_file, rotate.position);
                self.context.file_name = rotate.next_file.clone();
                BinlogEvent::Rotate(rotate)
            }
            EventType::TableMap => {
                let table = decode_table_map(meta, body)?;
                self.context.cache_table(table.clone());
                BinlogEvent::TableMap(table)
            }
            EventType::Query => BinlogEvent::Query(decode_query(meta, body)?),
            EventType::Xid => {
                let xid = ByteReader::new(body).u64_le()?;
                BinlogEvent::Xid(XidEvent { meta, xid })
            }
            t if t.is_row_event() => self.decode_rows(meta, t, body)?,
            _ => BinlogEvent::Placeholder(PlaceholderEvent {
                meta,
                type_code: header.type_code,
            }),
        };
        Ok(event)
    }

    fn meta(&self, header: &EventHeader) -> EventMeta {
        EventMeta {
            file: self.context.file_name.clone(),
            log_position: u64::from(header.next_position),
            timestamp: header.timestamp,
            server_id: header.server_id,
        }
    }

    fn decode_format_description(&mut self, meta: EventMeta, payload: &[u8]) -> Result<BinlogEvent> {
        let mut reader = ByteReader::new(payload);
        let binlog_version = reader.u16_le()?;
        let server_version = lossy(reader.bytes(50)?)
            .trim_end_matches('\0')
            .to_string();
        reader.skip(4)?; // create timestamp
        let _header_length = reader.u8()?;

        // the post-header length of this event type is the offset of the algorithm byte
        let post_header = &payload[FDE_POST_HEADER_OFFSET..];
        let fde_index = EventType::FormatDescription as usize - 1;
        let checksum = post_header
            .get(fde_index)
            .and_then(|&offset| payload.get(offset as usize))
            .map(|&alg| ChecksumType::from_algorithm(alg))
            .unwrap_or(ChecksumType::None);
        // whatever follows the algorithm byte is skipped with the frame

        debug!(
            "Format description: server {}, binlog v{}, checksum {:?}",
            server_version, binlog_version, checksum
        );
        self.context.checksum_length = checksum.length();
        Ok(BinlogEvent::FormatDescription(FormatDescriptionEvent {
            meta,
            binlog_version,
            server_version,
            checksum,
        }))
    }

    fn decode_rows(&self, meta: EventMeta, event_type: EventType, body: &[u8]) -> Result<BinlogEvent> {
        let mut reader = ByteReader::new(body);
        let table_id = reader.table_id()?;
        reader.skip(2)?; // flags
        if event_type.has_extra_row_data() {
            let extra_len = reader.u16_le()? as usize;
            reader.skip(extra_len.saturating_sub(2))?;
        }

        let table = self.context.table(table_id).ok_or_else(|| {
            PipelineError::malformed(format!("rows event for unmapped table id {}", table_id))
        })?;
        let column_count = reader.packed_int()? as usize;
        if column_count > table.columns.len() {
            return Err(PipelineError::malformed(format!(
                "rows event has {} columns, table map of {}.{} has {}",
                column_count,
                table.schema,
                table.table,
                table.columns.len()
            )));
        }

        let bitmap_len = column_count.div_ceil(8);
        let present = reader.bytes(bitmap_len)?;
        let (update, delete) = match event_type {
            EventType::UpdateRowsV1 | EventType::UpdateRowsV2 => (true, false),
            EventType::DeleteRowsV1 | EventType::DeleteRowsV2 => (false, true),
            _ => (false, false),
        };
        let present_after = if update {
            Some(reader.bytes(bitmap_len)?)
        } else {
            None
        };

        let (before, after) =
            decode_row_images(&mut reader, table, present, present_after, update || delete, !delete)?;
        let rows = RowsEvent {
            meta,
            table_id,
            schema: table.schema.clone(),
            table: table.table.clone(),
            before,
            after,
        };
        Ok(if update {
            BinlogEvent::UpdateRows(rows)
        } else if delete {
            BinlogEvent::DeleteRows(rows)
        } else {
            BinlogEvent::WriteRows(rows)
        })
    }

    /// Route a decoded event through transaction grouping
    fn dispatch(&mut self, event: BinlogEvent) -> Option<BinlogUnit> {
        match event {
            BinlogEvent::Rotate(_) | BinlogEvent::FormatDescription(_) | BinlogEvent::TableMap(_) => {
                None
            }
            BinlogEvent::Placeholder(_) => Some(BinlogUnit::Event(event)),
            BinlogEvent::Query(ref query) if query.is_begin() => {
                if self.group_by_transaction {
                    if let Some(open) = self.transaction.replace(Vec::new()) {
                        if !open.is_empty() {
                            warn!(
                                "Dropping {} events of a transaction without commit before {}",
                                open.len(),
                                query.meta.log_position
                            );
                        }
                    }
                }
                None
            }
            BinlogEvent::Query(_) => Some(BinlogUnit::Event(event)),
            BinlogEvent::Xid(_) if self.group_by_transaction => match self.transaction.take() {
                Some(mut events) => {
                    events.push(event);
                    Some(BinlogUnit::Transaction(events))
                }
                None => Some(BinlogUnit::Event(event)),
            },
            _ => match self.transaction.as_mut() {
                Some(open) if self.group_by_transaction => {
                    open.push(event);
                    None
                }
                _ => Some(BinlogUnit::Event(event)),
            },
        }
    }
}

impl Decoder for BinlogFrameDecoder {
    type Item = BinlogUnit;
    type Error = PipelineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BinlogUnit>> {
        loop {
            let Some(&status) = src.first() else {
                return Ok(None);
            };
            if status == ERROR_STATUS {
                let packet = src.split_to(src.len());
                return Err(decode_error_packet(&packet[STATUS_LEN..]));
            }
            if src.len() < STATUS_LEN + EventHeader::SIZE {
                return Ok(None);
            }
            let header = EventHeader::parse(&src[STATUS_LEN..STATUS_LEN + EventHeader::SIZE])?;
            let event_size = header.event_size as usize;
            if event_size < EventHeader::SIZE {
                src.advance(STATUS_LEN + EventHeader::SIZE);
                return Err(PipelineError::malformed(format!(
                    "event size {} is smaller than the event header",
                    event_size
                )));
            }
            if src.len() < STATUS_LEN + event_size {
                return Ok(None);
            }
            if status != 0 {
                warn!("Unexpected binlog packet status 0x{:02x}", status);
            }

            let frame = src.split_to(STATUS_LEN + event_size).freeze();
            let event = self.decode_frame(&frame[STATUS_LEN..])?;
            trace!(
                "Decoded {} event at {}:{}",
                event.name(),
                event.meta().file,
                event.meta().log_position
            );
            if let Some(unit) = self.dispatch(event) {
                return Ok(Some(unit));
            }
        }
    }
}

fn decode_rotate(meta: EventMeta, body: &[u8]) -> Result<RotateEvent> {
    let mut reader = ByteReader::new(body);
    let position = reader.u64_le()?;
    let next_file = lossy(reader.rest()).trim_end_matches('\0').to_string();
    Ok(RotateEvent {
        meta,
        position,
        next_file,
    })
}

fn decode_query(meta: EventMeta, body: &[u8]) -> Result<QueryEvent> {
    let mut reader = ByteReader::new(body);
    let thread_id = reader.u32_le()?;
    let exec_time = reader.u32_le()?;
    let database_len = reader.u8()? as usize;
    let error_code = reader.u16_le()?;
    let status_vars_len = reader.u16_le()? as usize;
    reader.skip(status_vars_len)?;
    let database = lossy(reader.bytes(database_len)?);
    reader.skip(1)?;
    let sql = lossy(reader.rest());
    Ok(QueryEvent {
        meta,
        thread_id,
        exec_time,
        error_code,
        database,
        sql,
    })
}

/// Error packet after the status byte: code, `#`, SQLSTATE, message
pub(crate) fn decode_error_packet(data: &[u8]) -> PipelineError {
    let mut reader = ByteReader::new(data);
    let code = reader.u16_le().unwrap_or(0);
    let mut sql_state = "HY000".to_string();
    if data.get(2) == Some(&b'#') {
        let _ = reader.skip(1);
        if let Ok(state) = reader.bytes(5) {
            sql_state = lossy(state);
        }
    }
    let message = lossy(reader.rest()).trim_matches('\0').to_string();
    PipelineError::ProtocolDecode {
        code,
        sql_state,
        message,
    }
}

fn verify_crc32(event: &[u8], trailer: &[u8]) -> Result<()> {
    let expected = ByteReader::new(trailer).u32_le()?;
    let actual = crc32fast::hash(event);
    if actual != expected {
        return Err(PipelineError::malformed(format!(
            "event checksum mismatch: expected {:08x}, computed {:08x}",
            expected, actual
        )));
    }
    Ok(())
}
