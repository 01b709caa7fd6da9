//! Binlog decoder tests
//!
//! Fixtures are replication packets captured from a MySQL 8.0 server with
//! CRC32 checksums; synthetic events are built with the helpers below.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use shardline_pipeline::binlog::*;
use shardline_pipeline::PipelineError;
use shardline_rdbc::Value;
use tokio_util::codec::{Decoder, FramedRead};

const ROTATE: &str = "000000000004010000002c0000000000000020001a9100000000000062696e6c6f672e3030303032394af65c24";
const FORMAT_DESCRIPTION: &str = concat!(
    "00513aa8620f01000000790000000000000000000400382e302e32370000000000000000000000000000000000",
    "0000000000000000000000000000000000000000000000000000000000000013000d000800000000040004000000",
    "6100041a08000000080808020000000a0a0a2a2a001234000a280140081396"
);
const QUERY: &str = concat!(
    "00f3e25665020100000087000000c2740f0a0400c9150000000000000400002d000000000000012000a0450000",
    "00000603737464042d002d00e0000c0164735f3000116df40b000000000012ff0064735f300044524f50205441",
    "424c452060745f70726f76696e636560202f2a2067656e65726174656420627920736572766572202a2fcefe4ec6"
);
const TABLE_MAP: &str = "00cb38a962130100000041000000be7d000000007b000000000001000464735f310009745f6f726465725f31000408030ff604c8000a020c0101000201e0ff0a9b3a";
const WRITE_ROWS: &str = "007a36a9621e0100000038000000bb7c000000007b00000000000100020004ff08010000000000000001000000075355434345535365eff9ff";
const UPDATE_ROWS: &str = concat!(
    "00cb38a9621f010000004e0000000c7e000000007b00000000000100020004ffff08010000000000000001000000",
    "0753554343455353080100000000000000010000000775706461746564e78cee6c"
);
const DELETE_ROWS_116: &str = "002a80a862200100000038000000c569000000007400000000000100020004ff0801000000000000000100000007535543434553531c9580c5";
const XID: &str = "006acb656410010000001f000000fa29000000001643000000000000b13f8340";

fn bytes(fixtures: &[&str]) -> BytesMut {
    let mut buf = BytesMut::new();
    for fixture in fixtures {
        buf.extend_from_slice(&hex::decode(fixture).unwrap());
    }
    buf
}

fn t_order_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new(ColumnType::LongLong, 0, false),
        ColumnDef::new(ColumnType::Long, 0, false),
        ColumnDef::new(ColumnType::Varchar, 200, true),
        ColumnDef::new(ColumnType::NewDecimal, (10 << 8) | 2, true),
    ]
}

fn seeded_tables() -> HashMap<u64, TableMapEvent> {
    [123u64, 116]
        .into_iter()
        .map(|id| (id, TableMapEvent::new(id, "ds_1", "t_order_1", t_order_columns())))
        .collect()
}

fn decoder(group_by_transaction: bool) -> BinlogFrameDecoder {
    BinlogFrameDecoder::new(4, seeded_tables(), group_by_transaction)
}

fn event_header(buf: &mut BytesMut, event_type: EventType, event_size: usize) {
    buf.put_u8(0);
    buf.put_u32_le(1);
    buf.put_u8(event_type as u8);
    buf.put_u32_le(1);
    buf.put_u32_le(event_size as u32);
    buf.put_u32_le(0);
    buf.put_u16_le(0);
}

fn placeholder_event(event_size: usize, body_len: usize, checksum_len: usize) -> BytesMut {
    let mut buf = BytesMut::new();
    event_header(&mut buf, EventType::Unknown, event_size);
    buf.put_bytes(0, body_len + checksum_len);
    buf
}

fn query_event(sql: &str, checksum_len: usize) -> BytesMut {
    let database = b"db";
    let body_len = 4 + 4 + 1 + 2 + 2 + database.len() + 1 + sql.len();
    let mut buf = BytesMut::new();
    event_header(&mut buf, EventType::Query, EventHeader::SIZE + body_len + checksum_len);
    buf.put_u32_le(1);
    buf.put_u32_le(2);
    buf.put_u8(database.len() as u8);
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_slice(database);
    buf.put_u8(0);
    buf.put_slice(sql.as_bytes());
    buf.put_bytes(0, checksum_len);
    buf
}

fn format_description_event(checksum_len: usize, extra_len: usize) -> BytesMut {
    let post_headers = EventType::FormatDescription as usize - 1;
    let body_len = 2 + 50 + 4 + 1 + post_headers + 1 + 1 + extra_len;
    let mut buf = BytesMut::new();
    event_header(
        &mut buf,
        EventType::FormatDescription,
        EventHeader::SIZE + body_len + checksum_len,
    );
    buf.put_u16_le(4);
    buf.put_bytes(0, 50);
    buf.put_u32_le(0);
    buf.put_u8(EventHeader::SIZE as u8);
    buf.put_bytes(0, post_headers);
    buf.put_u8(72);
    buf.put_u8(0);
    buf.put_bytes(0, extra_len + checksum_len);
    buf
}

fn expected_row(status: &str) -> Vec<Value> {
    vec![
        Value::Int64(1),
        Value::Int32(1),
        Value::String(status.into()),
        Value::Null,
    ]
}

fn single(unit: Option<BinlogUnit>) -> BinlogEvent {
    match unit {
        Some(BinlogUnit::Event(event)) => event,
        other => panic!("expected a single event, got {:?}", other),
    }
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn test_error_status_raises_protocol_error() {
    let mut buf = BytesMut::new();
    buf.put_u8(0xff);
    buf.put_u16_le(123);
    buf.put_u8(0);
    buf.put_slice(b"ABCDE");
    buf.put_slice(b"errorMessage");
    buf.put_bytes(0, EventHeader::SIZE);

    let err = decoder(true).decode(&mut buf).unwrap_err();
    match err {
        PipelineError::ProtocolDecode { code, message, .. } => {
            assert_eq!(code, 123);
            assert!(message.contains("errorMessage"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(buf.is_empty());
}

#[test]
fn test_event_smaller_than_header_rejected() {
    let mut buf = BytesMut::new();
    buf.put_u8(1);
    buf.put_bytes(0, EventHeader::SIZE);
    let err = decoder(true).decode(&mut buf).unwrap_err();
    assert!(matches!(err, PipelineError::ProtocolDecode { code: 0, .. }));
}

#[test]
fn test_partial_header_left_untouched() {
    let full = bytes(&[WRITE_ROWS]);
    let mut buf = BytesMut::from(&full[..10]);
    assert!(decoder(true).decode(&mut buf).unwrap().is_none());
    assert_eq!(&buf[..], &full[..10]);
}

#[test]
fn test_partial_body_left_untouched() {
    let full = bytes(&[WRITE_ROWS]);
    let half = full.len() / 2;
    let mut buf = BytesMut::from(&full[..half]);
    let mut decoder = decoder(false);
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    assert_eq!(&buf[..], &full[..half]);

    buf.extend_from_slice(&full[half..]);
    let event = single(decoder.decode(&mut buf).unwrap());
    assert_eq!(event.rows().unwrap().after, vec![expected_row("SUCCESS")]);
    assert!(buf.is_empty());
}

#[test]
fn test_incomplete_trailing_event_waits() {
    let table_map = hex::decode(TABLE_MAP).unwrap();
    let truncated = &table_map[..45];
    let mut buf = bytes(&[DELETE_ROWS_116, XID]);
    buf.extend_from_slice(truncated);

    let mut decoder = decoder(true);
    let delete = single(decoder.decode(&mut buf).unwrap());
    assert!(matches!(delete, BinlogEvent::DeleteRows(_)));
    assert_eq!(delete.rows().unwrap().before, vec![expected_row("SUCCESS")]);
    assert!(delete.rows().unwrap().after.is_empty());

    assert!(matches!(single(decoder.decode(&mut buf).unwrap()), BinlogEvent::Xid(_)));
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    assert_eq!(&buf[..], truncated);
}

/// Log sink shared between a test and its scoped subscriber
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn count(&self, needle: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock()).matches(needle).count()
    }
}

#[test]
fn test_odd_status_warned_once_per_frame() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    let mut full = placeholder_event(EventHeader::SIZE + 40, 36, 4);
    full[0] = 0x01;
    let mut decoder = decoder(false);
    let mut buf = BytesMut::from(&full[..30]);

    tracing::subscriber::with_default(subscriber, || {
        for _ in 0..3 {
            assert!(decoder.decode(&mut buf).unwrap().is_none());
        }
        assert_eq!(logs.count("Unexpected binlog packet status"), 0);

        buf.extend_from_slice(&full[30..]);
        let event = single(decoder.decode(&mut buf).unwrap());
        assert!(matches!(event, BinlogEvent::Placeholder(_)));
    });

    assert!(buf.is_empty());
    assert_eq!(logs.count("Unexpected binlog packet status 0x01"), 1);
}

// ============================================================================
// Event types
// ============================================================================

#[test]
fn test_rotate_updates_file_name() {
    let mut buf = bytes(&[ROTATE]);
    let mut decoder = decoder(true);
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    assert_eq!(decoder.context().file_name, "binlog.000029");
    assert!(buf.is_empty());
}

#[test]
fn test_format_description_sets_checksum_length() {
    let mut buf = bytes(&[FORMAT_DESCRIPTION]);
    let mut decoder = BinlogFrameDecoder::new(0, HashMap::new(), true);
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    assert_eq!(decoder.context().checksum_length, 4);
    assert!(buf.is_empty());
}

#[test]
fn test_format_description_without_checksum_skips_extra_bytes() {
    let mut decoder = BinlogFrameDecoder::new(0, HashMap::new(), true);
    for extra_len in [4, 3] {
        let mut buf = format_description_event(0, extra_len);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert_eq!(decoder.context().checksum_length, 0);
    }
}

#[test]
fn test_query_event_fields() {
    let mut buf = bytes(&[QUERY]);
    let event = single(decoder(true).decode(&mut buf).unwrap());
    let BinlogEvent::Query(query) = event else {
        panic!("expected query, got {:?}", event);
    };
    assert_eq!(query.meta.timestamp, 1_700_193_011);
    assert_eq!(query.meta.log_position, 168_785_090);
    assert_eq!(query.database, "ds_0");
    assert_eq!(query.sql, "DROP TABLE `t_province` /* generated by server */");
    assert!(!query.is_begin());
}

#[test]
fn test_table_map_cached() {
    let mut buf = bytes(&[TABLE_MAP]);
    let mut decoder = BinlogFrameDecoder::new(4, HashMap::new(), true);
    assert!(decoder.decode(&mut buf).unwrap().is_none());

    let context = decoder.context();
    assert_eq!(context.table_map.len(), 1);
    let table = context.table(123).unwrap();
    assert_eq!(table.schema, "ds_1");
    assert_eq!(table.table, "t_order_1");
    let types: Vec<ColumnType> = table.columns.iter().map(|c| c.column_type).collect();
    assert_eq!(
        types,
        vec![ColumnType::LongLong, ColumnType::Long, ColumnType::Varchar, ColumnType::NewDecimal]
    );
    assert_eq!(table.columns[2].meta, 200);
    assert_eq!(table.columns[3].meta, (10 << 8) | 2);
    assert!(!table.columns[0].nullable);
    assert!(table.columns[3].nullable);
}

#[test]
fn test_write_rows_image() {
    let mut buf = bytes(&[WRITE_ROWS]);
    let event = single(decoder(false).decode(&mut buf).unwrap());
    let BinlogEvent::WriteRows(rows) = &event else {
        panic!("expected write rows, got {:?}", event);
    };
    assert_eq!(rows.table_id, 123);
    assert_eq!(rows.schema, "ds_1");
    assert_eq!(rows.table, "t_order_1");
    assert!(rows.before.is_empty());
    assert_eq!(rows.after, vec![expected_row("SUCCESS")]);
    assert_eq!(rows.meta.log_position, 31931);
}

#[test]
fn test_update_rows_images() {
    let mut buf = bytes(&[UPDATE_ROWS, XID]);
    let mut decoder = decoder(false);
    let event = single(decoder.decode(&mut buf).unwrap());
    let BinlogEvent::UpdateRows(rows) = &event else {
        panic!("expected update rows, got {:?}", event);
    };
    assert_eq!(rows.before, vec![expected_row("SUCCESS")]);
    assert_eq!(rows.after, vec![expected_row("updated")]);

    let BinlogEvent::Xid(xid) = single(decoder.decode(&mut buf).unwrap()) else {
        panic!("expected xid");
    };
    assert_eq!(xid.xid, 17174);
}

#[test]
fn test_rows_for_unmapped_table() {
    let mut buf = bytes(&[WRITE_ROWS]);
    let err = BinlogFrameDecoder::new(4, HashMap::new(), false)
        .decode(&mut buf)
        .unwrap_err();
    assert!(matches!(err, PipelineError::ProtocolDecode { .. }));
}

#[test]
fn test_placeholder_consumes_whole_event() {
    let context = BinlogContext::new(4).with_file_name("binlog.000001");
    let mut decoder = BinlogFrameDecoder::with_context(context, true);
    let mut buf = placeholder_event(EventHeader::SIZE + 11, 7, 4);

    let BinlogEvent::Placeholder(placeholder) = single(decoder.decode(&mut buf).unwrap()) else {
        panic!("expected placeholder");
    };
    assert_eq!(placeholder.meta.file, "binlog.000001");
    assert_eq!(placeholder.type_code, 0);
    assert!(buf.is_empty());
}

#[test]
fn test_placeholder_without_body() {
    let context = BinlogContext::new(4).with_file_name("binlog.000002");
    let mut decoder = BinlogFrameDecoder::with_context(context, true);
    let mut buf = placeholder_event(EventHeader::SIZE, 0, 4);

    assert!(matches!(
        single(decoder.decode(&mut buf).unwrap()),
        BinlogEvent::Placeholder(_)
    ));
    // The trailer lies outside the declared event size and is left for the next pull.
    assert_eq!(buf.len(), 4);
    assert!(decoder.decode(&mut buf).unwrap().is_none());
}

// ============================================================================
// Checksums
// ============================================================================

#[test]
fn test_captured_checksums_verify() {
    let mut buf = bytes(&[ROTATE, TABLE_MAP, WRITE_ROWS, XID]);
    let mut decoder =
        BinlogFrameDecoder::new(4, HashMap::new(), false).with_checksum_verification(true);
    assert!(matches!(single(decoder.decode(&mut buf).unwrap()), BinlogEvent::WriteRows(_)));
    assert!(matches!(single(decoder.decode(&mut buf).unwrap()), BinlogEvent::Xid(_)));
}

#[test]
fn test_corrupted_event_fails_verification() {
    let mut buf = bytes(&[WRITE_ROWS]);
    let last = buf.len() - 6;
    buf[last] ^= 0x01;
    let err = decoder(false)
        .with_checksum_verification(true)
        .decode(&mut buf)
        .unwrap_err();
    assert!(err.to_string().contains("checksum"), "{err}");
}

// ============================================================================
// Transaction grouping
// ============================================================================

#[test]
fn test_grouped_transaction_is_one_unit() {
    let mut buf = query_event("BEGIN", 4);
    buf.extend_from_slice(&bytes(&[WRITE_ROWS, XID]));

    let mut decoder = decoder(true);
    match decoder.decode(&mut buf).unwrap() {
        Some(BinlogUnit::Transaction(events)) => {
            assert_eq!(events.len(), 2);
            assert!(matches!(events[0], BinlogEvent::WriteRows(_)));
            assert!(matches!(events[1], BinlogEvent::Xid(_)));
        }
        other => panic!("expected a transaction, got {:?}", other),
    }
    assert!(decoder.open_transaction_len().is_none());
    assert!(decoder.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_ungrouped_emits_each_event() {
    let mut buf = query_event("BEGIN", 4);
    buf.extend_from_slice(&bytes(&[WRITE_ROWS, XID]));

    let mut decoder = decoder(false);
    assert!(matches!(single(decoder.decode(&mut buf).unwrap()), BinlogEvent::WriteRows(_)));
    assert!(matches!(single(decoder.decode(&mut buf).unwrap()), BinlogEvent::Xid(_)));
    assert!(decoder.decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_ungrouped_drops_begin_but_keeps_other_queries() {
    let mut decoder = decoder(false);
    let mut begin = query_event("BEGIN", 4);
    assert!(decoder.decode(&mut begin).unwrap().is_none());

    let mut select = query_event("SELECT 1", 4);
    let BinlogEvent::Query(query) = single(decoder.decode(&mut select).unwrap()) else {
        panic!("expected query");
    };
    assert_eq!(query.sql, "SELECT 1");
    assert_eq!(query.database, "db");
}

#[test]
fn test_begin_restarts_open_transaction() {
    let mut decoder = decoder(true);
    let mut buf = query_event("BEGIN", 4);
    buf.extend_from_slice(&bytes(&[WRITE_ROWS]));
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    assert_eq!(decoder.open_transaction_len(), Some(1));

    let mut begin = query_event("begin", 4);
    assert!(decoder.decode(&mut begin).unwrap().is_none());
    assert_eq!(decoder.open_transaction_len(), Some(0));
}

#[test]
fn test_query_inside_transaction_emitted_alone() {
    let mut decoder = decoder(true);
    let mut buf = query_event("BEGIN", 4);
    buf.extend_from_slice(&query_event("CREATE TABLE t_user (id INT)", 4));
    assert!(matches!(single(decoder.decode(&mut buf).unwrap()), BinlogEvent::Query(_)));
    assert_eq!(decoder.open_transaction_len(), Some(0));
}

#[tokio::test]
async fn test_framed_read_over_captured_stream() {
    let mut stream = bytes(&[ROTATE, FORMAT_DESCRIPTION, TABLE_MAP]);
    stream.extend_from_slice(&query_event("BEGIN", 4));
    stream.extend_from_slice(&bytes(&[UPDATE_ROWS, XID]));
    let stream = stream.freeze();

    let decoder = BinlogFrameDecoder::new(4, HashMap::new(), true);
    let units: Vec<BinlogUnit> = FramedRead::new(&stream[..], decoder)
        .map(|unit| unit.unwrap())
        .collect()
        .await;

    assert_eq!(units.len(), 1);
    let last = units[0].last_meta().unwrap();
    assert_eq!(last.file, "binlog.000029");
    assert_eq!(last.log_position, 10746);
    let rows = units[0].events()[0].rows().unwrap();
    assert_eq!(rows.after, vec![expected_row("updated")]);
}
