//! Table map metadata and row image decoding

use chrono::{DateTime, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use shardline_rdbc::Value;

use super::event::{ColumnDef, EventMeta, TableMapEvent};
use super::header::ColumnType;
use super::reader::ByteReader;
use crate::error::{PipelineError, Result};

// ============================================================================
// Table map
// ============================================================================

/// Read the per-column metadata block of a table map event
pub(crate) fn decode_column_metadata(data: &[u8], types: &[ColumnType]) -> Result<Vec<u16>> {
    let mut reader = ByteReader::new(data);
    types
        .iter()
        .map(|column_type| {
            Ok(match column_type {
                ColumnType::Float
                | ColumnType::Double
                | ColumnType::Blob
                | ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
                | ColumnType::Json
                | ColumnType::Geometry
                | ColumnType::Time2
                | ColumnType::DateTime2
                | ColumnType::Timestamp2 => u16::from(reader.u8()?),
                ColumnType::Bit | ColumnType::Varchar | ColumnType::VarString => reader.u16_le()?,
                // (precision, scale) and (real type, length) are stored high byte first
                ColumnType::NewDecimal
                | ColumnType::String
                | ColumnType::Enum
                | ColumnType::Set => reader.uint_be(2)? as u16,
                _ => 0,
            })
        })
        .collect()
}

/// Decode a table map body
pub(crate) fn decode_table_map(meta: EventMeta, body: &[u8]) -> Result<TableMapEvent> {
    let mut reader = ByteReader::new(body);
    let table_id = reader.table_id()?;
    reader.skip(2)?; // flags

    let schema_len = reader.u8()? as usize;
    let schema = lossy(reader.bytes(schema_len)?);
    reader.skip(1)?;
    let table_len = reader.u8()? as usize;
    let table = lossy(reader.bytes(table_len)?);
    reader.skip(1)?;

    let column_count = reader.packed_int()? as usize;
    let types = reader
        .bytes(column_count)?
        .iter()
        .map(|&code| {
            ColumnType::from_u8(code).ok_or_else(|| {
                PipelineError::malformed(format!(
                    "unknown column type {} in table map of {}.{}",
                    code, schema, table
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let metadata_len = reader.packed_int()? as usize;
    let metadata = decode_column_metadata(reader.bytes(metadata_len)?, &types)?;
    let null_bitmap = reader.bytes(column_count.div_ceil(8))?;
    // optional metadata (signedness, charsets, names) is not needed for row images

    let columns = types
        .into_iter()
        .zip(metadata)
        .enumerate()
        .map(|(i, (column_type, meta))| ColumnDef::new(column_type, meta, is_bit_set(null_bitmap, i)))
        .collect();

    Ok(TableMapEvent {
        meta,
        table_id,
        schema,
        table,
        columns,
    })
}

// ============================================================================
// Row images
// ============================================================================

/// Decode consecutive row images until the body is consumed.
///
/// Returns `(before, after)`; `update` events carry two images per row.
pub(crate) fn decode_row_images(
    reader: &mut ByteReader<'_>,
    table: &TableMapEvent,
    present: &[u8],
    present_after: Option<&[u8]>,
    has_before: bool,
    has_after: bool,
) -> Result<(Vec<Vec<Value>>, Vec<Vec<Value>>)> {
    let mut before = Vec::new();
    let mut after = Vec::new();
    while !reader.is_empty() {
        if has_before {
            before.push(decode_row(reader, table, present)?);
        }
        if has_after {
            after.push(decode_row(reader, table, present_after.unwrap_or(present))?);
        }
    }
    Ok((before, after))
}

fn decode_row(reader: &mut ByteReader<'_>, table: &TableMapEvent, present: &[u8]) -> Result<Vec<Value>> {
    let present_count = count_set_bits(present);
    let null_bitmap = reader.bytes(present_count.div_ceil(8))?;
    let mut values = Vec::with_capacity(present_count);
    let mut null_idx = 0;

    for (col_idx, column) in table.columns.iter().enumerate() {
        if !is_bit_set(present, col_idx) {
            continue;
        }
        let value = if is_bit_set(null_bitmap, null_idx) {
            Value::Null
        } else {
            decode_value(reader, column.column_type, column.meta)?
        };
        values.push(value);
        null_idx += 1;
    }
    Ok(values)
}

/// Decode one non-NULL cell
pub(crate) fn decode_value(reader: &mut ByteReader<'_>, column_type: ColumnType, meta: u16) -> Result<Value> {
    Ok(match column_type {
        ColumnType::Tiny => Value::Int8(reader.u8()? as i8),
        ColumnType::Short => Value::Int16(reader.u16_le()? as i16),
        ColumnType::Int24 => {
            let raw = reader.uint_le(3)? as u32;
            // sign extend from 24 bits
            Value::Int32(((raw << 8) as i32) >> 8)
        }
        ColumnType::Long => Value::Int32(reader.u32_le()? as i32),
        ColumnType::LongLong => Value::Int64(reader.u64_le()? as i64),
        ColumnType::Float => Value::Float32(reader.f32_le()?),
        ColumnType::Double => Value::Float64(reader.f64_le()?),
        ColumnType::Null => Value::Null,
        ColumnType::Year => match reader.u8()? {
            0 => Value::Int16(0),
            y => Value::Int16(1900 + i16::from(y)),
        },
        ColumnType::Date | ColumnType::NewDate => {
            let packed = reader.uint_le(3)? as u32;
            date_value(packed >> 9, (packed >> 5) & 0x0F, packed & 0x1F)
        }
        ColumnType::Time => {
            let raw = reader.uint_le(3)? as u32;
            let signed = i64::from(((raw << 8) as i32) >> 8);
            let magnitude = signed.unsigned_abs();
            time_value(
                signed < 0,
                magnitude / 10000,
                (magnitude / 100) % 100,
                magnitude % 100,
                0,
            )
        }
        ColumnType::DateTime => {
            let packed = reader.u64_le()?;
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            datetime_value(
                (date / 10000) as u32,
                ((date / 100) % 100) as u32,
                (date % 100) as u32,
                (time / 10000) as u32,
                ((time / 100) % 100) as u32,
                (time % 100) as u32,
                0,
            )
        }
        ColumnType::Timestamp => timestamp_value(reader.u32_le()?, 0),
        ColumnType::Timestamp2 => {
            let seconds = reader.uint_be(4)? as u32;
            let micros = read_fractional_seconds(reader, meta)?;
            timestamp_value(seconds, micros)
        }
        ColumnType::DateTime2 => {
            let packed = reader.uint_be(5)?;
            let micros = read_fractional_seconds(reader, meta)?;
            let year_month = (packed >> 22) & 0x1FFFF;
            datetime_value(
                (year_month / 13) as u32,
                (year_month % 13) as u32,
                ((packed >> 17) & 0x1F) as u32,
                ((packed >> 12) & 0x1F) as u32,
                ((packed >> 6) & 0x3F) as u32,
                (packed & 0x3F) as u32,
                micros,
            )
        }
        ColumnType::Time2 => decode_time2(reader, meta)?,
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                reader.u8()? as usize
            } else {
                reader.u16_le()? as usize
            };
            text_or_bytes(reader.bytes(len)?)
        }
        ColumnType::String | ColumnType::Enum | ColumnType::Set => decode_string(reader, meta)?,
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Json
        | ColumnType::Geometry => {
            if !(1..=4).contains(&meta) {
                return Err(PipelineError::malformed(format!(
                    "invalid length prefix size {} for {:?}",
                    meta, column_type
                )));
            }
            let len = reader.uint_le(meta as usize)? as usize;
            Value::Bytes(reader.bytes(len)?.to_vec())
        }
        ColumnType::NewDecimal => {
            let text = decode_decimal(reader, (meta >> 8) as usize, (meta & 0xFF) as usize)?;
            match Decimal::from_str_exact(&text) {
                Ok(decimal) => Value::Decimal(decimal),
                Err(_) => Value::String(text),
            }
        }
        ColumnType::Bit => {
            let nbits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
            Value::Bit(reader.bytes(nbits.div_ceil(8))?.to_vec())
        }
        ColumnType::Decimal => {
            return Err(PipelineError::malformed(
                "pre-5.0 DECIMAL columns cannot appear in row-based binlogs",
            ))
        }
    })
}

/// STRING columns carry their real type (CHAR, ENUM, SET) in the metadata
fn decode_string(reader: &mut ByteReader<'_>, meta: u16) -> Result<Value> {
    let mut real_type = (meta >> 8) as u8;
    let mut max_len = meta & 0xFF;
    // lengths above 255 borrow bits 4 and 5 of the real type byte
    if real_type & 0x30 != 0x30 {
        max_len |= u16::from((real_type & 0x30) ^ 0x30) << 4;
        real_type |= 0x30;
    }

    Ok(match ColumnType::from_u8(real_type) {
        Some(ColumnType::Enum) => Value::Enum(reader.uint_le(max_len.clamp(1, 2) as usize)? as u16),
        Some(ColumnType::Set) => Value::Set(reader.uint_le(max_len.clamp(1, 8) as usize)?),
        _ => {
            let len = if max_len < 256 {
                reader.u8()? as usize
            } else {
                reader.u16_le()? as usize
            };
            text_or_bytes(reader.bytes(len)?)
        }
    })
}

fn decode_time2(reader: &mut ByteReader<'_>, fsp: u16) -> Result<Value> {
    const INT_OFFSET: i64 = 0x80_0000;
    let packed: i64 = match fsp {
        0 => (reader.uint_be(3)? as i64 - INT_OFFSET) << 24,
        1 | 2 => {
            let mut int_part = reader.uint_be(3)? as i64 - INT_OFFSET;
            let mut frac = i64::from(reader.u8()? as i8);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x100;
            }
            (int_part << 24) + frac * 10_000
        }
        3 | 4 => {
            let mut int_part = reader.uint_be(3)? as i64 - INT_OFFSET;
            let mut frac = i64::from(reader.uint_be(2)? as u16 as i16);
            if int_part < 0 && frac != 0 {
                int_part += 1;
                frac -= 0x10000;
            }
            (int_part << 24) + frac * 100
        }
        _ => reader.uint_be(6)? as i64 - 0x8000_0000_0000,
    };

    let negative = packed < 0;
    let magnitude = packed.unsigned_abs();
    let hms = magnitude >> 24;
    Ok(time_value(
        negative,
        (hms >> 12) & 0x3FF,
        (hms >> 6) & 0x3F,
        hms & 0x3F,
        (magnitude & 0xFF_FFFF) as u32,
    ))
}

/// Fractional seconds of TIMESTAMP2/DATETIME2, in microseconds
fn read_fractional_seconds(reader: &mut ByteReader<'_>, fsp: u16) -> Result<u32> {
    let bytes = (fsp.min(6) as usize).div_ceil(2);
    if bytes == 0 {
        return Ok(0);
    }
    let raw = reader.uint_be(bytes)? as u32;
    Ok(raw * 10u32.pow(6 - 2 * bytes as u32))
}

/// Decode MySQL's packed DECIMAL into its canonical text form
fn decode_decimal(reader: &mut ByteReader<'_>, precision: usize, scale: usize) -> Result<String> {
    if precision == 0 || scale > precision {
        return Err(PipelineError::malformed(format!(
            "invalid decimal precision {} scale {}",
            precision, scale
        )));
    }
    let int_digits = precision - scale;
    let int_words = int_digits / 9;
    let int_leftover = int_digits % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;

    let int_leftover_bytes = leftover_bytes(int_leftover);
    let frac_leftover_bytes = leftover_bytes(frac_leftover);
    let total = int_leftover_bytes + int_words * 4 + frac_words * 4 + frac_leftover_bytes;

    let mut bytes = reader.bytes(total)?.to_vec();
    // sign bit is stored inverted; negatives are stored as complement
    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        bytes.iter_mut().for_each(|b| *b = !*b);
    }

    let mut digits = ByteReader::new(&bytes);
    let mut int_part = String::new();
    if int_leftover_bytes > 0 {
        let value = digits.uint_be(int_leftover_bytes)?;
        if value > 0 {
            int_part.push_str(&value.to_string());
        }
    }
    for _ in 0..int_words {
        let value = digits.uint_be(4)?;
        if int_part.is_empty() {
            if value > 0 {
                int_part.push_str(&value.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", value));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::with_capacity(precision + 2);
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);
    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            result.push_str(&format!("{:09}", digits.uint_be(4)?));
        }
        if frac_leftover_bytes > 0 {
            let value = digits.uint_be(frac_leftover_bytes)?;
            result.push_str(&format!("{:0width$}", value, width = frac_leftover));
        }
    }
    Ok(result)
}

fn leftover_bytes(digits: usize) -> usize {
    match digits {
        0 => 0,
        1..=2 => 1,
        3..=4 => 2,
        5..=6 => 3,
        _ => 4,
    }
}

// ============================================================================
// Value construction
// ============================================================================

fn date_value(year: u32, month: u32, day: u32) -> Value {
    match NaiveDate::from_ymd_opt(year as i32, month, day) {
        Some(date) => Value::Date(date),
        None => Value::String(format!("{:04}-{:02}-{:02}", year, month, day)),
    }
}

fn datetime_value(
    year: u32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> Value {
    let datetime = NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|date| date.and_hms_micro_opt(hour, minute, second, micros));
    match datetime {
        Some(datetime) => Value::DateTime(datetime),
        None => Value::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        )),
    }
}

fn timestamp_value(seconds: u32, micros: u32) -> Value {
    if seconds == 0 {
        return Value::String("0000-00-00 00:00:00".to_string());
    }
    match DateTime::from_timestamp(i64::from(seconds), micros * 1000) {
        Some(ts) => Value::DateTimeTz(ts),
        None => Value::Int64(i64::from(seconds)),
    }
}

/// TIME within a day maps to `Time`, anything else to a signed `Interval`
fn time_value(negative: bool, hours: u64, minutes: u64, seconds: u64, micros: u32) -> Value {
    if !negative && hours < 24 {
        if let Some(time) =
            NaiveTime::from_hms_micro_opt(hours as u32, minutes as u32, seconds as u32, micros)
        {
            return Value::Time(time);
        }
    }
    let total = ((hours * 3600 + minutes * 60 + seconds) * 1_000_000 + u64::from(micros)) as i64;
    Value::Interval(if negative { -total } else { total })
}

fn text_or_bytes(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Bytes(bytes.to_vec()),
    }
}

pub(crate) fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}

pub(crate) fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

pub(crate) fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte_idx = idx / 8;
    byte_idx < bitmap.len() && bitmap[byte_idx] & (1 << (idx % 8)) != 0
}
