//! CRC32 chunk digests for source/target comparison
//!
//! Values are hashed in a canonical form so the same logical row digests
//! identically whichever backend or integer width produced it.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use shardline_rdbc::Value;

use super::chunk::{ChunkAggregator, ChunkResult};
use super::record::Record;
use crate::error::Result;

/// Digest of one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumChunk {
    /// CRC32 over the canonical encoding of every row, in order
    pub checksum: u32,
    /// Number of rows hashed
    pub record_count: usize,
    /// Largest leading-key value
    pub max_unique_key: Option<Value>,
}

impl ChecksumChunk {
    /// Same rows, same digest; key bounds are not compared
    pub fn matches(&self, other: &ChecksumChunk) -> bool {
        self.checksum == other.checksum && self.record_count == other.record_count
    }
}

impl ChunkResult for ChecksumChunk {
    fn max_unique_key(&self) -> Option<&Value> {
        self.max_unique_key.as_ref()
    }

    fn record_count(&self) -> usize {
        self.record_count
    }
}

/// Hashes rows instead of keeping them
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumAggregator;

impl ChunkAggregator for ChecksumAggregator {
    type Output = ChecksumChunk;

    fn aggregate(&self, records: Vec<Record>, max_unique_key: Option<Value>) -> Result<ChecksumChunk> {
        let mut hasher = Hasher::new();
        for record in &records {
            for value in record.values() {
                hash_value(&mut hasher, value);
            }
            hasher.update(&[0xFF]);
        }
        Ok(ChecksumChunk {
            checksum: hasher.finalize(),
            record_count: records.len(),
            max_unique_key,
        })
    }
}

fn hash_tagged(hasher: &mut Hasher, tag: u8, bytes: &[u8]) {
    hasher.update(&[tag]);
    hasher.update(&(bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
}

fn hash_value(hasher: &mut Hasher, value: &Value) {
    match value {
        Value::Null => hasher.update(&[0]),
        Value::Bool(b) => hash_tagged(hasher, 1, &i64::from(*b).to_le_bytes()),
        Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) | Value::Enum(_) => {
            let n = value.as_i64().unwrap_or_default();
            hash_tagged(hasher, 1, &n.to_le_bytes());
        }
        Value::Float32(f) => hash_tagged(hasher, 2, &f64::from(*f).to_bits().to_le_bytes()),
        Value::Float64(f) => hash_tagged(hasher, 2, &f.to_bits().to_le_bytes()),
        Value::Decimal(d) => hash_tagged(hasher, 3, d.normalize().to_string().as_bytes()),
        Value::String(s) => hash_tagged(hasher, 4, s.as_bytes()),
        Value::Bytes(b) | Value::Bit(b) => hash_tagged(hasher, 5, b),
        Value::Date(d) => hash_tagged(hasher, 6, d.to_string().as_bytes()),
        Value::Time(t) => hash_tagged(hasher, 7, t.to_string().as_bytes()),
        Value::DateTime(dt) => hash_tagged(hasher, 8, dt.to_string().as_bytes()),
        Value::DateTimeTz(dt) => hash_tagged(hasher, 8, dt.naive_utc().to_string().as_bytes()),
        Value::Uuid(u) => hash_tagged(hasher, 9, u.as_bytes()),
        Value::Json(j) => hash_tagged(hasher, 10, j.to_string().as_bytes()),
        Value::Interval(us) => hash_tagged(hasher, 11, &us.to_le_bytes()),
        Value::Set(bits) => hash_tagged(hasher, 12, &bits.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use shardline_rdbc::types::Row;

    fn record(values: Vec<Value>) -> Record {
        let columns = (0..values.len()).map(|i| format!("c{}", i)).collect();
        Record::from_row(Row::new(columns, values), Some("c0")).unwrap()
    }

    #[test]
    fn test_integer_width_does_not_change_digest() {
        let a = ChecksumAggregator
            .aggregate(vec![record(vec![Value::Int32(7), Value::from("ok")])], None)
            .unwrap();
        let b = ChecksumAggregator
            .aggregate(vec![record(vec![Value::Int64(7), Value::from("ok")])], None)
            .unwrap();
        assert!(a.matches(&b));
    }

    #[test]
    fn test_decimal_scale_is_normalized() {
        let a = ChecksumAggregator
            .aggregate(vec![record(vec![Value::Decimal(Decimal::new(150, 2))])], None)
            .unwrap();
        let b = ChecksumAggregator
            .aggregate(vec![record(vec![Value::Decimal(Decimal::new(15, 1))])], None)
            .unwrap();
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_row_boundaries_matter() {
        let joined = ChecksumAggregator
            .aggregate(
                vec![record(vec![Value::from("ab"), Value::from("c")])],
                None,
            )
            .unwrap();
        let split = ChecksumAggregator
            .aggregate(
                vec![record(vec![Value::from("a"), Value::from("bc")])],
                None,
            )
            .unwrap();
        assert_ne!(joined.checksum, split.checksum);
    }

    #[test]
    fn test_null_differs_from_empty_string() {
        let null = ChecksumAggregator
            .aggregate(vec![record(vec![Value::Int32(1), Value::Null])], None)
            .unwrap();
        let empty = ChecksumAggregator
            .aggregate(vec![record(vec![Value::Int32(1), Value::from("")])], None)
            .unwrap();
        assert!(!null.matches(&empty));
    }
}
