//! Scanned rows with their cached leading-key value

use std::cmp::Ordering;

use shardline_rdbc::types::Row;
use shardline_rdbc::Value;

/// One scanned row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    row: Row,
    key: Value,
}

impl Record {
    /// Wrap a row, caching the value of `key_column`.
    ///
    /// Unbounded scans have no key column; the cached key is then NULL.
    pub fn from_row(row: Row, key_column: Option<&str>) -> shardline_rdbc::Result<Self> {
        let key = match key_column {
            Some(name) => row.get_by_name(name).cloned().ok_or_else(|| {
                shardline_rdbc::Error::schema(format!(
                    "unique key column '{}' missing from result set",
                    name
                ))
            })?,
            None => Value::Null,
        };
        Ok(Self { row, key })
    }

    /// Value of the first unique-key column
    pub fn unique_key(&self) -> &Value {
        &self.key
    }

    /// Underlying row
    pub fn row(&self) -> &Row {
        &self.row
    }

    /// Column values in projection order
    pub fn values(&self) -> &[Value] {
        self.row.values()
    }

    /// Consume into the underlying row
    pub fn into_row(self) -> Row {
        self.row
    }

    /// Whether two records share a leading key value
    pub fn same_key(&self, other: &Record) -> bool {
        same_key(&self.key, &other.key)
    }
}

pub(crate) fn same_key(a: &Value, b: &Value) -> bool {
    a == b || a.compare(b) == Some(Ordering::Equal)
}

/// Largest leading-key value among `records`
pub fn max_unique_key<'a>(records: impl IntoIterator<Item = &'a Record>) -> Option<Value> {
    records
        .into_iter()
        .map(Record::unique_key)
        .filter(|key| !key.is_null())
        .fold(None::<&Value>, |max, key| match max {
            Some(current) if current.compare(key) != Some(Ordering::Less) => Some(current),
            _ => Some(key),
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: i32, order_id: i64) -> Record {
        let row = Row::new(
            vec!["user_id".into(), "order_id".into()],
            vec![Value::Int32(user_id), Value::Int64(order_id)],
        );
        Record::from_row(row, Some("user_id")).unwrap()
    }

    #[test]
    fn test_key_extraction_is_case_insensitive() {
        let row = Row::new(vec!["USER_ID".into()], vec![Value::Int32(9)]);
        let record = Record::from_row(row, Some("user_id")).unwrap();
        assert_eq!(record.unique_key(), &Value::Int32(9));
    }

    #[test]
    fn test_missing_key_column() {
        let row = Row::new(vec!["status".into()], vec![Value::from("ok")]);
        assert!(Record::from_row(row, Some("order_id")).is_err());
    }

    #[test]
    fn test_max_unique_key() {
        let records = vec![record(3, 3), record(5, 9), record(4, 8)];
        assert_eq!(max_unique_key(&records), Some(Value::Int32(5)));
        assert_eq!(max_unique_key(&Vec::<Record>::new()), None);
    }

    #[test]
    fn test_same_key_ignores_later_columns() {
        assert!(record(3, 4).same_key(&record(3, 5)));
        assert!(!record(3, 4).same_key(&record(4, 4)));
    }
}
