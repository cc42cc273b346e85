//! Forward-only row cursor over DataFusion record batches.
//!
//! Batches are pulled lazily from the execution stream; at most one batch is
//! held at a time. Typed getters read one named column of the current row.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDateTime};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::common::ScalarValue;
use datafusion::physical_plan::SendableRecordBatchStream;
use futures_util::StreamExt;

use crate::error::{Result, StoreError};

/// Source of record batches feeding a cursor.
enum BatchSource {
    Stream(SendableRecordBatchStream),
    Buffered(VecDeque<RecordBatch>),
}

/// Forward-only cursor positioned before the first row until [`RowCursor::next`].
pub struct RowCursor {
    /// SQL text that produced the rows, kept for error reporting.
    query: String,
    source: BatchSource,
    batch: Option<RecordBatch>,
    row: usize,
    rows_read: u64,
}

impl RowCursor {
    /// Wraps a live execution stream.
    pub fn from_stream(query: impl Into<String>, stream: SendableRecordBatchStream) -> Self {
        Self {
            query: query.into(),
            source: BatchSource::Stream(stream),
            batch: None,
            row: 0,
            rows_read: 0,
        }
    }

    /// Wraps already materialized batches.
    pub fn from_batches(query: impl Into<String>, batches: Vec<RecordBatch>) -> Self {
        Self {
            query: query.into(),
            source: BatchSource::Buffered(batches.into()),
            batch: None,
            row: 0,
            rows_read: 0,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Number of rows the cursor has advanced over.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Advances to the next row; returns `false` once the rows are exhausted.
    pub async fn next(&mut self) -> Result<bool> {
        if let Some(batch) = &self.batch {
            if self.row + 1 < batch.num_rows() {
                self.row += 1;
                self.rows_read += 1;
                return Ok(true);
            }
        }
        loop {
            let next = match &mut self.source {
                BatchSource::Buffered(batches) => batches.pop_front(),
                BatchSource::Stream(stream) => match stream.next().await {
                    Some(Ok(batch)) => Some(batch),
                    Some(Err(err)) => return Err(StoreError::execution(self.query.clone(), err)),
                    None => None,
                },
            };
            let Some(batch) = next else {
                self.batch = None;
                return Ok(false);
            };
            // Empty batches are skipped; `row` always addresses a real row.
            if batch.num_rows() > 0 {
                self.batch = Some(batch);
                self.row = 0;
                self.rows_read += 1;
                return Ok(true);
            }
        }
    }

    /// Returns true when the current row has a column named `column`.
    pub fn has_column(&self, column: &str) -> bool {
        self.batch
            .as_ref()
            .map(|batch| batch.schema().index_of(column).is_ok())
            .unwrap_or(false)
    }

    /// Reads one cell of the current row as a DataFusion scalar.
    pub fn scalar(&self, column: &str) -> Result<ScalarValue> {
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| StoreError::decode(column, "cursor is not positioned on a row"))?;
        let index = batch
            .schema()
            .index_of(column)
            .map_err(|_| StoreError::decode(column, "column not present in result"))?;
        ScalarValue::try_from_array(batch.column(index).as_ref(), self.row)
            .map_err(|err| StoreError::decode(column, err.to_string()))
    }

    pub fn get_f64(&self, column: &str) -> Result<Option<f64>> {
        scalar_to_f64(self.scalar(column)?).map_err(|message| StoreError::decode(column, message))
    }

    pub fn get_i64(&self, column: &str) -> Result<Option<i64>> {
        scalar_to_i64(self.scalar(column)?).map_err(|message| StoreError::decode(column, message))
    }

    pub fn get_bool(&self, column: &str) -> Result<Option<bool>> {
        match self.scalar(column)? {
            ScalarValue::Boolean(v) => Ok(v),
            ScalarValue::Null => Ok(None),
            other => Err(StoreError::decode(
                column,
                format!("expected boolean, found {}", other.data_type()),
            )),
        }
    }

    /// Reads any scalar as text; numbers and timestamps are rendered.
    pub fn get_text(&self, column: &str) -> Result<Option<String>> {
        Ok(scalar_to_text(self.scalar(column)?))
    }

    pub fn get_timestamp(&self, column: &str) -> Result<Option<NaiveDateTime>> {
        scalar_to_timestamp(self.scalar(column)?)
            .map_err(|message| StoreError::decode(column, message))
    }
}

/// Converts numeric scalars to `f64`.
pub(crate) fn scalar_to_f64(value: ScalarValue) -> std::result::Result<Option<f64>, String> {
    match value {
        ScalarValue::Float64(v) => Ok(v),
        ScalarValue::Float32(v) => Ok(v.map(f64::from)),
        ScalarValue::Decimal128(v, _, scale) => {
            Ok(v.map(|raw| raw as f64 / 10f64.powi(i32::from(scale))))
        }
        ScalarValue::Null => Ok(None),
        other => match scalar_to_i64(other.clone()) {
            Ok(v) => Ok(v.map(|v| v as f64)),
            Err(_) => Err(format!("expected number, found {}", other.data_type())),
        },
    }
}

/// Converts integer scalars to `i64`.
pub(crate) fn scalar_to_i64(value: ScalarValue) -> std::result::Result<Option<i64>, String> {
    match value {
        ScalarValue::Int64(v) => Ok(v),
        ScalarValue::Int32(v) => Ok(v.map(i64::from)),
        ScalarValue::Int16(v) => Ok(v.map(i64::from)),
        ScalarValue::Int8(v) => Ok(v.map(i64::from)),
        ScalarValue::UInt64(v) => Ok(v.and_then(|v| i64::try_from(v).ok())),
        ScalarValue::UInt32(v) => Ok(v.map(i64::from)),
        ScalarValue::UInt16(v) => Ok(v.map(i64::from)),
        ScalarValue::UInt8(v) => Ok(v.map(i64::from)),
        ScalarValue::Null => Ok(None),
        other => Err(format!("expected integer, found {}", other.data_type())),
    }
}

/// Converts timestamp scalars of any unit to a naive UTC timestamp.
pub(crate) fn scalar_to_timestamp(
    value: ScalarValue,
) -> std::result::Result<Option<NaiveDateTime>, String> {
    let nanos = match value {
        ScalarValue::TimestampNanosecond(v, _) => v,
        ScalarValue::TimestampMicrosecond(v, _) => v.map(|v| v.saturating_mul(1_000)),
        ScalarValue::TimestampMillisecond(v, _) => v.map(|v| v.saturating_mul(1_000_000)),
        ScalarValue::TimestampSecond(v, _) => v.map(|v| v.saturating_mul(1_000_000_000)),
        ScalarValue::Date32(v) => v.map(|days| i64::from(days).saturating_mul(86_400_000_000_000)),
        ScalarValue::Null => None,
        ScalarValue::Utf8(Some(raw))
        | ScalarValue::LargeUtf8(Some(raw))
        | ScalarValue::Utf8View(Some(raw)) => {
            return parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| format!("invalid timestamp text '{raw}'"));
        }
        other => return Err(format!("expected timestamp, found {}", other.data_type())),
    };
    Ok(nanos.and_then(nanos_to_datetime))
}

fn scalar_to_text(value: ScalarValue) -> Option<String> {
    match value {
        ScalarValue::Utf8(v) | ScalarValue::LargeUtf8(v) | ScalarValue::Utf8View(v) => v,
        ScalarValue::Null => None,
        other if other.is_null() => None,
        other => match scalar_to_timestamp(other.clone()) {
            Ok(Some(t)) => Some(t.format(crate::result::CSV_TIME_FORMAT).to_string()),
            _ => Some(other.to_string()),
        },
    }
}

fn nanos_to_datetime(nanos: i64) -> Option<NaiveDateTime> {
    let secs = nanos.div_euclid(1_000_000_000);
    let sub = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, sub).map(|dt| dt.naive_utc())
}

/// Parses ISO-8601 timestamps with or without fractional seconds.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Milliseconds since the epoch of a naive UTC timestamp.
pub fn to_millis(t: NaiveDateTime) -> i64 {
    t.and_utc().timestamp_millis()
}

/// Inverse of [`to_millis`].
pub fn from_millis(millis: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use datafusion::arrow::array::{
        BooleanArray, Float64Array, Int64Array, StringArray, TimestampNanosecondArray,
    };
    use datafusion::arrow::datatypes::{DataType, Field, Schema, TimeUnit};

    fn batch(ids: Vec<i64>, temps: Vec<Option<f64>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("TEMP", DataType::Float64, true),
            Field::new("flag", DataType::Boolean, true),
            Field::new("label", DataType::Utf8, true),
            Field::new("time", DataType::Timestamp(TimeUnit::Nanosecond, None), true),
        ]));
        let n = ids.len();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Float64Array::from(temps)),
                Arc::new(BooleanArray::from(vec![Some(true); n])),
                Arc::new(StringArray::from(vec![Some("a"); n])),
                Arc::new(TimestampNanosecondArray::from(vec![Some(3_600_000_000_000); n])),
            ],
        )
        .expect("valid batch")
    }

    #[tokio::test]
    async fn walks_rows_across_batches_and_skips_empty_ones() {
        let mut cursor = RowCursor::from_batches(
            "SELECT 1",
            vec![
                batch(vec![1, 2], vec![Some(1.5), None]),
                batch(vec![], vec![]),
                batch(vec![3], vec![Some(3.0)]),
            ],
        );
        let mut ids = Vec::new();
        let mut temps = Vec::new();
        while cursor.next().await.expect("advance") {
            ids.push(cursor.get_i64("id").expect("id").expect("non-null id"));
            temps.push(cursor.get_f64("TEMP").expect("temp"));
        }
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(temps, vec![Some(1.5), None, Some(3.0)]);
        assert_eq!(cursor.rows_read(), 3);
    }

    #[tokio::test]
    async fn typed_getters_decode_and_reject() {
        let mut cursor = RowCursor::from_batches("SELECT 1", vec![batch(vec![7], vec![Some(2.0)])]);
        assert!(cursor.next().await.expect("advance"));
        assert_eq!(cursor.get_bool("flag").expect("flag"), Some(true));
        assert_eq!(cursor.get_text("label").expect("label"), Some("a".to_string()));
        assert_eq!(cursor.get_text("id").expect("id as text"), Some("7".to_string()));
        let t = cursor.get_timestamp("time").expect("time").expect("non-null");
        assert_eq!(to_millis(t), 3_600_000);
        assert!(cursor.get_bool("TEMP").is_err());
        assert!(cursor.get_f64("missing").is_err());
    }

    #[test]
    fn parses_iso_timestamps() {
        let t = parse_timestamp("2020-01-01T09:00:00").expect("parse");
        assert_eq!(from_millis(to_millis(t)), Some(t));
        assert!(parse_timestamp("2020-01-01T09:30").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
