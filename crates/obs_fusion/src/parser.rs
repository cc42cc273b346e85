//! Row-to-block conversion for measurement cursors.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::cursor::RowCursor;
use crate::error::Result;
use crate::model::{Field, FieldKind, TimeRange, ID_FIELD};
use crate::result::{ResultBuilder, ResultValue};

/// Column carrying the owning observation id of a measure row.
pub const OBSERVATION_ID_COLUMN: &str = "id_observation";
/// Column carrying the measure row id, whatever the requested fields.
pub const MEASURE_ID_COLUMN: &str = "id_measure";
/// Column carrying the owning observation's begin time.
pub const OBSERVATION_TIME_COLUMN: &str = "time_begin";
/// Column carrying the owning observation's identifier.
pub const OBSERVATION_IDENTIFIER_COLUMN: &str = "identifier";

/// Separator between the identifier prefix and the row id.
pub const ID_SEPARATOR: &str = "-";

/// Reads measure rows field by field.
///
/// Keeps the running first/last time of the rows it has read and, for
/// profiles, the begin time of every observation it met.
#[derive(Debug, Clone)]
pub struct FieldParser {
    fields: Vec<Field>,
    profile: bool,
    include_id: bool,
    /// Fixed identifier prefix; the row's observation identifier otherwise.
    id_prefix: Option<String>,
    first_time: Option<NaiveDateTime>,
    last_time: Option<NaiveDateTime>,
    nb_value: usize,
    observation_times: HashMap<i64, Option<NaiveDateTime>>,
}

impl FieldParser {
    pub fn new(fields: Vec<Field>, profile: bool, include_id: bool) -> Self {
        Self {
            fields,
            profile,
            include_id,
            id_prefix: None,
            first_time: None,
            last_time: None,
            nb_value: 0,
            observation_times: HashMap::new(),
        }
    }

    /// Prefixes identifier values with `prefix` instead of the row's
    /// observation identifier.
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.id_prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn first_time(&self) -> Option<NaiveDateTime> {
        self.first_time
    }

    pub fn last_time(&self) -> Option<NaiveDateTime> {
        self.last_time
    }

    /// Time span of the values read so far.
    pub fn time_range(&self) -> Option<TimeRange> {
        match (self.first_time, self.last_time) {
            (Some(first), Some(last)) if first != last => Some(TimeRange::period(first, last)),
            (Some(first), _) => Some(TimeRange::instant(first)),
            _ => None,
        }
    }

    /// Position in a read line of the value of field `field_position`.
    pub fn value_offset(&self, field_position: usize) -> usize {
        self.fields
            .iter()
            .take(field_position)
            .map(|f| 1 + f.quality.len())
            .sum()
    }

    /// Values appended since construction.
    pub fn nb_value(&self) -> usize {
        self.nb_value
    }

    /// Reads the current row into typed values, one per field and quality
    /// sub-field, in field order.
    ///
    /// Fields positioned before `main_field_offset` that are times are the
    /// synthetic leading time of profiles and take the observation's begin.
    pub fn read_line(
        &mut self,
        cursor: &RowCursor,
        main_field_offset: usize,
    ) -> Result<Vec<ResultValue>> {
        let mut values = Vec::with_capacity(self.fields.len());
        for position in 0..self.fields.len() {
            let field = &self.fields[position];
            let leading_time = self.profile && field.is_time() && position < main_field_offset;
            let value = if leading_time {
                ResultValue::Time(self.observation_time(cursor)?)
            } else {
                let column = field.column_name();
                let is_id = field.name == ID_FIELD;
                let kind = field.kind;
                self.read_value(cursor, &column, kind, is_id)?
            };
            values.push(value);

            let qualities: Vec<(String, FieldKind)> = self.fields[position]
                .quality
                .iter()
                .map(|q| (quality_column(&self.fields[position], q), q.kind))
                .collect();
            for (column, kind) in qualities {
                values.push(self.read_value(cursor, &column, kind, false)?);
            }
        }
        Ok(values)
    }

    /// Reads the current row and appends it to `builder` as one block.
    ///
    /// Returns the number of values appended.
    pub fn parse_line(
        &mut self,
        cursor: &RowCursor,
        main_field_offset: usize,
        builder: &mut ResultBuilder,
    ) -> Result<usize> {
        let values = self.read_line(cursor, main_field_offset)?;
        let appended = values.len();
        builder.new_block();
        for value in values {
            builder.append_value(value);
        }
        builder.end_block();
        self.nb_value += appended;
        Ok(appended)
    }

    /// Counts values appended by a caller that reduced rows itself.
    pub fn record_appended(&mut self, count: usize) {
        self.nb_value += count;
    }

    fn read_value(
        &mut self,
        cursor: &RowCursor,
        column: &str,
        kind: FieldKind,
        is_id: bool,
    ) -> Result<ResultValue> {
        Ok(match kind {
            FieldKind::Time => {
                let value = cursor.get_timestamp(column)?;
                if let Some(t) = value {
                    self.observe_time(t);
                }
                ResultValue::Time(value)
            }
            FieldKind::Quantity => ResultValue::Number(cursor.get_f64(column)?.unwrap_or(f64::NAN)),
            FieldKind::Boolean => ResultValue::Boolean(cursor.get_bool(column)?),
            FieldKind::Text => {
                let value = cursor.get_text(column)?;
                if is_id && self.include_id {
                    ResultValue::Text(self.prefixed_id(cursor, value)?)
                } else {
                    ResultValue::Text(value)
                }
            }
        })
    }

    fn prefixed_id(&self, cursor: &RowCursor, value: Option<String>) -> Result<Option<String>> {
        let prefix = match &self.id_prefix {
            Some(prefix) => Some(prefix.clone()),
            None if cursor.has_column(OBSERVATION_IDENTIFIER_COLUMN) => {
                cursor.get_text(OBSERVATION_IDENTIFIER_COLUMN)?
            }
            None => None,
        };
        Ok(match (prefix, value) {
            (Some(prefix), Some(value)) => Some(format!("{prefix}{ID_SEPARATOR}{value}")),
            (_, value) => value,
        })
    }

    fn observe_time(&mut self, t: NaiveDateTime) {
        self.first_time = Some(self.first_time.map_or(t, |first| first.min(t)));
        self.last_time = Some(self.last_time.map_or(t, |last| last.max(t)));
    }

    /// Begin time of the row's observation, read once per observation.
    fn observation_time(&mut self, cursor: &RowCursor) -> Result<Option<NaiveDateTime>> {
        let observation = cursor.get_i64(OBSERVATION_ID_COLUMN)?.unwrap_or_default();
        if let Some(cached) = self.observation_times.get(&observation) {
            return Ok(*cached);
        }
        let time = cursor.get_timestamp(OBSERVATION_TIME_COLUMN)?;
        if let Some(t) = time {
            self.observe_time(t);
        }
        self.observation_times.insert(observation, time);
        Ok(time)
    }
}

fn quality_column(parent: &Field, quality: &Field) -> String {
    match &quality.parent {
        Some(_) => quality.column_name(),
        None => crate::model::quality_column_name(&parent.name, &quality.name),
    }
}

/// Output names of `fields` with their quality columns, in value order.
pub fn value_names(fields: &[Field]) -> Vec<String> {
    let mut names = Vec::new();
    for field in fields {
        names.push(field.name.clone());
        for quality in &field.quality {
            names.push(quality_column(field, quality));
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::to_millis;
    use crate::model::TIME_FIELD;
    use crate::result::{ComplexResult, ResultMode, TextEncoding};
    use crate::testing::store_with_catalog;

    fn quality_temp() -> Field {
        let mut flag = Field::new(1, FieldKind::Text, "flag");
        flag.parent = Some("TEMP".to_string());
        Field::new(2, FieldKind::Quantity, "TEMP").with_quality(vec![flag])
    }

    #[tokio::test]
    async fn profile_rows_take_the_cached_observation_time() {
        let (_backend, connection) = store_with_catalog().await;
        let mut cursor = connection
            .query(
                "SELECT * FROM (VALUES \
                 (1, 10, TIMESTAMP '2020-01-01T05:00:00', 0.0, CAST(NULL AS DOUBLE), 'good'), \
                 (2, 10, TIMESTAMP '2020-01-01T07:00:00', 50.0, 12.5, CAST(NULL AS VARCHAR))) \
                 AS t(\"id\", \"id_observation\", \"time_begin\", \"DEPTH\", \"TEMP\", \"TEMP_quality_flag\")",
            )
            .await
            .expect("query");

        let fields = vec![
            Field::new(0, FieldKind::Time, TIME_FIELD),
            Field::new(1, FieldKind::Quantity, "DEPTH"),
            quality_temp(),
        ];
        let mut parser = FieldParser::new(fields, true, false);
        let mut builder = ResultBuilder::new(ResultMode::StructuredArray, TextEncoding::default(), false);
        while cursor.next().await.expect("row") {
            assert_eq!(parser.parse_line(&cursor, 1, &mut builder).expect("parse"), 4);
        }
        assert_eq!(parser.nb_value(), 8);
        let first = parser.first_time().expect("first time");
        assert_eq!(parser.last_time(), Some(first));
        assert_eq!(to_millis(first) % 86_400_000, 5 * 3_600_000);

        let ComplexResult::Array { values, .. } = builder.build() else {
            panic!("array result expected");
        };
        assert_eq!(values[1][0], ResultValue::Time(Some(first)));
        assert!(matches!(values[0][2], ResultValue::Number(v) if v.is_nan()));
        assert_eq!(values[0][3], ResultValue::Text(Some("good".to_string())));
        assert_eq!(values[1][3], ResultValue::Text(None));
    }

    #[tokio::test]
    async fn identifiers_are_prefixed_when_requested() {
        let (_backend, connection) = store_with_catalog().await;
        let sql = "SELECT * FROM (VALUES (CAST(3 AS BIGINT), 'obs-1', TIMESTAMP '2020-01-01T00:00:00')) \
                   AS t(\"id\", \"identifier\", \"time\")";
        let fields = vec![
            Field::new(0, FieldKind::Text, ID_FIELD),
            Field::new(1, FieldKind::Time, TIME_FIELD),
        ];

        let mut cursor = connection.query(sql).await.expect("query");
        assert!(cursor.next().await.expect("row"));
        let mut parser = FieldParser::new(fields.clone(), false, true);
        let values = parser.read_line(&cursor, 1).expect("read");
        assert_eq!(values[0], ResultValue::Text(Some("obs-1-3".to_string())));

        let mut named = FieldParser::new(fields, false, true).with_id_prefix("P1");
        let values = named.read_line(&cursor, 1).expect("read");
        assert_eq!(values[0], ResultValue::Text(Some("P1-3".to_string())));
        assert!(named.time_range().expect("range").is_instant());
    }

    #[test]
    fn value_names_include_quality_columns() {
        let names = value_names(&[Field::new(1, FieldKind::Time, TIME_FIELD), quality_temp()]);
        assert_eq!(names, vec!["time", "TEMP", "TEMP_quality_flag"]);
    }
}
