//! Result retrieval for one procedure.
//!
//! The processor owns the effective field list of a request, turns the
//! selection's base query into the final projection and ordering, and drives
//! the [`FieldParser`] over the cursor into a [`ResultBuilder`].

use tracing::debug;

use crate::backend::StoreConnection;
use crate::catalog::FieldCatalog;
use crate::cursor::RowCursor;
use crate::error::{Result, StoreError};
use crate::filter::{quote_ident, FilterQuery};
use crate::join::MeasureJoinPlan;
use crate::model::{
    Field, FieldKind, ProcedureInfo, ProcedureKind, TimeRange, ID_FIELD, LAT_FIELD, LON_FIELD,
    TIME_FIELD,
};
use crate::parser::{
    value_names, FieldParser, MEASURE_ID_COLUMN, OBSERVATION_IDENTIFIER_COLUMN,
    OBSERVATION_ID_COLUMN, OBSERVATION_TIME_COLUMN,
};
use crate::result::{ResultBuilder, ResultMode, TextEncoding};

/// Response format producing delimited text with a header row.
pub const CSV_FORMAT: &str = "text/csv";
/// Response format producing a structured array of typed rows.
pub const ARRAY_FORMAT: &str = "resultArray";

/// Selects the encoding of a response.
///
/// `text/csv` gives CSV with a header, `resultArray` a structured array and a
/// count-only request a count; anything else is CSV without header.
pub fn init_result_builder(
    format: Option<&str>,
    count_only: bool,
    encoding: TextEncoding,
) -> ResultBuilder {
    if count_only {
        return ResultBuilder::new(ResultMode::Count, encoding, false);
    }
    match format {
        Some(CSV_FORMAT) => ResultBuilder::new(ResultMode::Csv, encoding, true),
        Some(ARRAY_FORMAT) => ResultBuilder::new(ResultMode::StructuredArray, encoding, false),
        _ => ResultBuilder::new(ResultMode::Csv, encoding, false),
    }
}

/// Which fields a request wants and which synthetic columns to add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldOptions {
    /// Field names or definitions to keep; empty keeps every field.
    pub properties: Vec<String>,
    pub include_id: bool,
    /// Adds the observation time in front of profile rows.
    pub include_time_for_profile: bool,
    pub include_quality: bool,
    /// Orders rows by owning observation before the main field.
    pub by_observation: bool,
}

/// Effective fields of one request, main field included.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldList {
    pub fields: Vec<Field>,
    pub main_field: Field,
    /// Position of the main field in `fields`.
    pub main_offset: usize,
}

/// Builds the effective field list of `info`.
///
/// Layout: synthetic `id`, synthetic profile `time`, main field, trajectory
/// `lat`/`lon`, then the selected fields in catalog order.
pub async fn build_field_list(
    catalog: &FieldCatalog<'_>,
    info: &ProcedureInfo,
    options: &FieldOptions,
) -> Result<FieldList> {
    let mut main_field = catalog.main_field(&info.id).await?;
    let catalog_fields = catalog
        .read_fields(&info.id, false, options.include_quality)
        .await?;
    if let Some(loaded) = catalog_fields.iter().find(|f| f.index == main_field.index) {
        main_field = loaded.clone();
    }

    let mut fields = Vec::with_capacity(catalog_fields.len() + 4);
    if options.include_id {
        fields.push(Field::new(0, FieldKind::Text, ID_FIELD));
    }
    if info.kind.is_profile() && options.include_time_for_profile {
        fields.push(Field::new(0, FieldKind::Time, TIME_FIELD));
    }
    let main_offset = fields.len();
    fields.push(main_field.clone());

    let has_field = |name: &str| catalog_fields.iter().any(|f| f.name == name);
    if info.kind == ProcedureKind::Trajectory && !has_field(LAT_FIELD) && !has_field(LON_FIELD) {
        fields.push(Field::new(0, FieldKind::Quantity, LAT_FIELD));
        fields.push(Field::new(0, FieldKind::Quantity, LON_FIELD));
    }

    for field in catalog_fields {
        if field.index == main_field.index {
            continue;
        }
        let selected = options.properties.is_empty()
            || options.properties.iter().any(|p| {
                *p == field.name || field.definition.as_deref() == Some(p.as_str())
            });
        if selected {
            fields.push(field);
        }
    }
    Ok(FieldList {
        fields,
        main_field,
        main_offset,
    })
}

/// Part a projected column plays in a measure query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Main,
    Id,
    Value,
    /// Bookkeeping column read by the parser (observation id, begin time).
    Structural,
}

/// One select-list entry of a measure query.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnProjection {
    pub expr: String,
    pub alias: String,
    pub kind: FieldKind,
    pub role: ColumnRole,
}

impl ColumnProjection {
    fn new(expr: impl Into<String>, alias: impl Into<String>, kind: FieldKind, role: ColumnRole) -> Self {
        Self {
            expr: expr.into(),
            alias: alias.into(),
            kind,
            role,
        }
    }

    pub fn render(&self) -> String {
        format!("{} AS {}", self.expr, quote_ident(&self.alias))
    }
}

/// Result retrieval state of one request on one procedure.
pub struct ResultProcessor {
    info: ProcedureInfo,
    plan: MeasureJoinPlan,
    list: FieldList,
    options: FieldOptions,
    builder: ResultBuilder,
    time_range: Option<TimeRange>,
}

impl ResultProcessor {
    pub fn new(
        info: ProcedureInfo,
        list: FieldList,
        options: FieldOptions,
        mut builder: ResultBuilder,
    ) -> Self {
        builder.set_header(value_names(&list.fields));
        let plan = MeasureJoinPlan::new(info.pid, info.nb_table);
        Self {
            info,
            plan,
            list,
            options,
            builder,
            time_range: None,
        }
    }

    pub fn info(&self) -> &ProcedureInfo {
        &self.info
    }

    pub fn plan(&self) -> &MeasureJoinPlan {
        &self.plan
    }

    pub fn fields(&self) -> &[Field] {
        &self.list.fields
    }

    pub fn main_field(&self) -> &Field {
        &self.list.main_field
    }

    pub fn main_offset(&self) -> usize {
        self.list.main_offset
    }

    pub fn builder(&self) -> &ResultBuilder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut ResultBuilder {
        &mut self.builder
    }

    pub fn into_builder(self) -> ResultBuilder {
        self.builder
    }

    /// Time span covered by the rows processed so far.
    pub fn time_range(&self) -> Option<TimeRange> {
        self.time_range
    }

    pub(crate) fn record_time_range(&mut self, range: Option<TimeRange>) {
        self.time_range = match (self.time_range, range) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        };
    }

    /// Qualified column of the main field.
    pub fn main_column(&self) -> Result<String> {
        self.plan.column(&self.list.main_field)
    }

    /// Main column when the main field is a time, used by temporal filters.
    pub fn main_time_column(&self) -> Result<Option<String>> {
        if self.list.main_field.is_time() {
            self.main_column().map(Some)
        } else {
            Ok(None)
        }
    }

    fn uses_positions(&self) -> bool {
        self.info.kind == ProcedureKind::Trajectory
            && self
                .list
                .fields
                .iter()
                .any(|f| f.index == 0 && (f.name == LAT_FIELD || f.name == LON_FIELD))
    }

    /// Select-list of the measure query, in parser order, followed by the
    /// bookkeeping columns.
    pub fn projections(&self) -> Result<Vec<ColumnProjection>> {
        let mut out = Vec::new();
        for (position, field) in self.list.fields.iter().enumerate() {
            if position == self.list.main_offset {
                out.push(ColumnProjection::new(
                    self.main_column()?,
                    field.name.clone(),
                    field.kind,
                    ColumnRole::Main,
                ));
            } else if field.index == 0 {
                match field.name.as_str() {
                    ID_FIELD => out.push(ColumnProjection::new(
                        "m.\"id\"",
                        ID_FIELD,
                        FieldKind::Text,
                        ColumnRole::Id,
                    )),
                    LAT_FIELD => out.push(ColumnProjection::new(
                        "hl.\"y\"",
                        LAT_FIELD,
                        FieldKind::Quantity,
                        ColumnRole::Value,
                    )),
                    LON_FIELD => out.push(ColumnProjection::new(
                        "hl.\"x\"",
                        LON_FIELD,
                        FieldKind::Quantity,
                        ColumnRole::Value,
                    )),
                    // Synthetic profile time comes from the observation.
                    _ => {}
                }
                continue;
            } else {
                out.push(ColumnProjection::new(
                    self.plan.column(field)?,
                    field.name.clone(),
                    field.kind,
                    ColumnRole::Value,
                ));
            }
            for quality in &field.quality {
                let mut quality = quality.clone();
                quality.parent = Some(field.name.clone());
                quality.table_number = field.table_number;
                let column = quality.column_name();
                out.push(ColumnProjection::new(
                    self.plan.column(&quality)?,
                    column,
                    quality.kind,
                    ColumnRole::Value,
                ));
            }
        }
        out.push(ColumnProjection::new(
            "m.\"id_observation\"",
            OBSERVATION_ID_COLUMN,
            FieldKind::Quantity,
            ColumnRole::Structural,
        ));
        out.push(ColumnProjection::new(
            "m.\"id\"",
            MEASURE_ID_COLUMN,
            FieldKind::Quantity,
            ColumnRole::Structural,
        ));
        if self.info.kind.is_profile() {
            out.push(ColumnProjection::new(
                "o.\"time_begin\"",
                OBSERVATION_TIME_COLUMN,
                FieldKind::Time,
                ColumnRole::Structural,
            ));
        }
        if self.options.include_id {
            out.push(ColumnProjection::new(
                "o.\"identifier\"",
                OBSERVATION_IDENTIFIER_COLUMN,
                FieldKind::Text,
                ColumnRole::Structural,
            ));
        }
        Ok(out)
    }

    /// Finalizes `base` (a [`crate::selection::result_query`]) into the
    /// executable measure query.
    pub fn compute_request(&self, base: &FilterQuery) -> Result<FilterQuery> {
        if self.plan.is_empty() {
            return Err(StoreError::InvalidRequest(format!(
                "procedure {} has no measure table",
                self.info.id
            )));
        }
        let projection = self
            .projections()?
            .iter()
            .map(ColumnProjection::render)
            .collect::<Vec<_>>()
            .join(", ");
        let main = self.main_column()?;
        let mut query = base.with_projection(projection);
        if self.uses_positions() {
            query.join(&format!(
                "LEFT JOIN historical_locations hl ON hl.\"procedure\" = o.\"procedure\" AND hl.\"time\" = {main}"
            ));
        }
        let mut order = Vec::with_capacity(3);
        if self.info.kind.is_profile() || self.options.by_observation {
            order.push("m.\"id_observation\"".to_string());
        }
        order.push(main);
        order.push("m.\"id\"".to_string());
        Ok(query.with_order_by(order))
    }

    /// New parser over the request's fields; `name` prefixes identifiers.
    pub fn parser(&self, name: &str) -> FieldParser {
        FieldParser::new(
            self.list.fields.clone(),
            self.info.kind.is_profile(),
            self.options.include_id,
        )
        .with_id_prefix(name)
    }

    /// Streams every row of `cursor` into the builder; returns the rows read.
    pub async fn process_results(&mut self, cursor: &mut RowCursor, name: &str) -> Result<u64> {
        let mut parser = self.parser(name);
        let offset = self.list.main_offset;
        let mut rows = 0u64;
        while cursor.next().await? {
            parser.parse_line(cursor, offset, &mut self.builder)?;
            rows += 1;
        }
        self.record_time_range(parser.time_range());
        debug!(
            procedure = %self.info.id,
            rows,
            values = parser.nb_value(),
            "processed measure rows"
        );
        Ok(rows)
    }
}

/// Counts the rows `query` would return, pagination included.
pub async fn count_results(connection: &dyn StoreConnection, query: &FilterQuery) -> Result<u64> {
    let inner = query.without_order().fill_params()?;
    let sql = format!("SELECT COUNT(*) AS \"count\" FROM ({inner}) AS counted");
    let mut cursor = connection.query(&sql).await?;
    if !cursor.next().await? {
        return Ok(0);
    }
    Ok(cursor
        .get_i64("count")?
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ComplexResult;
    use crate::selection::{result_query, Selection};
    use crate::testing::store_with_catalog;

    const FIXTURE: &[&str] = &[
        "INSERT INTO procedures VALUES ('P1', 1, 2, 'timeseries', NULL, NULL, NULL)",
        "INSERT INTO procedure_descriptions VALUES \
         ('P1', 1, 'time', 'Time', NULL, NULL, NULL, NULL, NULL, 1), \
         ('P1', 2, 'TEMP', 'Quantity', 'urn:temp', NULL, NULL, 'degC', NULL, 1), \
         ('P1', 3, 'SAL', 'Quantity', 'urn:sal', NULL, NULL, 'psu', NULL, 2)",
        "INSERT INTO observations VALUES \
         (1, 'obs-1', 'P1', 'station-1', 'aggregate', TIMESTAMP '2020-01-01T00:00:00', TIMESTAMP '2020-01-01T02:00:00')",
        "CREATE TABLE mesure1 (\"id\" BIGINT, \"id_observation\" BIGINT, \"time\" TIMESTAMP, \"TEMP\" DOUBLE)",
        "CREATE TABLE mesure1_2 (\"id\" BIGINT, \"id_observation\" BIGINT, \"SAL\" DOUBLE)",
        "INSERT INTO mesure1 VALUES \
         (1, 1, TIMESTAMP '2020-01-01T00:00:00', 10.0), \
         (2, 1, TIMESTAMP '2020-01-01T01:00:00', 11.0), \
         (3, 1, TIMESTAMP '2020-01-01T02:00:00', NULL)",
        "INSERT INTO mesure1_2 VALUES (1, 1, 35.0), (2, 1, 35.5), (3, 1, 36.0)",
    ];

    #[test]
    fn response_format_selects_encoding() {
        let enc = TextEncoding::default;
        assert_eq!(init_result_builder(Some("text/csv"), false, enc()).mode(), ResultMode::Csv);
        assert_eq!(
            init_result_builder(Some("resultArray"), false, enc()).mode(),
            ResultMode::StructuredArray
        );
        assert_eq!(init_result_builder(Some("text/csv"), true, enc()).mode(), ResultMode::Count);
        assert_eq!(init_result_builder(None, false, enc()).mode(), ResultMode::Csv);
    }

    #[tokio::test]
    async fn reads_fields_across_measure_tables() {
        let (_backend, connection) = store_with_catalog().await;
        for sql in FIXTURE {
            connection.execute(sql).await.expect("fixture");
        }
        let catalog = FieldCatalog::new(connection.as_ref());
        let info = catalog.procedure_info("P1").await.expect("info");
        let options = FieldOptions {
            properties: vec!["urn:sal".to_string()],
            include_id: true,
            ..FieldOptions::default()
        };
        let list = build_field_list(&catalog, &info, &options).await.expect("fields");
        let names: Vec<&str> = list.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "time", "SAL"]);
        assert_eq!(list.main_offset, 1);

        let builder = init_result_builder(Some(CSV_FORMAT), false, TextEncoding::default());
        let mut processor = ResultProcessor::new(info, list, options, builder);
        let base = result_query(
            processor.plan(),
            &Selection::new().with_procedure("P1"),
            processor.main_time_column().expect("main").as_deref(),
        );
        let request = processor.compute_request(&base).expect("request");
        let sql = request.fill_params().expect("bind");
        assert!(sql.contains("m2.\"SAL\" AS \"SAL\""));
        assert!(sql.ends_with("ORDER BY m.\"time\", m.\"id\""));

        let mut cursor = connection.query(&sql).await.expect("query");
        assert_eq!(processor.process_results(&mut cursor, "").await.expect("rows"), 3);
        assert_eq!(
            processor.time_range().map(|r| r.is_instant()),
            Some(false)
        );
        let ComplexResult::Csv { values, nb_values, .. } = processor.into_builder().build() else {
            panic!("csv expected");
        };
        assert_eq!(nb_values, 3);
        let lines: Vec<&str> = values.lines().collect();
        assert_eq!(lines[0], "id,time,SAL");
        assert_eq!(lines[1], "obs-1-1,2020-01-01T00:00:00,35");
        assert_eq!(lines[3], "obs-1-3,2020-01-01T02:00:00,36");

        assert_eq!(count_results(connection.as_ref(), &request).await.expect("count"), 3);
    }
}
