//! Procedure and field catalog lookups.
//!
//! Reads `procedures` and `procedure_descriptions` through the connection of
//! the current logical operation. Quality sub-fields are one level deep and
//! only loaded when a caller asks for them.

use tracing::warn;

use crate::backend::StoreConnection;
use crate::cursor::RowCursor;
use crate::error::{Result, StoreError};
use crate::filter::FilterQuery;
use crate::model::{Field, FieldKind, ProcedureInfo, ProcedureKind};

const FIELD_COLUMNS: &str = "pd.\"order\", pd.\"field_name\", pd.\"field_type\", \
    pd.\"field_definition\", pd.\"field_label\", pd.\"field_description\", pd.\"uom\", \
    pd.\"parent\", pd.\"table_number\"";

/// Catalog resolver bound to one connection.
pub struct FieldCatalog<'a> {
    connection: &'a dyn StoreConnection,
}

impl<'a> FieldCatalog<'a> {
    pub fn new(connection: &'a dyn StoreConnection) -> Self {
        Self { connection }
    }

    /// Storage layout of `procedure`; unknown procedures report `(-1, 0)`.
    pub async fn procedure_info(&self, procedure: &str) -> Result<ProcedureInfo> {
        let mut query = FilterQuery::new(
            "pr.\"pid\", pr.\"nb_table\", pr.\"om_type\", pr.\"parent\"",
            "procedures pr",
        );
        let p = query.set_param(procedure);
        query.and(&format!("pr.\"id\" = {p}"));
        let mut cursor = self.connection.query(&query.fill_params()?).await?;
        if !cursor.next().await? {
            return Ok(ProcedureInfo::unknown(procedure));
        }
        let om_type = cursor.get_text("om_type")?;
        let kind = match om_type.as_deref().map(ProcedureKind::parse) {
            Some(Some(kind)) => kind,
            _ => {
                warn!(procedure, om_type = ?om_type, "unknown observation model, using timeseries");
                ProcedureKind::Timeseries
            }
        };
        Ok(ProcedureInfo {
            id: procedure.to_string(),
            pid: cursor.get_i64("pid")?.unwrap_or(-1),
            nb_table: cursor
                .get_i64("nb_table")?
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(0),
            kind,
            parent: cursor.get_text("parent")?,
        })
    }

    /// Ordered top-level fields of `procedure`.
    ///
    /// `exclude_main_time` drops the ordinal-1 field when it is a time field.
    /// An unknown procedure yields an empty list.
    pub async fn read_fields(
        &self,
        procedure: &str,
        exclude_main_time: bool,
        with_quality: bool,
    ) -> Result<Vec<Field>> {
        let query = top_level_query(procedure);
        let mut fields = self.collect(&query).await?;
        if exclude_main_time {
            fields.retain(|f| !(f.index == 1 && f.is_time()));
        }
        if with_quality {
            for field in &mut fields {
                field.quality = self.quality_fields(procedure, &field.name).await?;
            }
        }
        Ok(fields)
    }

    /// Quality sub-fields declared under `parent`.
    pub async fn quality_fields(&self, procedure: &str, parent: &str) -> Result<Vec<Field>> {
        let mut query = FilterQuery::new(FIELD_COLUMNS, "procedure_descriptions pd");
        let p = query.set_param(procedure);
        let q = query.set_param(parent);
        query.and(&format!("pd.\"procedure\" = {p}"));
        query.and(&format!("pd.\"parent\" = {q}"));
        let query = query.with_order_by(vec!["pd.\"order\"".to_string()]);
        self.collect(&query).await
    }

    /// Field with ordinal `index`.
    pub async fn field_by_index(&self, procedure: &str, index: usize) -> Result<Field> {
        let mut query = top_level_query(procedure);
        let i = query.set_param(index as i64);
        query.and(&format!("pd.\"order\" = {i}"));
        self.single(procedure, &index.to_string(), &query).await
    }

    pub async fn field_by_name(&self, procedure: &str, name: &str) -> Result<Field> {
        let mut query = top_level_query(procedure);
        let n = query.set_param(name);
        query.and(&format!("pd.\"field_name\" = {n}"));
        self.single(procedure, name, &query).await
    }

    /// Field measuring `phenomenon`, matched on definition then name.
    pub async fn field_by_phenomenon(&self, procedure: &str, phenomenon: &str) -> Result<Field> {
        let mut query = top_level_query(procedure);
        let ph = query.set_param(phenomenon);
        query.and(&format!(
            "(pd.\"field_definition\" = {ph} OR pd.\"field_name\" = {ph})"
        ));
        self.single(procedure, phenomenon, &query).await
    }

    /// Field of ordinal 1; every procedure with measures has one.
    pub async fn main_field(&self, procedure: &str) -> Result<Field> {
        self.field_by_index(procedure, 1).await
    }

    async fn single(&self, procedure: &str, label: &str, query: &FilterQuery) -> Result<Field> {
        self.collect(query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::FieldNotFound {
                procedure: procedure.to_string(),
                field: label.to_string(),
            })
    }

    async fn collect(&self, query: &FilterQuery) -> Result<Vec<Field>> {
        let mut cursor = self.connection.query(&query.fill_params()?).await?;
        let mut fields = Vec::new();
        while cursor.next().await? {
            fields.push(field_from_row(&cursor)?);
        }
        Ok(fields)
    }
}

fn top_level_query(procedure: &str) -> FilterQuery {
    let mut query = FilterQuery::new(FIELD_COLUMNS, "procedure_descriptions pd");
    let p = query.set_param(procedure);
    query.and(&format!("pd.\"procedure\" = {p}"));
    query.and("pd.\"parent\" IS NULL");
    query.with_order_by(vec!["pd.\"order\"".to_string()])
}

fn field_from_row(cursor: &RowCursor) -> Result<Field> {
    let name = cursor
        .get_text("field_name")?
        .ok_or_else(|| StoreError::decode("field_name", "field without a name"))?;
    let index = cursor
        .get_i64("order")?
        .and_then(|i| usize::try_from(i).ok())
        .unwrap_or(0);
    let raw_type = cursor.get_text("field_type")?.unwrap_or_default();
    let kind = FieldKind::parse(&raw_type).unwrap_or_else(|| {
        warn!(field = %name, field_type = %raw_type, "unknown field type, reading as text");
        FieldKind::Text
    });
    let table_number = cursor
        .get_i64("table_number")?
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(1);
    let mut field = Field::new(index, kind, name).with_table_number(table_number);
    field.definition = cursor.get_text("field_definition")?;
    field.label = cursor.get_text("field_label")?;
    field.description = cursor.get_text("field_description")?;
    field.uom = cursor.get_text("uom")?;
    field.parent = cursor.get_text("parent")?;
    Ok(field)
}
