//! DDL of the backing relational schema.
//!
//! The engine only reads these tables; the statements exist for tools and
//! fixtures that need an empty store with the expected layout.

use crate::backend::StoreConnection;
use crate::error::Result;
use crate::filter::{quote_ident, quote_literal};
use crate::join::measure_table_name;
use crate::model::{Field, FieldKind};

/// Catalog and observation tables, in creation order.
pub const CATALOG_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS procedures (\
        \"id\" VARCHAR, \"pid\" BIGINT, \"nb_table\" BIGINT, \"om_type\" VARCHAR, \
        \"parent\" VARCHAR, \"shape\" VARCHAR, \"crs\" BIGINT)",
    "CREATE TABLE IF NOT EXISTS procedure_descriptions (\
        \"procedure\" VARCHAR, \"order\" BIGINT, \"field_name\" VARCHAR, \
        \"field_type\" VARCHAR, \"field_definition\" VARCHAR, \"field_label\" VARCHAR, \
        \"field_description\" VARCHAR, \"uom\" VARCHAR, \"parent\" VARCHAR, \
        \"table_number\" BIGINT)",
    "CREATE TABLE IF NOT EXISTS observations (\
        \"id\" BIGINT, \"identifier\" VARCHAR, \"procedure\" VARCHAR, \"foi\" VARCHAR, \
        \"observed_property\" VARCHAR, \"time_begin\" TIMESTAMP, \"time_end\" TIMESTAMP)",
    "CREATE TABLE IF NOT EXISTS components (\
        \"phenomenon\" VARCHAR, \"component\" VARCHAR, \"order\" BIGINT)",
    "CREATE TABLE IF NOT EXISTS observed_properties (\
        \"id\" VARCHAR, \"name\" VARCHAR, \"definition\" VARCHAR, \"description\" VARCHAR)",
    "CREATE TABLE IF NOT EXISTS sampling_features (\
        \"id\" VARCHAR, \"name\" VARCHAR, \"description\" VARCHAR, \
        \"sampledfeature\" VARCHAR, \"shape\" VARCHAR, \"crs\" BIGINT)",
    "CREATE TABLE IF NOT EXISTS historical_locations (\
        \"procedure\" VARCHAR, \"time\" TIMESTAMP, \"x\" DOUBLE, \"y\" DOUBLE, \"crs\" BIGINT)",
];

/// SQL type of a field column.
pub fn sql_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Time => "TIMESTAMP",
        FieldKind::Quantity => "DOUBLE",
        FieldKind::Boolean => "BOOLEAN",
        FieldKind::Text => "VARCHAR",
    }
}

/// Spreads `fields` over measure tables holding at most `max_fields_per_table`
/// fields each. The main field (first entry) always lands in table 1.
pub fn assign_table_numbers(fields: &[Field], max_fields_per_table: usize) -> Vec<Field> {
    let per_table = max_fields_per_table.max(1);
    fields
        .iter()
        .enumerate()
        .map(|(position, field)| {
            let mut field = field.clone();
            field.table_number = position / per_table + 1;
            field
        })
        .collect()
}

/// `CREATE TABLE` statements for every measure table of procedure `pid`.
///
/// Tables are derived from the fields' `table_number`; quality sub-fields add
/// one `<parent>_quality_<child>` column next to their parent.
pub fn measure_tables_ddl(pid: i64, fields: &[Field]) -> Vec<String> {
    let nb_table = fields.iter().map(|f| f.table_number).max().unwrap_or(1);
    (1..=nb_table)
        .map(|table_number| {
            let mut columns = vec![
                "\"id\" BIGINT".to_string(),
                "\"id_observation\" BIGINT".to_string(),
            ];
            for field in fields.iter().filter(|f| f.table_number == table_number) {
                columns.push(format!(
                    "{} {}",
                    quote_ident(&field.column_name()),
                    sql_type(field.kind)
                ));
                for quality in &field.quality {
                    let mut quality = quality.clone();
                    quality.parent.get_or_insert_with(|| field.name.clone());
                    columns.push(format!(
                        "{} {}",
                        quote_ident(&quality.column_name()),
                        sql_type(quality.kind)
                    ));
                }
            }
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                measure_table_name(pid, table_number),
                columns.join(", ")
            )
        })
        .collect()
}

/// Places `fields` over the measure tables of procedure `pid`, records them in
/// `procedure_descriptions` and creates the tables.
///
/// Returns the placed fields. Their highest `table_number` is the `nb_table`
/// the procedure's catalog row must carry.
pub async fn create_measure_tables(
    connection: &dyn StoreConnection,
    procedure: &str,
    pid: i64,
    fields: &[Field],
    max_fields_per_table: usize,
) -> Result<Vec<Field>> {
    let placed = assign_table_numbers(fields, max_fields_per_table);
    let rows = description_rows(procedure, &placed);
    if !rows.is_empty() {
        connection
            .execute(&format!(
                "INSERT INTO procedure_descriptions VALUES {}",
                rows.join(", ")
            ))
            .await?;
    }
    for ddl in measure_tables_ddl(pid, &placed) {
        connection.execute(&ddl).await?;
    }
    Ok(placed)
}

/// `procedure_descriptions` rows of placed fields, quality sub-fields
/// included under their parent's table.
fn description_rows(procedure: &str, fields: &[Field]) -> Vec<String> {
    let mut rows = Vec::new();
    for field in fields {
        rows.push(description_row(procedure, field, None, field.table_number));
        for quality in &field.quality {
            rows.push(description_row(
                procedure,
                quality,
                Some(&field.name),
                field.table_number,
            ));
        }
    }
    rows
}

fn description_row(
    procedure: &str,
    field: &Field,
    parent: Option<&str>,
    table_number: usize,
) -> String {
    let text = |value: Option<&str>| value.map(quote_literal).unwrap_or_else(|| "NULL".to_string());
    format!(
        "({}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
        quote_literal(procedure),
        field.index,
        quote_literal(&field.name),
        quote_literal(field.kind.as_str()),
        text(field.definition.as_deref()),
        text(field.label.as_deref()),
        text(field.description.as_deref()),
        text(field.uom.as_deref()),
        text(parent),
        table_number
    )
}

/// Creates the catalog and observation tables on `connection`.
pub async fn create_catalog(connection: &dyn StoreConnection) -> Result<()> {
    for ddl in CATALOG_DDL {
        connection.execute(ddl).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_spread_over_tables() {
        let fields: Vec<Field> = ["time", "TEMP", "SAL", "PSAL", "CNDC"]
            .iter()
            .enumerate()
            .map(|(i, name)| Field::new(i + 1, FieldKind::Quantity, *name))
            .collect();
        let placed = assign_table_numbers(&fields, 2);
        let tables: Vec<usize> = placed.iter().map(|f| f.table_number).collect();
        assert_eq!(tables, vec![1, 1, 2, 2, 3]);

        let ddl = measure_tables_ddl(5, &placed);
        assert_eq!(ddl.len(), 3);
        assert!(ddl[0].starts_with("CREATE TABLE IF NOT EXISTS mesure5 ("));
        assert!(ddl[2].contains("mesure5_3"));
        assert!(ddl[2].contains("\"CNDC\" DOUBLE"));
    }

    #[test]
    fn quality_columns_follow_their_parent() {
        let flag = Field::new(1, FieldKind::Text, "flag");
        let temp = Field::new(2, FieldKind::Quantity, "TEMP").with_quality(vec![flag]);
        let ddl = measure_tables_ddl(1, &[temp]);
        assert!(ddl[0].contains("\"TEMP\" DOUBLE, \"TEMP_quality_flag\" VARCHAR"));
    }

    #[test]
    fn description_rows_put_quality_under_their_parent() {
        let flag = Field::new(1, FieldKind::Text, "flag");
        let mut sal = Field::new(2, FieldKind::Quantity, "SAL").with_quality(vec![flag]);
        sal.definition = Some("urn:o'sal".to_string());
        let placed = assign_table_numbers(&[Field::new(1, FieldKind::Time, "time"), sal], 1);
        let rows = description_rows("P9", &placed);
        assert_eq!(
            rows,
            vec![
                "('P9', 1, 'time', 'Time', NULL, NULL, NULL, NULL, NULL, 1)",
                "('P9', 2, 'SAL', 'Quantity', 'urn:o''sal', NULL, NULL, NULL, NULL, 2)",
                "('P9', 1, 'flag', 'Text', NULL, NULL, NULL, NULL, 'SAL', 2)",
            ]
        );
    }
}
