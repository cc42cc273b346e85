//! Join chain across the physical measure tables of one procedure.
//!
//! A procedure with many fields is split over `nb_table` tables so that no
//! table exceeds the configured column ceiling. The first table is `mesure{pid}`
//! aliased `m`; table `n` is `mesure{pid}_{n}` aliased `m{n}` and is joined to
//! `m` on both the row id and the owning observation id.

use crate::error::{Result, StoreError};
use crate::filter::quote_ident;
use crate::model::Field;

/// Alias of the base measure table.
pub const BASE_ALIAS: &str = "m";

/// Physical name of measure table `table_number` (1-based) of procedure `pid`.
pub fn measure_table_name(pid: i64, table_number: usize) -> String {
    if table_number <= 1 {
        format!("mesure{pid}")
    } else {
        format!("mesure{pid}_{table_number}")
    }
}

/// Alias of measure table `table_number` inside the join chain.
pub fn measure_alias(table_number: usize) -> String {
    if table_number <= 1 {
        BASE_ALIAS.to_string()
    } else {
        format!("{BASE_ALIAS}{table_number}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MeasureTable {
    name: String,
    alias: String,
}

/// Ordered measure tables of one procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureJoinPlan {
    pid: i64,
    tables: Vec<MeasureTable>,
}

impl MeasureJoinPlan {
    /// Plans `nb_table` tables; `nb_table == 0` (unknown procedure) yields an
    /// empty plan.
    pub fn new(pid: i64, nb_table: usize) -> Self {
        let tables = (1..=nb_table)
            .map(|n| MeasureTable {
                name: measure_table_name(pid, n),
                alias: measure_alias(n),
            })
            .collect();
        Self { pid, tables }
    }

    pub fn pid(&self) -> i64 {
        self.pid
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn alias_for(&self, table_number: usize) -> Option<&str> {
        table_number
            .checked_sub(1)
            .and_then(|idx| self.tables.get(idx))
            .map(|t| t.alias.as_str())
    }

    /// `FROM` text of the chain: base table then one join per extra table.
    pub fn from_clause(&self) -> String {
        let mut tables = self.tables.iter();
        let Some(base) = tables.next() else {
            return String::new();
        };
        let mut out = format!("{} {}", base.name, base.alias);
        for table in tables {
            out.push_str(&format!(
                " JOIN {name} {alias} ON {alias}.\"id\" = {base}.\"id\" AND {alias}.\"id_observation\" = {base}.\"id_observation\"",
                name = table.name,
                alias = table.alias,
                base = base.alias,
            ));
        }
        out
    }

    /// Qualified column holding `field`, addressed through its table alias.
    pub fn column(&self, field: &Field) -> Result<String> {
        let alias = self.alias_for(field.table_number).ok_or_else(|| {
            StoreError::InvalidRequest(format!(
                "field {} lives in measure table {} but procedure {} has {} table(s)",
                field.name,
                field.table_number,
                self.pid,
                self.tables.len()
            ))
        })?;
        Ok(format!("{alias}.{}", quote_ident(&field.column_name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldKind;

    #[test]
    fn plan_references_every_table_once() {
        for k in 1..=4usize {
            let plan = MeasureJoinPlan::new(7, k);
            let from = plan.from_clause();
            assert_eq!(plan.table_count(), k);
            assert!(from.starts_with("mesure7 m"));
            assert_eq!(from.matches(" JOIN ").count(), k - 1);
            for n in 2..=k {
                assert!(from.contains(&format!(
                    "JOIN mesure7_{n} m{n} ON m{n}.\"id\" = m.\"id\" AND m{n}.\"id_observation\" = m.\"id_observation\""
                )));
            }
            assert!(!from.contains(&format!("mesure7_{}", k + 1)));
        }
    }

    #[test]
    fn unknown_procedure_has_no_tables() {
        let plan = MeasureJoinPlan::new(-1, 0);
        assert!(plan.is_empty());
        assert_eq!(plan.from_clause(), "");
        assert!(plan.alias_for(1).is_none());
    }

    #[test]
    fn columns_are_qualified_by_their_table() {
        let plan = MeasureJoinPlan::new(3, 2);
        let temp = Field::new(2, FieldKind::Quantity, "TEMP");
        let sal = Field::new(3, FieldKind::Quantity, "SAL").with_table_number(2);
        assert_eq!(plan.column(&temp).expect("temp"), "m.\"TEMP\"");
        assert_eq!(plan.column(&sal).expect("sal"), "m2.\"SAL\"");
        let stray = Field::new(4, FieldKind::Quantity, "PSAL").with_table_number(3);
        assert!(plan.column(&stray).is_err());
    }
}
