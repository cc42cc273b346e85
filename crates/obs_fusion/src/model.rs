//! Read-only domain entities reconstructed from the backing store per request.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::geometry::{Coord, Geometry};
use crate::result::ComplexResult;

/// Name of the synthetic row identifier field.
pub const ID_FIELD: &str = "id";
/// Name of the time field (main field of timeseries, leading field of profiles).
pub const TIME_FIELD: &str = "time";
/// Synthetic latitude field projected for trajectories.
pub const LAT_FIELD: &str = "lat";
/// Synthetic longitude field projected for trajectories.
pub const LON_FIELD: &str = "lon";

/// Observation model of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureKind {
    Timeseries,
    Profile,
    Trajectory,
}

impl ProcedureKind {
    /// Parses the `om_type` column value.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "timeseries" => Some(Self::Timeseries),
            "profile" => Some(Self::Profile),
            "trajectory" => Some(Self::Trajectory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeseries => "timeseries",
            Self::Profile => "profile",
            Self::Trajectory => "trajectory",
        }
    }

    /// Profiles are ordered by a non-time main field.
    pub fn is_profile(&self) -> bool {
        matches!(self, Self::Profile)
    }
}

/// Storage-level description of one procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureInfo {
    /// Public procedure identifier.
    pub id: String,
    /// Internal numeric id used to name measure tables, `-1` when unknown.
    pub pid: i64,
    /// Number of physical measure tables, `0` when unknown.
    pub nb_table: usize,
    pub kind: ProcedureKind,
    pub parent: Option<String>,
}

impl ProcedureInfo {
    /// Placeholder for a procedure absent from the store.
    pub fn unknown(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pid: -1,
            nb_table: 0,
            kind: ProcedureKind::Timeseries,
            parent: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.pid >= 0 && self.nb_table > 0
    }
}

/// Value kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Time,
    Quantity,
    Boolean,
    Text,
}

impl FieldKind {
    /// Parses the `field_type` catalog column (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "time" => Some(Self::Time),
            "quantity" => Some(Self::Quantity),
            "boolean" => Some(Self::Boolean),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "Time",
            Self::Quantity => "Quantity",
            Self::Boolean => "Boolean",
            Self::Text => "Text",
        }
    }
}

/// One measured or structural column of a procedure's dynamic schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// 1-based ordinal, unique within a procedure and parent scope.
    pub index: usize,
    pub kind: FieldKind,
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    /// Observed-property definition the field measures.
    pub definition: Option<String>,
    pub uom: Option<String>,
    /// 1-based physical measure table holding the column.
    pub table_number: usize,
    /// Name of the owning field for quality sub-fields.
    pub parent: Option<String>,
    /// Quality sub-fields, empty unless explicitly loaded.
    pub quality: Vec<Field>,
}

impl Field {
    pub fn new(index: usize, kind: FieldKind, name: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            name: name.into(),
            label: None,
            description: None,
            definition: None,
            uom: None,
            table_number: 1,
            parent: None,
            quality: Vec::new(),
        }
    }

    pub fn with_uom(mut self, uom: impl Into<String>) -> Self {
        self.uom = Some(uom.into());
        self
    }

    pub fn with_table_number(mut self, table_number: usize) -> Self {
        self.table_number = table_number.max(1);
        self
    }

    pub fn with_quality(mut self, quality: Vec<Field>) -> Self {
        self.quality = quality;
        self
    }

    /// Physical column holding this field's values.
    ///
    /// Quality sub-fields live next to their parent as `<parent>_quality_<name>`.
    pub fn column_name(&self) -> String {
        match &self.parent {
            Some(parent) => quality_column_name(parent, &self.name),
            None => self.name.clone(),
        }
    }

    pub fn is_time(&self) -> bool {
        self.kind == FieldKind::Time
    }
}

/// Column name of quality sub-field `child` under `parent`.
pub fn quality_column_name(parent: &str, child: &str) -> String {
    format!("{parent}_quality_{child}")
}

/// Begin/end of an observation; no end means an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
}

impl TimeRange {
    pub fn instant(at: NaiveDateTime) -> Self {
        Self {
            begin: at,
            end: None,
        }
    }

    pub fn period(begin: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            begin,
            end: Some(end),
        }
    }

    pub fn is_instant(&self) -> bool {
        self.end.is_none()
    }

    pub fn end_or_begin(&self) -> NaiveDateTime {
        self.end.unwrap_or(self.begin)
    }

    /// Smallest range covering both `self` and `other`.
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        let begin = self.begin.min(other.begin);
        let end = self.end_or_begin().max(other.end_or_begin());
        if begin == end {
            TimeRange::instant(begin)
        } else {
            TimeRange::period(begin, end)
        }
    }
}

/// Observed property, single or composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Phenomenon {
    Single(SinglePhenomenon),
    Composite(CompositePhenomenon),
}

impl Phenomenon {
    pub fn id(&self) -> &str {
        match self {
            Self::Single(p) => &p.id,
            Self::Composite(p) => &p.id,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }

    /// Single phenomena covered by this phenomenon.
    pub fn components(&self) -> Vec<&SinglePhenomenon> {
        match self {
            Self::Single(p) => vec![p],
            Self::Composite(p) => p.components.iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinglePhenomenon {
    pub id: String,
    pub name: Option<String>,
    pub definition: Option<String>,
    pub description: Option<String>,
}

impl SinglePhenomenon {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            definition: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositePhenomenon {
    pub id: String,
    pub name: Option<String>,
    pub definition: Option<String>,
    pub description: Option<String>,
    /// Ordered, distinct components.
    pub components: Vec<SinglePhenomenon>,
}

impl CompositePhenomenon {
    /// Builds a composite, dropping repeated component ids while keeping order.
    pub fn new(id: impl Into<String>, components: Vec<SinglePhenomenon>) -> Self {
        let mut distinct: Vec<SinglePhenomenon> = Vec::with_capacity(components.len());
        for component in components {
            if !distinct.iter().any(|c| c.id == component.id) {
                distinct.push(component);
            }
        }
        Self {
            id: id.into(),
            name: None,
            definition: None,
            description: None,
            components: distinct,
        }
    }

    pub fn component_ids(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|c| c.id.as_str())
    }
}

/// Sampled real-world entity targeted by observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingFeature {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub sampled_feature: Option<String>,
    pub geometry: Option<Geometry>,
    pub crs: Option<i64>,
}

/// One observation with its optional encoded result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub id: String,
    pub procedure: String,
    pub feature_of_interest: Option<String>,
    pub phenomenon: Option<Phenomenon>,
    pub time: Option<TimeRange>,
    /// Fields describing `result` values, in block order.
    pub fields: Vec<Field>,
    /// Encoded values; `None` in template mode.
    pub result: Option<ComplexResult>,
}

/// A procedure position at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalLocation {
    pub time: NaiveDateTime,
    pub position: Coord,
}

/// Current declared location of a procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorLocation {
    pub procedure: String,
    pub geometry: Geometry,
    pub crs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("valid time")
    }

    #[test]
    fn unknown_procedure_has_sentinel_layout() {
        let info = ProcedureInfo::unknown("P404");
        assert_eq!((info.pid, info.nb_table), (-1, 0));
        assert!(!info.is_known());
    }

    #[test]
    fn quality_field_column_uses_parent_prefix() {
        let mut flag = Field::new(1, FieldKind::Text, "flag");
        flag.parent = Some("TEMP".to_string());
        assert_eq!(flag.column_name(), "TEMP_quality_flag");
        assert_eq!(Field::new(2, FieldKind::Quantity, "TEMP").column_name(), "TEMP");
    }

    #[test]
    fn composite_components_stay_ordered_and_distinct() {
        let composite = CompositePhenomenon::new(
            "aggregate",
            vec![
                SinglePhenomenon::new("TEMP"),
                SinglePhenomenon::new("SAL"),
                SinglePhenomenon::new("TEMP"),
            ],
        );
        assert_eq!(composite.component_ids().collect::<Vec<_>>(), vec!["TEMP", "SAL"]);
    }

    #[test]
    fn time_range_union_collapses_to_instant() {
        let a = TimeRange::instant(at(1));
        assert_eq!(a.union(&a), a);
        let b = TimeRange::period(at(0), at(3));
        assert_eq!(a.union(&b), TimeRange::period(at(0), at(3)));
    }

    #[test]
    fn parses_field_and_procedure_kinds() {
        assert_eq!(FieldKind::parse("QUANTITY"), Some(FieldKind::Quantity));
        assert_eq!(FieldKind::parse("vector"), None);
        assert_eq!(ProcedureKind::parse("Profile"), Some(ProcedureKind::Profile));
    }
}
