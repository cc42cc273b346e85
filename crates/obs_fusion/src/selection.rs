//! Entity-kind base queries and user selections applied on top of them.
//!
//! Every entity kind has a fixed base query over the backing schema. A
//! [`Selection`] narrows it with parameterized predicates; the first predicate's
//! connective is dropped once when the query is sealed.

use crate::backend::BackendCapabilities;
use crate::filter::{FilterQuery, Pagination};
use crate::geometry::BoundingBox;
use crate::join::MeasureJoinPlan;
use crate::model::TimeRange;

/// Kind of entity an upstream request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Observation,
    Result,
    FeatureOfInterest,
    Phenomenon,
    Process,
    SensorLocation,
    HistoricalLocation,
    SensorTime,
}

/// Temporal operator over an entity's time columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalFilter {
    /// Overlaps the period.
    During(TimeRange),
    /// Same begin and end.
    Equals(TimeRange),
    /// Ends at or after the instant.
    After(chrono::NaiveDateTime),
    /// Begins at or before the instant.
    Before(chrono::NaiveDateTime),
}

/// User selection shared by every entity kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub procedures: Vec<String>,
    pub observed_properties: Vec<String>,
    pub features: Vec<String>,
    /// Observation identifiers (`observations.identifier`).
    pub observation_ids: Vec<String>,
    pub temporal: Option<TemporalFilter>,
    pub bbox: Option<BoundingBox>,
    pub pagination: Pagination,
    /// Protocol version of the request, used for legacy phenomenon ids.
    pub version: Option<String>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_procedure(mut self, procedure: impl Into<String>) -> Self {
        self.procedures.push(procedure.into());
        self
    }

    pub fn with_observed_property(mut self, property: impl Into<String>) -> Self {
        self.observed_properties.push(property.into());
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn with_observation_id(mut self, id: impl Into<String>) -> Self {
        self.observation_ids.push(id.into());
        self
    }

    pub fn with_temporal(mut self, temporal: TemporalFilter) -> Self {
        self.temporal = Some(temporal);
        self
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Columns a selection filters on for one entity kind.
#[derive(Debug, Clone, Default)]
struct FilterColumns {
    procedure: Option<String>,
    property: Option<String>,
    /// Property filter also matches composites containing the property.
    property_through_composites: bool,
    feature: Option<String>,
    observation: Option<String>,
    time_begin: Option<String>,
    time_end: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

fn col(expr: &str) -> Option<String> {
    Some(expr.to_string())
}

fn observation_columns() -> FilterColumns {
    FilterColumns {
        procedure: col("o.\"procedure\""),
        property: col("o.\"observed_property\""),
        property_through_composites: true,
        feature: col("o.\"foi\""),
        observation: col("o.\"identifier\""),
        time_begin: col("o.\"time_begin\""),
        time_end: col("o.\"time_end\""),
        ..FilterColumns::default()
    }
}

/// Base query of `kind`, narrowed by `selection`.
///
/// Results are planned per procedure through [`result_query`] instead.
pub fn build_query(
    kind: EntityKind,
    selection: &Selection,
    capabilities: BackendCapabilities,
) -> FilterQuery {
    let (query, columns, order) = match kind {
        EntityKind::Observation | EntityKind::Result => (
            FilterQuery::new(
                "o.\"id\", o.\"identifier\", o.\"procedure\", o.\"foi\", \
                 o.\"observed_property\", o.\"time_begin\", o.\"time_end\"",
                "observations o",
            ),
            observation_columns(),
            vec![
                "o.\"procedure\"".to_string(),
                "o.\"foi\"".to_string(),
                "o.\"time_begin\"".to_string(),
                "o.\"id\"".to_string(),
            ],
        ),
        EntityKind::FeatureOfInterest => (
            FilterQuery::new(
                "DISTINCT sf.\"id\", sf.\"name\", sf.\"description\", sf.\"sampledfeature\", \
                 sf.\"shape\", sf.\"crs\"",
                "sampling_features sf LEFT JOIN observations o ON o.\"foi\" = sf.\"id\"",
            ),
            FilterColumns {
                feature: col("sf.\"id\""),
                ..observation_columns()
            },
            vec!["sf.\"id\"".to_string()],
        ),
        EntityKind::Phenomenon => (
            FilterQuery::new(
                "DISTINCT op.\"id\"",
                "observed_properties op LEFT JOIN observations o \
                 ON o.\"observed_property\" = op.\"id\"",
            ),
            FilterColumns {
                property: col("op.\"id\""),
                property_through_composites: false,
                ..observation_columns()
            },
            vec!["op.\"id\"".to_string()],
        ),
        EntityKind::Process => (
            FilterQuery::new(
                "DISTINCT pr.\"id\", pr.\"pid\", pr.\"nb_table\", pr.\"om_type\", pr.\"parent\"",
                "procedures pr LEFT JOIN observations o ON o.\"procedure\" = pr.\"id\"",
            ),
            FilterColumns {
                procedure: col("pr.\"id\""),
                ..observation_columns()
            },
            vec!["pr.\"id\"".to_string()],
        ),
        EntityKind::SensorLocation => {
            let mut query = FilterQuery::new(
                "pr.\"id\", pr.\"shape\", pr.\"crs\"",
                "procedures pr",
            );
            query.and("pr.\"shape\" IS NOT NULL");
            (
                query,
                FilterColumns {
                    procedure: col("pr.\"id\""),
                    ..FilterColumns::default()
                },
                vec!["pr.\"id\"".to_string()],
            )
        }
        EntityKind::HistoricalLocation => (
            FilterQuery::new(
                "hl.\"procedure\", hl.\"time\", hl.\"x\", hl.\"y\", hl.\"crs\"",
                "historical_locations hl",
            ),
            FilterColumns {
                procedure: col("hl.\"procedure\""),
                time_begin: col("hl.\"time\""),
                x: capabilities.spatial_pushdown.then(|| "hl.\"x\"".to_string()),
                y: capabilities.spatial_pushdown.then(|| "hl.\"y\"".to_string()),
                ..FilterColumns::default()
            },
            vec!["hl.\"procedure\"".to_string(), "hl.\"time\"".to_string()],
        ),
        EntityKind::SensorTime => (
            FilterQuery::new(
                "o.\"procedure\" AS \"procedure\", MIN(o.\"time_begin\") AS \"time_begin\", \
                 MAX(COALESCE(o.\"time_end\", o.\"time_begin\")) AS \"time_end\"",
                "observations o",
            )
            .with_group_by(vec!["o.\"procedure\"".to_string()]),
            observation_columns(),
            vec!["o.\"procedure\"".to_string()],
        ),
    };
    let mut query = query.with_order_by(order);
    apply(&mut query, selection, &columns);
    query.seal();
    query.with_pagination(selection.pagination)
}

/// Measure rows of one procedure joined to their observations, narrowed by
/// `selection`. The temporal filter applies to `main_time_column` when the
/// main field is a time, otherwise to the observation period.
pub fn result_query(
    plan: &MeasureJoinPlan,
    selection: &Selection,
    main_time_column: Option<&str>,
) -> FilterQuery {
    let from = format!(
        "{} JOIN observations o ON o.\"id\" = m.\"id_observation\"",
        plan.from_clause()
    );
    let mut query = FilterQuery::new("m.\"id\"", from);
    let mut columns = observation_columns();
    if let Some(main) = main_time_column {
        columns.time_begin = col(main);
        columns.time_end = None;
    }
    apply(&mut query, selection, &columns);
    query.seal();
    query.with_pagination(selection.pagination)
}

fn apply(query: &mut FilterQuery, selection: &Selection, columns: &FilterColumns) {
    if let Some(column) = &columns.procedure {
        in_list(query, column, &selection.procedures);
    }
    if let (Some(column), false) = (&columns.property, selection.observed_properties.is_empty()) {
        let list = query.set_params(selection.observed_properties.iter().map(String::as_str));
        if columns.property_through_composites {
            query.and(&format!(
                "({column} IN ({list}) OR {column} IN \
                 (SELECT c.\"phenomenon\" FROM components c WHERE c.\"component\" IN ({list})))"
            ));
        } else {
            query.and(&format!("{column} IN ({list})"));
        }
    }
    if let Some(column) = &columns.feature {
        in_list(query, column, &selection.features);
    }
    if let Some(column) = &columns.observation {
        in_list(query, column, &selection.observation_ids);
    }
    if let (Some(begin), Some(temporal)) = (&columns.time_begin, selection.temporal) {
        let end = match &columns.time_end {
            Some(end) => format!("COALESCE({end}, {begin})"),
            None => begin.clone(),
        };
        match temporal {
            TemporalFilter::During(range) => {
                let b = query.set_param(range.begin);
                let e = query.set_param(range.end_or_begin());
                query.and(&format!("{begin} <= {e} AND {end} >= {b}"));
            }
            TemporalFilter::Equals(range) => {
                let b = query.set_param(range.begin);
                let e = query.set_param(range.end_or_begin());
                query.and(&format!("{begin} = {b} AND {end} = {e}"));
            }
            TemporalFilter::After(at) => {
                let t = query.set_param(at);
                query.and(&format!("{end} >= {t}"));
            }
            TemporalFilter::Before(at) => {
                let t = query.set_param(at);
                query.and(&format!("{begin} <= {t}"));
            }
        }
    }
    if let (Some(x), Some(y), Some(bbox)) = (&columns.x, &columns.y, &selection.bbox) {
        let (x0, x1) = (query.set_param(bbox.min_x), query.set_param(bbox.max_x));
        let (y0, y1) = (query.set_param(bbox.min_y), query.set_param(bbox.max_y));
        query.and(&format!(
            "{x} BETWEEN {x0} AND {x1} AND {y} BETWEEN {y0} AND {y1}"
        ));
    }
}

fn in_list(query: &mut FilterQuery, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    let list = query.set_params(values.iter().map(String::as_str));
    query.and(&format!("{column} IN ({list})"));
}
