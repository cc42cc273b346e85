//! Bounding result size to a requested width.
//!
//! Both strategies start from the same per-key domain scan (`min`, `max`,
//! `count` of the main field). [`WindowedDecimator`] reduces rows on the
//! client; [`TimeBucketDecimator`] lets the store aggregate with `date_bin`.

mod bucketed;
mod windowed;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{BackendCapabilities, StoreConnection};
use crate::cursor::{from_millis, to_millis};
use crate::error::{Result, StoreError};
use crate::filter::FilterQuery;
use crate::model::{Field, FieldKind};
use crate::processor::ResultProcessor;
use crate::result::ResultValue;

pub use bucketed::TimeBucketDecimator;
pub use windowed::WindowedDecimator;

/// Decimation strategy requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecimationStrategy {
    /// Client-side windowed reduction.
    #[default]
    Windowed,
    /// Store-native time buckets, windowed when the store cannot bucket.
    TimeBucket,
}

impl DecimationStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "windowed" | "window" => Some(Self::Windowed),
            "time_bucket" | "timebucket" | "bucket" => Some(Self::TimeBucket),
            _ => None,
        }
    }
}

/// How the values routed to one bucket are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReducerPolicy {
    First,
    Last,
    #[default]
    Avg,
    Min,
    Max,
}

impl ReducerPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            "avg" | "average" | "mean" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }
}

/// Reducer applied by the windowed strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReducerSettings {
    pub policy: ReducerPolicy,
    /// First and last buckets keep the domain's first and last main value.
    pub boundary_preservation: bool,
}

impl Default for ReducerSettings {
    fn default() -> Self {
        Self {
            policy: ReducerPolicy::Avg,
            boundary_preservation: true,
        }
    }
}

/// Grouping unit of a decimation domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DomainKey {
    /// Every row of the request.
    Single,
    /// Rows of one profile observation.
    Observation(i64),
    /// Positions of one procedure.
    Procedure(String),
}

/// Main-field extent of one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Domain {
    pub min: f64,
    pub max: f64,
    /// `(max - min) / width`, zero for a single-value domain.
    pub step: f64,
    pub count: u64,
}

impl Domain {
    pub fn new(min: f64, max: f64, count: u64, width: usize) -> Self {
        let step = if width == 0 || max <= min {
            0.0
        } else {
            (max - min) / width as f64
        };
        Self {
            min,
            max,
            step,
            count,
        }
    }

    /// Bucket of `value`, clamped to `width - 1`.
    pub fn bucket(&self, value: f64, width: usize) -> usize {
        if self.step <= 0.0 || !value.is_finite() {
            return 0;
        }
        let raw = ((value - self.min) / self.step).floor();
        let last = width.saturating_sub(1);
        if raw <= 0.0 {
            0
        } else {
            (raw as usize).min(last)
        }
    }

    /// Index of the last bucket a row of this domain can land in.
    pub fn last_bucket(&self, width: usize) -> usize {
        self.bucket(self.max, width)
    }

    /// Keys with at most `width` rows are emitted unchanged.
    pub fn passthrough(&self, width: usize) -> bool {
        self.count <= width as u64
    }
}

/// Domains of every key of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecimationDomains {
    domains: BTreeMap<DomainKey, Domain>,
}

impl DecimationDomains {
    pub fn insert(&mut self, key: DomainKey, domain: Domain) {
        self.domains.insert(key, domain);
    }

    pub fn get(&self, key: &DomainKey) -> Option<&Domain> {
        self.domains.get(key)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Runs the min/max/count scan of `main_expr` over `query`, grouped by
/// `key_expr` (observation ids) when given.
pub async fn scan_domains(
    connection: &dyn StoreConnection,
    query: &FilterQuery,
    main_expr: &str,
    main_kind: FieldKind,
    key_expr: Option<&str>,
    width: usize,
) -> Result<DecimationDomains> {
    let mut projection =
        format!("MIN({main_expr}) AS \"min\", MAX({main_expr}) AS \"max\", COUNT(*) AS \"count\"");
    let mut group_by = Vec::new();
    if let Some(key) = key_expr {
        projection.push_str(&format!(", {key} AS \"key\""));
        group_by.push(key.to_string());
    }
    let scan = query
        .with_projection(projection)
        .with_group_by(group_by)
        .without_order()
        .without_pagination();
    let mut cursor = connection.query(&scan.fill_params()?).await?;
    let mut domains = DecimationDomains::default();
    while cursor.next().await? {
        let (min, max) = match main_kind {
            FieldKind::Time => (
                cursor.get_timestamp("min")?.map(|t| to_millis(t) as f64),
                cursor.get_timestamp("max")?.map(|t| to_millis(t) as f64),
            ),
            _ => (cursor.get_f64("min")?, cursor.get_f64("max")?),
        };
        let count = cursor
            .get_i64("count")?
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);
        let key = match key_expr {
            Some(_) => DomainKey::Observation(cursor.get_i64("key")?.unwrap_or_default()),
            None => DomainKey::Single,
        };
        if let (Some(min), Some(max)) = (min, max) {
            domains.insert(key, Domain::new(min, max, count, width));
        }
    }
    debug!(keys = domains.len(), width, "computed decimation domains");
    Ok(domains)
}

/// One decimated retrieval.
#[derive(Debug, Clone, Copy)]
pub struct DecimationRequest<'a> {
    /// Executable measure query, ordered by key then main field. Its
    /// pagination selects decimated blocks, not raw rows.
    pub query: &'a FilterQuery,
    /// Maximum buckets per key.
    pub width: usize,
    /// Identifier prefix handed to the parser.
    pub name: &'a str,
}

/// Strategy bounding the rows a request appends to its builder.
#[async_trait]
pub trait Decimator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Appends at most `width` blocks per key to the processor's builder and
    /// returns the number of blocks appended.
    async fn decimate(
        &self,
        connection: &dyn StoreConnection,
        processor: &mut ResultProcessor,
        request: DecimationRequest<'_>,
    ) -> Result<u64>;
}

/// Picks the decimator for `main_field` on a store with `capabilities`.
pub fn select_decimator(
    strategy: DecimationStrategy,
    capabilities: BackendCapabilities,
    main_field: &Field,
    reducer: ReducerSettings,
) -> Result<Box<dyn Decimator>> {
    match main_field.kind {
        FieldKind::Time | FieldKind::Quantity => {}
        kind => {
            return Err(StoreError::UnsupportedMainField {
                field: main_field.name.clone(),
                kind: kind.as_str().to_string(),
            })
        }
    }
    let bucketed = strategy == DecimationStrategy::TimeBucket
        && main_field.is_time()
        && capabilities.time_bucketing;
    if bucketed {
        Ok(Box::new(TimeBucketDecimator::new(reducer)))
    } else {
        Ok(Box::new(WindowedDecimator::new(reducer)))
    }
}

/// Reduces the values one bucket collected for a column of kind `kind`.
pub fn reduce(values: &[ResultValue], kind: FieldKind, policy: ReducerPolicy) -> ResultValue {
    match kind {
        FieldKind::Quantity => {
            let numbers: Vec<f64> = values
                .iter()
                .filter_map(ResultValue::as_f64)
                .filter(|v| !v.is_nan())
                .collect();
            ResultValue::Number(reduce_numbers(&numbers, policy).unwrap_or(f64::NAN))
        }
        FieldKind::Time => {
            let millis: Vec<f64> = values.iter().filter_map(ResultValue::as_f64).collect();
            ResultValue::Time(
                reduce_numbers(&millis, policy).and_then(|v| from_millis(v.round() as i64)),
            )
        }
        FieldKind::Boolean | FieldKind::Text => {
            let picked = match policy {
                ReducerPolicy::Last => values.last(),
                _ => values.first(),
            };
            picked.cloned().unwrap_or(match kind {
                FieldKind::Boolean => ResultValue::Boolean(None),
                _ => ResultValue::Text(None),
            })
        }
    }
}

fn reduce_numbers(values: &[f64], policy: ReducerPolicy) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(match policy {
        ReducerPolicy::First => values[0],
        ReducerPolicy::Last => values[values.len() - 1],
        ReducerPolicy::Avg => values.iter().sum::<f64>() / values.len() as f64,
        ReducerPolicy::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        ReducerPolicy::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}
