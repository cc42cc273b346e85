//! Runtime configuration read from `OBS_FUSION_*` environment variables.

use anyhow::{anyhow, Context, Result};
use datafusion::prelude::SessionConfig;

use crate::backend::BackendCapabilities;
use crate::decimation::{DecimationStrategy, ReducerPolicy, ReducerSettings};
use crate::location::LocationBinning;
use crate::reader::ReaderOptions;
use crate::result::TextEncoding;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsFusionConfig {
    /// Column ceiling used when laying out measure tables.
    pub max_fields_per_table: usize,
    pub decimation_strategy: DecimationStrategy,
    pub reducer: ReducerPolicy,
    pub boundary_preservation: bool,
    /// Lets decimation use the store's `date_bin` buckets.
    pub time_bucketing: bool,
    pub session_cache: bool,
    pub token_separator: String,
    pub block_separator: String,
    pub target_partitions: usize,
    pub location_binning: LocationBinning,
}

impl Default for ObsFusionConfig {
    fn default() -> Self {
        Self {
            max_fields_per_table: 1000,
            decimation_strategy: DecimationStrategy::Windowed,
            reducer: ReducerPolicy::Avg,
            boundary_preservation: true,
            time_bucketing: true,
            session_cache: false,
            token_separator: ",".to_string(),
            block_separator: "\n".to_string(),
            target_partitions: default_partitions(),
            location_binning: LocationBinning::default(),
        }
    }
}

impl ObsFusionConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`; absent keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let decimation_strategy = match lookup("OBS_FUSION_DECIMATION") {
            Some(raw) => DecimationStrategy::parse(&raw)
                .ok_or_else(|| anyhow!("invalid decimation strategy: {raw}"))?,
            None => defaults.decimation_strategy,
        };
        let reducer = match lookup("OBS_FUSION_REDUCER") {
            Some(raw) => {
                ReducerPolicy::parse(&raw).ok_or_else(|| anyhow!("invalid reducer: {raw}"))?
            }
            None => defaults.reducer,
        };
        let spatial_cells = parse_usize(lookup("OBS_FUSION_SPATIAL_CELLS"), 10)?;
        let location_binning = match lookup("OBS_FUSION_LOCATION_BINNING").as_deref() {
            None | Some("cube") => LocationBinning::Cube { spatial_cells },
            Some("time_slice") | Some("timeslice") => LocationBinning::TimeSlice,
            Some(other) => return Err(anyhow!("invalid location binning: {other}")),
        };
        Ok(Self {
            max_fields_per_table: parse_usize(
                lookup("OBS_FUSION_MAX_FIELDS_PER_TABLE"),
                defaults.max_fields_per_table,
            )?,
            decimation_strategy,
            reducer,
            boundary_preservation: parse_bool(
                lookup("OBS_FUSION_BOUNDARY_PRESERVATION"),
                defaults.boundary_preservation,
            )?,
            time_bucketing: parse_bool(lookup("OBS_FUSION_TIME_BUCKETING"), defaults.time_bucketing)?,
            session_cache: parse_bool(lookup("OBS_FUSION_SESSION_CACHE"), defaults.session_cache)?,
            token_separator: lookup("OBS_FUSION_TOKEN_SEPARATOR")
                .map(|raw| unescape(&raw))
                .unwrap_or(defaults.token_separator),
            block_separator: lookup("OBS_FUSION_BLOCK_SEPARATOR")
                .map(|raw| unescape(&raw))
                .unwrap_or(defaults.block_separator),
            target_partitions: parse_usize(
                lookup("OBS_FUSION_TARGET_PARTITIONS"),
                defaults.target_partitions,
            )?
            .max(1),
            location_binning,
        })
    }

    /// DataFusion session settings for the backing context.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new()
            .with_target_partitions(self.target_partitions)
            .with_information_schema(true)
    }

    /// Capabilities advertised by a DataFusion backend under this config.
    pub fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            time_bucketing: self.time_bucketing,
            spatial_pushdown: false,
        }
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            decimation: self.decimation_strategy,
            reducer: ReducerSettings {
                policy: self.reducer,
                boundary_preservation: self.boundary_preservation,
            },
            encoding: TextEncoding {
                token_separator: self.token_separator.clone(),
                block_separator: self.block_separator.clone(),
            },
            session_cache: self.session_cache,
            location_binning: self.location_binning,
        }
    }
}

fn default_partitions() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional boolean with fallback default.
fn parse_bool(value: Option<String>, default_value: bool) -> Result<bool> {
    match value {
        Some(raw) => raw
            .trim()
            .to_ascii_lowercase()
            .parse::<bool>()
            .with_context(|| format!("invalid bool value: {raw}")),
        None => Ok(default_value),
    }
}

/// Expands `\n`, `\t` and `\r` escapes so separators can be set from a shell.
fn unescape(raw: &str) -> String {
    raw.replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\r", "\r")
}
