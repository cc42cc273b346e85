//! Upstream operation surface used by protocol front-ends.
//!
//! Every operation acquires one connection from the backend, runs all the
//! lookups it needs on it and drops it when done, success or failure.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{ObservationBackend, StoreConnection};
use crate::cache::SessionCache;
use crate::catalog::FieldCatalog;
use crate::cursor::RowCursor;
use crate::decimation::{select_decimator, DecimationRequest, DecimationStrategy, ReducerSettings};
use crate::error::{Result, StoreError};
use crate::geometry::{Coord, Geometry, DEFAULT_CRS};
use crate::location::{decimate_locations, filter_by_bbox, LocationBinning, LocationsByProcedure};
use crate::metrics::QueryMetrics;
use crate::model::{
    HistoricalLocation, Observation, Phenomenon, ProcedureInfo, ProcedureKind, SamplingFeature,
    SensorLocation, TimeRange,
};
use crate::parser::{MEASURE_ID_COLUMN, OBSERVATION_ID_COLUMN};
use crate::phenomenon::PhenomenonResolver;
use crate::processor::{
    build_field_list, count_results, init_result_builder, FieldOptions, ResultProcessor,
};
use crate::result::{ComplexResult, ResultValue, TextEncoding};
use crate::selection::{build_query, result_query, EntityKind, Selection};

/// Per-reader behavior derived from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderOptions {
    pub decimation: DecimationStrategy,
    pub reducer: ReducerSettings,
    pub encoding: TextEncoding,
    /// Enables the session cache of features and phenomena.
    pub session_cache: bool,
    pub location_binning: LocationBinning,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            decimation: DecimationStrategy::default(),
            reducer: ReducerSettings::default(),
            encoding: TextEncoding::default(),
            session_cache: false,
            location_binning: LocationBinning::default(),
        }
    }
}

/// Whether observations carry their values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    #[default]
    Inline,
    /// Field descriptions only, no result values.
    Template,
}

/// How measurement rows are grouped into observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assembly {
    /// One observation per (procedure, feature of interest) pair.
    #[default]
    Merged,
    /// One observation per measurement row.
    Separated,
}

/// `get_observations` request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationRequest {
    pub selection: Selection,
    pub mode: ResponseMode,
    pub assembly: Assembly,
    pub response_format: Option<String>,
    pub include_id: bool,
    pub include_quality: bool,
    pub include_time_for_profile: bool,
}

/// `get_results` request on one procedure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRequest {
    pub selection: Selection,
    pub response_format: Option<String>,
    pub count_only: bool,
    /// Maximum points per key; `None` returns raw rows.
    pub decimation: Option<usize>,
    pub include_id: bool,
    pub include_quality: bool,
    pub include_time_for_profile: bool,
}

/// Observation rows read by the observation query.
#[derive(Debug, Clone)]
struct ObservationRow {
    id: i64,
    identifier: String,
    procedure: String,
    foi: Option<String>,
    observed_property: Option<String>,
    time: Option<TimeRange>,
}

async fn track<T>(
    metrics: &QueryMetrics,
    operation: &'static str,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    metrics.record_operation();
    let outcome = work.await;
    if let Err(err) = &outcome {
        metrics.record_failure();
        warn!(operation, error = %err, "observation operation failed");
    }
    outcome
}

/// Reader session over one backend.
///
/// The optional [`SessionCache`] lives as long as the reader, or until
/// [`ObservationReader::end_session`].
pub struct ObservationReader {
    backend: Arc<dyn ObservationBackend>,
    options: ReaderOptions,
    cache: Option<SessionCache>,
    metrics: Arc<QueryMetrics>,
}

impl ObservationReader {
    pub fn new(backend: Arc<dyn ObservationBackend>, options: ReaderOptions) -> Self {
        let cache = options.session_cache.then(SessionCache::new);
        Self {
            backend,
            options,
            cache,
            metrics: Arc::new(QueryMetrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<QueryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<QueryMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> Option<&SessionCache> {
        self.cache.as_ref()
    }

    /// Drops cached entries; the cache stays enabled for the next session.
    pub fn end_session(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    pub async fn get_observations(&mut self, request: &ObservationRequest) -> Result<Vec<Observation>> {
        let metrics = self.metrics.clone();
        track(&metrics, "get_observations", async {
            let connection = self.backend.acquire().await?;
            self.observations(connection.as_ref(), request).await
        })
        .await
    }

    pub async fn get_results(&mut self, request: &ResultRequest) -> Result<ComplexResult> {
        let metrics = self.metrics.clone();
        track(&metrics, "get_results", async {
            let connection = self.backend.acquire().await?;
            self.results(connection.as_ref(), request).await
        })
        .await
    }

    pub async fn get_feature_of_interests(
        &mut self,
        selection: &Selection,
    ) -> Result<Vec<SamplingFeature>> {
        let metrics = self.metrics.clone();
        track(&metrics, "get_feature_of_interests", async {
            let connection = self.backend.acquire().await?;
            self.features(connection.as_ref(), selection).await
        })
        .await
    }

    pub async fn get_phenomenons(&mut self, selection: &Selection) -> Result<Vec<Phenomenon>> {
        let metrics = self.metrics.clone();
        track(&metrics, "get_phenomenons", async {
            let connection = self.backend.acquire().await?;
            let query = build_query(EntityKind::Phenomenon, selection, self.backend.capabilities());
            let mut cursor = connection.query(&query.fill_params()?).await?;
            let mut ids = Vec::new();
            while cursor.next().await? {
                if let Some(id) = cursor.get_text("id")? {
                    ids.push(id);
                }
            }
            let resolver = PhenomenonResolver::new(connection.as_ref());
            let version = selection.version.as_deref();
            let mut out = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(found) = resolver
                    .resolve_phenomenon(version, id, self.cache.as_mut())
                    .await?
                {
                    out.push(found);
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn get_processes(&self, selection: &Selection) -> Result<Vec<ProcedureInfo>> {
        track(&self.metrics, "get_processes", async {
            let connection = self.backend.acquire().await?;
            let query = build_query(EntityKind::Process, selection, self.backend.capabilities());
            let mut cursor = connection.query(&query.fill_params()?).await?;
            let mut out = Vec::new();
            while cursor.next().await? {
                let Some(id) = cursor.get_text("id")? else {
                    continue;
                };
                let om_type = cursor.get_text("om_type")?;
                let kind = om_type
                    .as_deref()
                    .and_then(ProcedureKind::parse)
                    .unwrap_or(ProcedureKind::Timeseries);
                out.push(ProcedureInfo {
                    id,
                    pid: cursor.get_i64("pid")?.unwrap_or(-1),
                    nb_table: cursor
                        .get_i64("nb_table")?
                        .and_then(|n| usize::try_from(n).ok())
                        .unwrap_or(0),
                    kind,
                    parent: cursor.get_text("parent")?,
                });
            }
            Ok(out)
        })
        .await
    }

    pub async fn get_sensor_locations(&self, selection: &Selection) -> Result<Vec<SensorLocation>> {
        track(&self.metrics, "get_sensor_locations", async {
            let connection = self.backend.acquire().await?;
            let query =
                build_query(EntityKind::SensorLocation, selection, self.backend.capabilities());
            let mut cursor = connection.query(&query.fill_params()?).await?;
            let mut out = Vec::new();
            while cursor.next().await? {
                let Some(procedure) = cursor.get_text("id")? else {
                    continue;
                };
                let Some(geometry) = decode_shape(&cursor, &procedure)? else {
                    continue;
                };
                if let Some(bbox) = &selection.bbox {
                    if !geometry.intersects(bbox) {
                        continue;
                    }
                }
                out.push(SensorLocation {
                    procedure,
                    geometry,
                    crs: cursor.get_i64("crs")?.unwrap_or(DEFAULT_CRS),
                });
            }
            Ok(out)
        })
        .await
    }

    /// Positions of the selected procedures, binned to `width` when given.
    pub async fn get_sensor_historical_locations(
        &self,
        selection: &Selection,
        width: Option<usize>,
    ) -> Result<LocationsByProcedure> {
        track(&self.metrics, "get_sensor_historical_locations", async {
            let connection = self.backend.acquire().await?;
            let capabilities = self.backend.capabilities();
            let query = build_query(EntityKind::HistoricalLocation, selection, capabilities);
            let mut cursor = connection.query(&query.fill_params()?).await?;
            let mut locations = LocationsByProcedure::new();
            while cursor.next().await? {
                let (Some(procedure), Some(time), Some(x), Some(y)) = (
                    cursor.get_text("procedure")?,
                    cursor.get_timestamp("time")?,
                    cursor.get_f64("x")?,
                    cursor.get_f64("y")?,
                ) else {
                    continue;
                };
                locations.entry(procedure).or_default().push(HistoricalLocation {
                    time,
                    position: Coord::new(x, y),
                });
            }
            if let (Some(bbox), false) = (&selection.bbox, capabilities.spatial_pushdown) {
                filter_by_bbox(&mut locations, bbox);
            }
            match width {
                Some(width) => {
                    self.metrics.record_decimation();
                    Ok(decimate_locations(
                        &locations,
                        width,
                        self.options.location_binning,
                        selection.bbox.as_ref(),
                    ))
                }
                None => Ok(locations),
            }
        })
        .await
    }

    /// Time extent of each selected procedure's observations.
    pub async fn get_sensor_times(&self, selection: &Selection) -> Result<BTreeMap<String, TimeRange>> {
        track(&self.metrics, "get_sensor_times", async {
            let connection = self.backend.acquire().await?;
            let query = build_query(EntityKind::SensorTime, selection, self.backend.capabilities());
            let mut cursor = connection.query(&query.fill_params()?).await?;
            let mut out = BTreeMap::new();
            while cursor.next().await? {
                let (Some(procedure), Some(begin)) =
                    (cursor.get_text("procedure")?, cursor.get_timestamp("time_begin")?)
                else {
                    continue;
                };
                let end = cursor.get_timestamp("time_end")?.unwrap_or(begin);
                let range = if end == begin {
                    TimeRange::instant(begin)
                } else {
                    TimeRange::period(begin, end)
                };
                out.insert(procedure, range);
            }
            Ok(out)
        })
        .await
    }

    async fn results(
        &mut self,
        connection: &dyn StoreConnection,
        request: &ResultRequest,
    ) -> Result<ComplexResult> {
        let selection = &request.selection;
        let procedure = match selection.procedures.as_slice() {
            [procedure] => procedure.clone(),
            [] => {
                return Err(StoreError::InvalidRequest(
                    "result request needs a procedure".to_string(),
                ))
            }
            _ => {
                return Err(StoreError::InvalidRequest(
                    "result request targets a single procedure".to_string(),
                ))
            }
        };
        if request.decimation == Some(0) {
            return Err(StoreError::InvalidRequest(
                "decimation width must be positive".to_string(),
            ));
        }

        let builder = init_result_builder(
            request.response_format.as_deref(),
            request.count_only,
            self.options.encoding.clone(),
        );
        let catalog = FieldCatalog::new(connection);
        let info = catalog.procedure_info(&procedure).await?;
        if !info.is_known() {
            debug!(procedure = %procedure, "unknown procedure, empty result");
            return Ok(builder.build());
        }
        let options = FieldOptions {
            properties: self.expand_properties(connection, selection).await?,
            include_id: request.include_id,
            include_time_for_profile: request.include_time_for_profile,
            include_quality: request.include_quality,
            by_observation: false,
        };
        let list = build_field_list(&catalog, &info, &options).await?;
        let mut processor = ResultProcessor::new(info, list, options, builder);
        let base = result_query(
            processor.plan(),
            selection,
            processor.main_time_column()?.as_deref(),
        );
        let query = processor.compute_request(&base)?;

        match (request.count_only, request.decimation) {
            (true, None) => {
                let count = count_results(connection, &query).await?;
                processor.builder_mut().set_count(count);
                self.metrics.record_count_pushdown();
            }
            (_, Some(width)) => {
                let decimator = select_decimator(
                    self.options.decimation,
                    self.backend.capabilities(),
                    processor.main_field(),
                    self.options.reducer,
                )?;
                let blocks = decimator
                    .decimate(
                        connection,
                        &mut processor,
                        DecimationRequest {
                            query: &query,
                            width,
                            name: "",
                        },
                    )
                    .await?;
                self.metrics.record_decimation();
                self.metrics.record_blocks(blocks);
                info!(
                    procedure = %procedure,
                    decimator = decimator.name(),
                    width,
                    blocks,
                    "decimated results"
                );
            }
            (false, None) => {
                let mut cursor = connection.query(&query.fill_params()?).await?;
                let rows = processor.process_results(&mut cursor, "").await?;
                self.metrics.record_rows(rows);
                self.metrics.record_blocks(rows);
            }
        }
        Ok(processor.builder().build())
    }

    async fn observations(
        &mut self,
        connection: &dyn StoreConnection,
        request: &ObservationRequest,
    ) -> Result<Vec<Observation>> {
        let selection = &request.selection;
        let query = build_query(EntityKind::Observation, selection, self.backend.capabilities());
        let mut cursor = connection.query(&query.fill_params()?).await?;
        let mut groups: Vec<Vec<ObservationRow>> = Vec::new();
        while cursor.next().await? {
            let row = observation_row(&cursor)?;
            match groups.last_mut() {
                Some(group)
                    if group[0].procedure == row.procedure && group[0].foi == row.foi =>
                {
                    group.push(row)
                }
                _ => groups.push(vec![row]),
            }
        }

        let properties = self.expand_properties(connection, selection).await?;
        let mut out = Vec::new();
        for group in groups {
            let observations = self
                .assemble_group(connection, request, &properties, group)
                .await?;
            out.extend(observations);
        }
        info!(observations = out.len(), "assembled observations");
        Ok(out)
    }

    async fn assemble_group(
        &mut self,
        connection: &dyn StoreConnection,
        request: &ObservationRequest,
        properties: &[String],
        group: Vec<ObservationRow>,
    ) -> Result<Vec<Observation>> {
        let selection = &request.selection;
        let version = selection.version.as_deref();
        let head = group[0].clone();
        let resolver = PhenomenonResolver::new(connection);
        let mut referenced: Vec<&str> = group
            .iter()
            .filter_map(|row| row.observed_property.as_deref())
            .collect();
        referenced.sort_unstable();
        referenced.dedup();
        let phenomenon = match referenced.as_slice() {
            [] => None,
            [single] => {
                resolver
                    .resolve_phenomenon(version, single, self.cache.as_mut())
                    .await?
            }
            _ => {
                resolver
                    .resolve_global_composite(&head.procedure, version, self.cache.as_mut())
                    .await?
            }
        };
        let time = group
            .iter()
            .filter_map(|row| row.time)
            .reduce(|a, b| a.union(&b));

        let catalog = FieldCatalog::new(connection);
        let info = catalog.procedure_info(&head.procedure).await?;
        let template = Observation {
            id: head.identifier.clone(),
            procedure: head.procedure.clone(),
            feature_of_interest: head.foi.clone(),
            phenomenon,
            time,
            fields: Vec::new(),
            result: None,
        };
        if !info.is_known() {
            return Ok(vec![template]);
        }
        let options = FieldOptions {
            properties: properties.to_vec(),
            include_id: request.include_id,
            include_time_for_profile: request.include_time_for_profile,
            include_quality: request.include_quality,
            by_observation: true,
        };
        let list = build_field_list(&catalog, &info, &options).await?;
        if request.mode == ResponseMode::Template {
            return Ok(vec![Observation {
                fields: list.fields,
                ..template
            }]);
        }

        let builder = init_result_builder(
            request.response_format.as_deref(),
            false,
            self.options.encoding.clone(),
        );
        let mut processor = ResultProcessor::new(info, list, options, builder);
        let narrowed = Selection {
            procedures: vec![head.procedure.clone()],
            observation_ids: group.iter().map(|row| row.identifier.clone()).collect(),
            temporal: selection.temporal,
            version: selection.version.clone(),
            ..Selection::default()
        };
        let base = result_query(
            processor.plan(),
            &narrowed,
            processor.main_time_column()?.as_deref(),
        );
        let query = processor.compute_request(&base)?;
        let mut cursor = connection.query(&query.fill_params()?).await?;

        match request.assembly {
            Assembly::Merged => {
                let rows = processor.process_results(&mut cursor, "").await?;
                self.metrics.record_rows(rows);
                self.metrics.record_blocks(rows);
                Ok(vec![Observation {
                    time: processor.time_range().or(template.time),
                    fields: processor.fields().to_vec(),
                    result: Some(processor.builder().build()),
                    ..template
                }])
            }
            Assembly::Separated => {
                let identifiers: HashMap<i64, &str> = group
                    .iter()
                    .map(|row| (row.id, row.identifier.as_str()))
                    .collect();
                let mut parser = processor.parser("");
                let offset = processor.main_offset();
                let main_value = parser.value_offset(offset);
                let mut out = Vec::new();
                while cursor.next().await? {
                    let values = parser.read_line(&cursor, offset)?;
                    let row_time = match values.get(main_value) {
                        Some(ResultValue::Time(Some(t))) => Some(TimeRange::instant(*t)),
                        _ => template.time,
                    };
                    let builder = processor.builder_mut();
                    builder.clear();
                    builder.new_block();
                    for value in values {
                        builder.append_value(value);
                    }
                    builder.end_block();

                    let observation_id = cursor.get_i64(OBSERVATION_ID_COLUMN)?.unwrap_or_default();
                    let measure_id = cursor.get_i64(MEASURE_ID_COLUMN)?.unwrap_or_default();
                    let prefix = identifiers
                        .get(&observation_id)
                        .copied()
                        .unwrap_or(head.identifier.as_str());
                    out.push(Observation {
                        id: format!("{prefix}-{measure_id}"),
                        time: row_time,
                        fields: processor.fields().to_vec(),
                        result: Some(processor.builder().build()),
                        ..template.clone()
                    });
                }
                self.metrics.record_rows(cursor.rows_read());
                self.metrics.record_blocks(out.len() as u64);
                Ok(out)
            }
        }
    }

    async fn features(
        &mut self,
        connection: &dyn StoreConnection,
        selection: &Selection,
    ) -> Result<Vec<SamplingFeature>> {
        let version = selection.version.as_deref();
        let id_lookup = !selection.features.is_empty()
            && Selection {
                features: Vec::new(),
                version: None,
                ..selection.clone()
            } == Selection::default();

        let mut found = Vec::new();
        let mut missing = selection.features.clone();
        if id_lookup {
            if let Some(cache) = self.cache.as_mut() {
                missing.clear();
                for id in &selection.features {
                    match cache.feature(version, id) {
                        Some(feature) => found.push(feature),
                        None => missing.push(id.clone()),
                    }
                }
                if missing.is_empty() {
                    return Ok(found);
                }
            }
        }

        let fetch = if id_lookup {
            Selection {
                features: missing,
                ..selection.clone()
            }
        } else {
            selection.clone()
        };
        let query = build_query(EntityKind::FeatureOfInterest, &fetch, self.backend.capabilities());
        let mut cursor = connection.query(&query.fill_params()?).await?;
        while cursor.next().await? {
            let Some(id) = cursor.get_text("id")? else {
                continue;
            };
            let geometry = decode_shape(&cursor, &id)?;
            if let Some(bbox) = &selection.bbox {
                if !geometry.as_ref().is_some_and(|g| g.intersects(bbox)) {
                    continue;
                }
            }
            let feature = SamplingFeature {
                name: cursor.get_text("name")?,
                description: cursor.get_text("description")?,
                sampled_feature: cursor.get_text("sampledfeature")?,
                crs: cursor.get_i64("crs")?,
                geometry,
                id,
            };
            if let Some(cache) = self.cache.as_mut() {
                cache.put_feature(version, feature.clone());
            }
            found.push(feature);
        }
        Ok(found)
    }

    /// Requested properties plus the components of requested composites.
    async fn expand_properties(
        &mut self,
        connection: &dyn StoreConnection,
        selection: &Selection,
    ) -> Result<Vec<String>> {
        let resolver = PhenomenonResolver::new(connection);
        let version = selection.version.as_deref();
        let mut out: Vec<String> = Vec::new();
        for property in &selection.observed_properties {
            let mut ids = vec![property.clone()];
            if let Some(Phenomenon::Composite(composite)) = resolver
                .resolve_phenomenon(version, property, self.cache.as_mut())
                .await?
            {
                ids.extend(composite.component_ids().map(str::to_string));
            }
            for id in ids {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }
}

fn observation_row(cursor: &RowCursor) -> Result<ObservationRow> {
    let id = cursor
        .get_i64("id")?
        .ok_or_else(|| StoreError::decode("id", "observation without id"))?;
    let begin = cursor.get_timestamp("time_begin")?;
    let end = cursor.get_timestamp("time_end")?;
    let time = begin.map(|begin| match end {
        Some(end) if end != begin => TimeRange::period(begin, end),
        _ => TimeRange::instant(begin),
    });
    Ok(ObservationRow {
        id,
        identifier: cursor.get_text("identifier")?.unwrap_or_else(|| id.to_string()),
        procedure: cursor.get_text("procedure")?.unwrap_or_default(),
        foi: cursor.get_text("foi")?,
        observed_property: cursor.get_text("observed_property")?,
        time,
    })
}

/// Decodes the `shape` column; malformed WKT is logged and skipped.
fn decode_shape(cursor: &RowCursor, owner: &str) -> Result<Option<Geometry>> {
    let Some(raw) = cursor.get_text("shape")? else {
        return Ok(None);
    };
    match Geometry::from_wkt(&raw) {
        Ok(geometry) => Ok(Some(geometry)),
        Err(err) => {
            warn!(owner, error = %err, "ignoring malformed shape");
            Ok(None)
        }
    }
}
