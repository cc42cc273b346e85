#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use obs_fusion::schema::{create_catalog, create_measure_tables};
use obs_fusion::{
    Field, FieldKind, FusionBackend, ObsFusionConfig, ObservationBackend, ObservationReader,
    ReaderOptions, StoreConnection,
};

/// Settings the fixture store is laid out with: two fields per measure table.
pub fn fixture_config() -> Result<ObsFusionConfig> {
    ObsFusionConfig::from_lookup(|key| match key {
        "OBS_FUSION_MAX_FIELDS_PER_TABLE" => Some("2".to_string()),
        "OBS_FUSION_TARGET_PARTITIONS" => Some("1".to_string()),
        _ => None,
    })
}

fn quantity(index: usize, name: &str, definition: Option<&str>, uom: Option<&str>) -> Field {
    let mut field = Field::new(index, FieldKind::Quantity, name);
    field.definition = definition.map(str::to_string);
    field.uom = uom.map(str::to_string);
    field
}

fn time() -> Field {
    Field::new(1, FieldKind::Time, "time")
}

/// Declared fields of each fixture procedure as `(id, pid, fields)`.
pub fn procedure_fields() -> Vec<(&'static str, i64, Vec<Field>)> {
    let mut temp = quantity(2, "TEMP", Some("urn:temp"), Some("degC"));
    temp.label = Some("Temperature".to_string());
    let mut sal = quantity(3, "SAL", Some("urn:sal"), Some("psu"));
    sal.label = Some("Salinity".to_string());
    let flag = Field::new(1, FieldKind::Text, "flag");
    vec![
        ("P1", 1, vec![time(), temp, sal]),
        (
            "P2",
            2,
            vec![
                quantity(1, "DEPTH", Some("urn:depth"), Some("m")),
                quantity(2, "TEMP", Some("urn:temp"), Some("degC")),
            ],
        ),
        (
            "P3",
            3,
            vec![time(), quantity(2, "VAL", None, None).with_quality(vec![flag])],
        ),
        (
            "P5",
            5,
            vec![
                time(),
                quantity(2, "TEMP", Some("urn:temp"), Some("degC")),
                quantity(3, "SAL", Some("urn:sal"), Some("psu")),
            ],
        ),
    ]
}

/// Catalog shared by the integration tests.
///
/// `P1` is a timeseries over two measure tables with 10 hourly rows from
/// 2020-01-01. `P2` is a profile cast of 11 depths from 0 to 100. `P3` holds
/// 42 rows with a `flag` quality column and `P5` two observations on
/// different single phenomena. Field rows and measure tables come from
/// [`procedure_fields`].
const FIXTURE: &[&str] = &[
    "INSERT INTO procedures VALUES \
     ('P1', 1, 2, 'timeseries', NULL, 'POINT(1 2)', 4326), \
     ('P2', 2, 1, 'profile', NULL, 'POINT(50 50)', 4326), \
     ('P3', 3, 1, 'timeseries', NULL, NULL, NULL), \
     ('P5', 5, 2, 'timeseries', NULL, NULL, NULL)",
    "INSERT INTO observations VALUES \
     (1, 'obs-1', 'P1', 'station-1', 'aggregate', \
      TIMESTAMP '2020-01-01T00:00:00', TIMESTAMP '2020-01-01T09:00:00'), \
     (2, 'obs-2', 'P2', 'station-2', 'TEMP', TIMESTAMP '2020-02-01T12:00:00', NULL), \
     (4, 'obs-4', 'P3', 'station-1', 'VAL', \
      TIMESTAMP '2021-01-01T00:01:00', TIMESTAMP '2021-01-01T00:42:00'), \
     (5, 'obs-5', 'P5', 'station-3', 'SAL', TIMESTAMP '2022-01-01T00:00:00', NULL), \
     (6, 'obs-6', 'P5', 'station-3', 'TEMP', TIMESTAMP '2022-01-01T01:00:00', NULL)",
    "INSERT INTO observed_properties VALUES \
     ('TEMP', 'Temperature', 'urn:temp', NULL), \
     ('SAL', 'Salinity', 'urn:sal', NULL), \
     ('DEPTH', 'Depth', 'urn:depth', NULL), \
     ('VAL', 'Value', NULL, NULL), \
     ('aggregate', 'Temperature and salinity', NULL, NULL)",
    "INSERT INTO components VALUES ('aggregate', 'TEMP', 1), ('aggregate', 'SAL', 2)",
    "INSERT INTO sampling_features VALUES \
     ('station-1', 'Station 1', NULL, NULL, 'POINT(1 2)', 4326), \
     ('station-2', 'Station 2', NULL, NULL, 'POINT(50 50)', 4326), \
     ('station-3', 'Station 3', NULL, NULL, NULL, NULL)",
    "INSERT INTO historical_locations VALUES \
     ('P1', TIMESTAMP '2020-01-01T00:00:00', 1.0, 2.0, 4326), \
     ('P1', TIMESTAMP '2020-01-01T00:30:00', 1.2, 2.2, 4326), \
     ('P1', TIMESTAMP '2020-01-01T09:00:00', 60.0, 60.0, 4326), \
     ('P2', TIMESTAMP '2020-02-01T12:00:00', 50.0, 50.0, 4326)",
    "INSERT INTO mesure5 VALUES \
     (1, 5, TIMESTAMP '2022-01-01T00:00:00', NULL), \
     (2, 6, TIMESTAMP '2022-01-01T01:00:00', 12.0)",
    "INSERT INTO mesure5_2 VALUES (1, 5, 35.0), (2, 6, NULL)",
];

pub fn at(date: (i32, u32, u32), hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(date.0, date.1, date.2)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .expect("valid fixture time")
}

fn generated_rows() -> Vec<String> {
    let p1: Vec<String> = (0..10)
        .map(|h| {
            format!(
                "({}, 1, TIMESTAMP '2020-01-01T{h:02}:00:00', {}.0)",
                h + 1,
                10 + h
            )
        })
        .collect();
    let p1_sal: Vec<String> = (0..10).map(|h| format!("({}, 1, {}.0)", h + 1, 30 + h)).collect();
    let p2: Vec<String> = (0..=10)
        .map(|i| format!("({}, 2, {}.0, {}.0)", i + 1, i * 10, 20 - i))
        .collect();
    let p3: Vec<String> = (1..=42)
        .map(|m| {
            let flag = if m % 10 == 0 { "suspect" } else { "good" };
            format!("({m}, 4, TIMESTAMP '2021-01-01T00:{m:02}:00', {m}.0, '{flag}')")
        })
        .collect();
    vec![
        format!("INSERT INTO mesure1 VALUES {}", p1.join(", ")),
        format!("INSERT INTO mesure1_2 VALUES {}", p1_sal.join(", ")),
        format!("INSERT INTO mesure2 VALUES {}", p2.join(", ")),
        format!("INSERT INTO mesure3 VALUES {}", p3.join(", ")),
    ]
}

/// In-memory store loaded with the fixture.
pub async fn fixture_backend() -> Result<Arc<FusionBackend>> {
    let config = fixture_config()?;
    let backend = FusionBackend::with_config(config.session_config());
    let connection = backend.acquire().await.context("acquire setup connection")?;
    create_catalog(connection.as_ref())
        .await
        .context("create catalog tables")?;
    for (procedure, pid, fields) in procedure_fields() {
        create_measure_tables(
            connection.as_ref(),
            procedure,
            pid,
            &fields,
            config.max_fields_per_table,
        )
        .await
        .with_context(|| format!("lay out measure tables of {procedure}"))?;
    }
    for sql in FIXTURE.iter().map(|s| s.to_string()).chain(generated_rows()) {
        connection
            .execute(&sql)
            .await
            .with_context(|| format!("load fixture statement: {sql}"))?;
    }
    Ok(Arc::new(backend))
}

pub async fn fixture_reader(options: ReaderOptions) -> Result<ObservationReader> {
    let backend = fixture_backend().await?;
    Ok(ObservationReader::new(backend, options))
}
