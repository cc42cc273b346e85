mod common;

use anyhow::{Context, Result};
use common::{at, fixture_reader};
use obs_fusion::phenomenon::VIRTUAL_COMPOSITE_PREFIX;
use obs_fusion::processor::CSV_FORMAT;
use obs_fusion::{
    Assembly, ComplexResult, ObservationRequest, Phenomenon, ReaderOptions, ResponseMode,
    ResultValue, Selection, TimeRange,
};

fn field_names(observation: &obs_fusion::Observation) -> Vec<&str> {
    observation.fields.iter().map(|f| f.name.as_str()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn merged_observations_group_by_procedure_and_feature() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let request = ObservationRequest {
        response_format: Some(CSV_FORMAT.to_string()),
        include_time_for_profile: true,
        ..ObservationRequest::default()
    };
    let observations = reader
        .get_observations(&request)
        .await
        .context("read every observation")?;

    let ids: Vec<&str> = observations.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["obs-1", "obs-2", "obs-4", "obs-5"]);

    let p1 = &observations[0];
    assert_eq!(p1.feature_of_interest.as_deref(), Some("station-1"));
    assert_eq!(field_names(p1), vec!["time", "TEMP", "SAL"]);
    assert_eq!(
        p1.time,
        Some(TimeRange::period(at((2020, 1, 1), 0, 0), at((2020, 1, 1), 9, 0)))
    );
    match &p1.phenomenon {
        Some(Phenomenon::Composite(composite)) => {
            assert_eq!(composite.id, "aggregate");
            assert_eq!(composite.component_ids().collect::<Vec<_>>(), vec!["TEMP", "SAL"]);
        }
        other => anyhow::bail!("aggregate composite expected, got {other:?}"),
    }
    assert_eq!(p1.result.as_ref().map(ComplexResult::nb_values), Some(10));

    let profile = &observations[1];
    assert_eq!(field_names(profile), vec!["time", "DEPTH", "TEMP"]);
    assert_eq!(profile.result.as_ref().map(ComplexResult::nb_values), Some(11));
    assert_eq!(profile.time, Some(TimeRange::instant(at((2020, 2, 1), 12, 0))));

    match &observations[3].phenomenon {
        Some(Phenomenon::Composite(composite)) => {
            assert_eq!(composite.id, format!("{VIRTUAL_COMPOSITE_PREFIX}P5"));
            assert_eq!(composite.component_ids().collect::<Vec<_>>(), vec!["TEMP", "SAL"]);
        }
        other => anyhow::bail!("virtual composite expected, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn template_observations_carry_fields_only() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let request = ObservationRequest {
        selection: Selection::new().with_procedure("P1"),
        mode: ResponseMode::Template,
        ..ObservationRequest::default()
    };
    let observations = reader.get_observations(&request).await?;
    assert_eq!(observations.len(), 1);
    assert!(observations[0].result.is_none());
    assert_eq!(field_names(&observations[0]), vec!["time", "TEMP", "SAL"]);
    assert_eq!(reader.metrics().snapshot().rows_read, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn separated_observations_follow_measure_rows() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let request = ObservationRequest {
        selection: Selection::new().with_procedure("P5"),
        assembly: Assembly::Separated,
        response_format: Some("resultArray".to_string()),
        ..ObservationRequest::default()
    };
    let observations = reader.get_observations(&request).await?;
    let ids: Vec<&str> = observations.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["obs-5-1", "obs-6-2"]);
    assert_eq!(
        observations[1].time,
        Some(TimeRange::instant(at((2022, 1, 1), 1, 0)))
    );

    let Some(ComplexResult::Array { values, .. }) = &observations[0].result else {
        anyhow::bail!("array result expected");
    };
    assert_eq!(values.len(), 1);
    assert!(matches!(values[0][1], ResultValue::Number(v) if v.is_nan()));
    assert_eq!(values[0][2], ResultValue::Number(35.0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feature_filter_limits_observations() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let request = ObservationRequest {
        selection: Selection::new().with_feature("station-1"),
        mode: ResponseMode::Template,
        ..ObservationRequest::default()
    };
    let observations = reader.get_observations(&request).await?;
    let procedures: Vec<&str> = observations.iter().map(|o| o.procedure.as_str()).collect();
    assert_eq!(procedures, vec!["P1", "P3"]);
    Ok(())
}
