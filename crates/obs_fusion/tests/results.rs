mod common;

use anyhow::{Context, Result};
use common::{at, fixture_backend, fixture_reader};
use obs_fusion::decimation::DecimationStrategy;
use obs_fusion::filter::Pagination;
use obs_fusion::processor::{ARRAY_FORMAT, CSV_FORMAT};
use obs_fusion::{
    ComplexResult, ObservationBackend, ObservationReader, ReaderOptions, ResultRequest,
    ResultValue, Selection, StoreConnection, StoreError, TemporalFilter,
};

fn request(procedure: &str, format: &str) -> ResultRequest {
    ResultRequest {
        selection: Selection::new().with_procedure(procedure),
        response_format: Some(format.to_string()),
        include_time_for_profile: true,
        ..ResultRequest::default()
    }
}

fn array(result: ComplexResult) -> Result<Vec<Vec<ResultValue>>> {
    match result {
        ComplexResult::Array { values, nb_values } => {
            assert_eq!(values.len(), nb_values);
            Ok(values)
        }
        other => anyhow::bail!("array result expected, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_results_span_every_measure_table() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let result = reader
        .get_results(&request("P1", CSV_FORMAT))
        .await
        .context("read P1 results")?;

    let ComplexResult::Csv { values, nb_values, .. } = result else {
        anyhow::bail!("csv result expected");
    };
    assert_eq!(nb_values, 10);
    let lines: Vec<&str> = values.lines().collect();
    assert_eq!(lines.len(), 11);
    assert_eq!(lines[0], "time,TEMP,SAL");
    assert_eq!(lines[1], "2020-01-01T00:00:00,10,30");
    assert_eq!(lines[10], "2020-01-01T09:00:00,19,39");

    let snapshot = reader.metrics().snapshot();
    assert_eq!(snapshot.operations, 1);
    assert_eq!(snapshot.rows_read, 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn property_and_time_filters_narrow_results() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let mut narrowed = request("P1", CSV_FORMAT);
    narrowed.selection = narrowed
        .selection
        .with_observed_property("SAL")
        .with_temporal(TemporalFilter::After(at((2020, 1, 1), 8, 0)));

    let ComplexResult::Csv { values, nb_values, .. } = reader.get_results(&narrowed).await? else {
        anyhow::bail!("csv result expected");
    };
    assert_eq!(nb_values, 2);
    assert_eq!(
        values,
        "time,SAL\n2020-01-01T08:00:00,38\n2020-01-01T09:00:00,39\n"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn count_only_pushes_the_count_down() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let mut count = request("P3", CSV_FORMAT);
    count.count_only = true;

    let result = reader.get_results(&count).await?;
    assert_eq!(result, ComplexResult::Count { count: 42 });
    assert_eq!(reader.metrics().snapshot().count_pushdowns, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn windowed_decimation_keeps_the_boundaries() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let mut decimated = request("P1", ARRAY_FORMAT);
    decimated.decimation = Some(5);

    let rows = array(reader.get_results(&decimated).await?)?;
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0][0], ResultValue::Time(Some(at((2020, 1, 1), 0, 0))));
    assert_eq!(rows[4][0], ResultValue::Time(Some(at((2020, 1, 1), 9, 0))));
    assert_eq!(rows[0][1], ResultValue::Number(10.5));
    assert_eq!(rows[4][2], ResultValue::Number(38.5));

    decimated.decimation = Some(50);
    let rows = array(reader.get_results(&decimated).await?)?;
    assert_eq!(rows.len(), 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pages_are_cut_from_decimated_rows() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let mut paged = request("P1", ARRAY_FORMAT);
    paged.selection = paged
        .selection
        .with_pagination(Pagination::new(Some(1), Some(2)));
    paged.decimation = Some(5);

    let rows = array(reader.get_results(&paged).await?)?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], ResultValue::Time(Some(at((2020, 1, 1), 2, 30))));
    assert_eq!(rows[0][1], ResultValue::Number(12.5));
    assert_eq!(rows[1][0], ResultValue::Time(Some(at((2020, 1, 1), 4, 30))));
    assert_eq!(rows[1][2], ResultValue::Number(34.5));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn profile_decimation_carries_the_observation_time() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let mut decimated = request("P2", ARRAY_FORMAT);
    decimated.decimation = Some(3);

    let rows = array(reader.get_results(&decimated).await?)?;
    assert_eq!(rows.len(), 3);
    let cast = ResultValue::Time(Some(at((2020, 2, 1), 12, 0)));
    assert!(rows.iter().all(|row| row[0] == cast));
    assert_eq!(rows[0][1], ResultValue::Number(0.0));
    assert_eq!(rows[2][1], ResultValue::Number(100.0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rows_without_a_main_value_join_the_open_bucket() -> Result<()> {
    let backend = fixture_backend().await?;
    backend
        .acquire()
        .await?
        .execute("INSERT INTO mesure2 VALUES (12, 2, NULL, 5.0)")
        .await
        .context("add a depthless measure")?;
    let mut reader = ObservationReader::new(backend, ReaderOptions::default());
    let mut decimated = request("P2", ARRAY_FORMAT);
    decimated.decimation = Some(3);

    let rows = array(reader.get_results(&decimated).await?)?;
    assert_eq!(rows.len(), 3, "got {rows:?}");
    assert_eq!(rows[2][1], ResultValue::Number(100.0));
    assert_eq!(rows[2][2], ResultValue::Number(10.2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quality_columns_follow_their_value() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let mut flagged = request("P3", CSV_FORMAT);
    flagged.selection = flagged
        .selection
        .with_temporal(TemporalFilter::After(at((2021, 1, 1), 0, 39)));

    let ComplexResult::Csv { values, .. } = reader.get_results(&flagged).await? else {
        anyhow::bail!("csv result expected");
    };
    assert_eq!(values.lines().next(), Some("time,VAL"));

    flagged.include_quality = true;
    let ComplexResult::Csv { values, nb_values, .. } = reader.get_results(&flagged).await? else {
        anyhow::bail!("csv result expected");
    };
    assert_eq!(nb_values, 4);
    assert_eq!(
        values,
        "time,VAL,VAL_quality_flag\n\
         2021-01-01T00:39:00,39,good\n\
         2021-01-01T00:40:00,40,suspect\n\
         2021-01-01T00:41:00,41,good\n\
         2021-01-01T00:42:00,42,good\n"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn time_buckets_never_exceed_the_width() -> Result<()> {
    let options = ReaderOptions {
        decimation: DecimationStrategy::TimeBucket,
        ..ReaderOptions::default()
    };
    let mut reader = fixture_reader(options).await?;
    let mut decimated = request("P1", ARRAY_FORMAT);
    decimated.decimation = Some(5);

    let rows = array(reader.get_results(&decimated).await?)?;
    assert!(!rows.is_empty());
    assert!(rows.len() <= 5, "got {} buckets", rows.len());
    assert_eq!(rows[0][0], ResultValue::Time(Some(at((2020, 1, 1), 0, 0))));
    assert_eq!(
        rows.last().map(|row| row[0].clone()),
        Some(ResultValue::Time(Some(at((2020, 1, 1), 9, 0))))
    );

    let mut profile = request("P2", ARRAY_FORMAT);
    profile.decimation = Some(3);
    assert_eq!(array(reader.get_results(&profile).await?)?.len(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_procedures_and_bad_requests() -> Result<()> {
    let mut reader = fixture_reader(ReaderOptions::default()).await?;
    let empty = reader.get_results(&request("missing", CSV_FORMAT)).await?;
    assert_eq!(empty.nb_values(), 0);

    let mut zero = request("P1", CSV_FORMAT);
    zero.decimation = Some(0);
    let err = reader.get_results(&zero).await.expect_err("zero width");
    assert!(matches!(err, StoreError::InvalidRequest(_)));

    let none = ResultRequest::default();
    assert!(reader.get_results(&none).await.is_err());
    assert_eq!(reader.metrics().snapshot().failures, 2);
    Ok(())
}
