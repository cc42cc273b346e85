use async_trait::async_trait;
use tracing::debug;

use super::{
    scan_domains, DecimationRequest, Decimator, DomainKey, ReducerSettings, WindowedDecimator,
};
use crate::backend::StoreConnection;
use crate::cursor::from_millis;
use crate::error::{Result, StoreError};
use crate::filter::{quote_ident, SqlParam};
use crate::model::FieldKind;
use crate::processor::{ColumnRole, ResultProcessor};

/// Store-native decimation grouping rows with `date_bin` over the main time.
///
/// Quantities are averaged by the store, other columns keep their minimum.
/// With boundary preservation the final bucket reports the last observed
/// time instead of its start. Requests the store cannot bucket fall back to
/// the windowed strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeBucketDecimator {
    fallback: WindowedDecimator,
    boundary_preservation: bool,
}

impl TimeBucketDecimator {
    pub fn new(reducer: ReducerSettings) -> Self {
        Self {
            fallback: WindowedDecimator::new(reducer),
            boundary_preservation: reducer.boundary_preservation,
        }
    }
}

/// Bucket stride in milliseconds yielding at most `width` buckets over `span`.
pub fn bucket_stride_ms(span_ms: i64, width: usize) -> i64 {
    let width = i64::try_from(width.max(1)).unwrap_or(i64::MAX);
    span_ms.max(0) / width + 1
}

/// Offset of the final bucket start from the origin.
pub fn last_bucket_offset_ms(span_ms: i64, stride_ms: i64) -> i64 {
    span_ms.max(0) / stride_ms.max(1) * stride_ms.max(1)
}

#[async_trait]
impl Decimator for TimeBucketDecimator {
    fn name(&self) -> &'static str {
        "time_bucket"
    }

    async fn decimate(
        &self,
        connection: &dyn StoreConnection,
        processor: &mut ResultProcessor,
        request: DecimationRequest<'_>,
    ) -> Result<u64> {
        if !processor.main_field().is_time() || processor.info().kind.is_profile() {
            return self.fallback.decimate(connection, processor, request).await;
        }
        let main = processor.main_column()?;
        let domains = scan_domains(
            connection,
            request.query,
            &main,
            FieldKind::Time,
            None,
            request.width,
        )
        .await?;
        let Some(domain) = domains.get(&DomainKey::Single).copied() else {
            return Ok(0);
        };
        if domain.passthrough(request.width) {
            let mut cursor = connection.query(&request.query.fill_params()?).await?;
            return processor.process_results(&mut cursor, request.name).await;
        }

        let span = (domain.max - domain.min) as i64;
        let stride = bucket_stride_ms(span, request.width);
        let origin = from_millis(domain.min as i64).ok_or_else(|| {
            StoreError::Processing(format!("time domain minimum {} out of range", domain.min))
        })?;
        let bucket = format!(
            "date_bin(INTERVAL '{stride} milliseconds', {main}, {})",
            SqlParam::Timestamp(origin).to_literal()
        );
        let main_expr = if self.boundary_preservation {
            let last_start = from_millis(domain.min as i64 + last_bucket_offset_ms(span, stride))
                .ok_or_else(|| {
                    StoreError::Processing(format!("time domain maximum {} out of range", domain.max))
                })?;
            format!(
                "CASE WHEN {bucket} = {} THEN MAX({main}) ELSE {bucket} END",
                SqlParam::Timestamp(last_start).to_literal()
            )
        } else {
            bucket.clone()
        };
        let projection = processor
            .projections()?
            .iter()
            .map(|column| {
                let expr = match (column.role, column.kind) {
                    (ColumnRole::Main, _) => main_expr.clone(),
                    (ColumnRole::Value, FieldKind::Quantity) => format!("AVG({})", column.expr),
                    _ => format!("MIN({})", column.expr),
                };
                format!("{expr} AS {}", quote_ident(&column.alias))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let grouped = request
            .query
            .with_projection(projection)
            .with_group_by(vec![bucket.clone()])
            .with_order_by(vec![bucket]);

        let mut cursor = connection.query(&grouped.fill_params()?).await?;
        let blocks = processor.process_results(&mut cursor, request.name).await?;
        debug!(
            procedure = %processor.info().id,
            stride_ms = stride,
            blocks,
            "time bucket decimation done"
        );
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_never_yields_more_than_width_buckets() {
        let span = 9 * 3_600_000;
        let stride = bucket_stride_ms(span, 5);
        assert_eq!(stride, 6_480_001);
        assert_eq!(span / stride + 1, 5);
        assert_eq!(bucket_stride_ms(0, 5), 1);
        assert_eq!(bucket_stride_ms(10, 0), 11);
    }

    #[test]
    fn final_bucket_starts_within_the_span() {
        let span = 9 * 3_600_000;
        let stride = bucket_stride_ms(span, 5);
        assert_eq!(last_bucket_offset_ms(span, stride), 4 * stride);
        assert_eq!(last_bucket_offset_ms(0, 1), 0);
    }
}
