use async_trait::async_trait;
use tracing::debug;

use super::{
    reduce, scan_domains, DecimationRequest, Decimator, Domain, DomainKey, ReducerPolicy,
    ReducerSettings,
};
use crate::backend::StoreConnection;
use crate::error::Result;
use crate::filter::Pagination;
use crate::model::FieldKind;
use crate::parser::{FieldParser, OBSERVATION_ID_COLUMN};
use crate::processor::ResultProcessor;
use crate::result::{ResultBuilder, ResultValue};

/// Client-side decimation: rows are streamed in key/main order, routed to
/// `floor((main - min) / step)` and reduced once per bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowedDecimator {
    reducer: ReducerSettings,
}

impl WindowedDecimator {
    pub fn new(reducer: ReducerSettings) -> Self {
        Self { reducer }
    }
}

/// Rows collected for the bucket being filled.
struct Window {
    key: DomainKey,
    bucket: usize,
    domain: Domain,
    rows: Vec<Vec<ResultValue>>,
}

/// Offset and limit counted in emitted blocks.
struct BlockPage {
    skip: u64,
    remaining: Option<u64>,
}

impl BlockPage {
    fn new(pagination: Pagination) -> Self {
        Self {
            skip: pagination.offset.unwrap_or(0),
            remaining: pagination.limit,
        }
    }

    /// Takes one slot; false when the block falls outside the page.
    fn admit(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        match self.remaining.as_mut() {
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
            None => true,
        }
    }

    fn is_full(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Column layout of the values a parser produces.
struct ValueLayout {
    kinds: Vec<FieldKind>,
    /// Position of the main field value.
    main: usize,
    /// Values before this position are profile leading times.
    leading: usize,
}

impl ValueLayout {
    fn of(parser: &FieldParser, main_offset: usize) -> Self {
        let mut kinds = Vec::new();
        let mut main = 0;
        let mut leading = 0;
        for (position, field) in parser.fields().iter().enumerate() {
            if position == main_offset {
                main = kinds.len();
                leading = kinds.len();
            }
            kinds.push(field.kind);
            kinds.extend(field.quality.iter().map(|q| q.kind));
        }
        Self {
            kinds,
            main,
            leading,
        }
    }
}

impl WindowedDecimator {
    /// Emits `window` when the page admits it; returns the blocks appended.
    fn close(
        &self,
        window: Option<Window>,
        page: &mut BlockPage,
        layout: &ValueLayout,
        width: usize,
        builder: &mut ResultBuilder,
        parser: &mut FieldParser,
    ) -> u64 {
        match window {
            Some(done) if page.admit() => {
                self.flush(done, layout, width, builder, parser);
                1
            }
            _ => 0,
        }
    }

    fn flush(
        &self,
        window: Window,
        layout: &ValueLayout,
        width: usize,
        builder: &mut ResultBuilder,
        parser: &mut FieldParser,
    ) {
        let last_bucket = window.domain.last_bucket(width);
        builder.new_block();
        let mut column = Vec::with_capacity(window.rows.len());
        for (position, kind) in layout.kinds.iter().enumerate() {
            column.clear();
            column.extend(window.rows.iter().filter_map(|row| row.get(position).cloned()));
            let value = if position == layout.main && self.reducer.boundary_preservation {
                if window.bucket == 0 {
                    reduce(&column, *kind, ReducerPolicy::First)
                } else if window.bucket == last_bucket {
                    reduce(&column, *kind, ReducerPolicy::Last)
                } else {
                    reduce(&column, *kind, self.reducer.policy)
                }
            } else if position < layout.leading {
                reduce(&column, *kind, ReducerPolicy::First)
            } else {
                reduce(&column, *kind, self.reducer.policy)
            };
            builder.append_value(value);
        }
        builder.end_block();
        parser.record_appended(layout.kinds.len());
    }
}

#[async_trait]
impl Decimator for WindowedDecimator {
    fn name(&self) -> &'static str {
        "windowed"
    }

    async fn decimate(
        &self,
        connection: &dyn StoreConnection,
        processor: &mut ResultProcessor,
        request: DecimationRequest<'_>,
    ) -> Result<u64> {
        let profile = processor.info().kind.is_profile();
        let main = processor.main_column()?;
        let key_expr = profile.then_some("m.\"id_observation\"");
        let domains = scan_domains(
            connection,
            request.query,
            &main,
            processor.main_field().kind,
            key_expr,
            request.width,
        )
        .await?;

        // Domains cover every row, so the page is cut from the decimated blocks.
        let mut page = BlockPage::new(request.query.pagination());
        let fetch = request.query.without_pagination();
        let mut cursor = connection.query(&fetch.fill_params()?).await?;
        let mut parser = processor.parser(request.name);
        let offset = processor.main_offset();
        let layout = ValueLayout::of(&parser, offset);
        let width = request.width;
        let mut window: Option<Window> = None;
        let mut blocks = 0u64;

        while !page.is_full() && cursor.next().await? {
            let key = if profile {
                DomainKey::Observation(cursor.get_i64(OBSERVATION_ID_COLUMN)?.unwrap_or_default())
            } else {
                DomainKey::Single
            };
            let domain = match domains.get(&key) {
                Some(domain) if !domain.passthrough(width) => *domain,
                _ => {
                    blocks += self.close(
                        window.take(),
                        &mut page,
                        &layout,
                        width,
                        processor.builder_mut(),
                        &mut parser,
                    );
                    if page.admit() {
                        parser.parse_line(&cursor, offset, processor.builder_mut())?;
                        blocks += 1;
                    }
                    continue;
                }
            };

            let values = parser.read_line(&cursor, offset)?;
            let same_key = window.as_ref().map(|w| w.key == key).unwrap_or(false);
            let main_value = values
                .get(layout.main)
                .and_then(ResultValue::as_f64)
                .filter(|v| v.is_finite());
            let bucket = match main_value {
                Some(v) => domain.bucket(v, width),
                // Rows without a main value stay in the bucket being filled.
                None => match &window {
                    Some(w) if same_key => w.bucket,
                    _ => 0,
                },
            };
            match window.as_mut() {
                Some(w) if same_key && w.bucket == bucket => w.rows.push(values),
                _ => {
                    blocks += self.close(
                        window.take(),
                        &mut page,
                        &layout,
                        width,
                        processor.builder_mut(),
                        &mut parser,
                    );
                    window = Some(Window {
                        key,
                        bucket,
                        domain,
                        rows: vec![values],
                    });
                }
            }
        }
        blocks += self.close(
            window.take(),
            &mut page,
            &layout,
            width,
            processor.builder_mut(),
            &mut parser,
        );
        processor.record_time_range(parser.time_range());
        debug!(
            procedure = %processor.info().id,
            width,
            blocks,
            rows = cursor.rows_read(),
            "windowed decimation done"
        );
        Ok(blocks)
    }
}
