//! Per-request value accumulator producing the encoded result of a query.
//!
//! A [`ResultBuilder`] lives for one query execution. Callers open a block per
//! output row, append typed values in field order and close the block; the
//! builder keeps the values in the encoding selected at construction.

use chrono::NaiveDateTime;
use serde::Serialize;

/// Timestamp layout used in delimited text output.
pub const CSV_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Encoding selected for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResultMode {
    /// Delimited text block.
    Csv,
    /// Array of typed rows.
    StructuredArray,
    /// Single row count, no values.
    Count,
}

/// Separators of the delimited text encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextEncoding {
    pub token_separator: String,
    pub block_separator: String,
}

impl Default for TextEncoding {
    fn default() -> Self {
        Self {
            token_separator: ",".to_string(),
            block_separator: "\n".to_string(),
        }
    }
}

/// One typed value of a result block.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValue {
    Time(Option<NaiveDateTime>),
    /// Missing quantities are NaN, never absent.
    Number(f64),
    Boolean(Option<bool>),
    Text(Option<String>),
}

impl ResultValue {
    /// Renders the value as one delimited-text token.
    pub fn to_token(&self) -> String {
        match self {
            Self::Time(Some(t)) => t.format(CSV_TIME_FORMAT).to_string(),
            Self::Number(v) => v.to_string(),
            Self::Boolean(Some(b)) => b.to_string(),
            Self::Text(Some(s)) => s.clone(),
            Self::Time(None) | Self::Boolean(None) | Self::Text(None) => String::new(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Time(Some(t)) => Some(t.and_utc().timestamp_millis() as f64),
            _ => None,
        }
    }
}

/// Final encoded payload of a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ComplexResult {
    Csv {
        values: String,
        nb_values: usize,
        encoding: TextEncoding,
    },
    Array {
        values: Vec<Vec<ResultValue>>,
        nb_values: usize,
    },
    Count {
        count: u64,
    },
}

impl ComplexResult {
    /// Number of blocks carried (the count itself for count results).
    pub fn nb_values(&self) -> usize {
        match self {
            Self::Csv { nb_values, .. } | Self::Array { nb_values, .. } => *nb_values,
            Self::Count { count } => *count as usize,
        }
    }
}

/// Mutable accumulator for one query execution.
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    mode: ResultMode,
    encoding: TextEncoding,
    emit_header: bool,
    header: Vec<String>,
    csv: String,
    rows: Vec<Vec<ResultValue>>,
    current: Option<Vec<ResultValue>>,
    nb_blocks: usize,
    count: u64,
}

impl ResultBuilder {
    pub fn new(mode: ResultMode, encoding: TextEncoding, emit_header: bool) -> Self {
        Self {
            mode,
            encoding,
            emit_header,
            header: Vec::new(),
            csv: String::new(),
            rows: Vec::new(),
            current: None,
            nb_blocks: 0,
            count: 0,
        }
    }

    pub fn mode(&self) -> ResultMode {
        self.mode
    }

    /// Field names written as the first CSV row when headers are enabled.
    pub fn set_header(&mut self, names: Vec<String>) {
        self.header = names;
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Opens a new block; an unfinished previous block is discarded.
    pub fn new_block(&mut self) {
        self.current = Some(Vec::new());
    }

    pub fn append_time(&mut self, value: Option<NaiveDateTime>) {
        self.append_value(ResultValue::Time(value));
    }

    pub fn append_double(&mut self, value: f64) {
        self.append_value(ResultValue::Number(value));
    }

    pub fn append_boolean(&mut self, value: Option<bool>) {
        self.append_value(ResultValue::Boolean(value));
    }

    pub fn append_text(&mut self, value: Option<String>) {
        self.append_value(ResultValue::Text(value));
    }

    pub fn append_value(&mut self, value: ResultValue) {
        if self.mode == ResultMode::Count {
            return;
        }
        if let Some(block) = self.current.as_mut() {
            block.push(value);
        }
    }

    /// Closes the current block and stores it in the selected encoding.
    pub fn end_block(&mut self) {
        let Some(block) = self.current.take() else {
            return;
        };
        match self.mode {
            ResultMode::Csv => {
                let line = block
                    .iter()
                    .map(ResultValue::to_token)
                    .collect::<Vec<_>>()
                    .join(&self.encoding.token_separator);
                self.csv.push_str(&line);
                self.csv.push_str(&self.encoding.block_separator);
            }
            ResultMode::StructuredArray => self.rows.push(block),
            ResultMode::Count => self.count = self.count.saturating_add(1),
        }
        self.nb_blocks = self.nb_blocks.saturating_add(1);
    }

    /// Overrides the count of a count-only result.
    pub fn set_count(&mut self, count: u64) {
        self.count = count;
    }

    /// Number of blocks closed since construction or the last `clear`.
    pub fn nb_blocks(&self) -> usize {
        self.nb_blocks
    }

    /// Drops accumulated values; the header and encoding are kept.
    pub fn clear(&mut self) {
        self.csv.clear();
        self.rows.clear();
        self.current = None;
        self.nb_blocks = 0;
        self.count = 0;
    }

    /// Produces the encoded payload for the values accumulated so far.
    pub fn build(&self) -> ComplexResult {
        match self.mode {
            ResultMode::Csv => {
                let mut values = String::new();
                if self.emit_header && !self.header.is_empty() {
                    values.push_str(&self.header.join(&self.encoding.token_separator));
                    values.push_str(&self.encoding.block_separator);
                }
                values.push_str(&self.csv);
                ComplexResult::Csv {
                    values,
                    nb_values: self.nb_blocks,
                    encoding: self.encoding.clone(),
                }
            }
            ResultMode::StructuredArray => ComplexResult::Array {
                values: self.rows.clone(),
                nb_values: self.nb_blocks,
            },
            ResultMode::Count => ComplexResult::Count { count: self.count },
        }
    }
}
