//! Error types for observation store access and result assembly.

use datafusion::error::DataFusionError;
use thiserror::Error;

/// Result type alias for observation engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type surfaced by the observation engine.
///
/// Every failure reaching a caller is one of these variants; relational
/// execution failures always carry the SQL text that failed.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing store rejected or failed to execute a query.
    #[error("observation query failed: {source}")]
    Execution {
        /// Final SQL text sent to the store.
        query: String,
        #[source]
        source: DataFusionError,
    },

    /// A required single-field lookup found no catalog row.
    #[error("field {field} not found for procedure {procedure}")]
    FieldNotFound { procedure: String, field: String },

    /// Decimation needs a numeric or time ordering key.
    #[error("unsupported main field {field} of kind {kind} for decimation")]
    UnsupportedMainField { field: String, kind: String },

    /// A cursor column was missing or held an incompatible type.
    #[error("cannot decode column {column}: {message}")]
    Decode { column: String, message: String },

    /// The query description is not executable as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Runtime failure while assembling a response.
    #[error("result processing failed: {0}")]
    Processing(String),
}

impl StoreError {
    /// Wraps a DataFusion failure together with the query that triggered it.
    pub fn execution(query: impl Into<String>, source: DataFusionError) -> Self {
        Self::Execution {
            query: query.into(),
            source,
        }
    }

    /// Builds a decode failure for one column.
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Returns the failing SQL text when the error came from query execution.
    pub fn query(&self) -> Option<&str> {
        match self {
            Self::Execution { query, .. } => Some(query.as_str()),
            _ => None,
        }
    }

    /// Returns true for "field not found" lookups.
    pub fn is_field_not_found(&self) -> bool {
        matches!(self, Self::FieldNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_keeps_query_text() {
        let err = StoreError::execution(
            "SELECT * FROM mesure42",
            DataFusionError::Plan("table not found".to_string()),
        );
        assert_eq!(err.query(), Some("SELECT * FROM mesure42"));
        assert!(err.to_string().contains("table not found"));
    }

    #[test]
    fn field_not_found_is_detected() {
        let err = StoreError::FieldNotFound {
            procedure: "P1".to_string(),
            field: "TEMP".to_string(),
        };
        assert!(err.is_field_not_found());
        assert_eq!(err.query(), None);
        assert_eq!(err.to_string(), "field TEMP not found for procedure P1");
    }
}
