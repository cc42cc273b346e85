//! Backing-store access for the observation engine.
//!
//! A backend hands out one [`StoreConnection`] per logical operation. The
//! connection executes the engine's fixed query shapes and returns
//! forward-only cursors.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use datafusion::prelude::{CsvReadOptions, ParquetReadOptions, SessionConfig, SessionContext};
use tracing::{debug, info};

use crate::cursor::RowCursor;
use crate::error::{Result, StoreError};

/// Optional features a backing store may evaluate natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    /// Store can group rows by fixed time buckets (`date_bin`).
    pub time_bucketing: bool,
    /// Store can evaluate spatial predicates on location columns.
    pub spatial_pushdown: bool,
}

/// Source of scoped connections.
#[async_trait]
pub trait ObservationBackend: Send + Sync {
    /// Acquires one connection for a single logical operation.
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>>;

    fn capabilities(&self) -> BackendCapabilities;
}

/// One acquired connection; dropped when the logical operation completes.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Executes `sql` and returns a cursor over its rows.
    async fn query(&self, sql: &str) -> Result<RowCursor>;

    /// Executes a statement and drains its output, returning the rows read.
    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut cursor = self.query(sql).await?;
        while cursor.next().await? {}
        Ok(cursor.rows_read())
    }
}

/// Backend executing SQL on an Apache DataFusion session.
#[derive(Clone)]
pub struct FusionBackend {
    context: Arc<SessionContext>,
    capabilities: BackendCapabilities,
}

impl FusionBackend {
    /// Uses an existing session (tables already registered).
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            context,
            capabilities: BackendCapabilities {
                time_bucketing: true,
                spatial_pushdown: false,
            },
        }
    }

    /// Creates an empty in-process session with the provided configuration.
    pub fn with_config(config: SessionConfig) -> Self {
        Self::new(Arc::new(SessionContext::new_with_config(config)))
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Registers every `.csv` and `.parquet` file of `dir` as a table named
    /// after the file stem. Returns the registered table names, sorted.
    pub async fn register_directory(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(dir).map_err(|err| {
            StoreError::Processing(format!("cannot list {}: {err}", dir.display()))
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|err| StoreError::Processing(format!("cannot read entry: {err}")))?
                .path();
            let (Some(stem), Some(extension)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            files.push((stem.to_string(), extension.to_ascii_lowercase(), path.clone()));
        }
        files.sort();

        let mut tables = Vec::new();
        for (table, extension, path) in files {
            let location = path.to_string_lossy().to_string();
            let registered = match extension.as_str() {
                "csv" => {
                    self.context
                        .register_csv(&table, &location, CsvReadOptions::new())
                        .await
                }
                "parquet" => {
                    self.context
                        .register_parquet(&table, &location, ParquetReadOptions::default())
                        .await
                }
                _ => continue,
            };
            registered.map_err(|err| StoreError::execution(location.clone(), err))?;
            info!(table = %table, path = %location, "registered table");
            tables.push(table);
        }
        Ok(tables)
    }
}

#[async_trait]
impl ObservationBackend for FusionBackend {
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>> {
        // Fresh context over the shared state: registered tables are visible,
        // session settings stay per connection.
        let session = SessionContext::new_with_state(self.context.state());
        Ok(Box::new(FusionConnection { session }))
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }
}

/// Connection backed by a per-operation DataFusion context.
pub struct FusionConnection {
    session: SessionContext,
}

#[async_trait]
impl StoreConnection for FusionConnection {
    async fn query(&self, sql: &str) -> Result<RowCursor> {
        debug!(query = %sql, "executing observation query");
        let frame = self.session.sql(sql).await.map_err(|err| {
            debug!(query = %sql, error = %err, "observation query planning failed");
            StoreError::execution(sql, err)
        })?;
        let stream = frame.execute_stream().await.map_err(|err| {
            debug!(query = %sql, error = %err, "observation query execution failed");
            StoreError::execution(sql, err)
        })?;
        Ok(RowCursor::from_stream(sql, stream))
    }
}
