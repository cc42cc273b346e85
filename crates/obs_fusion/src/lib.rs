//! Observation storage and query engine for sensor data.
//!
//! Per-procedure measurements live in relational tables with a dynamic
//! column layout (`mesure{pid}`, `mesure{pid}_{n}`). This crate reads them
//! back as standards-shaped results:
//! - raw collections as delimited text or structured arrays,
//! - decimated overviews bounded to a requested width,
//! - counts,
//!
//! together with the surrounding entities (observations, features of
//! interest, phenomena, processes, sensor locations and times).
//!
//! [`reader::ObservationReader`] is the entry point. It runs on any
//! [`backend::ObservationBackend`]; [`backend::FusionBackend`] executes the
//! queries with Apache DataFusion.

pub mod backend;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod cursor;
pub mod decimation;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod join;
pub mod location;
pub mod metrics;
pub mod model;
pub mod parser;
pub mod phenomenon;
pub mod processor;
pub mod reader;
pub mod result;
pub mod schema;
pub mod selection;

#[cfg(test)]
mod testing;

pub use backend::{BackendCapabilities, FusionBackend, ObservationBackend, StoreConnection};
pub use config::ObsFusionConfig;
pub use error::{Result, StoreError};
pub use model::{
    Field, FieldKind, Observation, Phenomenon, ProcedureInfo, ProcedureKind, TimeRange,
};
pub use reader::{
    Assembly, ObservationReader, ObservationRequest, ReaderOptions, ResponseMode, ResultRequest,
};
pub use result::{ComplexResult, ResultValue, TextEncoding};
pub use selection::{Selection, TemporalFilter};
