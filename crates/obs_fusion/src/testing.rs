//! Unit-test helpers shared by the crate's modules.

use datafusion::prelude::SessionConfig;

use crate::backend::{FusionBackend, ObservationBackend, StoreConnection};
use crate::schema::create_catalog;

/// Empty in-memory store with the catalog tables created.
pub(crate) async fn store_with_catalog() -> (FusionBackend, Box<dyn StoreConnection>) {
    let backend = FusionBackend::with_config(SessionConfig::new().with_target_partitions(1));
    let connection = backend.acquire().await.expect("acquire");
    create_catalog(connection.as_ref()).await.expect("catalog");
    (backend, connection)
}
