//! Database helpers for the back office binary.
//!
//! The Postgres backend is the production store; this module wires it from
//! configuration and applies the schema before the server starts.

use tracing::info;

use crate::config::AppConfig;
use crate::error::StorageError;
use crate::store::PgStore;

/// Type alias for the production store.
pub type AppDb = PgStore;

/// Connect to the application database and run pending migrations.
pub async fn connect_and_migrate(config: &AppConfig) -> Result<AppDb, StorageError> {
    let store = PgStore::connect(config).await?;
    info!("Connected to application database");

    store.migrate().await?;
    info!("Application migrations complete");
    Ok(store)
}
