//! # Tutoring-goods back office
//!
//! An approval workflow engine coupled to payment split-allocation and refund
//! reconciliation over an append-only ledger. Exposes the [`BackOffice`]
//! facade, its storage backends and the Axum router so integration tests can
//! drive an in-process server without a database.

pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod refund;
pub mod routes;
pub mod service;
pub mod store;
pub mod workflow;

use std::sync::Arc;

use axum::{Extension, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::{BackOfficeError, StorageError};
pub use service::BackOffice;
pub use store::{BackOfficeStore, MemoryStore, PgStore};

/// Build the Axum router with all route modules and middleware.
///
/// The caller provides a back office over an already connected store. This
/// function does NOT start a server.
pub fn create_app<S: BackOfficeStore>(office: Arc<BackOffice<S>>) -> Router {
    Router::new()
        .merge(routes::flows::router::<S>())
        .merge(routes::votes::router::<S>())
        .merge(routes::payments::router::<S>())
        .merge(routes::refunds::router::<S>())
        .layer(Extension(office))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
