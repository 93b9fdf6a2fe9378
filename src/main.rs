//! # Tutoring-goods back office server
//!
//! Serves the approval workflow and payment reconciliation operations over
//! HTTP, backed by PostgreSQL.
//!
//! ## Architecture
//!
//! - Axum handles HTTP routing and request/response lifecycle
//! - SQLx manages the back office database and its migrations
//! - Every operation runs in one database transaction

use std::sync::Arc;

use tracing::info;

use tutor_backoffice::config::AppConfig;
use tutor_backoffice::{create_app, db, BackOffice};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutor_backoffice=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting tutoring back office");

    let config = AppConfig::from_env()?;
    let store = db::connect_and_migrate(&config).await?;

    let office = Arc::new(BackOffice::new(
        Arc::new(store),
        config.refund_correlation_window(),
    ));
    info!(
        "Back office ready with {} completion handlers, refund correlation window {}s",
        office.completions().handler_count(),
        config.refund_correlation_window_secs
    );

    let app = create_app(office);

    // Bind and serve
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
