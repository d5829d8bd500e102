//! Read/write HTTP API used by the dashboard.

mod errors;
mod handlers;
mod state;

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use errors::HttpError;
pub use handlers::HISTORY_DAYS;
pub use state::{lazy_pool, ApiState, PgUsageRepository, UsageRepository};

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/update", post(handlers::update))
        .route("/today", get(handlers::today))
        .route("/history", get(handlers::history))
        .route("/summary", get(handlers::summary));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the API until `token` is cancelled.
pub async fn serve(bind_addr: &str, state: ApiState, token: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid api.bind_addr {bind_addr:?}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "usage API listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;

    tracing::info!("usage API stopped");
    Ok(())
}
