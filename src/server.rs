//! HTTP server and routes.

mod handlers;
mod kobo;
mod proxy;
mod state;

pub use proxy::{StoreProxy, StoreResponse, StoreSync};
pub use state::{AppState, CoverSource};

use axum::{
    Router,
    routing::{any, get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Device routes carry the credential as the first path segment; anything without a
    // local handler falls through to the store
    let kobo_routes = Router::new()
        .route("/api/kobo/{token}/v1/initialization", get(kobo::initialization))
        .route("/api/kobo/{token}/v1/auth/device", post(kobo::auth_device))
        .route("/api/kobo/{token}/v1/library/sync", get(kobo::library_sync))
        .route(
            "/api/kobo/{token}/v1/library/{book_id}/state",
            get(kobo::get_reading_state).put(kobo::put_reading_state),
        )
        .route("/api/kobo/{token}/{*path}", any(kobo::store_passthrough));

    let api_routes = Router::new()
        .route("/jobs/stats", get(handlers::api_job_stats))
        .route("/jobs/failed", get(handlers::api_jobs_failed))
        .route("/jobs/{id}/retry", post(handlers::api_job_retry))
        .route("/scan", post(handlers::api_scan))
        .route("/books", get(handlers::api_books));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/download/{id}", get(handlers::download))
        .route(
            "/images/{id}/{width}/{height}/{grey}/img.jpg",
            get(handlers::cover),
        )
        .merge(kobo_routes)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
