pub mod daily_menu;
pub mod health;
pub mod metrics;

use std::future::Future;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{error::VoteError, services::metrics::CONFLICTS_COUNTER, AppState};

/// Run `op` again while it fails with `Conflict`, at most `attempts` times in
/// total. The last error is returned as is.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, VoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VoteError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() => {
                CONFLICTS_COUNTER.inc();
                if attempt >= attempts {
                    warn!(attempt, "giving up after write conflict: {e}");
                    return Err(e);
                }
                warn!(attempt, "write conflict, retrying: {e}");
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn cors_layer(app_base_url: &str) -> CorsLayer {
    // Local development origins are always allowed
    let base = app_base_url.to_string();
    let origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let Ok(o) = origin.to_str() else {
            return false;
        };
        o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1") || o == base
    });

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-admin-key"),
        ]))
        .allow_origin(origin)
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.app_base_url);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        // Daily voting
        .route(
            "/api/daily-menu/{date}",
            get(daily_menu::get_menu).delete(daily_menu::delete_menu),
        )
        .route("/api/daily-menu/{date}/start", post(daily_menu::start_voting))
        .route(
            "/api/daily-menu/{date}/vote",
            post(daily_menu::cast_vote).delete(daily_menu::cancel_vote),
        )
        .route("/api/daily-menu/{date}/close", post(daily_menu::close_voting))
        .route("/api/daily-menu/{date}/admin-food", put(daily_menu::admin_set_food))
        .route("/api/daily-menu/{date}/visibility", put(daily_menu::set_visibility))
        // Results
        .route("/api/daily-results", get(daily_menu::list_results))
        .route("/api/daily-results/{date}", get(daily_menu::get_result))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
