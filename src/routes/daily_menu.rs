use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;

use crate::{
    error::VoteError,
    middleware::admin::AdminAuth,
    models::daily_menu::{
        AdminSetFoodRequest, CancelVoteRequest, CastVoteRequest, DailyMenuState, DailyResult,
        ResultsQuery, StartVotingRequest, VisibilityRequest,
    },
    routes::retry_on_conflict,
    AppState,
};

const DEFAULT_RESULTS_LIMIT: i64 = 30;
const MAX_RESULTS_LIMIT: i64 = 365;

type MenuResponse = Result<Json<DailyMenuState>, VoteError>;

/// GET /api/daily-menu/{date}
pub async fn get_menu(State(state): State<AppState>, Path(date): Path<NaiveDate>) -> MenuResponse {
    state.menus.get_or_create(date).await.map(Json)
}

/// DELETE /api/daily-menu/{date} — admin only
pub async fn delete_menu(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(date): Path<NaiveDate>,
) -> Result<StatusCode, VoteError> {
    state.menus.delete(date).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/daily-menu/{date}/start — admin only
pub async fn start_voting(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(date): Path<NaiveDate>,
    Json(body): Json<StartVotingRequest>,
) -> MenuResponse {
    retry_on_conflict(state.config.vote_retry_limit, || {
        state.menus.start_voting(date, &body.packs)
    })
    .await
    .map(Json)
}

/// POST /api/daily-menu/{date}/vote
pub async fn cast_vote(
    State(state): State<AppState>,
    Path(date): Path<NaiveDate>,
    Json(body): Json<CastVoteRequest>,
) -> MenuResponse {
    retry_on_conflict(state.config.vote_retry_limit, || {
        state.menus.cast_vote(date, &body.user_id, body.pack_index)
    })
    .await
    .map(Json)
}

/// DELETE /api/daily-menu/{date}/vote
pub async fn cancel_vote(
    State(state): State<AppState>,
    Path(date): Path<NaiveDate>,
    Json(body): Json<CancelVoteRequest>,
) -> MenuResponse {
    retry_on_conflict(state.config.vote_retry_limit, || {
        state.menus.cancel_vote(date, &body.user_id)
    })
    .await
    .map(Json)
}

/// POST /api/daily-menu/{date}/close — admin only
pub async fn close_voting(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(date): Path<NaiveDate>,
) -> MenuResponse {
    retry_on_conflict(state.config.vote_retry_limit, || state.menus.close_voting(date))
        .await
        .map(Json)
}

/// PUT /api/daily-menu/{date}/admin-food — admin only
pub async fn admin_set_food(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(date): Path<NaiveDate>,
    Json(body): Json<AdminSetFoodRequest>,
) -> MenuResponse {
    retry_on_conflict(state.config.vote_retry_limit, || {
        state.menus.admin_set_food(date, body.food_id)
    })
    .await
    .map(Json)
}

/// PUT /api/daily-menu/{date}/visibility — admin only
pub async fn set_visibility(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(date): Path<NaiveDate>,
    Json(body): Json<VisibilityRequest>,
) -> MenuResponse {
    retry_on_conflict(state.config.vote_retry_limit, || {
        state.menus.set_visibility(date, body.visible)
    })
    .await
    .map(Json)
}

/// GET /api/daily-results?limit=N
pub async fn list_results(
    State(state): State<AppState>,
    Query(params): Query<ResultsQuery>,
) -> Result<Json<Vec<DailyResult>>, VoteError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RESULTS_LIMIT)
        .clamp(1, MAX_RESULTS_LIMIT);
    state.menus.list_results(limit).await.map(Json)
}

/// GET /api/daily-results/{date}
pub async fn get_result(
    State(state): State<AppState>,
    Path(date): Path<NaiveDate>,
) -> Result<Json<DailyResult>, VoteError> {
    state.menus.get_result(date).await.map(Json)
}
