use axum::{
    extract::{Query, State},
    Json,
};

use crate::{
    error::Result,
    models::{Call, RecentCallsQuery},
    AppState,
};

use super::AuthUser;

/// The caller's own call records, newest first.
pub async fn recent_calls(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<RecentCallsQuery>,
) -> Result<Json<Vec<Call>>> {
    let limit = query.limit.clamp(1, 100);
    let calls = state.storage.recent_calls_for_user(&auth.user_id, limit).await?;
    Ok(Json(calls))
}
