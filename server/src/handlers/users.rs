//! User directory handlers

use axum::{
    extract::{Path, State},
    Json,
};
use crate::{
    error::{AppError, Result},
    models::*,
    AppState,
};

use super::AuthUser;

/// Get another user's profile by ID, with their live presence
pub async fn get_user(
    State(state): State<AppState>,
    _auth: AuthUser, // Must be authenticated
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>> {
    let user = state
        .storage
        .get_user(&user_id)
        .await?
        .ok_or(AppError::NotFound("User not found".to_string()))?;

    if !user.is_active {
        return Err(AppError::NotFound("User not found".to_string()));
    }

    let online = state.connections.is_user_online(&user.user_id);
    Ok(Json(UserProfile::new(user, online)))
}

