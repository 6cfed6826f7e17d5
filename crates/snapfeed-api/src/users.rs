use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use snapfeed_types::api::ProfileResponse;
use snapfeed_types::models::UserProfile;

use crate::AppState;
use crate::error::{ApiError, internal, run_blocking};
use crate::feed::{self, parse_timestamp};

/// GET /users/by-username/{username}: profile, follow graph and posts.
pub async fn get_profile(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let response = run_blocking(move || {
        let uid = db
            .get_reservation(&username)
            .map_err(internal("Failed to load profile"))?
            .ok_or(ApiError::NotFound("User"))?;
        let user = db
            .get_user_by_id(&uid)
            .map_err(internal("Failed to load profile"))?
            .ok_or(ApiError::NotFound("User"))?;

        let followers = db.get_followers(&uid).map_err(internal("Failed to load profile"))?;
        let following = db.get_following(&uid).map_err(internal("Failed to load profile"))?;
        let posts = feed::list_by_user(&db, &uid).map_err(internal("Failed to load profile"))?;

        let profile = UserProfile {
            created_at: parse_timestamp(&user.created_at, &user.uid),
            uid: user.uid,
            username: user.username.unwrap_or(username),
            full_name: user.full_name,
            photo_url: user.photo_url,
            bio: user.bio,
            followers,
            following,
        };

        Ok(ProfileResponse { profile, posts })
    })
    .await?;

    Ok(Json(response))
}
