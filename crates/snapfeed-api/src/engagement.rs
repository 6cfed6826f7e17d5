use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{SecondsFormat, Utc};
use tracing::info;
use uuid::Uuid;

use snapfeed_db::Database;
use snapfeed_db::models::NewComment;
use snapfeed_types::api::{
    AddCommentRequest, Claims, FollowRequest, FollowResponse, LikeResponse, ToggleLikeRequest,
};
use snapfeed_types::models::Comment;

use crate::AppState;
use crate::error::{ApiError, internal, run_blocking};

pub const MAX_COMMENT_LEN: usize = 2200;

/// Author fields captured on a comment when it's written.
pub struct CommentAuthor<'a> {
    pub uid: &'a str,
    pub username: &'a str,
}

/// Add `user_id` to the post's likes (`like = true`) or remove it. Repeating
/// either direction changes nothing.
pub fn toggle_like(db: &Database, post_id: &str, user_id: &str, like: bool) -> Result<LikeResponse, ApiError> {
    let like_count = db
        .set_like(post_id, user_id, like)
        .map_err(internal("Failed to update like"))?
        .ok_or(ApiError::NotFound("Post"))?;

    Ok(LikeResponse {
        liked: like,
        like_count,
    })
}

/// Append a comment. Empty or whitespace-only text is rejected before anything is written.
pub fn add_comment(
    db: &Database,
    post_id: &str,
    text: &str,
    author: &CommentAuthor<'_>,
) -> Result<Comment, ApiError> {
    let text = validate_comment(text)?;

    // Time-ordered id generated here rather than by the store
    let id = Uuid::now_v7().to_string();
    let created_at = Utc::now();
    let stored_at = created_at.to_rfc3339_opts(SecondsFormat::Millis, true);

    let appended = db
        .append_comment(
            post_id,
            &NewComment {
                id: &id,
                user_id: author.uid,
                username: author.username,
                text,
                created_at: &stored_at,
            },
        )
        .map_err(internal("Failed to add comment"))?;
    if !appended {
        return Err(ApiError::NotFound("Post"));
    }

    Ok(Comment {
        id,
        user_id: author.uid.to_string(),
        username: author.username.to_string(),
        text: text.to_string(),
        created_at,
    })
}

fn validate_comment(raw: &str) -> Result<&str, ApiError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ApiError::validation("Comment cannot be empty"));
    }
    if text.chars().count() > MAX_COMMENT_LEN {
        return Err(ApiError::validation(format!(
            "Comment cannot be longer than {} characters",
            MAX_COMMENT_LEN
        )));
    }
    Ok(text)
}

// -- Handlers --

/// PUT /posts/{post_id}/likes
pub async fn put_like(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleLikeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.clone();
    let pid = post_id.clone();
    let resp = run_blocking(move || toggle_like(&db, &pid, &uid, req.like)).await?;

    info!(
        "{} {} post {} ({} likes)",
        claims.username,
        if resp.liked { "liked" } else { "unliked" },
        post_id,
        resp.like_count
    );
    Ok(Json(resp))
}

/// POST /posts/{post_id}/comments
pub async fn post_comment(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let comment = run_blocking(move || {
        let author = CommentAuthor {
            uid: &claims.sub,
            username: &claims.username,
        };
        add_comment(&db, &post_id, &req.comment, &author)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(comment)))
}

/// PUT /users/{uid}/follow
pub async fn put_follow(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<FollowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if uid == claims.sub {
        return Err(ApiError::validation("You cannot follow yourself"));
    }

    let db = state.db.clone();
    let follower = claims.sub.clone();
    let follower_count = run_blocking(move || {
        db.set_follow(&follower, &uid, req.follow)
            .map_err(internal("Failed to update follow"))?
            .ok_or(ApiError::NotFound("User"))
    })
    .await?;

    Ok(Json(FollowResponse {
        following: req.follow,
        follower_count,
    }))
}
