use axum::{
    Extension, Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use snapfeed_types::api::{Claims, FeedQuery};

use crate::AppState;
use crate::error::{ApiError, internal, run_blocking, upstream};
use crate::feed::{self, DEFAULT_FEED_LIMIT, MAX_FEED_LIMIT};

/// GET /posts?limit=
pub async fn list_latest(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_FEED_LIMIT).clamp(1, MAX_FEED_LIMIT);
    let db = state.db.clone();
    let posts = run_blocking(move || {
        feed::list_latest(&db, limit).map_err(internal("Failed to load posts"))
    })
    .await?;

    Ok(Json(posts))
}

/// GET /posts/{post_id}
pub async fn get_post(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let post = run_blocking(move || {
        feed::get_by_id(&db, &post_id).map_err(internal("Failed to load post"))
    })
    .await?
    .ok_or(ApiError::NotFound("Post"))?;

    Ok(Json(post))
}

/// GET /users/{uid}/posts
pub async fn list_user_posts(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let posts = run_blocking(move || {
        feed::list_by_user(&db, &uid).map_err(internal("Failed to load posts"))
    })
    .await?;

    Ok(Json(posts))
}

struct ImageField {
    bytes: Bytes,
    content_type: String,
}

/// POST /posts: multipart form with a required `image` file and an optional
/// `caption`. The image goes to the image host; the post stores its URL.
pub async fn upload_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut image: Option<ImageField> = None;
    let mut caption: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("Malformed upload: {}", e)))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("Malformed upload: {}", e)))?;
                image = Some(ImageField { bytes, content_type });
            }
            Some("caption") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::validation(format!("Malformed upload: {}", e)))?;
                let text = text.trim();
                caption = (!text.is_empty()).then(|| text.to_string());
            }
            other => warn!("Ignoring unexpected upload field {:?}", other),
        }
    }

    let image = image
        .filter(|image| !image.bytes.is_empty())
        .ok_or_else(|| ApiError::validation("No image provided"))?;
    if !image.content_type.starts_with("image/") {
        return Err(ApiError::validation("Uploaded file is not an image"));
    }

    let image_url = state
        .images
        .upload(&image.bytes, &image.content_type)
        .await
        .map_err(upstream("Failed to upload post"))?;

    let post_id = Uuid::new_v4().to_string();
    let db = state.db.clone();
    let uid = claims.sub.clone();
    let post = run_blocking(move || {
        db.insert_post(&post_id, &uid, &image_url, caption.as_deref())
            .map_err(internal("Failed to upload post"))?;
        feed::get_by_id(&db, &post_id)
            .map_err(internal("Failed to upload post"))?
            .ok_or_else(|| ApiError::Internal {
                context: "Failed to upload post",
                source: anyhow::anyhow!("post {} vanished after insert", post_id),
            })
    })
    .await?;

    info!("{} uploaded post {}", claims.username, post.id);
    Ok((StatusCode::CREATED, Json(post)))
}
