pub mod auth;
pub mod engagement;
pub mod error;
pub mod feed;
pub mod identity;
pub mod image_host;
pub mod middleware;
pub mod posts;
pub mod session;
pub mod users;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post, put},
};

use snapfeed_db::Database;

use crate::identity::IdentityService;
use crate::image_host::ImageHost;
use crate::middleware::require_auth;
use crate::session::SessionContext;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub identity: Arc<IdentityService>,
    pub images: ImageHost,
    pub session: SessionContext,
}

/// All HTTP routes. Writes and the session snapshot require a bearer token;
/// other reads are public.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let mut public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/posts", get(posts::list_latest))
        .route("/posts/{post_id}", get(posts::get_post))
        .route("/users/{uid}/posts", get(posts::list_user_posts))
        .route("/users/by-username/{username}", get(users::get_profile));

    // Without a configured client id, Google tokens cannot be audience-checked
    if state.identity.google_enabled() {
        public_routes = public_routes.route("/auth/google", post(auth::google_sign_in));
    }

    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/session", get(auth::get_session))
        .route("/posts", post(posts::upload_post))
        .route("/posts/{post_id}/likes", put(engagement::put_like))
        .route("/posts/{post_id}/comments", post(engagement::post_comment))
        .route("/users/{uid}/follow", put(engagement::put_follow))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
