use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};

use snapfeed_types::api::{AuthResponse, Claims, GoogleSignInRequest, LoginRequest, RegisterRequest};
use snapfeed_types::events::SessionState;

use crate::AppState;
use crate::error::ApiError;
use crate::identity::SignedIn;

fn auth_response(signed_in: SignedIn) -> Json<AuthResponse> {
    Json(AuthResponse {
        uid: signed_in.identity.uid,
        username: signed_in.username,
        token: signed_in.token,
    })
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let signed_in = state
        .identity
        .create_user_with_email_and_password(&req.email, &req.password, &req.username)
        .await?;

    Ok((StatusCode::CREATED, auth_response(signed_in)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let signed_in = state
        .identity
        .sign_in_with_email_and_password(&req.email, &req.password)
        .await?;

    Ok(auth_response(signed_in))
}

/// POST /auth/google. The client completes the Google popup flow and sends
/// the resulting ID token together with the username it wants.
pub async fn google_sign_in(
    State(state): State<AppState>,
    Json(req): Json<GoogleSignInRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let signed_in = state
        .identity
        .sign_in_with_google(&req.id_token, &req.username)
        .await?;

    Ok(auth_response(signed_in))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> StatusCode {
    state.identity.sign_out(&claims.sub);
    StatusCode::NO_CONTENT
}

/// GET /session: the session context's snapshot, with `current_user` only
/// when it is the caller.
pub async fn get_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    Json(session_for(state.session.snapshot(), &claims.sub))
}

fn session_for(snapshot: SessionState, uid: &str) -> SessionState {
    let current_user = snapshot.current_user.filter(|user| user.uid == uid);
    SessionState {
        current_user,
        loading: snapshot.loading,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapfeed_types::models::Identity;

    fn signed_in(uid: &str) -> SessionState {
        SessionState {
            current_user: Some(Identity {
                uid: uid.into(),
                email: Some(format!("{}@example.com", uid)),
                display_name: None,
                photo_url: None,
            }),
            loading: false,
        }
    }

    #[test]
    fn session_hides_other_users() {
        let state = session_for(signed_in("victim"), "caller");
        assert!(state.current_user.is_none());
        assert!(!state.loading);

        let state = session_for(signed_in("caller"), "caller");
        assert_eq!(state.current_user.unwrap().uid, "caller");
    }
}
