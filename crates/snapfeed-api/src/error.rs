use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use snapfeed_db::ReserveError;
use snapfeed_types::api::ErrorBody;

/// Where unauthenticated callers are sent.
pub const LOGIN_PATH: &str = "/auth/login";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Username is already taken by another user.")]
    UsernameTaken,

    #[error("An account with this email already exists.")]
    EmailTaken,

    #[error("Invalid email or password.")]
    InvalidCredentials,

    #[error("Authentication required.")]
    Unauthenticated,

    #[error("{0} not found")]
    NotFound(&'static str),

    /// An outbound service (image host, identity provider) failed.
    #[error("{context}")]
    Upstream {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{context}")]
    Internal {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UsernameTaken | Self::EmailTaken => StatusCode::CONFLICT,
            Self::InvalidCredentials | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// `map_err` adapter wrapping any error as `ApiError::Internal`.
pub fn internal<E: Into<anyhow::Error>>(context: &'static str) -> impl FnOnce(E) -> ApiError {
    move |e| ApiError::Internal {
        context,
        source: e.into(),
    }
}

/// `map_err` adapter wrapping any error as `ApiError::Upstream`.
pub fn upstream<E: Into<anyhow::Error>>(context: &'static str) -> impl FnOnce(E) -> ApiError {
    move |e| ApiError::Upstream {
        context,
        source: e.into(),
    }
}

impl From<ReserveError> for ApiError {
    fn from(e: ReserveError) -> Self {
        match e {
            ReserveError::UsernameTaken => Self::UsernameTaken,
            ReserveError::EmailTaken => Self::EmailTaken,
            ReserveError::Storage(source) => Self::Internal {
                context: "Failed to reserve username",
                source,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let Self::Upstream { context, source } | Self::Internal { context, source } = &self {
            error!("{}: {:#}", context, source);
        }

        let body = Json(ErrorBody {
            error: self.to_string(),
        });

        match self {
            Self::Unauthenticated => (status, [(header::LOCATION, LOGIN_PATH)], body).into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// Run blocking work (SQLite, password hashing) off the async runtime.
pub async fn run_blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(internal("Background task failed"))?
}
