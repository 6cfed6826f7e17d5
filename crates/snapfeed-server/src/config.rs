use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

/// Placeholder JWT secrets that should never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

const DEFAULT_UPLOAD_URL: &str = "https://api.cloudinary.com/v1_1/cloud-x/image/upload";
const DEFAULT_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub image_upload_url: String,
    pub upload_preset: String,
    pub google_client_id: Option<String>,
    pub google_tokeninfo_url: String,
    pub max_upload_bytes: usize,
}

impl Config {
    /// Read configuration from `SNAPFEED_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let jwt_secret = var_or("SNAPFEED_JWT_SECRET", "dev-secret-change-me");
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            warn!("SNAPFEED_JWT_SECRET is unset or a placeholder; tokens are forgeable");
        }

        let host = var_or("SNAPFEED_HOST", "0.0.0.0");
        let port: u16 = var_or("SNAPFEED_PORT", "3000")
            .parse()
            .context("SNAPFEED_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .context("SNAPFEED_HOST must be an IP address")?;

        let max_upload_bytes: usize = var_or("SNAPFEED_MAX_UPLOAD_BYTES", "10485760")
            .parse()
            .context("SNAPFEED_MAX_UPLOAD_BYTES must be a byte count")?;

        Ok(Self {
            jwt_secret,
            db_path: var_or("SNAPFEED_DB_PATH", "snapfeed.db").into(),
            addr,
            image_upload_url: var_or("SNAPFEED_IMAGE_UPLOAD_URL", DEFAULT_UPLOAD_URL),
            upload_preset: var_or("SNAPFEED_UPLOAD_PRESET", "user_photos"),
            google_client_id: std::env::var("SNAPFEED_GOOGLE_CLIENT_ID")
                .ok()
                .filter(|v| !v.is_empty()),
            google_tokeninfo_url: var_or("SNAPFEED_GOOGLE_TOKENINFO_URL", DEFAULT_TOKENINFO_URL),
            max_upload_bytes,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}
