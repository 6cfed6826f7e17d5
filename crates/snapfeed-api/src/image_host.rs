use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Serialize)]
struct UploadRequest<'a> {
    file: String,
    upload_preset: &'a str,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
}

/// Client for a Cloudinary-style unsigned upload endpoint.
pub struct ImageHost {
    client: reqwest::Client,
    upload_url: String,
    upload_preset: String,
}

impl ImageHost {
    pub fn new(client: reqwest::Client, upload_url: String, upload_preset: String) -> Self {
        Self {
            client,
            upload_url,
            upload_preset,
        }
    }

    /// Upload raw image bytes and return the public URL.
    pub async fn upload(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        let request = UploadRequest {
            file: data_url(bytes, content_type),
            upload_preset: &self.upload_preset,
        };

        let resp = self
            .client
            .post(&self.upload_url)
            .json(&request)
            .send()
            .await
            .context("image host unreachable")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("image host returned {}: {}", status, body);
        }

        let uploaded: UploadResponse = resp.json().await.context("malformed image host response")?;
        let url = uploaded
            .secure_url
            .context("image host response has no secure_url")?;

        info!("Uploaded {} byte image to {}", bytes.len(), url);
        Ok(url)
    }
}

fn data_url(bytes: &[u8], content_type: &str) -> String {
    format!("data:{};base64,{}", content_type, B64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_data_url() {
        assert_eq!(data_url(b"hi", "image/png"), "data:image/png;base64,aGk=");
    }
}
