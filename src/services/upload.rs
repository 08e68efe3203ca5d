//! Upload gateway: permanent-storage uploads with progress and independent
//! cancellation, a JSON url-mode re-upload, and the secondary re-host
//! endpoint for produced files.

use std::convert::Infallible;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use reqwest::multipart;
use serde::Deserialize;
use uuid::Uuid;

use crate::services::cancel::{cancelled, CancelReceiver};
use crate::services::chat::ChatError;
use crate::services::config::ServiceConfig;
use crate::services::retry::{is_retryable_status, is_retryable_transport, RetryConfig};
use crate::session::InlineData;

/// Percentage callback for multipart uploads.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// A file uploaded to permanent storage, with its payload kept inline so the
/// chat request can attach it for analysis.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub url: String,
    pub name: String,
    pub mime_type: String,
    pub inline_data: InlineData,
}

#[derive(Debug, Deserialize)]
struct UploaderResponse {
    #[serde(default)]
    hf_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RehostResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct UploadGateway {
    http: reqwest::Client,
    upload_url: String,
    rehost_url: String,
    retry: RetryConfig,
}

impl UploadGateway {
    pub fn new(http: reqwest::Client, config: &ServiceConfig) -> Self {
        Self {
            http,
            upload_url: config.upload_url.clone(),
            rehost_url: config.rehost_url.clone(),
            retry: RetryConfig::from_env(),
        }
    }

    /// Upload raw content, reporting percentage progress as the body is
    /// consumed by the transport. Cancellation surfaces as the distinct
    /// cancelled condition, not a generic network error.
    pub async fn upload_file(
        &self,
        content: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        progress: Option<ProgressFn>,
        cancel: &mut CancelReceiver,
    ) -> Result<String, ChatError> {
        let total = content.len().max(1) as u64;
        let mut sent = 0u64;
        let chunks: Vec<Bytes> = content
            .chunks(UPLOAD_CHUNK_SIZE)
            .map(Bytes::copy_from_slice)
            .collect();
        let stream = futures_util::stream::iter(chunks.into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            if let Some(progress) = progress.as_deref() {
                progress(percent(sent, total));
            }
            Ok::<Bytes, Infallible>(chunk)
        }));

        let part = multipart::Part::stream_with_length(
            reqwest::Body::wrap_stream(stream),
            content.len() as u64,
        )
        .file_name(file_name.to_string())
        .mime_str(mime_type)
        .map_err(|_| ChatError::content(format!("Invalid mime type '{}'", mime_type)))?;
        let form = multipart::Form::new().part("file", part);

        let request = self.http.post(&self.upload_url).multipart(form).send();
        let response = tokio::select! {
            response = request => response.map_err(ChatError::from)?,
            _ = cancelled(cancel) => {
                return Err(ChatError::cancelled("Upload cancelled by user"));
            }
        };

        parse_uploader_response(response).await
    }

    /// Upload a file and keep its base64 payload alongside the permanent
    /// URL, ready to attach to the next chat request.
    pub async fn process_and_upload(
        &self,
        content: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        progress: Option<ProgressFn>,
        cancel: &mut CancelReceiver,
    ) -> Result<UploadedFile, ChatError> {
        let encoded = general_purpose::STANDARD.encode(&content);
        let url = self
            .upload_file(content, file_name, mime_type, progress, cancel)
            .await?;
        Ok(UploadedFile {
            url,
            name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            inline_data: InlineData {
                mime_type: mime_type.to_string(),
                data: encoded,
            },
        })
    }

    /// Ask the uploader to fetch `url` itself and re-host the content.
    /// Retries transient failures; the call is idempotent.
    pub async fn upload_remote_url(
        &self,
        url: &str,
        cancel: &mut CancelReceiver,
    ) -> Result<String, ChatError> {
        let mut last_error: Option<ChatError> = None;

        for attempt in 1..=self.retry.max_attempts {
            let request = self
                .http
                .post(&self.upload_url)
                .json(&serde_json::json!({ "url": url }))
                .send();
            let response = tokio::select! {
                response = request => response,
                _ = cancelled(cancel) => {
                    return Err(ChatError::cancelled("Upload cancelled by user"));
                }
            };

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    let retryable = is_retryable_transport(&err);
                    let err = ChatError::from(err);
                    if attempt < self.retry.max_attempts && retryable {
                        log::warn!(
                            "Re-upload retry {}/{} after error: {}",
                            attempt + 1,
                            self.retry.max_attempts,
                            err
                        );
                        last_error = Some(err);
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            };

            if attempt < self.retry.max_attempts && is_retryable_status(response.status()) {
                let status = response.status();
                log::warn!(
                    "Re-upload retry {}/{} after HTTP {}",
                    attempt + 1,
                    self.retry.max_attempts,
                    status
                );
                last_error = Some(ChatError::server(format!("Uploader error: HTTP {}", status)));
                tokio::time::sleep(self.retry.backoff(attempt)).await;
                continue;
            }

            return parse_uploader_response(response).await;
        }

        Err(last_error.unwrap_or_else(|| ChatError::network("Re-upload retry limit exceeded")))
    }

    /// Push produced bytes to the secondary hosting server and return the
    /// public URL.
    pub async fn rehost(
        &self,
        content: Vec<u8>,
        file_name: &str,
        cancel: &mut CancelReceiver,
    ) -> Result<String, ChatError> {
        let part = multipart::Part::bytes(content).file_name(file_name.to_string());
        let form = multipart::Form::new().part("image", part);

        let request = self.http.post(&self.rehost_url).multipart(form).send();
        let response = tokio::select! {
            response = request => response.map_err(ChatError::from)?,
            _ = cancelled(cancel) => {
                return Err(ChatError::cancelled("Upload cancelled by user"));
            }
        };

        let status = response.status();
        let body = response.text().await.map_err(ChatError::from)?;
        if !status.is_success() {
            let detail = if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                body
            };
            return Err(ChatError::server(format!("Re-host failed: {}", detail)));
        }

        let parsed: RehostResponse = serde_json::from_str(&body)
            .map_err(|_| ChatError::malformed("Unexpected re-host server response"))?;
        if !parsed.success {
            return Err(ChatError::server(
                parsed
                    .message
                    .unwrap_or_else(|| "Re-host server rejected the file".to_string()),
            ));
        }
        parsed
            .url
            .ok_or_else(|| ChatError::malformed("Re-host response missing 'url'"))
    }

    /// Download transient content and push it to the re-host endpoint.
    pub async fn fetch_and_rehost(
        &self,
        source_url: &str,
        cancel: &mut CancelReceiver,
    ) -> Result<String, ChatError> {
        let request = self.http.get(source_url).send();
        let response = tokio::select! {
            response = request => response.map_err(ChatError::from)?,
            _ = cancelled(cancel) => {
                return Err(ChatError::cancelled("Upload cancelled by user"));
            }
        };
        if !response.status().is_success() {
            return Err(ChatError::server(format!(
                "Fetching source content failed: HTTP {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await.map_err(ChatError::from)?.to_vec();
        let file_name = file_name_from_url(source_url)
            .unwrap_or_else(|| format!("generated_{}.webp", Uuid::new_v4().simple()));
        self.rehost(bytes, &file_name, cancel).await
    }
}

async fn parse_uploader_response(response: reqwest::Response) -> Result<String, ChatError> {
    let status = response.status();
    let body = response.text().await.map_err(ChatError::from)?;
    let parsed: Option<UploaderResponse> = serde_json::from_str(&body).ok();

    if !status.is_success() {
        return Err(ChatError::server(
            parsed
                .and_then(|p| p.error)
                .unwrap_or_else(|| format!("Uploader error: HTTP {}", status)),
        ));
    }
    parsed
        .ok_or_else(|| {
            ChatError::malformed(format!("Unexpected uploader response (HTTP {})", status))
        })?
        .hf_url
        .ok_or_else(|| ChatError::malformed("Uploader response missing 'hf_url'"))
}

fn percent(sent: u64, total: u64) -> u8 {
    ((sent.min(total) * 100) / total) as u8
}

fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    if name.contains('.') {
        Some(name.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_clamps() {
        assert_eq!(percent(0, 100), 0);
        assert_eq!(percent(50, 100), 50);
        assert_eq!(percent(100, 100), 100);
        assert_eq!(percent(250, 100), 100);
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://x/space/img.webp?download=1").as_deref(),
            Some("img.webp")
        );
        assert_eq!(file_name_from_url("https://x/space/noext"), None);
    }
}
