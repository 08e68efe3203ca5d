//! Image editing: fetch the source, transcode to PNG when needed, call the
//! synchronous edit endpoint, then re-host every result permanently.

use std::io::Cursor;

use futures_util::future::try_join_all;
use reqwest::multipart;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::services::cancel::{cancelled, CancelReceiver};
use crate::services::chat::{ChatError, TurnUpdate};
use crate::services::config::ServiceConfig;
use crate::services::upload::UploadGateway;
use crate::session::{Message, Part};

#[derive(Debug, Deserialize)]
struct EditResponse {
    #[serde(default)]
    image_urls: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

pub(crate) struct ImageEdit<'a> {
    pub http: &'a reqwest::Client,
    pub config: &'a ServiceConfig,
    pub uploads: &'a UploadGateway,
    pub updates: &'a mpsc::UnboundedSender<TurnUpdate>,
}

impl ImageEdit<'_> {
    fn status(&self, message: &str) {
        let _ = self.updates.send(TurnUpdate::Status {
            message: message.to_string(),
        });
    }

    /// Edit the image at `source_url` per `instruction` and return the final
    /// model message carrying the ordered permanent result URLs.
    pub(crate) async fn run(
        &self,
        instruction: &str,
        source_url: &str,
        cancel: &mut CancelReceiver,
    ) -> Result<Message, ChatError> {
        self.status("Downloading file for editing…");
        let request = self.http.get(source_url).send();
        let response = tokio::select! {
            response = request => response.map_err(ChatError::from)?,
            _ = cancelled(cancel) => return Err(ChatError::cancelled("Edit stopped")),
        };
        if !response.status().is_success() {
            return Err(ChatError::server(format!(
                "Downloading the file for editing failed: HTTP {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let mut bytes = response.bytes().await.map_err(ChatError::from)?.to_vec();

        let accepted = matches!(
            content_type.as_deref(),
            Some("image/png") | Some("image/jpeg")
        );
        if !accepted {
            let format = content_type
                .as_deref()
                .and_then(|t| t.split('/').nth(1))
                .unwrap_or("unknown");
            self.status(&format!(
                "Image format ({}) not supported, converting to PNG…",
                format.to_uppercase()
            ));
            bytes = transcode_to_png(&bytes)?;
        }

        self.status("Sending edit request…");
        let part = multipart::Part::bytes(bytes)
            .file_name("image.png")
            .mime_str("image/png")
            .map_err(|_| ChatError::content("Invalid edit payload"))?;
        let form = multipart::Form::new()
            .part("image", part)
            .text("prompt", instruction.to_string());

        let request = self.http.post(&self.config.edit_url).multipart(form).send();
        let response = tokio::select! {
            response = request => response.map_err(ChatError::from)?,
            _ = cancelled(cancel) => return Err(ChatError::cancelled("Edit stopped")),
        };

        let status = response.status();
        let body = response.text().await.map_err(ChatError::from)?;
        let parsed: Option<EditResponse> = serde_json::from_str(&body).ok();
        if !status.is_success() {
            let message = parsed
                .and_then(|p| p.error)
                .unwrap_or_else(|| format!("Edit server error: HTTP {}", status));
            return Err(ChatError::server(message));
        }
        let parsed =
            parsed.ok_or_else(|| ChatError::malformed("Unexpected edit server response"))?;

        let urls = parsed.image_urls.unwrap_or_default();
        if urls.is_empty() {
            return Err(ChatError::content(
                "Edit finished but the server returned no images",
            ));
        }

        self.status("Making the edited image links permanent…");
        let permanent_urls = try_join_all(urls.iter().map(|url| {
            let mut cancel = cancel.clone();
            async move { self.uploads.upload_remote_url(url, &mut cancel).await }
        }))
        .await
        .map_err(|err| {
            if err.is_cancelled() {
                err
            } else {
                err.with_context("Images edited but persistence failed")
            }
        })?;

        Ok(Message::model(vec![Part::edited_images(permanent_urls)]))
    }
}

/// Decode arbitrary image bytes and re-encode as PNG. A source that cannot
/// be decoded is a terminal content error.
fn transcode_to_png(bytes: &[u8]) -> Result<Vec<u8>, ChatError> {
    let img = image::load_from_memory(bytes)
        .map_err(|err| ChatError::content(format!("Failed to decode source image: {}", err)))?;
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|err| ChatError::content(format!("Failed to encode PNG: {}", err)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcode_webp_like_input_to_png() {
        // A 2x2 JPEG stands in for any non-PNG source.
        let mut jpeg = Vec::new();
        let img = image::DynamicImage::new_rgb8(2, 2);
        img.write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let png = transcode_to_png(&jpeg).unwrap();
        assert_eq!(
            image::guess_format(&png).unwrap(),
            image::ImageFormat::Png
        );
    }

    #[test]
    fn test_transcode_rejects_garbage() {
        let err = transcode_to_png(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ChatError::Content { .. }));
    }

    #[test]
    fn test_edit_response_shapes() {
        let ok: EditResponse =
            serde_json::from_str(r#"{"image_urls":["https://x/a.png"]}"#).unwrap();
        assert_eq!(ok.image_urls.unwrap().len(), 1);

        let err: EditResponse = serde_json::from_str(r#"{"error":"bad prompt"}"#).unwrap();
        assert_eq!(err.error.as_deref(), Some("bad prompt"));
    }
}
