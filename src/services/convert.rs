//! Text-to-file conversion: render chat content into a downloadable file via
//! the conversion service, then re-host the produced blob publicly.

use reqwest::multipart;
use uuid::Uuid;

use crate::services::cancel::{cancelled, CancelReceiver};
use crate::services::chat::ChatError;
use crate::services::config::ServiceConfig;
use crate::services::upload::UploadGateway;

/// Convert `content` to the requested `format` (e.g. "pdf", "docx") and
/// return the public URL of the hosted result.
pub async fn convert_and_host(
    http: &reqwest::Client,
    config: &ServiceConfig,
    uploads: &UploadGateway,
    content: &str,
    format: &str,
    cancel: &mut CancelReceiver,
) -> Result<String, ChatError> {
    let form = multipart::Form::new()
        .text("content", content.to_string())
        .text("format", format.to_string());

    let request = http.post(&config.convert_url).multipart(form).send();
    let response = tokio::select! {
        response = request => response.map_err(ChatError::from)?,
        _ = cancelled(cancel) => return Err(ChatError::cancelled("Conversion stopped")),
    };
    if !response.status().is_success() {
        return Err(ChatError::server(format!(
            "Conversion server error: HTTP {}",
            response.status()
        )));
    }

    let blob = response.bytes().await.map_err(ChatError::from)?.to_vec();
    let file_name = format!("export-{}.{}", Uuid::new_v4().simple(), format);
    uploads.rehost(blob, &file_name, cancel).await
}
