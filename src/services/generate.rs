//! Image generation over the job-queue protocol: join the queue, follow the
//! per-session push channel until the job completes, then re-host the
//! produced image for a permanent URL.

use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::services::cancel::{cancelled, CancelReceiver};
use crate::services::chat::decoder::{parse_record, LineDecoder};
use crate::services::chat::{ChatError, TurnUpdate};
use crate::services::config::ServiceConfig;
use crate::services::upload::UploadGateway;
use crate::session::{Message, Part};

const FN_INDEX_GENERATE_IMAGE: u64 = 2;
const TRIGGER_ID_GENERATE_IMAGE: u64 = 5;
const GENERATION_STEPS: u64 = 4;

/// Fallback size for unrecognized aspect-ratio labels (portrait).
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (768, 1344);

/// Resolve a human aspect-ratio label to concrete dimensions. Labels are
/// normalized (connector words and separators removed, case-folded) and
/// matched against a fixed table; unknown labels degrade to the portrait
/// default with a warning, never an error.
pub fn dimensions_for_ratio(label: Option<&str>) -> (u32, u32) {
    let Some(label) = label.map(str::trim).filter(|l| !l.is_empty()) else {
        return DEFAULT_IMAGE_SIZE;
    };

    let r = normalize_ratio(label);
    if r == "11" || r.contains("مربع") || r.contains("square") {
        return (1024, 1024);
    }
    if r == "169"
        || r.contains("افقی")
        || r.contains("لندسکیپ")
        || r.contains("landscape")
        || r.contains("horizontal")
    {
        return (1344, 768);
    }
    if r == "916"
        || r.contains("عمودی")
        || r.contains("پرتره")
        || r.contains("موبایل")
        || r.contains("portrait")
        || r.contains("vertical")
        || r.contains("mobile")
    {
        return (768, 1344);
    }
    match r.as_str() {
        "43" => (1152, 864),
        "34" => (864, 1152),
        "32" => (1216, 832),
        "23" => (832, 1216),
        _ => {
            log::warn!(
                "Unrecognized aspect ratio '{}', using default size",
                label
            );
            DEFAULT_IMAGE_SIZE
        }
    }
}

fn normalize_ratio(label: &str) -> String {
    let mut r = label.to_lowercase();
    // Connector words ("16 به 9", "16 در 9") are removed as whole
    // substrings, then separator characters and whitespace.
    for word in ["در", "به"] {
        r = r.replace(word, "");
    }
    r.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, ':' | 'x' | '×' | '/' | '-' | '*'))
        .collect()
}

/// GPU-quota failures get dedicated guidance in the UI.
pub fn is_gpu_quota_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("gpu") || lower.contains("quota")
}

#[derive(Debug, Deserialize)]
struct QueueJoinResponse {
    #[serde(default)]
    event_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueEvent {
    msg: String,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    output: Option<QueueOutput>,
    #[serde(default)]
    progress_data: Option<Vec<QueueProgress>>,
}

#[derive(Debug, Deserialize)]
struct QueueOutput {
    #[serde(default)]
    data: Option<Vec<QueueOutputEntry>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueOutputEntry {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueProgress {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    length: Option<u32>,
}

pub(crate) struct ImageGeneration<'a> {
    pub http: &'a reqwest::Client,
    pub config: &'a ServiceConfig,
    pub uploads: &'a UploadGateway,
    pub updates: &'a mpsc::UnboundedSender<TurnUpdate>,
}

impl ImageGeneration<'_> {
    fn status(&self, message: &str) {
        let _ = self.updates.send(TurnUpdate::Status {
            message: message.to_string(),
        });
    }

    /// Run one generation to completion and return the final model message:
    /// a single image part with the permanent URL, plus an optional trailing
    /// follow-up text part.
    pub(crate) async fn run(
        &self,
        english_prompt: &str,
        aspect_ratio: Option<&str>,
        follow_up_text: Option<String>,
        cancel: &mut CancelReceiver,
    ) -> Result<Message, ChatError> {
        let (width, height) = dimensions_for_ratio(aspect_ratio);
        let session_hash = Uuid::new_v4().simple().to_string();
        let seed: u64 = rand::thread_rng().gen_range(0..2_147_483_647);

        self.status("Submitting image request…");
        let join_body = serde_json::json!({
            "fn_index": FN_INDEX_GENERATE_IMAGE,
            "data": [english_prompt, seed, true, width, height, GENERATION_STEPS],
            "event_data": null,
            "session_hash": session_hash,
            "trigger_id": TRIGGER_ID_GENERATE_IMAGE,
        });

        let join = self
            .http
            .post(self.config.queue_join_url())
            .json(&join_body)
            .send();
        let response = tokio::select! {
            response = join => response.map_err(ChatError::from)?,
            _ = cancelled(cancel) => return Err(ChatError::cancelled("Generation stopped")),
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<QueueErrorResponse>()
                .await
                .ok()
                .and_then(|e| e.error.or(e.detail));
            return Err(ChatError::server(
                detail.unwrap_or_else(|| format!("Image server error: HTTP {}", status)),
            ));
        }

        let join: QueueJoinResponse = response.json().await.map_err(ChatError::from)?;
        if join.event_id.is_none() {
            return Err(ChatError::malformed(
                "Image server did not return an event_id",
            ));
        }

        let temp_url = self.follow_push_channel(&session_hash, cancel).await?;

        self.status("Image ready, making the link permanent…");
        let permanent_url = self
            .uploads
            .upload_remote_url(&temp_url, cancel)
            .await
            .map_err(|err| {
                if err.is_cancelled() {
                    err
                } else {
                    err.with_context("Image produced but persistence failed")
                }
            })?;

        let mut parts = vec![Part::image(permanent_url)];
        if let Some(text) = follow_up_text.filter(|t| !t.is_empty()) {
            parts.push(Part::text(text));
        }
        Ok(Message::model(parts))
    }

    /// Consume the push channel until the job reaches a terminal event,
    /// returning the transient output URL. The channel closes when this
    /// future resolves or is dropped; cancellation drops it immediately.
    async fn follow_push_channel(
        &self,
        session_hash: &str,
        cancel: &mut CancelReceiver,
    ) -> Result<String, ChatError> {
        let request = self.http.get(self.config.queue_data_url(session_hash)).send();
        let response = tokio::select! {
            response = request => response.map_err(ChatError::from)?,
            _ = cancelled(cancel) => return Err(ChatError::cancelled("Generation stopped")),
        };
        if !response.status().is_success() {
            return Err(ChatError::server(format!(
                "Image server error: HTTP {}",
                response.status()
            )));
        }

        let mut stream = Box::pin(response.bytes_stream());
        let mut decoder = LineDecoder::new();
        let mut payloads = Vec::new();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancelled(cancel) => return Err(ChatError::cancelled("Generation stopped")),
            };

            let Some(chunk) = chunk else {
                // The server ended the channel without a terminal event.
                if let Some(tail) = decoder.finish() {
                    payloads.push(tail);
                    if let Some(done) = self.handle_events(&mut payloads)? {
                        return Ok(done);
                    }
                }
                return Err(ChatError::network("Image server connection lost"));
            };
            let chunk = chunk.map_err(ChatError::from)?;

            decoder.feed(&chunk, &mut payloads);
            if let Some(done) = self.handle_events(&mut payloads)? {
                return Ok(done);
            }
        }
    }

    fn handle_events(&self, payloads: &mut Vec<String>) -> Result<Option<String>, ChatError> {
        for payload in payloads.drain(..) {
            let Some(event) = parse_record::<QueueEvent>(&payload) else {
                continue;
            };
            match event.msg.as_str() {
                "process_starts" => self.status("Image processing started…"),
                "progress" => {
                    if let Some(progress) =
                        event.progress_data.as_deref().and_then(|p| p.first())
                    {
                        let _ = self.updates.send(TurnUpdate::Progress {
                            index: progress.index.unwrap_or(0),
                            length: progress.length.unwrap_or(0),
                        });
                    }
                }
                "process_completed" => {
                    let output = event.output.unwrap_or(QueueOutput {
                        data: None,
                        error: None,
                    });
                    let url = output
                        .data
                        .as_deref()
                        .and_then(|d| d.first())
                        .and_then(|entry| entry.url.clone());
                    return match (event.success.unwrap_or(false), url) {
                        (true, Some(url)) => Ok(Some(url)),
                        _ => Err(ChatError::server(output.error.unwrap_or_else(|| {
                            "Image server response had no valid URL".to_string()
                        }))),
                    };
                }
                "queue_full" => {
                    return Err(ChatError::server(
                        "Image queue is full, try again in a moment",
                    ));
                }
                other => {
                    log::debug!("Ignoring push event '{}'", other);
                }
            }
        }
        Ok(None)
    }
}
