//! Per-turn orchestration: consume the chat stream, dispatch the embedded
//! intent protocol, and drive the delegated media workflow to a terminal
//! state.
//!
//! Exactly one terminal state is reached per turn: Completed (a final
//! message to commit), Completed-Empty (placeholder removed),
//! AwaitingClarification (a clarification message to commit), Aborted
//! (user stop, neutral), or Failed (error propagated to the caller).

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::services::cancel::{cancelled, CancelReceiver};
use crate::services::config::ServiceConfig;
use crate::services::edit::ImageEdit;
use crate::services::generate::ImageGeneration;
use crate::services::upload::UploadGateway;
use crate::session::{latest_editable_url, Message, Part, SessionStore};

use super::decoder::LineDecoder;
use super::error::ChatError;
use super::types::{ChatRequestBody, ImageGenPayload, StreamRecord, TurnUpdate};

/// Everything a running turn needs, owned for the lifetime of the task.
pub(crate) struct TurnContext {
    pub http: reqwest::Client,
    pub config: ServiceConfig,
    pub uploads: UploadGateway,
    pub store: SessionStore,
    pub conversation_id: String,
    pub placeholder_index: usize,
    pub updates: mpsc::UnboundedSender<TurnUpdate>,
    pub cancel: CancelReceiver,
}

/// Terminal state of a turn. Failures travel as `Err(ChatError)`;
/// cancellation is folded into `Aborted` before the result leaves this
/// module, so it can never double-report.
#[derive(Debug)]
pub(crate) enum TurnOutcome {
    Completed(Message),
    CompletedEmpty,
    AwaitingClarification(Message),
    Aborted,
}

/// How the primary stream ended.
#[derive(Debug, PartialEq)]
enum StreamEnd {
    /// Stream ran to completion; `text` holds the accumulated buffer.
    Finished { text: String },
    GenerateImage {
        lead_in: Option<String>,
        payload: ImageGenPayload,
        follow_up_text: Option<String>,
    },
    Clarify {
        question: String,
        options: crate::session::ClarificationOptions,
    },
    Edit {
        prompt: String,
    },
}

#[derive(Debug, Deserialize)]
struct ChatErrorBody {
    #[serde(default)]
    error: Option<ChatErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ChatErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Drive one turn end to end.
pub(crate) async fn run_turn(
    ctx: &mut TurnContext,
    body: ChatRequestBody,
    history: Vec<Message>,
) -> Result<TurnOutcome, ChatError> {
    let request = ctx
        .http
        .post(ctx.config.chat_endpoint())
        .json(&body)
        .send();
    let response = tokio::select! {
        response = request => response.map_err(ChatError::from)?,
        _ = cancelled(&mut ctx.cancel) => return Ok(TurnOutcome::Aborted),
    };

    if !response.status().is_success() {
        let status = response.status();
        let message = response
            .json::<ChatErrorBody>()
            .await
            .ok()
            .and_then(|e| e.error)
            .and_then(|e| e.message)
            .unwrap_or_else(|| format!("Server error: HTTP {}", status));
        return Err(ChatError::server(message));
    }

    let stream = Box::pin(response.bytes_stream());
    let end = match consume_stream(stream, &ctx.updates, &mut ctx.cancel).await {
        Ok(end) => end,
        Err(err) if err.is_cancelled() => return Ok(TurnOutcome::Aborted),
        Err(err) => return Err(err),
    };

    match end {
        StreamEnd::Finished { text } => {
            if text.is_empty() {
                Ok(TurnOutcome::CompletedEmpty)
            } else {
                Ok(TurnOutcome::Completed(Message::model(vec![Part::text(
                    text,
                )])))
            }
        }
        StreamEnd::GenerateImage {
            lead_in,
            payload,
            follow_up_text,
        } => {
            if let Some(text) = lead_in.filter(|t| !t.is_empty()) {
                let _ = ctx.updates.send(TurnUpdate::Delta { text });
            }
            annotate_prompt_context(ctx, &payload);

            let generation = ImageGeneration {
                http: &ctx.http,
                config: &ctx.config,
                uploads: &ctx.uploads,
                updates: &ctx.updates,
            };
            match generation
                .run(
                    &payload.english_prompt,
                    payload.aspect_ratio.as_deref(),
                    follow_up_text,
                    &mut ctx.cancel,
                )
                .await
            {
                Ok(message) => Ok(TurnOutcome::Completed(message)),
                Err(err) if err.is_cancelled() => Ok(TurnOutcome::Aborted),
                Err(err) => Err(err),
            }
        }
        StreamEnd::Clarify { question, options } => {
            let mut message = Message::model(Vec::new());
            message.clarification = Some(options);
            message.question = Some(question);
            Ok(TurnOutcome::AwaitingClarification(message))
        }
        StreamEnd::Edit { prompt } => {
            // Scan everything before the placeholder, newest first. This
            // runs before any edit network traffic.
            let scan = &history[..ctx.placeholder_index.min(history.len())];
            let Some(source_url) = latest_editable_url(scan).map(str::to_string) else {
                return Err(ChatError::content(
                    "Edit intent detected but no file to edit was found",
                ));
            };
            run_edit(ctx, &prompt, &source_url).await
        }
    }
}

/// Run only the edit workflow, used when a clarification action resolves
/// directly to an edit without a new chat stream.
pub(crate) async fn run_direct_edit(
    ctx: &mut TurnContext,
    prompt: &str,
    source_url: &str,
) -> Result<TurnOutcome, ChatError> {
    run_edit(ctx, prompt, source_url).await
}

async fn run_edit(
    ctx: &mut TurnContext,
    prompt: &str,
    source_url: &str,
) -> Result<TurnOutcome, ChatError> {
    let edit = ImageEdit {
        http: &ctx.http,
        config: &ctx.config,
        uploads: &ctx.uploads,
        updates: &ctx.updates,
    };
    match edit.run(prompt, source_url, &mut ctx.cancel).await {
        Ok(message) => Ok(TurnOutcome::Completed(message)),
        Err(err) if err.is_cancelled() => Ok(TurnOutcome::Aborted),
        Err(err) => Err(err),
    }
}

/// Write the resolved generation context onto the user message that
/// triggered it, so later turns can reconstruct what was produced.
fn annotate_prompt_context(ctx: &TurnContext, payload: &ImageGenPayload) {
    let Some(user_index) = ctx.placeholder_index.checked_sub(1) else {
        return;
    };
    if let Err(err) = ctx.store.annotate_user_prompt(
        &ctx.conversation_id,
        user_index,
        &payload.english_prompt,
        payload.aspect_ratio.as_deref(),
    ) {
        log::debug!("Prompt annotation skipped: {}", err);
    }
}

/// Consume the primary stream until a terminal record or end of stream.
/// Records are processed strictly in arrival order; the text buffer is
/// append-only. Cancellation surfaces as a `Cancelled` error for the caller
/// to fold into `Aborted`.
async fn consume_stream<S, B, E>(
    mut stream: S,
    updates: &mpsc::UnboundedSender<TurnUpdate>,
    cancel: &mut CancelReceiver,
) -> Result<StreamEnd, ChatError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut decoder = LineDecoder::new();
    let mut payloads: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancelled(cancel) => return Err(ChatError::cancelled("Turn stopped")),
        };

        match chunk {
            Some(Ok(chunk)) => {
                decoder.feed(chunk.as_ref(), &mut payloads);
            }
            Some(Err(err)) => {
                return Err(ChatError::network(format!("Stream read failed: {}", err)));
            }
            None => {
                if let Some(tail) = decoder.finish() {
                    payloads.push(tail);
                }
                if let Some(end) = dispatch_records(&mut payloads, &mut text, updates)? {
                    return Ok(end);
                }
                return Ok(StreamEnd::Finished { text });
            }
        }

        if let Some(end) = dispatch_records(&mut payloads, &mut text, updates)? {
            return Ok(end);
        }
    }
}

fn dispatch_records(
    payloads: &mut Vec<String>,
    text: &mut String,
    updates: &mpsc::UnboundedSender<TurnUpdate>,
) -> Result<Option<StreamEnd>, ChatError> {
    for payload in payloads.drain(..) {
        let Some(record) = StreamRecord::from_payload(&payload) else {
            continue;
        };
        match record {
            StreamRecord::Text(fragment) => {
                text.push_str(&fragment);
                let _ = updates.send(TurnUpdate::Delta { text: text.clone() });
            }
            StreamRecord::Error(message) => {
                return Err(ChatError::server(message));
            }
            StreamRecord::GenerateImage(payload) => {
                return Ok(Some(StreamEnd::GenerateImage {
                    lead_in: None,
                    payload,
                    follow_up_text: None,
                }));
            }
            StreamRecord::GenerateImageWithText {
                text: lead_in,
                payload,
                follow_up_text,
            } => {
                return Ok(Some(StreamEnd::GenerateImage {
                    lead_in: Some(lead_in),
                    payload,
                    follow_up_text,
                }));
            }
            StreamRecord::ClarifyAction { question, options } => {
                return Ok(Some(StreamEnd::Clarify { question, options }));
            }
            StreamRecord::EditImage { prompt } => {
                return Ok(Some(StreamEnd::Edit { prompt }));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cancel::cancel_channel;
    use std::convert::Infallible;

    fn chunk_stream(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<&'static [u8], Infallible>> + Unpin {
        futures_util::stream::iter(chunks.into_iter().map(|c| Ok(c.as_bytes())))
    }

    fn updates_channel() -> (
        mpsc::UnboundedSender<TurnUpdate>,
        mpsc::UnboundedReceiver<TurnUpdate>,
    ) {
        mpsc::unbounded_channel()
    }

    fn candidates(text: &str) -> String {
        format!(
            "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"text\":\"{}\"}}]}}}}]}}\n",
            text
        )
    }

    #[tokio::test]
    async fn test_text_accumulation_across_chunks() {
        let (tx, mut rx) = updates_channel();
        let (_cancel_tx, mut cancel) = cancel_channel();

        let first = candidates("Hello ");
        let second = candidates("world");
        // Split the second record across two chunks.
        let (head, tail) = second.split_at(10);
        let chunks: Vec<String> = vec![first, head.to_string(), tail.to_string()];
        let leaked: Vec<&'static str> = chunks
            .into_iter()
            .map(|c| {
                let leaked: &'static str = c.leak();
                leaked
            })
            .collect();

        let end = consume_stream(chunk_stream(leaked), &tx, &mut cancel)
            .await
            .unwrap();
        assert_eq!(
            end,
            StreamEnd::Finished {
                text: "Hello world".to_string()
            }
        );

        // Each fragment re-renders the full accumulated text, in order.
        let mut deltas = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if let TurnUpdate::Delta { text } = update {
                deltas.push(text);
            }
        }
        assert_eq!(deltas, vec!["Hello ".to_string(), "Hello world".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_stream_finishes_empty() {
        let (tx, _rx) = updates_channel();
        let (_cancel_tx, mut cancel) = cancel_channel();
        let end = consume_stream(chunk_stream(vec![]), &tx, &mut cancel)
            .await
            .unwrap();
        assert_eq!(
            end,
            StreamEnd::Finished {
                text: String::new()
            }
        );
    }

    #[tokio::test]
    async fn test_error_record_fails_turn() {
        let (tx, _rx) = updates_channel();
        let (_cancel_tx, mut cancel) = cancel_channel();
        let err = consume_stream(
            chunk_stream(vec![
                "data: {\"error\":{\"message\":\"model overloaded\"}}\n",
            ]),
            &tx,
            &mut cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChatError::Server { ref message } if message == "model overloaded"));
    }

    #[tokio::test]
    async fn test_clarify_stops_consumption() {
        let (tx, _rx) = updates_channel();
        let (_cancel_tx, mut cancel) = cancel_channel();
        let end = consume_stream(
            chunk_stream(vec![
                "data: {\"intent\":\"clarify_action\",\"question\":\"Which?\",\"options\":{}}\ndata: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ignored\"}]}}]}\n",
            ]),
            &tx,
            &mut cancel,
        )
        .await
        .unwrap();
        match end {
            StreamEnd::Clarify { question, options } => {
                assert_eq!(question, "Which?");
                assert!(options.is_empty());
            }
            other => panic!("unexpected end: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_with_text_carries_lead_in_and_follow_up() {
        let (tx, _rx) = updates_channel();
        let (_cancel_tx, mut cancel) = cancel_channel();
        let end = consume_stream(
            chunk_stream(vec![
                "data: {\"intent\":\"generate_image_with_text\",\"text\":\"Here:\",\"image_generation_payload\":{\"english_prompt\":\"a cat\",\"aspect_ratio\":\"1:1\"},\"follow_up_text\":\"Enjoy\"}\n",
            ]),
            &tx,
            &mut cancel,
        )
        .await
        .unwrap();
        match end {
            StreamEnd::GenerateImage {
                lead_in,
                payload,
                follow_up_text,
            } => {
                assert_eq!(lead_in.as_deref(), Some("Here:"));
                assert_eq!(payload.english_prompt, "a cat");
                assert_eq!(follow_up_text.as_deref(), Some("Enjoy"));
            }
            other => panic!("unexpected end: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let (tx, _rx) = updates_channel();
        let (_cancel_tx, mut cancel) = cancel_channel();
        let mut chunks = vec!["data: {broken\n"];
        let good: &'static str = candidates("ok").leak();
        chunks.push(good);
        let end = consume_stream(chunk_stream(chunks), &tx, &mut cancel)
            .await
            .unwrap();
        assert_eq!(
            end,
            StreamEnd::Finished {
                text: "ok".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_read_surfaces_cancelled_once() {
        let (tx, _rx) = updates_channel();
        let (cancel_tx, mut cancel) = cancel_channel();
        cancel_tx.send(true).unwrap();

        // A pending stream: without cancellation this would hang forever.
        let stream = futures_util::stream::pending::<Result<&'static [u8], Infallible>>();
        let err = consume_stream(stream, &tx, &mut cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_mid_stream() {
        let (tx, mut rx) = updates_channel();
        let (cancel_tx, mut cancel) = cancel_channel();

        let first = candidates("partial");
        let first: &'static str = first.leak();
        // First chunk flows, then the stream stays pending while the user
        // cancels.
        let stream = futures_util::stream::iter(vec![Ok(first.as_bytes())])
            .chain(futures_util::stream::pending::<Result<&'static [u8], Infallible>>());
        tokio::pin!(stream);

        let consume = consume_stream(stream, &tx, &mut cancel);
        tokio::pin!(consume);

        // Poll once so the first record is processed, then cancel.
        tokio::select! {
            biased;
            _ = &mut consume => panic!("stream should still be pending"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
        }
        cancel_tx.send(true).unwrap();
        let err = consume.await.unwrap_err();
        assert!(err.is_cancelled());

        let mut deltas = 0;
        while let Ok(update) = rx.try_recv() {
            if matches!(update, TurnUpdate::Delta { .. }) {
                deltas += 1;
            }
        }
        assert_eq!(deltas, 1, "records before the cancel were processed");
    }
}
