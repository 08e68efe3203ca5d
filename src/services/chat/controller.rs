//! Turn lifecycle: append the user message and a placeholder, spawn the
//! orchestrator, commit the terminal result, and keep the single-turn
//! invariant per conversation.
//!
//! Policy for concurrent submissions: cancel-then-start. Starting a turn
//! while one is active for the same conversation cancels the prior turn and
//! waits for it to unwind before the new one is registered.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::services::cancel::{cancel_channel, CancelReceiver};
use crate::services::config::{load_service_config, ServiceConfig};
use crate::services::convert;
use crate::services::upload::UploadGateway;
use crate::session::{
    latest_editable_url, sanitize_history, Message, Part, Role, SessionError, SessionStore,
};

use super::error::ChatError;
use super::manager::{cancel_and_join, TurnManager};
use super::orchestrator::{run_direct_edit, run_turn, TurnContext, TurnOutcome};
use super::types::{ChatRequestBody, TurnUpdate};

const TITLE_MAX_CHARS: usize = 30;

/// Receiving end of one turn: progress updates followed by exactly one
/// terminal update (`Completed`, `CompletedEmpty`, `Stopped`, or `Failed`).
#[derive(Debug)]
pub struct TurnHandle {
    pub turn_id: String,
    pub updates: mpsc::UnboundedReceiver<TurnUpdate>,
}

enum TurnWork {
    Stream {
        body: ChatRequestBody,
        history: Vec<Message>,
    },
    DirectEdit {
        prompt: String,
        source_url: String,
    },
}

#[derive(Clone)]
pub struct ChatController {
    http: reqwest::Client,
    config: ServiceConfig,
    store: SessionStore,
    uploads: UploadGateway,
    turns: TurnManager,
}

impl ChatController {
    pub fn new(store: SessionStore) -> Self {
        Self::with_config(store, load_service_config())
    }

    pub fn with_config(store: SessionStore, config: ServiceConfig) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let uploads = UploadGateway::new(http.clone(), &config);

        Self {
            http,
            config,
            store,
            uploads,
            turns: TurnManager::default(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn uploads(&self) -> &UploadGateway {
        &self.uploads
    }

    pub fn is_generating(&self, conversation_id: &str) -> bool {
        self.turns.is_active(conversation_id)
    }

    /// Submit a user message and start its model turn.
    pub async fn submit(
        &self,
        conversation_id: &str,
        user_message: Message,
    ) -> Result<TurnHandle, ChatError> {
        if user_message.role != Role::User {
            return Err(ChatError::content("Submission must be a user message"));
        }
        if user_message.parts.is_empty() {
            return Err(ChatError::content("Submission is empty"));
        }

        self.cancel(conversation_id).await;

        let conversation = self
            .store
            .conversation(conversation_id)
            .ok_or_else(|| ChatError::content("Conversation not found"))?;

        if conversation.messages.is_empty() {
            if let Some(text) = user_message.parts.iter().find_map(Part::as_text) {
                let _ = self
                    .store
                    .rename_conversation(conversation_id, &derive_title(text));
            }
        }

        self.store
            .append_message(conversation_id, user_message)
            .map_err(store_error)?;
        let placeholder_index = self
            .store
            .append_message(conversation_id, Message::placeholder())
            .map_err(store_error)?;

        self.start_stream_turn(conversation_id, placeholder_index, None)
    }

    /// Resume after a clarification: run the chosen action as a new turn in
    /// place of the clarification message.
    pub async fn resume_clarification(
        &self,
        conversation_id: &str,
        message_index: usize,
        action_payload: serde_json::Value,
    ) -> Result<TurnHandle, ChatError> {
        self.cancel(conversation_id).await;

        let history = self.store.messages(conversation_id).map_err(store_error)?;
        if message_index >= history.len() {
            return Err(ChatError::content("Clarification message not found"));
        }

        self.store
            .commit_message(conversation_id, message_index, Message::placeholder())
            .map_err(store_error)?;

        let intent = action_payload
            .get("intent")
            .and_then(serde_json::Value::as_str);
        if intent == Some("edit_image") {
            let prompt = action_payload
                .get("prompt")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| ChatError::content("Edit action is missing its prompt"))?
                .to_string();
            let source_url = latest_editable_url(&history[..message_index])
                .map(str::to_string)
                .ok_or_else(|| ChatError::content("No image to edit was found"))?;
            return self.spawn_turn(
                conversation_id,
                message_index,
                TurnWork::DirectEdit { prompt, source_url },
            );
        }

        self.start_stream_turn(conversation_id, message_index, Some(action_payload))
    }

    /// Drop the last model response and run that turn again.
    pub async fn regenerate(&self, conversation_id: &str) -> Result<TurnHandle, ChatError> {
        self.cancel(conversation_id).await;

        let history = self.store.messages(conversation_id).map_err(store_error)?;
        if !matches!(history.last(), Some(m) if m.role == Role::Model) {
            return Err(ChatError::content("Nothing to regenerate"));
        }

        self.store
            .truncate_messages(conversation_id, history.len() - 1)
            .map_err(store_error)?;
        let placeholder_index = self
            .store
            .append_message(conversation_id, Message::placeholder())
            .map_err(store_error)?;

        self.start_stream_turn(conversation_id, placeholder_index, None)
    }

    /// Cancel the active turn (if any) and wait for it to unwind.
    pub async fn cancel(&self, conversation_id: &str) {
        if let Some(turn) = self.turns.take(conversation_id) {
            cancel_and_join(turn).await;
        }
    }

    /// Render chat content into a hosted file; see `services::convert`.
    pub async fn convert_and_host(
        &self,
        content: &str,
        format: &str,
        cancel: &mut CancelReceiver,
    ) -> Result<String, ChatError> {
        convert::convert_and_host(
            &self.http,
            &self.config,
            &self.uploads,
            content,
            format,
            cancel,
        )
        .await
    }

    fn start_stream_turn(
        &self,
        conversation_id: &str,
        placeholder_index: usize,
        action: Option<serde_json::Value>,
    ) -> Result<TurnHandle, ChatError> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .ok_or_else(|| ChatError::content("Conversation not found"))?;
        let history = conversation.messages;

        let api_history = build_api_history(&history, placeholder_index, action.is_some());
        let body = ChatRequestBody {
            history: api_history,
            model: conversation.model,
            chat_id: conversation_id.to_string(),
            action,
        };

        self.spawn_turn(
            conversation_id,
            placeholder_index,
            TurnWork::Stream { body, history },
        )
    }

    fn spawn_turn(
        &self,
        conversation_id: &str,
        placeholder_index: usize,
        work: TurnWork,
    ) -> Result<TurnHandle, ChatError> {
        let turn_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = cancel_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let mut ctx = TurnContext {
            http: self.http.clone(),
            config: self.config.clone(),
            uploads: self.uploads.clone(),
            store: self.store.clone(),
            conversation_id: conversation_id.to_string(),
            placeholder_index,
            updates: updates_tx,
            cancel: cancel_rx,
        };

        let turns = self.turns.clone();
        let task_conversation_id = conversation_id.to_string();
        let task_turn_id = turn_id.clone();

        self.turns
            .register_with(conversation_id, &turn_id, cancel_tx, move || {
                tokio::spawn(async move {
                    let result = match work {
                        TurnWork::Stream { body, history } => {
                            run_turn(&mut ctx, body, history).await
                        }
                        TurnWork::DirectEdit { prompt, source_url } => {
                            run_direct_edit(&mut ctx, &prompt, &source_url).await
                        }
                    };
                    finish_turn(&ctx, result);
                    turns.finish(&task_conversation_id, &task_turn_id);
                })
            });

        Ok(TurnHandle {
            turn_id,
            updates: updates_rx,
        })
    }
}

/// Commit the terminal state and emit the closing update. Aborted leaves the
/// placeholder untouched: no conversation writes happen after cancellation.
fn finish_turn(ctx: &TurnContext, result: Result<TurnOutcome, ChatError>) {
    match result {
        Ok(TurnOutcome::Completed(message)) | Ok(TurnOutcome::AwaitingClarification(message)) => {
            match ctx
                .store
                .commit_message(&ctx.conversation_id, ctx.placeholder_index, message.clone())
            {
                Ok(()) => {
                    let _ = ctx.updates.send(TurnUpdate::Completed {
                        index: ctx.placeholder_index,
                        message: Box::new(message),
                    });
                }
                Err(err) => {
                    log::warn!("Committing turn result failed: {}", err);
                    let _ = ctx.updates.send(TurnUpdate::Failed {
                        error: ChatError::content(err.message().to_string()),
                    });
                }
            }
        }
        Ok(TurnOutcome::CompletedEmpty) => {
            if let Err(err) = ctx
                .store
                .remove_message(&ctx.conversation_id, ctx.placeholder_index)
            {
                log::warn!("Removing empty placeholder failed: {}", err);
            }
            let _ = ctx.updates.send(TurnUpdate::CompletedEmpty);
        }
        Ok(TurnOutcome::Aborted) => {
            let _ = ctx.updates.send(TurnUpdate::Stopped);
        }
        Err(error) => {
            let _ = ctx.updates.send(TurnUpdate::Failed { error });
        }
    }
}

/// Build the outgoing history: sanitize everything before the placeholder
/// (action turns also drop the message the action replaces), then re-attach
/// the current attachment's inline payload for fresh turns.
fn build_api_history(
    history: &[Message],
    placeholder_index: usize,
    has_action: bool,
) -> Vec<Message> {
    let mut source: Vec<Message> = history[..placeholder_index.min(history.len())].to_vec();
    if has_action {
        source.pop();
    }
    let mut api_history = sanitize_history(&source);

    if !has_action {
        let inline = placeholder_index
            .checked_sub(1)
            .and_then(|i| history.get(i))
            .and_then(|message| {
                message.parts.iter().find_map(|part| match part {
                    Part::File {
                        inline_data: Some(data),
                        ..
                    } => Some(data.clone()),
                    _ => None,
                })
            });
        if let Some(inline_data) = inline {
            if let Some(last) = api_history.last_mut() {
                last.parts.insert(0, Part::Inline { inline_data });
            }
        }
    }

    api_history
}

fn derive_title(text: &str) -> String {
    let title: String = text.chars().take(TITLE_MAX_CHARS).collect();
    if text.chars().count() > TITLE_MAX_CHARS {
        format!("{}...", title)
    } else {
        title
    }
}

fn store_error(err: SessionError) -> ChatError {
    ChatError::content(err.message().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InlineData;

    fn attachment_message() -> Message {
        Message::user(vec![
            Part::File {
                file_url: "https://x/f.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                name: "f.pdf".to_string(),
                inline_data: Some(InlineData {
                    mime_type: "application/pdf".to_string(),
                    data: "QUJD".to_string(),
                }),
            },
            Part::text("summarize this"),
        ])
    }

    #[test]
    fn test_api_history_reattaches_inline_payload() {
        let history = vec![attachment_message(), Message::placeholder()];
        let api = build_api_history(&history, 1, false);

        assert_eq!(api.len(), 1);
        // The inline payload leads the outgoing parts; the stored file part
        // itself stays stripped.
        assert!(matches!(&api[0].parts[0], Part::Inline { .. }));
        assert!(api[0].parts.iter().all(|p| match p {
            Part::File { inline_data, .. } => inline_data.is_none(),
            _ => true,
        }));
    }

    #[test]
    fn test_api_history_for_action_drops_trigger_message() {
        let history = vec![
            Message::user(vec![Part::text("draw me something")]),
            Message::placeholder(),
        ];
        let api = build_api_history(&history, 1, true);
        assert!(api.is_empty(), "action turns drop the triggering message");
    }

    #[test]
    fn test_api_history_excludes_placeholder() {
        let history = vec![
            Message::user(vec![Part::text("hello")]),
            Message::placeholder(),
        ];
        let api = build_api_history(&history, 1, false);
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].role, Role::User);
    }

    #[test]
    fn test_derive_title_truncates() {
        assert_eq!(derive_title("short"), "short");
        let long = "a".repeat(40);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));
    }

    #[tokio::test]
    async fn test_cancel_without_active_turn_is_noop() {
        let controller = ChatController::with_config(
            SessionStore::ephemeral(),
            ServiceConfig::default(),
        );
        controller.cancel("missing").await;
        assert!(!controller.is_generating("missing"));
    }

    #[tokio::test]
    async fn test_submit_rejects_non_user_and_empty_messages() {
        let controller = ChatController::with_config(
            SessionStore::ephemeral(),
            ServiceConfig::default(),
        );
        let conversation = controller
            .store()
            .create_conversation(None, "gemini".into());

        let err = controller
            .submit(&conversation.id, Message::model(vec![Part::text("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Content { .. }));

        let err = controller
            .submit(&conversation.id, Message::user(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Content { .. }));
    }
}
