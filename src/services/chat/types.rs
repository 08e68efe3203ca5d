use serde::{Deserialize, Serialize};

use crate::session::{ClarificationOptions, Message};

/// Body of the primary `POST /chat` request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequestBody {
    pub history: Vec<Message>,
    pub model: String,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<serde_json::Value>,
}

/// Prompt + aspect ratio resolved by the backend for an image generation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageGenPayload {
    pub english_prompt: String,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

/// One decoded record from the chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    /// Incremental text fragment.
    Text(String),
    GenerateImage(ImageGenPayload),
    GenerateImageWithText {
        text: String,
        payload: ImageGenPayload,
        follow_up_text: Option<String>,
    },
    ClarifyAction {
        question: String,
        options: ClarificationOptions,
    },
    EditImage {
        prompt: String,
    },
    /// Server-reported error; terminal for the turn.
    Error(String),
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    english_prompt: Option<String>,
    #[serde(default)]
    aspect_ratio: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    image_generation_payload: Option<ImageGenPayloadRaw>,
    #[serde(default)]
    follow_up_text: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    options: Option<ClarificationOptions>,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageGenPayloadRaw {
    english_prompt: Option<String>,
    #[serde(default)]
    aspect_ratio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

fn error_message(value: serde_json::Value) -> String {
    value
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

impl StreamRecord {
    /// Interpret one record payload. Records with an unknown intent, or ones
    /// missing the fields their intent requires, are skipped with a warning
    /// like any other malformed record.
    pub fn from_payload(payload: &str) -> Option<Self> {
        let raw: RawRecord = super::decoder::parse_record(payload)?;

        if let Some(intent) = raw.intent.as_deref() {
            return match intent {
                "generate_image" => match raw.english_prompt {
                    Some(english_prompt) => Some(Self::GenerateImage(ImageGenPayload {
                        english_prompt,
                        aspect_ratio: raw.aspect_ratio,
                    })),
                    None => {
                        log::warn!("generate_image record missing english_prompt, skipping");
                        None
                    }
                },
                "generate_image_with_text" => {
                    let payload = raw.image_generation_payload.and_then(|p| {
                        Some(ImageGenPayload {
                            english_prompt: p.english_prompt?,
                            aspect_ratio: p.aspect_ratio,
                        })
                    });
                    match payload {
                        Some(payload) => Some(Self::GenerateImageWithText {
                            text: raw.text.unwrap_or_default(),
                            payload,
                            follow_up_text: raw.follow_up_text,
                        }),
                        None => {
                            log::warn!(
                                "generate_image_with_text record missing generation payload, skipping"
                            );
                            None
                        }
                    }
                }
                "clarify_action" => Some(Self::ClarifyAction {
                    question: raw.question.unwrap_or_default(),
                    options: raw.options.unwrap_or_default(),
                }),
                "edit_image" => match raw.prompt {
                    Some(prompt) => Some(Self::EditImage { prompt }),
                    None => {
                        log::warn!("edit_image record missing prompt, skipping");
                        None
                    }
                },
                other => {
                    log::warn!("Unrecognized stream intent '{}', skipping", other);
                    None
                }
            };
        }

        if let Some(error) = raw.error {
            return Some(Self::Error(error_message(error)));
        }

        if let Some(candidates) = raw.candidates {
            let fragment = candidates
                .into_iter()
                .next()
                .and_then(|c| c.content)
                .and_then(|c| c.parts.into_iter().next())
                .and_then(|p| p.text)?;
            return Some(Self::Text(fragment));
        }

        None
    }
}

/// Progress notifications emitted while a turn runs. Exactly one of
/// `Completed`, `Stopped`, or `Failed` closes the sequence.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TurnUpdate {
    /// Full accumulated text so far (not a fragment), ready to render.
    Delta { text: String },
    /// Human-readable status line for a delegated workflow step.
    Status { message: String },
    /// Generation progress from the push channel.
    Progress { index: u32, length: u32 },
    /// Terminal: the final message was committed at the placeholder index.
    Completed {
        index: usize,
        message: Box<Message>,
    },
    /// Terminal: the turn ended with nothing to persist.
    CompletedEmpty,
    /// Terminal: the user stopped the turn. Neutral, not an error.
    Stopped,
    /// Terminal: the turn failed; rendered at the placeholder position.
    Failed { error: super::error::ChatError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_record() {
        let record = StreamRecord::from_payload(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(record, StreamRecord::Text("Hel".to_string()));
    }

    #[test]
    fn test_generate_image_record() {
        let record = StreamRecord::from_payload(
            r#"{"intent":"generate_image","english_prompt":"a cat","aspect_ratio":"9:16"}"#,
        )
        .unwrap();
        match record {
            StreamRecord::GenerateImage(payload) => {
                assert_eq!(payload.english_prompt, "a cat");
                assert_eq!(payload.aspect_ratio.as_deref(), Some("9:16"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_generate_image_with_text_record() {
        let record = StreamRecord::from_payload(
            r#"{"intent":"generate_image_with_text","text":"Here you go:","image_generation_payload":{"english_prompt":"a dog","aspect_ratio":"1:1"},"follow_up_text":"Want another?"}"#,
        )
        .unwrap();
        match record {
            StreamRecord::GenerateImageWithText {
                text,
                payload,
                follow_up_text,
            } => {
                assert_eq!(text, "Here you go:");
                assert_eq!(payload.english_prompt, "a dog");
                assert_eq!(follow_up_text.as_deref(), Some("Want another?"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_clarify_action_record() {
        let record = StreamRecord::from_payload(
            r#"{"intent":"clarify_action","question":"Edit or regenerate?","options":{"edit":{"label":"Edit","actionPayload":{"intent":"edit_image","prompt":"make it blue"}},"regenerate":{"label":"Regenerate","actionPayload":{"intent":"regenerate_with_enhancement"}}}}"#,
        )
        .unwrap();
        match record {
            StreamRecord::ClarifyAction { question, options } => {
                assert_eq!(question, "Edit or regenerate?");
                assert_eq!(options.len(), 2);
                assert_eq!(options["edit"].label, "Edit");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_error_record_shapes() {
        assert_eq!(
            StreamRecord::from_payload(r#"{"error":{"message":"quota exceeded"}}"#).unwrap(),
            StreamRecord::Error("quota exceeded".to_string())
        );
        assert_eq!(
            StreamRecord::from_payload(r#"{"error":"boom"}"#).unwrap(),
            StreamRecord::Error("\"boom\"".to_string())
        );
    }

    #[test]
    fn test_unknown_intent_and_empty_records_skipped() {
        assert!(StreamRecord::from_payload(r#"{"intent":"dance"}"#).is_none());
        assert!(StreamRecord::from_payload(r#"{"intent":"generate_image"}"#).is_none());
        assert!(StreamRecord::from_payload(r#"{"unrelated":true}"#).is_none());
    }
}
