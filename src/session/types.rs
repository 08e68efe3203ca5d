use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Message author. A conversation conceptually alternates user/model turns;
/// the model slot may temporarily hold a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// Inline binary payload attached to a file part, sent alongside the upload
/// URL so the backend can analyze the content directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64-encoded content.
    pub data: String,
}

/// One semantic payload of a message. Field names follow the wire protocol:
/// file parts are camelCase, image/edited-image parts are snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    File {
        #[serde(rename = "fileUrl")]
        file_url: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        name: String,
        #[serde(
            rename = "inlineData",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        inline_data: Option<InlineData>,
    },
    EditedImages {
        edited_images: Vec<String>,
    },
    Image {
        image_url: String,
    },
    /// Bare inline payload, attached to outgoing requests only so the
    /// backend can analyze the current attachment directly.
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image {
            image_url: image_url.into(),
        }
    }

    pub fn edited_images(urls: Vec<String>) -> Self {
        Self::EditedImages {
            edited_images: urls,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// True when the part carries something worth sending or rendering.
    fn has_content(&self) -> bool {
        match self {
            Self::Text { text } => !text.is_empty(),
            Self::File { file_url, .. } => !file_url.is_empty(),
            Self::Image { image_url } => !image_url.is_empty(),
            Self::EditedImages { edited_images } => !edited_images.is_empty(),
            Self::Inline { .. } => false,
        }
    }
}

/// One follow-up choice offered by a `clarify_action` response. The payload
/// is forwarded verbatim as the `action` of the resuming turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub label: String,
    #[serde(rename = "actionPayload", default)]
    pub action_payload: serde_json::Value,
}

/// Map from action key (`"edit"` | `"regenerate"`) to its option.
pub type ClarificationOptions = BTreeMap<String, ClarificationOption>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// Set on the placeholder inserted at turn start; cleared (by
    /// replacement) once a terminal result is known.
    #[serde(
        rename = "isTemporary",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub is_temporary: bool,
    /// Generation context written back onto the triggering user message so
    /// later turns can reconstruct what was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub english_prompt_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio_used: Option<String>,
}

impl Message {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
            clarification: None,
            question: None,
            is_temporary: false,
            english_prompt_used: None,
            aspect_ratio_used: None,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
            clarification: None,
            question: None,
            is_temporary: false,
            english_prompt_used: None,
            aspect_ratio_used: None,
        }
    }

    /// Empty model-role message inserted at turn start.
    pub fn placeholder() -> Self {
        Self {
            is_temporary: true,
            ..Self::model(Vec::new())
        }
    }

    pub fn is_final(&self) -> bool {
        !self.is_temporary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Newest-first scan for the most recent editable content. Image parts and
/// edited-image parts take precedence over plain file parts within the same
/// message; this ordering decides what an `edit_image` intent operates on.
pub fn latest_editable_url(messages: &[Message]) -> Option<&str> {
    for message in messages.iter().rev() {
        let image = message.parts.iter().find_map(|part| match part {
            Part::Image { image_url } if !image_url.is_empty() => Some(image_url.as_str()),
            Part::EditedImages { edited_images } => edited_images.first().map(String::as_str),
            _ => None,
        });
        if let Some(url) = image {
            return Some(url);
        }
        let file = message.parts.iter().find_map(|part| match part {
            Part::File { file_url, .. } if !file_url.is_empty() => Some(file_url.as_str()),
            _ => None,
        });
        if let Some(url) = file {
            return Some(url);
        }
    }
    None
}

fn analysis_instruction(mime_type: &str, name: &str) -> String {
    let subject = if mime_type.starts_with("video/") {
        "this video".to_string()
    } else if mime_type.starts_with("audio/") {
        "this audio file".to_string()
    } else {
        format!("this document ({})", name)
    };
    format!(
        "\n(Instruction: analyze {} and describe its content.)",
        subject
    )
}

fn append_to_text_part(parts: &mut Vec<Part>, note: &str) {
    if let Some(Part::Text { text }) = parts.iter_mut().find(|p| matches!(p, Part::Text { .. })) {
        text.push_str(note);
    } else {
        parts.push(Part::text(note));
    }
}

/// Prepare history for the chat endpoint: drop temporary messages, strip
/// inline binary payloads, attach analysis instructions for non-image file
/// attachments, and remind the model of generation context recorded on user
/// messages. Messages left without content are dropped entirely.
pub fn sanitize_history(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        if message.is_temporary {
            continue;
        }

        let mut parts: Vec<Part> = Vec::with_capacity(message.parts.len());
        let mut instructions: Vec<String> = Vec::new();

        for part in &message.parts {
            let mut part = part.clone();
            if let Part::File {
                mime_type,
                name,
                inline_data,
                ..
            } = &mut part
            {
                *inline_data = None;
                if !mime_type.starts_with("image/") {
                    instructions.push(analysis_instruction(mime_type, name));
                }
            }
            if part.has_content() {
                parts.push(part);
            }
        }

        for instruction in &instructions {
            append_to_text_part(&mut parts, instruction);
        }

        if message.role == Role::User {
            if let Some(prompt) = message.english_prompt_used.as_deref() {
                let ratio_note = message
                    .aspect_ratio_used
                    .as_deref()
                    .map(|r| format!(", aspect ratio: \"{}\"", r))
                    .unwrap_or_default();
                let note = format!(
                    "\n[Reminder: this message produced an image. English prompt used: \"{}\"{}]",
                    prompt, ratio_note
                );
                append_to_text_part(&mut parts, &note);
            }
        }

        if parts.is_empty() {
            continue;
        }

        let mut sanitized = message.clone();
        sanitized.parts = parts;
        sanitized.clarification = None;
        sanitized.question = None;
        out.push(sanitized);
    }

    out
}
