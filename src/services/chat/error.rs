use serde::{Deserialize, Serialize};

/// Error taxonomy shared by the chat turn pipeline and the satellite
/// generation/edit/upload services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatError {
    /// Transport-level failure: no usable response at all.
    Network { message: String },
    /// The remote service answered with a non-2xx status or an explicit
    /// error payload.
    Server { message: String },
    /// Valid transport but a response shape we cannot interpret.
    MalformedResponse { message: String },
    /// User-initiated abort. Rendered as a neutral stoppage notice, never as
    /// an error banner.
    Cancelled { message: String },
    /// The request cannot proceed because the conversation lacks the
    /// required content (e.g. nothing editable in the history).
    Content { message: String },
}

impl ChatError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn content(message: impl Into<String>) -> Self {
        Self::Content {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Network { message }
            | Self::Server { message }
            | Self::MalformedResponse { message }
            | Self::Cancelled { message }
            | Self::Content { message } => message,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Re-wrap with a context prefix, keeping the error kind. Used to report
    /// "produced but persistence failed" distinctly from outright failure.
    pub fn with_context(self, context: &str) -> Self {
        let message = format!("{}: {}", context, self.message());
        match self {
            Self::Network { .. } => Self::Network { message },
            Self::Server { .. } => Self::Server { message },
            Self::MalformedResponse { .. } => Self::MalformedResponse { message },
            Self::Cancelled { .. } => Self::Cancelled { message },
            Self::Content { .. } => Self::Content { message },
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::malformed(err.to_string());
        }
        Self::network(err.to_string())
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network { message } => write!(f, "Network: {}", message),
            Self::Server { message } => write!(f, "Server: {}", message),
            Self::MalformedResponse { message } => write!(f, "MalformedResponse: {}", message),
            Self::Cancelled { message } => write!(f, "Cancelled: {}", message),
            Self::Content { message } => write!(f, "Content: {}", message),
        }
    }
}

impl std::error::Error for ChatError {}
