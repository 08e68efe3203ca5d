//! Local chat state: conversation/message model and the capped JSON-backed
//! session store.

mod error;
mod store;
mod types;

pub use error::SessionError;
pub use store::{SessionStore, MAX_SESSIONS};
pub use types::{
    latest_editable_url, sanitize_history, ClarificationOption, ClarificationOptions,
    Conversation, InlineData, Message, Part, Role,
};
