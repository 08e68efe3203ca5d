//! Client library for a streaming chat backend with an embedded
//! intent-dispatch protocol.
//!
//! A turn starts from a user submission, streams incremental text, and may
//! delegate to an image-generation job queue, a synchronous image editor, or
//! a clarification prompt before it settles into exactly one terminal state.
//! Produced media is re-hosted for permanent URLs, and conversations persist
//! in a capped local session store.

pub mod services;
pub mod session;

pub use services::chat::{ChatController, ChatError, TurnHandle, TurnUpdate};
pub use services::config::{load_service_config, ServiceConfig};
pub use services::upload::{ProgressFn, UploadGateway, UploadedFile};
pub use session::{Conversation, Message, Part, SessionStore};
