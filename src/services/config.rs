//! Shared endpoint configuration for the chat and media services.
//!
//! Every endpoint can be overridden through `.env`/environment; defaults
//! point at the production services.

use serde::{Deserialize, Serialize};

/// Endpoints for the chat backend and the satellite media services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Origin of the streaming chat backend (`{chat_base}/chat`).
    pub chat_base: String,
    /// Job-queue image generation space (`{base}/queue/join`, `{base}/queue/data`).
    pub image_gen_base: String,
    /// Synchronous image edit endpoint.
    pub edit_url: String,
    /// Permanent-storage uploader (multipart file mode and JSON url mode).
    pub upload_url: String,
    /// Secondary hosting server for produced files.
    pub rehost_url: String,
    /// Text-to-file conversion service.
    pub convert_url: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            chat_base: "http://127.0.0.1:5000".to_string(),
            image_gen_base: "https://black-forest-labs-flux-1-schnell.hf.space".to_string(),
            edit_url: "https://alfa-editor-worker.onrender.com/api/edit".to_string(),
            upload_url: "https://asrasahar-ok-uploader-bot.hf.space/upload".to_string(),
            rehost_url: "https://www.aisada.ir/hamed/upload.php".to_string(),
            convert_url: "https://texttopdf-5irq.onrender.com/".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn chat_endpoint(&self) -> String {
        format!("{}/chat", self.chat_base)
    }

    pub fn queue_join_url(&self) -> String {
        format!("{}/queue/join", self.image_gen_base)
    }

    pub fn queue_data_url(&self, session_hash: &str) -> String {
        format!(
            "{}/queue/data?session_hash={}",
            self.image_gen_base, session_hash
        )
    }
}

fn normalize_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn env_url(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Load service configuration from `.env`/environment.
///
/// Reads `CHAT_BASE_URL`, `IMAGE_GEN_BASE_URL`, `IMAGE_EDIT_URL`,
/// `UPLOAD_URL`, `REHOST_URL`, `CONVERT_URL`.
pub fn load_service_config() -> ServiceConfig {
    let _ = dotenvy::dotenv();
    let defaults = ServiceConfig::default();

    ServiceConfig {
        chat_base: normalize_base(&env_url("CHAT_BASE_URL", &defaults.chat_base)),
        image_gen_base: normalize_base(&env_url("IMAGE_GEN_BASE_URL", &defaults.image_gen_base)),
        edit_url: env_url("IMAGE_EDIT_URL", &defaults.edit_url),
        upload_url: env_url("UPLOAD_URL", &defaults.upload_url),
        rehost_url: env_url("REHOST_URL", &defaults.rehost_url),
        convert_url: env_url("CONVERT_URL", &defaults.convert_url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base() {
        assert_eq!(
            normalize_base("https://example.com/"),
            "https://example.com"
        );
        assert_eq!(
            normalize_base("  https://example.com  "),
            "https://example.com"
        );
        assert_eq!(normalize_base("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_endpoint_composition() {
        let config = ServiceConfig {
            chat_base: "https://chat.example".to_string(),
            image_gen_base: "https://gen.example".to_string(),
            ..ServiceConfig::default()
        };
        assert_eq!(config.chat_endpoint(), "https://chat.example/chat");
        assert_eq!(config.queue_join_url(), "https://gen.example/queue/join");
        assert_eq!(
            config.queue_data_url("abc123"),
            "https://gen.example/queue/data?session_hash=abc123"
        );
    }
}
