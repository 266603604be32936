use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::request::ConversationStyle;

pub const DEFAULT_WSS_LINK: &str = "wss://sydney.bing.com/sydney/ChatHub";

/// A cookie supplied by the credential source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieEntry {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host of conversation creation and image generation
    pub service_url: String,
    /// Host of history and deletion calls
    pub chat_service_url: String,
    /// Override of the chat hub socket endpoint
    pub wss_link: Option<String>,
    /// Proxy for HTTP calls
    pub proxy: Option<String>,
    /// Locale sent with every request, e.g. `en-us`
    pub locale: String,
    pub style: ConversationStyle,
    pub cookies: Vec<CookieEntry>,
    pub receive_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Silent receives tolerated before the turn fails
    pub max_empty_receives: u32,
    /// Age after which a token-authenticated conversation is refreshed
    pub token_freshness_secs: u64,
    pub draw_poll_interval_ms: u64,
    pub draw_max_polls: u32,
    pub draw_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: "https://www.bing.com".to_string(),
            chat_service_url: "https://sydney.bing.com".to_string(),
            wss_link: None,
            proxy: None,
            locale: "en-us".to_string(),
            style: ConversationStyle::default(),
            cookies: Vec::new(),
            receive_timeout_secs: 900,
            heartbeat_interval_secs: 6,
            max_empty_receives: 5,
            token_freshness_secs: 2500,
            draw_poll_interval_ms: 1000,
            draw_max_polls: 300,
            draw_timeout_secs: 60,
        }
    }
}

impl ClientConfig {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".chathub").join("config.toml")
    }

    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            ChatError::Config(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChatError::Config(format!("{}: {}", config_path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChatError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        std::fs::write(&config_path, content)
            .map_err(|e| ChatError::Config(format!("{}: {}", config_path.display(), e)))?;
        Ok(())
    }

    /// Check that every endpoint is a parseable URL with the right scheme.
    pub fn validate(&self) -> Result<()> {
        for (field, value, schemes) in [
            ("service_url", self.service_url.as_str(), &["http", "https"]),
            ("chat_service_url", self.chat_service_url.as_str(), &["http", "https"]),
            ("wss_link", self.wss_link(), &["ws", "wss"]),
        ] {
            let url = url::Url::parse(value)
                .map_err(|e| ChatError::Config(format!("{field} '{value}': {e}")))?;
            if !schemes.contains(&url.scheme()) {
                return Err(ChatError::Config(format!(
                    "{field} '{value}' must use one of {schemes:?}"
                )));
            }
        }
        if let Some(proxy) = &self.proxy {
            url::Url::parse(proxy)
                .map_err(|e| ChatError::Config(format!("proxy '{proxy}': {e}")))?;
        }
        if self.locale.len() < 2 {
            return Err(ChatError::Config(format!("locale '{}' is too short", self.locale)));
        }
        Ok(())
    }

    /// Socket endpoint in effect.
    pub fn wss_link(&self) -> &str {
        self.wss_link.as_deref().unwrap_or(DEFAULT_WSS_LINK)
    }

    /// Cookies rendered as a `Cookie` header value.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join(";"),
        )
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
