//! Endpoint configuration for the chat client

use crate::llm::ChatError;
use serde::{Deserialize, Serialize};

pub const URL_ENV: &str = "FAQ_CHAT_URL";
pub const KEY_ENV: &str = "FAQ_CHAT_KEY";
pub const FUNCTION_ENV: &str = "FAQ_CHAT_FUNCTION";

pub const DEFAULT_FUNCTION: &str = "faq-chat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Backend base URL, e.g. `https://project.supabase.co`
    pub base_url: Option<String>,
    /// Access credential, sent both as `apikey` and as bearer token
    pub api_key: Option<String>,
    /// Name of the edge function that answers questions
    pub function: String,
}

/// A fully resolved endpoint, ready for requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub url: String,
    pub api_key: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            function: DEFAULT_FUNCTION.to_string(),
        }
    }
}

impl ChatConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Read configuration from the process environment, honoring a `.env` file.
    ///
    /// Missing values are not an error here; they surface on the first question.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            base_url: lookup(URL_ENV),
            api_key: lookup(KEY_ENV),
            function: lookup(FUNCTION_ENV)
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FUNCTION.to_string()),
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint, ChatError> {
        let base_url = non_empty(&self.base_url)
            .ok_or_else(|| ChatError::Configuration(format!("{} is not set", URL_ENV)))?;
        let api_key = non_empty(&self.api_key)
            .ok_or_else(|| ChatError::Configuration(format!("{} is not set", KEY_ENV)))?;

        Ok(Endpoint {
            url: format!(
                "{}/functions/v1/{}",
                base_url.trim_end_matches('/'),
                self.function.trim_matches('/')
            ),
            api_key: api_key.to_string(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_endpoint_url() {
        let config = ChatConfig::new("https://example.supabase.co/", "anon");
        let endpoint = config.endpoint().unwrap();
        assert_eq!(
            endpoint.url,
            "https://example.supabase.co/functions/v1/faq-chat"
        );
        assert_eq!(endpoint.api_key, "anon");
    }

    #[test]
    fn test_missing_values_are_configuration_errors() {
        let config = ChatConfig::default();
        assert!(matches!(
            config.endpoint(),
            Err(ChatError::Configuration(_))
        ));

        let config = ChatConfig {
            api_key: Some("   ".into()),
            ..ChatConfig::new("https://example.supabase.co", "")
        };
        let err = config.endpoint().unwrap_err();
        assert!(err.to_string().contains(KEY_ENV));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (URL_ENV, "http://localhost:54321"),
            (KEY_ENV, "secret"),
            (FUNCTION_ENV, "ask"),
        ]
        .into_iter()
        .collect();
        let config = ChatConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(
            config.endpoint().unwrap().url,
            "http://localhost:54321/functions/v1/ask"
        );

        let config = ChatConfig::from_lookup(|_| None);
        assert_eq!(config.function, DEFAULT_FUNCTION);
        assert!(config.base_url.is_none());
    }
}
