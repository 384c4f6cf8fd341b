pub mod client;
pub mod frames;
pub mod session;

pub use client::{ChatStream, StreamingChatClient};
pub use session::ChatSession;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One exchange in the conversation history.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// Static knowledge sent along with every question.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContextDocument {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("API error: {status} - {message}")]
    Transport { status: u16, message: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("A question is already being answered")]
    Busy,
}

impl Serialize for ChatError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
