//! Core of the FAQ chat widget and the membership data store.
//!
//! [`llm::StreamingChatClient`] streams answers from the hosted endpoint,
//! [`widget::ChatWidget`] turns them into widget state, and [`db`] holds the
//! data store the membership pages are built on.

pub mod config;
pub mod db;
pub mod doc_processor;
pub mod llm;
pub mod telemetry;
pub mod widget;

pub use config::ChatConfig;
pub use llm::{ChatError, ChatSession, ChatTurn, ContextDocument, Role, StreamingChatClient};
pub use widget::{ChatWidget, WidgetControl, WidgetHandle};
