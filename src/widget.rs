//! UI-facing state of the embeddable chat widget.
//!
//! The host page controls visibility through a [`WidgetHandle`] and renders
//! answers from the [`StreamChunk`] callback passed to [`ChatWidget::submit`].

use crate::llm::{ChatError, ChatSession, ContextDocument, StreamChunk, StreamingChatClient};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const RETRY_PROMPT: &str = "The assistant is not available right now. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetCommand {
    Open,
    Close,
    Toggle,
}

/// Visibility controls exposed to the host page.
pub trait WidgetControl {
    fn open(&self);
    fn close(&self);
    fn toggle(&self);
}

#[derive(Debug, Clone)]
pub struct WidgetHandle {
    tx: mpsc::UnboundedSender<WidgetCommand>,
}

impl WidgetHandle {
    fn send(&self, command: WidgetCommand) {
        if self.tx.send(command).is_err() {
            debug!(?command, "Widget dropped, ignoring command");
        }
    }
}

impl WidgetControl for WidgetHandle {
    fn open(&self) {
        self.send(WidgetCommand::Open);
    }

    fn close(&self) {
        self.send(WidgetCommand::Close);
    }

    fn toggle(&self) {
        self.send(WidgetCommand::Toggle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Assistant,
    Error,
}

/// One rendered row of the widget's conversation.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub kind: EntryKind,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    fn new(kind: EntryKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct WidgetState {
    open: bool,
    documents: Vec<ContextDocument>,
    transcript: Vec<TranscriptEntry>,
}

pub struct ChatWidget {
    client: StreamingChatClient,
    session: ChatSession,
    state: Mutex<WidgetState>,
    commands: Mutex<mpsc::UnboundedReceiver<WidgetCommand>>,
    busy: AtomicBool,
}

impl ChatWidget {
    pub fn new(client: StreamingChatClient) -> (Self, WidgetHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let widget = Self {
            client,
            session: ChatSession::new(),
            state: Mutex::new(WidgetState::default()),
            commands: Mutex::new(rx),
            busy: AtomicBool::new(false),
        };
        (widget, WidgetHandle { tx })
    }

    /// Begin a new session with a fixed set of context documents.
    pub fn start(&self, documents: Vec<ContextDocument>) -> Result<(), ChatError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        self.client.initialize(&self.session, &documents);
        let mut state = self.state.lock();
        state.transcript.clear();
        state.documents = documents;
        Ok(())
    }

    /// Apply every queued visibility command. Returns how many were applied.
    pub fn apply_pending_commands(&self) -> usize {
        let mut applied = 0;
        let mut commands = self.commands.lock();
        while let Ok(command) = commands.try_recv() {
            self.apply(command);
            applied += 1;
        }
        applied
    }

    pub fn apply(&self, command: WidgetCommand) {
        let mut state = self.state.lock();
        state.open = match command {
            WidgetCommand::Open => true,
            WidgetCommand::Close => false,
            WidgetCommand::Toggle => !state.open,
        };
        debug!(?command, open = state.open, "Widget visibility changed");
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.state.lock().transcript.clone()
    }

    /// Ask a question and stream the answer into the transcript.
    ///
    /// Only one question can be outstanding; a second call gets
    /// [`ChatError::Busy`]. Failures are rendered as an error entry in place
    /// of the answer and returned, leaving the session usable.
    pub async fn submit(
        &self,
        question: &str,
        on_chunk: impl Fn(StreamChunk) + Send,
    ) -> Result<String, ChatError> {
        let _busy = BusyGuard::acquire(&self.busy)?;

        let (placeholder, documents) = {
            let mut state = self.state.lock();
            state
                .transcript
                .push(TranscriptEntry::new(EntryKind::User, question));
            state
                .transcript
                .push(TranscriptEntry::new(EntryKind::Assistant, ""));
            (state.transcript.len() - 1, state.documents.clone())
        };

        let result = self
            .stream_answer(question, &documents, placeholder, &on_chunk)
            .await;

        if let Err(e) = &result {
            warn!(error = %e, "Question failed");
            if let Some(entry) = self.state.lock().transcript.get_mut(placeholder) {
                entry.kind = EntryKind::Error;
                entry.text = error_text(e);
            }
        }

        on_chunk(StreamChunk {
            delta: String::new(),
            done: true,
        });
        result
    }

    async fn stream_answer(
        &self,
        question: &str,
        documents: &[ContextDocument],
        placeholder: usize,
        on_chunk: &(impl Fn(StreamChunk) + Send),
    ) -> Result<String, ChatError> {
        let mut stream = self.client.ask(&self.session, question, documents)?;
        let mut answer = String::new();

        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            answer.push_str(&fragment);
            if let Some(entry) = self.state.lock().transcript.get_mut(placeholder) {
                entry.text.push_str(&fragment);
            }
            on_chunk(StreamChunk {
                delta: fragment,
                done: false,
            });
        }

        info!(chars = answer.chars().count(), "Answer rendered");
        Ok(answer)
    }
}

/// What the user sees in place of a failed answer
fn error_text(error: &ChatError) -> String {
    match error {
        ChatError::Configuration(_) => RETRY_PROMPT.to_string(),
        ChatError::Transport { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ChatError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChatError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
