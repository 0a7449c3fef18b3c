use snafu::ensure;

use super::error::{InvalidDocumentSnafu, StorageResult};
use super::ids::{MessageId, SessionId, StreamSessionId};

/// Title shown until the first user message names the session.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn is_user(self) -> bool {
        matches!(self, Self::User)
    }
}

/// Milliseconds from the store clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Done,
    /// Assistant reply still receiving frames from the given request.
    Streaming(StreamSessionId),
    Error(String),
    Cancelled,
}

/// Metadata describing what an upload-bearing message refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Document {
        source_document: String,
        chunk_index: usize,
        total_chunks: usize,
    },
    Image {
        image_ref: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: Timestamp,
    pub status: MessageStatus,
    pub attachment: Option<Attachment>,
}

impl Message {
    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    /// True for the assistant message still owned by `stream`.
    pub fn is_open_for(&self, stream: StreamSessionId) -> bool {
        self.role == Role::Assistant && self.status == MessageStatus::Streaming(stream)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming(_))
    }
}

/// Message payload before the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub attachment: Option<Attachment>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            status: MessageStatus::Done,
            attachment: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn assistant_streaming(content: impl Into<String>, stream: StreamSessionId) -> Self {
        Self::new(Role::Assistant, content).with_status(MessageStatus::Streaming(stream))
    }

    pub fn assistant_error(content: impl Into<String>) -> Self {
        let content = content.into();
        let status = MessageStatus::Error(content.clone());
        Self::new(Role::Assistant, content).with_status(status)
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Which uploaded document grounds a session, and the chunk window in use.
///
/// Construction and navigation keep `current_chunk_index < total_chunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentContext {
    active_document_id: String,
    current_chunk_index: usize,
    total_chunks: usize,
}

impl DocumentContext {
    pub fn new(document_id: impl Into<String>, total_chunks: usize) -> StorageResult<Self> {
        let active_document_id = document_id.into();
        ensure!(
            total_chunks > 0,
            InvalidDocumentSnafu {
                stage: "document-context-new",
                document_id: active_document_id.clone(),
                details: "a document needs at least one chunk".to_string(),
            }
        );
        ensure!(
            !active_document_id.trim().is_empty(),
            InvalidDocumentSnafu {
                stage: "document-context-new",
                document_id: active_document_id.clone(),
                details: "document id is empty".to_string(),
            }
        );

        Ok(Self {
            active_document_id,
            current_chunk_index: 0,
            total_chunks,
        })
    }

    pub fn document_id(&self) -> &str {
        &self.active_document_id
    }

    pub fn chunk_index(&self) -> usize {
        self.current_chunk_index
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// `(chunk_index, total_chunks)`, or zeroes when no document is active.
    pub fn indices_of(context: Option<&Self>) -> (usize, usize) {
        context.map_or((0, 0), |context| {
            (context.current_chunk_index, context.total_chunks)
        })
    }

    /// Moves to the next chunk; returns false at the last one.
    pub fn next_chunk(&mut self) -> bool {
        if self.current_chunk_index + 1 >= self.total_chunks {
            return false;
        }
        self.current_chunk_index += 1;
        true
    }

    /// Moves to the previous chunk; returns false at the first one.
    pub fn prev_chunk(&mut self) -> bool {
        if self.current_chunk_index == 0 {
            return false;
        }
        self.current_chunk_index -= 1;
        true
    }

    pub fn has_prev(&self) -> bool {
        self.current_chunk_index > 0
    }

    pub fn has_next(&self) -> bool {
        self.current_chunk_index + 1 < self.total_chunks
    }

    /// Zero-based chunk indices the backend grounds on: current plus neighbours.
    pub fn chunk_window(&self) -> Vec<usize> {
        let mut window = Vec::with_capacity(3);
        if self.has_prev() {
            window.push(self.current_chunk_index - 1);
        }
        window.push(self.current_chunk_index);
        if self.has_next() {
            window.push(self.current_chunk_index + 1);
        }
        window
    }
}

/// One conversation thread and its message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub document: Option<DocumentContext>,
    pub created_at: Timestamp,
}

impl Session {
    pub fn new(id: SessionId, created_at: Timestamp) -> Self {
        Self {
            id,
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            document: None,
            created_at,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn has_document(&self) -> bool {
        self.document.is_some()
    }
}

/// Sidebar row for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub message_count: usize,
    pub has_document: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(MessageId),
    /// An identical `(timestamp, content, is_user)` message was already stored.
    Duplicate(MessageId),
}

impl AppendOutcome {
    pub fn message_id(self) -> MessageId {
        match self {
            Self::Appended(id) | Self::Duplicate(id) => id,
        }
    }
}

/// Result of switching the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Unchanged,
    Switched {
        session_id: SessionId,
        document: Option<DocumentContext>,
        messages: Vec<Message>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: SessionId,
    pub active_session_id: SessionId,
    /// Set when the last session was deleted and a fresh one took its place.
    pub created_replacement: bool,
}
