use ollachat_storage::{DocumentContext, Message, SessionId, SessionSummary};

/// What the primary control does when pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAffordance {
    Send,
    Cancel,
}

/// Document bar state for the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentView {
    pub document_id: String,
    /// Zero-based.
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub has_prev: bool,
    pub has_next: bool,
    /// Chunks the backend answers from: the current one and its neighbours.
    pub window: Vec<usize>,
}

impl From<&DocumentContext> for DocumentView {
    fn from(context: &DocumentContext) -> Self {
        Self {
            document_id: context.document_id().to_string(),
            chunk_index: context.chunk_index(),
            total_chunks: context.total_chunks(),
            has_prev: context.has_prev(),
            has_next: context.has_next(),
            window: context.chunk_window(),
        }
    }
}

/// Immutable picture of everything a front end draws.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub sessions: Vec<SessionSummary>,
    pub active_session: Option<SessionId>,
    /// Time-ordered, deduplicated log of the active session.
    pub messages: Vec<Message>,
    /// Thinking or upload progress; never part of the log.
    pub transient_status: Option<String>,
    pub control: ControlAffordance,
    pub send_enabled: bool,
    pub document: Option<DocumentView>,
    pub model: String,
}

impl ViewSnapshot {
    pub fn is_generating(&self) -> bool {
        self.control == ControlAffordance::Cancel
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Receives a fresh snapshot after every state change.
pub trait RenderAdapter: Send {
    fn render(&mut self, snapshot: &ViewSnapshot);
}

/// Drops every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl RenderAdapter for NullRenderer {
    fn render(&mut self, _snapshot: &ViewSnapshot) {}
}
