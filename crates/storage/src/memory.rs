use std::collections::HashSet;
use std::sync::Arc;

use snafu::{OptionExt, ensure};

use super::clock::{Clock, MonotonicClock};
use super::error::{
    MessageNotFoundSnafu, MessageNotMutableSnafu, SessionNotFoundSnafu, StorageResult,
};
use super::ids::{MessageId, SessionId, StreamSessionId};
use super::types::{
    AppendOutcome, DEFAULT_SESSION_TITLE, DeleteOutcome, DocumentContext, Message, MessageStatus,
    NewMessage, Selection, Session, SessionSummary,
};

/// In-memory registry of chat sessions.
///
/// Sessions are kept in creation order; nothing survives the process.
pub struct SessionStore {
    sessions: Vec<Session>,
    active_session_id: Option<SessionId>,
    clock: Arc<dyn Clock>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Arc::new(MonotonicClock::new()))
    }
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Vec::new(),
            active_session_id: None,
            clock,
        }
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.active_session_id
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active_session_id
            .and_then(|session_id| self.find(session_id))
    }

    pub fn session(&self, session_id: SessionId) -> StorageResult<&Session> {
        self.find(session_id).context(SessionNotFoundSnafu {
            stage: "get-session",
            session_id: session_id.to_string(),
        })
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.find(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Allocates an empty session and makes it active.
    pub fn create_session(&mut self) -> SessionId {
        let session = Session::new(SessionId::new_v7(), self.clock.now());
        let session_id = session.id;
        self.sessions.push(session);
        self.active_session_id = Some(session_id);
        tracing::debug!(session_id = %session_id, "created session");
        session_id
    }

    /// Swaps the active session and yields its log ready for rendering.
    pub fn select_session(&mut self, session_id: SessionId) -> StorageResult<Selection> {
        if self.active_session_id == Some(session_id) {
            return Ok(Selection::Unchanged);
        }

        let session = self.find(session_id).context(SessionNotFoundSnafu {
            stage: "select-session",
            session_id: session_id.to_string(),
        })?;
        let document = session.document.clone();
        let messages = render_order(&session.messages);

        self.active_session_id = Some(session_id);
        tracing::debug!(
            session_id = %session_id,
            message_count = messages.len(),
            has_document = document.is_some(),
            "selected session"
        );

        Ok(Selection::Switched {
            session_id,
            document,
            messages,
        })
    }

    /// Removes a session; an active deletion falls back to the newest remaining
    /// session, or a fresh one when none remain.
    pub fn delete_session(&mut self, session_id: SessionId) -> StorageResult<DeleteOutcome> {
        let position = self
            .sessions
            .iter()
            .position(|session| session.id == session_id)
            .context(SessionNotFoundSnafu {
                stage: "delete-session",
                session_id: session_id.to_string(),
            })?;
        self.sessions.remove(position);
        tracing::debug!(session_id = %session_id, "deleted session");

        let mut created_replacement = false;
        if self.active_session_id == Some(session_id) {
            self.active_session_id = None;
            match self.sessions.last().map(|session| session.id) {
                Some(fallback) => {
                    self.active_session_id = Some(fallback);
                }
                None => {
                    self.create_session();
                    created_replacement = true;
                }
            }
        }

        let active_session_id = self.active_session_id.context(SessionNotFoundSnafu {
            stage: "delete-session-fallback",
            session_id: session_id.to_string(),
        })?;

        Ok(DeleteOutcome {
            deleted: session_id,
            active_session_id,
            created_replacement,
        })
    }

    /// Sessions for the sidebar, most recently created first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .rev()
            .map(|session| self.summarize(session))
            .collect()
    }

    pub fn summary(&self, session_id: SessionId) -> StorageResult<SessionSummary> {
        Ok(self.summarize(self.session(session_id)?))
    }

    /// Stamps and appends a message unless an identical one already exists.
    pub fn append_message(
        &mut self,
        session_id: SessionId,
        input: NewMessage,
    ) -> StorageResult<AppendOutcome> {
        let timestamp = self.clock.now();
        let session = self.find_mut(session_id, "append-message")?;

        if let Some(existing) = session.messages.iter().find(|message| {
            message.timestamp == timestamp
                && message.content == input.content
                && message.is_user() == input.role.is_user()
        }) {
            tracing::debug!(
                session_id = %session_id,
                message_id = %existing.id,
                "skipped duplicate message"
            );
            return Ok(AppendOutcome::Duplicate(existing.id));
        }

        if input.role.is_user()
            && session.title == DEFAULT_SESSION_TITLE
            && let Some(title) = derive_title(&input.content)
        {
            session.title = title;
        }

        let message = Message {
            id: MessageId::new_v7(),
            role: input.role,
            content: input.content,
            timestamp,
            status: input.status,
            attachment: input.attachment,
        };
        let message_id = message.id;
        session.messages.push(message);
        Ok(AppendOutcome::Appended(message_id))
    }

    /// Replaces the content of the open assistant message for `stream`.
    ///
    /// Only the last message of the session may be mutated.
    pub fn replace_streaming_content(
        &mut self,
        session_id: SessionId,
        stream: StreamSessionId,
        content: impl Into<String>,
    ) -> StorageResult<MessageId> {
        let session = self.find_mut(session_id, "replace-streaming-content")?;
        let message = session
            .messages
            .last_mut()
            .context(MessageNotFoundSnafu {
                stage: "replace-streaming-content",
                session_id: session_id.to_string(),
                message_id: "<last>".to_string(),
            })?;

        ensure!(
            message.is_open_for(stream),
            MessageNotMutableSnafu {
                stage: "replace-streaming-content",
                message_id: message.id.to_string(),
                details: format!("last message is not streaming for {stream}"),
            }
        );

        message.content = content.into();
        Ok(message.id)
    }

    /// Closes the message still open for `stream`, if any.
    pub fn finalize_streaming(
        &mut self,
        session_id: SessionId,
        stream: StreamSessionId,
        status: MessageStatus,
    ) -> StorageResult<Option<MessageId>> {
        let session = self.find_mut(session_id, "finalize-streaming")?;
        let Some(message) = session
            .messages
            .iter_mut()
            .rev()
            .find(|message| message.is_open_for(stream))
        else {
            return Ok(None);
        };

        message.status = status;
        Ok(Some(message.id))
    }

    /// Log sorted by timestamp with `(timestamp, content)` duplicates collapsed.
    pub fn rendered_messages(&self, session_id: SessionId) -> StorageResult<Vec<Message>> {
        Ok(render_order(&self.session(session_id)?.messages))
    }

    pub fn document(&self, session_id: SessionId) -> StorageResult<Option<&DocumentContext>> {
        Ok(self.session(session_id)?.document.as_ref())
    }

    pub fn document_mut(
        &mut self,
        session_id: SessionId,
    ) -> StorageResult<Option<&mut DocumentContext>> {
        Ok(self.find_mut(session_id, "document-mut")?.document.as_mut())
    }

    pub fn set_document(
        &mut self,
        session_id: SessionId,
        document: DocumentContext,
    ) -> StorageResult<()> {
        let session = self.find_mut(session_id, "set-document")?;
        tracing::debug!(
            session_id = %session_id,
            document_id = %document.document_id(),
            total_chunks = document.total_chunks(),
            "bound document to session"
        );
        session.document = Some(document);
        Ok(())
    }

    fn summarize(&self, session: &Session) -> SessionSummary {
        SessionSummary {
            id: session.id,
            title: session.title.clone(),
            message_count: session.messages.len(),
            has_document: session.has_document(),
            is_active: self.active_session_id == Some(session.id),
        }
    }

    fn find(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|session| session.id == session_id)
    }

    fn find_mut(
        &mut self,
        session_id: SessionId,
        stage: &'static str,
    ) -> StorageResult<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|session| session.id == session_id)
            .context(SessionNotFoundSnafu {
                stage,
                session_id: session_id.to_string(),
            })
    }
}

fn render_order(messages: &[Message]) -> Vec<Message> {
    let mut ordered = messages.to_vec();
    // Stable sort keeps insertion order for messages sharing a millisecond.
    ordered.sort_by_key(|message| message.timestamp);

    let mut seen = HashSet::with_capacity(ordered.len());
    ordered.retain(|message| seen.insert((message.timestamp, message.content.clone())));
    ordered
}

fn derive_title(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
