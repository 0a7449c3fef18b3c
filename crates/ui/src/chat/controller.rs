use std::path::Path;
use std::sync::Arc;

use ollachat_llm::{
    BackendError, BodyEvent, ChatBackend, ChatRequest, ChatStream, DocumentUploadReply,
    FileUpload, HealthStatus, ImageUploadReply, ModelCatalog,
};
use ollachat_storage::{
    Attachment, DeleteOutcome, DocumentContext, NewMessage, Selection, SessionId, SessionStore,
    SessionSummary, StorageError, StreamSessionId,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::task::JoinHandle;

use super::reducer::{Flow, StreamReducer};
use super::snapshot::{ControlAffordance, DocumentView, RenderAdapter, ViewSnapshot};
use super::state::{GenerationEnd, GenerationState, GenerationTransition, StreamTarget};
use crate::settings::{SettingsError, SettingsStore};

pub const CANCEL_NOTICE: &str = "_Generation was stopped by the user._";
pub const UPLOADING_DOCUMENT_STATUS: &str = "Uploading and processing PDF...";
pub const UPLOADING_IMAGE_STATUS: &str = "Uploading and processing image...";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ControllerError {
    #[snafu(display("session store failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("backend call failed on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("settings update failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("no active session on `{stage}`"))]
    NoActiveSession { stage: &'static str },
}

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    EmptyInput,
    AlreadyGenerating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started(StreamTarget),
    Rejected(SubmitRejection),
    /// The request could not be opened; a connection error was appended.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Submitted(SubmitOutcome),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted,
    /// Reported inline; session and document state are untouched.
    Failed(String),
    /// Uploads wait until the current response is finished.
    Busy,
}

/// One body event tagged with the request it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub target: StreamTarget,
    /// `None` once the body has ended.
    pub body: Option<BodyEvent>,
}

/// Asked before a session is deleted.
pub trait ConfirmDelete {
    fn confirm_delete(&mut self, session: &SessionSummary) -> bool;
}

impl ConfirmDelete for bool {
    fn confirm_delete(&mut self, _session: &SessionSummary) -> bool {
        *self
    }
}

struct PendingRequest {
    target: StreamTarget,
    stream: ChatStream,
    reducer: StreamReducer,
    worker: JoinHandle<()>,
}

/// Owns the sessions, the in-flight request and the input buffer, and
/// publishes a [`ViewSnapshot`] after every change.
pub struct SessionController<R: RenderAdapter> {
    store: SessionStore,
    backend: Arc<dyn ChatBackend>,
    renderer: R,
    settings: Arc<SettingsStore>,
    input: String,
    generation: GenerationState,
    pending: Option<PendingRequest>,
    next_stream_id: u64,
    transient_status: Option<String>,
}

impl<R: RenderAdapter> SessionController<R> {
    /// Builds the controller and makes sure a session is active.
    pub fn new(
        mut store: SessionStore,
        backend: Arc<dyn ChatBackend>,
        renderer: R,
        settings: Arc<SettingsStore>,
    ) -> Self {
        if store.active_session_id().is_none() {
            match store.list_sessions().first().map(|summary| summary.id) {
                Some(newest) => {
                    if let Err(error) = store.select_session(newest) {
                        tracing::warn!(
                            session_id = %newest,
                            error = %error,
                            "failed to restore newest session, starting a new one"
                        );
                        store.create_session();
                    }
                }
                None => {
                    store.create_session();
                }
            }
        }

        let mut controller = Self {
            store,
            backend,
            renderer,
            settings,
            input: String::new(),
            generation: GenerationState::Idle,
            pending: None,
            next_stream_id: 1,
            transient_status: None,
        };
        controller.publish();
        controller
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn generation(&self) -> GenerationState {
        self.generation
    }

    pub fn is_generating(&self) -> bool {
        self.generation.is_generating()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.store.active_session_id()
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
        self.publish();
    }

    /// Appends the user message and opens a cancellable request for it.
    pub fn submit(&mut self, text: impl Into<String>) -> ControllerResult<SubmitOutcome> {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            return Ok(SubmitOutcome::Rejected(SubmitRejection::EmptyInput));
        }
        if self.generation.is_generating() {
            return Ok(SubmitOutcome::Rejected(SubmitRejection::AlreadyGenerating));
        }

        let session_id = self.require_active_session("submit")?;
        self.store
            .append_message(session_id, NewMessage::user(text))
            .context(StorageSnafu {
                stage: "append-user-message",
            })?;
        self.input.clear();

        let target = StreamTarget::new(session_id, StreamSessionId::new(self.next_stream_id));
        // Ids are consumed even when the request fails to open.
        self.next_stream_id = self.next_stream_id.saturating_add(1);

        let request = self.build_request(session_id, text)?;
        let handle = match self.backend.open_chat(request) {
            Ok(handle) => handle,
            Err(error) => {
                let reason = error.to_string();
                tracing::error!(
                    session_id = %session_id,
                    error = %reason,
                    "failed to open chat request"
                );
                self.append_connection_error(session_id, &reason)?;
                self.publish();
                return Ok(SubmitOutcome::Failed(reason));
            }
        };

        match self.generation.apply(GenerationTransition::Start(target)) {
            Ok(next) => self.generation = next,
            Err(rejection) => {
                tracing::warn!(?rejection, "generation start rejected");
                return Ok(SubmitOutcome::Rejected(SubmitRejection::AlreadyGenerating));
            }
        }

        tracing::info!(
            session_id = %session_id,
            stream_id = %target.stream_id,
            "started generation"
        );
        self.pending = Some(PendingRequest {
            target,
            stream: handle.stream,
            reducer: StreamReducer::new(target),
            worker: tokio::spawn(handle.worker),
        });
        self.publish();
        Ok(SubmitOutcome::Started(target))
    }

    pub fn submit_input(&mut self) -> ControllerResult<SubmitOutcome> {
        let text = self.input.clone();
        self.submit(text)
    }

    /// Send while idle, stop while generating.
    pub fn press_primary_control(&mut self) -> ControllerResult<ControlOutcome> {
        if self.generation.is_generating() {
            self.cancel()?;
            return Ok(ControlOutcome::Cancelled);
        }
        Ok(ControlOutcome::Submitted(self.submit_input()?))
    }

    /// Stops the in-flight request. Returns false when nothing was running.
    pub fn cancel(&mut self) -> ControllerResult<bool> {
        if !self.generation.is_generating() {
            return Ok(false);
        }
        self.finish_pending(GenerationEnd::Cancelled)?;
        Ok(true)
    }

    /// Waits for the next body event. Never resolves while idle.
    pub async fn next_stream_event(&mut self) -> StreamEvent {
        match self.pending.as_mut() {
            Some(pending) => StreamEvent {
                target: pending.target,
                body: pending.stream.recv().await,
            },
            None => std::future::pending().await,
        }
    }

    pub fn handle_stream_event(&mut self, event: StreamEvent) -> ControllerResult<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        let current =
            pending.target == event.target && self.generation.accepts_stream_event(event.target);
        if !current {
            tracing::debug!(
                stream_id = %event.target.stream_id,
                "dropped event from a stale stream"
            );
            return Ok(());
        }

        match event.body {
            Some(BodyEvent::Chunk(chunk)) => {
                let flow = match pending.reducer.feed(&mut self.store, &chunk) {
                    Ok(flow) => flow,
                    Err(source) => {
                        self.finish_pending(GenerationEnd::Failed(source.to_string()))?;
                        return Err(source).context(StorageSnafu {
                            stage: "reduce-stream-chunk",
                        });
                    }
                };
                match flow {
                    Flow::Continue => self.publish(),
                    Flow::Terminate => self.finish_pending(GenerationEnd::Completed)?,
                }
            }
            Some(BodyEvent::Failed(reason)) => {
                self.finish_pending(GenerationEnd::Failed(reason))?;
            }
            None => self.finish_pending(GenerationEnd::Completed)?,
        }
        Ok(())
    }

    /// Pumps body events until the current request ends.
    pub async fn drive_to_idle(&mut self) -> ControllerResult<()> {
        while self.generation.is_generating() {
            let event = self.next_stream_event().await;
            self.handle_stream_event(event)?;
        }
        Ok(())
    }

    pub fn create_session(&mut self) -> ControllerResult<SessionId> {
        self.cancel()?;
        let session_id = self.store.create_session();
        self.publish();
        Ok(session_id)
    }

    pub fn select_session(&mut self, session_id: SessionId) -> ControllerResult<Selection> {
        if self.store.active_session_id() != Some(session_id) && self.store.contains(session_id) {
            self.cancel()?;
        }
        let selection = self
            .store
            .select_session(session_id)
            .context(StorageSnafu {
                stage: "select-session",
            })?;
        self.publish();
        Ok(selection)
    }

    /// Deletes after confirmation; `None` when the user declined.
    pub fn delete_session(
        &mut self,
        session_id: SessionId,
        mut confirm: impl ConfirmDelete,
    ) -> ControllerResult<Option<DeleteOutcome>> {
        let summary = self.store.summary(session_id).context(StorageSnafu {
            stage: "delete-session",
        })?;
        if !confirm.confirm_delete(&summary) {
            return Ok(None);
        }

        let streams_into_session = self
            .generation
            .active_target()
            .is_some_and(|target| target.session_id == session_id);
        if streams_into_session {
            self.cancel()?;
        }

        let outcome = self
            .store
            .delete_session(session_id)
            .context(StorageSnafu {
                stage: "delete-session",
            })?;
        self.publish();
        Ok(Some(outcome))
    }

    pub async fn upload_document(&mut self, path: &Path) -> ControllerResult<UploadOutcome> {
        match FileUpload::from_path(path).await {
            Ok(upload) => self.upload_document_file(upload).await,
            Err(error) => {
                let session_id = self.require_active_session("upload-document")?;
                self.report_upload_failure(
                    session_id,
                    format!("Error uploading the PDF: {error}"),
                )
            }
        }
    }

    /// Sends a PDF and binds the resulting document to the active session.
    pub async fn upload_document_file(
        &mut self,
        upload: FileUpload,
    ) -> ControllerResult<UploadOutcome> {
        if self.generation.is_generating() {
            return Ok(UploadOutcome::Busy);
        }
        let session_id = self.require_active_session("upload-document")?;
        if !upload.is_pdf() {
            return self.report_upload_failure(
                session_id,
                format!("Error processing the PDF: {} is not a PDF file", upload.file_name),
            );
        }

        self.set_transient_status(Some(UPLOADING_DOCUMENT_STATUS));
        let reply = self.backend.upload_document(upload).await;
        self.set_transient_status(None);

        let (filename, num_chunks) = match reply {
            Ok(DocumentUploadReply::Accepted {
                filename,
                num_chunks,
            }) if num_chunks > 0 => (filename, num_chunks),
            Ok(DocumentUploadReply::Accepted { filename, .. }) => {
                return self.report_upload_failure(
                    session_id,
                    format!("Error processing the PDF: {filename} produced no text chunks"),
                );
            }
            Ok(DocumentUploadReply::Rejected { error }) => {
                return self.report_upload_failure(
                    session_id,
                    format!("Error processing the PDF: {error}"),
                );
            }
            Err(error) => {
                return self.report_upload_failure(
                    session_id,
                    format!("Error uploading the PDF: {error}"),
                );
            }
        };

        let document = DocumentContext::new(filename.clone(), num_chunks).context(StorageSnafu {
            stage: "bind-uploaded-document",
        })?;
        self.store
            .set_document(session_id, document)
            .context(StorageSnafu {
                stage: "bind-uploaded-document",
            })?;
        let notice = NewMessage::assistant(format!(
            "PDF \"{filename}\" processed successfully. You can now ask questions about its content."
        ))
        .with_attachment(Attachment::Document {
            source_document: filename.clone(),
            chunk_index: 0,
            total_chunks: num_chunks,
        });
        self.store
            .append_message(session_id, notice)
            .context(StorageSnafu {
                stage: "append-document-notice",
            })?;

        tracing::info!(
            session_id = %session_id,
            document_id = %filename,
            total_chunks = num_chunks,
            "document uploaded"
        );
        self.publish();
        Ok(UploadOutcome::Accepted)
    }

    pub async fn upload_image(&mut self, path: &Path) -> ControllerResult<UploadOutcome> {
        match FileUpload::from_path(path).await {
            Ok(upload) => self.upload_image_file(upload).await,
            Err(error) => {
                let session_id = self.require_active_session("upload-image")?;
                self.report_upload_failure(
                    session_id,
                    format!("Error uploading the image: {error}"),
                )
            }
        }
    }

    /// Sends an image for text extraction under the active session's id.
    pub async fn upload_image_file(
        &mut self,
        upload: FileUpload,
    ) -> ControllerResult<UploadOutcome> {
        if self.generation.is_generating() {
            return Ok(UploadOutcome::Busy);
        }
        let session_id = self.require_active_session("upload-image")?;
        if !upload.is_image() {
            return self.report_upload_failure(
                session_id,
                format!(
                    "Error processing the image: {} is not a supported image",
                    upload.file_name
                ),
            );
        }

        self.set_transient_status(Some(UPLOADING_IMAGE_STATUS));
        let reply = self
            .backend
            .upload_image(upload, session_id.to_string())
            .await;
        self.set_transient_status(None);

        let (image_url, message, filename) = match reply {
            Ok(ImageUploadReply::Accepted {
                image_url,
                message,
                filename,
            }) => (image_url, message, filename),
            Ok(ImageUploadReply::Rejected { error }) => {
                return self.report_upload_failure(
                    session_id,
                    format!("Error processing the image: {error}"),
                );
            }
            Err(error) => {
                return self.report_upload_failure(
                    session_id,
                    format!("Error uploading the image: {error}"),
                );
            }
        };

        let content = if message.trim().is_empty() {
            format!("Image \"{filename}\" processed successfully.")
        } else {
            message
        };
        self.store
            .append_message(
                session_id,
                NewMessage::assistant(content).with_attachment(Attachment::Image {
                    image_ref: image_url,
                }),
            )
            .context(StorageSnafu {
                stage: "append-image-notice",
            })?;
        self.publish();
        Ok(UploadOutcome::Accepted)
    }

    /// Moves the active document forward; false without a document or at the end.
    pub fn next_chunk(&mut self) -> ControllerResult<bool> {
        self.navigate_chunk(DocumentContext::next_chunk)
    }

    pub fn prev_chunk(&mut self) -> ControllerResult<bool> {
        self.navigate_chunk(DocumentContext::prev_chunk)
    }

    pub async fn list_models(&self) -> ControllerResult<ModelCatalog> {
        self.backend.list_models().await.context(BackendSnafu {
            stage: "list-models",
        })
    }

    pub async fn health(&self) -> ControllerResult<HealthStatus> {
        self.backend.health().await.context(BackendSnafu {
            stage: "health-probe",
        })
    }

    pub fn select_model(&mut self, model: &str) -> ControllerResult<()> {
        self.settings.select_model(model).context(SettingsSnafu {
            stage: "select-model",
        })?;
        tracing::info!(model = %model.trim(), "selected model");
        self.publish();
        Ok(())
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        let active_session = self.store.active_session_id();
        let messages = active_session
            .and_then(|session_id| self.store.rendered_messages(session_id).ok())
            .unwrap_or_default();
        let document = active_session
            .and_then(|session_id| self.store.document(session_id).ok().flatten())
            .map(DocumentView::from);
        let thinking = self
            .pending
            .as_ref()
            .and_then(|pending| pending.reducer.thinking())
            .map(str::to_string);
        let generating = self.generation.is_generating();

        ViewSnapshot {
            sessions: self.store.list_sessions(),
            active_session,
            messages,
            transient_status: thinking.or_else(|| self.transient_status.clone()),
            control: if generating {
                ControlAffordance::Cancel
            } else {
                ControlAffordance::Send
            },
            send_enabled: generating || !self.input.trim().is_empty(),
            document,
            model: self.settings.settings().model.clone(),
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.renderer.render(&snapshot);
    }

    fn finish_pending(&mut self, end: GenerationEnd) -> ControllerResult<()> {
        let Some(mut pending) = self.pending.take() else {
            self.generation = GenerationState::Idle;
            return Ok(());
        };
        let target = pending.target;

        match self.generation.apply(GenerationTransition::Finish {
            target,
            end: end.clone(),
        }) {
            Ok(next) => self.generation = next,
            Err(rejection) => {
                tracing::warn!(?rejection, "generation finish rejected; forcing idle");
                self.generation = GenerationState::Idle;
            }
        }

        if end == GenerationEnd::Cancelled {
            pending.stream.cancel();
            pending.worker.abort();
        }

        pending
            .reducer
            .finish(&mut self.store, &end)
            .context(StorageSnafu {
                stage: "finish-stream",
            })?;

        match &end {
            GenerationEnd::Completed => {
                tracing::info!(
                    session_id = %target.session_id,
                    stream_id = %target.stream_id,
                    "generation completed"
                );
            }
            GenerationEnd::Cancelled => {
                tracing::info!(
                    session_id = %target.session_id,
                    stream_id = %target.stream_id,
                    "generation cancelled by user"
                );
                self.store
                    .append_message(target.session_id, NewMessage::system(CANCEL_NOTICE))
                    .context(StorageSnafu {
                        stage: "append-cancel-notice",
                    })?;
            }
            GenerationEnd::Failed(reason) => {
                tracing::warn!(
                    session_id = %target.session_id,
                    stream_id = %target.stream_id,
                    error = %reason,
                    "generation failed"
                );
                self.append_connection_error(target.session_id, reason)?;
            }
        }

        self.publish();
        Ok(())
    }

    fn build_request(&self, session_id: SessionId, text: &str) -> ControllerResult<ChatRequest> {
        let model = self.settings.settings().model.clone();
        let request = ChatRequest::new(session_id.to_string(), model, text);
        let document = self.store.document(session_id).context(StorageSnafu {
            stage: "build-chat-request",
        })?;
        Ok(match document {
            Some(document) => {
                request.with_document(document.document_id(), document.chunk_index())
            }
            None => request,
        })
    }

    fn append_connection_error(
        &mut self,
        session_id: SessionId,
        reason: &str,
    ) -> ControllerResult<()> {
        self.store
            .append_message(
                session_id,
                NewMessage::assistant_error(format!("Connection error: {reason}")),
            )
            .context(StorageSnafu {
                stage: "append-connection-error",
            })?;
        Ok(())
    }

    fn report_upload_failure(
        &mut self,
        session_id: SessionId,
        message: String,
    ) -> ControllerResult<UploadOutcome> {
        tracing::warn!(session_id = %session_id, error = %message, "upload failed");
        self.store
            .append_message(session_id, NewMessage::assistant_error(message.clone()))
            .context(StorageSnafu {
                stage: "append-upload-error",
            })?;
        self.publish();
        Ok(UploadOutcome::Failed(message))
    }

    fn navigate_chunk(
        &mut self,
        step: fn(&mut DocumentContext) -> bool,
    ) -> ControllerResult<bool> {
        let session_id = self.require_active_session("navigate-chunk")?;
        let moved = self
            .store
            .document_mut(session_id)
            .context(StorageSnafu {
                stage: "navigate-chunk",
            })?
            .is_some_and(step);
        if moved {
            self.publish();
        }
        Ok(moved)
    }

    fn set_transient_status(&mut self, status: Option<&str>) {
        self.transient_status = status.map(str::to_string);
        self.publish();
    }

    fn require_active_session(&self, stage: &'static str) -> ControllerResult<SessionId> {
        self.store
            .active_session_id()
            .context(NoActiveSessionSnafu { stage })
    }
}

impl<R: RenderAdapter> Drop for SessionController<R> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.worker.abort();
        }
    }
}
