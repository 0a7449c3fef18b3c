use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};

use super::error::{BackendResult, ReadUploadFileSnafu};
use super::model::ModelCatalog;

/// Body of `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub model: String,
    pub pdf_file: Option<String>,
    pub chunk_index: usize,
    #[serde(rename = "isPdfChat")]
    pub is_pdf_chat: bool,
    pub chat_id: String,
}

impl ChatRequest {
    pub fn new(
        chat_id: impl Into<String>,
        model: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            model: model.into(),
            pdf_file: None,
            chunk_index: 0,
            is_pdf_chat: false,
            chat_id: chat_id.into(),
        }
    }

    /// Grounds the request on one chunk of an uploaded document.
    pub fn with_document(mut self, pdf_file: impl Into<String>, chunk_index: usize) -> Self {
        self.pdf_file = Some(pdf_file.into());
        self.chunk_index = chunk_index;
        self.is_pdf_chat = true;
        self
    }
}

/// A file read into memory for a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn new(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: &Path) -> BackendResult<Self> {
        let bytes = tokio::fs::read(path).await.context(ReadUploadFileSnafu {
            stage: "read-upload-file",
            path: path.to_path_buf(),
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = guess_mime_type(&file_name).to_string();
        Ok(Self::new(file_name, mime_type, bytes))
    }

    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf"
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

pub fn guess_mime_type(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Outcome of `POST /upload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentUploadReply {
    Accepted { filename: String, num_chunks: usize },
    Rejected { error: String },
}

/// Outcome of `POST /upload_image`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageUploadReply {
    Accepted {
        image_url: String,
        message: String,
        filename: String,
    },
    Rejected {
        error: String,
    },
}

/// Payload of `GET /health`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: f64,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }
}

/// Raw body traffic forwarded from a stream worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEvent {
    Chunk(Bytes),
    /// Transport failure; the body will not continue.
    Failed(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type BackendWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiving end of one `/chat` response body.
///
/// Dropping the stream signals cancellation to its worker.
pub struct ChatStream {
    events: mpsc::UnboundedReceiver<BodyEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ChatStreamHandle {
    pub stream: ChatStream,
    pub worker: BackendWorker,
}

impl ChatStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<BodyEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Next body event; `None` once the worker has finished the body.
    pub async fn recv(&mut self) -> Option<BodyEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.events.close();
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// The inference backend the client talks to.
pub trait ChatBackend: Send + Sync {
    fn open_chat(&self, request: ChatRequest) -> BackendResult<ChatStreamHandle>;
    fn upload_document<'a>(
        &'a self,
        upload: FileUpload,
    ) -> BoxFuture<'a, BackendResult<DocumentUploadReply>>;
    fn upload_image<'a>(
        &'a self,
        upload: FileUpload,
        chat_id: String,
    ) -> BoxFuture<'a, BackendResult<ImageUploadReply>>;
    fn list_models<'a>(&'a self) -> BoxFuture<'a, BackendResult<ModelCatalog>>;
    fn health<'a>(&'a self) -> BoxFuture<'a, BackendResult<HealthStatus>>;
}

/// Channel pair used by workers to feed a [`ChatStream`].
pub fn make_body_stream() -> (
    mpsc::UnboundedSender<BodyEvent>,
    ChatStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (event_tx, ChatStream::new(event_rx, cancel_tx), cancel_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_uses_backend_field_names() {
        let request = ChatRequest::new("chat-1", "deepseek-r1:7b", "Hello")
            .with_document("paper.pdf", 2);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "message": "Hello",
                "model": "deepseek-r1:7b",
                "pdf_file": "paper.pdf",
                "chunk_index": 2,
                "isPdfChat": true,
                "chat_id": "chat-1",
            })
        );
    }

    #[test]
    fn plain_request_has_null_document() {
        let json = serde_json::to_value(ChatRequest::new("c", "m", "hi")).unwrap();
        assert_eq!(json["pdf_file"], serde_json::Value::Null);
        assert_eq!(json["isPdfChat"], false);
        assert_eq!(json["chunk_index"], 0);
    }

    #[test]
    fn mime_types_follow_extension() {
        assert_eq!(guess_mime_type("Report.PDF"), "application/pdf");
        assert_eq!(guess_mime_type("scan.jpeg"), "image/jpeg");
        assert_eq!(guess_mime_type("notes"), "application/octet-stream");
    }

    #[tokio::test]
    async fn dropping_stream_signals_cancellation() {
        let (event_tx, stream, cancel_rx) = make_body_stream();
        event_tx.send(BodyEvent::Chunk(Bytes::from_static(b"{}"))).unwrap();
        drop(stream);
        assert!(cancel_rx.await.is_ok());
    }

    #[tokio::test]
    async fn cancel_closes_the_event_channel() {
        let (event_tx, mut stream, cancel_rx) = make_body_stream();
        assert!(stream.cancel());
        assert!(stream.is_cancelled());
        assert!(!stream.cancel());
        assert!(cancel_rx.await.is_ok());
        assert!(event_tx.send(BodyEvent::Failed("late".into())).is_err());
    }
}
