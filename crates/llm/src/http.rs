use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt};
use tokio::sync::{mpsc, oneshot};

use super::error::{
    BackendError, BackendResult, BuildClientSnafu, DecodeResponseSnafu, HttpStatusSnafu,
    MissingReplyFieldSnafu, MultipartMimeSnafu, SendRequestSnafu,
};
use super::model::{Model, ModelCache, ModelCatalog, TagsPayload, default_models};
use super::provider::{
    BackendWorker, BodyEvent, BoxFuture, ChatBackend, ChatRequest, ChatStreamHandle,
    DocumentUploadReply, FileUpload, HealthStatus, ImageUploadReply, make_body_stream,
};

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub backend_url: String,
    pub ollama_url: String,
    /// Applies to uploads, model listing and health probes. Chat bodies stream
    /// without a deadline.
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

// `/upload` and `/upload_image` share one reply envelope.
#[derive(Debug, Deserialize)]
struct UploadPayload {
    #[serde(default)]
    success: bool,
    filename: Option<String>,
    #[serde(default)]
    num_chunks: usize,
    image_url: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

impl UploadPayload {
    fn rejection(self) -> String {
        self.error
            .unwrap_or_else(|| "the backend rejected the upload".to_string())
    }

    fn into_document_reply(self) -> BackendResult<DocumentUploadReply> {
        if !self.success {
            return Ok(DocumentUploadReply::Rejected {
                error: self.rejection(),
            });
        }
        let filename = self.filename.context(MissingReplyFieldSnafu {
            stage: "upload-document-reply",
            field: "filename",
        })?;
        Ok(DocumentUploadReply::Accepted {
            filename,
            num_chunks: self.num_chunks,
        })
    }

    fn into_image_reply(self) -> BackendResult<ImageUploadReply> {
        if !self.success {
            return Ok(ImageUploadReply::Rejected {
                error: self.rejection(),
            });
        }
        let image_url = self.image_url.context(MissingReplyFieldSnafu {
            stage: "upload-image-reply",
            field: "image_url",
        })?;
        let filename = self.filename.context(MissingReplyFieldSnafu {
            stage: "upload-image-reply",
            field: "filename",
        })?;
        Ok(ImageUploadReply::Accepted {
            image_url,
            message: self.message.unwrap_or_default(),
            filename,
        })
    }
}

/// [`ChatBackend`] over the document-chat HTTP server and Ollama.
pub struct HttpBackend {
    config: BackendConfig,
    client: reqwest::Client,
    model_cache: Arc<ModelCache>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        Self::with_model_cache(config, Arc::new(ModelCache::with_default_ttl()))
    }

    pub fn with_model_cache(
        config: BackendConfig,
        model_cache: Arc<ModelCache>,
    ) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self {
            config,
            client,
            model_cache,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn backend_endpoint(&self, path: &str) -> String {
        join_url(&self.config.backend_url, path)
    }

    fn ollama_endpoint(&self, path: &str) -> String {
        join_url(&self.config.ollama_url, path)
    }

    async fn post_upload(
        &self,
        path: &str,
        form: Form,
        stage: &'static str,
    ) -> BackendResult<UploadPayload> {
        let url = self.backend_endpoint(path);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .context(SendRequestSnafu {
                stage,
                url: url.clone(),
            })?;
        // Rejections arrive as JSON under 4xx/5xx too, so the status only
        // matters when the body does not parse.
        read_json_reply(response, url, stage, true).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        stage: &'static str,
    ) -> BackendResult<T> {
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .context(SendRequestSnafu {
                stage,
                url: url.clone(),
            })?;
        read_json_reply(response, url, stage, false).await
    }

    async fn fetch_tags(&self) -> BackendResult<Vec<Model>> {
        let url = self.ollama_endpoint("/api/tags");
        let payload: TagsPayload = self.get_json(url, "fetch-model-tags").await?;
        Ok(payload.models)
    }

    fn emit_failure(event_tx: &mpsc::UnboundedSender<BodyEvent>, error: BackendError) {
        let _ = event_tx.send(BodyEvent::Failed(error.to_string()));
    }

    async fn run_chat_worker(
        client: reqwest::Client,
        url: String,
        request: ChatRequest,
        event_tx: mpsc::UnboundedSender<BodyEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let chat_id = request.chat_id.clone();
        let send = client.post(&url).json(&request).send();
        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(chat_id = %chat_id, "chat request cancelled before response");
                return;
            }
            result = send => result,
        };

        let response = match response {
            Ok(response) => response,
            Err(source) => {
                tracing::error!(
                    chat_id = %chat_id,
                    url = %url,
                    error = %source,
                    "failed to open chat stream"
                );
                Self::emit_failure(
                    &event_tx,
                    BackendError::SendRequest {
                        stage: "open-chat-stream",
                        url,
                        source,
                    },
                );
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                chat_id = %chat_id,
                status = status.as_u16(),
                "chat endpoint returned an error status"
            );
            Self::emit_failure(
                &event_tx,
                BackendError::HttpStatus {
                    stage: "open-chat-stream",
                    url,
                    status: status.as_u16(),
                    body,
                },
            );
            return;
        }

        let mut body = response.bytes_stream();
        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(chat_id = %chat_id, "chat stream cancelled");
                    break;
                }
                next_chunk = body.next() => {
                    match next_chunk {
                        Some(Ok(chunk)) => {
                            if event_tx.send(BodyEvent::Chunk(chunk)).is_err() {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(chat_id = %chat_id, error = %source, "chat body read failed");
                            Self::emit_failure(
                                &event_tx,
                                BackendError::SendRequest {
                                    stage: "read-chat-body",
                                    url,
                                    source,
                                },
                            );
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

impl ChatBackend for HttpBackend {
    fn open_chat(&self, request: ChatRequest) -> BackendResult<ChatStreamHandle> {
        let url = self.backend_endpoint("/chat");
        tracing::debug!(
            chat_id = %request.chat_id,
            model = %request.model,
            is_pdf_chat = request.is_pdf_chat,
            chunk_index = request.chunk_index,
            "opening chat stream"
        );

        let (event_tx, stream, cancel_rx) = make_body_stream();
        let worker: BackendWorker = Box::pin(Self::run_chat_worker(
            self.client.clone(),
            url,
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ChatStreamHandle { stream, worker })
    }

    fn upload_document<'a>(
        &'a self,
        upload: FileUpload,
    ) -> BoxFuture<'a, BackendResult<DocumentUploadReply>> {
        Box::pin(async move {
            let form = Form::new().part("file", file_part(upload)?);
            let payload = self.post_upload("/upload", form, "upload-document").await?;
            payload.into_document_reply()
        })
    }

    fn upload_image<'a>(
        &'a self,
        upload: FileUpload,
        chat_id: String,
    ) -> BoxFuture<'a, BackendResult<ImageUploadReply>> {
        Box::pin(async move {
            let form = Form::new()
                .part("file", file_part(upload)?)
                .text("chat_id", chat_id);
            let payload = self.post_upload("/upload_image", form, "upload-image").await?;
            payload.into_image_reply()
        })
    }

    fn list_models<'a>(&'a self) -> BoxFuture<'a, BackendResult<ModelCatalog>> {
        Box::pin(async move {
            if let Some(models) = self.model_cache.get_fresh().await {
                return Ok(ModelCatalog::from_cache_fresh(models));
            }

            match self.fetch_tags().await {
                Ok(models) => {
                    self.model_cache.set(models.clone()).await;
                    Ok(ModelCatalog::from_ollama(models))
                }
                Err(error) => {
                    let error_message = error.to_string();

                    if let Some(models) = self.model_cache.get_any().await {
                        tracing::warn!(
                            cached_model_count = models.len(),
                            error = %error_message,
                            "model listing failed; serving stale cached models"
                        );
                        return Ok(ModelCatalog::from_cache_stale(models, error_message));
                    }

                    tracing::warn!(
                        error = %error_message,
                        "model listing failed without cache; serving static fallback models"
                    );
                    Ok(ModelCatalog::from_static_fallback(
                        default_models(),
                        error_message,
                    ))
                }
            }
        })
    }

    fn health<'a>(&'a self) -> BoxFuture<'a, BackendResult<HealthStatus>> {
        Box::pin(async move {
            let url = self.backend_endpoint("/health");
            self.get_json(url, "health-probe").await
        })
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

fn file_part(upload: FileUpload) -> BackendResult<Part> {
    let FileUpload {
        file_name,
        mime_type,
        bytes,
    } = upload;
    Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(&mime_type)
        .context(MultipartMimeSnafu {
            stage: "build-multipart",
            mime_type: mime_type.clone(),
        })
}

async fn read_json_reply<T: DeserializeOwned>(
    response: reqwest::Response,
    url: String,
    stage: &'static str,
    lenient_status: bool,
) -> BackendResult<T> {
    let status = response.status();
    let body = response.text().await.context(SendRequestSnafu {
        stage,
        url: url.clone(),
    })?;

    if !lenient_status && !status.is_success() {
        return HttpStatusSnafu {
            stage,
            url,
            status: status.as_u16(),
            body,
        }
        .fail();
    }

    match serde_json::from_str(&body) {
        Ok(value) => Ok(value),
        Err(_) if !status.is_success() => HttpStatusSnafu {
            stage,
            url,
            status: status.as_u16(),
            body,
        }
        .fail(),
        Err(source) => Err(source).context(DecodeResponseSnafu { stage, url }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_without_double_slash() {
        assert_eq!(join_url("http://host:5000/", "/chat"), "http://host:5000/chat");
        assert_eq!(join_url("http://host:5000", "/chat"), "http://host:5000/chat");
    }

    #[test]
    fn document_reply_without_filename_is_an_error() {
        let payload: UploadPayload =
            serde_json::from_str(r#"{"success":true,"num_chunks":3}"#).unwrap();
        assert!(matches!(
            payload.into_document_reply(),
            Err(BackendError::MissingReplyField {
                field: "filename",
                ..
            })
        ));
    }

    #[test]
    fn document_reply_defaults_missing_chunk_count_to_zero() {
        let payload: UploadPayload =
            serde_json::from_str(r#"{"success":true,"filename":"a.pdf"}"#).unwrap();
        assert_eq!(
            payload.into_document_reply().unwrap(),
            DocumentUploadReply::Accepted {
                filename: "a.pdf".to_string(),
                num_chunks: 0,
            }
        );
    }

    #[test]
    fn rejection_keeps_backend_error_text() {
        let payload: UploadPayload =
            serde_json::from_str(r#"{"success":false,"error":"Tipo de archivo no permitido"}"#)
                .unwrap();
        assert_eq!(
            payload.into_image_reply().unwrap(),
            ImageUploadReply::Rejected {
                error: "Tipo de archivo no permitido".to_string(),
            }
        );
    }
}
