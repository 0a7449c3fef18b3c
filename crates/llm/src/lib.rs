use std::sync::Arc;

mod error;
mod frame;
mod http;
mod model;
mod ndjson;
mod provider;

pub use error::{BackendError, BackendResult, FrameError};
pub use frame::Frame;
pub use http::{BackendConfig, DEFAULT_BACKEND_URL, DEFAULT_OLLAMA_URL, HttpBackend};
pub use model::{
    DEFAULT_MODEL, Model, ModelCache, ModelCatalog, ModelCatalogSource, default_models,
    format_size,
};
pub use ndjson::{DecodedFrame, NdjsonDecoder};
pub use provider::{
    BackendWorker, BodyEvent, BoxFuture, ChatBackend, ChatRequest, ChatStream, ChatStreamHandle,
    DocumentUploadReply, FileUpload, HealthStatus, ImageUploadReply, guess_mime_type,
    make_body_stream,
};

pub fn create_backend(config: BackendConfig) -> BackendResult<Arc<dyn ChatBackend>> {
    Ok(Arc::new(HttpBackend::new(config)?))
}
