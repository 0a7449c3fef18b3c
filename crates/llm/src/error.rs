use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("failed to build HTTP client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    SendRequest {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("{url} returned status {status}: {body}"))]
    HttpStatus {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode response from {url} on `{stage}`: {source}"))]
    DecodeResponse {
        stage: &'static str,
        url: String,
        source: serde_json::Error,
    },
    #[snafu(display("backend reply on `{stage}` is missing `{field}`"))]
    MissingReplyField {
        stage: &'static str,
        field: &'static str,
    },
    #[snafu(display("failed to read upload file {path:?}: {source}"))]
    ReadUploadFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid multipart content type '{mime_type}': {source}"))]
    MultipartMime {
        stage: &'static str,
        mime_type: String,
        source: reqwest::Error,
    },
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Why one NDJSON line could not become a [`crate::Frame`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FrameError {
    #[snafu(display("frame is not valid JSON: {source}"))]
    InvalidJson {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("frame carries no known key"))]
    EmptyFrame { stage: &'static str },
    #[snafu(display("frame mixes several kinds: {}", keys.join(", ")))]
    AmbiguousFrame {
        stage: &'static str,
        keys: Vec<&'static str>,
    },
    #[snafu(display("`clear_thinking` must be true"))]
    ClearThinkingFalse { stage: &'static str },
}
