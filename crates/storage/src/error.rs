use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("session '{session_id}' was not found"))]
    SessionNotFound {
        stage: &'static str,
        session_id: String,
    },
    #[snafu(display("message '{message_id}' was not found in session '{session_id}'"))]
    MessageNotFound {
        stage: &'static str,
        session_id: String,
        message_id: String,
    },
    #[snafu(display("message '{message_id}' is not open for mutation: {details}"))]
    MessageNotMutable {
        stage: &'static str,
        message_id: String,
        details: String,
    },
    #[snafu(display("document context for '{document_id}' is invalid: {details}"))]
    InvalidDocument {
        stage: &'static str,
        document_id: String,
        details: String,
    },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
