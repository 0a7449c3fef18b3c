pub mod clock;
pub mod error;
pub mod ids;
pub mod memory;
pub mod types;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionId, StreamSessionId};
pub use memory::SessionStore;
pub use types::{
    AppendOutcome, Attachment, DEFAULT_SESSION_TITLE, DeleteOutcome, DocumentContext, Message,
    MessageStatus, NewMessage, Role, Selection, Session, SessionSummary, Timestamp,
};
