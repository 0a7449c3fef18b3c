/// Session controller and its error and outcome types.
pub mod controller;
/// Folds streamed frames into the session log.
pub mod reducer;
pub mod snapshot;
/// Generation lifecycle state machine.
pub mod state;

pub use controller::{
    CANCEL_NOTICE, ConfirmDelete, ControlOutcome, ControllerError, ControllerResult,
    SessionController, StreamEvent, SubmitOutcome, SubmitRejection, UploadOutcome,
};
pub use reducer::{Flow, StreamReducer};
pub use snapshot::{ControlAffordance, DocumentView, NullRenderer, RenderAdapter, ViewSnapshot};
pub use state::{
    GenerationEnd, GenerationState, GenerationTransition, StreamTarget, TransitionRejection,
};
