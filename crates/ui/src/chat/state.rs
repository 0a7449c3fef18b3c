use ollachat_storage::{SessionId, StreamSessionId};

/// Routing key binding one `/chat` request to the session it was opened for.
///
/// The stream id changes on every submit so a late chunk can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub stream_id: StreamSessionId,
}

impl StreamTarget {
    pub const fn new(session_id: SessionId, stream_id: StreamSessionId) -> Self {
        Self {
            session_id,
            stream_id,
        }
    }
}

/// Whether a response is currently being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationState {
    #[default]
    Idle,
    Generating(StreamTarget),
}

/// How a generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEnd {
    /// Body ended or the backend sent an error frame.
    Completed,
    Cancelled,
    /// Transport failure with its reason.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationTransition {
    Start(StreamTarget),
    Finish {
        target: StreamTarget,
        end: GenerationEnd,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    AlreadyGenerating {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NotGenerating,
    StreamMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type TransitionResult = Result<GenerationState, TransitionRejection>;

impl GenerationState {
    pub fn is_generating(&self) -> bool {
        matches!(self, Self::Generating(_))
    }

    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Generating(target) => Some(*target),
            Self::Idle => None,
        }
    }

    /// True when a body event for `target` may still touch the store.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        matches!(self, Self::Generating(active) if *active == target)
    }

    /// Applies one transition. Every ending returns to `Idle`, and an ending
    /// must name the active stream exactly.
    pub fn apply(&self, transition: GenerationTransition) -> TransitionResult {
        match transition {
            GenerationTransition::Start(target) => self.apply_start(target),
            GenerationTransition::Finish { target, .. } => self.apply_finish(target),
        }
    }

    fn apply_start(&self, target: StreamTarget) -> TransitionResult {
        match self {
            Self::Generating(active) => Err(TransitionRejection::AlreadyGenerating {
                active: *active,
                attempted: target,
            }),
            Self::Idle => Ok(Self::Generating(target)),
        }
    }

    fn apply_finish(&self, target: StreamTarget) -> TransitionResult {
        match self {
            Self::Generating(active) if *active == target => Ok(Self::Idle),
            Self::Generating(active) => Err(TransitionRejection::StreamMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle => Err(TransitionRejection::NotGenerating),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(stream: u64) -> StreamTarget {
        StreamTarget::new(SessionId::new_v7(), StreamSessionId::new(stream))
    }

    #[test]
    fn start_then_finish_returns_to_idle() {
        let target = target(1);
        let generating = GenerationState::Idle
            .apply(GenerationTransition::Start(target))
            .unwrap();
        assert!(generating.is_generating());
        assert!(generating.accepts_stream_event(target));

        let idle = generating
            .apply(GenerationTransition::Finish {
                target,
                end: GenerationEnd::Cancelled,
            })
            .unwrap();
        assert_eq!(idle, GenerationState::Idle);
    }

    #[test]
    fn second_start_is_rejected() {
        let first = target(1);
        let second = target(2);
        let state = GenerationState::Generating(first);

        assert_eq!(
            state.apply(GenerationTransition::Start(second)),
            Err(TransitionRejection::AlreadyGenerating {
                active: first,
                attempted: second,
            })
        );
    }

    #[test]
    fn finishing_twice_is_rejected() {
        let target = target(3);
        let finish = GenerationTransition::Finish {
            target,
            end: GenerationEnd::Completed,
        };
        let idle = GenerationState::Generating(target)
            .apply(finish.clone())
            .unwrap();
        assert_eq!(idle.apply(finish), Err(TransitionRejection::NotGenerating));
    }

    #[test]
    fn stale_stream_does_not_match() {
        let active = target(4);
        let stale = StreamTarget::new(active.session_id, StreamSessionId::new(3));
        let state = GenerationState::Generating(active);

        assert!(!state.accepts_stream_event(stale));
        assert!(matches!(
            state.apply(GenerationTransition::Finish {
                target: stale,
                end: GenerationEnd::Completed,
            }),
            Err(TransitionRejection::StreamMismatch { .. })
        ));
    }
}
