use serde::Deserialize;
use snafu::{ResultExt, ensure};

use super::error::{
    AmbiguousFrameSnafu, ClearThinkingFalseSnafu, EmptyFrameSnafu, FrameError, InvalidJsonSnafu,
};

/// One parsed object from the `/chat` response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Transient status shown while the model warms up.
    Thinking(String),
    ClearThinking,
    /// Cumulative assistant text so far, not a delta.
    Response(String),
    /// Terminal failure reported by the backend.
    Error(String),
}

// Unknown keys are rejected so a new frame kind is reported instead of dropped.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFrame {
    thinking: Option<String>,
    clear_thinking: Option<bool>,
    response: Option<String>,
    error: Option<String>,
}

impl Frame {
    pub fn parse(line: &[u8]) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_slice(line).context(InvalidJsonSnafu {
            stage: "parse-frame-json",
        })?;
        Self::try_from(raw)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl TryFrom<RawFrame> for Frame {
    type Error = FrameError;

    fn try_from(raw: RawFrame) -> Result<Self, FrameError> {
        let present = [
            ("thinking", raw.thinking.is_some()),
            ("clear_thinking", raw.clear_thinking.is_some()),
            ("response", raw.response.is_some()),
            ("error", raw.error.is_some()),
        ]
        .into_iter()
        .filter_map(|(key, is_set)| is_set.then_some(key))
        .collect::<Vec<_>>();

        ensure!(
            present.len() <= 1,
            AmbiguousFrameSnafu {
                stage: "classify-frame",
                keys: present,
            }
        );

        if let Some(text) = raw.thinking {
            return Ok(Self::Thinking(text));
        }
        if let Some(flag) = raw.clear_thinking {
            ensure!(
                flag,
                ClearThinkingFalseSnafu {
                    stage: "classify-frame"
                }
            );
            return Ok(Self::ClearThinking);
        }
        if let Some(text) = raw.response {
            return Ok(Self::Response(text));
        }
        if let Some(text) = raw.error {
            return Ok(Self::Error(text));
        }

        EmptyFrameSnafu {
            stage: "classify-frame",
        }
        .fail()
    }
}
