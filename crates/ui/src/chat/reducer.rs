//! Folds `/chat` body bytes into the session log.

use ollachat_llm::{Frame, NdjsonDecoder};
use ollachat_storage::{MessageStatus, NewMessage, SessionStore, StorageResult};

use super::state::{GenerationEnd, StreamTarget};

/// Whether the body should keep being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

/// Per-request reducer state. One instance lives exactly as long as its
/// request.
#[derive(Debug)]
pub struct StreamReducer {
    target: StreamTarget,
    decoder: NdjsonDecoder,
    thinking: Option<String>,
    skipped_lines: usize,
    /// Set once an error frame ended the body; later bytes are ignored.
    terminated: bool,
}

impl StreamReducer {
    pub fn new(target: StreamTarget) -> Self {
        Self {
            target,
            decoder: NdjsonDecoder::new(),
            thinking: None,
            skipped_lines: 0,
            terminated: false,
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Transient "thinking" status, never stored in the log.
    pub fn thinking(&self) -> Option<&str> {
        self.thinking.as_deref()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Decodes one body chunk and applies every complete frame in order.
    pub fn feed(&mut self, store: &mut SessionStore, chunk: &[u8]) -> StorageResult<Flow> {
        if self.terminated {
            return Ok(Flow::Terminate);
        }
        for decoded in self.decoder.push(chunk) {
            match decoded {
                Ok(frame) => {
                    if self.apply(store, frame)? == Flow::Terminate {
                        return Ok(Flow::Terminate);
                    }
                }
                Err(error) => self.skip_line(&error),
            }
        }
        Ok(Flow::Continue)
    }

    pub fn apply(&mut self, store: &mut SessionStore, frame: Frame) -> StorageResult<Flow> {
        let StreamTarget {
            session_id,
            stream_id,
        } = self.target;

        if self.terminated {
            return Ok(Flow::Terminate);
        }

        match frame {
            Frame::Thinking(text) => {
                self.thinking = Some(text);
            }
            Frame::ClearThinking => {
                self.thinking = None;
            }
            Frame::Response(text) => {
                let session = store.session(session_id)?;
                let open = session
                    .last_message()
                    .is_some_and(|message| message.is_open_for(stream_id));
                if open {
                    store.replace_streaming_content(session_id, stream_id, text)?;
                } else {
                    store.append_message(
                        session_id,
                        NewMessage::assistant_streaming(text, stream_id),
                    )?;
                }
            }
            Frame::Error(text) => {
                tracing::warn!(
                    session_id = %session_id,
                    stream_id = %stream_id,
                    error = %text,
                    "backend reported a generation error"
                );
                self.thinking = None;
                self.terminated = true;
                store.append_message(session_id, NewMessage::assistant_error(text))?;
                return Ok(Flow::Terminate);
            }
        }

        Ok(Flow::Continue)
    }

    /// Closes the request: flushes a trailing line on a natural end, drops the
    /// transient status and closes the open assistant message. After an error
    /// frame the trailing line is discarded.
    pub fn finish(&mut self, store: &mut SessionStore, end: &GenerationEnd) -> StorageResult<()> {
        if *end == GenerationEnd::Completed && !self.terminated {
            match self.decoder.finish() {
                Some(Ok(frame)) => {
                    self.apply(store, frame)?;
                }
                Some(Err(error)) => self.skip_line(&error),
                None => {}
            }
        } else {
            let _ = self.decoder.finish();
        }
        self.thinking = None;

        let status = match end {
            GenerationEnd::Completed => MessageStatus::Done,
            GenerationEnd::Cancelled => MessageStatus::Cancelled,
            GenerationEnd::Failed(reason) => MessageStatus::Error(reason.clone()),
        };
        store.finalize_streaming(self.target.session_id, self.target.stream_id, status)?;
        Ok(())
    }

    fn skip_line(&mut self, error: &ollachat_llm::FrameError) {
        self.skipped_lines += 1;
        tracing::warn!(
            session_id = %self.target.session_id,
            stream_id = %self.target.stream_id,
            error = %error,
            "skipped malformed stream line"
        );
    }
}
