//! Line-oriented terminal front end.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::PathBuf;

use ollachat_llm::{ModelCatalog, ModelCatalogSource};
use ollachat_storage::{Attachment, Message, MessageId, MessageStatus, Role, SessionId, SessionSummary};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::chat::{DocumentView, RenderAdapter, ViewSnapshot};

pub const HELP_TEXT: &str = "\
Commands:
  <text>            send a message
  /new              start a new chat
  /list             list chats
  /switch <n>       switch to chat n from /list
  /delete <n>       delete chat n from /list
  /stop             stop the current response
  /upload <pdf>     chat about a PDF
  /image <file>     extract text from an image
  /next, /prev      move through PDF chunks
  /models           list Ollama models
  /model <name>     use a model
  /help             show this help
  /quit             exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    New,
    List,
    /// One-based position in the `/list` output.
    Switch(usize),
    Delete(usize),
    Stop,
    Upload(PathBuf),
    Image(PathBuf),
    Next,
    Prev,
    Models,
    Model(String),
    Help,
    Quit,
}

#[derive(Debug, Snafu)]
pub enum CommandError {
    #[snafu(display("unknown command `{command}`, try /help"))]
    UnknownCommand { stage: &'static str, command: String },
    #[snafu(display("`{command}` needs an argument"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
    },
    #[snafu(display("`{raw}` is not a chat number"))]
    InvalidIndex {
        stage: &'static str,
        raw: String,
        source: std::num::ParseIntError,
    },
    #[snafu(display("chat numbers start at 1"))]
    ZeroIndex { stage: &'static str },
}

impl Command {
    /// Parses one input line; blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Say(line.to_string())));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        let command = match name {
            "new" => Self::New,
            "list" => Self::List,
            "switch" => Self::Switch(parse_index("/switch", argument)?),
            "delete" => Self::Delete(parse_index("/delete", argument)?),
            "stop" => Self::Stop,
            "upload" => Self::Upload(PathBuf::from(required("/upload", argument)?)),
            "image" => Self::Image(PathBuf::from(required("/image", argument)?)),
            "next" => Self::Next,
            "prev" => Self::Prev,
            "models" => Self::Models,
            "model" => Self::Model(required("/model", argument)?.to_string()),
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => {
                return UnknownCommandSnafu {
                    stage: "parse-command",
                    command: format!("/{name}"),
                }
                .fail();
            }
        };
        Ok(Some(command))
    }
}

fn required<'a>(command: &'static str, argument: &'a str) -> Result<&'a str, CommandError> {
    (!argument.is_empty())
        .then_some(argument)
        .context(MissingArgumentSnafu {
            stage: "parse-command-argument",
            command,
        })
}

fn parse_index(command: &'static str, argument: &str) -> Result<usize, CommandError> {
    let raw = required(command, argument)?;
    let index = raw.parse::<usize>().context(InvalidIndexSnafu {
        stage: "parse-chat-index",
        raw: raw.to_string(),
    })?;
    ensure!(
        index > 0,
        ZeroIndexSnafu {
            stage: "parse-chat-index"
        }
    );
    Ok(index)
}

/// Session id at a one-based `/list` position.
pub fn session_at(sessions: &[SessionSummary], position: usize) -> Option<SessionId> {
    position
        .checked_sub(1)
        .and_then(|index| sessions.get(index))
        .map(|summary| summary.id)
}

pub fn format_session_list(sessions: &[SessionSummary]) -> String {
    let mut output = String::new();
    for (index, session) in sessions.iter().enumerate() {
        let marker = if session.is_active { '*' } else { ' ' };
        let document = if session.has_document { " [pdf]" } else { "" };
        let _ = writeln!(
            output,
            "{marker} {}. {} ({} messages){document}",
            index + 1,
            session.title,
            session.message_count
        );
    }
    output
}

pub fn format_model_catalog(catalog: &ModelCatalog, selected: &str) -> String {
    let mut output = String::new();
    match catalog.source {
        ModelCatalogSource::Ollama | ModelCatalogSource::CacheFresh => {}
        ModelCatalogSource::CacheStaleFallback => {
            output.push_str("(Ollama unreachable, showing cached models)\n");
        }
        ModelCatalogSource::StaticFallback => {
            output.push_str("(Ollama unreachable, showing defaults)\n");
        }
    }
    for model in &catalog.models {
        let marker = if model.name == selected { '*' } else { ' ' };
        let _ = write!(output, "{marker} {}", model.name);
        if model.size_bytes > 0 {
            let _ = write!(output, " ({})", model.display_size());
        }
        if let Some(description) = &model.description {
            let _ = write!(output, " - {description}");
        }
        output.push('\n');
    }
    output
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PrintedMessage {
    id: MessageId,
    content: String,
    open: bool,
}

/// Prints snapshot changes as a running transcript.
///
/// Streaming replies are printed incrementally: only the part of the
/// cumulative text not yet on screen is written.
pub struct TerminalRenderer<W: Write + Send> {
    out: W,
    session: Option<SessionId>,
    printed: Vec<PrintedMessage>,
    status: Option<String>,
    document: Option<DocumentView>,
    model: Option<String>,
}

impl<W: Write + Send> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            session: None,
            printed: Vec::new(),
            status: None,
            document: None,
            model: None,
        }
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    pub fn line(&mut self, text: &str) {
        if let Err(error) = self.close_open_line().and_then(|_| writeln!(self.out, "{text}")) {
            tracing::warn!(error = %error, "failed to write to terminal");
        }
    }

    fn draw(&mut self, snapshot: &ViewSnapshot) -> io::Result<()> {
        if snapshot.active_session != self.session {
            self.close_open_line()?;
            self.session = snapshot.active_session;
            self.printed.clear();
            self.document = None;
            let title = snapshot
                .sessions
                .iter()
                .find(|session| Some(session.id) == snapshot.active_session)
                .map_or("(no chat)", |session| session.title.as_str());
            writeln!(self.out, "== {title} ==")?;
        }

        if self.model.as_deref() != Some(snapshot.model.as_str()) {
            if self.model.is_some() {
                self.close_open_line()?;
                writeln!(self.out, "[model: {}]", snapshot.model)?;
            }
            self.model = Some(snapshot.model.clone());
        }

        if snapshot.document != self.document {
            if let Some(document) = &snapshot.document {
                self.close_open_line()?;
                writeln!(self.out, "{}", render_document(document))?;
            }
            self.document = snapshot.document.clone();
        }

        if snapshot.transient_status != self.status {
            if let Some(status) = &snapshot.transient_status {
                self.close_open_line()?;
                writeln!(self.out, "... {status}")?;
            }
            self.status = snapshot.transient_status.clone();
        }

        for (position, message) in snapshot.messages.iter().enumerate() {
            self.draw_message(position, message)?;
        }
        self.out.flush()
    }

    fn draw_message(&mut self, position: usize, message: &Message) -> io::Result<()> {
        let open = message.is_streaming();
        match self.printed.get(position).cloned() {
            Some(printed) if printed.id == message.id => {
                let mut line_open = printed.open;
                if printed.content != message.content {
                    match message.content.strip_prefix(printed.content.as_str()) {
                        Some(suffix) if printed.open => write!(self.out, "{suffix}")?,
                        _ => {
                            self.close_open_line()?;
                            write!(self.out, "{}", render_message(message))?;
                            line_open = true;
                        }
                    }
                }
                if line_open && !open {
                    writeln!(self.out)?;
                }
                self.printed[position] = PrintedMessage {
                    id: message.id,
                    content: message.content.clone(),
                    open,
                };
            }
            _ => {
                self.close_open_line()?;
                self.printed.truncate(position);
                write!(self.out, "{}", render_message(message))?;
                if !open {
                    writeln!(self.out)?;
                }
                self.printed.push(PrintedMessage {
                    id: message.id,
                    content: message.content.clone(),
                    open,
                });
            }
        }
        Ok(())
    }

    /// Ends a half-printed streaming line before writing anything else.
    fn close_open_line(&mut self) -> io::Result<()> {
        if let Some(last) = self.printed.last_mut()
            && last.open
        {
            writeln!(self.out)?;
            // Anything that arrives later for this message is reprinted whole.
            last.open = false;
        }
        Ok(())
    }
}

impl<W: Write + Send> RenderAdapter for TerminalRenderer<W> {
    fn render(&mut self, snapshot: &ViewSnapshot) {
        if let Err(error) = self.draw(snapshot) {
            tracing::warn!(error = %error, "failed to render snapshot");
        }
    }
}

fn render_document(document: &DocumentView) -> String {
    let mut line = format!(
        "[document: {} chunk {}/{}",
        document.document_id,
        document.chunk_index + 1,
        document.total_chunks
    );
    if let (Some(first), Some(last)) = (document.window.first(), document.window.last())
        && first != last
    {
        let _ = write!(line, ", context {}-{}", first + 1, last + 1);
    }
    line.push(']');
    line
}

fn render_message(message: &Message) -> String {
    let label = match (&message.role, &message.status) {
        (_, MessageStatus::Error(_)) => "error",
        (Role::User, _) => "you",
        (Role::Assistant, _) => "assistant",
        (Role::System, _) => "system",
    };
    let mut line = format!("{label}> {}", message.content);
    match &message.attachment {
        Some(Attachment::Document {
            source_document,
            total_chunks,
            ..
        }) => {
            let _ = write!(line, " [pdf: {source_document}, {total_chunks} chunks]");
        }
        Some(Attachment::Image { image_ref }) => {
            let _ = write!(line, " [image: {image_ref}]");
        }
        None => {}
    }
    line
}

#[cfg(test)]
mod tests {
    use ollachat_llm::{Model, default_models};
    use ollachat_storage::{DocumentContext, StreamSessionId, Timestamp};

    use super::*;
    use crate::chat::ControlAffordance;

    #[test]
    fn parses_commands_and_plain_text() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(
            Command::parse("  Hello there ").unwrap(),
            Some(Command::Say("Hello there".to_string()))
        );
        assert_eq!(Command::parse("/switch 2").unwrap(), Some(Command::Switch(2)));
        assert_eq!(
            Command::parse("/upload  ~/papers/a b.pdf").unwrap(),
            Some(Command::Upload(PathBuf::from("~/papers/a b.pdf")))
        );
        assert_eq!(
            Command::parse("/model llama3:8b").unwrap(),
            Some(Command::Model("llama3:8b".to_string()))
        );
        assert_eq!(Command::parse("/exit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(matches!(
            Command::parse("/frobnicate"),
            Err(CommandError::UnknownCommand { .. })
        ));
        assert!(matches!(
            Command::parse("/delete"),
            Err(CommandError::MissingArgument { command: "/delete", .. })
        ));
        assert!(matches!(
            Command::parse("/switch two"),
            Err(CommandError::InvalidIndex { .. })
        ));
        assert!(matches!(
            Command::parse("/switch 0"),
            Err(CommandError::ZeroIndex { .. })
        ));
    }

    fn summary(title: &str, is_active: bool) -> SessionSummary {
        SessionSummary {
            id: SessionId::new_v7(),
            title: title.to_string(),
            message_count: 2,
            has_document: !is_active,
            is_active,
        }
    }

    #[test]
    fn session_positions_are_one_based() {
        let sessions = vec![summary("Newest", true), summary("Older", false)];
        assert_eq!(session_at(&sessions, 1), Some(sessions[0].id));
        assert_eq!(session_at(&sessions, 2), Some(sessions[1].id));
        assert_eq!(session_at(&sessions, 0), None);
        assert_eq!(session_at(&sessions, 3), None);

        assert_eq!(
            format_session_list(&sessions),
            "* 1. Newest (2 messages)\n  2. Older (2 messages) [pdf]\n"
        );
    }

    #[test]
    fn catalog_marks_selected_model() {
        let catalog = ModelCatalog::from_ollama(vec![
            Model::new("deepseek-r1:7b", 4_683_087_332),
            Model::new("llama3:8b", 0),
        ]);
        assert_eq!(
            format_model_catalog(&catalog, "llama3:8b"),
            "  deepseek-r1:7b (4 GB)\n* llama3:8b\n"
        );
    }

    #[test]
    fn fallback_catalog_shows_descriptions() {
        let catalog = ModelCatalog::from_static_fallback(default_models(), "offline".to_string());
        assert_eq!(
            format_model_catalog(&catalog, "deepseek-r1:7b"),
            "(Ollama unreachable, showing defaults)\n* deepseek-r1:7b - Default reasoning model\n"
        );
    }

    #[test]
    fn document_line_shows_context_window() {
        let mut context = DocumentContext::new("paper.pdf", 5).unwrap();
        assert_eq!(
            render_document(&DocumentView::from(&context)),
            "[document: paper.pdf chunk 1/5, context 1-2]"
        );
        context.next_chunk();
        context.next_chunk();
        assert_eq!(
            render_document(&DocumentView::from(&context)),
            "[document: paper.pdf chunk 3/5, context 2-4]"
        );

        let single = DocumentContext::new("note.pdf", 1).unwrap();
        assert_eq!(
            render_document(&DocumentView::from(&single)),
            "[document: note.pdf chunk 1/1]"
        );
    }

    fn message(id: MessageId, role: Role, content: &str, status: MessageStatus) -> Message {
        Message {
            id,
            role,
            content: content.to_string(),
            timestamp: Timestamp(1),
            status,
            attachment: None,
        }
    }

    fn snapshot(session: SessionId, messages: Vec<Message>) -> ViewSnapshot {
        ViewSnapshot {
            sessions: vec![SessionSummary {
                id: session,
                title: "Hello".to_string(),
                message_count: messages.len(),
                has_document: false,
                is_active: true,
            }],
            active_session: Some(session),
            messages,
            transient_status: None,
            control: ControlAffordance::Send,
            send_enabled: false,
            document: None,
            model: "deepseek-r1:7b".to_string(),
        }
    }

    #[test]
    fn streaming_reply_prints_only_new_text() {
        let session = SessionId::new_v7();
        let user = message(MessageId::new_v7(), Role::User, "Hello", MessageStatus::Done);
        let reply_id = MessageId::new_v7();
        let stream = MessageStatus::Streaming(StreamSessionId::new(1));
        let mut renderer = TerminalRenderer::new(Vec::new());

        renderer.render(&snapshot(session, vec![user.clone()]));
        renderer.render(&snapshot(
            session,
            vec![
                user.clone(),
                message(reply_id, Role::Assistant, "Hi", stream.clone()),
            ],
        ));
        renderer.render(&snapshot(
            session,
            vec![
                user.clone(),
                message(reply_id, Role::Assistant, "Hi there", stream),
            ],
        ));
        renderer.render(&snapshot(
            session,
            vec![
                user,
                message(reply_id, Role::Assistant, "Hi there", MessageStatus::Done),
            ],
        ));

        let output = String::from_utf8(renderer.writer().clone()).unwrap();
        assert_eq!(output, "== Hello ==\nyou> Hello\nassistant> Hi there\n");
    }

    #[test]
    fn errors_and_attachments_are_labelled() {
        let mut notice = message(
            MessageId::new_v7(),
            Role::Assistant,
            "PDF ready",
            MessageStatus::Done,
        );
        notice.attachment = Some(Attachment::Document {
            source_document: "paper.pdf".to_string(),
            chunk_index: 0,
            total_chunks: 5,
        });
        assert_eq!(
            render_message(&notice),
            "assistant> PDF ready [pdf: paper.pdf, 5 chunks]"
        );

        let failure = message(
            MessageId::new_v7(),
            Role::Assistant,
            "Connection error: refused",
            MessageStatus::Error("refused".to_string()),
        );
        assert_eq!(render_message(&failure), "error> Connection error: refused");
    }
}
