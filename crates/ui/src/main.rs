use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use ollachat::chat::{
    ControllerResult, SessionController, SubmitOutcome, SubmitRejection, UploadOutcome,
};
use ollachat::settings::SettingsStore;
use ollachat::terminal::{
    Command, HELP_TEXT, TerminalRenderer, format_model_catalog, format_session_list, session_at,
};
use ollachat_llm::create_backend;
use ollachat_storage::{MonotonicClock, SessionId, SessionStore};
use tokio::io::{AsyncBufReadExt, BufReader};

type Controller = SessionController<TerminalRenderer<io::Stdout>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineFlow {
    Continue,
    Quit,
}

/// Terminal entry point.
///
/// Reads commands from stdin while body events from the in-flight request
/// are applied as they arrive. Ctrl-C stops a running response, or exits
/// when nothing is running.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let settings = Arc::new(SettingsStore::load());
    let backend = match create_backend(settings.settings().to_backend_config()) {
        Ok(backend) => backend,
        Err(error) => {
            tracing::error!(error = %error, "failed to create backend client");
            return ExitCode::FAILURE;
        }
    };
    let store = SessionStore::new(Arc::new(MonotonicClock::new()));
    let mut controller =
        SessionController::new(store, backend, TerminalRenderer::new(io::stdout()), settings);

    match controller.health().await {
        Ok(status) if status.is_healthy() => {}
        Ok(status) => {
            let message = format!("Backend reports `{}`: {}", status.status, status.message);
            controller.renderer_mut().line(&message);
        }
        Err(error) => {
            tracing::warn!(error = %error, "health probe failed");
            controller
                .renderer_mut()
                .line("Backend is not reachable yet; messages will fail until it is.");
        }
    }
    controller
        .renderer_mut()
        .line("Type a message, or /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_delete: Option<SessionId> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    match run_line(&mut controller, &mut pending_delete, &line).await {
                        Ok(LineFlow::Continue) => {}
                        Ok(LineFlow::Quit) => break,
                        Err(error) => report(&mut controller, &error),
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(error = %error, "failed to read stdin");
                    break;
                }
            },
            event = controller.next_stream_event() => {
                if let Err(error) = controller.handle_stream_event(event) {
                    report(&mut controller, &error);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    tracing::error!(error = %error, "failed to listen for ctrl-c");
                    break;
                }
                match controller.cancel() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(error) => report(&mut controller, &error),
                }
            }
        }
    }

    if let Err(error) = controller.cancel() {
        tracing::warn!(error = %error, "failed to stop generation on exit");
    }
    ExitCode::SUCCESS
}

async fn run_line(
    controller: &mut Controller,
    pending_delete: &mut Option<SessionId>,
    line: &str,
) -> ControllerResult<LineFlow> {
    if let Some(session_id) = pending_delete.take() {
        let confirmed = matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes");
        if controller.delete_session(session_id, confirmed)?.is_none() {
            controller.renderer_mut().line("Kept the chat.");
        }
        return Ok(LineFlow::Continue);
    }

    let command = match Command::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(LineFlow::Continue),
        Err(error) => {
            controller.renderer_mut().line(&error.to_string());
            return Ok(LineFlow::Continue);
        }
    };

    match command {
        Command::Say(text) => {
            if let SubmitOutcome::Rejected(SubmitRejection::AlreadyGenerating) =
                controller.submit(text)?
            {
                controller
                    .renderer_mut()
                    .line("Still answering; /stop first or wait for the reply.");
            }
        }
        Command::New => {
            controller.create_session()?;
        }
        Command::List => {
            let listing = format_session_list(&controller.store().list_sessions());
            controller.renderer_mut().line(listing.trim_end());
        }
        Command::Switch(position) => match chat_at(controller, position) {
            Some(session_id) => {
                controller.select_session(session_id)?;
            }
            None => no_such_chat(controller, position),
        },
        Command::Delete(position) => match chat_at(controller, position) {
            Some(session_id) => {
                let summary = controller.store().summary(session_id).ok();
                let title = summary.map_or_else(String::new, |summary| summary.title);
                controller
                    .renderer_mut()
                    .line(&format!("Delete \"{title}\"? [y/N]"));
                *pending_delete = Some(session_id);
            }
            None => no_such_chat(controller, position),
        },
        Command::Stop => {
            if !controller.cancel()? {
                controller.renderer_mut().line("Nothing to stop.");
            }
        }
        Command::Upload(path) => {
            let outcome = controller.upload_document(&path).await?;
            report_busy(controller, &outcome);
        }
        Command::Image(path) => {
            let outcome = controller.upload_image(&path).await?;
            report_busy(controller, &outcome);
        }
        Command::Next => {
            if !controller.next_chunk()? {
                controller.renderer_mut().line("No next chunk.");
            }
        }
        Command::Prev => {
            if !controller.prev_chunk()? {
                controller.renderer_mut().line("No previous chunk.");
            }
        }
        Command::Models => {
            let catalog = controller.list_models().await?;
            let selected = controller.snapshot().model;
            let listing = format_model_catalog(&catalog, &selected);
            controller.renderer_mut().line(listing.trim_end());
        }
        Command::Model(name) => controller.select_model(&name)?,
        Command::Help => controller.renderer_mut().line(HELP_TEXT),
        Command::Quit => return Ok(LineFlow::Quit),
    }
    Ok(LineFlow::Continue)
}

fn chat_at(controller: &Controller, position: usize) -> Option<SessionId> {
    session_at(&controller.store().list_sessions(), position)
}

fn no_such_chat(controller: &mut Controller, position: usize) {
    controller
        .renderer_mut()
        .line(&format!("No chat number {position}; see /list."));
}

fn report_busy(controller: &mut Controller, outcome: &UploadOutcome) {
    if *outcome == UploadOutcome::Busy {
        controller
            .renderer_mut()
            .line("Wait for the current reply to finish before uploading.");
    }
}

fn report(controller: &mut Controller, error: &ollachat::chat::ControllerError) {
    tracing::error!(error = %error, "command failed");
    controller.renderer_mut().line(&format!("error: {error}"));
}
