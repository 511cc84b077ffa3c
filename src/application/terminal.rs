#[cfg(test)]
#[path = "terminal_test.rs"]
mod tests;

use std::io;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use yansi::Paint;

use crate::configuration::Config;
use crate::configuration::ConfigKey;
use crate::domain::models::Event;
use crate::domain::models::MessageId;
use crate::domain::models::SessionOutcome;
use crate::domain::models::SlashCommand;
use crate::domain::services::SessionController;
use crate::domain::services::SessionHandle;
use crate::infrastructure::relay_client::RelayClient;

const LOADING: &str = "Loading...";

pub fn help_text() -> String {
    let text = r#"
COMMANDS:
- /summarize (/s) [PATH] - Reads a text document from disk and asks the model to summarize it.
- /cancel (/x) - Stops the response currently streaming in. Whatever arrived so far is kept.
- /quit /exit (/q) - Exit chatrelay.
- /help (/h) - Provides this help menu.

HOTKEYS:
- Enter - Send your message. Sending while a response is streaming replaces that response.
- CTRL+C - Interrupt waiting for a response if in progress, otherwise exit.
        "#;

    return text.trim().to_string();
}

/// Line based chat front end. Input lines come in through `handle_line`,
/// controller events through `handle_event`, and everything renders to `out`.
pub struct ChatTerminal<W: Write> {
    controller: SessionController,
    out: W,
    rendering: Option<MessageId>,
    loading: bool,
}

impl<W: Write> ChatTerminal<W> {
    pub fn new(controller: SessionController, out: W) -> ChatTerminal<W> {
        return ChatTerminal {
            controller,
            out,
            rendering: None,
            loading: false,
        };
    }

    pub fn controller(&self) -> &SessionController {
        return &self.controller;
    }

    pub fn greet(&mut self) -> Result<()> {
        writeln!(
            self.out,
            "{}",
            Paint::new(format!(
                "chatrelay {}. Type a message, or /help for commands.",
                env!("CARGO_PKG_VERSION")
            ))
            .bold()
        )?;
        return self.prompt();
    }

    fn prompt(&mut self) -> Result<()> {
        write!(self.out, "{}", Paint::green("> "))?;
        self.out.flush()?;
        return Ok(());
    }

    fn notice(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{}", Paint::new(text).dimmed())?;
        return Ok(());
    }

    /// Trails the reply with a dimmed status for as long as a session streams.
    fn show_loading(&mut self) -> Result<()> {
        if !self.loading && self.controller.is_streaming() {
            write!(self.out, " {}", Paint::new(LOADING).dimmed())?;
            self.loading = true;
        }

        return Ok(());
    }

    fn clear_loading(&mut self) -> Result<()> {
        if self.loading {
            // Erase in place so the reply printed so far stays on its line.
            let width = LOADING.len() + 1;
            let back = "\x08".repeat(width);
            write!(self.out, "{back}{}{back}", " ".repeat(width))?;
            self.loading = false;
        }

        return Ok(());
    }

    fn begin_rendering(&mut self, handle: SessionHandle) -> Result<()> {
        if self.rendering.is_some() {
            self.clear_loading()?;
            writeln!(self.out)?;
            self.notice("(replaced by your new message)")?;
        }

        self.rendering = Some(handle.target);
        write!(self.out, "{}", Paint::cyan("assistant: ").bold())?;
        self.show_loading()?;
        self.out.flush()?;

        return Ok(());
    }

    /// Returns false once the user asked to leave.
    pub async fn handle_line(&mut self, line: &str) -> Result<bool> {
        let line = line.trim();
        if line.is_empty() {
            if self.rendering.is_none() {
                self.prompt()?;
            }
            return Ok(true);
        }

        if let Some(cmd) = SlashCommand::parse(line) {
            if cmd.is_quit() {
                return Ok(false);
            }

            if cmd.is_help() {
                writeln!(self.out, "{}", help_text())?;
            } else if cmd.is_cancel() {
                if !self.controller.cancel() {
                    self.notice("Nothing to cancel.")?;
                }
            } else if cmd.is_summarize() {
                self.summarize(cmd.argument()).await?;
            }

            if self.rendering.is_none() {
                self.prompt()?;
            }
            return Ok(true);
        }

        if let Some(handle) = self.controller.send_message(line) {
            self.begin_rendering(handle)?;
        }

        return Ok(true);
    }

    async fn summarize(&mut self, path: Option<String>) -> Result<()> {
        let path = match path {
            Some(path) => path,
            None => {
                self.notice("Usage: /summarize [PATH]")?;
                return Ok(());
            }
        };

        let document = match tokio::fs::read_to_string(&path).await {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(path = path, error = ?err, "Failed to read document");
                writeln!(
                    self.out,
                    "{}",
                    Paint::red(format!("Unable to read {path}: {err}"))
                )?;
                return Ok(());
            }
        };

        match self.controller.summarize_document(&document) {
            Some(handle) => self.begin_rendering(handle)?,
            None => self.notice(&format!("{path} is empty, nothing to summarize."))?,
        }

        return Ok(());
    }

    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Fragment { target, text } => {
                if self.rendering != Some(target) {
                    return Ok(());
                }
                self.clear_loading()?;
                write!(self.out, "{text}")?;
                self.show_loading()?;
            }
            Event::Failed { target, message } => {
                if self.rendering != Some(target) {
                    return Ok(());
                }
                self.clear_loading()?;
                writeln!(self.out)?;
                write!(self.out, "{}", Paint::red(message))?;
                self.show_loading()?;
            }
            Event::SessionEnded {
                target, outcome, ..
            } => {
                if self.rendering != Some(target) {
                    return Ok(());
                }
                self.clear_loading()?;
                writeln!(self.out)?;
                if outcome == SessionOutcome::Cancelled {
                    self.notice("(cancelled)")?;
                }
                self.rendering = None;
                self.prompt()?;
            }
        }

        self.out.flush()?;
        return Ok(());
    }

    /// CTRL+C handling. Returns false when there was nothing to interrupt.
    pub fn interrupt(&mut self) -> Result<bool> {
        if self.controller.cancel() {
            return Ok(true);
        }

        writeln!(self.out)?;
        return Ok(false);
    }
}

pub async fn start() -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let controller = SessionController::new(
        Arc::new(RelayClient::default()),
        &Config::get(ConfigKey::Model),
        &Config::get(ConfigKey::SystemPrompt),
        tx,
    );

    let mut terminal = ChatTerminal::new(controller, io::stdout());
    terminal.greet()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !terminal.handle_line(&line).await? {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Some(event) = rx.recv() => {
                terminal.handle_event(event)?;
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                if !terminal.interrupt()? {
                    break;
                }
            }
        }
    }

    tracing::debug!(
        messages = terminal.controller().transcript().len(),
        "Chat session closed"
    );

    return Ok(());
}
