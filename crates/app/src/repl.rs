//! Line-oriented chat loop.

use agent_host::{Orchestrator, TurnOutcome, TurnStatus};
use anyhow::{Context, Result};
use services::{FileIngestor, UploadedFile};
use shared::events::SessionEvent;
use shared::FileAttachment;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::warn;

pub const HELP: &str = "\
Commands:
  <text>            send a message
  /new              start a new conversation
  /list             list conversations
  /switch <n>       select conversation n
  /regen            regenerate the last reply
  /delete <n>       delete message n together with its partner
  /history          show the current conversation
  /models           list configured models
  /model <n>        use model n
  /think on|off     toggle deep thinking
  /attach <path>    attach a file to the next message
  /detach           drop pending attachments
  /export [path]    write the conversation as Markdown
  /help             show this help
  /quit             exit
Ctrl-C stops a reply that is being generated.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    List,
    Switch(usize),
    Regenerate,
    Delete(usize),
    History,
    Models,
    Model(usize),
    Think(bool),
    Attach(PathBuf),
    Detach,
    Export(Option<PathBuf>),
    Help,
    Quit,
}

fn index_arg(arg: &str, usage: &str) -> Result<usize, String> {
    match arg.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("usage: {}", usage)),
    }
}

/// Parse one input line. `None` for blank input.
pub fn parse(line: &str) -> Option<Result<Command, String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Ok(Command::Send(line.to_string())));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "new" => Ok(Command::New),
        "list" => Ok(Command::List),
        "switch" => index_arg(arg, "/switch <n>").map(Command::Switch),
        "regen" | "regenerate" => Ok(Command::Regenerate),
        "delete" => index_arg(arg, "/delete <n>").map(Command::Delete),
        "history" => Ok(Command::History),
        "models" => Ok(Command::Models),
        "model" => index_arg(arg, "/model <n>").map(Command::Model),
        "think" => match arg {
            "on" => Ok(Command::Think(true)),
            "off" => Ok(Command::Think(false)),
            _ => Err("usage: /think on|off".to_string()),
        },
        "attach" if !arg.is_empty() => Ok(Command::Attach(PathBuf::from(arg))),
        "attach" => Err("usage: /attach <path>".to_string()),
        "detach" => Ok(Command::Detach),
        "export" => Ok(Command::Export((!arg.is_empty()).then(|| PathBuf::from(arg)))),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        other => Err(format!("unknown command /{} (try /help)", other)),
    };
    Some(command)
}

/// Prints a streaming reply as its message grows.
#[derive(Default)]
struct ReplyPrinter {
    content_chars: usize,
    thinking_chars: usize,
}

impl ReplyPrinter {
    fn show(&mut self, content: &str, thinking: Option<&str>) {
        let mut out = std::io::stdout().lock();
        if let Some(thinking) = thinking {
            let fresh: String = thinking.chars().skip(self.thinking_chars).collect();
            if !fresh.is_empty() {
                if self.thinking_chars == 0 {
                    let _ = write!(out, "[thinking] ");
                }
                let _ = write!(out, "{}", fresh);
                self.thinking_chars += fresh.chars().count();
            }
        }
        let total = content.chars().count();
        if total < self.content_chars {
            // Replaced rather than extended, e.g. by an error block.
            let _ = write!(out, "\n{}", content);
        } else {
            if self.content_chars == 0 && total > 0 && self.thinking_chars > 0 {
                let _ = writeln!(out, "\n");
            }
            let fresh: String = content.chars().skip(self.content_chars).collect();
            let _ = write!(out, "{}", fresh);
        }
        self.content_chars = total;
        let _ = out.flush();
    }
}

pub struct Repl {
    orchestrator: Arc<Orchestrator>,
    ingestor: FileIngestor,
    pending: Vec<FileAttachment>,
}

impl Repl {
    pub fn new(orchestrator: Arc<Orchestrator>, ingestor: FileIngestor) -> Self {
        Self {
            orchestrator,
            ingestor,
            pending: Vec::new(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        println!("DeskChat. Type /help for commands.");
        self.print_model_status();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            let _ = std::io::stdout().flush();
            let Some(line) = lines.next_line().await.context("failed to read input")? else {
                break;
            };
            match parse(&line) {
                None => continue,
                Some(Err(message)) => println!("{}", message),
                Some(Ok(Command::Quit)) => break,
                Some(Ok(command)) => {
                    if let Err(e) = self.execute(command).await {
                        println!("error: {:#}", e);
                    }
                }
            }
        }
        Ok(())
    }

    fn print_model_status(&self) {
        match self.orchestrator.settings().current_model() {
            Some(model) => println!("Model: {} ({})", model.name, model.base_url),
            None => println!(
                "No model configured. Set {} and {} (and {}) to register one.",
                crate::config::BASE_URL_ENV,
                crate::config::MODEL_ENV,
                crate::config::API_KEY_ENV
            ),
        }
    }

    async fn execute(&mut self, command: Command) -> Result<()> {
        let sessions = self.orchestrator.sessions().clone();
        let settings = self.orchestrator.settings().clone();
        match command {
            Command::Send(text) => {
                let attachments = std::mem::take(&mut self.pending);
                let events = sessions.subscribe();
                let orchestrator = self.orchestrator.clone();
                let turn = tokio::spawn(async move { orchestrator.send(&text, attachments).await });
                self.follow(turn, events).await?;
            }
            Command::Regenerate => {
                let session_id = sessions
                    .current_session_id()
                    .context("no conversation selected")?;
                let events = sessions.subscribe();
                let orchestrator = self.orchestrator.clone();
                let turn =
                    tokio::spawn(async move { orchestrator.regenerate(&session_id).await });
                self.follow(turn, events).await?;
            }
            Command::New => {
                sessions.create_session();
                println!("Started a new conversation.");
            }
            Command::List => {
                let current = sessions.current_session_id();
                for (i, session) in sessions.sessions().iter().enumerate() {
                    let marker = if current.as_deref() == Some(session.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{} {:>2}. {} ({} messages, {})",
                        marker,
                        i + 1,
                        session.title,
                        session.messages.len(),
                        session.updated_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            Command::Switch(n) => {
                let session = sessions
                    .sessions()
                    .into_iter()
                    .nth(n - 1)
                    .context("no such conversation")?;
                sessions.select_session(&session.id);
                println!("Switched to \"{}\".", session.title);
            }
            Command::History => {
                let session = sessions.current_session().context("no conversation selected")?;
                for (i, message) in session.messages.iter().enumerate() {
                    println!("{:>3}. [{}] {}", i + 1, message.role.as_str(), message.content);
                }
            }
            Command::Delete(n) => {
                let session = sessions.current_session().context("no conversation selected")?;
                let message = session.messages.get(n - 1).context("no such message")?;
                let removed = self
                    .orchestrator
                    .delete_message_pair(&session.id, &message.id)?;
                println!("Deleted {} message(s).", removed.len());
            }
            Command::Models => {
                let current = settings.current_model().map(|m| m.id);
                for (i, model) in settings.models().iter().enumerate() {
                    let marker = if current.as_deref() == Some(model.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{} {:>2}. {} [{}] {} key {}{}",
                        marker,
                        i + 1,
                        model.name,
                        model.platform,
                        model.base_url,
                        model.api_key,
                        if model.is_multimodal { " (multimodal)" } else { "" }
                    );
                }
            }
            Command::Model(n) => {
                let model = settings
                    .models()
                    .into_iter()
                    .nth(n - 1)
                    .context("no such model")?;
                settings.set_current_model(&model.id);
                println!("Using {}.", model.name);
            }
            Command::Think(enabled) => {
                settings.set_deep_thinking(enabled);
                println!("Deep thinking {}.", if enabled { "on" } else { "off" });
            }
            Command::Attach(path) => {
                let file = UploadedFile::from_path(&path).await?;
                for attachment in self.ingestor.process_files(&[file]) {
                    println!(
                        "Attached {} as {} ({} bytes).",
                        attachment.name,
                        attachment.kind.as_str(),
                        attachment.size
                    );
                    self.pending.push(attachment);
                }
            }
            Command::Detach => {
                println!("Dropped {} attachment(s).", self.pending.len());
                self.pending.clear();
            }
            Command::Export(path) => {
                let session_id = sessions
                    .current_session_id()
                    .context("no conversation selected")?;
                let markdown = sessions
                    .export_markdown(&session_id)
                    .context("no conversation selected")?;
                match path {
                    Some(path) => {
                        tokio::fs::write(&path, markdown)
                            .await
                            .with_context(|| format!("failed to write {}", path.display()))?;
                        println!("Exported to {}.", path.display());
                    }
                    None => println!("{}", markdown),
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
        }
        Ok(())
    }

    /// Print the reply as it streams until the turn ends. Ctrl-C stops it.
    async fn follow(
        &self,
        mut turn: tokio::task::JoinHandle<Result<TurnOutcome, agent_host::TurnError>>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> Result<()> {
        let sessions = self.orchestrator.sessions().clone();
        let mut printer = ReplyPrinter::default();
        let mut reply_id: Option<String> = None;

        let outcome = loop {
            tokio::select! {
                result = &mut turn => break result.context("generation task failed")??,
                event = events.recv() => match event {
                    Ok(SessionEvent::MessageAdded { session_id, message_id }) => {
                        let is_reply = sessions
                            .session(&session_id)
                            .and_then(|s| s.message(&message_id).map(|m| m.role))
                            == Some(shared::Role::Assistant);
                        if is_reply {
                            reply_id = Some(message_id);
                        }
                    }
                    Ok(SessionEvent::MessageUpdated { session_id, message_id })
                        if reply_id.as_deref() == Some(message_id.as_str()) =>
                    {
                        if let Some(message) = sessions
                            .session(&session_id)
                            .and_then(|s| s.message(&message_id).cloned())
                        {
                            printer.show(&message.content, message.thinking_content.as_deref());
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "display fell behind the stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                _ = tokio::signal::ctrl_c() => {
                    self.orchestrator.stop();
                }
            }
        };

        // Catch up on anything the event stream skipped.
        if let Some(message) = sessions
            .session(&outcome.session_id)
            .and_then(|s| s.message(&outcome.assistant_message_id).cloned())
        {
            printer.show(&message.content, message.thinking_content.as_deref());
        }
        match outcome.status {
            TurnStatus::Completed | TurnStatus::Failed => println!(),
            TurnStatus::Cancelled => println!("\n(stopped)"),
        }
        Ok(())
    }
}
