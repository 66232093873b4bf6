//! Interactive chat loop.

use std::io::Write;

use agent_engine_core::{RemoteAgent, Session, SessionFeed, SessionStore};
use agent_engine_session::{ControllerError, SessionController};
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{
    interrupt::Interrupts,
    terminal::{ReplyPrinter, history_lines},
};

const HELP: &str = "\
Commands:
  /new            start a new session
  /sessions       list sessions
  /switch <id>    make another session active
  /history        show the active session's conversation
  /state          show the active session's server state
  /refresh        re-fetch the active session's server state
  /help           show this help
  /quit           exit
Anything else is sent to the agent. Ctrl-C interrupts a reply, or exits when idle.";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    New,
    Sessions,
    Switch(String),
    History,
    State,
    Refresh,
    Help,
    Quit,
    Empty,
}

fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };

    let (name, arg) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, arg)| (name, arg.trim()));
    match (name, arg) {
        ("new", "") => Ok(Command::New),
        ("sessions", "") => Ok(Command::Sessions),
        ("switch", "") => Err("usage: /switch <session id>".to_string()),
        ("switch", id) => Ok(Command::Switch(id.to_string())),
        ("history", "") => Ok(Command::History),
        ("state", "") => Ok(Command::State),
        ("refresh", "") => Ok(Command::Refresh),
        ("help", "") => Ok(Command::Help),
        ("quit" | "exit", "") => Ok(Command::Quit),
        _ => Err(format!("unknown command: /{rest} (try /help)")),
    }
}

/// Terminal front end over a controller whose presenter is `feed`.
pub struct Chat<'a, R, S>
where
    R: RemoteAgent,
    S: SessionStore,
{
    controller: &'a SessionController<R, S>,
    feed: &'a SessionFeed,
    interrupts: Interrupts,
}

impl<'a, R, S> Chat<'a, R, S>
where
    R: RemoteAgent,
    S: SessionStore,
{
    pub const fn new(
        controller: &'a SessionController<R, S>,
        feed: &'a SessionFeed,
        interrupts: Interrupts,
    ) -> Self {
        Self {
            controller,
            feed,
            interrupts,
        }
    }

    /// Send one message and exit.
    pub async fn one_shot(&self, message: &str) -> anyhow::Result<()> {
        eprintln!("--- User Query ---\n{message}\n--- Agent Response ---");
        self.send(message).await?;
        eprintln!("--- Stream Completed ---");
        Ok(())
    }

    /// Read commands from stdin until EOF, `/quit` or an idle Ctrl-C.
    pub async fn run(&self) -> anyhow::Result<()> {
        eprintln!("Type a message, or /help for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            prompt();
            let line = tokio::select! {
                biased;
                () = self.interrupts.quit().cancelled() => {
                    println!();
                    break;
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };

            let command = match parse(&line) {
                Ok(command) => command,
                Err(message) => {
                    eprintln!("{message}");
                    continue;
                }
            };

            let result = match command {
                Command::Empty => Ok(()),
                Command::Quit => break,
                Command::Help => {
                    eprintln!("{HELP}");
                    Ok(())
                }
                Command::Send(text) => self.send(&text).await,
                Command::New => self.new_session().await,
                Command::Sessions => self.list_sessions().await,
                Command::Switch(id) => self.switch_session(&id).await,
                Command::History => self.show_history().await,
                Command::State => self.show_state().await,
                Command::Refresh => self.controller.reconcile().await.map(|patch| {
                    eprintln!("Session state refreshed ({} changes)", patch.0.len());
                }),
            };

            if let Err(e) = result {
                eprintln!("Error: {e}");
            }
        }

        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), ControllerError> {
        let mut replies = self.feed.reply_stream();
        let mut printer = ReplyPrinter::new();

        let cancel = self.interrupts.begin();
        let reply = self.controller.send_message_with_cancel(text, &cancel);
        tokio::pin!(reply);
        let result = loop {
            tokio::select! {
                Some(text) = replies.next() => printer.show(&text),
                result = &mut reply => break result,
            }
        };
        self.interrupts.end();

        // Everything for this turn was published before the call returned.
        while let Some(Some(text)) = replies.next().now_or_never() {
            printer.show(&text);
        }
        printer.finish();

        match result {
            Ok(_) => Ok(()),
            Err(ControllerError::Stream(e)) => {
                eprintln!("[reply interrupted: {}]", e.source);
                Ok(())
            }
            Err(ControllerError::Cancelled) => {
                eprintln!("[reply cancelled]");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn new_session(&self) -> Result<(), ControllerError> {
        eprintln!("Creating a new session...");
        let session = self.controller.new_session().await?;
        eprintln!("New session created: {}", session.id());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<(), ControllerError> {
        let current = self.controller.current_session_id();
        let sessions = self.controller.sessions().await?;
        if sessions.is_empty() {
            eprintln!("No sessions yet.");
        }
        for session in sessions {
            let marker = if current.as_deref() == Some(session.id()) { '*' } else { ' ' };
            eprintln!("{marker} {} ({} turns)", session.id(), session.turns().len());
        }
        Ok(())
    }

    async fn switch_session(&self, id: &str) -> Result<(), ControllerError> {
        let session = self.controller.switch_session(id).await?;
        eprintln!("Active session: {}", session.id());
        print_history(&session);
        Ok(())
    }

    async fn show_history(&self) -> Result<(), ControllerError> {
        match self.controller.current_session().await? {
            Some(session) => print_history(&session),
            None => eprintln!("No active session."),
        }
        Ok(())
    }

    async fn show_state(&self) -> Result<(), ControllerError> {
        let Some(session) = self.controller.current_session().await? else {
            eprintln!("No active session.");
            return Ok(());
        };
        match serde_json::to_string_pretty(session.server_state()) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Could not render session state: {e}"),
        }
        Ok(())
    }
}

fn print_history(session: &Session) {
    if session.turns().is_empty() {
        eprintln!("(no messages yet)");
    }
    for line in history_lines(session.turns()) {
        println!("{line}");
    }
}

fn prompt() {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(b"> ");
    let _ = stdout.flush();
}
