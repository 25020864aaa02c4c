//! Coach Chat - Terminal Client for the Coaching Backend
//!
//! Sends questions to the coaching backend and prints the streamed answer as
//! it arrives, followed by the sources it cites.
//!
//! # Usage
//!
//! ```bash
//! # One question, default agent
//! coach-chat "How should our PLC review common assessment data?"
//!
//! # Interactive session with the curriculum coach
//! coach-chat --agent classroom_curriculum
//!
//! # Another backend, verbose logging
//! RUST_LOG=debug coach-chat --url https://coach.example.org "..."
//! ```
//!
//! # Interactive Commands
//!
//! - `/agent <name>`: switch agent (starts a new conversation)
//! - `/agents`: list agents
//! - `/clear`: start a new conversation
//! - `/history`: show the transcript
//! - `/quit`: exit
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C): cancel the answer being streamed; at the prompt,
//!   exit.

mod render;

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use coach_core::backend::ChatTransport;
use coach_core::{
    default_config_path, load_config_from_path, AgentId, ClientConfig, ConfigOverrides,
    HttpChatBackend, Outcome, StreamSession, StreamUpdate, TurnOutcome,
};

/// Coach Chat - streaming terminal client for the coaching assistant
#[derive(Parser, Debug)]
#[command(name = "coach-chat")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Question to ask; starts an interactive session when omitted
    query: Vec<String>,

    /// Agent to talk to (professional_learning, classroom_curriculum)
    #[arg(short = 'a', long, value_name = "AGENT")]
    agent: Option<AgentId>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "COACH_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(short = 'u', long, value_name = "URL")]
    url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Seconds without data before an answer is abandoned (0 = never)
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Check backend health and exit
    #[arg(long)]
    health: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "COACH_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

/// Initialize logging with the specified level
///
/// Logs go to stderr; stdout carries only the conversation.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("coach_chat={level},coach_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration and apply command-line overrides
fn load_settings(args: &Args) -> Result<ClientConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref url) = args.url {
        overrides = overrides.with_base_url(url.clone());
    }
    if let Some(ref token) = args.token {
        overrides = overrides.with_bearer_token(token.clone());
    }
    if let Some(agent) = args.agent {
        overrides = overrides.with_agent(agent);
    }
    if let Some(secs) = args.idle_timeout {
        overrides = overrides.with_idle_timeout_secs(secs);
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line options")?;

    info!(
        source = %config.source(),
        base_url = %config.base_url,
        agent = %config.default_agent,
        "Configuration loaded"
    );
    Ok(config)
}

/// Routes Ctrl-C to the turn being streamed, or to the prompt when idle
///
/// One signal listener serves the whole process; tokio keeps the handler
/// installed once registered.
#[derive(Clone, Default)]
struct Interrupts {
    /// Token of the turn in flight
    turn: Arc<Mutex<Option<CancellationToken>>>,
    /// Cancelled when Ctrl-C arrives with no turn in flight
    quit: CancellationToken,
}

impl Interrupts {
    /// Spawn the process-wide signal listener
    fn listen(&self) -> JoinHandle<()> {
        let interrupts = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !interrupts.interrupt() {
                    break;
                }
            }
        })
    }

    /// Handle one Ctrl-C; returns `false` once the client should exit
    fn interrupt(&self) -> bool {
        match self.active_turn() {
            Some(turn) => {
                debug!("Interrupt: cancelling turn");
                turn.cancel();
                true
            }
            None => {
                debug!("Interrupt: quitting");
                self.quit.cancel();
                false
            }
        }
    }

    fn active_turn(&self) -> Option<CancellationToken> {
        self.turn.lock().ok().and_then(|turn| turn.clone())
    }

    fn set_turn(&self, token: Option<CancellationToken>) {
        if let Ok(mut turn) = self.turn.lock() {
            *turn = token;
        }
    }

    /// Token for a new turn, registered as the interrupt target
    fn begin_turn(&self) -> CancellationToken {
        let token = self.quit.child_token();
        self.set_turn(Some(token.clone()));
        token
    }

    fn end_turn(&self) {
        self.set_turn(None);
    }
}

/// Print streamed text as it arrives
async fn print_updates(mut rx: mpsc::Receiver<StreamUpdate>) {
    let mut stdout = std::io::stdout();
    while let Some(update) = rx.recv().await {
        match update {
            StreamUpdate::Content { delta } => {
                let _ = write!(stdout, "{delta}");
                let _ = stdout.flush();
            }
            StreamUpdate::Citations { groups } => {
                debug!(sources = groups.len(), "Sources updated");
            }
            StreamUpdate::Started { .. } | StreamUpdate::Sealed { .. } => {}
        }
    }
}

/// Ask one question, streaming the answer to stdout
async fn ask(
    session: &mut StreamSession,
    backend: &HttpChatBackend,
    query: &str,
    update_buffer: usize,
    interrupts: &Interrupts,
) -> Result<TurnOutcome> {
    let cancel = interrupts.begin_turn();

    let (tx, rx) = mpsc::channel(update_buffer);
    let printer = tokio::spawn(print_updates(rx));

    let result = session.send(backend, query, &cancel, Some(&tx)).await;
    interrupts.end_turn();
    drop(tx);
    let _ = printer.await;

    let outcome = result?;
    match outcome.outcome {
        Outcome::Completed => {
            println!();
            if let Some(turn) = &outcome.turn {
                print!("{}", render::sources(&turn.citation_groups()));
            }
        }
        Outcome::Failed => {
            println!();
            if let Some(turn) = &outcome.turn {
                eprintln!("{}", turn.content);
            }
            if let Some(failure) = &outcome.failure {
                warn!(error = %failure, "Answer failed");
            }
        }
        Outcome::Cancelled(reason) => {
            println!();
            eprintln!("(cancelled: {reason})");
        }
    }
    let _ = std::io::stdout().flush();
    Ok(outcome)
}

/// Handle a `/command`; returns `false` to quit
fn handle_command(session: &mut StreamSession, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("/quit" | "/exit") => return Ok(false),
        Some("/clear") => {
            session.clear()?;
            println!("New conversation with {}", session.agent().display_name());
        }
        Some("/agents") => {
            for agent in AgentId::ALL {
                let marker = if agent == session.agent() { '*' } else { ' ' };
                println!("{marker} {agent:<22} {}", agent.display_name());
            }
        }
        Some("/agent") => match parts.next().map(str::parse::<AgentId>) {
            Some(Ok(agent)) => {
                session.switch_agent(agent)?;
                println!("Now talking to {}", agent.display_name());
            }
            Some(Err(e)) => eprintln!("{e}"),
            None => eprintln!("usage: /agent <name>"),
        },
        Some("/history") => {
            for turn in session.transcript() {
                println!("{}", render::turn_line(turn));
            }
        }
        Some(other) => eprintln!("unknown command '{other}'"),
        None => {}
    }
    Ok(true)
}

/// Read questions from stdin until EOF or `/quit`
async fn interactive(
    session: &mut StreamSession,
    backend: &HttpChatBackend,
    update_buffer: usize,
    interrupts: &Interrupts,
) -> Result<()> {
    println!(
        "Talking to {}. /agents, /agent <name>, /clear, /history, /quit",
        session.agent().display_name()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let next = tokio::select! {
            () = interrupts.quit.cancelled() => None,
            line = lines.next_line() => line?,
        };
        let Some(line) = next else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            if !handle_command(session, line)? {
                break;
            }
            continue;
        }

        if let Err(e) = ask(session, backend, line, update_buffer, interrupts).await {
            eprintln!("{e}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load_settings(&args)?;
    let backend = HttpChatBackend::from_config(&config);

    if args.health {
        let healthy = backend.health_check().await;
        println!(
            "{}: {}",
            backend.base_url(),
            if healthy { "healthy" } else { "unreachable" }
        );
        if !healthy {
            anyhow::bail!("Backend health check failed");
        }
        return Ok(());
    }

    let mut session =
        StreamSession::new(config.default_agent).with_options(config.stream_options());
    let interrupts = Interrupts::default();
    let listener = interrupts.listen();

    if args.query.is_empty() {
        let result = interactive(&mut session, &backend, config.update_buffer, &interrupts).await;
        listener.abort();
        return result;
    }

    let query = args.query.join(" ");
    let outcome = ask(&mut session, &backend, &query, config.update_buffer, &interrupts).await;
    listener.abort();
    let outcome = outcome?;
    match outcome.outcome {
        Outcome::Completed => Ok(()),
        Outcome::Failed => Err(anyhow::anyhow!(
            "{}",
            outcome
                .failure
                .map_or_else(|| "request failed".to_string(), |e| e.to_string())
        )),
        Outcome::Cancelled(reason) => Err(anyhow::anyhow!("Request cancelled ({reason})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_cancels_only_the_active_turn() {
        let interrupts = Interrupts::default();
        let first = interrupts.begin_turn();
        assert!(interrupts.interrupt());
        assert!(first.is_cancelled());
        assert!(!interrupts.quit.is_cancelled());
        interrupts.end_turn();

        // A later turn gets a fresh token and stays interruptible
        let second = interrupts.begin_turn();
        assert!(!second.is_cancelled());
        assert!(interrupts.interrupt());
        assert!(second.is_cancelled());
        interrupts.end_turn();
    }

    #[test]
    fn test_interrupt_at_prompt_quits() {
        let interrupts = Interrupts::default();
        assert!(!interrupts.interrupt());
        assert!(interrupts.quit.is_cancelled());
        assert!(interrupts.begin_turn().is_cancelled());
    }

    #[test]
    fn test_end_turn_clears_target() {
        let interrupts = Interrupts::default();
        let token = interrupts.begin_turn();
        interrupts.end_turn();
        assert!(interrupts.active_turn().is_none());
        assert!(!token.is_cancelled());
    }
}
