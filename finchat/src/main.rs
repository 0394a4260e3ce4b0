//! `FinChat` — line-oriented chat client for the finchat assistant backend.
//!
//! Reads lines from stdin and prints conversation events to stdout.
//! Configuration via CLI flags, environment variables, or a config file
//! (`~/.config/finchat/config.toml`).
//!
//! ```bash
//! # Connect with an externally-issued token
//! cargo run --bin finchat -- --server-url ws://127.0.0.1:8000/ws/chat \
//!     --token my-session-token --user alice
//!
//! # Or via environment variables
//! FINCHAT_SERVER_URL=ws://127.0.0.1:8000/ws/chat FINCHAT_TOKEN=t cargo run
//! ```
//!
//! In-session commands: `/clear`, `/logout`, `/quit`. Anything else is
//! sent as a message.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use finchat::config::{CliArgs, ClientConfig};
use finchat::conversation::DeliveryState;
use finchat::net::{self, SessionCommand, SessionEvent};
use finchat::session::store::FileStore;
use finchat::session::{
    AuthBackend, AuthSignal, LoginError, LoginResponse, SessionCredentials, SessionManager,
    UserIdentity, VerifyError,
};

/// Identity backend for the CLI: tokens are supplied by the operator
/// (`--token`) and the socket handshake is the authority on their
/// validity, so local confirmation only checks that a token is present.
/// Login is not available without an identity service.
struct CliAuth;

impl AuthBackend for CliAuth {
    async fn login(&self, _username: &str, _password: &str) -> Result<LoginResponse, LoginError> {
        Err(LoginError::ServerError(
            "no identity service configured; supply --token".into(),
        ))
    }

    async fn verify(&self, token: &str) -> Result<UserIdentity, VerifyError> {
        if token.is_empty() {
            return Err(VerifyError::Rejected("empty token".into()));
        }
        Ok(UserIdentity {
            user_id: "(stored)".into(),
        })
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("finchat starting");

    let store = match config.credentials_path.clone() {
        Some(path) => FileStore::new(path),
        None => match FileStore::default_location() {
            Ok(s) => s,
            Err(e) => {
                eprintln!("No usable credential storage: {e}");
                return Ok(());
            }
        },
    };
    let session = Arc::new(SessionManager::new(CliAuth, store));

    // An operator-supplied token wins over the stored record.
    if let Some(token) = cli.token.clone() {
        session.adopt(SessionCredentials {
            token,
            user_id: cli.user.clone().unwrap_or_else(|| "me".into()),
            expires_at: None,
        });
    } else {
        match session.restore().await {
            AuthSignal::Authenticated(identity) => {
                println!("* restored session for {}", identity.user_id);
            }
            AuthSignal::Unauthenticated { reason } => {
                let reason = reason.unwrap_or_else(|| "no stored session".into());
                eprintln!("Not signed in ({reason}); supply --token");
                return Ok(());
            }
        }
    }

    if config.server_url.is_none() {
        eprintln!("No server URL configured; use --server-url or the config file");
        return Ok(());
    }

    let mut handle = net::spawn_session(config, Arc::clone(&session));
    let _ = handle.commands.send(SessionCommand::Connect).await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
            line = stdin.next_line() => {
                let Ok(Some(line)) = line else {
                    let _ = handle.commands.send(SessionCommand::Close).await;
                    break;
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let cmd = match line.as_str() {
                    "/quit" => {
                        let _ = handle.commands.send(SessionCommand::Close).await;
                        break;
                    }
                    "/clear" => SessionCommand::ClearHistory,
                    "/logout" => SessionCommand::Logout,
                    "/retry" => {
                        // Resend the most recent failed entry, if any.
                        let failed = handle
                            .log_snapshot()
                            .into_iter()
                            .rev()
                            .find(|e| e.delivery == DeliveryState::Failed);
                        match failed {
                            Some(entry) => SessionCommand::ResendMessage { id: entry.id },
                            None => {
                                println!("* nothing to retry");
                                continue;
                            }
                        }
                    }
                    _ => SessionCommand::SendMessage { text: line },
                };
                if handle.commands.send(cmd).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!("finchat exiting");
    Ok(())
}

/// Render one session event as a line on stdout.
fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => {
            println!("* connection: {}", state.phase);
        }
        SessionEvent::EntryAppended(entry) => {
            let who = if entry.is_user { "you" } else { "assistant" };
            let marker = match entry.delivery {
                DeliveryState::Pending => " …",
                DeliveryState::Delivered | DeliveryState::Failed => "",
            };
            println!("{who}: {}{marker}", entry.text);
        }
        SessionEvent::EntryUpdated { id, delivery } => match delivery {
            DeliveryState::Delivered => println!("* delivered ({id})"),
            DeliveryState::Failed => println!("* failed ({id}) — resend with /retry"),
            DeliveryState::Pending => println!("* retrying ({id})"),
        },
        SessionEvent::HistoryCleared => println!("* history cleared"),
        SessionEvent::RemoteTyping { active } => {
            if *active {
                println!("* assistant is typing…");
            }
        }
        SessionEvent::AuthRequired { reason } => {
            println!("* please sign in again: {reason}");
        }
        SessionEvent::Notice(text) => println!("* {text}"),
    }
}

/// Initialize logging: stderr by default, a non-blocking file writer when
/// `--log-file` is given. The returned guard must be held until shutdown
/// so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if let Some(path) = file_path {
        let dir = path.parent()?;
        let file_name = path.file_name()?.to_str()?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_env_filter(env_filter)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        None
    }
}
