//! sessionkeeper - inspect and drive a stored session from the command line.
//!
//! Usage:
//!   sessionkeeper [--memory] status
//!   sessionkeeper [--memory] issue
//!   sessionkeeper [--memory] reset
//!   sessionkeeper [--memory] get <path>
//!
//! `--memory` keeps tokens in process memory instead of the OS keychain.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Local;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionkeeper_core::{ApiClient, Config, CredentialStore, KeyringStore, MemoryStore};

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

enum Command {
    Status,
    Issue,
    Reset,
    Get(String),
}

struct Args {
    memory: bool,
    command: Command,
}

fn parse_args() -> Result<Args> {
    let mut memory = false;
    let mut rest = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--memory" {
            memory = true;
        } else {
            rest.push(arg);
        }
    }

    let command = match rest.as_slice() {
        [] => Command::Status,
        [cmd] if cmd == "status" => Command::Status,
        [cmd] if cmd == "issue" => Command::Issue,
        [cmd] if cmd == "reset" => Command::Reset,
        [cmd, path] if cmd == "get" => Command::Get(path.clone()),
        _ => bail!("usage: sessionkeeper [--memory] <status|issue|reset|get <path>>"),
    };

    Ok(Args { memory, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();
    let args = parse_args()?;

    let mut config = Config::load()?;
    config.apply_env()?;
    info!(base_url = %config.base_url, "sessionkeeper starting");

    let store: Arc<dyn CredentialStore> = if args.memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(KeyringStore::new(config.keyring_service.clone()))
    };
    let client = ApiClient::new(config, store)?;
    let session = client.session();

    match args.command {
        Command::Status => {
            println!("state:   {}", session.state());
            println!(
                "subject: {}",
                session.subject().unwrap_or_else(|| "-".to_string())
            );
            let expired = session.access_token().is_some_and(|t| t.is_expired());
            match session.expires_at() {
                Some(exp) => println!(
                    "expires: {}{}",
                    exp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    if expired { " (expired)" } else { "" }
                ),
                None => println!("expires: -"),
            }
        }
        Command::Issue => match session.issue_tokens().await {
            Ok(pair) => println!(
                "issued tokens for {}",
                pair.access.subject().unwrap_or_else(|| "unknown subject".to_string())
            ),
            Err(e) if e.requires_reauthentication() => {
                bail!("session needs full re-registration: {}", e)
            }
            Err(e) => bail!("token issuance failed: {}", e),
        },
        Command::Reset => {
            session.reset()?;
            println!("session cleared");
        }
        Command::Get(path) => {
            let value: serde_json::Value = client.get(&path).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}
