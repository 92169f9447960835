//! Skycache - command-line driver for the offline caching agent.
//!
//! Runs lifecycle operations, resolves single requests and speaks the
//! control protocol as line-delimited JSON on stdin/stdout.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use skycache_core::net::OfflineNetwork;
use skycache_core::{Agent, AgentConfig, Request};
use url::Url;

const USAGE: &str = "\
Usage: skycache [--config <path>] <command>

Commands:
  install               Populate the active cache from the asset manifest
  activate              Delete caches left behind by other builds
  get <url> [--offline] [--html]
                        Resolve a request through the fallback chain;
                        --html requests a page (falls back to the cached root)
  command '<json>'      Run one control command and print the reply
  serve                 Read commands from stdin, one JSON object per line";

/// Log file name prefix inside the logs directory
const LOG_FILE_NAME: &str = "skycache.log";

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &AgentConfig) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file = config
        .data_dir()
        .ok()
        .map(|dir| dir.join("logs"))
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| tracing_appender::rolling::daily(dir, LOG_FILE_NAME))
        .map(tracing_appender::non_blocking);

    let (file_layer, guard) = match file {
        Some((writer, guard)) => (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn load_config(path: Option<PathBuf>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::load_from(&path)?,
        None => AgentConfig::load()?,
    };
    config.apply_env()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = PathBuf::from(args.remove(i + 1));
            args.remove(i);
            Some(path)
        }
        Some(_) => bail!("--config needs a path\n\n{}", USAGE),
        None => None,
    };

    let config = load_config(config_path)?;
    let _log_guard = init_tracing(&config);
    info!(build = %config.build_id, cache = %config.active_namespace(), "Skycache starting");

    match args.first().map(String::as_str) {
        Some("install") => install(config).await,
        Some("activate") => activate(config).await,
        Some("get") => {
            let Some(url) = args.get(1) else {
                bail!("get needs a URL\n\n{}", USAGE);
            };
            let flag = |name: &str| args.iter().skip(2).any(|a| a == name);
            get(config, url, flag("--offline"), flag("--html")).await
        }
        Some("command") => {
            let Some(raw) = args.get(1) else {
                bail!("command needs a JSON message\n\n{}", USAGE);
            };
            command(config, raw).await
        }
        Some("serve") => serve(config).await,
        Some("-h") | Some("--help") | None => {
            println!("{}", USAGE);
            Ok(())
        }
        Some(other) => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

async fn install(config: AgentConfig) -> Result<()> {
    let agent = Agent::open(config)?;
    match agent.install().await {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => eprintln!("Install already running"),
    }
    Ok(())
}

async fn activate(config: AgentConfig) -> Result<()> {
    let agent = Agent::open(config)?;
    match agent.activate().await {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => eprintln!("Activate already running"),
    }
    Ok(())
}

async fn get(config: AgentConfig, raw_url: &str, offline: bool, html: bool) -> Result<()> {
    let url = config
        .origin
        .join(raw_url)
        .with_context(|| format!("Invalid URL: {}", raw_url))?;

    let agent = if offline {
        Agent::open_with_network(config, Arc::new(OfflineNetwork))?
    } else {
        Agent::open(config)?
    };

    let request = build_request(url, html);
    let resolution = agent.fetch(&request).await?;
    eprintln!(
        "{} {:?}{}",
        resolution.response.status,
        resolution.source,
        resolution
            .response
            .stored_at
            .map(|at| format!(" (stored {})", at.to_rfc3339()))
            .unwrap_or_default()
    );

    let mut stdout = io::stdout().lock();
    stdout.write_all(&resolution.response.body)?;
    stdout.flush()?;
    Ok(())
}

/// Plain GET by default, so an uncached asset resolves to the offline
/// response instead of the cached root page.
fn build_request(url: Url, html: bool) -> Request {
    if html {
        Request::document(url)
    } else {
        Request::get(url)
    }
}

async fn command(config: AgentConfig, raw: &str) -> Result<()> {
    let agent = Agent::open(config)?;
    let reply = agent.handle_message(raw).await;
    println!("{}", reply.to_json());
    Ok(())
}

/// Install, activate, then answer commands from stdin until EOF.
///
/// Broadcast notifications are interleaved with replies on stdout.
async fn serve(config: AgentConfig) -> Result<()> {
    let agent = Arc::new(Agent::open(config)?);
    agent.install().await;
    agent.activate().await;

    let client = agent.client();
    let mut notifications = agent.subscribe();
    let running = tokio::spawn(Arc::clone(&agent).run());

    let echo = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => match serde_json::to_string(&notification) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to serialize notification"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Dropped notifications for slow output");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match client.send_raw(line).await {
            Ok(reply) => println!("{}", reply.to_json()),
            Err(e) => {
                warn!(error = %e, "Command got no reply");
                println!(
                    "{}",
                    skycache_core::ReplyEnvelope::failure(e.to_string()).to_json()
                );
            }
        }
    }

    agent.shutdown().await;
    echo.abort();
    running.await.context("Agent task panicked")??;
    info!("Skycache stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_sends_plain_request_by_default() {
        let url = Url::parse("https://weather.example/missing.js").unwrap();
        assert!(!build_request(url.clone(), false).accepts_html());
        assert!(build_request(url, true).accepts_html());
    }
}
