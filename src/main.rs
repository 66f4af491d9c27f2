//! Tether - interruptible agent sessions over a typed event stream
//!
//! CLI entry point: run the server, chat with it, or diagnose a setup.

// Allow multiple crate versions from dependencies (can't easily control)
#![allow(clippy::multiple_crate_versions)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tether::cli::{render_diagnostic_report, PermissionPrompt, TurnDisplay};
use tether::client::{ChannelHandler, ConsumerUpdate, HttpTransport, StreamConsumer, TurnOutcome};
use tether::doctor::{config_failure, diagnose};
use tether::protocol::{StartRequest, StreamEvent};
use tether::ratelimit::{RateLimitState, RateLimiter};
use tether::server::{self, build_app, AppState};
use tether::{CliLauncher, JsonlSessionStore, Orchestrator, TetherConfig};

/// Interruptible coding-agent sessions over a typed event stream
///
/// Runs one agent process per session turn, streams its output as ordered
/// events, and lets clients grant or deny tool use mid-turn.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Path to tether.toml (defaults to ./tether.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, overriding [server] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Send one prompt to a running server and render the turn
    Chat {
        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,

        /// Session to continue (a new one is created when omitted)
        #[arg(long)]
        session: Option<String>,

        /// Model to request
        #[arg(long)]
        model: Option<String>,

        /// Path to tether.toml, for [client] settings
        #[arg(long)]
        config: Option<PathBuf>,

        /// The prompt
        prompt: String,
    },

    /// Check the agent installation and configuration
    Doctor {
        /// Path to tether.toml (defaults to ./tether.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<TetherConfig> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    TetherConfig::load(path, &cwd)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, bind } => serve(config.as_deref(), bind).await,
        Command::Chat {
            url,
            session,
            model,
            config,
            prompt,
        } => chat(&url, session, model, config.as_deref(), prompt).await,
        Command::Doctor { config } => doctor(config.as_deref()),
    }
}

async fn serve(config_path: Option<&Path>, bind: Option<String>) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
        config.validate()?;
    }
    let addr = config.bind_addr()?;

    let store = JsonlSessionStore::open(&config.store.dir).with_context(|| {
        format!(
            "Failed to open turn history in {}",
            config.store.dir.display()
        )
    })?;
    let orchestrator = Orchestrator::new(
        Arc::new(CliLauncher),
        Arc::new(store),
        config.orchestrator_settings(),
    );

    let shutdown = CancellationToken::new();
    let limits = config.rate_limits();
    let limiter = Arc::new(RateLimiter::new(config.sweep_interval()));
    let sweeper =
        Arc::clone(&limiter).spawn_sweeper(limits.window, config.sweep_interval(), shutdown.clone());

    let app = build_app(
        AppState::new(orchestrator.clone(), config.keep_alive()),
        RateLimitState { limiter, limits },
    );
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            let cancelled = orchestrator.cancel_all();
            info!(cancelled, "shutting down");
            shutdown.cancel();
        }
    };

    server::serve(listener, app, signal)
        .await
        .context("Server failed")?;
    shutdown.cancel();
    let _ = sweeper.await;
    Ok(ExitCode::SUCCESS)
}

async fn chat(
    url: &str,
    session: Option<String>,
    model: Option<String>,
    config_path: Option<&Path>,
    prompt: String,
) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());

    let consumer = StreamConsumer::new(
        Arc::new(HttpTransport::new(url)),
        session_id.clone(),
        config.consumer_settings(),
    );
    let mut request = StartRequest::new(prompt);
    request.options.model = model;

    let mut display = TurnDisplay::new(&session_id);
    display.print_header();

    let (handler, mut updates) = ChannelHandler::new();
    let task = consumer.connect(request, handler)?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut prompt = PermissionPrompt::new();

    // stdin is only read while a question is open; updates and ctrl-c stay live meanwhile
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                consumer.cancel().await;
                break;
            }
            line = stdin.next_line(), if prompt.is_waiting() => {
                let line = line.context("Failed to read permission answer")?;
                match prompt.answer(line.as_deref()) {
                    Some(outcome) => {
                        if let Err(e) = consumer.decide(outcome).await {
                            warn!(error = %e, "permission decision was not accepted");
                        }
                    }
                    None => {
                        eprintln!("  Please answer y, n, a, or d");
                        if let Some(request) = prompt.pending() {
                            display.render_permission_prompt(request);
                        }
                    }
                }
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                match update {
                    ConsumerUpdate::Event(event) => {
                        display.render_event(&event);
                        if let Some(request) = prompt.observe(&event) {
                            display.render_permission_prompt(request);
                        }
                    }
                    ConsumerUpdate::State(state) => display.render_state(state),
                    ConsumerUpdate::Gap(_) => {
                        prompt.clear();
                        display.render_gap();
                    }
                    ConsumerUpdate::Error(message) => warn!(session_id = %session_id, "{message}"),
                }
            }
        }
    }

    match task.await.context("Stream consumer task failed")? {
        TurnOutcome::Finished(StreamEvent::Result(result)) if !result.is_error => {
            Ok(ExitCode::SUCCESS)
        }
        TurnOutcome::Finished(_) => Ok(ExitCode::FAILURE),
        TurnOutcome::Cancelled => Ok(ExitCode::from(130)),
        TurnOutcome::Failed(e) => Err(e).context("Stream failed"),
    }
}

fn doctor(config_path: Option<&Path>) -> Result<ExitCode> {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            render_diagnostic_report(&config_failure(&e));
            return Ok(ExitCode::FAILURE);
        }
    };

    let history = if config.store.dir.exists() {
        JsonlSessionStore::open(&config.store.dir)
            .and_then(|store| store.read_all())
            .with_context(|| format!("Failed to read turn history in {}", config.store.dir.display()))?
    } else {
        Vec::new()
    };

    let path_var = std::env::var_os("PATH");
    let report = diagnose(&config, &history, path_var.as_deref());
    render_diagnostic_report(&report);

    Ok(if report.error_count() > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
