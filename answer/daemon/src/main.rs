//! Answer Daemon - Streaming Answer Server
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! answer-daemon
//!
//! # With config file and a knowledge index
//! answer-daemon --config /etc/answer-relay/answer.toml serve --knowledge knowledge.json
//!
//! # Verbose logging
//! RUST_LOG=debug answer-daemon serve
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop accepting streams, cancel in-flight ones,
//!   then exit once open responses have finished

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use answer_core::{load_config_from_path, AnswerPipeline, PipelineConfig};
use answer_daemon::cli::{self, Cli, Command, ServeArgs};
use answer_daemon::server::{self, AppState};

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("answer_daemon={level},answer_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Load configuration with CLI overrides applied
fn load(cli: &Cli, args: &ServeArgs) -> Result<PipelineConfig> {
    let mut config = load_config_from_path(cli.config.clone())?;
    args.overrides().apply(&mut config);
    if args.dry_run {
        config.store.answers_path = None;
        config.store.extraction_url = None;
    }
    config.validate()?;
    Ok(config)
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to install SIGINT handler")?;
                info!("Received SIGINT, initiating shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
        info!("Received Ctrl+C, initiating shutdown");
    }

    Ok(())
}

async fn run_serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let config = load(cli, args)?;
    info!(
        source = %config.source(),
        model = %config.upstream.model,
        upstream = %config.upstream.base_url,
        "Configuration loaded"
    );

    let addr: SocketAddr = config
        .server
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind_addr))?;

    let pipeline = AnswerPipeline::from_config(&config)
        .await
        .context("Failed to build the answer pipeline")?;
    let state = AppState::new(pipeline, &config.server);

    let signal_state = state.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                signal_state.begin_shutdown();
            }
            Err(e) => error!(error = %e, "Signal handling unavailable"),
        }
    });

    server::serve(state, addr).await?;
    info!("Answer daemon stopped cleanly");
    Ok(())
}

fn run_check_config(cli: &Cli) -> Result<()> {
    let config = load(cli, &ServeArgs::default())?;
    match &config.config_file_path {
        Some(path) => println!("# file: {}", path.display()),
        None => println!("# file: none (defaults)"),
    }
    println!("# source: {}", config.source());
    print!("{}", config.to_redacted_toml());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match &cli.command {
        None => run_serve(&cli, &ServeArgs::default()).await,
        Some(Command::Serve(args)) => run_serve(&cli, args).await,
        Some(Command::Ask(args)) => {
            let mut stdout = std::io::stdout();
            cli::ask(args, &mut stdout).await.map(|_| ())
        }
        Some(Command::CheckConfig) => run_check_config(&cli),
    }
}
