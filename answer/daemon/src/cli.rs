//! Command line interface
//!
//! ```bash
//! # Serve with defaults ($XDG_CONFIG_HOME/answer-relay/answer.toml if present)
//! answer-daemon serve
//!
//! # Override the listen address and knowledge file, keep answers in memory
//! answer-daemon serve --bind 0.0.0.0:8787 --knowledge ./knowledge.json --dry-run
//!
//! # Ask a running daemon
//! answer-daemon ask "什么是正当防卫"
//!
//! # Show the effective configuration
//! answer-daemon check-config --config ./answer.toml
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;

use answer_core::transport::ClientFrameDecoder;
use answer_core::{AnswerRequest, ClientFrame, ConfigOverrides};

/// Streaming answer daemon for the study assistant
#[derive(Parser, Debug)]
#[command(name = "answer-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ANSWER_CONFIG", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "ANSWER_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands; `serve` when omitted
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server
    Serve(ServeArgs),
    /// Stream an answer from a running daemon
    Ask(AskArgs),
    /// Load, validate and print the effective configuration
    CheckConfig,
}

/// Options for `serve`
#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Listen address
    #[arg(short = 'b', long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Completion model
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Knowledge index file (JSON)
    #[arg(short = 'k', long, value_name = "PATH")]
    pub knowledge: Option<PathBuf>,

    /// Upstream base URL
    #[arg(long, value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Keep answers in memory and extract knowledge locally
    #[arg(long)]
    pub dry_run: bool,
}

impl ServeArgs {
    /// Command line overrides for the loaded configuration
    #[must_use]
    pub fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(bind) = &self.bind {
            overrides = overrides.with_bind_addr(bind.clone());
        }
        if let Some(model) = &self.model {
            overrides = overrides.with_model(model.clone());
        }
        if let Some(path) = &self.knowledge {
            overrides = overrides.with_knowledge_path(path.clone());
        }
        if let Some(url) = &self.upstream_url {
            overrides = overrides.with_upstream_url(url.clone());
        }
        overrides
    }
}

/// Options for `ask`
#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    /// Daemon base URL
    #[arg(short = 'u', long, default_value = "http://127.0.0.1:8787")]
    pub url: String,

    /// Subject label, e.g. 刑法
    #[arg(short = 's', long)]
    pub subject: Option<String>,

    /// Image reference sent with the question
    #[arg(short = 'i', long)]
    pub image: Option<String>,

    /// Session id the answer is stored under
    #[arg(long)]
    pub session: Option<String>,

    /// The question
    pub question: String,
}

impl AskArgs {
    fn request(&self) -> AnswerRequest {
        AnswerRequest {
            question: self.question.clone(),
            image_ref: self.image.clone(),
            subject: self.subject.clone(),
            session_id: self.session.clone(),
        }
    }
}

/// Stream an answer and write it to `out`
///
/// Content goes to `out` as it arrives; notices and diagnostics go to
/// stderr. Returns the full streamed text.
///
/// # Errors
///
/// Returns an error if the daemon cannot be reached or rejects the
/// request.
pub async fn ask<W: Write>(args: &AskArgs, out: &mut W) -> Result<String> {
    let endpoint = format!("{}/api/answer/stream", args.url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&endpoint)
        .json(&args.request())
        .send()
        .await
        .with_context(|| format!("Failed to reach {endpoint}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("daemon returned {status}: {body}");
    }

    let mut decoder = ClientFrameDecoder::new();
    let mut stream = response.bytes_stream();
    let mut text = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Stream interrupted")?;
        for frame in decoder.push(&chunk) {
            if render(&frame, out, &mut text)? {
                return Ok(text);
            }
        }
    }
    for frame in decoder.finish() {
        render(&frame, out, &mut text)?;
    }
    Ok(text)
}

/// Write one frame; returns `true` on the terminal frame
fn render<W: Write>(frame: &ClientFrame, out: &mut W, text: &mut String) -> Result<bool> {
    match frame {
        ClientFrame::Init => {}
        ClientFrame::Content { text: delta } => {
            out.write_all(delta.as_bytes())?;
            out.flush()?;
            text.push_str(delta);
        }
        ClientFrame::ModerationNotice { message } => eprintln!("\n[moderation] {message}"),
        ClientFrame::Error { message } => eprintln!("[upstream] {message}"),
        ClientFrame::Done => {
            writeln!(out)?;
            return Ok(true);
        }
    }
    Ok(false)
}
