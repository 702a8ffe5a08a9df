//! # Deep Research Agent
//!
//! Command-line front end for the `deep_research` workflow.
//!
//! Runs plan → research → write → quality against Exa / Firecrawl / Tavily
//! and a local (Ollama) or hosted (OpenAI) model, streaming progress as
//! server-sent events, JSON lines or plain text.
//!
//! ## Quick Start
//! ```bash
//! TAVILY_API_KEY=... cargo run -- "How are EU grid operators handling heat pump demand?"
//! ```

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Configuration management
mod config;

// =============================================================================
// IMPORTS
// =============================================================================
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use deep_research::{
    DonePayload, EventKind, LlmBackend, ResearchEngine, ThreadMemoryStore, WorkflowEvent,
};

use crate::config::Config;

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
/// How events are written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// `event: <name>\ndata: <json>\n\n` frames
    Sse,
    /// One `{"event", "data"}` object per line
    Json,
    /// Streamed report text with progress on stderr
    Text,
}

#[derive(Parser, Debug)]
#[command(
    name = "deep-research",
    version,
    about = "Multi-provider deep research: plan, search, write and review a cited report",
    long_about = r#"
Deep Research Agent

Breaks a question into prioritized sub-questions, searches Exa and Firecrawl
(Tavily as fallback), synthesizes evidence, streams a cited report, and
reviews it once for quality. Follow-up questions on the same thread reuse
earlier findings.

CONFIGURATION (environment or .env):
  EXA_API_KEY, FIRECRAWL_API_KEY, TAVILY_API_KEY   at least one is required
  LLM_PROVIDER=ollama|openai, LLM_MODEL, OLLAMA_API_BASE_URL

EXAMPLES:
  # One report, streamed as text
  deep-research "State of sodium-ion batteries for grid storage"

  # Server-sent events for a UI
  deep-research --format sse "Risks of open-weight model releases"

  # Follow-up session on one thread
  deep-research --interactive --thread-id batteries
"#
)]
struct Args {
    /// The research question (omit with --interactive)
    #[arg(value_name = "QUERY")]
    query: Option<String>,

    /// Thread to attach to; follow-ups on the same thread share memory
    #[arg(short = 't', long = "thread-id")]
    thread_id: Option<String>,

    /// Read questions from stdin, one per line, on a single thread
    #[arg(short = 'i', long = "interactive", default_value = "false")]
    interactive: bool,

    /// Output format
    #[arg(short = 'f', long = "format", value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Model name (overrides LLM_MODEL)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// Model provider: ollama or openai (overrides LLM_PROVIDER)
    #[arg(short = 'p', long = "provider")]
    provider: Option<LlmBackend>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", default_value = "false")]
    verbose: bool,
}

// =============================================================================
// MAIN FUNCTION
// =============================================================================
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose)?;

    let mut config = Config::from_env()?;
    if let Some(model) = args.model.clone() {
        info!(model = %model, "Using model from command line");
        config.model = Some(model);
    }
    if let Some(provider) = args.provider {
        config.llm_provider = provider;
    }
    config.validate()?;

    info!(
        provider = config.llm_provider.as_str(),
        model = config.model_name(),
        "Configuration loaded"
    );

    let engine = ResearchEngine::new(
        config.build_llm()?,
        Arc::new(config.build_router()),
        ThreadMemoryStore::in_memory(config.memory_config()),
    )
    .with_config(config.engine_config());

    if args.interactive {
        return repl(&engine, args.thread_id, args.format).await;
    }

    let query = args
        .query
        .context("A research question is required unless --interactive is set")?;
    let done = run_once(&engine, &query, args.thread_id, args.format).await?;
    if done.is_none() {
        anyhow::bail!("Research run ended without a report");
    }
    Ok(())
}

/// Run one query and render its events as they arrive.
///
/// Returns the final payload, or `None` when the run ended in a fatal error.
async fn run_once(
    engine: &ResearchEngine,
    query: &str,
    thread_id: Option<String>,
    format: OutputFormat,
) -> Result<Option<DonePayload>> {
    let mut handle = engine.run(query, thread_id);
    info!(thread_id = %handle.thread_id, query = %query, "Research started");

    let mut done = None;
    let mut stdout = std::io::stdout();
    while let Some(event) = handle.events.next().await {
        render(&mut stdout, &event, format).context("Failed to write event output")?;
        if let EventKind::Done(payload) = event.kind {
            done = Some(payload);
        }
    }

    let run = handle.finish().await;
    if let Err(err) = &run.result {
        error!(thread_id = %run.thread_id, error = %err, "Research failed");
    }
    Ok(done)
}

/// Question loop on one thread so follow-ups see earlier reports.
async fn repl(engine: &ResearchEngine, thread_id: Option<String>, format: OutputFormat) -> Result<()> {
    let thread_id = thread_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!("Interactive research session on thread {}. Enter a question, or 'exit' to quit.", thread_id);
    loop {
        eprint!("> ");
        std::io::stderr().flush().ok();

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "quit") {
            break;
        }

        run_once(engine, query, Some(thread_id.clone()), format).await?;
        eprintln!();
    }
    Ok(())
}

// =============================================================================
// OUTPUT
// =============================================================================
fn render(out: &mut impl Write, event: &WorkflowEvent, format: OutputFormat) -> std::io::Result<()> {
    match format {
        OutputFormat::Sse => write!(out, "{}", event.to_sse())?,
        OutputFormat::Json => writeln!(out, "{}", event.to_json_line())?,
        OutputFormat::Text => render_text(out, &event.kind)?,
    }
    out.flush()
}

/// Report text goes to `out`; progress goes to stderr.
fn render_text(out: &mut impl Write, kind: &EventKind) -> std::io::Result<()> {
    match kind {
        EventKind::Planning { sub_questions, .. } => {
            if sub_questions.is_empty() {
                eprintln!("Answering from thread memory, no new research.");
            }
            for sq in sub_questions {
                eprintln!("  [{}] {}", sq.id, sq.question);
            }
        }
        EventKind::ResearchProgress {
            sub_question_id,
            status,
            message,
            ..
        } => eprintln!("  {} {:?}: {}", sub_question_id, status, message),
        EventKind::Writing { rewrite_iteration } if *rewrite_iteration > 0 => {
            writeln!(out, "\n\n{}", "=".repeat(60))?;
            writeln!(out, "REVISED REPORT")?;
            writeln!(out, "{}\n", "=".repeat(60))?;
        }
        EventKind::Message { chunk } => write!(out, "{}", chunk)?,
        EventKind::Quality { score, passed, issues } => {
            eprintln!("\nQuality score {} ({})", score, if *passed { "passed" } else { "revising" });
            for issue in issues {
                eprintln!("  - {}", issue);
            }
        }
        EventKind::Error { stage, detail, .. } => eprintln!("  ! [{}] {}", stage, detail),
        EventKind::Done(payload) => {
            writeln!(out, "\n\n{}", "=".repeat(60))?;
            writeln!(out, "EXECUTIVE SUMMARY")?;
            writeln!(out, "{}\n", "=".repeat(60))?;
            writeln!(out, "{}", payload.executive_summary)?;
            if !payload.key_takeaways.is_empty() {
                writeln!(out, "\nKey takeaways:")?;
                for takeaway in &payload.key_takeaways {
                    writeln!(out, "  - {}", takeaway)?;
                }
            }
            if !payload.citations.is_empty() {
                writeln!(out, "\nSources:")?;
                for (i, citation) in payload.citations.iter().enumerate() {
                    writeln!(out, "  [S{}] {} ({})", i + 1, citation.title, citation.url)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

// =============================================================================
// LOGGING INITIALIZATION
// =============================================================================
/// Initialize the tracing subscriber for structured logging.
///
/// Logs go to stderr so event output on stdout stays machine-readable.
/// `RUST_LOG` takes precedence over `--verbose` when set.
fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::try_from_default_env().context("Invalid RUST_LOG filter")?,
        Err(_) => EnvFilter::new(level.as_str()),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}
