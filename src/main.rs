use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use quill_rs::api::{ChatMessage, Engine, TurnRequest};
use quill_rs::core::upstream::ScriptedUpstream;
use quill_rs::core::TurnOutcome;
use quill_rs::utils::config::{AppConfig, ModelSelection};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Stream prose and dispatch tool calls
    Chat,
    /// Like chat, and append the prose to the project's story on completion
    Story,
}

/// Replay a recorded model output through the streaming pipeline.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    projects_root: Option<PathBuf>,

    #[arg(long)]
    project: Option<String>,

    /// Create the project with this title if it does not exist
    #[arg(long)]
    create: Option<String>,

    /// Zero-based chapter to append generated text to (story mode)
    #[arg(long)]
    chapter: Option<usize>,

    /// Recorded model output; read from stdin when absent
    #[arg(long = "i")]
    input: Option<PathBuf>,

    /// Characters per replayed delta
    #[arg(long, default_value_t = 16)]
    chunk_size: usize,

    /// Pause between deltas (ms)
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    #[arg(long, value_enum, default_value_t = Mode::Chat)]
    mode: Mode,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long, default_value = "Continue the story.")]
    prompt: String,

    /// Print the upstream audit log at the end
    #[arg(long, default_value_t = false)]
    audit: bool,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(root) = &args.projects_root {
        config.projects_root = root.clone();
    }
    Ok(config)
}

fn read_script(args: &Args) -> Result<String> {
    match &args.input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading model output {}", path.display())),
        None => {
            let mut script = String::new();
            std::io::stdin().read_to_string(&mut script)?;
            Ok(script)
        }
    }
}

fn report(outcome: &TurnOutcome) {
    println!();
    for result in &outcome.tool_results {
        println!(
            "[tool {} {}] {}",
            result.name, result.tool_call_id, result.content
        );
    }
    for (name, value) in outcome.mutations.iter() {
        println!("[mutation] {name}={value}");
    }
    if outcome.cancelled {
        tracing::warn!("Turn was cancelled");
    }
    if let Some(error) = &outcome.error {
        tracing::error!("Turn failed: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let script = read_script(&args)?;

    let mut upstream = ScriptedUpstream::new(script, args.chunk_size);
    if args.delay_ms > 0 {
        upstream = upstream.with_delay(Duration::from_millis(args.delay_ms));
    }
    let engine = Engine::new(config, upstream)?;

    if let (Some(project), Some(title)) = (&args.project, &args.create) {
        engine
            .store()
            .open_or_create(project, title)
            .with_context(|| format!("opening project {project}"))?;
    }

    let request = TurnRequest {
        messages: vec![ChatMessage::user(args.prompt.clone())],
        project_id: args.project.clone(),
        chapter: args.chapter,
        selection: ModelSelection {
            model: args.model.clone(),
            temperature: args.temperature,
            ..ModelSelection::default()
        },
    };

    let mut stdout = std::io::stdout();
    let outcome = match args.mode {
        Mode::Chat => {
            let mut turn = engine.chat_turn(request)?;
            tracing::info!("Replaying through model profile {}", turn.model.name);
            while let Some(chunk) = turn.stream.next().await {
                write!(stdout, "{}", chunk?)?;
                stdout.flush()?;
            }
            turn.outcome.await?
        }
        Mode::Story => {
            let mut turn = engine.generate_chapter(request)?;
            tracing::info!("Replaying through model profile {}", turn.model.name);
            while let Some(chunk) = turn.stream.next().await {
                write!(stdout, "{}", chunk?)?;
                stdout.flush()?;
            }
            turn.outcome.await?
        }
    };
    report(&outcome);

    if args.audit {
        println!("{}", serde_json::to_string_pretty(&engine.audit_entries())?);
    }
    Ok(())
}
