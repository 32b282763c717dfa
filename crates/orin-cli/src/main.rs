use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orin_backend::LlamaCppBackend;
use orin_core::{Backend, Error, ReasoningDisplay};

mod chat;
mod config;
mod render;
mod setup;
mod spinner;
mod transcript;

use chat::ChatSession;
use config::{expand_path, Config};
use render::TerminalRenderer;

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: includes every line the backend writes to stderr
    Trace,
    /// Verbose: backend calls, parser diagnostics, verification steps
    Debug,
    /// Standard: one line per completed turn
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "orin")]
#[command(author, version, about = "Orin: a terminal front-end for local llama.cpp models", long_about = None)]
pub struct Cli {
    /// Ask a single question and exit
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Configuration file (default: ~/.config/orin/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// GGUF model file (overrides config)
    #[arg(short, long)]
    pub model: Option<String>,

    /// llama-cli executable (overrides config)
    #[arg(long)]
    pub binary: Option<String>,

    /// Temperature
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Context size in tokens
    #[arg(long)]
    pub context_size: Option<u32>,

    /// CPU threads for the backend
    #[arg(long)]
    pub threads: Option<u32>,

    /// Load the model without memory mapping
    #[arg(long)]
    pub no_mmap: bool,

    /// Reasoning display mode
    #[arg(long, value_parser = parse_display)]
    pub thinking: Option<ReasoningDisplay>,

    /// Critique and revise each answer before accepting it
    #[arg(long)]
    pub verify: bool,

    /// Maximum revisions per answer when verifying
    #[arg(long)]
    pub iterations: Option<u32>,

    /// Question/answer pairs kept in the prompt
    #[arg(long)]
    pub window: Option<usize>,

    /// Per-call timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Do not write a session transcript
    #[arg(long)]
    pub no_transcript: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long)]
    pub debug: bool,

    /// Write logs to file (JSON-lines format)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the backend binary and model can be found
    Status,
    /// Show the effective configuration
    Config,
    /// Write a configuration template to ~/.config/orin
    Setup,
}

fn parse_display(s: &str) -> std::result::Result<ReasoningDisplay, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Resolve log level: --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };

    // Set up logging
    let filter = EnvFilter::new(log_level.as_filter());

    if let Some(log_path) = &cli.log_file {
        // Log file specified: write JSON to file
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        // Logs go to stderr so they never mix with answers on stdout
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    // Handle setup before config is required
    if matches!(&cli.command, Some(Commands::Setup)) {
        return setup::run();
    }

    let mut config = Config::load(cli.config.as_deref())?;
    apply_cli_overrides(&mut config, &cli);

    match &cli.command {
        Some(Commands::Status) => show_status(&config),
        Some(Commands::Config) => show_config(&config),
        Some(Commands::Setup) => unreachable!(),
        None => {
            if let Some(prompt) = &cli.prompt {
                completion_mode(&config, prompt).await
            } else {
                chat_mode(&cli, &config).await
            }
        }
    }
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(model) = &cli.model {
        config.backend.model = expand_path(model);
    }
    if let Some(binary) = &cli.binary {
        config.backend.binary = expand_path(binary);
    }

    let generation = &mut config.generation;
    if let Some(temperature) = cli.temperature {
        generation.temperature = temperature;
    }
    if let Some(max_tokens) = cli.max_tokens {
        generation.max_tokens = max_tokens;
    }
    if let Some(context_size) = cli.context_size {
        generation.context_size = context_size;
    }
    if let Some(threads) = cli.threads {
        generation.threads = threads;
    }
    if cli.no_mmap {
        generation.no_mmap = true;
    }

    let session = &mut config.session;
    if let Some(thinking) = cli.thinking {
        session.thinking = thinking;
    }
    if cli.verify {
        session.verify = true;
    }
    if let Some(window) = cli.window {
        session.window_size = window;
    }
    if let Some(timeout) = cli.timeout {
        session.timeout_secs = Some(timeout);
    }
    if cli.no_transcript {
        session.transcript = false;
    }

    if let Some(iterations) = cli.iterations {
        config.verification.iteration_cap = iterations;
    }
}

fn create_backend(config: &Config) -> Result<Arc<dyn Backend>> {
    let backend = LlamaCppBackend::new(config.backend.clone());
    let probe = backend.probe();

    if probe.binary.is_none() {
        anyhow::bail!(
            "Backend executable not found: {}\n\n\
             Install llama.cpp or set [backend] binary in {} (or pass --binary).",
            config.backend.binary.display(),
            config_location()
        );
    }
    if !probe.model_found {
        anyhow::bail!(
            "Model file not found: {}\n\n\
             Set [backend] model in {} (or pass --model). Run `orin setup` to create a template.",
            config.backend.model.display(),
            config_location()
        );
    }

    Ok(Arc::new(backend))
}

fn config_location() -> String {
    Config::config_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "the configuration file".to_string())
}

async fn completion_mode(config: &Config, prompt: &str) -> Result<()> {
    let backend = create_backend(config)?;

    // One-shot answers go to stdout unstyled when piped
    let renderer = TerminalRenderer::detect();
    let mut session = ChatSession::new(config, backend, renderer, None);

    match session.ask(prompt).await {
        Ok(outcome) => {
            tracing::info!(
                calls = outcome.calls,
                elapsed = ?outcome.elapsed,
                verdict = %outcome.verdict,
                "Completion finished"
            );
            Ok(())
        }
        Err(Error::Cancelled) => {
            eprintln!("Interrupted");
            Ok(())
        }
        Err(e) => Err(e).context("Generation failed"),
    }
}

async fn chat_mode(cli: &Cli, config: &Config) -> Result<()> {
    let backend = create_backend(config)?;

    let transcript_dir = if config.session.transcript && !cli.no_transcript {
        config.transcript_dir()
    } else {
        None
    };

    let mut renderer = TerminalRenderer::detect();
    let _ = renderer.print_section_header(&format!(
        "orin · {} · thinking: {} · verification: {}",
        config
            .backend
            .model
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        config.session.thinking,
        if config.session.verify { "on" } else { "off" }
    ));

    let mut session = ChatSession::new(config, backend, renderer, transcript_dir);
    session.run().await?;

    let stats = session.history().stats();
    tracing::info!(
        questions = stats.questions,
        verified = stats.verified_turns,
        "Chat session ended"
    );
    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    let backend = LlamaCppBackend::new(config.backend.clone());
    let probe = backend.probe();

    println!("Configuration: {}", config_location());
    match &probe.binary {
        Some(path) => println!("Backend:       {} (found)", path.display()),
        None => println!("Backend:       {} (NOT FOUND)", config.backend.binary.display()),
    }
    println!(
        "Model:         {} ({})",
        config.backend.model.display(),
        if probe.model_found { "found" } else { "NOT FOUND" }
    );
    println!(
        "Generation:    temperature {}, max {} tokens, context {}, {} threads{}",
        config.generation.temperature,
        config.generation.max_tokens,
        config.generation.context_size,
        config.generation.threads,
        if config.generation.no_mmap { ", no mmap" } else { "" }
    );
    println!(
        "Session:       window {} pairs, thinking {}, verification {} (cap {})",
        config.session.window_size,
        config.session.thinking,
        if config.session.verify { "on" } else { "off" },
        config.verification.iteration_cap
    );
    match config.transcript_dir() {
        Some(dir) if config.session.transcript => println!("Transcripts:   {}", dir.display()),
        _ => println!("Transcripts:   off"),
    }

    if probe.is_ready() {
        println!("\nReady.");
        Ok(())
    } else {
        anyhow::bail!("Backend is not ready; see above")
    }
}

fn show_config(config: &Config) -> Result<()> {
    println!("# {}", config_location());
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "orin",
            "--model",
            "/models/a.gguf",
            "-t",
            "0.9",
            "--thinking",
            "never",
            "--verify",
            "--iterations",
            "3",
            "--window",
            "2",
            "--timeout",
            "60",
            "--no-transcript",
            "--no-mmap",
        ]);
        let mut config = Config::default();
        apply_cli_overrides(&mut config, &cli);

        assert_eq!(config.backend.model, PathBuf::from("/models/a.gguf"));
        assert_eq!(config.generation.temperature, 0.9);
        assert!(config.generation.no_mmap);
        assert_eq!(config.session.thinking, ReasoningDisplay::Never);
        assert!(config.session.verify);
        assert_eq!(config.verification.iteration_cap, 3);
        assert_eq!(config.session.window_size, 2);
        assert_eq!(config.session.timeout_secs, Some(60));
        assert!(!config.session.transcript);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::parse_from(["orin"]);
        let mut config = Config::default();
        config.session.verify = true;
        apply_cli_overrides(&mut config, &cli);

        assert!(config.session.verify);
        assert!(config.session.transcript);
        assert_eq!(config.backend.binary, PathBuf::from("llama-cli"));
    }

    #[test]
    fn test_bad_thinking_mode_is_rejected() {
        assert!(Cli::try_parse_from(["orin", "--thinking", "sometimes"]).is_err());
    }

    #[test]
    fn test_subcommands_parse() {
        let cli = Cli::parse_from(["orin", "status"]);
        assert!(matches!(cli.command, Some(Commands::Status)));
    }
}
