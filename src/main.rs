//! Draftsmith CLI - stream AI edits of manuscript passages

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use draftsmith::{
    api::{GenerationRequest, ProviderAdapter, ProviderKind},
    config::Config,
    fragments::{
        FragmentId, FragmentRegistry, GenerationKind, GenerationParams, GenerationTask,
        InstructionBuilder, ManuscriptContext, StaticManuscript,
    },
    session::SessionEvent,
    terminal::{spinner::ThinkingSpinner, TerminalSink},
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "draftsmith")]
#[command(about = "Stream AI expansions, condensations and rewrites of manuscript passages")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Config file (default: ~/.config/draftsmith/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Provider override (openai, anthropic, gemini, deepseek, minimax, custom)
    #[arg(short, long, global = true)]
    provider: Option<String>,

    /// Model override
    #[arg(short, long, global = true)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a prompt and stream the reply to stdout
    Generate {
        /// Prompt text
        prompt: String,

        /// System prompt
        #[arg(short, long)]
        system: Option<String>,

        /// Wait for the whole reply instead of streaming
        #[arg(long)]
        no_stream: bool,
    },

    /// Expand a passage following the chapter outline
    Expand(EditArgs),

    /// Condense a passage
    Condense(EditArgs),

    /// Rewrite a passage following an instruction
    Rewrite {
        #[command(flatten)]
        edit: EditArgs,

        /// How the passage should be rewritten
        #[arg(short, long)]
        instruction: String,
    },

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args)]
struct EditArgs {
    /// The selected passage
    text: String,

    /// Title of the book the passage belongs to
    #[arg(long, default_value = "Untitled")]
    book_title: String,

    /// World and character notes
    #[arg(long)]
    settings: Option<String>,

    /// Outline of the current chapter
    #[arg(long)]
    outline: Option<String>,

    /// Text of the current chapter
    #[arg(long)]
    chapter_text: Option<String>,

    /// Generate this many further takes after the first one completes
    #[arg(long, default_value = "0")]
    regenerate: u32,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Initialize configuration file with defaults
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    // Generated text owns stdout
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let path = cli.config.clone().unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Generate {
            prompt,
            system,
            no_stream,
        } => {
            let config = load_config(&path, cli.provider, cli.model)?;
            run_generate(&config, prompt, system, no_stream).await?;
        }
        Commands::Expand(edit) => {
            let config = load_config(&path, cli.provider, cli.model)?;
            run_edit(&config, GenerationKind::Expand, edit, None).await?;
        }
        Commands::Condense(edit) => {
            let config = load_config(&path, cli.provider, cli.model)?;
            run_edit(&config, GenerationKind::Condense, edit, None).await?;
        }
        Commands::Rewrite { edit, instruction } => {
            let config = load_config(&path, cli.provider, cli.model)?;
            run_edit(&config, GenerationKind::Rewrite, edit, Some(instruction)).await?;
        }
        Commands::Config(cmd) => {
            run_config_command(cmd, path)?;
        }
    }

    Ok(())
}

/// File, then environment, then command-line flags
fn load_config(path: &Path, provider: Option<String>, model: Option<String>) -> Result<Config> {
    let mut config = Config::load_from(path.to_path_buf())?;

    if let Some(name) = provider {
        let kind: ProviderKind = name.parse()?;
        config = config.with_provider(kind);
    }
    if let Some(model) = model {
        config.provider.model = Some(model);
    }

    Ok(config)
}

fn spinner(config: &Config) -> ThinkingSpinner {
    if config.output.spinner {
        ThinkingSpinner::new()
    } else {
        ThinkingSpinner::hidden()
    }
}

async fn run_generate(
    config: &Config,
    prompt: String,
    system: Option<String>,
    no_stream: bool,
) -> Result<()> {
    let adapter = ProviderAdapter::new(&config.provider_config()?)?;
    info!(provider = %adapter.provider_kind(), model = %config.model(), "Generating");

    let mut request = GenerationRequest::from_prompt(prompt);
    if let Some(system) = system {
        request = request.with_system(system);
    }

    let mut spinner = spinner(config);
    spinner.start("Generating...");

    if no_stream || !config.output.stream {
        let result = adapter.generate(request).await;
        spinner.stop();
        if let Some(error) = result.error {
            bail!("Generation failed: {}", error);
        }
        println!("{}", result.text);
        return Ok(());
    }

    let (handle, mut events) = adapter.open_session(request);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut stdout = io::stdout();

    loop {
        let event = tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                handle.cancel();
                continue;
            }
            event = events.next() => event,
        };

        match event {
            Some(SessionEvent::Chunk(text)) => {
                spinner.stop();
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            Some(SessionEvent::Completed { .. }) | None => {
                spinner.stop();
                println!();
                break;
            }
            Some(SessionEvent::Cancelled) => {
                spinner.stop();
                println!("\n[stopped]");
                break;
            }
            Some(SessionEvent::Failed(error)) => {
                spinner.stop();
                bail!("Generation failed: {}", error);
            }
        }
    }

    Ok(())
}

async fn run_edit(
    config: &Config,
    kind: GenerationKind,
    edit: EditArgs,
    instruction: Option<String>,
) -> Result<()> {
    let adapter = ProviderAdapter::new(&config.provider_config()?)?;
    let manuscript = StaticManuscript::new(ManuscriptContext {
        book_title: edit.book_title,
        settings: edit.settings,
        chapter_outline: edit.outline,
        chapter_text: edit.chapter_text.unwrap_or_default(),
    });
    let sink = TerminalSink::stdout(config.output.color, config.output.spinner);
    let registry = FragmentRegistry::new(adapter, Arc::new(InstructionBuilder::new(manuscript)))
        .with_sink(Arc::new(sink));

    let mut params = GenerationParams::new(kind, edit.text, "cli", "cli");
    if let Some(instruction) = instruction {
        params = params.with_rewrite_prompt(instruction);
    }

    let id = registry.start(None, params).await?;
    for take in 0..=edit.regenerate {
        if take > 0 {
            registry.regenerate(&id).await?;
        }
        let Some(task) = wait_until_settled(&registry, &id).await else {
            break;
        };
        if let Some(error) = task.error {
            bail!("Generation failed: {}", error);
        }
    }

    Ok(())
}

/// Wait until the fragment's final state is on screen; None when interrupted
async fn wait_until_settled(registry: &FragmentRegistry, id: &FragmentId) -> Option<GenerationTask> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            // Each stop returns only after its snapshot was pushed
            let stopped = registry.stop_all().await;
            info!(stopped, "Interrupted");
            None
        }
        task = registry.settled(id) => task.filter(|task| !task.was_stopped),
    }
}

fn run_config_command(cmd: ConfigCommands, path: PathBuf) -> Result<()> {
    match cmd {
        ConfigCommands::Init { force } => config_init(path, force)?,
        ConfigCommands::Show => config_show(path)?,
        ConfigCommands::Path => config_path(path),
        ConfigCommands::Validate => config_validate(path)?,
    }
    Ok(())
}

fn config_init(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Configuration file already exists at: {}", path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, Config::example())?;

    println!("Configuration file created at: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the [provider] section to pick a backend and model, or");
    println!("  2. Set environment variables:");
    for kind in ProviderKind::ALL {
        println!("     export {}=your_{}_key", kind.api_key_env(), kind);
    }

    Ok(())
}

fn config_show(path: PathBuf) -> Result<()> {
    let mut config = Config::load_from(path)?;

    // Mask API keys in display
    if config.provider.api_key.is_some() {
        config.provider.api_key = Some("***".to_string());
    }
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

fn config_path(path: PathBuf) {
    println!("{}", path.display());

    if path.exists() {
        println!("(file exists)");
    } else {
        println!("(file does not exist - run 'config init' to create)");
    }
}

fn config_validate(path: PathBuf) -> Result<()> {
    let config = Config::load_from(path)?;

    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid!");
            println!();
            println!("Provider: {}", config.provider.name);
            println!("Model:    {}", config.model());
            match &config.provider.base_url {
                Some(url) => println!("Base URL: {}", url),
                None => println!("Base URL: (provider default)"),
            }
            if let Some(custom) = &config.custom {
                println!("Endpoint: {}", custom.url());
            }
        }
        Err(e) => {
            println!("Configuration validation failed:");
            println!("  {}", e);
            println!();
            println!("To fix, either:");
            println!("  1. Edit the config file: draftsmith config path");
            println!(
                "  2. Set environment variables: export {}=your_key",
                config.provider.name.api_key_env()
            );
        }
    }

    Ok(())
}
