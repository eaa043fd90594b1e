use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use lockdown_core::attributes;
use lockdown_core::credential::hash_credential;
use lockdown_core::event_log::{EventSeverity, Journal, DEFAULT_MAX_BYTES};
use lockdown_core::paths::{journal_path, CONFIG_FILE_NAME, LOG_FILE_NAME};
use lockdown_core::policy::{PolicyStore, DEFAULT_MAX_PATTERNS};
use lockdown_service::engine::Engine;
use lockdown_service::watch::inotify::Inotify;
use lockdown_service::watch::DEFAULT_MAX_WATCHES;
use lockdown_service::{event_loop, logging};
use tracing::{info, warn};
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(author, version, about = "Immutability enforcement for a protected directory", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a new configuration file
    Init {
        #[arg(long, default_value = CONFIG_FILE_NAME)]
        config: PathBuf,
        /// Directory to protect
        #[arg(long)]
        root: PathBuf,
        /// Base-name glob patterns of protected files
        patterns: Vec<String>,
    },
    /// Run the protection service
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,
    #[arg(long, default_value = LOG_FILE_NAME)]
    log_file: PathBuf,
    /// Audit journal location, defaults to the platform data directory
    #[arg(long)]
    journal: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_MAX_PATTERNS)]
    max_patterns: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_WATCHES)]
    max_watches: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init {
            config,
            root,
            patterns,
        } => init_command(config, root, patterns),
        Commands::Run(args) => run_command(args).await,
    }
}

fn init_command(config: PathBuf, root: PathBuf, patterns: Vec<String>) -> Result<()> {
    if config.exists() {
        return Err(anyhow!("configuration already exists at {}", config.display()));
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("cannot resolve protected root {}", root.display()))?;
    let credential = prompt_credential_twice("Create administrator credential: ")?;
    let hash = hash_credential(&credential)?;

    let mut text = format!("{hash}\n{}\n", root.display());
    for pattern in &patterns {
        text.push_str(pattern);
        text.push('\n');
    }
    let policy = PolicyStore::parse(&text, usize::MAX).context("configuration would not load")?;
    if policy.pattern_count() > DEFAULT_MAX_PATTERNS {
        eprintln!(
            "warning: only the first {DEFAULT_MAX_PATTERNS} patterns are used unless --max-patterns is raised"
        );
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&config)
        .with_context(|| format!("failed to create {}", config.display()))?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    println!(
        "Configuration written to {} ({} patterns, root {})",
        config.display(),
        policy.pattern_count(),
        policy.root().display()
    );
    Ok(())
}

async fn run_command(args: RunArgs) -> Result<()> {
    logging::init(&args.log_file)?;
    let journal_file = match args.journal {
        Some(path) => path,
        None => journal_path()?,
    };

    let journal = Journal::new(&journal_file, DEFAULT_MAX_BYTES)
        .with_context(|| format!("failed to open journal {}", journal_file.display()))?;
    let mut policy = PolicyStore::load(&args.config, args.max_patterns)
        .with_context(|| format!("failed to load configuration {}", args.config.display()))?;
    if let Some(name) = args.log_file.file_name() {
        policy = policy.with_self_artifact(name);
    }
    policy = policy.with_self_artifact_path(&journal_file);
    info!(
        root = %policy.root().display(),
        patterns = policy.pattern_count(),
        "configuration loaded"
    );

    if !attributes::immutable_supported(policy.root()) {
        warn!(
            root = %policy.root().display(),
            "immutable attribute unavailable, protection falls back to read-only permissions"
        );
    }
    let inotify = Inotify::init().context("failed to initialize inotify")?;

    let mut engine = Engine::new(policy, args.max_watches).with_journal(journal);
    let report = engine.start(&inotify)?;
    engine.record(
        "SERVICE_STARTED",
        EventSeverity::Info,
        serde_json::json!({
            "root": engine.policy().root().display().to_string(),
            "watches": report.added.len(),
            "failed": report.failed,
        }),
    );
    info!(watches = report.added.len(), "file protection system started");

    event_loop::run(&mut engine, inotify).await
}

fn prompt_credential_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(credential) = std::env::var("LOCKDOWN_CREDENTIAL") {
        if !credential.is_empty() {
            if let Ok(confirm) = std::env::var("LOCKDOWN_CREDENTIAL_CONFIRM") {
                if confirm != credential {
                    return Err(anyhow!("credential confirmation mismatch"));
                }
            }
            return Ok(Zeroizing::new(credential));
        }
    }
    let first = Zeroizing::new(
        rpassword::prompt_password(prompt).map_err(|e| anyhow!("credential prompt: {e}"))?,
    );
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm credential: ")
            .map_err(|e| anyhow!("credential prompt: {e}"))?,
    );
    if first != second {
        return Err(anyhow!("credentials do not match"));
    }
    Ok(first)
}
