//! keyrotor CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use futures::StreamExt as _;
use keyrotor::config::Config;
use keyrotor::keys::{
    CredentialStore as _, KeyExecutor, KeyStatus, ManualOverride, NewCredential, OverrideSettings,
    Provider, RotationLog as _, Secret, SqliteCredentialStore,
};
use keyrotor::llm::LlmManager;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "keyrotor", version, about = "API key rotation for AI provider calls")]
struct Cli {
    /// Path to config file (default: ~/.config/keyrotor/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage stored provider keys
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Show recent key rotations
    Rotations {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Manage the local override key
    #[command(subcommand)]
    Override(OverrideCommand),
    /// Generate text with the configured model
    Generate {
        prompt: String,
        #[arg(short, long)]
        system: Option<String>,
        #[arg(long)]
        stream: bool,
    },
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Add a key to the store
    Add {
        secret: String,
        #[arg(short, long, default_value = "GOOGLE")]
        provider: Provider,
        #[arg(short, long, default_value = NewCredential::DEFAULT_ALIAS)]
        alias: String,
        #[arg(short, long, default_value_t = NewCredential::DEFAULT_USAGE_LIMIT)]
        limit: u64,
        #[arg(long, default_value = "admin")]
        added_by: String,
    },
    /// List every stored key, newest first
    List,
    /// Show the keys a call would use, in order
    Select {
        #[arg(short, long, default_value = "GOOGLE")]
        provider: Provider,
    },
    /// Change a key's status
    Status { id: String, status: KeyStatus },
    /// Delete a key
    Delete { id: String },
}

#[derive(Subcommand)]
enum OverrideCommand {
    /// Use this key for every call to its provider
    Set {
        secret: String,
        #[arg(short, long, default_value = "GOOGLE")]
        provider: Provider,
    },
    /// Remove the override key
    Clear,
    /// Show the override key and its usage
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let store = Arc::new(open_store(&config).await?);

    match cli.command {
        Command::Keys(command) => run_keys(command, &config, store).await,
        Command::Rotations { limit } => {
            for event in store.recent(limit).await? {
                println!(
                    "{}  {:<8}  {} -> {}  ({})",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.provider,
                    event.previous_alias,
                    event.new_alias,
                    event.reason
                );
            }
            Ok(())
        }
        Command::Override(command) => run_override(command, &config).await,
        Command::Generate {
            prompt,
            system,
            stream,
        } => {
            let executor = Arc::new(build_executor(&config, store).await?);
            let manager = LlmManager::new(config.llm.clone(), executor.clone()).await?;

            if stream {
                let mut chunks = manager.generate_text_stream(&prompt, system.as_deref()).await?;
                let mut stdout = std::io::stdout();
                while let Some(chunk) = chunks.next().await {
                    write!(stdout, "{}", chunk?)?;
                    stdout.flush()?;
                }
                writeln!(stdout)?;
            } else {
                println!("{}", manager.generate_text(&prompt, system.as_deref()).await?);
            }

            executor.flush_usage().await;
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "keyrotor=debug,info" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &Config) -> anyhow::Result<SqliteCredentialStore> {
    if let Some(path) = config.database.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    SqliteCredentialStore::connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open credential store at {}", config.database.url))
}

async fn build_executor(
    config: &Config,
    store: Arc<SqliteCredentialStore>,
) -> anyhow::Result<KeyExecutor> {
    let overrides = Arc::new(OverrideSettings::load(&config.override_path).await?);
    Ok(KeyExecutor::builder(store.clone(), store)
        .engine_config(&config.engine)
        .overrides(overrides)
        .build())
}

async fn run_keys(
    command: KeysCommand,
    config: &Config,
    store: Arc<SqliteCredentialStore>,
) -> anyhow::Result<()> {
    match command {
        KeysCommand::Add {
            secret,
            provider,
            alias,
            limit,
            added_by,
        } => {
            let record = store
                .add_key(
                    NewCredential::new(provider, Secret::new(secret))
                        .alias(alias)
                        .usage_limit(limit)
                        .added_by(added_by),
                )
                .await?;
            println!("{}", record.id);
        }
        KeysCommand::List => {
            for key in store.list_keys().await? {
                println!(
                    "{}  {:<8}  {:<9}  {:>6}/{:<6}  {}  {}",
                    key.id,
                    key.provider,
                    key.status,
                    key.usage_count,
                    key.usage_limit,
                    key.secret.hint(),
                    key.alias
                );
            }
        }
        KeysCommand::Select { provider } => {
            let executor = build_executor(config, store).await?;
            for key in executor.select_keys(provider).await {
                println!("{:<6}  {}  {}", key.usage_count, key.secret.hint(), key.alias);
            }
        }
        KeysCommand::Status { id, status } => {
            store.set_status(&id, status).await?;
            println!("{id} -> {status}");
        }
        KeysCommand::Delete { id } => {
            store.delete_key(&id).await?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

async fn run_override(command: OverrideCommand, config: &Config) -> anyhow::Result<()> {
    let overrides = OverrideSettings::load(&config.override_path).await?;
    match command {
        OverrideCommand::Set { secret, provider } => {
            overrides
                .set(ManualOverride::new(Secret::new(secret), provider))
                .await?;
            println!("override set for {provider}");
        }
        OverrideCommand::Clear => {
            overrides.clear().await?;
            println!("override cleared");
        }
        OverrideCommand::Show => match overrides.current() {
            Some(current) => println!(
                "{}  {}  used {} times since {}",
                current.provider,
                current.secret.hint(),
                current.usage,
                current.created_at.format("%Y-%m-%d")
            ),
            None => println!("no override configured"),
        },
    }
    Ok(())
}
