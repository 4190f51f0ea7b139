//! Groupcast CLI
//!
//! Command-line interface for the groupcast dispatch engine

mod console;
mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use groupcast_bridge::BridgeTransport;
use groupcast_bulk::BulkCampaignState;
use groupcast_config::{parse_client_rules, BridgeConfig, Config, Settings};
use groupcast_core::backlog::DEFAULT_BACKLOG_LIMIT;
use groupcast_core::forward::{ForwardAccumulator, ForwardMeta};
use groupcast_core::{Dispatcher, InteractionLogEntry, SkippedLogEntry};
use groupcast_ipc::{EventBus, Transport};
use groupcast_storage::{keys, load, save, SqliteStore, StateStore};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const DB_FILE: &str = "groupcast.db";

#[derive(Parser)]
#[command(name = "groupcast")]
#[command(about = "Rate-limited reactions, forwards and bulk campaigns for group chats", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine in the foreground with an interactive console
    Start {
        /// Start reacting immediately instead of waiting for the `start` command
        #[arg(short, long)]
        run: bool,
    },

    /// Show persisted engine state
    Status,

    /// Audit trail and log files
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },

    /// Inspect or clear the forward queue
    Forward {
        #[command(subcommand)]
        action: ForwardCommands,
    },

    /// Manage client rules
    Clients {
        #[command(subcommand)]
        action: ClientCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Messages that were reacted to, replied to or forwarded
    Interactions {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Messages that were skipped, with the reason
    Skipped {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List log files
    Files,
    /// Show the last lines of today's log file
    Tail {
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

#[derive(Subcommand)]
enum ForwardCommands {
    /// List queued forwards
    List,
    /// Drop every queued forward
    Clear,
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Import rules from a file, one `name | emoji` per line
    Import {
        file: PathBuf,
        /// Replace the current rules instead of appending
        #[arg(long)]
        replace: bool,
    },
    /// Show the active rules
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration
    Show,
    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { run } => {
            let config = load_config(cli.config.clone())?;
            let data_dir = get_data_dir(&config);
            fs::create_dir_all(&data_dir)?;
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), log_level(&cli.log_level, &config))?;

            let bridge = config
                .bridge
                .clone()
                .ok_or_else(|| anyhow!("[bridge] section is required to start the engine"))?;
            let store = open_store(&data_dir)?;
            let event_bus = EventBus::new();
            let transport = Arc::new(
                BridgeTransport::new(&bridge, Arc::clone(&store))?.with_event_bus(event_bus.clone()),
            );

            let dispatcher = Dispatcher::open(
                config.settings(),
                Arc::clone(&store),
                Arc::clone(&transport) as Arc<dyn Transport>,
            )?;
            dispatcher.attach(&event_bus);

            let poller = Arc::clone(&transport);
            let poll_task = tokio::spawn(async move {
                if let Err(e) = poller.poll().await {
                    error!("Bridge polling stopped: {}", e);
                }
            });

            if run {
                dispatcher.start().await;
            }
            info!("groupcast running, data dir {}", data_dir.display());

            let backlog_limit = bridge.history_limit.unwrap_or(DEFAULT_BACKLOG_LIMIT);
            tokio::select! {
                result = console::run(&dispatcher, backlog_limit) => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
            }

            dispatcher.shutdown();
            poll_task.abort();
        }

        Commands::Status => {
            let config = load_config(cli.config)?;
            let store = open_store(&get_data_dir(&config))?;
            print_status(store.as_ref(), &config)?;
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config)?;
            let data_dir = get_data_dir(&config);
            match action {
                LogCommands::Interactions { limit } => {
                    let store = open_store(&data_dir)?;
                    let entries: Vec<InteractionLogEntry> =
                        load(store.as_ref(), keys::INTERACTIONS)?.unwrap_or_default();
                    for entry in tail(&entries, limit) {
                        println!(
                            "{}  {:<9} {}  {}  {}  {}",
                            entry.at.format("%Y-%m-%d %H:%M:%S"),
                            format!("{:?}", entry.action).to_lowercase(),
                            entry.destination,
                            entry.message_id,
                            entry.client.as_deref().unwrap_or("-"),
                            entry.detail
                        );
                    }
                }
                LogCommands::Skipped { limit } => {
                    let store = open_store(&data_dir)?;
                    let entries: Vec<SkippedLogEntry> =
                        load(store.as_ref(), keys::SKIPPED)?.unwrap_or_default();
                    for entry in tail(&entries, limit) {
                        println!(
                            "{}  {}  {}  [{}]  {}",
                            entry.at.format("%Y-%m-%d %H:%M:%S"),
                            entry.destination,
                            entry.message_id,
                            entry.reason,
                            entry.preview
                        );
                    }
                }
                LogCommands::Files => {
                    let manager = logging::LogManager::new(data_dir.join("logs"));
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in manager.log_files()? {
                        let size = fs::metadata(&file)?.len();
                        println!(
                            "  {} ({})",
                            file.display(),
                            logging::LogManager::format_size(size)
                        );
                    }
                }
                LogCommands::Tail { lines } => {
                    let manager = logging::LogManager::new(data_dir.join("logs"));
                    let current = manager.current_log_path();
                    if !current.exists() {
                        println!("No log file for today");
                        return Ok(());
                    }
                    let content = fs::read_to_string(&current)?;
                    let all: Vec<&str> = content.lines().collect();
                    for line in tail(&all, lines) {
                        println!("{}", line);
                    }
                }
            }
        }

        Commands::Forward { action } => {
            let config = load_config(cli.config)?;
            let store = open_store(&get_data_dir(&config))?;
            let queue = ForwardAccumulator::open(Arc::clone(&store))?;
            match action {
                ForwardCommands::List => {
                    let items = queue.snapshot();
                    println!("{} queued forward(s)", items.len());
                    for item in items {
                        println!(
                            "  {}  {}  {}",
                            item.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                            item.source_destination,
                            item.message_id
                        );
                    }
                }
                ForwardCommands::Clear => {
                    println!("Removed {} queued forward(s)", queue.clear()?);
                }
            }
        }

        Commands::Clients { action } => {
            let config = load_config(cli.config)?;
            let store = open_store(&get_data_dir(&config))?;
            let mut settings = effective_settings(store.as_ref(), &config)?;
            match action {
                ClientCommands::Import { file, replace } => {
                    let raw = fs::read_to_string(&file)
                        .with_context(|| format!("cannot read {}", file.display()))?;
                    let imported = parse_client_rules(&raw, &settings.engine.default_emoji);
                    let count = imported.len();
                    if replace {
                        settings.clients = imported;
                    } else {
                        settings.clients.extend(imported);
                    }
                    settings.validate()?;
                    save(store.as_ref(), keys::SETTINGS, &settings)?;
                    println!(
                        "Imported {} rule(s), {} active; applied on next start",
                        count,
                        settings.clients.len()
                    );
                }
                ClientCommands::List => {
                    for (index, rule) in settings.clients.iter().enumerate() {
                        println!("{:>3}. {} | {}", index + 1, rule.name, rule.emoji);
                    }
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => {
                let path = config_path(cli.config)?;
                if path.exists() && !force {
                    anyhow::bail!("{} already exists, use --force to overwrite", path.display());
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, toml::to_string_pretty(&default_config())?)?;
                println!("Configuration written to {}", path.display());
            }
            ConfigCommands::Show => {
                let config = load_config(cli.config)?;
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigCommands::Validate => match load_config(cli.config) {
                Ok(_) => println!("Configuration is valid"),
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    std::process::exit(1);
                }
            },
        },
    }

    Ok(())
}

fn tail<T>(items: &[T], limit: usize) -> &[T] {
    &items[items.len().saturating_sub(limit)..]
}

fn log_level<'a>(flag: &'a str, config: &'a Config) -> &'a str {
    match config.core.log_level.as_deref() {
        Some(level) if flag == "info" => level,
        _ => flag,
    }
}

fn config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("No config directory available")),
    }
}

fn load_config(config_path: Option<String>) -> Result<Config> {
    let path = self::config_path(config_path)?;
    Config::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

fn default_config() -> Config {
    Config {
        bridge: Some(BridgeConfig {
            base_url: "http://127.0.0.1:3100".to_string(),
            poll_timeout_secs: Some(30),
            self_id: None,
            history_limit: Some(DEFAULT_BACKLOG_LIMIT),
        }),
        ..Config::default()
    }
}

fn get_data_dir(config: &Config) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    match config.core.data_dir.as_deref() {
        Some("~") => home(),
        Some(dir) if dir.starts_with("~/") => home().join(dir.trim_start_matches("~/")),
        Some(dir) => PathBuf::from(dir),
        None => home().join(".groupcast"),
    }
}

fn open_store(data_dir: &std::path::Path) -> Result<Arc<dyn StateStore>> {
    fs::create_dir_all(data_dir)?;
    let store = SqliteStore::new(data_dir.join(DB_FILE))?;
    Ok(Arc::new(store))
}

/// Settings the engine would start with: persisted runtime settings, else the file.
fn effective_settings(store: &dyn StateStore, config: &Config) -> Result<Settings> {
    Ok(load(store, keys::SETTINGS)?.unwrap_or_else(|| config.settings()))
}

fn print_status(store: &dyn StateStore, config: &Config) -> Result<()> {
    let settings = effective_settings(store, config)?;
    let bulk: BulkCampaignState = load(store, keys::BULK_STATE)?.unwrap_or_default();
    let queue: Vec<serde_json::Value> = load(store, keys::FORWARD_QUEUE)?.unwrap_or_default();
    let meta: ForwardMeta = load(store, keys::FORWARD_META)?.unwrap_or_default();
    let processed: Vec<String> = load(store, keys::PROCESSED)?.unwrap_or_default();
    let last_checked: HashMap<String, i64> = load(store, keys::LAST_CHECKED)?.unwrap_or_default();

    println!("Engine settings");
    println!("  rate:        {}/min", settings.engine.rate_per_minute);
    println!("  cooldown:    {}s", settings.engine.cooldown_seconds);
    println!("  mode:        {:?}", settings.engine.mode);
    println!("  clients:     {}", settings.clients.len());
    println!(
        "  watching:    {}",
        if settings.engine.watch_list.is_empty() {
            "all destinations".to_string()
        } else {
            settings.engine.watch_list.join(", ")
        }
    );
    println!("  processed:   {} id(s)", processed.len());

    println!("Forwarding");
    println!(
        "  target:      {}",
        settings.forward.active_target().unwrap_or("disabled")
    );
    println!("  pending:     {}", queue.len());
    println!(
        "  last flush:  {}",
        meta.last_forwarded_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );

    println!("Bulk campaign");
    println!("  state:       {:?}{}", bulk.state, if bulk.paused { " (paused)" } else { "" });
    if let Some(destination) = &bulk.destination {
        println!("  destination: {}", destination);
    }
    println!("  progress:    {}/{}", bulk.sent_count, bulk.total_count);
    if let Some(err) = &bulk.last_error {
        println!("  last error:  {}", err);
    }

    if !last_checked.is_empty() {
        println!("Last checked");
        let mut entries: Vec<_> = last_checked.into_iter().collect();
        entries.sort();
        for (destination, ts) in entries {
            let at = chrono::DateTime::from_timestamp_millis(ts)
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| ts.to_string());
            println!("  {}  {}", destination, at);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{default_config, get_data_dir, log_level, tail};
    use groupcast_config::Config;

    #[test]
    fn default_config_round_trips_and_validates() {
        let raw = toml::to_string_pretty(&default_config()).expect("serialize");
        let parsed: Config = toml::from_str(&raw).expect("parse");
        parsed.validate().expect("valid");
        assert!(parsed.bridge.is_some());
    }

    #[test]
    fn data_dir_expands_home() {
        let mut config = Config::default();
        config.core.data_dir = Some("/srv/groupcast".to_string());
        assert_eq!(get_data_dir(&config), std::path::PathBuf::from("/srv/groupcast"));

        config.core.data_dir = Some("~/gc".to_string());
        assert!(get_data_dir(&config).ends_with("gc"));

        config.core.data_dir = None;
        assert!(get_data_dir(&config).ends_with(".groupcast"));
    }

    #[test]
    fn explicit_log_level_flag_beats_config() {
        let mut config = Config::default();
        config.core.log_level = Some("debug".to_string());
        assert_eq!(log_level("info", &config), "debug");
        assert_eq!(log_level("warn", &config), "warn");
    }

    #[test]
    fn tail_keeps_last_entries() {
        assert_eq!(tail(&[1, 2, 3], 2), &[2, 3]);
        assert_eq!(tail(&[1], 5), &[1]);
    }
}
