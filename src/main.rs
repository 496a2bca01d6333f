use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crosspost::activity::ActivityLog;
use crosspost::aggregator::MediaGroupAggregator;
use crosspost::api::client::{RelayClient, RunState};
use crosspost::channels::telegram::{TelegramFetcher, TelegramSource};
use crosspost::channels::EventSource;
use crosspost::config::{Config, PrimaryStore};
use crosspost::destination::vk::VkClient;
use crosspost::edit::EditPropagator;
use crosspost::error::{CrosspostError, Result};
use crosspost::event::SourceKey;
use crosspost::gateway::Crossposter;
use crosspost::mapping::local::LocalMappings;
use crosspost::mapping::supabase::SupabaseMappings;
use crosspost::mapping::{FallbackLog, Lookup, MappingBackend, MappingStore, StoreTier};
use crosspost::resolver::supabase::SupabaseDirectory;
use crosspost::resolver::{BindingDirectory, ContentResolver, StaticDirectory};
use crosspost::supabase::SupabaseClient;
use crosspost::transfer::compose::sweep_temp_dir;
use crosspost::transfer::{TransferSettings, TransferWorker};

#[derive(Parser)]
#[command(name = "crosspost", version, about = "Relay Telegram channel posts to VK walls")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the data directory
    Init,
    /// Start the relay
    Start,
    /// Stop the running relay
    Stop,
    /// Show relay status
    Status,
    /// Show recent logs
    Logs {
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
    /// Config management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect and repair post mappings
    Mapping {
        #[command(subcommand)]
        action: MappingAction,
    },
    /// Show recent owner-visible activity
    Activity {
        #[arg(short, long, default_value = "20")]
        lines: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

#[derive(Subcommand)]
enum MappingAction {
    /// Look up the post a source message was published as
    Get {
        #[arg(allow_hyphen_values = true)]
        channel_id: i64,
        message_id: i32,
    },
    /// List fallback log entries not yet in the primary store
    Pending,
    /// Replay fallback log entries into the primary store
    Reconcile,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // File + stderr for `start`, stderr only otherwise
    let log_file = match &cli.command {
        Commands::Start => Some(load_config(&cli.config)?.log_file_path()),
        _ => None,
    };
    init_tracing(log_file.as_deref())?;

    match cli.command {
        Commands::Init => cmd_init(&cli.config)?,
        Commands::Start => cmd_start(&cli.config).await?,
        Commands::Stop => cmd_stop(&cli.config).await?,
        Commands::Status => cmd_status(&cli.config).await?,
        Commands::Logs { lines } => cmd_logs(&cli.config, lines)?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let path = cli.config.unwrap_or_else(Config::default_path);
                let content = std::fs::read_to_string(&path)?;
                println!("{content}");
            }
        },
        Commands::Mapping { action } => match action {
            MappingAction::Get {
                channel_id,
                message_id,
            } => cmd_mapping_get(&cli.config, SourceKey::new(channel_id, message_id)).await?,
            MappingAction::Pending => cmd_mapping_pending(&cli.config).await?,
            MappingAction::Reconcile => cmd_mapping_reconcile(&cli.config).await?,
        },
        Commands::Activity { lines } => cmd_activity(&cli.config, lines).await?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let config_path = path.clone().unwrap_or_else(Config::default_path);
    if !config_path.exists() {
        return Err(CrosspostError::Config(format!(
            "Config not found at {}. Run `crosspost init` first.",
            config_path.display()
        )));
    }
    Config::load(&config_path)
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_level = if log_file.is_some() { "info" } else { "warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}

/// The last `n` lines of a file, plus how many lines it has in total.
fn tail_lines(path: &Path, n: usize) -> Result<(Vec<String>, usize)> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut ring = VecDeque::with_capacity(n);
    let mut total = 0;
    for line in reader.lines() {
        let line = line?;
        total += 1;
        if n == 0 {
            continue;
        }
        if ring.len() == n {
            ring.pop_front();
        }
        ring.push_back(line);
    }
    Ok((ring.into(), total))
}

fn tier_label(tier: StoreTier) -> &'static str {
    match tier {
        StoreTier::Primary => "primary",
        StoreTier::Degraded => "degraded, fallback log only",
    }
}

fn format_uptime(secs: u64) -> String {
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let (hours, minutes, seconds) = (rest / 3600, rest % 3600 / 60, rest % 60);
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

fn supabase_client(config: &Config) -> Result<Option<SupabaseClient>> {
    config.supabase().map(SupabaseClient::new).transpose()
}

fn binding_directory(config: &Config, supabase: Option<&SupabaseClient>) -> Arc<dyn BindingDirectory> {
    match supabase {
        Some(client) => Arc::new(SupabaseDirectory::new(client.clone())),
        None => {
            if config.bindings.is_empty() {
                warn!("No [supabase] section and no [[bindings]]: every channel is untracked");
            }
            Arc::new(StaticDirectory::from_config(&config.bindings))
        }
    }
}

async fn open_mapping_store(config: &Config, supabase: Option<&SupabaseClient>) -> Result<MappingStore> {
    let local = || -> Result<Arc<dyn MappingBackend>> {
        Ok(Arc::new(LocalMappings::open(
            config.data_dir().join("mappings.json"),
        )?))
    };

    let primary: Arc<dyn MappingBackend> = match (&config.mapping.primary, supabase) {
        (PrimaryStore::Auto | PrimaryStore::Supabase, Some(client)) => {
            Arc::new(SupabaseMappings::new(client.clone()))
        }
        (PrimaryStore::Supabase, None) => {
            return Err(CrosspostError::Config(
                "mapping.primary = \"supabase\" needs a [supabase] section".into(),
            ))
        }
        (PrimaryStore::Auto | PrimaryStore::Local, _) => local()?,
    };

    Ok(MappingStore::open(primary, FallbackLog::new(config.fallback_log_path())).await)
}

fn activity_log(config: &Config, supabase: Option<&SupabaseClient>) -> ActivityLog {
    match supabase {
        Some(client) => ActivityLog::supabase(client.clone()),
        None => ActivityLog::file(config.data_dir().join("activity.jsonl")),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_init(config_path: &Option<PathBuf>) -> Result<()> {
    let config_path = config_path.clone().unwrap_or_else(Config::default_path);
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !config_path.exists() {
        std::fs::write(&config_path, Config::default_toml())?;
        println!("Created config at {}", config_path.display());
    } else {
        println!("Config already exists at {}", config_path.display());
    }

    let config = Config::load(&config_path)?;
    std::fs::create_dir_all(config.temp_dir())?;
    println!("Data directory initialized at {}", config.data_dir().display());
    Ok(())
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;

    let run_state_path = config.run_state_path();
    if let Ok(Some(previous)) = RunState::read(&run_state_path).await {
        if RelayClient::new(&previous.bind, None)?.is_healthy().await {
            return Err(CrosspostError::Config(format!(
                "crosspost is already running (PID {}) on {}. Use `crosspost stop` first.",
                previous.pid, previous.bind
            )));
        }
    }
    RunState::remove(&run_state_path).await?;

    let temp_dir = config.temp_dir();
    tokio::fs::create_dir_all(&temp_dir).await?;
    let swept = sweep_temp_dir(&temp_dir, Duration::from_secs(config.crosspost.temp_max_age_secs))?;
    if swept > 0 {
        info!("Removed {swept} stale temp entries from {}", temp_dir.display());
    }

    let supabase = supabase_client(&config)?;
    let directory = binding_directory(&config, supabase.as_ref());
    let mappings = Arc::new(open_mapping_store(&config, supabase.as_ref()).await?);
    let activity = activity_log(&config, supabase.as_ref());

    let destination = Arc::new(VkClient::new(&config.vk)?);
    let fetcher = Arc::new(TelegramFetcher::new(&config.telegram)?);
    let source = Arc::new(TelegramSource::new(config.telegram.clone())?);

    let worker = Arc::new(TransferWorker::new(
        fetcher,
        destination.clone(),
        mappings.clone(),
        activity.clone(),
        TransferSettings::from_config(&config),
    ));
    let propagator = Arc::new(EditPropagator::new(destination, mappings.clone(), activity));
    let resolver = Arc::new(ContentResolver::new(directory));
    let crossposter = Arc::new(Crossposter::new(resolver, worker, propagator));

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    let aggregator = Arc::new(MediaGroupAggregator::new(
        config.crosspost.media_group_window(),
        closed_tx,
    ));

    let poller = source.clone();
    tokio::spawn(async move {
        if let Err(e) = poller.start(inbound_tx).await {
            tracing::error!("Telegram source error: {e}");
        }
    });
    let pipeline = tokio::spawn(crosspost::gateway::run(
        crossposter,
        aggregator.clone(),
        inbound_rx,
        closed_rx,
    ));

    let shutdown_signal = Arc::new(Notify::new());
    let state = Arc::new(crosspost::api::AppState {
        mappings: mappings.clone(),
        aggregator,
        api_token: config.gateway.api_token.clone(),
        started_at: Instant::now(),
        shutdown: shutdown_signal.clone(),
    });
    let app = crosspost::api::router(state);

    let bind_addr = config.gateway.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.map_err(|e| {
        CrosspostError::Config(format!("Failed to bind to {bind_addr}: {e}"))
    })?;
    let local_addr = listener.local_addr().map_err(|e| {
        CrosspostError::Config(format!("Failed to get local address: {e}"))
    })?;

    let run_state = RunState::current(local_addr);
    run_state.write(&run_state_path).await?;

    println!("crosspost v{} started", env!("CARGO_PKG_VERSION"));
    println!("  Bind:      {local_addr}");
    println!("  Data:      {}", config.data_dir().display());
    println!(
        "  Mappings:  {} ({})",
        mappings.backend_name(),
        tier_label(mappings.tier())
    );
    println!(
        "  Bindings:  {}",
        if supabase.is_some() {
            "supabase".to_string()
        } else {
            format!("{} static", config.bindings.len())
        }
    );
    println!("  PID:       {}", run_state.pid);
    println!("  Log:       {}", config.log_file_path().display());
    println!();
    println!("Press Ctrl+C or run `crosspost stop` to stop.");

    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = shutdown_signal.notified() => {}
        }
        println!("\nShutting down...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CrosspostError::Config(format!("Server error: {e}")))?;

    source.stop().await?;
    // The poller drops its sender after the current long-poll returns.
    if tokio::time::timeout(
        Duration::from_secs(u64::from(config.telegram.poll_timeout_secs) + 5),
        pipeline,
    )
    .await
    .is_err()
    {
        warn!("Pipeline did not drain before timeout");
    }

    RunState::remove(&run_state_path).await?;
    println!("crosspost stopped.");
    Ok(())
}

async fn cmd_stop(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let path = config.run_state_path();
    let Some(run) = RunState::read(&path).await? else {
        println!("crosspost is not running.");
        return Ok(());
    };

    let client = RelayClient::new(&run.bind, config.gateway.api_token.clone())?;
    if !client.is_healthy().await {
        RunState::remove(&path).await?;
        println!(
            "crosspost is not running (stale run state for PID {}, cleaned up).",
            run.pid
        );
        return Ok(());
    }

    client.shutdown().await?;
    println!("Asked crosspost (PID {}) on {} to stop.", run.pid, run.bind);

    // The relay removes its run state once the pipeline has drained.
    for _ in 0..25 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if RunState::read(&path).await?.is_none() {
            println!("crosspost stopped.");
            return Ok(());
        }
    }
    println!("crosspost is still draining in-flight posts; check `crosspost status` shortly.");
    Ok(())
}

async fn cmd_status(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let Some(run) = RunState::read(&config.run_state_path()).await? else {
        println!("crosspost is not running.");
        return Ok(());
    };

    let client = RelayClient::new(&run.bind, config.gateway.api_token.clone())?;
    if !client.is_healthy().await {
        println!(
            "crosspost is not answering on {} (PID {} recorded at {}).",
            run.bind,
            run.pid,
            run.started_at.to_rfc3339()
        );
        return Ok(());
    }

    let status = client.status().await?;
    println!(
        "crosspost v{} running (PID {}) on {}",
        status.version, run.pid, run.bind
    );
    println!("  Uptime:    {}", format_uptime(status.uptime_secs));
    println!(
        "  Mappings:  {} ({})",
        status.mapping_backend,
        tier_label(status.mapping_tier)
    );
    println!("  Groups:    {} open", status.open_media_groups);
    println!(
        "  Pending:   {} fallback entr(ies) awaiting reconciliation",
        status.pending_reconciliation
    );
    Ok(())
}

fn cmd_logs(config_path: &Option<PathBuf>, num_lines: usize) -> Result<()> {
    let path = load_config(config_path)?.log_file_path();

    if !path.exists() {
        println!("No log file found at {}", path.display());
        println!("Start the relay first: crosspost start");
        return Ok(());
    }

    let (lines, total) = tail_lines(&path, num_lines)?;
    for line in &lines {
        println!("{line}");
    }
    if lines.len() < total {
        println!("\n(Showing last {} of {total} lines)", lines.len());
    }

    Ok(())
}

async fn cmd_mapping_get(config_path: &Option<PathBuf>, source: SourceKey) -> Result<()> {
    let config = load_config(config_path)?;
    let supabase = supabase_client(&config)?;
    let store = open_mapping_store(&config, supabase.as_ref()).await?;

    match store.get(source).await? {
        Lookup::Found(mapping) => {
            println!("{source} -> post {}", mapping.target_id);
            println!("  Edits:   {}", mapping.edit_count);
            println!("  Created: {}", mapping.created_at.to_rfc3339());
            println!("  Updated: {}", mapping.updated_at.to_rfc3339());
            if let Some(owner) = &mapping.owner_id {
                println!("  Owner:   {owner}");
            }
        }
        Lookup::NotFound => println!("No mapping for {source}."),
    }
    Ok(())
}

async fn cmd_mapping_pending(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let supabase = supabase_client(&config)?;
    let store = open_mapping_store(&config, supabase.as_ref()).await?;

    let pending = store.pending().await?;
    if pending.is_empty() {
        println!("Nothing pending.");
        return Ok(());
    }
    for entry in &pending {
        println!("{}", entry.to_line());
    }
    println!("\n{} entr(ies) awaiting reconciliation", pending.len());
    Ok(())
}

async fn cmd_mapping_reconcile(config_path: &Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let supabase = supabase_client(&config)?;
    let store = open_mapping_store(&config, supabase.as_ref()).await?;

    let report = store.reconcile().await?;
    println!(
        "Replayed {} mapping(s); {} still pending.",
        report.replayed, report.remaining
    );
    Ok(())
}

async fn cmd_activity(config_path: &Option<PathBuf>, lines: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let supabase = supabase_client(&config)?;
    let activity = activity_log(&config, supabase.as_ref());

    let entries = activity.recent(lines).await?;
    if entries.is_empty() {
        println!("No activity recorded.");
        return Ok(());
    }

    for entry in entries {
        let level = serde_json::to_value(entry.level)?;
        println!(
            "{}  {:<7}  {}{}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            level.as_str().unwrap_or("-"),
            entry.message,
            entry
                .user_id
                .map(|u| format!("  [{u}]"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
