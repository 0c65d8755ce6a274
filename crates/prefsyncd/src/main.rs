// # prefsyncd - Preference Sync Daemon
//
// This daemon is a THIN integration layer only:
// - Do not add projection, diffing, or retry logic here
// - All sync logic lives in prefsync-core
// - Configuration is via environment variables only
//
// The prefsyncd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Wiring the Mailchimp client and preference store into the SyncEngine
// 4. Serving the HTTP trigger surface until SIGTERM/SIGINT
//
// ## Configuration
//
// ### Mailing List
// - `PREFSYNC_MAILCHIMP_API_KEY`: API key
// - `PREFSYNC_MAILCHIMP_SERVER_PREFIX`: Data-center prefix (e.g. us21)
// - `PREFSYNC_MAILCHIMP_LIST_ID`: Audience/list ID
//
// Missing mailing-list values do not stop the daemon; every sync reports a
// configuration error until they are set.
//
// ### Backfill
// - `PREFSYNC_BACKFILL_SECRET`: Shared secret for `/backfill`
//
// ### Preference Store
// - `PREFSYNC_STORE_TYPE`: Type of store (file, memory)
// - `PREFSYNC_STORE_PATH`: Path to the JSON file (for file store)
//
// ### Engine
// - `PREFSYNC_MAX_ATTEMPTS`: Attempts per external call (default 3)
// - `PREFSYNC_BACKOFF_BASE_MS`: First backoff delay (default 1000)
//
// ### Daemon
// - `PREFSYNC_LISTEN_ADDR`: HTTP listen address (default 127.0.0.1:8080)
// - `PREFSYNC_LOG_LEVEL`: trace, debug, info, warn, error
// - `PREFSYNC_MODE`: Set to `dry-run` to log Mailchimp requests instead of sending them
//
// ## Example
//
// ```bash
// export PREFSYNC_MAILCHIMP_API_KEY=...
// export PREFSYNC_MAILCHIMP_SERVER_PREFIX=us21
// export PREFSYNC_MAILCHIMP_LIST_ID=a1b2c3d4e5
// export PREFSYNC_BACKFILL_SECRET=...
// export PREFSYNC_STORE_TYPE=file
// export PREFSYNC_STORE_PATH=/var/lib/prefsync/preferences.json
//
// prefsyncd
// ```

mod http;

use anyhow::{Context, Result};
use prefsync_core::state::{FilePreferencesStore, MemoryPreferencesStore};
use prefsync_core::traits::PreferencesStore;
use prefsync_core::{MailingListConfig, SyncConfig, SyncEngine, SyncEvent};
use prefsync_provider_mailchimp::MailchimpClient;
use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Default HTTP listen address
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum PrefsyncExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<PrefsyncExitCode> for ExitCode {
    fn from(code: PrefsyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    api_key: Option<String>,
    server_prefix: Option<String>,
    list_id: Option<String>,
    backfill_secret: Option<String>,
    store_type: String,
    store_path: Option<String>,
    listen_addr: String,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    log_level: String,
    dry_run: bool,
}

/// Read an optional variable, treating an empty value as unset
fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Read an optional numeric variable; a malformed value is an error
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_opt(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("{} is not a valid number: '{}'", name, value))
        })
        .transpose()
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            api_key: env_opt("PREFSYNC_MAILCHIMP_API_KEY"),
            server_prefix: env_opt("PREFSYNC_MAILCHIMP_SERVER_PREFIX"),
            list_id: env_opt("PREFSYNC_MAILCHIMP_LIST_ID"),
            backfill_secret: env_opt("PREFSYNC_BACKFILL_SECRET"),
            store_type: env_opt("PREFSYNC_STORE_TYPE").unwrap_or_else(|| "file".to_string()),
            store_path: env_opt("PREFSYNC_STORE_PATH"),
            listen_addr: env_opt("PREFSYNC_LISTEN_ADDR")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            max_attempts: env_parse("PREFSYNC_MAX_ATTEMPTS")?,
            backoff_base_ms: env_parse("PREFSYNC_BACKOFF_BASE_MS")?,
            log_level: env_opt("PREFSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            dry_run: env_opt("PREFSYNC_MODE")
                .is_some_and(|mode| mode.eq_ignore_ascii_case("dry-run")),
        })
    }

    /// Validate the configuration
    ///
    /// Mailing-list values are not required here. Everything else must be
    /// well-formed:
    /// - Store type enumeration and file path
    /// - Listen address
    /// - Numeric ranges
    /// - Log level
    fn validate(&self) -> Result<()> {
        // Check for obvious placeholder keys (common mistake)
        if let Some(ref key) = self.api_key {
            let key_lower = key.to_lowercase();
            if key_lower.contains("your_key")
                || key_lower.contains("replace_me")
                || key_lower == "key"
            {
                anyhow::bail!(
                    "PREFSYNC_MAILCHIMP_API_KEY appears to be a placeholder. \
                    Use an actual API key from your Mailchimp account."
                );
            }
        }

        // Validate store type
        match self.store_type.as_str() {
            "file" | "memory" => {}
            _ => anyhow::bail!(
                "PREFSYNC_STORE_TYPE '{}' is not supported. \
                Supported types: file, memory",
                self.store_type
            ),
        }

        // Validate store path for file store
        if self.store_type == "file" {
            let Some(ref path) = self.store_path else {
                anyhow::bail!(
                    "PREFSYNC_STORE_PATH is required when PREFSYNC_STORE_TYPE=file. \
                    Set it via: export PREFSYNC_STORE_PATH=/var/lib/prefsync/preferences.json"
                );
            };

            if let Some(parent) = std::path::Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                anyhow::bail!(
                    "PREFSYNC_STORE_PATH parent directory does not exist: {}. \
                        Create it first: sudo mkdir -p {}",
                    parent.display(),
                    parent.display()
                );
            }
        }

        self.listen_addr.parse::<SocketAddr>().with_context(|| {
            format!(
                "PREFSYNC_LISTEN_ADDR must be an address like {}. Got: {}",
                DEFAULT_LISTEN_ADDR, self.listen_addr
            )
        })?;

        // Validate numeric ranges
        if let Some(max_attempts) = self.max_attempts
            && (max_attempts == 0 || max_attempts > 10)
        {
            anyhow::bail!(
                "PREFSYNC_MAX_ATTEMPTS must be between 1 and 10. Got: {}",
                max_attempts
            );
        }

        if let Some(backoff) = self.backoff_base_ms
            && (!(1..=60_000).contains(&backoff))
        {
            anyhow::bail!(
                "PREFSYNC_BACKOFF_BASE_MS must be between 1 and 60000. Got: {}",
                backoff
            );
        }

        // Validate log level
        parse_log_level(&self.log_level)?;

        Ok(())
    }

    /// Build the engine configuration
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new();
        config.mailing_list = MailingListConfig {
            api_key: self.api_key.clone(),
            server_prefix: self.server_prefix.clone(),
            list_id: self.list_id.clone(),
        };
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(backoff) = self.backoff_base_ms {
            config.retry.base_delay_ms = backoff;
        }
        config.backfill.secret = self.backfill_secret.clone();
        config
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "PREFSYNC_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return PrefsyncExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return PrefsyncExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = parse_log_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return PrefsyncExitCode::ConfigError.into();
    }

    info!("Starting prefsyncd daemon");

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return PrefsyncExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        let components = match build_components(&config).await {
            Ok(components) => components,
            Err(e) => {
                error!("Startup error: {:#}", e);
                return PrefsyncExitCode::ConfigError;
            }
        };

        if let Err(e) = run_daemon(components).await {
            error!("Daemon error: {:#}", e);
            PrefsyncExitCode::RuntimeError
        } else {
            PrefsyncExitCode::CleanShutdown
        }
    })
    .into()
}

/// Everything the daemon wires together at startup
struct Components {
    engine: Arc<SyncEngine>,
    store: Arc<dyn PreferencesStore>,
    events: mpsc::Receiver<SyncEvent>,
    listener: tokio::net::TcpListener,
    backfill_secret: Option<String>,
}

/// Create the store, client, engine and listener
async fn build_components(config: &Config) -> Result<Components> {
    let store: Arc<dyn PreferencesStore> = match config.store_type.as_str() {
        "memory" => {
            warn!("Using in-memory preference store; preferences are lost on restart");
            Arc::new(MemoryPreferencesStore::new())
        }
        _ => {
            let path = config
                .store_path
                .as_deref()
                .context("PREFSYNC_STORE_PATH is required for the file store")?;
            info!("Using file preference store at {}", path);
            Arc::new(FilePreferencesStore::new(path).await?)
        }
    };

    let client = MailchimpClient::new(config.dry_run)?;

    let sync_config = config.sync_config();
    let missing = sync_config.mailing_list.missing_values();
    if !missing.is_empty() {
        warn!(
            "Mailing-list configuration incomplete (missing: {}); syncs will fail until it is set",
            missing.join(", ")
        );
    }
    let backfill_secret = sync_config.backfill.secret().map(str::to_string);
    if backfill_secret.is_none() {
        warn!("PREFSYNC_BACKFILL_SECRET is not set; /backfill will answer 500");
    }

    let (engine, events) = SyncEngine::new(Arc::new(client), Arc::clone(&store), sync_config)?;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    Ok(Components {
        engine: Arc::new(engine),
        store,
        events,
        listener,
        backfill_secret,
    })
}

/// Run the daemon until a shutdown signal arrives
async fn run_daemon(components: Components) -> Result<()> {
    let Components {
        engine,
        store,
        events,
        listener,
        backfill_secret,
    } = components;

    tokio::spawn(log_events(events));

    let shutdown = shutdown_signal()?;
    let app = http::build_router(http::AppState::new(engine, backfill_secret));

    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let signal = shutdown.await;
            info!("Received shutdown signal: {}", signal);
        })
        .await
        .context("HTTP server failed")?;

    info!("Shutting down daemon");
    store.flush().await?;
    info!("Preference store flushed, daemon stopped");

    Ok(())
}

/// Log every engine event
async fn log_events(events: mpsc::Receiver<SyncEvent>) {
    let mut events = ReceiverStream::new(events);
    while let Some(event) = events.next().await {
        match event {
            SyncEvent::SyncFailed {
                user_id,
                stage,
                error,
            } => {
                warn!("Sync of {} failed at {}: {}", user_id, stage, error);
            }
            SyncEvent::ConfigurationMissing { user_id, message } => {
                warn!("Sync of {} skipped: {}", user_id, message);
            }
            SyncEvent::BackfillCompleted {
                users_scanned,
                records_created,
            } => {
                info!(
                    "Backfill completed: {} users scanned, {} records created",
                    users_scanned, records_created
                );
            }
            other => debug!("Engine event: {:?}", other),
        }
    }
}

/// Install SIGTERM/SIGINT handlers and return a future resolving to the signal name
#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = &'static str>> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    })
}

/// Install a CTRL-C handler
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl std::future::Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for CTRL-C: {}", e);
        }
        "SIGINT"
    })
}
