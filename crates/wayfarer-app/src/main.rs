//! Wayfarer - intercepting proxy for game services.
//!
//! Loads `mitm.yaml`, stands up the MITM proxy, and streams pipeline events
//! to the log. A schema-outdated or unreadable config downgrades to a bare
//! pass-through proxy instead of failing startup; only CA material problems
//! are fatal.

mod cleanup;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wayfarer_core::{Config, EventBus, ProxyEvent, TrafficDisplay};
use wayfarer_proxy::{
    CaManager, ProxyConfig, ProxyServer, RouteTable, SmartCache, DEFAULT_PROXY_PORT,
};

use crate::cleanup::CleanupStack;

/// Wayfarer - TLS-intercepting rewrite proxy for game services
#[derive(Parser, Debug)]
#[command(name = "wayfarer", version, about)]
struct Args {
    /// Path to the rules config
    #[arg(long, default_value = "mitm.yaml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Suppress all traffic events regardless of config
    #[arg(long)]
    silent: bool,

    /// Wipe the smart cache before starting
    #[arg(long)]
    flush_cache: bool,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "wayfarer", "Wayfarer").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with daily file rotation plus stdout.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wayfarer={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("wayfarer")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
                return Some(guard);
            }
        }
    }

    // Fall back to stdout only.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();
    None
}

/// Loads the config, degrading to defaults on any failure. Handler
/// registration failures (schema mismatch included) must not stop the bare
/// proxy from serving unmodified traffic.
fn load_config(path: &PathBuf, events: &EventBus) -> Config {
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("could not load {:?}: {}", path, e);
            events.emit(ProxyEvent::status(format!(
                "config unreadable, starting without custom rules: {}",
                e
            )));
            Config::default()
        }
    }
}

/// Builds the route table, downgrading to zero handlers on a schema
/// mismatch.
fn build_routes(config: &Config, events: &EventBus) -> RouteTable {
    match RouteTable::from_config(config) {
        Ok(routes) => {
            let (requests, responses) = routes.handler_counts();
            events.emit(ProxyEvent::status(format!(
                "registered {} request and {} response handler(s)",
                requests, responses
            )));
            routes
        }
        Err(e) => {
            tracing::warn!("handler registration rejected: {}", e);
            events.emit(ProxyEvent::status(format!(
                "custom handlers disabled: {}",
                e
            )));
            RouteTable::empty()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&args);

    let events = EventBus::new();

    // Log consumer for the event stream; attached before the first status
    // message so startup diagnostics are not lost. UI consumers subscribe
    // the same way.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    tracing::info!(target: "wayfarer::events", "{}", event.to_json());
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("event consumer lagged, {} event(s) dropped", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let config = load_config(&args.config, &events);
    let routes = build_routes(&config, &events);

    let cache = if config.options.smart_cache.enabled {
        let cache = SmartCache::with_default_dir(&config.options.smart_cache)
            .context("failed to set up smart cache")?;
        if args.flush_cache {
            cache.flush().context("failed to flush smart cache")?;
            tracing::info!("smart cache flushed");
        }
        Some(Arc::new(cache))
    } else {
        None
    };

    let traffic_display = if args.silent {
        TrafficDisplay::Silent
    } else {
        config.options.traffic_display
    };

    let ca_manager = CaManager::with_default_dir().context("failed to set up CA directory")?;
    let mut proxy_config = ProxyConfig::new(ca_manager)
        .with_port(args.port)
        .with_routes(routes)
        .with_events(events.clone())
        .with_traffic_display(traffic_display);
    if let Some(cache) = cache {
        proxy_config = proxy_config.with_cache(cache);
    }

    // CA failures here are the only fatal startup condition past this
    // point.
    let server = ProxyServer::new(proxy_config).context("failed to start proxy server")?;
    tracing::info!(
        "install the root certificate from {:?} to intercept TLS",
        server.ca_cert_path()
    );

    let mut cleanups = CleanupStack::new();
    {
        let events = events.clone();
        cleanups.register(move || {
            events.emit(ProxyEvent::status("proxy shutting down"));
            tracing::info!("cleanup complete");
        });
    }

    let handle = server.start()?;
    events.emit(ProxyEvent::status(format!("proxy listening on {}", handle.addr())));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("termination signal received");

    // Best-effort synchronous cleanup; in-flight requests are not drained.
    cleanups.run();
    handle.stop().await;

    Ok(())
}
