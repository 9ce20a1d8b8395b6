//! # Sentinel — MT5 Trade-State Alerting Backend
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────┐  GET /account /positions    ┌────────────────────────────┐
//!  │  MetaTrader  │ ◀─────────────────────────── │  Poll Scheduler            │
//!  │  5 bridge    │  GET /orders /tick/{sym}     │   differ · levels · risk   │
//!  └──────────────┘                              │   suggestions · policy     │
//!         ▲                                      └─────────────┬──────────────┘
//!         │ POST /position/*                                   │ Dispatcher
//!  ┌──────┴───────┐  /api/commands/*   ┌──────────┐            ▼
//!  │  Axum routes │ ◀───────────────── │  Client  │   Telegram · Discord · Webhook · SMTP
//!  │  (API key)   │  /api/levels       └──────────┘
//!  └──────────────┘
//! ```
//!
//! The engine state sits behind one mutex shared by the scheduler and the
//! command handlers.  Ctrl-C / SIGTERM stops the HTTP server, lets the
//! current poll cycle finish and writes the state file one last time.
//! SIGHUP re-reads the price-levels file.
//!
//! ## Environment Variables
//!
//! | Variable             | Default                 | Description                    |
//! |----------------------|-------------------------|--------------------------------|
//! | `BIND_ADDR`          | `0.0.0.0:3000`          | Address Axum listens on        |
//! | `MT5_BASE_URL`       | `http://localhost:8081` | MT5 bridge base URL, or `mock` |
//! | `POLL_INTERVAL_SECS` | `5`                     | Seconds between polls          |
//! | `PRICE_LEVELS_FILE`  | `price_levels.json`     | Price-level definitions        |
//! | `STATE_FILE`         | `sentinel_state.json`   | Persisted engine state         |
//! | `SMTP_HOST`          | unset                   | Enables the e-mail channel     |
//! | `RUST_LOG`           | `sentinel=debug`        | Tracing filter                 |
//!
//! See `config.rs` for the full list.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod advisor;
mod auth;
mod config;
mod engine;
mod error;
mod models;
mod notify;
mod routes;
mod scheduler;
mod source;
mod state;
mod store;

use advisor::{HttpAdvisor, ProfitAdvisor};
use config::{ChannelConfig, Config};
use engine::{shared, EngineState, SharedEngine};
use notify::email::EmailNotifier;
use notify::telegram::TelegramNotifier;
use notify::webhook::WebhookNotifier;
use notify::{Dispatcher, Notifier};
use scheduler::Scheduler;
use source::mt5::Mt5Bridge;
use state::build_state;
use store::{LevelStore, StateStore};

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env (optional, prod can use real env vars) ──────────────────
    dotenvy::dotenv().ok();

    // ── 2. Initialise structured logging ─────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("sentinel=debug".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║        SENTINEL — MT5 Trade Alerts            ║
  ║        Rust + Axum  ·  Diff · Levels · Policy ║
  ╚═══════════════════════════════════════════════╝"#
    );

    // ── 3. Configuration ─────────────────────────────────────────────────────
    let config = Config::from_env().context("invalid configuration")?;
    let http_client = reqwest::Client::new();

    // ── 4. Collaborators ─────────────────────────────────────────────────────
    let source = Arc::new(Mt5Bridge::new(
        http_client.clone(),
        config.mt5_base_url.clone(),
        config.scheduler.fetch_timeout,
        config.command_timeout,
    ));
    let notifiers = build_notifiers(&config.channels, &http_client).context("notification channels")?;
    info!(channels = ?notifiers.iter().map(|n| n.name()).collect::<Vec<_>>(), "📣 Notification channels ready");
    let dispatcher = Arc::new(Dispatcher::new(notifiers, config.dispatch.clone()));

    let advisor: Option<Arc<dyn ProfitAdvisor>> = config.advisor_url.as_ref().map(|url| {
        info!(url = %url, "🧠 Profit advisor enabled");
        Arc::new(HttpAdvisor::new(http_client.clone(), url.clone())) as Arc<dyn ProfitAdvisor>
    });

    // ── 5. Engine state (levels file + persisted state) ──────────────────────
    let mut levels = LevelStore::new(config.levels_file.clone());
    if let Err(e) = levels.reload() {
        error!(error = %e, "❌ Levels file unreadable — starting with no price levels");
    }
    let state_store = StateStore::new(config.state_file.clone());
    let saved = state_store.load_or_default();
    let engine = shared(EngineState::restore(config.engine.clone(), levels, saved));

    let state = build_state(
        engine.clone(),
        state_store.clone(),
        source.clone(),
        dispatcher.clone(),
        config.command_timeout,
        config.api_key.clone(),
    );

    // ── 6. Poll scheduler ────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        source,
        engine.clone(),
        dispatcher,
        state_store,
        advisor,
        state.status.clone(),
        config.scheduler.clone(),
    )
    .spawn(shutdown_rx.clone());

    spawn_level_reloader(engine, shutdown_rx);

    // ── 7. HTTP surface ──────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = config.bind_addr.parse().context("BIND_ADDR")?;
    if config.api_key.is_none() {
        warn!("API_KEY not set — command surface is open (dev mode)");
    }
    info!(?addr, "🚀 Sentinel server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 8. Drain ─────────────────────────────────────────────────────────────
    info!("Server stopped — waiting for the poll loop to finish its cycle");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        error!(error = %e, "Poll scheduler task failed");
    }

    info!("Shutdown complete");
    Ok(())
}

fn build_notifiers(channels: &ChannelConfig, client: &reqwest::Client) -> anyhow::Result<Vec<Arc<dyn Notifier>>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if let Some((token, chat_id)) = &channels.telegram {
        notifiers.push(Arc::new(TelegramNotifier::new(client.clone(), token.clone(), chat_id.clone())));
    }
    if let Some(url) = &channels.discord_webhook {
        notifiers.push(Arc::new(WebhookNotifier::discord(client.clone(), url.clone())));
    }
    if let Some(url) = &channels.webhook {
        notifiers.push(Arc::new(WebhookNotifier::json(client.clone(), url.clone())));
    }
    if let Some(email) = &channels.email {
        notifiers.push(Arc::new(EmailNotifier::new(email)?));
    }
    Ok(notifiers)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// SIGHUP → re-read the levels file immediately.
#[cfg(unix)]
fn spawn_level_reloader(engine: SharedEngine, mut shutdown: watch::Receiver<bool>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP — reloading price levels");
                    if let Err(e) = engine.lock().await.levels.reload() {
                        warn!(error = %e, "Levels reload failed — keeping current levels");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_level_reloader(_engine: SharedEngine, _shutdown: watch::Receiver<bool>) {}
